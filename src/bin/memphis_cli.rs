//! Memphis CLI
//!
//! Produce and consume station messages, and manage schema attachments.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use memphis_schemaverse::{
    Client, ClientConfig, ConsumerEvent, ConsumerOptions, Headers, Payload, ProduceOptions,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "memphis-cli")]
#[command(about = "Produce, consume and manage schemas on Memphis stations")]
struct Cli {
    /// Config file (defaults to memphis.toml lookup)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and publish one message
    Produce {
        #[arg(short, long)]
        station: String,
        #[arg(short, long, default_value = "memphis-cli")]
        producer: String,
        /// Inline message text (sent as bytes)
        #[arg(short, long, conflicts_with = "file")]
        message: Option<String>,
        /// Read the message from a file
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Header as key=value; repeatable
        #[arg(long = "header", value_name = "KEY=VALUE")]
        headers: Vec<String>,
        /// Deduplication id
        #[arg(long)]
        msg_id: Option<String>,
    },

    /// Consume messages and print them
    Consume {
        #[arg(short, long)]
        station: String,
        #[arg(short = 'n', long, default_value = "memphis-cli")]
        consumer: String,
        #[arg(short, long)]
        group: Option<String>,
        /// Stop after this many messages
        #[arg(long, default_value_t = 10)]
        count: usize,
    },

    /// Attach a schema to a station
    AttachSchema {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        station: String,
    },

    /// Detach the schema from a station
    DetachSchema {
        #[arg(short, long)]
        station: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ClientConfig::load_from(cli.config.as_deref().and_then(|p| p.to_str()))
        .context("loading configuration")?;
    let client = Client::connect(config.connection.clone())
        .await
        .context("connecting to broker")?;

    let outcome = dispatch(&client, &config, cli.command).await;
    client.close().await?;
    outcome
}

async fn dispatch(client: &Client, config: &ClientConfig, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Produce { station, producer, message, file, headers, msg_id } => {
            let payload: Payload = match (message, file) {
                (Some(text), _) => text.into_bytes().into(),
                (None, Some(path)) => std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?
                    .into(),
                (None, None) => bail!("either --message or --file is required"),
            };

            let mut header_set = Headers::new();
            for pair in &headers {
                let Some((key, value)) = pair.split_once('=') else {
                    bail!("header '{}' is not KEY=VALUE", pair);
                };
                header_set.add(key, value)?;
            }

            let mut options = ProduceOptions::default()
                .ack_wait(config.producer.ack_wait())
                .async_produce(config.producer.async_produce);
            if let Some(id) = msg_id {
                options = options.msg_id(id);
            }

            let producer = client.producer(&station, &producer, true).await?;
            let result = producer
                .produce(payload, (!header_set.is_empty()).then_some(header_set), options)
                .await;
            producer.destroy().await?;
            result?;
            println!("✅ Message produced to {}", station);
            Ok(())
        }

        Commands::Consume { station, consumer, group, count } => {
            let mut options = ConsumerOptions::from_defaults(&station, &consumer, &config.consumer)
                .gen_unique_suffix(group.is_none());
            if let Some(group) = group {
                options = options.consumer_group(group);
            }

            let consumer = client.consumer(options).await?;
            let mut events = consumer.consume()?;
            let mut received = 0;

            while received < count {
                let Some(event) = tokio::time::timeout(Duration::from_secs(30), events.recv())
                    .await
                    .ok()
                    .flatten()
                else {
                    println!("⏱  No more messages");
                    break;
                };
                match event {
                    ConsumerEvent::Message { message, .. } => {
                        received += 1;
                        let origin = if message.is_dead_letter() { " (dead letter)" } else { "" };
                        println!(
                            "#{}{}: {}",
                            message.sequence_number(),
                            origin,
                            String::from_utf8_lossy(message.data())
                        );
                        for (key, value) in message.headers() {
                            println!("   {}: {}", key, value);
                        }
                        message.ack().await?;
                    }
                    ConsumerEvent::Error(e) => eprintln!("⚠️  {}", e),
                }
            }

            consumer.destroy().await?;
            println!("✅ Consumed {} message(s)", received);
            Ok(())
        }

        Commands::AttachSchema { name, station } => {
            client.attach_schema(&name, &station).await?;
            println!("✅ Schema {} attached to {}", name, station);
            Ok(())
        }

        Commands::DetachSchema { station } => {
            client.detach_schema(&station).await?;
            println!("✅ Schema detached from {}", station);
            Ok(())
        }
    }
}
