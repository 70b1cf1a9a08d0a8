//! Message headers
//!
//! A case-sensitive multimap. Keys under the `$memphis` prefix are reserved for
//! the client itself: the public builder refuses them and application reads
//! never see them.

use std::collections::BTreeMap;

use crate::error::{MemphisError, Result};

/// Prefix of every internal control header
pub const RESERVED_PREFIX: &str = "$memphis";

pub(crate) const CONNECTION_ID: &str = "$memphis_connectionId";
pub(crate) const PRODUCED_BY: &str = "$memphis_producedBy";
pub(crate) const PM_ID: &str = "$memphis_pm_id";
pub(crate) const PM_SEQUENCE: &str = "$memphis_pm_sequence";
pub(crate) const MSG_ID: &str = "msg-id";

/// Ordered header multimap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from key/value pairs, rejecting reserved keys
    pub fn from_pairs<K, V, I>(pairs: I) -> Result<Self>
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut headers = Self::new();
        for (key, value) in pairs {
            headers.add(key, value)?;
        }
        Ok(headers)
    }

    /// Append a header. Keys starting with `$memphis` are rejected.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        if key.starts_with(RESERVED_PREFIX) {
            return Err(MemphisError::ReservedHeader);
        }
        self.entries.push((key, value.into()));
        Ok(())
    }

    /// Replace every value for `key`; internal use only
    pub(crate) fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.retain(|(k, _)| k != key);
        self.entries.push((key.to_string(), value.into()));
    }

    /// Append without the reserved-prefix check; used for broker deliveries
    pub(crate) fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `key`, in insertion order
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value per key, including internal keys
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for (key, value) in &self.entries {
            map.entry(key.clone()).or_insert_with(|| value.clone());
        }
        map
    }

    /// First value per key with internal keys filtered out
    pub fn application_view(&self) -> BTreeMap<String, String> {
        let mut map = self.to_map();
        map.retain(|key, _| !key.starts_with(RESERVED_PREFIX));
        map
    }
}
