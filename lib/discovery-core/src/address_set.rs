//! Address set maintained by a resolver for one service

use crate::{codec, DiscoveryError, InstanceRecord, Result};
use discovery_store::{EventKind, KeyValue, WatchEvent};
use std::collections::BTreeMap;
use tracing::debug;

/// AddressSet maps registration keys under one service prefix to their records
#[derive(Clone, Debug, Default)]
pub struct AddressSet {
    prefix: String,
    entries: BTreeMap<String, InstanceRecord>,
}

impl AddressSet {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Build a set from a bulk read. Entries that fail to decode are skipped and returned.
    pub fn from_kvs(
        prefix: impl Into<String>,
        kvs: &[KeyValue],
    ) -> (Self, Vec<(String, DiscoveryError)>) {
        let prefix = prefix.into();
        let mut entries = BTreeMap::new();
        let mut failures = Vec::new();
        for kv in kvs.iter().filter(|kv| kv.key.starts_with(&prefix)) {
            match codec::decode(&kv.value) {
                Ok(record) => {
                    entries.insert(kv.key.clone(), record);
                }
                Err(e) => failures.push((kv.key.clone(), e)),
            }
        }
        (Self { prefix, entries }, failures)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Apply one watch event.
    ///
    /// A put whose value fails to decode drops any entry previously held for
    /// that key, since the store no longer holds that record, and returns the
    /// decode error. Keys outside the prefix are ignored.
    pub fn apply(&mut self, event: &WatchEvent) -> Result<()> {
        if !event.key.starts_with(&self.prefix) {
            return Ok(());
        }
        match event.kind {
            EventKind::Put => match codec::decode(&event.value) {
                Ok(record) => {
                    debug!(key = %event.key, addr = %record.addr, "Instance added");
                    self.entries.insert(event.key.clone(), record);
                    Ok(())
                }
                Err(e) => {
                    self.entries.remove(&event.key);
                    Err(e)
                }
            },
            EventKind::Delete => {
                if self.entries.remove(&event.key).is_some() {
                    debug!(key = %event.key, "Instance removed");
                }
                Ok(())
            }
        }
    }

    /// Sorted, de-duplicated addresses of every live instance
    pub fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.entries.values().map(|r| r.addr.clone()).collect();
        addrs.sort();
        addrs.dedup();
        addrs
    }

    pub fn get(&self, key: &str) -> Option<&InstanceRecord> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
