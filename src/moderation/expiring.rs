//! Sets whose entries may lapse at a fixed instant

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::hash::Hash;

/// Lookup result for an [`ExpiringSet`] entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Absent,
    Live,
    Expired,
}

/// Keys with an optional expiry. An entry is live strictly before its expiry.
#[derive(Debug, Clone)]
pub struct ExpiringSet<K> {
    entries: HashMap<K, Option<DateTime<Utc>>>,
}

impl<K> Default for ExpiringSet<K> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> ExpiringSet<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh an entry; `None` never expires
    pub fn insert(&mut self, key: K, expires: Option<DateTime<Utc>>) {
        self.entries.insert(key, expires);
    }

    pub fn remove(&mut self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn status(&self, key: &K, now: DateTime<Utc>) -> EntryStatus {
        match self.entries.get(key) {
            None => EntryStatus::Absent,
            Some(None) => EntryStatus::Live,
            Some(Some(expires)) if now < *expires => EntryStatus::Live,
            Some(Some(_)) => EntryStatus::Expired,
        }
    }

    pub fn contains(&self, key: &K, now: DateTime<Utc>) -> bool {
        self.status(key, now) == EntryStatus::Live
    }

    pub fn expiry(&self, key: &K) -> Option<Option<DateTime<Utc>>> {
        self.entries.get(key).copied()
    }

    /// Keys whose expiry has passed. They stay in the set until removed.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<K> {
        self.entries
            .iter()
            .filter(|(_, expires)| matches!(expires, Some(at) if now >= *at))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Expired keys along with the expiry they had when listed
    pub fn expired_entries(&self, now: DateTime<Utc>) -> Vec<(K, DateTime<Utc>)> {
        self.entries
            .iter()
            .filter_map(|(key, expires)| match expires {
                Some(at) if now >= *at => Some((key.clone(), *at)),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
