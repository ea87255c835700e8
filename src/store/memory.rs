//! In-process store
//!
//! Records live in a `DashMap`; the per-key entry lock makes lock creation and
//! create-if-absent atomic. Expiry uses `tokio::time::Instant` so tests with a
//! paused clock can move past a lock's TTL.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::{Store, StoreError};

#[derive(Debug, Clone)]
struct Record {
    value: String,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Store backed by a concurrent map
///
/// Share one instance between simulated nodes with `Arc<MemoryStore>`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, Record>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live record exists under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.records
            .get(key)
            .is_some_and(|r| !r.is_expired(Instant::now()))
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.records.iter().filter(|r| !r.is_expired(now)).count()
    }

    /// Check if the store holds no live records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<String, StoreError> {
        let now = Instant::now();
        match self.records.entry(key.to_string()) {
            Entry::Occupied(e) if e.get().is_expired(now) => {
                e.remove();
                Err(StoreError::KeyMissing(key.to_string()))
            }
            Entry::Occupied(e) => Ok(e.get().value.clone()),
            Entry::Vacant(_) => Err(StoreError::KeyMissing(key.to_string())),
        }
    }

    async fn get_or_create_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let lock = Record {
            value: "locked".to_string(),
            expires_at: Some(now + ttl),
        };

        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().is_expired(now) {
                    debug!(key, "Replacing expired lock");
                    e.insert(lock);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(e) => {
                e.insert(lock);
                Ok(true)
            }
        }
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let now = Instant::now();
        let record = Record {
            value: value.to_string(),
            expires_at: None,
        };

        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().is_expired(now) {
                    e.insert(record);
                    Ok(())
                } else {
                    Err(StoreError::KeyExists(key.to_string()))
                }
            }
            Entry::Vacant(e) => {
                e.insert(record);
                Ok(())
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.records.remove(key);
        Ok(())
    }
}
