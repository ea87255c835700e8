//! Distributed store client contract
//!
//! The coordinator only needs four operations from the store: read a key,
//! atomically create a TTL-bounded lock, create a key only if it is absent,
//! and delete a key. Linearizability of the lock and of create-if-absent is
//! the store's job; the coordinator relies on it for at-most-one-writer.
//!
//! Two backends are provided:
//! - [`MemoryStore`] - process-local, for tests and single-host development
//! - [`KubeStore`] - Secret for values, coordination Lease for locks

mod kube_store;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

pub use self::kube_store::KubeStore;
pub use self::memory::MemoryStore;

/// Errors returned by a [`Store`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The key does not exist (expected absence, drives the election)
    #[error("key not found: {0}")]
    KeyMissing(String),

    /// A create-if-absent write found the key already present
    #[error("key already exists: {0}")]
    KeyExists(String),

    /// Any other failure talking to the store
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Key-value store with a TTL lock primitive
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a value; `KeyMissing` if absent
    async fn get(&self, key: &str) -> Result<String, StoreError>;

    /// Create a lock record with `ttl` if none is live
    ///
    /// Returns `true` only if this call created the lock.
    async fn get_or_create_lock(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Write `value` only if `key` does not exist; `KeyExists` otherwise
    async fn put_if_absent(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a key (lock or value). Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
