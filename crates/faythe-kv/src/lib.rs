//! faythe-kv — retrying client over the shared etcd v3 keyspace.
//!
//! Every subsystem talks to the keyspace through [`KvClient`], which
//! wraps a backend with request deadlines, a bounded retry policy for
//! transient failures, and a capacity-1 fatal error channel consumed by
//! the process supervisor.
//!
//! Two backends exist: [`etcd::EtcdBackend`] for real deployments and
//! [`memory::MemoryBackend`], a behaviorally-equivalent in-process store
//! (prefix scans, watches, TTL leases, create-if-absent transactions)
//! used by tests and standalone mode.

pub mod client;
pub mod error;
pub mod etcd;
pub mod event;
pub mod memory;

pub use client::{KvClient, KvConfig};
pub use error::{KvError, KvResult};
pub use event::{EventKind, WatchEvent, WatchStream};

use async_trait::async_trait;

/// etcd lease identifier.
pub type LeaseId = i64;

/// A key with its stored bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Result of a range read.
#[derive(Debug, Clone, Default)]
pub struct GetResult {
    /// Matching entries, sorted by key. Empty for count-only reads.
    pub kvs: Vec<KeyValue>,
    /// Number of keys matched.
    pub count: i64,
}

/// Storage operations a backend must provide.
///
/// Implementations are safe for concurrent use; the client clones freely.
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    /// Read a key, or a prefix range sorted ascending by key.
    async fn get(&self, key: &str, prefix: bool, count_only: bool) -> KvResult<GetResult>;

    /// Write a key, optionally bound to a lease.
    async fn put(&self, key: &str, value: &[u8], lease: Option<LeaseId>) -> KvResult<()>;

    /// Write a key only if it does not exist. Returns whether the write won.
    async fn put_if_absent(&self, key: &str, value: &[u8]) -> KvResult<bool>;

    /// Delete a key or prefix range. Returns the number of keys removed.
    async fn delete(&self, key: &str, prefix: bool) -> KvResult<u64>;

    /// Create a lease with the given TTL in seconds.
    async fn grant(&self, ttl_secs: i64) -> KvResult<LeaseId>;

    /// Renew a lease once, pushing its expiry out by the granted TTL.
    async fn keep_alive_once(&self, lease: LeaseId) -> KvResult<()>;

    /// Revoke a lease, deleting every key bound to it.
    async fn revoke(&self, lease: LeaseId) -> KvResult<()>;

    /// Open a prefix watch delivering events in revision order per key.
    async fn watch(&self, prefix: &str) -> KvResult<WatchStream>;
}
