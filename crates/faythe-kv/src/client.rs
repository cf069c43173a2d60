//! The retrying client every subsystem goes through.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{KvError, KvResult};
use crate::event::WatchStream;
use crate::{GetResult, KvBackend, KeyValue, LeaseId};

/// Attempts beyond the first for retryable failures.
pub const DEFAULT_RETRY_COUNT: u32 = 3;
/// Gap between retry attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Deadline for unary KV requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for lease requests.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// Tunables for the retry and deadline policy.
#[derive(Debug, Clone)]
pub struct KvConfig {
    pub retry_count: u32,
    pub retry_interval: Duration,
    pub request_timeout: Duration,
    pub lease_timeout: Duration,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }
}

impl KvConfig {
    /// Millisecond-scale policy for tests.
    pub fn fast() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            retry_interval: Duration::from_millis(10),
            request_timeout: Duration::from_millis(500),
            lease_timeout: Duration::from_millis(500),
        }
    }
}

/// Retrying, deadline-bounded facade over a [`KvBackend`].
///
/// Cheap to clone; all clones share the backend and the fatal error
/// channel.
#[derive(Clone)]
pub struct KvClient {
    backend: Arc<dyn KvBackend>,
    cfg: KvConfig,
    err_tx: mpsc::Sender<KvError>,
}

impl KvClient {
    /// Wrap a backend. Returns the client and the fatal error receiver
    /// the supervisor must drain.
    pub fn new(backend: Arc<dyn KvBackend>, cfg: KvConfig) -> (Self, mpsc::Receiver<KvError>) {
        let (err_tx, err_rx) = mpsc::channel(1);
        (
            Self {
                backend,
                cfg,
                err_tx,
            },
            err_rx,
        )
    }

    /// Read a single key.
    pub async fn do_get(&self, key: &str) -> KvResult<GetResult> {
        let key = key.to_string();
        self.with_retry("get", self.cfg.request_timeout, || {
            let backend = self.backend.clone();
            let key = key.clone();
            async move { backend.get(&key, false, false).await }
        })
        .await
    }

    /// Read a prefix range, sorted ascending by key.
    pub async fn do_get_prefix(&self, prefix: &str) -> KvResult<Vec<KeyValue>> {
        let prefix = prefix.to_string();
        let result = self
            .with_retry("get-prefix", self.cfg.request_timeout, || {
                let backend = self.backend.clone();
                let prefix = prefix.clone();
                async move { backend.get(&prefix, true, false).await }
            })
            .await?;
        Ok(result.kvs)
    }

    /// Write a key.
    pub async fn do_put(&self, key: &str, value: &str) -> KvResult<()> {
        self.do_put_with_lease(key, value, None).await
    }

    /// Write a key bound to a lease (or none).
    pub async fn do_put_with_lease(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> KvResult<()> {
        let key = key.to_string();
        let value = value.as_bytes().to_vec();
        self.with_retry("put", self.cfg.request_timeout, || {
            let backend = self.backend.clone();
            let key = key.clone();
            let value = value.clone();
            async move { backend.put(&key, &value, lease).await }
        })
        .await
    }

    /// Write a key only if absent. Returns whether the write won.
    pub async fn put_if_absent(&self, key: &str, value: &str) -> KvResult<bool> {
        let key = key.to_string();
        let value = value.as_bytes().to_vec();
        self.with_retry("put-if-absent", self.cfg.request_timeout, || {
            let backend = self.backend.clone();
            let key = key.clone();
            let value = value.clone();
            async move { backend.put_if_absent(&key, &value).await }
        })
        .await
    }

    /// Delete a key (or prefix range). Returns the number removed.
    pub async fn do_delete(&self, key: &str, prefix: bool) -> KvResult<u64> {
        let key = key.to_string();
        self.with_retry("delete", self.cfg.request_timeout, || {
            let backend = self.backend.clone();
            let key = key.clone();
            async move { backend.delete(&key, prefix).await }
        })
        .await
    }

    /// Create a lease with the given TTL in seconds.
    pub async fn do_grant(&self, ttl_secs: i64) -> KvResult<LeaseId> {
        self.with_retry("grant", self.cfg.lease_timeout, || {
            let backend = self.backend.clone();
            async move { backend.grant(ttl_secs).await }
        })
        .await
    }

    /// Renew a lease once.
    ///
    /// Unlike the other operations, a final failure is returned without
    /// touching the fatal error channel: the membership loop tolerates a
    /// bounded number of missed renewals before it self-evicts.
    pub async fn do_keep_alive_once(&self, lease: LeaseId) -> KvResult<()> {
        self.retry_loop("keep-alive-once", self.cfg.lease_timeout, false, || {
            let backend = self.backend.clone();
            async move { backend.keep_alive_once(lease).await }
        })
        .await
    }

    /// Revoke a lease, deleting its keys.
    pub async fn do_revoke(&self, lease: LeaseId) -> KvResult<()> {
        self.with_retry("revoke", self.cfg.lease_timeout, || {
            let backend = self.backend.clone();
            async move { backend.revoke(lease).await }
        })
        .await
    }

    /// Whether exactly one key exists at `key`.
    pub async fn check_key(&self, key: &str) -> bool {
        let key_owned = key.to_string();
        let result = self
            .with_retry("check-key", self.cfg.request_timeout, || {
                let backend = self.backend.clone();
                let key = key_owned.clone();
                async move { backend.get(&key, false, true).await }
            })
            .await;
        matches!(result, Ok(r) if r.count == 1)
    }

    /// Open a prefix watch. Not retried here; watch loops own their
    /// rebuild policy.
    pub async fn watch(&self, prefix: &str) -> KvResult<WatchStream> {
        self.backend.watch(prefix).await
    }

    /// Push a fatal error onto the supervisor channel on behalf of a
    /// collaborator (e.g. a watch loop out of rebuild budget).
    pub fn report_error(&self, err: KvError) {
        if self.err_tx.try_send(err).is_err() {
            debug!("fatal error channel already signaled");
        }
    }

    /// The configured retry policy.
    pub fn config(&self) -> &KvConfig {
        &self.cfg
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, deadline: Duration, f: F) -> KvResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = KvResult<T>>,
    {
        self.retry_loop(op, deadline, true, f).await
    }

    async fn retry_loop<T, F, Fut>(
        &self,
        op: &'static str,
        deadline: Duration,
        report: bool,
        f: F,
    ) -> KvResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = KvResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(deadline, f()).await {
                Ok(r) => r,
                Err(_) => Err(KvError::Timeout(format!("{op} deadline exceeded"))),
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt <= self.cfg.retry_count => {
                    debug!(op, error = %e, attempt, "retrying kv operation");
                    faythe_exporter::report_kv_retry(op);
                    tokio::time::sleep(self.cfg.retry_interval).await;
                }
                Err(e) => {
                    warn!(op, error = %e, attempt, "kv operation failed");
                    if report {
                        self.report_error(e.clone());
                    }
                    return Err(e);
                }
            }
        }
    }
}
