//! In-process backend with etcd-shaped semantics.
//!
//! Backs tests and standalone (single-node) deployments: prefix range
//! scans over a sorted keyspace, prefix watches, TTL leases expired by a
//! background sweeper, and create-if-absent transactions. A small
//! failure-injection hook lets tests exercise the client's retry policy.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{KvError, KvResult};
use crate::event::{EventKind, WatchEvent, WatchItem, WatchStream};
use crate::{GetResult, KvBackend, KeyValue, LeaseId};

/// How often the sweeper checks for expired leases.
const SWEEP_INTERVAL: Duration = Duration::from_millis(25);

struct StoredValue {
    value: Vec<u8>,
    lease: Option<LeaseId>,
    version: u64,
}

struct LeaseRecord {
    ttl: Duration,
    expires_at: Instant,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchItem>,
}

#[derive(Default)]
struct Inner {
    kvs: BTreeMap<String, StoredValue>,
    leases: HashMap<LeaseId, LeaseRecord>,
    next_lease: LeaseId,
    watchers: Vec<Watcher>,
}

/// In-memory [`KvBackend`]. Clone-free: share via `Arc`.
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
    fail_puts: AtomicU32,
    put_attempts: AtomicU32,
}

impl MemoryBackend {
    /// Create a backend and start its lease-expiry sweeper.
    ///
    /// Must be called within a tokio runtime.
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(Inner::default()));
        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                sweep_expired(&inner);
            }
        });
        Self {
            inner,
            fail_puts: AtomicU32::new(0),
            put_attempts: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` put attempts with a retryable timeout.
    pub fn fail_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    /// Total put attempts observed, including injected failures.
    pub fn put_attempts(&self) -> u32 {
        self.put_attempts.load(Ordering::SeqCst)
    }

    /// Snapshot of every key under a prefix (test convenience).
    pub fn dump_prefix(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn sweep_expired(inner: &Mutex<Inner>) {
    let now = Instant::now();
    let mut events = Vec::new();
    {
        let mut inner = inner.lock().unwrap();
        let expired: Vec<LeaseId> = inner
            .leases
            .iter()
            .filter(|(_, rec)| rec.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }
        for id in &expired {
            inner.leases.remove(id);
        }
        let doomed: Vec<String> = inner
            .kvs
            .iter()
            .filter(|(_, v)| v.lease.map(|l| expired.contains(&l)).unwrap_or(false))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            inner.kvs.remove(&key);
            events.push(WatchEvent {
                kind: EventKind::Delete,
                key,
                value: Vec::new(),
            });
        }
        fan_out(&mut inner, &events);
    }
}

/// Deliver events to watchers with a matching prefix, dropping dead ones.
fn fan_out(inner: &mut Inner, events: &[WatchEvent]) {
    inner.watchers.retain(|w| {
        for ev in events {
            if ev.key.starts_with(&w.prefix) && w.tx.send(Ok(ev.clone())).is_err() {
                return false;
            }
        }
        true
    });
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str, prefix: bool, count_only: bool) -> KvResult<GetResult> {
        let inner = self.inner.lock().unwrap();
        let matched: Vec<(&String, &StoredValue)> = if prefix {
            inner
                .kvs
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .collect()
        } else {
            inner.kvs.get_key_value(key).into_iter().collect()
        };
        let count = matched.len() as i64;
        let kvs = if count_only {
            Vec::new()
        } else {
            matched
                .into_iter()
                .map(|(k, v)| KeyValue {
                    key: k.clone(),
                    value: v.value.clone(),
                })
                .collect()
        };
        Ok(GetResult { kvs, count })
    }

    async fn put(&self, key: &str, value: &[u8], lease: Option<LeaseId>) -> KvResult<()> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(KvError::Timeout("put deadline exceeded".to_string()));
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(id) = lease {
            if !inner.leases.contains_key(&id) {
                return Err(KvError::Backend("requested lease not found".to_string()));
            }
        }
        let (kind, version) = match inner.kvs.get(key) {
            Some(existing) => (EventKind::Modify, existing.version + 1),
            None => (EventKind::Create, 1),
        };
        inner.kvs.insert(
            key.to_string(),
            StoredValue {
                value: value.to_vec(),
                lease,
                version,
            },
        );
        let events = [WatchEvent {
            kind,
            key: key.to_string(),
            value: value.to_vec(),
        }];
        fan_out(&mut inner, &events);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &[u8]) -> KvResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.kvs.contains_key(key) {
            return Ok(false);
        }
        inner.kvs.insert(
            key.to_string(),
            StoredValue {
                value: value.to_vec(),
                lease: None,
                version: 1,
            },
        );
        let events = [WatchEvent {
            kind: EventKind::Create,
            key: key.to_string(),
            value: value.to_vec(),
        }];
        fan_out(&mut inner, &events);
        Ok(true)
    }

    async fn delete(&self, key: &str, prefix: bool) -> KvResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<String> = if prefix {
            inner
                .kvs
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(k, _)| k.clone())
                .collect()
        } else if inner.kvs.contains_key(key) {
            vec![key.to_string()]
        } else {
            Vec::new()
        };
        let mut events = Vec::with_capacity(doomed.len());
        for key in &doomed {
            inner.kvs.remove(key);
            events.push(WatchEvent {
                kind: EventKind::Delete,
                key: key.clone(),
                value: Vec::new(),
            });
        }
        fan_out(&mut inner, &events);
        Ok(events.len() as u64)
    }

    async fn grant(&self, ttl_secs: i64) -> KvResult<LeaseId> {
        if ttl_secs <= 0 {
            return Err(KvError::InvalidArgument(format!(
                "lease ttl {ttl_secs} must be positive"
            )));
        }
        let ttl = Duration::from_secs(ttl_secs as u64);
        let mut inner = self.inner.lock().unwrap();
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(
            id,
            LeaseRecord {
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> KvResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        match inner.leases.get_mut(&lease) {
            Some(rec) if rec.expires_at > now => {
                rec.expires_at = now + rec.ttl;
                Ok(())
            }
            _ => Err(KvError::Backend("requested lease not found".to_string())),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> KvResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.leases.remove(&lease).is_none() {
            return Err(KvError::Backend("requested lease not found".to_string()));
        }
        let doomed: Vec<String> = inner
            .kvs
            .iter()
            .filter(|(_, v)| v.lease == Some(lease))
            .map(|(k, _)| k.clone())
            .collect();
        let mut events = Vec::with_capacity(doomed.len());
        for key in doomed {
            inner.kvs.remove(&key);
            events.push(WatchEvent {
                kind: EventKind::Delete,
                key,
                value: Vec::new(),
            });
        }
        fan_out(&mut inner, &events);
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> KvResult<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(WatchStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_modify_then_delete_events() {
        let backend = MemoryBackend::new();
        let mut watch = backend.watch("/scalers/").await.unwrap();

        backend.put("/scalers/os1/a", b"1", None).await.unwrap();
        backend.put("/scalers/os1/a", b"2", None).await.unwrap();
        backend.delete("/scalers/os1/a", false).await.unwrap();

        let ev = watch.recv().await.unwrap().unwrap();
        assert_eq!(ev.kind, EventKind::Create);
        assert_eq!(ev.value, b"1");
        let ev = watch.recv().await.unwrap().unwrap();
        assert_eq!(ev.kind, EventKind::Modify);
        assert_eq!(ev.value, b"2");
        let ev = watch.recv().await.unwrap().unwrap();
        assert_eq!(ev.kind, EventKind::Delete);
    }

    #[tokio::test]
    async fn watch_filters_by_prefix() {
        let backend = MemoryBackend::new();
        let mut watch = backend.watch("/healers/").await.unwrap();

        backend.put("/scalers/os1/a", b"1", None).await.unwrap();
        backend.put("/healers/os1/h", b"2", None).await.unwrap();

        let ev = watch.recv().await.unwrap().unwrap();
        assert_eq!(ev.key, "/healers/os1/h");
    }

    #[tokio::test]
    async fn lease_expiry_deletes_keys_and_notifies() {
        let backend = MemoryBackend::new();
        let mut watch = backend.watch("/cluster/").await.unwrap();

        let lease = backend.grant(1).await.unwrap();
        backend
            .put("/cluster/c1/members/n1", b"{}", Some(lease))
            .await
            .unwrap();

        // Expire without keep-alives. The sweeper runs every 25ms; the
        // lease TTL is 1s.
        let ev = tokio::time::timeout(Duration::from_secs(3), watch.recv())
            .await
            .expect("expiry event within ttl + sweep")
            .unwrap()
            .unwrap();
        assert_eq!(ev.kind, EventKind::Delete);
        assert_eq!(ev.key, "/cluster/c1/members/n1");
        assert!(backend.get("/cluster/c1/members/n1", false, false).await.unwrap().kvs.is_empty());
    }

    #[tokio::test]
    async fn keep_alive_extends_lease() {
        let backend = MemoryBackend::new();
        let lease = backend.grant(2).await.unwrap();
        backend.put("/k", b"v", Some(lease)).await.unwrap();

        // Renew a few times across the original TTL.
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(300)).await;
            backend.keep_alive_once(lease).await.unwrap();
        }
        assert_eq!(backend.get("/k", false, false).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn revoke_removes_lease_and_keys() {
        let backend = MemoryBackend::new();
        let lease = backend.grant(10).await.unwrap();
        backend.put("/k1", b"v", Some(lease)).await.unwrap();
        backend.put("/k2", b"v", None).await.unwrap();

        backend.revoke(lease).await.unwrap();
        assert_eq!(backend.get("/k1", false, false).await.unwrap().count, 0);
        assert_eq!(backend.get("/k2", false, false).await.unwrap().count, 1);
        assert!(backend.keep_alive_once(lease).await.is_err());
    }

    #[tokio::test]
    async fn put_with_unknown_lease_fails() {
        let backend = MemoryBackend::new();
        let err = backend.put("/k", b"v", Some(42)).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn prefix_delete_counts() {
        let backend = MemoryBackend::new();
        backend.put("/silences/os1/a", b"1", None).await.unwrap();
        backend.put("/silences/os1/b", b"2", None).await.unwrap();
        backend.put("/silences/os2/c", b"3", None).await.unwrap();

        let removed = backend.delete("/silences/os1/", true).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(backend.get("/silences/", true, false).await.unwrap().count, 1);
    }
}
