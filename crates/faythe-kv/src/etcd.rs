//! etcd v3 backend over `etcd-client`.

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions, PutOptions,
    SortOrder, SortTarget, Txn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{classify_etcd_error, KvError, KvResult};
use crate::event::{EventKind, WatchEvent, WatchStream};
use crate::{GetResult, KvBackend, KeyValue, LeaseId};

/// Backend over a real etcd v3 cluster.
///
/// The wrapped client is cheap to clone; each call clones it for the
/// required `&mut` receiver.
pub struct EtcdBackend {
    client: Client,
}

impl EtcdBackend {
    /// Connect to the given endpoints, optionally authenticating.
    pub async fn connect(
        endpoints: &[String],
        credentials: Option<(String, String)>,
    ) -> KvResult<Self> {
        let options = credentials.map(|(user, password)| {
            ConnectOptions::new().with_user(user, password)
        });
        let client = Client::connect(endpoints, options)
            .await
            .map_err(classify_etcd_error)?;
        debug!(?endpoints, "connected to etcd");
        Ok(Self { client })
    }
}

#[async_trait]
impl KvBackend for EtcdBackend {
    async fn get(&self, key: &str, prefix: bool, count_only: bool) -> KvResult<GetResult> {
        let mut options = GetOptions::new();
        if prefix {
            options = options
                .with_prefix()
                .with_sort(SortTarget::Key, SortOrder::Ascend);
        }
        if count_only {
            options = options.with_count_only();
        }
        let mut client = self.client.clone();
        let resp = client
            .get(key, Some(options))
            .await
            .map_err(classify_etcd_error)?;
        let kvs = resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
            })
            .collect();
        Ok(GetResult {
            kvs,
            count: resp.count(),
        })
    }

    async fn put(&self, key: &str, value: &[u8], lease: Option<LeaseId>) -> KvResult<()> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        let mut client = self.client.clone();
        client
            .put(key, value, options)
            .await
            .map_err(classify_etcd_error)?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &[u8]) -> KvResult<bool> {
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, None)]);
        let mut client = self.client.clone();
        let resp = client.txn(txn).await.map_err(classify_etcd_error)?;
        Ok(resp.succeeded())
    }

    async fn delete(&self, key: &str, prefix: bool) -> KvResult<u64> {
        let options = prefix.then(|| DeleteOptions::new().with_prefix());
        let mut client = self.client.clone();
        let resp = client
            .delete(key, options)
            .await
            .map_err(classify_etcd_error)?;
        Ok(resp.deleted() as u64)
    }

    async fn grant(&self, ttl_secs: i64) -> KvResult<LeaseId> {
        let mut client = self.client.clone();
        let resp = client
            .lease_grant(ttl_secs, None)
            .await
            .map_err(classify_etcd_error)?;
        Ok(resp.id())
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> KvResult<()> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease)
            .await
            .map_err(classify_etcd_error)?;
        keeper.keep_alive().await.map_err(classify_etcd_error)?;
        match stream.message().await.map_err(classify_etcd_error)? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            _ => Err(KvError::Backend("requested lease not found".to_string())),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> KvResult<()> {
        let mut client = self.client.clone();
        client
            .lease_revoke(lease)
            .await
            .map_err(classify_etcd_error)?;
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> KvResult<WatchStream> {
        let mut client = self.client.clone();
        let (watcher, mut stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(classify_etcd_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Keep the watcher alive for the stream's lifetime; dropping
            // it cancels the server-side watch.
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let kind = match event.event_type() {
                                EventType::Put => {
                                    if kv.version() == 1 {
                                        EventKind::Create
                                    } else {
                                        EventKind::Modify
                                    }
                                }
                                EventType::Delete => EventKind::Delete,
                            };
                            let item = WatchEvent {
                                kind,
                                key: String::from_utf8_lossy(kv.key()).into_owned(),
                                value: kv.value().to_vec(),
                            };
                            if tx.send(Ok(item)).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(Err(KvError::WatchClosed));
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(classify_etcd_error(e)));
                        return;
                    }
                }
            }
        });
        Ok(WatchStream::new(rx))
    }
}
