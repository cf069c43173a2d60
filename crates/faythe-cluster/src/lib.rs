//! faythe-cluster — node membership and rule ownership.
//!
//! Each node keeps itself in the member set for the life of the process
//! via a leased key under `/cluster/<clusterID>/members/`, renewing the
//! lease at a third of its TTL. A prefix watch on the member keyspace
//! refreshes the local snapshot and emits one reload token whenever the
//! set actually changes; managers rebalance on that signal.
//!
//! Ownership questions all go through [`Cluster::local_is_worker`],
//! backed by rendezvous hashing over the current snapshot.

pub mod hash;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use faythe_kv::{KvClient, KvError};
use faythe_model::{hash_id, key_path, CLUSTER_PREFIX};

use crate::hash::rendezvous_owner;

/// Default membership lease TTL in seconds.
pub const DEFAULT_LEASE_TTL: i64 = 15;
/// Consecutive keep-alive failures tolerated before self-eviction.
const MAX_KEEPALIVE_FAILURES: u32 = 3;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors raised while joining or running the membership protocol.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("cluster founding failed: {0}")]
    Founding(String),
}

/// One node in the member set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub address: String,
}

/// Join parameters.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Existing cluster to join; empty founds a new one.
    pub cluster_id: String,
    /// This node's advertised address.
    pub address: String,
    /// Membership lease TTL in seconds.
    pub lease_ttl_secs: i64,
}

impl ClusterOptions {
    pub fn new(cluster_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            address: address.into(),
            lease_ttl_secs: DEFAULT_LEASE_TTL,
        }
    }

    pub fn with_lease_ttl(mut self, secs: i64) -> Self {
        self.lease_ttl_secs = secs;
        self
    }
}

/// Handle to this node's cluster membership.
pub struct Cluster {
    cluster_id: String,
    local: Member,
    member_key: String,
    members_prefix: String,
    kv: KvClient,
    lease: faythe_kv::LeaseId,
    members: RwLock<Vec<Member>>,
    stop_tx: watch::Sender<bool>,
}

impl Cluster {
    /// Found or join a cluster and start the keep-alive and watcher
    /// loops. Returns the handle and the reload channel managers listen
    /// on; at most one reload is ever pending.
    pub async fn join(
        options: ClusterOptions,
        kv: KvClient,
    ) -> ClusterResult<(Arc<Self>, mpsc::Receiver<()>)> {
        let generated = options.cluster_id.is_empty();
        let cluster_id = if generated {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            options.cluster_id.clone()
        };

        // Exactly one founder can create the sentinel; everyone else
        // observes it and joins.
        let sentinel = key_path(&[CLUSTER_PREFIX, &cluster_id]);
        let founded = kv.put_if_absent(&sentinel, "{}").await?;
        if founded {
            info!(%cluster_id, "initialized new cluster");
        } else if generated {
            return Err(ClusterError::Founding(format!(
                "generated cluster id {cluster_id} already exists"
            )));
        } else {
            info!(%cluster_id, "joining existing cluster");
        }

        let node_id = format!("node-{}", &hash_id(&options.address)[..8]);
        let local = Member {
            id: node_id.clone(),
            address: options.address.clone(),
        };

        let lease = kv.do_grant(options.lease_ttl_secs).await?;
        let member_key = key_path(&[CLUSTER_PREFIX, &cluster_id, "members", &node_id]);
        let value = serde_json::to_string(&local)
            .map_err(|e| ClusterError::Founding(e.to_string()))?;
        kv.do_put_with_lease(&member_key, &value, Some(lease)).await?;
        info!(%cluster_id, %node_id, address = %options.address, "joined cluster");

        let members_prefix = key_path(&[CLUSTER_PREFIX, &cluster_id, "members"]) + "/";
        let (stop_tx, _) = watch::channel(false);
        let cluster = Arc::new(Self {
            cluster_id,
            local,
            member_key,
            members_prefix,
            kv,
            lease,
            members: RwLock::new(Vec::new()),
            stop_tx,
        });
        cluster.refresh_members().await?;

        let (reload_tx, reload_rx) = mpsc::channel(1);

        // Renew at a third of the TTL so a single missed renewal never
        // costs the lease.
        let period = Duration::from_secs_f64((options.lease_ttl_secs as f64 / 3.0).max(0.2));
        let keepalive = Arc::clone(&cluster);
        tokio::spawn(async move {
            keepalive.run_keepalive(period).await;
        });

        let watcher = Arc::clone(&cluster);
        tokio::spawn(async move {
            watcher.run_watcher(reload_tx).await;
        });

        Ok((cluster, reload_rx))
    }

    /// The cluster this node belongs to.
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// This node's member ID.
    pub fn local_id(&self) -> &str {
        &self.local.id
    }

    /// The membership lease backing this node's liveness.
    pub fn lease_id(&self) -> faythe_kv::LeaseId {
        self.lease
    }

    /// Snapshot of the current member set, sorted by ID.
    pub fn members(&self) -> Vec<Member> {
        self.members.read().unwrap().clone()
    }

    /// The single ownership predicate: `(local, owner, is_mine)` for a
    /// rule key. Every mutation path consults this before touching a
    /// worker.
    pub fn local_is_worker(&self, name: &str) -> (String, String, bool) {
        let members = self.members.read().unwrap();
        let owner = rendezvous_owner(members.iter().map(|m| m.id.as_str()), name)
            .unwrap_or_default()
            .to_string();
        let local = self.local.id.clone();
        let is_mine = !owner.is_empty() && owner == local;
        (local, owner, is_mine)
    }

    /// Leave the cluster: stop the loops, revoke the lease (removing the
    /// membership key), and delete the key as a belt for backends where
    /// revocation raced expiry.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.kv.do_revoke(self.lease).await {
            debug!(error = %e, "lease revoke on leave failed");
        }
        let _ = self.kv.do_delete(&self.member_key, false).await;
        info!(node_id = %self.local.id, "left cluster");
    }

    /// Re-read the member set; returns whether it changed.
    pub async fn refresh_members(&self) -> ClusterResult<bool> {
        let kvs = self.kv.do_get_prefix(&self.members_prefix).await?;
        let mut fresh: Vec<Member> = kvs
            .iter()
            .filter_map(|kv| match serde_json::from_slice(&kv.value) {
                Ok(member) => Some(member),
                Err(e) => {
                    warn!(key = %kv.key, error = %e, "skipping unparsable member record");
                    None
                }
            })
            .collect();
        fresh.sort_by(|a: &Member, b: &Member| a.id.cmp(&b.id));

        let mut members = self.members.write().unwrap();
        if *members != fresh {
            debug!(count = fresh.len(), "member snapshot changed");
            *members = fresh;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn run_keepalive(&self, period: Duration) {
        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return;
        }
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut failures: u32 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.kv.do_keep_alive_once(self.lease).await {
                        Ok(()) => {
                            failures = 0;
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(error = %e, failures, "membership keep-alive failed");
                            if failures >= MAX_KEEPALIVE_FAILURES {
                                error!("membership lease lost, evicting self");
                                let _ = self.kv.do_delete(&self.member_key, false).await;
                                self.kv.report_error(KvError::Backend(
                                    "cluster membership lease lost".to_string(),
                                ));
                                return;
                            }
                        }
                    }
                }
                _ = stop_rx.changed() => return,
            }
        }
    }

    async fn run_watcher(&self, reload_tx: mpsc::Sender<()>) {
        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return;
        }
        let mut retries: u32 = 0;
        'rebuild: loop {
            let mut stream = match self.kv.watch(&self.members_prefix).await {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "cannot watch member keyspace");
                    self.kv.report_error(e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    item = stream.recv() => match item {
                        Some(Ok(_)) => {
                            match self.refresh_members().await {
                                Ok(true) => {
                                    // Collapse bursts: one pending reload
                                    // is as good as many.
                                    let _ = reload_tx.try_send(());
                                }
                                Ok(false) => {}
                                Err(e) => warn!(error = %e, "member refresh failed"),
                            }
                        }
                        Some(Err(KvError::NoLeader))
                            if retries < self.kv.config().retry_count =>
                        {
                            retries += 1;
                            warn!(retries, "member watch lost leader, rebuilding");
                            tokio::time::sleep(self.kv.config().retry_interval).await;
                            continue 'rebuild;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "member watch failed");
                            self.kv.report_error(e);
                            return;
                        }
                        None => return,
                    },
                    _ = stop_rx.changed() => return,
                }
            }
        }
    }
}
