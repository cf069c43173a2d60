//! The shared manager engine driving worker lifecycle.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use faythe_cluster::Cluster;
use faythe_kv::{EventKind, KvClient, KvError, WatchEvent};
use faythe_model::{key_path, CLOUD_PREFIX};

use crate::provider_of;
use crate::registry::{Registry, Worker};

/// Lifecycle of a manager. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Active,
    Stopping,
    Stopped,
}

/// Builds workers of one kind from their persisted records.
///
/// The factory owns provider resolution: building a rule whose provider
/// record is missing must fail, and a disabled rule yields `None`.
#[async_trait]
pub trait WorkerFactory: Send + Sync + 'static {
    /// Worker kind label, e.g. `"scaler"`.
    fn kind(&self) -> &'static str;

    /// Keyspace prefix this manager reconciles, e.g. `"/scalers"`.
    fn prefix(&self) -> &'static str;

    /// Build a worker for the rule at `name`, or `None` if the rule is
    /// disabled.
    async fn build(&self, name: &str, raw: &[u8]) -> anyhow::Result<Option<Arc<dyn Worker>>>;
}

/// Node-local supervisor of all workers of one kind.
pub struct Manager {
    kv: KvClient,
    cluster: Arc<Cluster>,
    registry: Registry,
    factory: Arc<dyn WorkerFactory>,
    state: Mutex<ManagerState>,
    stop_tx: watch::Sender<bool>,
}

impl Manager {
    /// Load existing rules, then start the watch loop.
    pub async fn start(
        kv: KvClient,
        cluster: Arc<Cluster>,
        factory: Arc<dyn WorkerFactory>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        let manager = Arc::new(Self {
            kv,
            cluster,
            registry: Registry::new(),
            factory,
            state: Mutex::new(ManagerState::Active),
            stop_tx,
        });
        manager.load().await;
        let runner = Arc::clone(&manager);
        tokio::spawn(async move { runner.run().await });
        manager
    }

    /// Current lifecycle state, for health reporting.
    pub fn status(&self) -> ManagerState {
        *self.state.lock().unwrap()
    }

    /// Names of the workers this node is currently running.
    pub fn worker_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Number of running workers.
    pub fn worker_count(&self) -> usize {
        self.registry.len()
    }

    /// Rebalance after a membership change: stop workers another node
    /// now owns, start workers newly assigned here.
    pub async fn reload(&self) {
        info!(kind = self.factory.kind(), "reloading");
        self.rebalance().await;
        info!(kind = self.factory.kind(), "reloaded");
    }

    /// Graceful shutdown: stop the watch loop, checkpoint every worker's
    /// state into its rule record, and wait for all workers to exit.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ManagerState::Active {
                return;
            }
            *state = ManagerState::Stopping;
        }
        info!(kind = self.factory.kind(), "stopping manager");
        let _ = self.stop_tx.send(true);
        self.save().await;
        *self.state.lock().unwrap() = ManagerState::Stopped;
        info!(kind = self.factory.kind(), "manager stopped");
    }

    fn watch_prefix(&self) -> String {
        format!("{}/", self.factory.prefix())
    }

    async fn load(&self) {
        let kvs = match self.kv.do_get_prefix(&self.watch_prefix()).await {
            Ok(kvs) => kvs,
            Err(e) => {
                error!(error = %e, kind = self.factory.kind(), "cannot load rules");
                return;
            }
        };
        for kv in kvs {
            let Some(provider) = provider_of(&kv.key) else {
                warn!(key = %kv.key, "skipping malformed rule key");
                continue;
            };
            let provider_key = key_path(&[CLOUD_PREFIX, provider]);
            if !self.kv.check_key(&provider_key).await {
                warn!(
                    key = %kv.key,
                    provider,
                    "skipping rule, provider not registered"
                );
                continue;
            }
            self.start_worker(&kv.key, &kv.value).await;
        }
        self.report_workers();
    }

    /// Single-reader event loop. Events for one key arrive in revision
    /// order; a lost-leader watch is rebuilt up to the retry budget.
    async fn run(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        // Stop may have been requested before this task first polled;
        // subscribe() marks the current value as seen.
        if *stop_rx.borrow() {
            return;
        }
        let prefix = self.watch_prefix();
        let mut retries: u32 = 0;
        'rebuild: loop {
            let mut stream = match self.kv.watch(&prefix).await {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, kind = self.factory.kind(), "cannot watch rule keyspace");
                    self.kv.report_error(e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    item = stream.recv() => match item {
                        Some(Ok(event)) => self.handle_event(event).await,
                        Some(Err(KvError::NoLeader))
                            if retries < self.kv.config().retry_count =>
                        {
                            retries += 1;
                            warn!(
                                kind = self.factory.kind(),
                                retries,
                                "rule watch lost leader, rebuilding"
                            );
                            tokio::time::sleep(self.kv.config().retry_interval).await;
                            continue 'rebuild;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, kind = self.factory.kind(), "rule watch failed");
                            self.kv.report_error(e);
                            return;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: WatchEvent) {
        match event.kind {
            EventKind::Create => {
                self.start_worker(&event.key, &event.value).await;
            }
            EventKind::Modify => {
                // A modified rule restarts from scratch; only the node
                // running it reacts.
                if self.registry.contains(&event.key) {
                    self.halt_worker(&event.key).await;
                    self.start_worker(&event.key, &event.value).await;
                }
            }
            EventKind::Delete => {
                if self.registry.contains(&event.key) {
                    info!(name = %event.key, kind = self.factory.kind(), "removing worker");
                    self.halt_worker(&event.key).await;
                }
            }
        }
        self.report_workers();
    }

    /// Build and register a worker if this node owns the rule.
    async fn start_worker(&self, name: &str, raw: &[u8]) {
        let (local, owner, is_mine) = self.cluster.local_is_worker(name);
        if !is_mine {
            debug!(name, %local, %owner, "ignoring rule, another node owns it");
            return;
        }
        let worker = match self.factory.build(name, raw).await {
            Ok(Some(worker)) => worker,
            Ok(None) => {
                debug!(name, "rule is disabled, not starting");
                return;
            }
            Err(e) => {
                error!(name, error = %e, "cannot build worker");
                return;
            }
        };
        info!(name, kind = self.factory.kind(), "starting worker");
        let runner = Arc::clone(&worker);
        let handle = tokio::spawn(async move { runner.run().await });
        if let Some(old) = self.registry.set(name, worker, handle) {
            // Replaced a live worker; make sure the old one dies.
            old.worker.stop();
            old.handle.abort();
        }
    }

    /// Stop a registered worker and wait for its task to exit.
    async fn halt_worker(&self, name: &str) {
        if let Some(item) = self.registry.remove(name) {
            item.worker.stop();
            let _ = item.handle.await;
        }
    }

    /// Stop non-owned workers and start newly-owned ones, one future per
    /// rule, joining all before returning.
    ///
    /// The losing side only stops: any state checkpoint is the graceful
    /// shutdown path's concern, and the new owner resumes from the last
    /// durable record.
    async fn rebalance(&self) {
        let kvs = match self.kv.do_get_prefix(&self.watch_prefix()).await {
            Ok(kvs) => kvs,
            Err(e) => {
                error!(error = %e, kind = self.factory.kind(), "cannot list rules for rebalance");
                return;
            }
        };
        join_all(kvs.into_iter().map(|kv| async move {
            let name = kv.key;
            let (local, owner, is_mine) = self.cluster.local_is_worker(&name);
            let registered = self.registry.contains(&name);
            if !is_mine && registered {
                info!(name = %name, %local, %owner, "removing worker, another node takes it");
                self.halt_worker(&name).await;
            } else if is_mine && !registered {
                self.start_worker(&name, &kv.value).await;
            }
        }))
        .await;
        self.report_workers();
    }

    /// Checkpoint every worker's state into its rule record, then stop
    /// it. Entries are handled in parallel and joined.
    async fn save(&self) {
        join_all(self.registry.iter().into_iter().map(|(name, worker)| async move {
            match worker.snapshot() {
                Some(snapshot) => {
                    if let Err(e) = self.kv.do_put(&name, &snapshot).await {
                        error!(name = %name, error = %e, "cannot checkpoint worker state");
                    }
                }
                None => debug!(name = %name, "worker has no checkpoint"),
            }
            self.halt_worker(&name).await;
        }))
        .await;
        self.report_workers();
    }

    fn report_workers(&self) {
        faythe_exporter::report_workers(
            self.cluster.cluster_id(),
            self.factory.kind(),
            self.registry.len() as i64,
        );
    }
}
