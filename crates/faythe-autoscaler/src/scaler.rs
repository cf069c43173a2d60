//! The scaler worker and its factory.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use faythe_kv::KvClient;
use faythe_manager::{provider_of, ActionDispatcher, Worker, WorkerFactory, DEFAULT_ACTION_TIMEOUT};
use faythe_metrics::{MetricBackend, PrometheusBackend};
use faythe_model::{
    key_path, parse_duration, AlertState, CloudProvider, ScalerRule, Transition, CLOUD_PREFIX,
    SCALER_PREFIX,
};

/// Per-rule evaluation worker.
///
/// Ticks every `interval`; evaluations are serial within a worker, and
/// a tick that would overlap a still-running evaluation is skipped.
pub struct Scaler {
    name: String,
    rule: ScalerRule,
    duration: Duration,
    interval: Duration,
    cooldown: Duration,
    alert: Mutex<AlertState>,
    backend: Arc<dyn MetricBackend>,
    dispatcher: Arc<ActionDispatcher>,
    stop_tx: watch::Sender<bool>,
}

impl Scaler {
    /// Build a worker from a validated rule. The rule's embedded alert
    /// state (if any) seeds the machine so a restart resumes in place.
    pub fn new(
        name: &str,
        mut rule: ScalerRule,
        backend: Arc<dyn MetricBackend>,
        dispatcher: Arc<ActionDispatcher>,
    ) -> anyhow::Result<Self> {
        let duration = parse_duration(&rule.duration)
            .ok_or_else(|| anyhow::anyhow!("bad duration {:?}", rule.duration))?;
        let interval = parse_duration(&rule.interval)
            .ok_or_else(|| anyhow::anyhow!("bad interval {:?}", rule.interval))?;
        let cooldown = parse_duration(&rule.cooldown)
            .ok_or_else(|| anyhow::anyhow!("bad cooldown {:?}", rule.cooldown))?;
        let alert = rule.alert.take().unwrap_or_default();
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            name: name.to_string(),
            rule,
            duration,
            interval,
            cooldown,
            alert: Mutex::new(alert),
            backend,
            dispatcher,
            stop_tx,
        })
    }

    /// Current machine position (for tests and introspection).
    pub fn alert_state(&self) -> AlertState {
        self.alert.lock().unwrap().clone()
    }

    async fn evaluate(&self) {
        let firing = match self.backend.query(&self.rule.query).await {
            Ok(samples) => !samples.is_empty(),
            Err(e) => {
                warn!(name = %self.name, error = %e, "metric query failed");
                false
            }
        };

        let transition =
            self.alert
                .lock()
                .unwrap()
                .step(firing, self.duration, self.cooldown, Utc::now());

        if transition == Transition::Dispatch {
            info!(
                name = %self.name,
                actions = self.rule.actions.len(),
                "rule fired, dispatching actions"
            );
            self.dispatcher
                .dispatch_all(&self.rule.id, None, &self.rule.actions)
                .await;
            self.alert.lock().unwrap().enter_cooldown();
        }
    }
}

#[async_trait]
impl Worker for Scaler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) {
        debug!(name = %self.name, interval = ?self.interval, "scaler started");
        let mut stop_rx = self.stop_tx.subscribe();
        // A stop requested before this task first polled would otherwise
        // be invisible: subscribe() marks the current value as seen.
        if *stop_rx.borrow() {
            return;
        }
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {}
            }
            if *stop_rx.borrow() {
                break;
            }
            // Stop also cancels an evaluation in flight.
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = self.evaluate() => {}
            }
        }
        debug!(name = %self.name, "scaler stopped");
    }

    fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn snapshot(&self) -> Option<String> {
        let mut rule = self.rule.clone();
        rule.alert = Some(self.alert.lock().unwrap().clone());
        serde_json::to_string(&rule).ok()
    }
}

/// Builds scalers: parses and validates the record, resolves the
/// provider's metric backend, and skips disabled rules.
pub struct ScalerFactory {
    kv: KvClient,
    cluster_id: String,
    action_timeout: Duration,
}

impl ScalerFactory {
    pub fn new(kv: KvClient, cluster_id: &str) -> Self {
        Self {
            kv,
            cluster_id: cluster_id.to_string(),
            action_timeout: DEFAULT_ACTION_TIMEOUT,
        }
    }

    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }
}

#[async_trait]
impl WorkerFactory for ScalerFactory {
    fn kind(&self) -> &'static str {
        "scaler"
    }

    fn prefix(&self) -> &'static str {
        SCALER_PREFIX
    }

    async fn build(&self, name: &str, raw: &[u8]) -> anyhow::Result<Option<Arc<dyn Worker>>> {
        let mut rule: ScalerRule = serde_json::from_slice(raw)?;
        rule.validate()?;
        if !rule.active {
            return Ok(None);
        }

        let provider = provider_of(name)
            .ok_or_else(|| anyhow::anyhow!("malformed rule key {name:?}"))?;
        let got = self.kv.do_get(&key_path(&[CLOUD_PREFIX, provider])).await?;
        let record = got
            .kvs
            .first()
            .ok_or_else(|| anyhow::anyhow!("provider {provider} not registered"))?;
        let cloud: CloudProvider = serde_json::from_slice(&record.value)?;

        let backend = Arc::new(PrometheusBackend::new(&cloud.monitor.address)?);
        let dispatcher = Arc::new(ActionDispatcher::new(&self.cluster_id, self.action_timeout));
        let scaler = Scaler::new(name, rule, backend, dispatcher)?;
        Ok(Some(Arc::new(scaler)))
    }
}
