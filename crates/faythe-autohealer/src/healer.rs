//! The healer worker and its factory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use faythe_kv::KvClient;
use faythe_manager::{provider_of, ActionDispatcher, Worker, WorkerFactory, DEFAULT_ACTION_TIMEOUT};
use faythe_metrics::{MetricBackend, PrometheusBackend};
use faythe_model::{
    key_path, parse_duration, CloudProvider, HealerRule, Silence, CLOUD_PREFIX, HEALER_PREFIX,
    SILENCE_PREFIX,
};

use crate::locks::host_lock;

/// Per-rule healing worker tracking hysteresis per host.
pub struct Healer {
    name: String,
    rule: HealerRule,
    provider_id: String,
    duration: Duration,
    interval: Duration,
    cooldown: Duration,
    /// First tick each currently-unhealthy host was observed.
    active_since: Mutex<HashMap<String, DateTime<Utc>>>,
    /// Most recent remediation per host.
    last_healed: Mutex<HashMap<String, DateTime<Utc>>>,
    backend: Arc<dyn MetricBackend>,
    dispatcher: Arc<ActionDispatcher>,
    kv: KvClient,
    stop_tx: watch::Sender<bool>,
}

impl Healer {
    pub fn new(
        name: &str,
        rule: HealerRule,
        kv: KvClient,
        backend: Arc<dyn MetricBackend>,
        dispatcher: Arc<ActionDispatcher>,
    ) -> anyhow::Result<Self> {
        let duration = parse_duration(&rule.duration)
            .ok_or_else(|| anyhow::anyhow!("bad duration {:?}", rule.duration))?;
        let interval = parse_duration(&rule.interval)
            .ok_or_else(|| anyhow::anyhow!("bad interval {:?}", rule.interval))?;
        let cooldown = parse_duration(&rule.cooldown)
            .ok_or_else(|| anyhow::anyhow!("bad cooldown {:?}", rule.cooldown))?;
        let provider_id = provider_of(name)
            .ok_or_else(|| anyhow::anyhow!("malformed rule key {name:?}"))?
            .to_string();
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            name: name.to_string(),
            rule,
            provider_id,
            duration,
            interval,
            cooldown,
            active_since: Mutex::new(HashMap::new()),
            last_healed: Mutex::new(HashMap::new()),
            backend,
            dispatcher,
            kv,
            stop_tx,
        })
    }

    /// Hosts currently inside their hysteresis window (for tests).
    pub fn tracked_hosts(&self) -> Vec<String> {
        self.active_since.lock().unwrap().keys().cloned().collect()
    }

    /// Hosts remediated so far (for tests).
    pub fn healed_hosts(&self) -> Vec<String> {
        self.last_healed.lock().unwrap().keys().cloned().collect()
    }

    async fn evaluate(&self) {
        let samples = match self.backend.query(&self.rule.query).await {
            Ok(samples) => samples,
            Err(e) => {
                // No information this tick; keep existing windows.
                warn!(name = %self.name, error = %e, "metric query failed");
                return;
            }
        };
        let now = Utc::now();
        let unhealthy: Vec<String> = samples
            .iter()
            .filter_map(|s| s.host().map(str::to_string))
            .collect();

        // Advance per-host hysteresis: recovered hosts drop out, new
        // ones start their window.
        let due: Vec<String> = {
            let mut active = self.active_since.lock().unwrap();
            active.retain(|host, _| unhealthy.contains(host));
            for host in &unhealthy {
                active.entry(host.clone()).or_insert(now);
            }
            active
                .iter()
                .filter(|(_, since)| {
                    now.signed_duration_since(**since)
                        .to_std()
                        .map(|held| held >= self.duration)
                        .unwrap_or(false)
                })
                .map(|(host, _)| host.clone())
                .collect()
        };

        let due: Vec<String> = {
            let last = self.last_healed.lock().unwrap();
            due.into_iter()
                .filter(|host| {
                    last.get(host)
                        .map(|at| {
                            now.signed_duration_since(*at)
                                .to_std()
                                .map(|gap| gap >= self.cooldown)
                                .unwrap_or(false)
                        })
                        .unwrap_or(true)
                })
                .collect()
        };
        if due.is_empty() {
            return;
        }

        // A failure wider than the cap is infrastructure trouble;
        // host-by-host remediation would only add load.
        if due.len() > self.rule.max_instances as usize {
            warn!(
                name = %self.name,
                due = due.len(),
                cap = self.rule.max_instances,
                "too many unhealthy hosts, skipping remediation batch"
            );
            return;
        }

        let silences = self.active_silences(now).await;
        for host in due {
            if let Some(silence) = silences.iter().find(|(re, _)| re.is_match(&host)) {
                info!(
                    name = %self.name,
                    %host,
                    pattern = %silence.1.pattern,
                    "host silenced, skipping remediation"
                );
                continue;
            }
            // Serialize remediation per host across all rules.
            let lock = host_lock(&host);
            let _guard = lock.lock().await;
            info!(name = %self.name, %host, "remediating host");
            self.dispatcher
                .dispatch_all(&self.rule.id, Some(&host), &self.rule.actions)
                .await;
            self.last_healed.lock().unwrap().insert(host, Utc::now());
        }
    }

    /// Unexpired silences for this provider, with compiled patterns.
    async fn active_silences(&self, now: DateTime<Utc>) -> Vec<(Regex, Silence)> {
        let prefix = key_path(&[SILENCE_PREFIX, &self.provider_id]) + "/";
        let kvs = match self.kv.do_get_prefix(&prefix).await {
            Ok(kvs) => kvs,
            Err(e) => {
                warn!(name = %self.name, error = %e, "cannot list silences");
                return Vec::new();
            }
        };
        kvs.iter()
            .filter_map(|kv| {
                let silence: Silence = match serde_json::from_slice(&kv.value) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(key = %kv.key, error = %e, "skipping unparsable silence");
                        return None;
                    }
                };
                if !silence.is_active(now) {
                    return None;
                }
                match Regex::new(&silence.pattern) {
                    Ok(re) => Some((re, silence)),
                    Err(e) => {
                        warn!(key = %kv.key, error = %e, "skipping silence with bad pattern");
                        None
                    }
                }
            })
            .collect()
    }
}

#[async_trait]
impl Worker for Healer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) {
        debug!(name = %self.name, interval = ?self.interval, "healer started");
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
        debug!(name = %self.name, "healer stopped");
    }

    fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Healer state is per host and rebuilt from observation; the
    /// checkpoint carries the rule body only.
    fn snapshot(&self) -> Option<String> {
        serde_json::to_string(&self.rule).ok()
    }
}

/// Builds healers, resolving the provider's metric backend.
pub struct HealerFactory {
    kv: KvClient,
    cluster_id: String,
    action_timeout: Duration,
}

impl HealerFactory {
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
impl WorkerFactory for HealerFactory {
    fn kind(&self) -> &'static str {
        "healer"
    }

    fn prefix(&self) -> &'static str {
        HEALER_PREFIX
    }

    async fn build(&self, name: &str, raw: &[u8]) -> anyhow::Result<Option<Arc<dyn Worker>>> {
        let mut rule: HealerRule = serde_json::from_slice(raw)?;
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
        let healer = Healer::new(name, rule, self.kv.clone(), backend, dispatcher)?;
        Ok(Some(Arc::new(healer)))
    }
}
