//! Health monitor for the egress path.
//!
//! Each cycle runs five checks in order (installation, connection, proxy,
//! internet, DNS), each under its own timeout, and folds them into a
//! [`HealthSnapshot`] with a 0-100 score. Installation and connection are
//! hard gates: a snapshot is only healthy when both pass and the score
//! reaches the threshold.
//!
//! The monitor only observes. It reads the controller through
//! [`ProxyClientController::status`] and never drives a transition.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::client::ProxyClientController;
use super::error::{EgressError, Result};
use super::history::{HealthHistory, DEFAULT_MAX_SNAPSHOTS};
use super::probe::{HealthProbe, CONNECTIVITY_URL, DNS_PROBE_HOST};

/// Default interval between background cycles.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Default minimum score for a healthy snapshot.
pub const DEFAULT_THRESHOLD: u8 = 70;

// ── Checks and scoring ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CheckKind {
    Installation,
    Connection,
    Proxy,
    Internet,
    Dns,
}

impl CheckKind {
    /// Execution order of a cycle.
    pub const ALL: [CheckKind; 5] = [
        Self::Installation,
        Self::Connection,
        Self::Proxy,
        Self::Internet,
        Self::Dns,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Installation => "installation",
            Self::Connection => "connection",
            Self::Proxy => "proxy",
            Self::Internet => "internet",
            Self::Dns => "dns",
        }
    }

    /// Points subtracted from 100 when this check fails.
    pub fn weight(self) -> u8 {
        match self {
            Self::Installation => 40,
            Self::Connection => 30,
            Self::Proxy => 15,
            Self::Internet => 10,
            Self::Dns => 5,
        }
    }

    /// A failed gate check makes the snapshot unhealthy at any score.
    pub fn is_gate(self) -> bool {
        matches!(self, Self::Installation | Self::Connection)
    }
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentFlags {
    pub installed: bool,
    pub connected: bool,
    pub proxy_working: bool,
    pub internet_reachable: bool,
    pub dns_working: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub overall_healthy: bool,
    pub score: u8,
    pub checks: BTreeMap<String, HealthCheckResult>,
    pub components: ComponentFlags,
}

/// 100 minus the weights of `failed`, floored at 0.
pub fn score(failed: impl IntoIterator<Item = CheckKind>) -> u8 {
    let lost: u32 = failed.into_iter().map(|k| u32::from(k.weight())).sum();
    100u32.saturating_sub(lost) as u8
}

/// Fold one cycle's results into a snapshot. A check without a result
/// counts as failed.
pub fn evaluate(results: &[(CheckKind, HealthCheckResult)], threshold: u8) -> HealthSnapshot {
    let passed = |kind: CheckKind| {
        results
            .iter()
            .any(|(k, r)| *k == kind && r.passed)
    };
    let failed = CheckKind::ALL.into_iter().filter(|k| !passed(*k));
    let score = score(failed);
    let gates_pass = CheckKind::ALL
        .into_iter()
        .filter(|k| k.is_gate())
        .all(passed);

    HealthSnapshot {
        timestamp: Utc::now(),
        overall_healthy: gates_pass && score >= threshold,
        score,
        checks: results
            .iter()
            .map(|(k, r)| (k.name().to_string(), r.clone()))
            .collect(),
        components: ComponentFlags {
            installed: passed(CheckKind::Installation),
            connected: passed(CheckKind::Connection),
            proxy_working: passed(CheckKind::Proxy),
            internet_reachable: passed(CheckKind::Internet),
            dns_working: passed(CheckKind::Dns),
        },
    }
}

// ── Settings ────────────────────────────────────────────────────────

/// Monitor tuning, also the `[health]` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interval_secs: u64,
    pub check_timeout_secs: u64,
    pub threshold: u8,
    pub retention_hours: u64,
    pub max_snapshots: usize,
    /// Fetched through the proxy by the internet check.
    pub probe_url: String,
    pub dns_host: String,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_CHECK_INTERVAL.as_secs(),
            check_timeout_secs: 10,
            threshold: DEFAULT_THRESHOLD,
            retention_hours: 24,
            max_snapshots: DEFAULT_MAX_SNAPSHOTS,
            probe_url: CONNECTIVITY_URL.to_string(),
            dns_host: DNS_PROBE_HOST.to_string(),
        }
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }
}

// ── Evaluator ───────────────────────────────────────────────────────

struct Evaluator {
    controller: Arc<ProxyClientController>,
    probes: Arc<dyn HealthProbe>,
    threshold: u8,
    check_timeout: Duration,
    probe_url: String,
    dns_host: String,
}

impl Evaluator {
    /// Run every check in order. `None` when cancelled mid-cycle.
    async fn collect(&self, token: &CancellationToken) -> Option<HealthSnapshot> {
        let mut results = Vec::with_capacity(CheckKind::ALL.len());
        for kind in CheckKind::ALL {
            if token.is_cancelled() {
                tracing::debug!("health: cycle cancelled before {kind} check");
                return None;
            }
            results.push((kind, self.run_check(kind).await));
        }
        Some(evaluate(&results, self.threshold))
    }

    async fn run_check(&self, kind: CheckKind) -> HealthCheckResult {
        let start = Instant::now();
        let outcome = match tokio::time::timeout(self.check_timeout, self.check(kind)).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err(EgressError::ProbeTimeout {
                operation: format!("{kind} check"),
                timeout_secs: self.check_timeout.as_secs(),
            }
            .to_string()),
        };
        let latency_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(message) => HealthCheckResult {
                name: kind.name().to_string(),
                passed: true,
                message,
                latency_ms,
            },
            Err(message) => {
                tracing::debug!("health: {kind} check failed: {message}");
                HealthCheckResult {
                    name: kind.name().to_string(),
                    passed: false,
                    message,
                    latency_ms,
                }
            }
        }
    }

    async fn check(&self, kind: CheckKind) -> anyhow::Result<String> {
        let port = self.controller.options().proxy_port;
        match kind {
            CheckKind::Installation => {
                if !self.controller.is_installed().await {
                    bail!("{} is not installed", self.controller.client_name());
                }
                Ok(format!("{} is installed", self.controller.client_name()))
            }
            CheckKind::Connection => {
                let status = self.controller.status().await;
                if !status.state.is_connected() {
                    match status.reason {
                        Some(reason) => bail!("client is {}: {reason}", status.state),
                        None => bail!("client is {}", status.state),
                    }
                }
                Ok(format!("client is {}", status.state))
            }
            CheckKind::Proxy => {
                self.probes.socks_handshake(port).await?;
                Ok(format!("SOCKS5 proxy answering on port {port}"))
            }
            CheckKind::Internet => {
                let outcome = self.probes.fetch(Some(port), &self.probe_url).await?;
                if !outcome.is_success() {
                    bail!("{} returned HTTP {}", self.probe_url, outcome.status);
                }
                Ok(format!("{} returned HTTP {}", self.probe_url, outcome.status))
            }
            CheckKind::Dns => {
                let addrs = self.probes.resolve(&self.dns_host).await?;
                Ok(format!("{} resolved to {} address(es)", self.dns_host, addrs.len()))
            }
        }
    }
}

// ── Monitor ─────────────────────────────────────────────────────────

struct Shared {
    history: HealthHistory,
}

struct MonitorTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct HealthMonitor {
    evaluator: Arc<Evaluator>,
    interval: Duration,
    shared: Arc<Mutex<Shared>>,
    task: Mutex<Option<MonitorTask>>,
}

impl HealthMonitor {
    pub fn new(
        controller: Arc<ProxyClientController>,
        probes: Arc<dyn HealthProbe>,
        settings: &HealthSettings,
    ) -> Self {
        let evaluator = Evaluator {
            controller,
            probes,
            threshold: settings.threshold,
            check_timeout: settings.check_timeout(),
            probe_url: settings.probe_url.clone(),
            dns_host: settings.dns_host.clone(),
        };
        Self {
            evaluator: Arc::new(evaluator),
            interval: settings.interval(),
            shared: Arc::new(Mutex::new(Shared {
                history: HealthHistory::new(settings.retention(), settings.max_snapshots),
            })),
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Spawn the periodic loop. The first cycle runs immediately.
    ///
    /// The loop stops when `parent` or [`HealthMonitor::stop`] cancels it.
    pub fn start(&self, parent: &CancellationToken) -> Result<()> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Err(EgressError::AlreadyRunning);
        }

        let token = parent.child_token();
        let loop_token = token.clone();
        let evaluator = self.evaluator.clone();
        let shared = self.shared.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => {
                        tracing::debug!("health: monitor loop cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Some(snapshot) = evaluator.collect(&loop_token).await {
                            record(&shared, snapshot);
                        }
                    }
                }
            }
        });

        tracing::info!("health: monitor started (interval {}s)", interval.as_secs());
        *task = Some(MonitorTask { token, handle });
        Ok(())
    }

    /// Cancel the loop and wait for the in-flight cycle. Stopped is a no-op.
    pub async fn stop(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };
        task.token.cancel();
        if let Err(e) = task.handle.await {
            tracing::warn!("health: monitor task ended abnormally: {e}");
        }
        tracing::info!("health: monitor stopped");
    }

    /// Run one cycle now and record it.
    pub async fn run_health_check(&self) -> HealthSnapshot {
        let token = CancellationToken::new();
        let snapshot = match self.evaluator.collect(&token).await {
            Some(snapshot) => snapshot,
            None => evaluate(&[], self.evaluator.threshold),
        };
        record(&self.shared, snapshot.clone());
        snapshot
    }

    /// Last recorded snapshot; never runs checks.
    pub fn current_status(&self) -> Option<HealthSnapshot> {
        self.shared.lock().history.latest().cloned()
    }

    /// Retained snapshots from the trailing `window`, oldest first.
    pub fn historical_data(&self, window: Duration) -> Vec<HealthSnapshot> {
        self.shared.lock().history.within(window, Utc::now())
    }
}

fn record(shared: &Mutex<Shared>, snapshot: HealthSnapshot) {
    if !snapshot.overall_healthy {
        tracing::warn!("health: egress unhealthy (score {})", snapshot.score);
    }
    shared.lock().history.push(snapshot);
}
