//! Orchestration facade.
//!
//! Sequences the controller, router and outbound hand-off into endpoint
//! setup and teardown, and exposes the individual steps. Mutating calls are
//! serialized per node: a call that finds another one in flight fails fast
//! with [`EgressError::OperationInProgress`] instead of queueing.
//!
//! Rollback policy: only firewall state is undone on a failed setup. A
//! working client connection is left alone.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use super::client::{
    ClientOptions, ClientStatus, ClientType, ProxyClientController, ProxyClientState,
    DEFAULT_PROXY_PORT,
};
use super::error::{EgressError, Result};
use super::health::{HealthMonitor, HealthSettings, HealthSnapshot};
use super::outbound::{OutboundConfigurator, OutboundProxy};
use super::probe::{parse_trace, HealthProbe, TRACE_URL};
use super::router::{RoutingRequest, RoutingRuleSet, TrafficRouter};

// ── Requests and reports ────────────────────────────────────────────

/// Caller bundle for [`EgressOrchestrator::setup_endpoint`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSetupSpec {
    pub auto_connect: bool,
    pub enable_proxy_mode: bool,
    pub setup_traffic_routing: bool,
    pub configure_outbound: bool,
    pub proxy_port: u16,
    pub interface: Option<String>,
    pub redirect_ports: Vec<u16>,
    pub bypass_cidrs: Vec<String>,
    pub upload_mbps: Option<u32>,
    pub download_mbps: Option<u32>,
    pub license_key: Option<String>,
    pub organization: Option<String>,
    pub client_type: ClientType,
}

impl Default for EndpointSetupSpec {
    fn default() -> Self {
        Self {
            auto_connect: true,
            enable_proxy_mode: true,
            setup_traffic_routing: false,
            configure_outbound: false,
            proxy_port: DEFAULT_PROXY_PORT,
            interface: None,
            redirect_ports: vec![80, 443],
            bypass_cidrs: Vec::new(),
            upload_mbps: None,
            download_mbps: None,
            license_key: None,
            organization: None,
            client_type: ClientType::Warp,
        }
    }
}

impl EndpointSetupSpec {
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            proxy_port: self.proxy_port,
            auto_connect: self.auto_connect,
            client_type: self.client_type,
            license_key: self.license_key.clone(),
            organization: self.organization.clone(),
        }
    }

    pub fn routing_request(&self) -> RoutingRequest {
        RoutingRequest {
            interface: self.interface.clone(),
            bypass_cidrs: self.bypass_cidrs.clone(),
            redirect_ports: self.redirect_ports.clone(),
            proxy_port: self.proxy_port,
        }
    }

    pub fn outbound_proxy(&self) -> OutboundProxy {
        OutboundProxy {
            up_mbps: self.upload_mbps,
            down_mbps: self.download_mbps,
            ..OutboundProxy::local(self.proxy_port)
        }
    }

    /// Whether any stage after connect needs a live tunnel.
    fn needs_connection(&self) -> bool {
        self.enable_proxy_mode || self.setup_traffic_routing || self.configure_outbound
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStage {
    Install,
    Configure,
    Connect,
    ProxyMode,
    Routing,
    Outbound,
}

impl std::fmt::Display for SetupStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Install => "install",
            Self::Configure => "configure",
            Self::Connect => "connect",
            Self::ProxyMode => "proxy_mode",
            Self::Routing => "routing",
            Self::Outbound => "outbound",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupReport {
    pub success: bool,
    pub message: String,
    pub failed_stage: Option<SetupStage>,
    pub error_kind: Option<String>,
    pub completed_stages: Vec<SetupStage>,
    pub rolled_back: bool,
    /// Routing is active while the client is not connected.
    pub degraded: bool,
    pub client_state: ProxyClientState,
    pub routing_active: bool,
    pub rules: Option<RoutingRuleSet>,
}

impl SetupReport {
    fn new() -> Self {
        Self {
            success: false,
            message: String::new(),
            failed_stage: None,
            error_kind: None,
            completed_stages: Vec::new(),
            rolled_back: false,
            degraded: false,
            client_state: ProxyClientState::NotInstalled,
            routing_active: false,
            rules: None,
        }
    }

    fn rejected(err: &EgressError) -> Self {
        Self {
            message: err.to_string(),
            error_kind: Some(err.kind().to_string()),
            ..Self::new()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageOutcome {
    pub stage: String,
    pub success: bool,
    /// The stage was not attempted.
    pub skipped: bool,
    pub message: String,
}

impl StageOutcome {
    fn skipped(stage: &str, message: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            success: false,
            skipped: true,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub success: bool,
    pub message: String,
    pub stages: Vec<StageOutcome>,
    pub client_state: ProxyClientState,
    pub routing_active: bool,
    /// Routing is still active while the client is not connected.
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub enabled: bool,
    pub client: ClientStatus,
    pub routing_active: bool,
    pub rules: Option<RoutingRuleSet>,
    pub monitoring: bool,
    /// Last recorded snapshot; reading it never runs checks.
    pub health: Option<HealthSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectivityReport {
    pub success: bool,
    pub tests: BTreeMap<String, bool>,
    pub messages: BTreeMap<String, String>,
}

/// Uniform response shape of every remote operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl OperationResponse {
    pub fn ok(message: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    pub fn failed(message: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    pub fn from_error(err: &EgressError) -> Self {
        Self::failed(
            err.to_string(),
            serde_json::json!({
                "error_kind": err.kind(),
                "retryable": err.is_retryable(),
            }),
        )
    }
}

// ── Orchestrator ────────────────────────────────────────────────────

pub struct EgressOrchestrator {
    enabled: bool,
    controller: Arc<ProxyClientController>,
    router: Arc<TrafficRouter>,
    monitor: Arc<HealthMonitor>,
    probes: Arc<dyn HealthProbe>,
    outbound: Option<Arc<dyn OutboundConfigurator>>,
    health: HealthSettings,
    shutdown: CancellationToken,
    op_lock: Mutex<()>,
}

impl EgressOrchestrator {
    pub fn new(
        controller: Arc<ProxyClientController>,
        router: Arc<TrafficRouter>,
        probes: Arc<dyn HealthProbe>,
        health: HealthSettings,
    ) -> Self {
        let monitor = Arc::new(HealthMonitor::new(
            controller.clone(),
            probes.clone(),
            &health,
        ));
        Self {
            enabled: true,
            controller,
            router,
            monitor,
            probes,
            outbound: None,
            health,
            shutdown: CancellationToken::new(),
            op_lock: Mutex::new(()),
        }
    }

    pub fn with_outbound(mut self, outbound: Arc<dyn OutboundConfigurator>) -> Self {
        self.outbound = Some(outbound);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Token whose cancellation also stops the health monitor.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn controller(&self) -> &Arc<ProxyClientController> {
        &self.controller
    }

    pub fn router(&self) -> &Arc<TrafficRouter> {
        &self.router
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    fn acquire(&self) -> Result<MutexGuard<'_, ()>> {
        if !self.enabled {
            return Err(EgressError::Disabled);
        }
        self.op_lock
            .try_lock()
            .map_err(|_| EgressError::OperationInProgress)
    }

    // ── Individual operations ───────────────────────────────────────

    pub async fn install_client(&self) -> Result<ProxyClientState> {
        let _guard = self.acquire()?;
        self.controller.ensure_installed().await?;
        Ok(self.controller.state())
    }

    pub async fn configure(&self, options: ClientOptions) -> Result<()> {
        let _guard = self.acquire()?;
        self.controller.configure(options).await
    }

    pub async fn connect(&self) -> Result<ProxyClientState> {
        let _guard = self.acquire()?;
        self.controller.connect().await
    }

    pub async fn enable_proxy_mode(&self, port: u16) -> Result<ProxyClientState> {
        let _guard = self.acquire()?;
        self.controller.enable_proxy_mode(port).await?;
        Ok(self.controller.state())
    }

    /// Program the routing chain against the freshly observed client state.
    pub async fn enable_routing(&self, request: &RoutingRequest) -> Result<RoutingRuleSet> {
        let _guard = self.acquire()?;
        let state = self.controller.reconcile().await;
        self.router.enable_routing(request, state).await
    }

    pub async fn disable_routing(&self) -> Result<()> {
        let _guard = self.acquire()?;
        self.router.disable_routing().await
    }

    pub fn start_monitoring(&self) -> Result<()> {
        if !self.enabled {
            return Err(EgressError::Disabled);
        }
        self.monitor.start(&self.shutdown)
    }

    pub async fn stop_monitoring(&self) {
        self.monitor.stop().await;
    }

    pub async fn run_health_check(&self) -> HealthSnapshot {
        self.monitor.run_health_check().await
    }

    pub fn historical_data(&self, window: Duration) -> Vec<HealthSnapshot> {
        self.monitor.historical_data(window)
    }

    pub async fn status(&self) -> StatusReport {
        StatusReport {
            enabled: self.enabled,
            client: self.controller.status().await,
            routing_active: self.router.is_routing_active().await,
            rules: self.router.current(),
            monitoring: self.monitor.is_running(),
            health: self.monitor.current_status(),
        }
    }

    // ── Composite operations ────────────────────────────────────────

    /// Bring client, proxy mode, routing and outbound into a working state.
    ///
    /// Never fails outright: the report names the failed stage, whether
    /// firewall state was rolled back, and whether the result is degraded.
    pub async fn setup_endpoint(&self, spec: &EndpointSetupSpec) -> SetupReport {
        let _guard = match self.acquire() {
            Ok(guard) => guard,
            Err(e) => return SetupReport::rejected(&e),
        };
        tracing::info!("egress: endpoint setup started (port {})", spec.proxy_port);

        let mut report = SetupReport::new();
        if let Err((stage, e)) = self.run_setup(spec, &mut report).await {
            tracing::warn!("egress: endpoint setup failed at {stage}: {e}");
            report.failed_stage = Some(stage);
            report.error_kind = Some(e.kind().to_string());
            report.message = format!("{stage} stage failed: {e}");
        }

        report.client_state = self.controller.reconcile().await;
        report.routing_active = self.router.is_routing_active().await;
        report.rules = self.router.current();
        report.degraded = report.routing_active && !report.client_state.is_connected();

        if report.failed_stage.is_none() {
            if report.degraded {
                report.message = format!(
                    "routing is active but the client is {}; traffic is not protected",
                    report.client_state
                );
            } else {
                report.success = true;
                report.message = format!(
                    "endpoint ready: client {}, routing {}",
                    report.client_state,
                    if report.routing_active { "active" } else { "inactive" }
                );
            }
        }
        tracing::info!("egress: endpoint setup finished: {}", report.message);
        report
    }

    async fn run_setup(
        &self,
        spec: &EndpointSetupSpec,
        report: &mut SetupReport,
    ) -> std::result::Result<(), (SetupStage, EgressError)> {
        let at = |stage: SetupStage| move |e: EgressError| (stage, e);

        self.controller
            .ensure_installed()
            .await
            .map_err(at(SetupStage::Install))?;
        report.completed_stages.push(SetupStage::Install);

        self.controller
            .configure(spec.client_options())
            .await
            .map_err(at(SetupStage::Configure))?;
        report.completed_stages.push(SetupStage::Configure);

        if spec.auto_connect {
            self.controller
                .connect()
                .await
                .map_err(at(SetupStage::Connect))?;
        } else {
            let state = self.controller.reconcile().await;
            if spec.needs_connection() && !state.is_connected() {
                return Err((
                    SetupStage::Connect,
                    EgressError::Connection(format!(
                        "auto_connect is off and the client is {state}"
                    )),
                ));
            }
        }
        report.completed_stages.push(SetupStage::Connect);

        if spec.enable_proxy_mode {
            self.controller
                .enable_proxy_mode(spec.proxy_port)
                .await
                .map_err(at(SetupStage::ProxyMode))?;
            report.completed_stages.push(SetupStage::ProxyMode);
        }

        let mut routed_here = false;
        if spec.setup_traffic_routing {
            let state = self.controller.reconcile().await;
            if let Err(failure) = self
                .router
                .apply_routing(&spec.routing_request(), state)
                .await
            {
                report.rolled_back = failure.rolled_back;
                return Err((SetupStage::Routing, failure.error));
            }
            routed_here = true;
            report.completed_stages.push(SetupStage::Routing);
        }

        if spec.configure_outbound {
            let result = match &self.outbound {
                Some(outbound) => outbound.apply_proxy(&spec.outbound_proxy()).await,
                None => Err(EgressError::Configuration(
                    "no outbound service config is set".into(),
                )),
            };
            if let Err(e) = result {
                if routed_here {
                    match self.router.disable_routing().await {
                        Ok(()) => report.rolled_back = true,
                        Err(re) => tracing::warn!("egress: routing rollback failed: {re}"),
                    }
                }
                return Err((SetupStage::Outbound, e));
            }
            report.completed_stages.push(SetupStage::Outbound);
        }
        Ok(())
    }

    /// Undo setup. Every stage runs even when an earlier one fails, except
    /// that the tunnel is never disconnected while the chain is still hooked.
    pub async fn teardown_endpoint(&self, disconnect: bool) -> TeardownReport {
        let _guard = match self.acquire() {
            Ok(guard) => guard,
            Err(e) => {
                let client_state = self.controller.state();
                let routing_active = self.router.is_routing_active().await;
                return TeardownReport {
                    success: false,
                    message: e.to_string(),
                    stages: Vec::new(),
                    degraded: routing_active && !client_state.is_connected(),
                    client_state,
                    routing_active,
                };
            }
        };

        let mut stages = Vec::with_capacity(4);
        stages.push(outcome("disable_routing", self.router.disable_routing().await));
        if let Some(outbound) = &self.outbound {
            stages.push(outcome("clear_outbound", outbound.clear_proxy().await));
        }
        stages.push(outcome(
            "disable_proxy_mode",
            self.controller.disable_proxy_mode().await,
        ));
        if disconnect {
            if self.router.is_routing_active().await {
                tracing::warn!(
                    "egress: chain {} still hooked, keeping the tunnel up",
                    self.router.chain()
                );
                stages.push(StageOutcome::skipped(
                    "disconnect",
                    format!(
                        "chain {} is still hooked; traffic would be redirected without a tunnel",
                        self.router.chain()
                    ),
                ));
            } else {
                stages.push(outcome("disconnect", self.controller.disconnect().await));
            }
        }

        let names = |pick: fn(&StageOutcome) -> bool| {
            stages
                .iter()
                .filter(|s| pick(s))
                .map(|s| s.stage.as_str())
                .collect::<Vec<_>>()
        };
        let failed = names(|s| !s.success && !s.skipped);
        let skipped = names(|s| s.skipped);
        let mut problems = Vec::new();
        if !failed.is_empty() {
            problems.push(format!("{} failed", failed.join(", ")));
        }
        if !skipped.is_empty() {
            problems.push(format!("{} skipped", skipped.join(", ")));
        }
        let message = if problems.is_empty() {
            "endpoint torn down".to_string()
        } else {
            format!("teardown incomplete: {}", problems.join("; "))
        };
        tracing::info!("egress: {message}");

        let client_state = self.controller.reconcile().await;
        let routing_active = self.router.is_routing_active().await;
        TeardownReport {
            success: problems.is_empty(),
            message,
            degraded: routing_active && !client_state.is_connected(),
            client_state,
            routing_active,
            stages,
        }
    }

    /// One-shot probe battery, independent of the monitor's cycle.
    pub async fn test_connectivity(&self) -> ConnectivityReport {
        let port = self.controller.options().proxy_port;
        let timeout = self.health.check_timeout();
        let mut tests = BTreeMap::new();
        let mut messages = BTreeMap::new();
        let mut put = |name: &str, result: std::result::Result<String, String>| {
            let passed = result.is_ok();
            let message = match result {
                Ok(m) | Err(m) => m,
            };
            tests.insert(name.to_string(), passed);
            messages.insert(name.to_string(), message);
        };

        let status = self.controller.status().await;
        put(
            "client_connected",
            if status.state.is_connected() {
                Ok(format!("client is {}", status.state))
            } else {
                Err(format!("client is {}", status.state))
            },
        );

        put(
            "proxy_port_open",
            bounded(timeout, self.probes.tcp_connect(port))
                .await
                .map(|_| format!("127.0.0.1:{port} accepts connections")),
        );
        put(
            "socks_handshake",
            bounded(timeout, self.probes.socks_handshake(port))
                .await
                .map(|_| "SOCKS5 no-auth greeting accepted".to_string()),
        );
        put(
            "http_through_proxy",
            bounded(timeout, self.probes.fetch(Some(port), &self.health.probe_url))
                .await
                .and_then(|o| {
                    if o.is_success() {
                        Ok(format!("HTTP {}", o.status))
                    } else {
                        Err(format!("HTTP {}", o.status))
                    }
                }),
        );
        put(
            "warp_trace",
            bounded(timeout, self.probes.fetch(Some(port), TRACE_URL))
                .await
                .and_then(|o| match parse_trace(&o.body) {
                    Some(t) if t.warp => Ok(format!("egress {} via WARP", t.ip)),
                    Some(t) => Err(format!("egress {} is not via WARP", t.ip)),
                    None => Err("trace response had no ip field".to_string()),
                }),
        );
        put(
            "dns",
            bounded(timeout, self.probes.resolve(&self.health.dns_host))
                .await
                .map(|ips| format!("{} resolved to {} address(es)", self.health.dns_host, ips.len())),
        );

        if self.router.current().is_some() {
            let active = self.router.is_routing_active().await;
            put(
                "routing_chain",
                if active {
                    Ok(format!("chain {} hooked", self.router.chain()))
                } else {
                    Err(format!("chain {} missing", self.router.chain()))
                },
            );
        }

        ConnectivityReport {
            success: tests.values().all(|passed| *passed),
            tests,
            messages,
        }
    }
}

fn outcome(stage: &str, result: Result<()>) -> StageOutcome {
    match result {
        Ok(()) => StageOutcome {
            stage: stage.to_string(),
            success: true,
            skipped: false,
            message: "ok".to_string(),
        },
        Err(e) => {
            tracing::warn!("egress: teardown stage {stage} failed: {e}");
            StageOutcome {
                stage: stage.to_string(),
                success: false,
                skipped: false,
                message: e.to_string(),
            }
        }
    }
}

async fn bounded<T>(
    timeout: Duration,
    probe: impl std::future::Future<Output = anyhow::Result<T>>,
) -> std::result::Result<T, String> {
    match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(_) => Err(format!("timed out after {}s", timeout.as_secs())),
    }
}
