//! Proxy client lifecycle controller.
//!
//! The tunnel client is a black box reached through the [`TunnelClient`]
//! capability trait. [`ProxyClientController`] owns the in-memory
//! [`ProxyClientState`] and reconciles it against a fresh probe on every
//! mutating call, because the client may be restarted or reconfigured
//! outside this process.
//!
//! # Lifecycle
//! ```text
//! NotInstalled → Installed → Registered → Connected → ProxyModeEnabled
//!                                  ↑          ↓
//!                                  └── Disconnected
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::error::{EgressError, Result};
use super::probe::TraceInfo;

/// Default local SOCKS5 port of the WARP client in proxy mode.
pub const DEFAULT_PROXY_PORT: u16 = 40000;

// ── State and options ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyClientState {
    NotInstalled,
    Installed,
    Registered,
    Connected,
    Disconnected,
    ProxyModeEnabled,
    Failed,
}

impl ProxyClientState {
    /// Whether the tunnel is up (plain or in proxy mode).
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::ProxyModeEnabled)
    }
}

impl std::fmt::Display for ProxyClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotInstalled => "not_installed",
            Self::Installed => "installed",
            Self::Registered => "registered",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::ProxyModeEnabled => "proxy_mode_enabled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Account flavour the client registers with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    #[default]
    Warp,
    /// Requires a license key.
    WarpPlus,
    /// Managed fleet enrollment; requires an organization.
    Teams,
}

/// Local client settings applied by [`ProxyClientController::configure`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub proxy_port: u16,
    pub auto_connect: bool,
    pub client_type: ClientType,
    pub license_key: Option<String>,
    pub organization: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            proxy_port: DEFAULT_PROXY_PORT,
            auto_connect: true,
            client_type: ClientType::Warp,
            license_key: None,
            organization: None,
        }
    }
}

impl ClientOptions {
    pub fn validate(&self) -> Result<()> {
        if self.proxy_port == 0 {
            return Err(EgressError::Configuration(
                "proxy_port must be non-zero".into(),
            ));
        }
        let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
        match self.client_type {
            ClientType::WarpPlus if blank(&self.license_key) => Err(EgressError::Configuration(
                "client_type warp_plus requires a license_key".into(),
            )),
            ClientType::Teams if blank(&self.organization) => Err(EgressError::Configuration(
                "client_type teams requires an organization".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Raw observation of the client, as reported by its own tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientProbe {
    pub installed: bool,
    pub registered: bool,
    pub connected: bool,
    pub proxy_mode: bool,
    pub proxy_port: Option<u16>,
    /// Client's own status text, kept for diagnostics.
    pub detail: String,
}

/// Result of [`ProxyClientController::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStatus {
    pub state: ProxyClientState,
    pub proxy_port: Option<u16>,
    pub external_ip: Option<String>,
    pub location: Option<String>,
    pub reason: Option<String>,
}

/// Map a probe onto the state machine.
///
/// A registered-but-down client is `Disconnected` if it was previously up,
/// otherwise `Registered`.
pub fn derive_state(probe: &ClientProbe, previous: ProxyClientState) -> ProxyClientState {
    if !probe.installed {
        return ProxyClientState::NotInstalled;
    }
    if !probe.registered {
        return ProxyClientState::Installed;
    }
    match (probe.connected, probe.proxy_mode) {
        (true, true) => ProxyClientState::ProxyModeEnabled,
        (true, false) => ProxyClientState::Connected,
        (false, _) => match previous {
            ProxyClientState::Connected
            | ProxyClientState::ProxyModeEnabled
            | ProxyClientState::Disconnected => ProxyClientState::Disconnected,
            _ => ProxyClientState::Registered,
        },
    }
}

// ── Capability interface ────────────────────────────────────────────

/// Capability interface of the external tunnel client.
#[async_trait]
pub trait TunnelClient: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap check, safe to call frequently.
    async fn is_installed(&self) -> bool;

    async fn install(&self) -> Result<()>;

    async fn configure(&self, options: &ClientOptions) -> Result<()>;

    async fn register(&self, options: &ClientOptions) -> Result<()>;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn enable_proxy_mode(&self, port: u16) -> Result<()>;

    async fn disable_proxy_mode(&self) -> Result<()>;

    async fn probe(&self) -> Result<ClientProbe>;

    /// Egress identity seen through the proxy, if reachable.
    async fn trace(&self, proxy_port: u16) -> Option<TraceInfo>;
}

// ── Controller ──────────────────────────────────────────────────────

pub struct ProxyClientController {
    client: Arc<dyn TunnelClient>,
    state: Mutex<ProxyClientState>,
    options: Mutex<ClientOptions>,
    connect_attempts: u32,
    connect_interval: Duration,
}

impl ProxyClientController {
    pub fn new(client: Arc<dyn TunnelClient>, options: ClientOptions) -> Self {
        Self {
            client,
            state: Mutex::new(ProxyClientState::NotInstalled),
            options: Mutex::new(options),
            connect_attempts: 10,
            connect_interval: Duration::from_secs(1),
        }
    }

    /// Override how long `connect` waits for the client to report connected.
    pub fn with_connect_poll(mut self, attempts: u32, interval: Duration) -> Self {
        self.connect_attempts = attempts.max(1);
        self.connect_interval = interval;
        self
    }

    /// Last state set by a transition method.
    pub fn state(&self) -> ProxyClientState {
        *self.state.lock()
    }

    pub fn options(&self) -> ClientOptions {
        self.options.lock().clone()
    }

    pub fn client_name(&self) -> &str {
        self.client.name()
    }

    fn set_state(&self, next: ProxyClientState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::info!("egress: client state {} -> {next}", *state);
            *state = next;
        }
    }

    fn reconcile_with(&self, probe: &ClientProbe) -> ProxyClientState {
        let next = derive_state(probe, self.state());
        self.set_state(next);
        next
    }

    /// Re-derive the cached state from a fresh probe (used at startup).
    pub async fn reconcile(&self) -> ProxyClientState {
        match self.client.probe().await {
            Ok(probe) => self.reconcile_with(&probe),
            Err(e) => {
                tracing::warn!("egress: client probe failed during reconcile: {e}");
                self.set_state(ProxyClientState::Failed);
                ProxyClientState::Failed
            }
        }
    }

    pub async fn is_installed(&self) -> bool {
        self.client.is_installed().await
    }

    /// Install the client unless it is already present.
    pub async fn ensure_installed(&self) -> Result<()> {
        if self.client.is_installed().await {
            if matches!(
                self.state(),
                ProxyClientState::NotInstalled | ProxyClientState::Failed
            ) {
                self.reconcile().await;
            }
            return Ok(());
        }

        tracing::info!("egress: installing {}", self.client.name());
        self.client.install().await.map_err(|e| match e {
            EgressError::Installation(_) => e,
            other => EgressError::Installation(other.to_string()),
        })?;

        if !self.client.is_installed().await {
            return Err(EgressError::Installation(format!(
                "installer finished but {} is still missing",
                self.client.name()
            )));
        }
        self.set_state(ProxyClientState::Installed);
        Ok(())
    }

    /// Apply local client settings.
    pub async fn configure(&self, options: ClientOptions) -> Result<()> {
        options.validate()?;
        if !self.client.is_installed().await {
            return Err(EgressError::Configuration(format!(
                "{} is not installed",
                self.client.name()
            )));
        }
        self.client.configure(&options).await.map_err(|e| match e {
            EgressError::Configuration(_) => e,
            other => EgressError::Configuration(other.to_string()),
        })?;
        *self.options.lock() = options;
        Ok(())
    }

    /// Register if needed, then connect. Already connected is success.
    pub async fn connect(&self) -> Result<ProxyClientState> {
        let probe = self.client.probe().await.map_err(connection_error)?;
        if !probe.installed {
            self.set_state(ProxyClientState::NotInstalled);
            return Err(EgressError::Connection(format!(
                "{} is not installed",
                self.client.name()
            )));
        }

        if !probe.registered {
            let options = self.options();
            self.client
                .register(&options)
                .await
                .map_err(connection_error)?;
            self.set_state(ProxyClientState::Registered);
        }

        if probe.connected {
            tracing::debug!("egress: client already connected");
            return Ok(self.reconcile_with(&probe));
        }

        self.client.connect().await.map_err(connection_error)?;

        let mut last_detail = String::new();
        for attempt in 1..=self.connect_attempts {
            let probe = self.client.probe().await.map_err(connection_error)?;
            if probe.connected {
                return Ok(self.reconcile_with(&probe));
            }
            last_detail = probe.detail;
            if attempt < self.connect_attempts {
                tokio::time::sleep(self.connect_interval).await;
            }
        }

        self.set_state(ProxyClientState::Disconnected);
        Err(EgressError::Connection(format!(
            "client did not report connected after {} checks: {last_detail}",
            self.connect_attempts
        )))
    }

    /// Switch the client into local SOCKS5 proxy mode on `port`.
    pub async fn enable_proxy_mode(&self, port: u16) -> Result<()> {
        if port == 0 {
            return Err(EgressError::ProxyMode("port must be non-zero".into()));
        }
        let probe = self.client.probe().await.map_err(proxy_mode_error)?;
        let current = self.reconcile_with(&probe);
        if !probe.connected {
            return Err(EgressError::ProxyMode(format!(
                "client must be connected before enabling proxy mode (state: {current})"
            )));
        }
        if probe.proxy_mode && probe.proxy_port == Some(port) {
            tracing::debug!("egress: proxy mode already active on port {port}");
            return Ok(());
        }
        if port_in_use(port).await {
            return Err(EgressError::ProxyMode(format!(
                "port {port} is already bound by another process"
            )));
        }

        self.client
            .enable_proxy_mode(port)
            .await
            .map_err(proxy_mode_error)?;

        let probe = self.client.probe().await.map_err(proxy_mode_error)?;
        if !probe.proxy_mode {
            self.reconcile_with(&probe);
            return Err(EgressError::ProxyMode(format!(
                "client did not enter proxy mode: {}",
                probe.detail
            )));
        }
        self.options.lock().proxy_port = port;
        self.reconcile_with(&probe);
        Ok(())
    }

    /// Return to full-tunnel mode. Not being in proxy mode is success.
    pub async fn disable_proxy_mode(&self) -> Result<()> {
        let probe = self.client.probe().await.map_err(proxy_mode_error)?;
        if !probe.proxy_mode {
            self.reconcile_with(&probe);
            return Ok(());
        }
        self.client
            .disable_proxy_mode()
            .await
            .map_err(proxy_mode_error)?;
        let probe = self.client.probe().await.map_err(proxy_mode_error)?;
        self.reconcile_with(&probe);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        let probe = self.client.probe().await.map_err(connection_error)?;
        if !probe.connected {
            self.reconcile_with(&probe);
            return Ok(());
        }
        self.client.disconnect().await.map_err(connection_error)?;
        self.set_state(ProxyClientState::Disconnected);
        Ok(())
    }

    /// Observe the client without changing the cached state.
    ///
    /// Never fails: a probe error is reported as `Failed` with a reason.
    pub async fn status(&self) -> ClientStatus {
        let probe = match self.client.probe().await {
            Ok(probe) => probe,
            Err(e) => {
                return ClientStatus {
                    state: ProxyClientState::Failed,
                    proxy_port: None,
                    external_ip: None,
                    location: None,
                    reason: Some(e.to_string()),
                }
            }
        };

        let state = derive_state(&probe, self.state());
        let trace = match (state, probe.proxy_port) {
            (ProxyClientState::ProxyModeEnabled, Some(port)) => self.client.trace(port).await,
            _ => None,
        };
        ClientStatus {
            state,
            proxy_port: probe.proxy_port,
            external_ip: trace.as_ref().map(|t| t.ip.clone()),
            location: trace.and_then(|t| t.location),
            reason: (!probe.detail.is_empty() && !state.is_connected())
                .then(|| probe.detail.clone()),
        }
    }
}

fn connection_error(e: EgressError) -> EgressError {
    match e {
        EgressError::Connection(_) => e,
        other => EgressError::Connection(other.to_string()),
    }
}

fn proxy_mode_error(e: EgressError) -> EgressError {
    match e {
        EgressError::ProxyMode(_) => e,
        other => EgressError::ProxyMode(other.to_string()),
    }
}

async fn port_in_use(port: u16) -> bool {
    tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .is_err()
}
