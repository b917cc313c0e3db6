//! Host configuration.
//!
//! Loaded once by the binary from `~/.proxy-egress/config.toml` and handed
//! to the core as plain structs. A missing file means defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::egress::{
    ClientOptions, ClientType, EndpointSetupSpec, HealthSettings, OutboundSettings,
    RoutingSettings, DEFAULT_PROXY_PORT,
};

pub const ENV_ENABLED: &str = "PROXY_EGRESS_ENABLED";
pub const ENV_PORT: &str = "PROXY_EGRESS_PORT";

/// `[gateway]` section: the HTTP surface for remote operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub bind: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7843".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// When false every mutating operation is refused.
    pub enabled: bool,
    pub proxy_port: u16,
    pub auto_connect: bool,
    pub client_type: ClientType,
    pub license_key: Option<String>,
    pub organization: Option<String>,
    /// Upper bound for any single external command.
    pub command_timeout_secs: u64,
    /// Upper bound for the client package installation.
    pub install_timeout_secs: u64,
    pub health: HealthSettings,
    pub routing: RoutingSettings,
    pub outbound: OutboundSettings,
    pub gateway: GatewaySettings,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            proxy_port: DEFAULT_PROXY_PORT,
            auto_connect: true,
            client_type: ClientType::Warp,
            license_key: None,
            organization: None,
            command_timeout_secs: 30,
            install_timeout_secs: 600,
            health: HealthSettings::default(),
            routing: RoutingSettings::default(),
            outbound: OutboundSettings::default(),
            gateway: GatewaySettings::default(),
        }
    }
}

/// `~/.proxy-egress/config.toml`, or `./.proxy-egress/config.toml` without a home.
pub fn default_config_path() -> PathBuf {
    directories::UserDirs::new()
        .map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf())
        .join(".proxy-egress")
        .join("config.toml")
}

impl EgressConfig {
    /// Read `path`, apply environment overrides, validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => toml::from_str::<Self>(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("config: {} not found, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PROXY_EGRESS_ENABLED` / `PROXY_EGRESS_PORT` from `lookup`.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(raw) = lookup(ENV_ENABLED) {
            self.enabled = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => bail!("{ENV_ENABLED} must be a boolean, got '{other}'"),
            };
        }
        if let Some(raw) = lookup(ENV_PORT) {
            self.proxy_port = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PORT} must be a port number, got '{raw}'"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.proxy_port == 0 {
            bail!("proxy_port must be non-zero");
        }
        if self.command_timeout_secs == 0 {
            bail!("command_timeout_secs must be non-zero");
        }
        if self.install_timeout_secs < self.command_timeout_secs {
            bail!("install_timeout_secs must be at least command_timeout_secs");
        }
        if self.routing.chain.trim().is_empty() {
            bail!("routing.chain must not be empty");
        }
        if self.routing.redirect_ports.contains(&self.proxy_port) {
            bail!(
                "routing.redirect_ports must not contain the proxy port {}",
                self.proxy_port
            );
        }
        if self.health.threshold > 100 {
            bail!("health.threshold must be at most 100");
        }
        if self.health.interval_secs == 0 || self.health.check_timeout_secs == 0 {
            bail!("health intervals must be non-zero");
        }
        if self.health.max_snapshots == 0 {
            bail!("health.max_snapshots must be non-zero");
        }
        self.client_options()
            .validate()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            proxy_port: self.proxy_port,
            auto_connect: self.auto_connect,
            client_type: self.client_type,
            license_key: self.license_key.clone(),
            organization: self.organization.clone(),
        }
    }

    /// Setup bundle callers start from before applying their own fields.
    pub fn setup_defaults(&self) -> EndpointSetupSpec {
        EndpointSetupSpec {
            auto_connect: self.auto_connect,
            enable_proxy_mode: true,
            setup_traffic_routing: self.routing.enable_on_setup,
            configure_outbound: self.outbound.config_path.is_some(),
            proxy_port: self.proxy_port,
            interface: self.routing.interface.clone(),
            redirect_ports: self.routing.redirect_ports.clone(),
            bypass_cidrs: self.routing.bypass_cidrs.clone(),
            upload_mbps: None,
            download_mbps: None,
            license_key: self.license_key.clone(),
            organization: self.organization.clone(),
            client_type: self.client_type,
        }
    }
}
