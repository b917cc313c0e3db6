//! Error taxonomy for the egress core.
//!
//! Controller and router failures propagate to the orchestration facade as
//! `EgressError`; the facade turns them into structured reports.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EgressError {
    #[error("installation failed: {0}")]
    Installation(String),

    #[error("configuration rejected: {0}")]
    Configuration(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("proxy mode failed: {0}")]
    ProxyMode(String),

    #[error("routing failed at rule '{rule}': {reason}")]
    Routing { rule: String, reason: String },

    #[error("'{operation}' timed out after {timeout_secs}s")]
    ProbeTimeout {
        operation: String,
        timeout_secs: u64,
    },

    #[error("health monitor is already running")]
    AlreadyRunning,

    #[error("another egress operation is in progress")]
    OperationInProgress,

    #[error("proxy egress is disabled in the host configuration")]
    Disabled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EgressError {
    /// Build a routing error that is not tied to a specific rule.
    pub fn routing(reason: impl Into<String>) -> Self {
        Self::Routing {
            rule: "-".to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ProbeTimeout { .. } | Self::OperationInProgress
        )
    }

    /// Stable snake_case name used in remote responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Installation(_) => "installation_error",
            Self::Configuration(_) => "configuration_error",
            Self::Connection(_) => "connection_error",
            Self::ProxyMode(_) => "proxy_mode_error",
            Self::Routing { .. } => "routing_error",
            Self::ProbeTimeout { .. } => "probe_timeout_error",
            Self::AlreadyRunning => "already_running_error",
            Self::OperationInProgress => "operation_in_progress",
            Self::Disabled => "disabled",
            Self::Io(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, EgressError>;
