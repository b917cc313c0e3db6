//! Proxy egress core.
//!
//! Drives an external WARP-style tunnel client into local SOCKS5 proxy mode,
//! redirects selected outbound TCP traffic into it through a NAT chain, and
//! scores the resulting egress path on a timer. [`EgressOrchestrator`] is the
//! single entry point that sequences these into idempotent operations.

pub mod client;
pub mod command;
pub mod error;
pub mod facade;
pub mod firewall;
pub mod health;
pub mod history;
pub mod outbound;
pub mod probe;
pub mod router;
pub mod warp;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{
    ClientOptions, ClientProbe, ClientStatus, ClientType, ProxyClientController,
    ProxyClientState, TunnelClient, DEFAULT_PROXY_PORT,
};
pub use command::{CommandOutput, CommandRunner, SystemRunner};
pub use error::{EgressError, Result};
pub use facade::{
    ConnectivityReport, EgressOrchestrator, EndpointSetupSpec, OperationResponse, SetupReport,
    SetupStage, StatusReport, TeardownReport,
};
pub use firewall::{Firewall, Iptables};
pub use health::{
    CheckKind, ComponentFlags, HealthCheckResult, HealthMonitor, HealthSettings, HealthSnapshot,
};
pub use history::HealthHistory;
pub use outbound::{JsonOutboundFile, OutboundConfigurator, OutboundProxy, OutboundSettings};
pub use probe::{FetchOutcome, HealthProbe, NetworkProbes, TraceInfo};
pub use router::{
    RoutingFailure, RoutingRequest, RoutingRule, RoutingRuleSet, RoutingSettings, RuleAction,
    RuleMatch, TrafficRouter, DEFAULT_CHAIN,
};
pub use warp::WarpCli;
