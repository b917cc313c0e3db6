//! Per-node proxy egress agent.
//!
//! [`egress`] holds the core: tunnel client controller, NAT traffic router,
//! health monitor and the orchestration facade. [`tools`] and [`gateway`]
//! expose the facade as remote operations; [`config`] is the host
//! configuration the binary loads.

pub mod config;
pub mod egress;
pub mod gateway;
pub mod tools;

pub use config::EgressConfig;
pub use egress::{EgressError, EgressOrchestrator};
