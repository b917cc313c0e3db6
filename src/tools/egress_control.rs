//! Remote operation surface for the egress core.
//!
//! Every action answers with an [`OperationResponse`]
//! (`{success, message, data}`); failures never escape as bare errors.
//! Arguments for setup, routing and configure are overlaid on the host
//! defaults, so callers only send the fields they want to change.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use super::traits::{Tool, ToolResult};
use crate::egress::{EgressError, EgressOrchestrator, EndpointSetupSpec, OperationResponse};

pub const ACTIONS: [&str; 14] = [
    "install_client",
    "configure",
    "connect",
    "enable_proxy_mode",
    "enable_routing",
    "disable_routing",
    "setup_full_endpoint",
    "teardown_endpoint",
    "get_status",
    "run_health_check",
    "test_connectivity",
    "get_historical_data",
    "start_monitoring",
    "stop_monitoring",
];

/// Longest window `get_historical_data` accepts.
const MAX_HISTORY_HOURS: f64 = 24.0 * 7.0;

pub struct EgressControlTool {
    egress: Arc<EgressOrchestrator>,
    defaults: EndpointSetupSpec,
}

impl EgressControlTool {
    pub fn new(egress: Arc<EgressOrchestrator>, defaults: EndpointSetupSpec) -> Self {
        Self { egress, defaults }
    }

    /// Run `args["action"]` and always produce a response.
    pub async fn dispatch(&self, args: &Value) -> OperationResponse {
        let action = args
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_ascii_lowercase();
        tracing::debug!("egress_control: action '{action}'");
        match self.handle(&action, args).await {
            Ok(resp) => resp,
            Err(e) => OperationResponse::failed(format!("{e:#}"), Value::Null),
        }
    }

    async fn handle(&self, action: &str, args: &Value) -> anyhow::Result<OperationResponse> {
        let resp = match action {
            "install_client" => self.handle_install().await,
            "configure" => self.handle_configure(args).await?,
            "connect" => self.handle_connect().await,
            "enable_proxy_mode" => self.handle_enable_proxy_mode(args).await?,
            "enable_routing" => self.handle_enable_routing(args).await?,
            "disable_routing" => self.handle_disable_routing().await,
            "setup_full_endpoint" => self.handle_setup(args).await?,
            "teardown_endpoint" => self.handle_teardown(args).await,
            "get_status" => self.handle_status().await,
            "run_health_check" => self.handle_health_check().await,
            "test_connectivity" => self.handle_test_connectivity().await,
            "get_historical_data" => self.handle_history(args)?,
            "start_monitoring" => self.handle_start_monitoring(),
            "stop_monitoring" => self.handle_stop_monitoring().await,
            other => anyhow::bail!(
                "Unknown action '{}'. Valid: {}",
                other,
                ACTIONS.join(", ")
            ),
        };
        Ok(resp)
    }
}

/// Overlay the object `args` (minus `action`) onto `base`.
fn overlay<T: Serialize + DeserializeOwned>(base: &T, args: &Value) -> anyhow::Result<T> {
    let mut merged = serde_json::to_value(base).context("Failed to encode defaults")?;
    if let (Value::Object(dst), Value::Object(src)) = (&mut merged, args) {
        for (key, value) in src {
            if key != "action" {
                dst.insert(key.clone(), value.clone());
            }
        }
    }
    serde_json::from_value(merged).context("Invalid arguments")
}

fn respond<T: Serialize>(result: Result<T, EgressError>, message: &str) -> OperationResponse {
    match result {
        Ok(data) => OperationResponse::ok(message, data),
        Err(e) => OperationResponse::from_error(&e),
    }
}

// ── Action handlers ─────────────────────────────────────────────────

impl EgressControlTool {
    async fn handle_install(&self) -> OperationResponse {
        let result = self
            .egress
            .install_client()
            .await
            .map(|state| json!({ "state": state }));
        respond(result, "client installed")
    }

    async fn handle_configure(&self, args: &Value) -> anyhow::Result<OperationResponse> {
        let options = overlay(&self.egress.controller().options(), args)?;
        let result = self
            .egress
            .configure(options.clone())
            .await
            .map(|()| options);
        Ok(respond(result, "client configured"))
    }

    async fn handle_connect(&self) -> OperationResponse {
        let result = self
            .egress
            .connect()
            .await
            .map(|state| json!({ "state": state }));
        respond(result, "client connected")
    }

    async fn handle_enable_proxy_mode(&self, args: &Value) -> anyhow::Result<OperationResponse> {
        let port = match args.get("port").or_else(|| args.get("proxy_port")) {
            Some(v) => v
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .context("'port' must be a port number")?,
            None => self.egress.controller().options().proxy_port,
        };
        let result = self
            .egress
            .enable_proxy_mode(port)
            .await
            .map(|state| json!({ "state": state, "proxy_port": port }));
        Ok(respond(result, &format!("proxy mode enabled on port {port}")))
    }

    async fn handle_enable_routing(&self, args: &Value) -> anyhow::Result<OperationResponse> {
        let request = overlay(&self.defaults.routing_request(), args)?;
        let result = self.egress.enable_routing(&request).await;
        Ok(respond(result, "traffic routing enabled"))
    }

    async fn handle_disable_routing(&self) -> OperationResponse {
        respond(
            self.egress.disable_routing().await.map(|()| Value::Null),
            "traffic routing disabled",
        )
    }

    async fn handle_setup(&self, args: &Value) -> anyhow::Result<OperationResponse> {
        let spec: EndpointSetupSpec = overlay(&self.defaults, args)?;
        let report = self.egress.setup_endpoint(&spec).await;
        let message = report.message.clone();
        Ok(if report.success {
            OperationResponse::ok(message, report)
        } else {
            OperationResponse::failed(message, report)
        })
    }

    async fn handle_teardown(&self, args: &Value) -> OperationResponse {
        let disconnect = args
            .get("disconnect")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let report = self.egress.teardown_endpoint(disconnect).await;
        let message = report.message.clone();
        if report.success {
            OperationResponse::ok(message, report)
        } else {
            OperationResponse::failed(message, report)
        }
    }

    async fn handle_status(&self) -> OperationResponse {
        let status = self.egress.status().await;
        let message = format!(
            "client {}, routing {}",
            status.client.state,
            if status.routing_active { "active" } else { "inactive" }
        );
        OperationResponse::ok(message, status)
    }

    async fn handle_health_check(&self) -> OperationResponse {
        let snapshot = self.egress.run_health_check().await;
        let message = format!(
            "score {} ({})",
            snapshot.score,
            if snapshot.overall_healthy { "healthy" } else { "unhealthy" }
        );
        OperationResponse::ok(message, snapshot)
    }

    async fn handle_test_connectivity(&self) -> OperationResponse {
        let report = self.egress.test_connectivity().await;
        let passed = report.tests.values().filter(|p| **p).count();
        let message = format!("{passed}/{} connectivity tests passed", report.tests.len());
        if report.success {
            OperationResponse::ok(message, report)
        } else {
            OperationResponse::failed(message, report)
        }
    }

    fn handle_history(&self, args: &Value) -> anyhow::Result<OperationResponse> {
        let hours = match args.get("hours") {
            Some(v) => v.as_f64().context("'hours' must be a number")?,
            None => 1.0,
        };
        if !(hours > 0.0 && hours <= MAX_HISTORY_HOURS) {
            anyhow::bail!("'hours' must be in (0, {MAX_HISTORY_HOURS}]");
        }
        let window = Duration::from_secs_f64(hours * 3600.0);
        let snapshots = self.egress.historical_data(window);
        Ok(OperationResponse::ok(
            format!("{} snapshot(s) in the last {hours}h", snapshots.len()),
            json!({ "hours": hours, "count": snapshots.len(), "snapshots": snapshots }),
        ))
    }

    fn handle_start_monitoring(&self) -> OperationResponse {
        respond(self.egress.start_monitoring().map(|()| Value::Null), "monitoring started")
    }

    async fn handle_stop_monitoring(&self) -> OperationResponse {
        self.egress.stop_monitoring().await;
        OperationResponse::ok("monitoring stopped", Value::Null)
    }
}

// ── Tool trait implementation ───────────────────────────────────────

#[async_trait]
impl Tool for EgressControlTool {
    fn name(&self) -> &str {
        "egress_control"
    }

    fn description(&self) -> &str {
        "Manage the proxy egress: install and connect the tunnel client, enable proxy mode and traffic routing, set up or tear down the endpoint, check health and connectivity"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ACTIONS,
                    "description": "Egress operation to perform"
                },
                "port": {
                    "type": "integer",
                    "description": "Proxy port for enable_proxy_mode"
                },
                "proxy_port": { "type": "integer" },
                "auto_connect": { "type": "boolean" },
                "enable_proxy_mode": { "type": "boolean" },
                "setup_traffic_routing": { "type": "boolean" },
                "configure_outbound": { "type": "boolean" },
                "interface": { "type": "string" },
                "redirect_ports": { "type": "array", "items": { "type": "integer" } },
                "bypass_cidrs": { "type": "array", "items": { "type": "string" } },
                "upload_mbps": { "type": "integer" },
                "download_mbps": { "type": "integer" },
                "client_type": { "type": "string", "enum": ["warp", "warp_plus", "teams"] },
                "license_key": { "type": "string" },
                "organization": { "type": "string" },
                "disconnect": {
                    "type": "boolean",
                    "description": "Also disconnect the client on teardown_endpoint"
                },
                "hours": {
                    "type": "number",
                    "description": "Window for get_historical_data"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let resp = self.dispatch(&args).await;
        Ok(ToolResult {
            success: resp.success,
            output: serde_json::to_string_pretty(&resp)?,
            error: (!resp.success).then(|| resp.message.clone()),
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
