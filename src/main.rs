//! `proxy-egress` binary.
//!
//! `serve` runs the health monitor and the HTTP gateway until interrupted;
//! the other subcommands run one operation and print its JSON response.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use proxy_egress::config::{default_config_path, EgressConfig};
use proxy_egress::egress::{
    EgressOrchestrator, Iptables, JsonOutboundFile, NetworkProbes, OperationResponse,
    ProxyClientController, SystemRunner, TrafficRouter, WarpCli,
};
use proxy_egress::tools::EgressControlTool;

#[derive(Parser, Debug)]
#[command(name = "proxy-egress", version, about = "Per-node proxy egress agent")]
struct Args {
    /// Config file (default: ~/.proxy-egress/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Default log filter; RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the health monitor and the HTTP gateway
    Serve {
        #[arg(long, value_name = "HOST:PORT")]
        bind: Option<String>,
        /// Run endpoint setup once before serving
        #[arg(long)]
        setup: bool,
    },
    /// Install, connect and enable proxy mode (plus routing/outbound if asked)
    Setup {
        #[arg(long)]
        routing: bool,
        #[arg(long)]
        outbound: bool,
        #[arg(long)]
        no_connect: bool,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        interface: Option<String>,
        #[arg(long, value_name = "CIDR", value_delimiter = ',')]
        bypass: Vec<String>,
    },
    /// Remove routing, outbound hand-off and proxy mode
    Teardown {
        /// Also disconnect the tunnel
        #[arg(long)]
        disconnect: bool,
    },
    Status,
    /// Run one health cycle
    Health,
    History {
        #[arg(long, default_value_t = 1.0)]
        hours: f64,
    },
    /// One-shot connectivity probes
    Test,
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build(config: &EgressConfig, shutdown: &CancellationToken) -> EgressOrchestrator {
    let runner = Arc::new(SystemRunner::new(config.command_timeout()));
    let installer = Arc::new(SystemRunner::new(config.install_timeout()));
    let client = Arc::new(WarpCli::discover(runner.clone()).with_installer(installer));
    let controller = Arc::new(ProxyClientController::new(client, config.client_options()));
    let router = Arc::new(TrafficRouter::new(
        Arc::new(Iptables::discover(runner)),
        config.routing.chain.clone(),
    ));
    let probes = Arc::new(NetworkProbes::new(config.health.check_timeout()));

    let mut egress = EgressOrchestrator::new(controller, router, probes, config.health.clone())
        .with_enabled(config.enabled)
        .with_shutdown(shutdown.clone());
    if let Some(path) = &config.outbound.config_path {
        egress = egress.with_outbound(Arc::new(JsonOutboundFile::new(
            path,
            config.outbound.tag.clone(),
        )));
    }
    egress
}

fn print_response(resp: &OperationResponse) -> anyhow::Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(resp)?);
    Ok(if resp.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let path = args.config.unwrap_or_else(default_config_path);
    let config = EgressConfig::load(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    if !config.enabled {
        tracing::warn!("egress: disabled in {}; mutating operations are refused", path.display());
    }

    let shutdown = CancellationToken::new();
    let egress = Arc::new(build(&config, &shutdown));
    egress.controller().reconcile().await;
    let tool = Arc::new(EgressControlTool::new(egress.clone(), config.setup_defaults()));

    let request: Value = match args.command {
        Command::Serve { bind, setup } => {
            if setup {
                let resp = tool.dispatch(&json!({ "action": "setup_full_endpoint" })).await;
                if !resp.success {
                    tracing::warn!("egress: initial setup failed: {}", resp.message);
                }
            }
            if config.enabled {
                egress.start_monitoring()?;
            }
            let bind = bind.unwrap_or_else(|| config.gateway.bind.clone());
            let addr = bind
                .parse()
                .with_context(|| format!("Invalid gateway address '{bind}'"))?;

            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("egress: interrupt received, shutting down");
                }
                signal_token.cancel();
            });

            proxy_egress::gateway::serve(addr, tool, shutdown.clone()).await?;
            egress.stop_monitoring().await;
            return Ok(ExitCode::SUCCESS);
        }
        Command::Setup {
            routing,
            outbound,
            no_connect,
            port,
            interface,
            bypass,
        } => {
            let mut req = json!({ "action": "setup_full_endpoint" });
            if routing {
                req["setup_traffic_routing"] = json!(true);
            }
            if outbound {
                req["configure_outbound"] = json!(true);
            }
            if no_connect {
                req["auto_connect"] = json!(false);
            }
            if let Some(port) = port {
                req["proxy_port"] = json!(port);
            }
            if let Some(interface) = interface {
                req["interface"] = json!(interface);
            }
            if !bypass.is_empty() {
                req["bypass_cidrs"] = json!(bypass);
            }
            req
        }
        Command::Teardown { disconnect } => {
            json!({ "action": "teardown_endpoint", "disconnect": disconnect })
        }
        Command::Status => json!({ "action": "get_status" }),
        Command::Health => json!({ "action": "run_health_check" }),
        Command::History { hours } => json!({ "action": "get_historical_data", "hours": hours }),
        Command::Test => json!({ "action": "test_connectivity" }),
    };

    print_response(&tool.dispatch(&request).await)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
