//! Shared fakes for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;

use proxy_egress::egress::firewall::hook_args;
use proxy_egress::egress::{
    ClientOptions, ClientProbe, EgressError, EgressOrchestrator, FetchOutcome, Firewall,
    HealthProbe, HealthSettings, ProxyClientController, RoutingRule, TraceInfo, TrafficRouter,
    TunnelClient, DEFAULT_CHAIN,
};

type Result<T> = std::result::Result<T, EgressError>;

/// Tunnel client that records every call made on it.
#[derive(Default)]
pub struct FakeWarp {
    pub probe: Mutex<ClientProbe>,
    pub calls: Mutex<Vec<&'static str>>,
    pub fail_connect: bool,
    pub slow_install: Option<Duration>,
}

impl FakeWarp {
    pub fn installed_and_connected() -> Self {
        let fake = Self::default();
        {
            let mut p = fake.probe.lock();
            p.installed = true;
            p.registered = true;
            p.connected = true;
        }
        fake
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn cut_tunnel(&self) {
        let mut p = self.probe.lock();
        p.connected = false;
        p.proxy_mode = false;
        p.detail = "Status update: Disconnected".into();
    }
}

#[async_trait]
impl TunnelClient for FakeWarp {
    fn name(&self) -> &str {
        "fake-warp"
    }

    async fn is_installed(&self) -> bool {
        self.probe.lock().installed
    }

    async fn install(&self) -> Result<()> {
        self.calls.lock().push("install");
        if let Some(delay) = self.slow_install {
            tokio::time::sleep(delay).await;
        }
        self.probe.lock().installed = true;
        Ok(())
    }

    async fn configure(&self, _options: &ClientOptions) -> Result<()> {
        self.calls.lock().push("configure");
        Ok(())
    }

    async fn register(&self, _options: &ClientOptions) -> Result<()> {
        self.calls.lock().push("register");
        self.probe.lock().registered = true;
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        self.calls.lock().push("connect");
        if self.fail_connect {
            return Err(EgressError::Connection(
                "Error: Unable to connect. Reason: DNS lookup failed".into(),
            ));
        }
        self.probe.lock().connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.calls.lock().push("disconnect");
        self.cut_tunnel();
        Ok(())
    }

    async fn enable_proxy_mode(&self, port: u16) -> Result<()> {
        self.calls.lock().push("enable_proxy_mode");
        let mut p = self.probe.lock();
        p.proxy_mode = true;
        p.proxy_port = Some(port);
        Ok(())
    }

    async fn disable_proxy_mode(&self) -> Result<()> {
        self.calls.lock().push("disable_proxy_mode");
        let mut p = self.probe.lock();
        p.proxy_mode = false;
        p.proxy_port = None;
        Ok(())
    }

    async fn probe(&self) -> Result<ClientProbe> {
        Ok(self.probe.lock().clone())
    }

    async fn trace(&self, _proxy_port: u16) -> Option<TraceInfo> {
        self.probe.lock().proxy_mode.then(|| TraceInfo {
            ip: "104.28.7.7".into(),
            location: Some("FR".into()),
            warp: true,
        })
    }
}

/// NAT table kept in memory; can be told to reject a rule or hook removal.
#[derive(Default)]
pub struct FakeNat {
    pub chains: Mutex<HashMap<String, Vec<String>>>,
    pub output: Mutex<Vec<String>>,
    /// Rules whose rendering contains this text are rejected.
    pub reject_rule_containing: Option<String>,
    /// Appending rules containing this text times out.
    pub stall_rule_containing: Option<String>,
    pub fail_detach: AtomicBool,
}

impl FakeNat {
    pub fn rule_count(&self, chain: &str) -> usize {
        self.chains.lock().get(chain).map_or(0, Vec::len)
    }

    pub fn hook_count(&self) -> usize {
        self.output.lock().len()
    }

    pub fn set_fail_detach(&self, fail: bool) {
        self.fail_detach.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Firewall for FakeNat {
    async fn chain_exists(&self, chain: &str) -> Result<bool> {
        Ok(self.chains.lock().contains_key(chain))
    }

    async fn create_chain(&self, chain: &str) -> Result<()> {
        self.chains.lock().entry(chain.to_string()).or_default();
        Ok(())
    }

    async fn flush_chain(&self, chain: &str) -> Result<()> {
        if let Some(rules) = self.chains.lock().get_mut(chain) {
            rules.clear();
        }
        Ok(())
    }

    async fn delete_chain(&self, chain: &str) -> Result<()> {
        self.chains.lock().remove(chain);
        Ok(())
    }

    async fn append_rule(&self, chain: &str, rule: &RoutingRule) -> Result<()> {
        let line = rule.to_string();
        if let Some(needle) = &self.reject_rule_containing {
            if line.contains(needle.as_str()) {
                return Err(EgressError::Routing {
                    rule: line,
                    reason: "iptables: Invalid argument".into(),
                });
            }
        }
        if let Some(needle) = &self.stall_rule_containing {
            if line.contains(needle.as_str()) {
                return Err(EgressError::ProbeTimeout {
                    operation: format!("iptables -t nat -A {chain} {line}"),
                    timeout_secs: 30,
                });
            }
        }
        match self.chains.lock().get_mut(chain) {
            Some(rules) => {
                rules.push(line);
                Ok(())
            }
            None => Err(EgressError::routing(format!("no chain {chain}"))),
        }
    }

    async fn list_rules(&self, chain: &str) -> Result<Vec<String>> {
        Ok(self.chains.lock().get(chain).cloned().unwrap_or_default())
    }

    async fn hooks(&self, chain: &str) -> Result<Vec<String>> {
        let target = format!("-j {chain}");
        Ok(self
            .output
            .lock()
            .iter()
            .filter(|h| h.ends_with(&target))
            .cloned()
            .collect())
    }

    async fn attach_hook(&self, chain: &str, interface: Option<&str>) -> Result<()> {
        self.output.lock().push(hook_args(chain, interface).join(" "));
        Ok(())
    }

    async fn detach_hooks(&self, chain: &str) -> Result<usize> {
        if self.fail_detach.load(Ordering::SeqCst) {
            return Err(EgressError::routing("iptables: Resource temporarily unavailable"));
        }
        let target = format!("-j {chain}");
        let mut output = self.output.lock();
        let before = output.len();
        output.retain(|h| !h.ends_with(&target));
        Ok(before - output.len())
    }
}

/// Probes that pass unless switched off.
#[derive(Default)]
pub struct FakeProbes {
    pub down: Mutex<Vec<&'static str>>,
}

impl FakeProbes {
    pub fn fail(&self, probe: &'static str) {
        self.down.lock().push(probe);
    }

    fn check(&self, probe: &'static str) -> anyhow::Result<()> {
        if self.down.lock().contains(&probe) {
            bail!("{probe} probe failed");
        }
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for FakeProbes {
    async fn tcp_connect(&self, _port: u16) -> anyhow::Result<()> {
        self.check("tcp")
    }

    async fn socks_handshake(&self, _port: u16) -> anyhow::Result<()> {
        self.check("socks")
    }

    async fn fetch(&self, _proxy_port: Option<u16>, url: &str) -> anyhow::Result<FetchOutcome> {
        self.check("http")?;
        let body = if url.ends_with("/cdn-cgi/trace") {
            "ip=104.28.7.7\nloc=FR\nwarp=on\n".to_string()
        } else {
            String::new()
        };
        Ok(FetchOutcome { status: 200, body })
    }

    async fn resolve(&self, _host: &str) -> anyhow::Result<Vec<IpAddr>> {
        self.check("dns")?;
        Ok(vec![IpAddr::V4(Ipv4Addr::new(104, 16, 133, 229))])
    }
}

pub struct Node {
    pub warp: Arc<FakeWarp>,
    pub nat: Arc<FakeNat>,
    pub probes: Arc<FakeProbes>,
    pub egress: Arc<EgressOrchestrator>,
}

pub fn node(warp: FakeWarp, nat: FakeNat) -> Node {
    node_with(warp, nat, HealthSettings::default(), |e| e)
}

pub fn node_with(
    warp: FakeWarp,
    nat: FakeNat,
    health: HealthSettings,
    customize: impl FnOnce(EgressOrchestrator) -> EgressOrchestrator,
) -> Node {
    let warp = Arc::new(warp);
    let nat = Arc::new(nat);
    let probes = Arc::new(FakeProbes::default());
    let controller = Arc::new(
        ProxyClientController::new(warp.clone(), ClientOptions::default())
            .with_connect_poll(3, Duration::from_millis(5)),
    );
    let router = Arc::new(TrafficRouter::new(nat.clone(), DEFAULT_CHAIN));
    let egress = customize(EgressOrchestrator::new(
        controller,
        router,
        probes.clone(),
        health,
    ));
    Node {
        warp,
        nat,
        probes,
        egress: Arc::new(egress),
    }
}

/// A localhost port nothing is listening on right now.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
