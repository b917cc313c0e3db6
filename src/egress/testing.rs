//! In-memory stand-ins for the tunnel client, the firewall and network probes.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::client::{ClientOptions, ClientProbe, TunnelClient};
use super::error::{EgressError, Result};
use super::firewall::{hook_args, Firewall};
use super::probe::{FetchOutcome, HealthProbe, TraceInfo};
use super::router::RoutingRule;

/// Tunnel client whose probe reflects the calls made on it.
#[derive(Default)]
pub struct FakeClient {
    pub probe: Mutex<ClientProbe>,
    pub install_fails: bool,
    pub connect_fails: bool,
    pub stays_disconnected: bool,
    /// `install` sleeps this long first.
    pub install_delay: std::time::Duration,
    pub installs: Mutex<u32>,
    /// The tunnel falls over right after proxy mode has been confirmed.
    pub drops_after_proxy_mode: bool,
    /// Probes left before a scheduled drop.
    pub pending_drop: Mutex<Option<u32>>,
}

impl FakeClient {
    pub fn connected() -> Self {
        Self {
            probe: Mutex::new(ClientProbe {
                installed: true,
                registered: true,
                connected: true,
                ..ClientProbe::default()
            }),
            ..Self::default()
        }
    }

    pub fn drop_connection(&self) {
        let mut probe = self.probe.lock();
        probe.connected = false;
        probe.proxy_mode = false;
    }
}

#[async_trait]
impl TunnelClient for FakeClient {
    fn name(&self) -> &str {
        "fake"
    }
    async fn is_installed(&self) -> bool {
        self.probe.lock().installed
    }
    async fn install(&self) -> Result<()> {
        *self.installs.lock() += 1;
        if !self.install_delay.is_zero() {
            tokio::time::sleep(self.install_delay).await;
        }
        if self.install_fails {
            return Err(EgressError::Installation("unsupported os".into()));
        }
        self.probe.lock().installed = true;
        Ok(())
    }
    async fn configure(&self, _options: &ClientOptions) -> Result<()> {
        Ok(())
    }
    async fn register(&self, _options: &ClientOptions) -> Result<()> {
        self.probe.lock().registered = true;
        Ok(())
    }
    async fn connect(&self) -> Result<()> {
        if self.connect_fails {
            return Err(EgressError::Connection("Unable to connect".into()));
        }
        let mut probe = self.probe.lock();
        if self.stays_disconnected {
            probe.detail = "Status update: Connecting".into();
        } else {
            probe.connected = true;
        }
        Ok(())
    }
    async fn disconnect(&self) -> Result<()> {
        self.drop_connection();
        Ok(())
    }
    async fn enable_proxy_mode(&self, port: u16) -> Result<()> {
        {
            let mut probe = self.probe.lock();
            probe.proxy_mode = true;
            probe.proxy_port = Some(port);
        }
        if self.drops_after_proxy_mode {
            *self.pending_drop.lock() = Some(1);
        }
        Ok(())
    }
    async fn disable_proxy_mode(&self) -> Result<()> {
        let mut probe = self.probe.lock();
        probe.proxy_mode = false;
        probe.proxy_port = None;
        Ok(())
    }
    async fn probe(&self) -> Result<ClientProbe> {
        let drop_now = {
            let mut pending = self.pending_drop.lock();
            match *pending {
                Some(0) => {
                    *pending = None;
                    true
                }
                Some(n) => {
                    *pending = Some(n - 1);
                    false
                }
                None => false,
            }
        };
        if drop_now {
            self.drop_connection();
        }
        Ok(self.probe.lock().clone())
    }
    async fn trace(&self, _proxy_port: u16) -> Option<TraceInfo> {
        Some(TraceInfo {
            ip: "104.28.1.1".into(),
            location: Some("NL".into()),
            warp: true,
        })
    }
}

/// In-memory NAT table.
#[derive(Default)]
pub struct MemoryFirewall {
    pub chains: Mutex<BTreeMap<String, Vec<String>>>,
    pub hooks: Mutex<Vec<String>>,
    /// 1-based index of the `append_rule` call that fails.
    pub fail_on_rule: Option<usize>,
    /// 1-based index of the `append_rule` call that times out.
    pub stall_on_rule: Option<usize>,
    pub fail_detach: AtomicBool,
    pub appended: Mutex<usize>,
    pub writes: Mutex<usize>,
}

#[async_trait]
impl Firewall for MemoryFirewall {
    async fn chain_exists(&self, chain: &str) -> Result<bool> {
        Ok(self.chains.lock().contains_key(chain))
    }
    async fn create_chain(&self, chain: &str) -> Result<()> {
        *self.writes.lock() += 1;
        self.chains.lock().entry(chain.into()).or_default();
        Ok(())
    }
    async fn flush_chain(&self, chain: &str) -> Result<()> {
        *self.writes.lock() += 1;
        if let Some(rules) = self.chains.lock().get_mut(chain) {
            rules.clear();
        }
        Ok(())
    }
    async fn delete_chain(&self, chain: &str) -> Result<()> {
        *self.writes.lock() += 1;
        self.chains.lock().remove(chain);
        Ok(())
    }
    async fn append_rule(&self, chain: &str, rule: &RoutingRule) -> Result<()> {
        *self.writes.lock() += 1;
        let n = {
            let mut appended = self.appended.lock();
            *appended += 1;
            *appended
        };
        if self.fail_on_rule == Some(n) {
            return Err(EgressError::Routing {
                rule: rule.to_string(),
                reason: "simulated failure".into(),
            });
        }
        if self.stall_on_rule == Some(n) {
            return Err(EgressError::ProbeTimeout {
                operation: format!("iptables -A {chain} {rule}"),
                timeout_secs: 30,
            });
        }
        self.chains
            .lock()
            .get_mut(chain)
            .ok_or_else(|| EgressError::routing("no chain"))?
            .push(rule.to_string());
        Ok(())
    }
    async fn list_rules(&self, chain: &str) -> Result<Vec<String>> {
        Ok(self.chains.lock().get(chain).cloned().unwrap_or_default())
    }
    async fn hooks(&self, chain: &str) -> Result<Vec<String>> {
        let suffix = format!("-j {chain}");
        Ok(self
            .hooks
            .lock()
            .iter()
            .filter(|h| h.ends_with(&suffix))
            .cloned()
            .collect())
    }
    async fn attach_hook(&self, chain: &str, interface: Option<&str>) -> Result<()> {
        *self.writes.lock() += 1;
        self.hooks.lock().push(hook_args(chain, interface).join(" "));
        Ok(())
    }
    async fn detach_hooks(&self, chain: &str) -> Result<usize> {
        if self.fail_detach.load(Ordering::SeqCst) {
            return Err(EgressError::routing("iptables: Resource temporarily unavailable"));
        }
        let suffix = format!("-j {chain}");
        let mut hooks = self.hooks.lock();
        let before = hooks.len();
        hooks.retain(|h| !h.ends_with(&suffix));
        Ok(before - hooks.len())
    }
}

/// Network probes with switchable outcomes.
pub struct ScriptedProbes {
    pub proxy_ok: AtomicBool,
    pub internet_ok: AtomicBool,
    pub dns_ok: AtomicBool,
    /// Every probe sleeps this long first.
    pub delay_ms: AtomicUsize,
}

impl ScriptedProbes {
    pub fn healthy() -> Self {
        Self {
            proxy_ok: AtomicBool::new(true),
            internet_ok: AtomicBool::new(true),
            dns_ok: AtomicBool::new(true),
            delay_ms: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, proxy: bool, internet: bool, dns: bool) {
        self.proxy_ok.store(proxy, Ordering::SeqCst);
        self.internet_ok.store(internet, Ordering::SeqCst);
        self.dns_ok.store(dns, Ordering::SeqCst);
    }

    async fn pause(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst) as u64;
        if ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbes {
    async fn tcp_connect(&self, port: u16) -> anyhow::Result<()> {
        self.pause().await;
        if !self.proxy_ok.load(Ordering::SeqCst) {
            bail!("nothing listening on 127.0.0.1:{port}");
        }
        Ok(())
    }
    async fn socks_handshake(&self, port: u16) -> anyhow::Result<()> {
        self.tcp_connect(port).await
    }
    async fn fetch(&self, _proxy_port: Option<u16>, url: &str) -> anyhow::Result<FetchOutcome> {
        self.pause().await;
        if !self.internet_ok.load(Ordering::SeqCst) {
            bail!("request to {url} failed");
        }
        let body = if url.contains("cdn-cgi/trace") {
            "ip=104.28.1.1\nloc=NL\nwarp=on\n".to_string()
        } else {
            String::new()
        };
        Ok(FetchOutcome {
            status: if body.is_empty() { 204 } else { 200 },
            body,
        })
    }
    async fn resolve(&self, host: &str) -> anyhow::Result<Vec<IpAddr>> {
        self.pause().await;
        if !self.dns_ok.load(Ordering::SeqCst) {
            bail!("failed to resolve {host}");
        }
        Ok(vec![IpAddr::V4(Ipv4Addr::new(104, 16, 132, 229))])
    }
}
