//! Traffic router: redirects selected outbound TCP traffic into the local
//! proxy port while loopback and private ranges bypass it.
//!
//! Rule layout inside the chain:
//! ```text
//! -d 127.0.0.0/8    -j RETURN      always, loop prevention
//! -d 10.0.0.0/8     -j RETURN
//! -d 172.16.0.0/12  -j RETURN
//! -d 192.168.0.0/16 -j RETURN
//! -d <caller cidr>  -j RETURN
//! -p tcp -m tcp --dport <port> -j REDIRECT --to-ports <proxy port>
//! ```
//! plus one jump from the outbound hook into the chain.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::client::ProxyClientState;
use super::error::{EgressError, Result};
use super::firewall::{hook_args, Firewall};

/// Default name of the NAT chain owned by the router.
pub const DEFAULT_CHAIN: &str = "PROXY_EGRESS";

/// Ranges that never enter the proxy, regardless of caller input.
pub const ALWAYS_BYPASS: [&str; 4] = [
    "127.0.0.0/8",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RuleMatch {
    Cidr(IpNet),
    Port(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Bypass,
    Redirect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingRule {
    #[serde(rename = "match")]
    pub matcher: RuleMatch,
    pub action: RuleAction,
    pub target_port: Option<u16>,
}

impl RoutingRule {
    pub fn bypass(net: IpNet) -> Self {
        Self {
            matcher: RuleMatch::Cidr(net),
            action: RuleAction::Bypass,
            target_port: None,
        }
    }

    pub fn redirect(port: u16, to_port: u16) -> Self {
        Self {
            matcher: RuleMatch::Port(port),
            action: RuleAction::Redirect,
            target_port: Some(to_port),
        }
    }

    /// Rule arguments in the canonical form `iptables -S` prints them.
    pub fn iptables_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::with_capacity(10);
        match self.matcher {
            RuleMatch::Cidr(net) => {
                args.extend(["-d".to_string(), net.to_string()]);
                if self.action == RuleAction::Redirect {
                    args.extend(["-p", "tcp", "-m", "tcp"].map(String::from));
                }
            }
            RuleMatch::Port(port) => {
                args.extend(["-p", "tcp", "-m", "tcp", "--dport"].map(String::from));
                args.push(port.to_string());
            }
        }
        match (self.action, self.target_port) {
            (RuleAction::Redirect, Some(to)) => {
                args.extend(["-j", "REDIRECT", "--to-ports"].map(String::from));
                args.push(to.to_string());
            }
            _ => args.extend(["-j", "RETURN"].map(String::from)),
        }
        args
    }
}

impl std::fmt::Display for RoutingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.iptables_args().join(" "))
    }
}

/// Caller input for [`TrafficRouter::enable_routing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingRequest {
    /// Upstream interface to hook; `None` hooks all outbound traffic.
    pub interface: Option<String>,
    pub bypass_cidrs: Vec<String>,
    pub redirect_ports: Vec<u16>,
    pub proxy_port: u16,
}

impl Default for RoutingRequest {
    fn default() -> Self {
        Self {
            interface: None,
            bypass_cidrs: Vec::new(),
            redirect_ports: vec![80, 443],
            proxy_port: super::client::DEFAULT_PROXY_PORT,
        }
    }
}

/// `[routing]` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    pub chain: String,
    pub interface: Option<String>,
    pub redirect_ports: Vec<u16>,
    pub bypass_cidrs: Vec<String>,
    /// Whether endpoint setup programs the chain unless told otherwise.
    pub enable_on_setup: bool,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            chain: DEFAULT_CHAIN.to_string(),
            interface: None,
            redirect_ports: vec![80, 443],
            bypass_cidrs: Vec::new(),
            enable_on_setup: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingRuleSet {
    pub chain: String,
    pub interface: Option<String>,
    pub rules: Vec<RoutingRule>,
    pub applied: bool,
}

fn parse_net(raw: &str) -> Result<IpNet> {
    let raw = raw.trim();
    let net = raw
        .parse::<IpNet>()
        .or_else(|_| raw.parse::<IpAddr>().map(IpNet::from))
        .map_err(|_| EgressError::Routing {
            rule: raw.to_string(),
            reason: "invalid CIDR".into(),
        })?;
    if matches!(net, IpNet::V6(_)) {
        return Err(EgressError::Routing {
            rule: raw.to_string(),
            reason: "IPv6 ranges are not supported by the IPv4 NAT chain".into(),
        });
    }
    Ok(net.trunc())
}

impl RoutingRuleSet {
    /// Build the ordered rule set for `request`. Not yet applied.
    pub fn build(chain: &str, request: &RoutingRequest) -> Result<Self> {
        if request.proxy_port == 0 {
            return Err(EgressError::routing("proxy_port must be non-zero"));
        }
        if request.redirect_ports.is_empty() {
            return Err(EgressError::routing("no redirect ports given"));
        }

        let mut rules = Vec::new();
        let mut seen_nets: Vec<IpNet> = Vec::new();
        for raw in ALWAYS_BYPASS
            .iter()
            .copied()
            .chain(request.bypass_cidrs.iter().map(String::as_str))
        {
            let net = parse_net(raw)?;
            if !seen_nets.contains(&net) {
                seen_nets.push(net);
                rules.push(RoutingRule::bypass(net));
            }
        }

        let mut seen_ports = Vec::new();
        for &port in &request.redirect_ports {
            if port == 0 {
                return Err(EgressError::routing("redirect port must be non-zero"));
            }
            if port == request.proxy_port {
                return Err(EgressError::Routing {
                    rule: format!("--dport {port}"),
                    reason: "redirecting the proxy port into itself would loop".into(),
                });
            }
            if !seen_ports.contains(&port) {
                seen_ports.push(port);
                rules.push(RoutingRule::redirect(port, request.proxy_port));
            }
        }

        Ok(Self {
            chain: chain.to_string(),
            interface: request.interface.clone().filter(|i| !i.is_empty()),
            rules,
            applied: false,
        })
    }

    fn rule_lines(&self) -> Vec<String> {
        self.rules.iter().map(ToString::to_string).collect()
    }

    fn hook_line(&self) -> String {
        hook_args(&self.chain, self.interface.as_deref()).join(" ")
    }
}

pub struct TrafficRouter {
    firewall: Arc<dyn Firewall>,
    chain: String,
    current: Mutex<Option<RoutingRuleSet>>,
}

impl TrafficRouter {
    pub fn new(firewall: Arc<dyn Firewall>, chain: impl Into<String>) -> Self {
        Self {
            firewall,
            chain: chain.into(),
            current: Mutex::new(None),
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Rule set applied by this process, if any.
    pub fn current(&self) -> Option<RoutingRuleSet> {
        self.current.lock().clone()
    }

    /// Apply the rule set for `request`.
    ///
    /// Refuses unless `client_state` is connected. An identical set already
    /// present on the host is left untouched; anything else is cleared and
    /// rebuilt. A failed write rolls back everything applied so far.
    pub async fn enable_routing(
        &self,
        request: &RoutingRequest,
        client_state: ProxyClientState,
    ) -> Result<RoutingRuleSet> {
        self.apply_routing(request, client_state)
            .await
            .map_err(|failure| failure.error)
    }

    /// Like [`enable_routing`](Self::enable_routing), but the error also
    /// says whether host writes were undone.
    pub async fn apply_routing(
        &self,
        request: &RoutingRequest,
        client_state: ProxyClientState,
    ) -> std::result::Result<RoutingRuleSet, RoutingFailure> {
        if !client_state.is_connected() {
            return Err(RoutingFailure::untouched(EgressError::routing(format!(
                "refusing to route traffic while the client is {client_state}"
            ))));
        }
        let mut set =
            RoutingRuleSet::build(&self.chain, request).map_err(RoutingFailure::untouched)?;

        if self
            .matches_host(&set)
            .await
            .map_err(|e| RoutingFailure::untouched(at_rule(format!("-S {}", self.chain), e)))?
        {
            tracing::debug!("egress: routing chain {} already up to date", self.chain);
            set.applied = true;
            *self.current.lock() = Some(set.clone());
            return Ok(set);
        }

        let mut touched = false;
        if let Err(e) = self.program(&set, &mut touched).await {
            if !touched {
                return Err(RoutingFailure::untouched(e));
            }
            tracing::warn!("egress: programming {} failed, rolling back: {e}", self.chain);
            let rolled_back = self.rollback().await;
            return Err(RoutingFailure {
                error: e,
                rolled_back,
            });
        }

        set.applied = true;
        tracing::info!(
            "egress: routing enabled on chain {} ({} rules, interface {})",
            self.chain,
            set.rules.len(),
            set.interface.as_deref().unwrap_or("any")
        );
        *self.current.lock() = Some(set.clone());
        Ok(set)
    }

    /// Write `set` to the host. `touched` turns true once anything changed.
    async fn program(&self, set: &RoutingRuleSet, touched: &mut bool) -> Result<()> {
        let chain = self.chain.as_str();
        let exists = self
            .firewall
            .chain_exists(chain)
            .await
            .map_err(|e| at_rule(format!("-S {chain}"), e))?;
        if exists {
            let detached = self
                .firewall
                .detach_hooks(chain)
                .await
                .map_err(|e| at_rule(set.hook_line(), e))?;
            *touched |= detached > 0;
            self.firewall
                .flush_chain(chain)
                .await
                .map_err(|e| at_rule(format!("-F {chain}"), e))?;
            *touched = true;
        } else {
            self.firewall
                .create_chain(chain)
                .await
                .map_err(|e| at_rule(format!("-N {chain}"), e))?;
            *touched = true;
        }

        for rule in &set.rules {
            self.firewall
                .append_rule(chain, rule)
                .await
                .map_err(|e| at_rule(rule.to_string(), e))?;
        }
        self.firewall
            .attach_hook(chain, set.interface.as_deref())
            .await
            .map_err(|e| at_rule(set.hook_line(), e))
    }

    /// Detach and delete the chain. A missing chain is success.
    pub async fn disable_routing(&self) -> Result<()> {
        let detached = self.firewall.detach_hooks(&self.chain).await?;
        if self.firewall.chain_exists(&self.chain).await? {
            self.firewall.flush_chain(&self.chain).await?;
            self.firewall.delete_chain(&self.chain).await?;
        }
        *self.current.lock() = None;
        tracing::info!(
            "egress: routing disabled on chain {} ({detached} hook(s) removed)",
            self.chain
        );
        Ok(())
    }

    /// Chain present and hooked. Probe errors read as inactive.
    pub async fn is_routing_active(&self) -> bool {
        match self.firewall.chain_exists(&self.chain).await {
            Ok(true) => matches!(self.firewall.hooks(&self.chain).await, Ok(h) if !h.is_empty()),
            Ok(false) => false,
            Err(e) => {
                tracing::debug!("egress: cannot inspect chain {}: {e}", self.chain);
                false
            }
        }
    }

    async fn matches_host(&self, set: &RoutingRuleSet) -> Result<bool> {
        if !self.firewall.chain_exists(&self.chain).await? {
            return Ok(false);
        }
        let hooks = self.firewall.hooks(&self.chain).await?;
        if hooks != [set.hook_line()] {
            return Ok(false);
        }
        Ok(self.firewall.list_rules(&self.chain).await? == set.rule_lines())
    }

    /// Remove the chain and its hooks. Returns false if any step failed.
    async fn rollback(&self) -> bool {
        let mut clean = true;
        if let Err(e) = self.firewall.detach_hooks(&self.chain).await {
            tracing::warn!("egress: rollback could not detach hooks: {e}");
            clean = false;
        }
        if let Err(e) = self.firewall.flush_chain(&self.chain).await {
            tracing::warn!("egress: rollback could not flush {}: {e}", self.chain);
            clean = false;
        }
        if let Err(e) = self.firewall.delete_chain(&self.chain).await {
            tracing::warn!("egress: rollback could not delete {}: {e}", self.chain);
            clean = false;
        }
        *self.current.lock() = None;
        clean
    }
}

/// A failed [`TrafficRouter::apply_routing`].
#[derive(Debug)]
pub struct RoutingFailure {
    pub error: EgressError,
    /// Host writes made by the failed call were undone.
    pub rolled_back: bool,
}

impl RoutingFailure {
    fn untouched(error: EgressError) -> Self {
        Self {
            error,
            rolled_back: false,
        }
    }
}

impl From<RoutingFailure> for EgressError {
    fn from(failure: RoutingFailure) -> Self {
        failure.error
    }
}

/// Attribute a firewall failure to `rule`, whatever layer it came from.
fn at_rule(rule: impl Into<String>, e: EgressError) -> EgressError {
    let rule = rule.into();
    match e {
        EgressError::Routing { reason, .. } => EgressError::Routing { rule, reason },
        other => EgressError::Routing {
            rule,
            reason: other.to_string(),
        },
    }
}
