//! Host firewall access.
//!
//! All reads and writes of NAT rules go through the [`Firewall`] trait so
//! that only the traffic router touches global host state.

use std::sync::Arc;

use async_trait::async_trait;

use super::command::{render_command, CommandOutput, CommandRunner};
use super::error::{EgressError, Result};
use super::router::RoutingRule;

#[async_trait]
pub trait Firewall: Send + Sync {
    async fn chain_exists(&self, chain: &str) -> Result<bool>;

    /// Create `chain`; an existing chain is success.
    async fn create_chain(&self, chain: &str) -> Result<()>;

    /// Remove every rule of `chain`; a missing chain is success.
    async fn flush_chain(&self, chain: &str) -> Result<()>;

    /// Delete an empty `chain`; a missing chain is success.
    async fn delete_chain(&self, chain: &str) -> Result<()>;

    async fn append_rule(&self, chain: &str, rule: &RoutingRule) -> Result<()>;

    /// Rules of `chain`, as argument strings without the `-A <chain>` prefix.
    async fn list_rules(&self, chain: &str) -> Result<Vec<String>>;

    /// Jump rules from the outbound hook into `chain`, same format.
    async fn hooks(&self, chain: &str) -> Result<Vec<String>>;

    async fn attach_hook(&self, chain: &str, interface: Option<&str>) -> Result<()>;

    /// Remove every jump into `chain`; returns how many were removed.
    async fn detach_hooks(&self, chain: &str) -> Result<usize>;
}

/// Arguments of the jump rule attaching `chain` to the outbound path.
pub fn hook_args(chain: &str, interface: Option<&str>) -> Vec<String> {
    let mut args = Vec::with_capacity(4);
    if let Some(iface) = interface.filter(|i| !i.is_empty()) {
        args.push("-o".to_string());
        args.push(iface.to_string());
    }
    args.push("-j".to_string());
    args.push(chain.to_string());
    args
}

fn missing_chain(diag: &str) -> bool {
    let lower = diag.to_ascii_lowercase();
    lower.contains("no chain") || lower.contains("does not exist")
}

/// `iptables` NAT table, hooked from `OUTPUT`.
pub struct Iptables {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    table: String,
    parent: String,
}

impl Iptables {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            binary: "iptables".to_string(),
            table: "nat".to_string(),
            parent: "OUTPUT".to_string(),
        }
    }

    /// Use `iptables` from `PATH` when present, else `iptables-legacy`.
    pub fn discover(runner: Arc<dyn CommandRunner>) -> Self {
        let mut fw = Self::new(runner);
        if which::which("iptables").is_err() {
            if let Ok(path) = which::which("iptables-legacy") {
                fw.binary = path.display().to_string();
            }
        }
        fw
    }

    async fn exec(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut full = vec!["-t", self.table.as_str()];
        full.extend_from_slice(args);
        self.runner.run(&self.binary, &full).await
    }

    /// Run and require success, or a missing chain when `tolerate_missing`.
    async fn exec_ok(&self, args: &[&str], tolerate_missing: bool) -> Result<CommandOutput> {
        let out = self.exec(args).await?;
        if out.success || (tolerate_missing && missing_chain(&out.diagnostic())) {
            return Ok(out);
        }
        Err(EgressError::Routing {
            rule: render_command(&self.binary, args),
            reason: out.diagnostic(),
        })
    }

    /// `-S <chain>` lines starting with `-A <chain> `, prefix stripped.
    async fn listed_rules(&self, list_chain: &str, filter: impl Fn(&str) -> bool) -> Result<Vec<String>> {
        let out = self.exec(&["-S", list_chain]).await?;
        if !out.success {
            if missing_chain(&out.diagnostic()) {
                return Ok(Vec::new());
            }
            return Err(EgressError::routing(out.diagnostic()));
        }
        let prefix = format!("-A {list_chain} ");
        Ok(out
            .stdout
            .lines()
            .filter_map(|l| l.trim().strip_prefix(prefix.as_str()))
            .filter(|l| filter(l))
            .map(str::to_string)
            .collect())
    }
}

fn jumps_to(rule: &str, chain: &str) -> bool {
    let mut tokens = rule.split_whitespace();
    while let Some(tok) = tokens.next() {
        if tok == "-j" && tokens.next() == Some(chain) {
            return true;
        }
    }
    false
}

#[async_trait]
impl Firewall for Iptables {
    async fn chain_exists(&self, chain: &str) -> Result<bool> {
        let out = self.exec(&["-S", chain]).await?;
        if out.success {
            return Ok(true);
        }
        if missing_chain(&out.diagnostic()) {
            return Ok(false);
        }
        Err(EgressError::routing(out.diagnostic()))
    }

    async fn create_chain(&self, chain: &str) -> Result<()> {
        let out = self.exec(&["-N", chain]).await?;
        if out.success || out.diagnostic().to_ascii_lowercase().contains("already exists") {
            return Ok(());
        }
        Err(EgressError::Routing {
            rule: format!("-N {chain}"),
            reason: out.diagnostic(),
        })
    }

    async fn flush_chain(&self, chain: &str) -> Result<()> {
        self.exec_ok(&["-F", chain], true).await.map(|_| ())
    }

    async fn delete_chain(&self, chain: &str) -> Result<()> {
        self.exec_ok(&["-X", chain], true).await.map(|_| ())
    }

    async fn append_rule(&self, chain: &str, rule: &RoutingRule) -> Result<()> {
        let rule_args = rule.iptables_args();
        let mut args = vec!["-A", chain];
        args.extend(rule_args.iter().map(String::as_str));
        let reason = match self.exec(&args).await {
            Ok(out) if out.success => return Ok(()),
            Ok(out) => out.diagnostic(),
            Err(e) => e.to_string(),
        };
        Err(EgressError::Routing {
            rule: rule.to_string(),
            reason,
        })
    }

    async fn list_rules(&self, chain: &str) -> Result<Vec<String>> {
        self.listed_rules(chain, |_| true).await
    }

    async fn hooks(&self, chain: &str) -> Result<Vec<String>> {
        let parent = self.parent.clone();
        self.listed_rules(&parent, |l| jumps_to(l, chain)).await
    }

    async fn attach_hook(&self, chain: &str, interface: Option<&str>) -> Result<()> {
        let hook = hook_args(chain, interface);
        let mut args = vec!["-I", self.parent.as_str(), "1"];
        args.extend(hook.iter().map(String::as_str));
        self.exec_ok(&args, false).await.map(|_| ())
    }

    async fn detach_hooks(&self, chain: &str) -> Result<usize> {
        let hooks = self.hooks(chain).await?;
        for hook in &hooks {
            let mut args = vec!["-D", self.parent.as_str()];
            args.extend(hook.split_whitespace());
            self.exec_ok(&args, false).await?;
        }
        Ok(hooks.len())
    }
}
