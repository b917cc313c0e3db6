//! Hand-off of the local proxy address to the tunnel-terminating service.
//!
//! The service reads a JSON config with an `outbounds` array. Setup upserts
//! one SOCKS5 outbound, identified by its tag, pointing at the client's
//! proxy port; teardown removes it again. Every other entry is preserved.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::error::{EgressError, Result};

/// Tag of the outbound entry owned by this agent.
pub const DEFAULT_OUTBOUND_TAG: &str = "warp";

/// Proxy address plus bandwidth hints handed to the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundProxy {
    pub server: String,
    pub port: u16,
    pub up_mbps: Option<u32>,
    pub down_mbps: Option<u32>,
}

impl OutboundProxy {
    pub fn local(port: u16) -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            port,
            up_mbps: None,
            down_mbps: None,
        }
    }

    pub fn address(&self) -> String {
        format!("socks5://{}:{}", self.server, self.port)
    }
}

#[async_trait]
pub trait OutboundConfigurator: Send + Sync {
    /// Point the service's egress at `proxy`. Re-applying is an upsert.
    async fn apply_proxy(&self, proxy: &OutboundProxy) -> Result<()>;

    /// Remove the entry again. Nothing to remove is success.
    async fn clear_proxy(&self) -> Result<()>;
}

/// `[outbound]` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundSettings {
    /// Service config to edit; `None` disables the hand-off.
    pub config_path: Option<PathBuf>,
    pub tag: String,
}

impl Default for OutboundSettings {
    fn default() -> Self {
        Self {
            config_path: None,
            tag: DEFAULT_OUTBOUND_TAG.to_string(),
        }
    }
}

/// Edits the `outbounds` array of a JSON service config in place.
#[derive(Debug, Clone)]
pub struct JsonOutboundFile {
    path: PathBuf,
    tag: String,
}

impl JsonOutboundFile {
    pub fn new(path: impl Into<PathBuf>, tag: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            tag: tag.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Option<Map<String, Value>>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(Some(Map::new()));
        }
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(Some(map)),
            Ok(_) => Err(EgressError::Configuration(format!(
                "{} is not a JSON object",
                self.path.display()
            ))),
            Err(e) => Err(EgressError::Configuration(format!(
                "cannot parse {}: {e}",
                self.path.display()
            ))),
        }
    }

    /// Write to a sibling `.tmp` file, then rename over the target.
    async fn save(&self, doc: &Map<String, Value>) -> Result<()> {
        let body = serde_json::to_string_pretty(doc)
            .map_err(|e| EgressError::Configuration(format!("cannot encode outbound config: {e}")))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, body.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn entry(&self, proxy: &OutboundProxy) -> Value {
        let mut entry = json!({
            "type": "socks",
            "tag": self.tag,
            "server": proxy.server,
            "server_port": proxy.port,
            "version": "5",
        });
        if let Value::Object(map) = &mut entry {
            if let Some(up) = proxy.up_mbps {
                map.insert("up_mbps".into(), json!(up));
            }
            if let Some(down) = proxy.down_mbps {
                map.insert("down_mbps".into(), json!(down));
            }
        }
        entry
    }

    fn is_ours(&self, entry: &Value) -> bool {
        entry.get("tag").and_then(Value::as_str) == Some(self.tag.as_str())
    }
}

fn outbounds_mut<'a>(doc: &'a mut Map<String, Value>, path: &Path) -> Result<&'a mut Vec<Value>> {
    match doc
        .entry("outbounds")
        .or_insert_with(|| Value::Array(Vec::new()))
    {
        Value::Array(list) => Ok(list),
        _ => Err(EgressError::Configuration(format!(
            "'outbounds' in {} is not an array",
            path.display()
        ))),
    }
}

#[async_trait]
impl OutboundConfigurator for JsonOutboundFile {
    async fn apply_proxy(&self, proxy: &OutboundProxy) -> Result<()> {
        let mut doc = self.load().await?.unwrap_or_default();
        let entry = self.entry(proxy);
        let list = outbounds_mut(&mut doc, &self.path)?;
        match list.iter_mut().find(|e| self.is_ours(e)) {
            Some(existing) if *existing == entry => {
                tracing::debug!("egress: outbound '{}' already current", self.tag);
                return Ok(());
            }
            Some(existing) => *existing = entry,
            None => list.insert(0, entry),
        }
        self.save(&doc).await?;
        tracing::info!(
            "egress: outbound '{}' -> {} written to {}",
            self.tag,
            proxy.address(),
            self.path.display()
        );
        Ok(())
    }

    async fn clear_proxy(&self) -> Result<()> {
        let Some(mut doc) = self.load().await? else {
            return Ok(());
        };
        let list = outbounds_mut(&mut doc, &self.path)?;
        let before = list.len();
        list.retain(|e| !self.is_ours(e));
        if list.len() == before {
            return Ok(());
        }
        self.save(&doc).await?;
        tracing::info!("egress: outbound '{}' removed", self.tag);
        Ok(())
    }
}
