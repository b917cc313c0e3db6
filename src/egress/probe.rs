//! Network probes used by health checks and connectivity tests.
//!
//! Probes exercise the real egress path: a SOCKS5 greeting on the local
//! proxy port, HTTP fetches through the proxy, and name resolution.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Connectivity check URL; answers HTTP 204.
pub const CONNECTIVITY_URL: &str = "http://connectivitycheck.gstatic.com/generate_204";

/// Cloudflare trace endpoint; reports the egress IP and whether WARP is on.
pub const TRACE_URL: &str = "https://www.cloudflare.com/cdn-cgi/trace";

/// Name resolved by the DNS check.
pub const DNS_PROBE_HOST: &str = "cloudflare.com";

/// Default timeout for a single probe request.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Egress identity reported by the trace endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceInfo {
    pub ip: String,
    pub location: Option<String>,
    /// `warp=on` or `warp=plus`.
    pub warp: bool,
}

/// Parse the `key=value` body of the trace endpoint.
pub fn parse_trace(body: &str) -> Option<TraceInfo> {
    let mut ip = None;
    let mut location = None;
    let mut warp = false;
    for line in body.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "ip" => ip = Some(value.trim().to_string()),
            "loc" => location = Some(value.trim().to_string()),
            "warp" => warp = matches!(value.trim(), "on" | "plus"),
            _ => {}
        }
    }
    ip.filter(|ip| !ip.is_empty())
        .map(|ip| TraceInfo { ip, location, warp })
}

/// Proxy URL for the local SOCKS5 listener (remote DNS resolution).
pub fn socks_url(port: u16) -> String {
    format!("socks5h://127.0.0.1:{port}")
}

/// HTTP response summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub status: u16,
    pub body: String,
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Plain TCP connect to `127.0.0.1:port`.
    async fn tcp_connect(&self, port: u16) -> Result<()>;

    /// TCP connect plus a SOCKS5 no-auth greeting.
    async fn socks_handshake(&self, port: u16) -> Result<()>;

    /// GET `url`, through the local proxy when `proxy_port` is set.
    async fn fetch(&self, proxy_port: Option<u16>, url: &str) -> Result<FetchOutcome>;

    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Probes against the real network.
#[derive(Debug, Clone)]
pub struct NetworkProbes {
    timeout: Duration,
}

impl NetworkProbes {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for NetworkProbes {
    fn default() -> Self {
        Self::new(PROBE_TIMEOUT)
    }
}

#[async_trait]
impl HealthProbe for NetworkProbes {
    async fn tcp_connect(&self, port: u16) -> Result<()> {
        tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(("127.0.0.1", port)))
            .await
            .context("connect timed out")?
            .with_context(|| format!("nothing listening on 127.0.0.1:{port}"))?;
        Ok(())
    }

    async fn socks_handshake(&self, port: u16) -> Result<()> {
        let handshake = async {
            let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .with_context(|| format!("nothing listening on 127.0.0.1:{port}"))?;
            // VER=5, NMETHODS=1, METHOD=no-auth
            stream.write_all(&[0x05, 0x01, 0x00]).await?;
            let mut reply = [0u8; 2];
            stream
                .read_exact(&mut reply)
                .await
                .context("proxy closed the connection during SOCKS5 greeting")?;
            if reply != [0x05, 0x00] {
                bail!(
                    "unexpected SOCKS5 greeting reply {:#04x} {:#04x}",
                    reply[0],
                    reply[1]
                );
            }
            Ok(())
        };
        tokio::time::timeout(self.timeout, handshake)
            .await
            .context("SOCKS5 greeting timed out")?
    }

    async fn fetch(&self, proxy_port: Option<u16>, url: &str) -> Result<FetchOutcome> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.timeout);
        builder = match proxy_port {
            Some(port) => {
                let proxy = reqwest::Proxy::all(socks_url(port))
                    .map_err(|e| anyhow::anyhow!("invalid proxy URL for port {port}: {e}"))?;
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };
        let client = builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build probe client: {e}"))?;

        let resp = client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Ok(FetchOutcome { status, body })
    }

    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs = tokio::time::timeout(self.timeout, tokio::net::lookup_host((host, 443)))
            .await
            .context("DNS lookup timed out")?
            .with_context(|| format!("failed to resolve {host}"))?;
        let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        if ips.is_empty() {
            bail!("{host} resolved to no addresses");
        }
        Ok(ips)
    }
}
