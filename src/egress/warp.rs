//! `warp-cli` backed implementation of [`TunnelClient`].
//!
//! Drives the Cloudflare WARP daemon through its CLI. Newer `warp-cli`
//! releases renamed several subcommands (`set-mode` → `mode`,
//! `set-proxy-port` → `proxy port`); both spellings are tried.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::client::{ClientOptions, ClientProbe, ClientType, TunnelClient};
use super::command::{render_command, CommandOutput, CommandRunner};
use super::error::{EgressError, Result};
use super::probe::{parse_trace, HealthProbe, NetworkProbes, TRACE_URL};

pub const WARP_CLI: &str = "warp-cli";

/// Managed-deployment file read by the WARP daemon at startup.
pub const DEFAULT_MDM_PATH: &str = "/var/lib/cloudflare-warp/mdm.xml";

const OS_RELEASE_PATH: &str = "/etc/os-release";

const DEBIAN_INSTALL: &str = r#"set -e
curl -fsSL https://pkg.cloudflareclient.com/pubkey.gpg | gpg --yes --dearmor --output /usr/share/keyrings/cloudflare-warp-archive-keyring.gpg
echo "deb [signed-by=/usr/share/keyrings/cloudflare-warp-archive-keyring.gpg] https://pkg.cloudflareclient.com/ $(lsb_release -cs) main" > /etc/apt/sources.list.d/cloudflare-client.list
apt-get update
DEBIAN_FRONTEND=noninteractive apt-get install -y cloudflare-warp
systemctl enable --now warp-svc || true
"#;

const REDHAT_INSTALL: &str = r#"set -e
curl -fsSL https://pkg.cloudflareclient.com/cloudflare-warp-ascii.repo -o /etc/yum.repos.d/cloudflare-warp.repo
if command -v dnf >/dev/null 2>&1; then dnf install -y cloudflare-warp; else yum install -y cloudflare-warp; fi
systemctl enable --now warp-svc || true
"#;

/// Linux distribution families with a vendor package repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Debian,
    RedHat,
}

impl OsFamily {
    fn install_script(self) -> &'static str {
        match self {
            Self::Debian => DEBIAN_INSTALL,
            Self::RedHat => REDHAT_INSTALL,
        }
    }
}

/// Detect the distribution family from `/etc/os-release` content.
pub fn detect_os_family(os_release: &str) -> Option<OsFamily> {
    let mut ids = Vec::new();
    for line in os_release.lines() {
        if let Some(value) = line
            .strip_prefix("ID=")
            .or_else(|| line.strip_prefix("ID_LIKE="))
        {
            ids.extend(
                value
                    .trim_matches('"')
                    .split_whitespace()
                    .map(str::to_ascii_lowercase),
            );
        }
    }
    ids.iter().find_map(|id| match id.as_str() {
        "debian" | "ubuntu" => Some(OsFamily::Debian),
        "rhel" | "centos" | "fedora" | "rocky" | "almalinux" => Some(OsFamily::RedHat),
        _ => None,
    })
}

/// Parsed `warp-cli status` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarpStatus {
    pub connected: bool,
    pub registration_missing: bool,
    pub summary: String,
}

pub fn parse_status(output: &str) -> WarpStatus {
    let summary = output
        .lines()
        .find_map(|l| l.trim().strip_prefix("Status update:"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| output.trim().to_string());
    WarpStatus {
        connected: summary.eq_ignore_ascii_case("connected"),
        registration_missing: output.to_ascii_lowercase().contains("registration missing"),
        summary,
    }
}

/// Extract `(proxy_mode, proxy_port)` from `warp-cli settings` output.
///
/// Recognises `Mode: WarpProxy on port 40000` and a separate
/// `WARP Proxy Port: 40000` line.
pub fn parse_settings(output: &str) -> (bool, Option<u16>) {
    let mut proxy_mode = false;
    let mut port = None;
    for line in output.lines() {
        let lower = line.trim().to_ascii_lowercase();
        if let Some(mode) = mode_value(&lower) {
            proxy_mode = mode.contains("proxy");
            if let Some(rest) = mode.split("port").nth(1) {
                port = rest.trim().parse().ok().or(port);
            }
        } else if lower.contains("proxy port:") {
            if let Some(value) = lower.rsplit(':').next() {
                port = value.trim().parse().ok().or(port);
            }
        }
    }
    (proxy_mode, port)
}

/// Value after a standalone `Mode:` label, e.g. in `(user set)\tMode: ...`.
fn mode_value(line: &str) -> Option<&str> {
    let idx = line.find("mode:")?;
    let standalone = line[..idx]
        .chars()
        .next_back()
        .map_or(true, |c| !c.is_ascii_alphanumeric());
    standalone.then(|| &line[idx + "mode:".len()..])
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render the managed-deployment `mdm.xml` for a fleet enrollment.
pub fn render_mdm_xml(options: &ClientOptions) -> String {
    let mut xml = String::from("<dict>\n");
    if let Some(org) = options.organization.as_deref() {
        xml.push_str(&format!(
            "  <key>organization</key>\n  <string>{}</string>\n",
            xml_escape(org)
        ));
    }
    xml.push_str(&format!(
        "  <key>auto_connect</key>\n  <integer>{}</integer>\n",
        u8::from(options.auto_connect)
    ));
    xml.push_str("  <key>service_mode</key>\n  <string>proxy</string>\n");
    xml.push_str(&format!(
        "  <key>proxy_port</key>\n  <integer>{}</integer>\n",
        options.proxy_port
    ));
    xml.push_str("  <key>onboarding</key>\n  <false/>\n");
    xml.push_str("</dict>\n");
    xml
}

pub struct WarpCli {
    runner: Arc<dyn CommandRunner>,
    installer: Arc<dyn CommandRunner>,
    binary: String,
    mdm_path: PathBuf,
    os_release_path: PathBuf,
    probes: NetworkProbes,
}

impl WarpCli {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            installer: Arc::clone(&runner),
            runner,
            binary: WARP_CLI.to_string(),
            mdm_path: PathBuf::from(DEFAULT_MDM_PATH),
            os_release_path: PathBuf::from(OS_RELEASE_PATH),
            probes: NetworkProbes::new(Duration::from_secs(5)),
        }
    }

    /// Resolve `warp-cli` from `PATH` when present.
    pub fn discover(runner: Arc<dyn CommandRunner>) -> Self {
        let mut cli = Self::new(runner);
        if let Ok(path) = which::which(WARP_CLI) {
            cli.binary = path.display().to_string();
        }
        cli
    }

    /// Runner used for the (long-running) package installation.
    pub fn with_installer(mut self, installer: Arc<dyn CommandRunner>) -> Self {
        self.installer = installer;
        self
    }

    pub fn with_mdm_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mdm_path = path.into();
        self
    }

    pub fn with_os_release(mut self, path: impl Into<PathBuf>) -> Self {
        self.os_release_path = path.into();
        self
    }

    async fn cli(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push("--accept-tos");
        full.extend_from_slice(args);
        self.runner.run(&self.binary, &full).await
    }

    /// Run `args`, mapping a non-zero exit through `err`.
    async fn cli_ok(&self, args: &[&str], err: fn(String) -> EgressError) -> Result<String> {
        let out = self.cli(args).await?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(err(format!(
                "`{}` failed: {}",
                render_command(WARP_CLI, args),
                out.diagnostic()
            )))
        }
    }

    /// Try the current subcommand spelling, then the legacy one.
    async fn cli_compat(
        &self,
        current: &[&str],
        legacy: &[&str],
        err: fn(String) -> EgressError,
    ) -> Result<()> {
        let out = self.cli(current).await?;
        if out.success {
            return Ok(());
        }
        let diag = out.diagnostic();
        if diag.contains("unrecognized subcommand") || diag.contains("unexpected argument") {
            tracing::debug!("egress: falling back to legacy warp-cli syntax");
            return self.cli_ok(legacy, err).await.map(|_| ());
        }
        Err(err(format!(
            "`{}` failed: {diag}",
            render_command(WARP_CLI, current)
        )))
    }
}

#[async_trait]
impl TunnelClient for WarpCli {
    fn name(&self) -> &str {
        WARP_CLI
    }

    async fn is_installed(&self) -> bool {
        matches!(
            self.runner.run(&self.binary, &["--version"]).await,
            Ok(out) if out.success
        )
    }

    async fn install(&self) -> Result<()> {
        if std::env::consts::OS != "linux" {
            return Err(EgressError::Installation(format!(
                "unsupported OS: {}",
                std::env::consts::OS
            )));
        }
        let os_release = tokio::fs::read_to_string(&self.os_release_path)
            .await
            .map_err(|e| {
                EgressError::Installation(format!(
                    "cannot read {}: {e}",
                    self.os_release_path.display()
                ))
            })?;
        let family = detect_os_family(&os_release).ok_or_else(|| {
            EgressError::Installation("unsupported Linux distribution".into())
        })?;

        tracing::info!("egress: installing cloudflare-warp for {family:?} family");
        let out = self
            .installer
            .run("sh", &["-c", family.install_script()])
            .await
            .map_err(|e| EgressError::Installation(e.to_string()))?;
        if !out.success {
            return Err(EgressError::Installation(out.diagnostic()));
        }
        Ok(())
    }

    async fn configure(&self, options: &ClientOptions) -> Result<()> {
        if let Some(org) = options.organization.as_deref() {
            if let Some(parent) = self.mdm_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&self.mdm_path, render_mdm_xml(options))
                .await
                .map_err(|e| {
                    EgressError::Configuration(format!(
                        "failed to write {}: {e}",
                        self.mdm_path.display()
                    ))
                })?;
            tracing::info!(
                "egress: wrote managed deployment for organization '{org}' to {}",
                self.mdm_path.display()
            );
        }

        let port = options.proxy_port.to_string();
        self.cli_compat(
            &["proxy", "port", port.as_str()],
            &["set-proxy-port", port.as_str()],
            EgressError::Configuration,
        )
        .await?;

        if let Some(key) = options.license_key.as_deref() {
            let status = self.cli(&["status"]).await?;
            if status.success && !parse_status(&status.stdout).registration_missing {
                self.cli_compat(
                    &["registration", "license", key],
                    &["set-license", key],
                    EgressError::Configuration,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn register(&self, options: &ClientOptions) -> Result<()> {
        let mut args = vec!["registration", "new"];
        if options.client_type == ClientType::Teams {
            if let Some(org) = options.organization.as_deref() {
                args.push(org);
            }
        }
        let out = self.cli(&args).await?;
        if !out.success {
            let diag = out.diagnostic();
            if !diag.to_ascii_lowercase().contains("already") {
                let legacy = self.cli(&["register"]).await?;
                if !legacy.success {
                    return Err(EgressError::Connection(format!(
                        "registration failed: {diag}"
                    )));
                }
            }
        }
        if let Some(key) = options.license_key.as_deref() {
            self.cli_compat(
                &["registration", "license", key],
                &["set-license", key],
                EgressError::Connection,
            )
            .await?;
        }
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        self.cli_ok(&["connect"], EgressError::Connection)
            .await
            .map(|_| ())
    }

    async fn disconnect(&self) -> Result<()> {
        self.cli_ok(&["disconnect"], EgressError::Connection)
            .await
            .map(|_| ())
    }

    async fn enable_proxy_mode(&self, port: u16) -> Result<()> {
        let port = port.to_string();
        self.cli_compat(
            &["proxy", "port", port.as_str()],
            &["set-proxy-port", port.as_str()],
            EgressError::ProxyMode,
        )
        .await?;
        self.cli_compat(
            &["mode", "proxy"],
            &["set-mode", "proxy"],
            EgressError::ProxyMode,
        )
        .await
    }

    async fn disable_proxy_mode(&self) -> Result<()> {
        self.cli_compat(&["mode", "warp"], &["set-mode", "warp"], EgressError::ProxyMode)
            .await
    }

    async fn probe(&self) -> Result<ClientProbe> {
        if !self.is_installed().await {
            return Ok(ClientProbe::default());
        }
        let out = self.cli(&["status"]).await?;
        let text = if out.success {
            out.stdout.clone()
        } else {
            out.diagnostic()
        };
        let status = parse_status(&text);
        let mut probe = ClientProbe {
            installed: true,
            registered: out.success && !status.registration_missing,
            connected: out.success && status.connected,
            proxy_mode: false,
            proxy_port: None,
            detail: status.summary,
        };
        if probe.connected {
            let settings = self.cli(&["settings"]).await?;
            if settings.success {
                let (proxy_mode, port) = parse_settings(&settings.stdout);
                probe.proxy_mode = proxy_mode;
                probe.proxy_port = port;
            }
        }
        Ok(probe)
    }

    async fn trace(&self, proxy_port: u16) -> Option<super::probe::TraceInfo> {
        match self.probes.fetch(Some(proxy_port), TRACE_URL).await {
            Ok(outcome) if outcome.is_success() => parse_trace(&outcome.body),
            Ok(outcome) => {
                tracing::debug!("egress: trace returned HTTP {}", outcome.status);
                None
            }
            Err(e) => {
                tracing::debug!("egress: trace through proxy failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Runner answering from a table keyed by the joined argument list.
    #[derive(Default)]
    struct ScriptedRunner {
        responses: Mutex<HashMap<String, CommandOutput>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn on(self, args: &str, output: CommandOutput) -> Self {
            self.responses.lock().insert(args.to_string(), output);
            self
        }
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, _program: &str, args: &[&str]) -> Result<CommandOutput> {
            let key = args.join(" ");
            self.calls.lock().push(key.clone());
            Ok(self
                .responses
                .lock()
                .get(&key)
                .cloned()
                .unwrap_or_else(|| CommandOutput::failed(format!("unscripted: {key}"))))
        }
    }

    fn cli(runner: ScriptedRunner) -> (Arc<ScriptedRunner>, WarpCli) {
        let runner = Arc::new(runner);
        (runner.clone(), WarpCli::new(runner))
    }

    #[test]
    fn detects_os_families() {
        let ubuntu = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"22.04\"\n";
        assert_eq!(detect_os_family(ubuntu), Some(OsFamily::Debian));
        let rocky = "ID=\"rocky\"\nID_LIKE=\"rhel centos fedora\"\n";
        assert_eq!(detect_os_family(rocky), Some(OsFamily::RedHat));
        let mint = "ID=linuxmint\nID_LIKE=\"ubuntu debian\"\n";
        assert_eq!(detect_os_family(mint), Some(OsFamily::Debian));
        assert_eq!(detect_os_family("ID=alpine\n"), None);
    }

    #[test]
    fn parses_status_output() {
        let up = parse_status("Status update: Connected\nNetwork: healthy\n");
        assert!(up.connected);
        assert!(!up.registration_missing);
        let down = parse_status("Status update: Disconnected\nReason: Manual Disconnection\n");
        assert!(!down.connected);
        assert_eq!(down.summary, "Disconnected");
        let missing = parse_status("Status update: Registration Missing due to: Daemon Startup\n");
        assert!(missing.registration_missing);
        assert!(!missing.connected);
    }

    #[test]
    fn parses_settings_output() {
        assert_eq!(
            parse_settings("Merged configuration:\n(user set)\tMode: WarpProxy on port 40000\n"),
            (true, Some(40000))
        );
        assert_eq!(
            parse_settings("Mode: WarpProxy on port 40000\n"),
            (true, Some(40000))
        );
        assert_eq!(
            parse_settings("Mode: proxy\nWARP Proxy Port: 41000\n"),
            (true, Some(41000))
        );
        assert_eq!(parse_settings("Mode: Warp\n"), (false, None));
    }

    #[test]
    fn mdm_xml_contains_fleet_settings() {
        let options = ClientOptions {
            organization: Some("acme & co".into()),
            proxy_port: 41000,
            ..ClientOptions::default()
        };
        let xml = render_mdm_xml(&options);
        assert!(xml.contains("<string>acme &amp; co</string>"));
        assert!(xml.contains("<key>proxy_port</key>\n  <integer>41000</integer>"));
        assert!(xml.contains("<key>auto_connect</key>\n  <integer>1</integer>"));
        assert!(xml.starts_with("<dict>"));
    }

    #[tokio::test]
    async fn probe_not_installed() {
        let (_, cli) = cli(ScriptedRunner::default());
        let probe = cli.probe().await.unwrap();
        assert!(!probe.installed);
    }

    #[tokio::test]
    async fn probe_connected_in_proxy_mode() {
        let (_, cli) = cli(ScriptedRunner::default()
            .on("--version", CommandOutput::ok("warp-cli 2024.6.415"))
            .on("--accept-tos status", CommandOutput::ok("Status update: Connected\n"))
            .on(
                "--accept-tos settings",
                CommandOutput::ok("Mode: WarpProxy on port 40000\n"),
            ));
        let probe = cli.probe().await.unwrap();
        assert!(probe.installed && probe.registered && probe.connected);
        assert!(probe.proxy_mode);
        assert_eq!(probe.proxy_port, Some(40000));
    }

    #[tokio::test]
    async fn probe_registration_missing() {
        let (runner, cli) = cli(ScriptedRunner::default()
            .on("--version", CommandOutput::ok("warp-cli 2024.6.415"))
            .on(
                "--accept-tos status",
                CommandOutput::ok("Status update: Registration Missing\n"),
            ));
        let probe = cli.probe().await.unwrap();
        assert!(probe.installed);
        assert!(!probe.registered);
        assert!(!runner.calls().iter().any(|c| c.ends_with("settings")));
    }

    #[tokio::test]
    async fn register_tolerates_existing_registration() {
        let (_, cli) = cli(ScriptedRunner::default().on(
            "--accept-tos registration new",
            CommandOutput::failed("Error: Old registration is still around. Registration already exists"),
        ));
        cli.register(&ClientOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn proxy_mode_falls_back_to_legacy_syntax() {
        let (runner, cli) = cli(ScriptedRunner::default()
            .on(
                "--accept-tos proxy port 40000",
                CommandOutput::failed("error: unrecognized subcommand 'proxy'"),
            )
            .on("--accept-tos set-proxy-port 40000", CommandOutput::ok("Success"))
            .on(
                "--accept-tos mode proxy",
                CommandOutput::failed("error: unrecognized subcommand 'mode'"),
            )
            .on("--accept-tos set-mode proxy", CommandOutput::ok("Success")));
        cli.enable_proxy_mode(40000).await.unwrap();
        let calls = runner.calls();
        assert!(calls.contains(&"--accept-tos set-mode proxy".to_string()));
    }

    #[tokio::test]
    async fn proxy_mode_rejection_is_proxy_mode_error() {
        let (_, cli) = cli(ScriptedRunner::default()
            .on("--accept-tos proxy port 40000", CommandOutput::ok("Success"))
            .on(
                "--accept-tos mode proxy",
                CommandOutput::failed("Error: Mode not supported on this platform"),
            ));
        let err = cli.enable_proxy_mode(40000).await.unwrap_err();
        assert!(matches!(err, EgressError::ProxyMode(_)));
        assert!(err.to_string().contains("Mode not supported"));
    }

    #[tokio::test]
    async fn configure_writes_mdm_for_organization() {
        let dir = tempfile::tempdir().unwrap();
        let mdm = dir.path().join("warp").join("mdm.xml");
        let runner = Arc::new(
            ScriptedRunner::default()
                .on("--accept-tos proxy port 40000", CommandOutput::ok("Success")),
        );
        let cli = WarpCli::new(runner).with_mdm_path(&mdm);
        let options = ClientOptions {
            client_type: ClientType::Teams,
            organization: Some("acme".into()),
            ..ClientOptions::default()
        };
        cli.configure(&options).await.unwrap();
        let written = std::fs::read_to_string(&mdm).unwrap();
        assert!(written.contains("<string>acme</string>"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn install_goes_through_the_installer_runner() {
        let dir = tempfile::tempdir().unwrap();
        let os_release = dir.path().join("os-release");
        std::fs::write(&os_release, "ID=ubuntu\nID_LIKE=debian\n").unwrap();
        let installer = Arc::new(
            ScriptedRunner::default().on(&format!("-c {DEBIAN_INSTALL}"), CommandOutput::ok("")),
        );
        let (runner, cli) = cli(ScriptedRunner::default());
        let cli = cli
            .with_os_release(&os_release)
            .with_installer(installer.clone());

        cli.install().await.unwrap();
        assert_eq!(installer.calls().len(), 1);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn install_rejects_unknown_distribution() {
        let dir = tempfile::tempdir().unwrap();
        let os_release = dir.path().join("os-release");
        std::fs::write(&os_release, "ID=alpine\n").unwrap();
        let (_, cli) = cli(ScriptedRunner::default());
        let cli = cli.with_os_release(&os_release);
        let err = cli.install().await.unwrap_err();
        assert!(matches!(err, EgressError::Installation(_)));
    }
}
