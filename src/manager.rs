//! Sandbox manager: proxy and bridge lifecycle plus command wrapping.
//!
//! Single-owner: one manager per invocation. It binds the filtering
//! proxies, starts the Linux bridges, runs the preflight analyzer, and
//! delegates to the platform confinement builder. The proxies it owns are
//! internally concurrent; the manager itself is not thread-safe.

use std::sync::Arc;

use tracing::{debug, info};

use crate::analyzer::{self, Verdict};
use crate::config::Config;
use crate::errors::FenceError;
use crate::proxy::socks::SocksPolicy;
use crate::proxy::{self, ProxyHandle, ViolationLog, bind_proxy_port};

#[cfg(target_os = "linux")]
use crate::sandbox::bridge::{LinuxBridge, ReverseBridge};
#[cfg(target_os = "linux")]
use crate::sandbox::features::LinuxFeatures;
#[cfg(any(target_os = "linux", target_os = "macos"))]
use crate::sandbox::ConfinementBuilder;

/// Behavior toggles resolved from the CLI.
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    pub debug: bool,
    /// Monitor mode echoes every violation record to stderr.
    pub monitor: bool,
}

/// Owns the proxies, bridges, and temp artifacts of one invocation.
pub struct SandboxManager {
    config: Config,
    options: ManagerOptions,
    violations: Arc<ViolationLog>,
    http: Option<ProxyHandle>,
    socks: Option<ProxyHandle>,
    artifacts: Vec<std::path::PathBuf>,

    #[cfg(target_os = "linux")]
    features: LinuxFeatures,
    #[cfg(target_os = "linux")]
    bridge: Option<LinuxBridge>,
    #[cfg(target_os = "linux")]
    reverse_bridge: Option<ReverseBridge>,
}

impl SandboxManager {
    /// Bind both proxies (fixed ports honored, 0 = ephemeral), start
    /// listener tasks, and on Linux start the outbound bridges.
    pub fn initialize(config: Config, options: ManagerOptions) -> Result<Self, FenceError> {
        let violations = ViolationLog::new(options.monitor);

        let http_listener = bind_proxy_port(config.network.http_proxy_port).map_err(|e| {
            FenceError::ResourceUnavailable(format!(
                "cannot bind HTTP proxy port {}: {e}",
                config.network.http_proxy_port
            ))
        })?;
        let socks_listener = bind_proxy_port(config.network.socks_proxy_port).map_err(|e| {
            FenceError::ResourceUnavailable(format!(
                "cannot bind SOCKS proxy port {}: {e}",
                config.network.socks_proxy_port
            ))
        })?;

        let http = proxy::http::start(
            http_listener,
            Arc::new(config.network.clone()),
            Arc::clone(&violations),
        )?;
        let socks = proxy::socks::start(
            socks_listener,
            Arc::new(SocksPolicy {
                network: config.network.clone(),
                ssh: config.ssh.clone(),
            }),
            Arc::clone(&violations),
        )?;
        info!(http = http.port(), socks = socks.port(), "proxies listening");

        #[cfg(target_os = "linux")]
        let (features, bridge) = {
            let features = LinuxFeatures::detect();
            if !features.minimum_viable() {
                let mut missing = Vec::new();
                if !features.has_bwrap {
                    missing.push("bwrap");
                }
                if !features.has_socat {
                    missing.push("socat");
                }
                return Err(FenceError::PrerequisiteMissing(format!(
                    "required tools not found on PATH: {}",
                    missing.join(", ")
                )));
            }
            let bridge = LinuxBridge::new(http.port(), socks.port())?;
            (features, Some(bridge))
        };

        Ok(SandboxManager {
            config,
            options,
            violations,
            http: Some(http),
            socks: Some(socks),
            artifacts: Vec::new(),
            #[cfg(target_os = "linux")]
            features,
            #[cfg(target_os = "linux")]
            bridge,
            #[cfg(target_os = "linux")]
            reverse_bridge: None,
        })
    }

    pub fn http_port(&self) -> u16 {
        self.http.as_ref().map(|h| h.port()).unwrap_or(0)
    }

    pub fn socks_port(&self) -> u16 {
        self.socks.as_ref().map(|h| h.port()).unwrap_or(0)
    }

    pub fn violations(&self) -> Arc<ViolationLog> {
        Arc::clone(&self.violations)
    }

    #[cfg(target_os = "linux")]
    pub fn features(&self) -> &LinuxFeatures {
        &self.features
    }

    /// Run the preflight analyzer, then construct the platform-confined
    /// invocation. No child is spawned here.
    pub fn wrap_command(&mut self, command: &str) -> Result<String, FenceError> {
        if let Verdict::Deny { pattern, command } = analyzer::analyze(command, &self.config.command)
        {
            return Err(FenceError::CommandDenied { command, pattern });
        }

        // SSH invocations get the host+command rules at preflight; the
        // SOCKS-layer inspector re-checks hosts at connect time. An empty
        // ssh block means no SSH enforcement.
        for invocation in if self.config.ssh.is_empty() {
            Vec::new()
        } else {
            analyzer::extract_ssh_invocations(command)
        } {
            let verdict = proxy::ssh::evaluate_command(
                &self.config.ssh,
                &self.config.command,
                &invocation.host,
                invocation.command.as_deref(),
            );
            if let proxy::ssh::SshVerdict::Deny(reason) = verdict {
                self.violations
                    .record("ssh", &invocation.host, reason.clone());
                return Err(FenceError::CommandDenied {
                    command: match &invocation.command {
                        Some(c) => format!("ssh {} {}", invocation.host, c),
                        None => format!("ssh {}", invocation.host),
                    },
                    pattern: reason,
                });
            }
        }

        debug!(command, "preflight passed; building confinement");
        self.build_confinement(command)
    }

    #[cfg(target_os = "linux")]
    fn build_confinement(&mut self, command: &str) -> Result<String, FenceError> {
        use crate::sandbox::linux::{LinuxBuilder, LinuxSandboxOptions};

        let builder = LinuxBuilder::new(
            self.features.clone(),
            LinuxSandboxOptions {
                debug: self.options.debug,
                ..Default::default()
            },
            self.bridge.as_ref(),
            self.reverse_bridge.as_ref(),
        );
        let wrapped = builder.wrap(&self.config, command)?;
        self.artifacts.extend(builder.take_artifacts());
        Ok(wrapped)
    }

    #[cfg(target_os = "macos")]
    fn build_confinement(&mut self, command: &str) -> Result<String, FenceError> {
        use crate::sandbox::macos::MacosBuilder;

        MacosBuilder {
            http_port: self.http_port(),
            socks_port: self.socks_port(),
        }
        .wrap(&self.config, command)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn build_confinement(&mut self, _command: &str) -> Result<String, FenceError> {
        Err(FenceError::PrerequisiteMissing(
            "sandboxing is only supported on Linux and macOS".into(),
        ))
    }

    /// Allocate reverse bridges so the host can reach services inside the
    /// sandbox on the given ports.
    pub fn set_exposed_ports(&mut self, ports: &[u16]) -> Result<(), FenceError> {
        if ports.is_empty() {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        {
            self.reverse_bridge = ReverseBridge::new(ports)?;
        }
        #[cfg(not(target_os = "linux"))]
        {
            // The macOS sandbox shares the host network namespace; exposed
            // ports only need allowLocalBinding in the profile.
            debug!(?ports, "exposed ports require no bridge on this platform");
        }
        Ok(())
    }

    /// Stop proxies, kill bridges, and remove temp artifacts. Idempotent.
    pub fn cleanup(&mut self) {
        #[cfg(target_os = "linux")]
        {
            if let Some(mut bridge) = self.bridge.take() {
                bridge.cleanup();
            }
            if let Some(mut reverse) = self.reverse_bridge.take() {
                reverse.cleanup();
            }
        }
        if let Some(mut http) = self.http.take() {
            http.stop();
        }
        if let Some(mut socks) = self.socks.take() {
            socks.stop();
        }
        for path in self.artifacts.drain(..) {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for SandboxManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Environment variables pointing in-sandbox clients at the host proxies.
///
/// `NO_PROXY` carries loopback plus the RFC 1918 ranges so local traffic
/// never detours through the filter.
pub fn proxy_env_vars(http_port: u16, socks_port: u16) -> Vec<(String, String)> {
    let mut vars: Vec<(String, String)> = vec![
        ("FENCE_SANDBOX".into(), "1".into()),
        ("TMPDIR".into(), "/tmp/fence".into()),
    ];

    if http_port == 0 && socks_port == 0 {
        return vars;
    }

    let no_proxy = [
        "localhost",
        "127.0.0.1",
        "::1",
        "*.local",
        ".local",
        "169.254.0.0/16",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
    ]
    .join(",");
    vars.push(("NO_PROXY".into(), no_proxy.clone()));
    vars.push(("no_proxy".into(), no_proxy));

    if http_port > 0 {
        let url = format!("http://localhost:{http_port}");
        for key in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
            vars.push((key.into(), url.clone()));
        }
    }

    if socks_port > 0 {
        let url = format!("socks5h://localhost:{socks_port}");
        for key in ["ALL_PROXY", "all_proxy"] {
            vars.push((key.into(), url.clone()));
        }
        vars.push((
            "GIT_SSH_COMMAND".into(),
            format!("ssh -o ProxyCommand='nc -X 5 -x localhost:{socks_port} %h %p'"),
        ));
    }

    vars
}
