//! socat Unix-socket bridges between the sandbox and host proxies.
//!
//! bwrap's network namespace cuts the sandbox off from host TCP, so each
//! proxy gets a Unix socket bridge: socat on the host relays socket →
//! proxy port, and a peer socat inside the sandbox relays a well-known TCP
//! port → socket. Reverse bridges run the same trick inbound for exposed
//! ports.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::FenceError;

/// Random 16-hex token tying an invocation's socket files together.
fn socket_token() -> String {
    let bytes: [u8; 8] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn require_socat() -> Result<PathBuf, FenceError> {
    which::which("socat").map_err(|e| {
        FenceError::PrerequisiteMissing(format!("socat is required on Linux but not found: {e}"))
    })
}

/// Outbound bridges: one Unix socket per proxy, relayed to the host
/// listener. Killed and removed on cleanup.
pub struct LinuxBridge {
    pub http_socket_path: PathBuf,
    pub socks_socket_path: PathBuf,
    http_process: Option<Child>,
    socks_process: Option<Child>,
}

impl LinuxBridge {
    /// Start socat relays for the HTTP and SOCKS proxy ports and wait for
    /// both socket files to appear.
    pub fn new(http_proxy_port: u16, socks_proxy_port: u16) -> Result<LinuxBridge, FenceError> {
        let socat = require_socat()?;
        let token = socket_token();
        let tmp = std::env::temp_dir();
        let http_socket_path = tmp.join(format!("fence-http-{token}.sock"));
        let socks_socket_path = tmp.join(format!("fence-socks-{token}.sock"));

        let mut bridge = LinuxBridge {
            http_socket_path,
            socks_socket_path,
            http_process: None,
            socks_process: None,
        };

        bridge.http_process = Some(spawn_socat(
            &socat,
            &format!(
                "UNIX-LISTEN:{},fork,reuseaddr",
                bridge.http_socket_path.display()
            ),
            &format!("TCP:localhost:{http_proxy_port}"),
        )?);
        bridge.socks_process = Some(
            spawn_socat(
                &socat,
                &format!(
                    "UNIX-LISTEN:{},fork,reuseaddr",
                    bridge.socks_socket_path.display()
                ),
                &format!("TCP:localhost:{socks_proxy_port}"),
            )
            .inspect_err(|_| bridge.cleanup())?,
        );

        // socat creates the listening sockets asynchronously.
        for _ in 0..50 {
            if bridge.http_socket_path.exists() && bridge.socks_socket_path.exists() {
                debug!(
                    http = %bridge.http_socket_path.display(),
                    socks = %bridge.socks_socket_path.display(),
                    "outbound bridges ready"
                );
                return Ok(bridge);
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        bridge.cleanup();
        Err(FenceError::ResourceUnavailable(
            "timeout waiting for bridge sockets to be created".into(),
        ))
    }

    /// Bridge with fabricated socket paths and no processes, for argv tests.
    #[cfg(test)]
    pub(crate) fn fake(http_socket_path: PathBuf, socks_socket_path: PathBuf) -> LinuxBridge {
        LinuxBridge {
            http_socket_path,
            socks_socket_path,
            http_process: None,
            socks_process: None,
        }
    }

    /// Kill the relay processes and remove the socket files.
    pub fn cleanup(&mut self) {
        for child in [self.http_process.take(), self.socks_process.take()]
            .into_iter()
            .flatten()
        {
            reap(child);
        }
        let _ = std::fs::remove_file(&self.http_socket_path);
        let _ = std::fs::remove_file(&self.socks_socket_path);
        debug!("outbound bridges cleaned up");
    }
}

impl Drop for LinuxBridge {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Inbound bridges: the host listens on each exposed port and relays into
/// the sandbox via a Unix socket the sandbox-side socat creates.
pub struct ReverseBridge {
    pub ports: Vec<u16>,
    pub socket_paths: Vec<PathBuf>,
    processes: Vec<Child>,
}

impl ReverseBridge {
    pub fn new(ports: &[u16]) -> Result<Option<ReverseBridge>, FenceError> {
        if ports.is_empty() {
            return Ok(None);
        }
        let socat = require_socat()?;
        let token = socket_token();
        let tmp = std::env::temp_dir();

        let mut bridge = ReverseBridge {
            ports: ports.to_vec(),
            socket_paths: Vec::new(),
            processes: Vec::new(),
        };

        for &port in ports {
            let socket_path = tmp.join(format!("fence-rev-{port}-{token}.sock"));
            bridge.socket_paths.push(socket_path.clone());

            // The sandbox side creates the socket; retry until it exists.
            let child = spawn_socat(
                &socat,
                &format!("TCP-LISTEN:{port},fork,reuseaddr"),
                &format!("UNIX-CONNECT:{},retry=50,interval=0.1", socket_path.display()),
            )
            .inspect_err(|_| bridge.cleanup())?;
            bridge.processes.push(child);
        }

        debug!(ports = ?bridge.ports, "reverse bridges ready");
        Ok(Some(bridge))
    }

    pub fn cleanup(&mut self) {
        for child in self.processes.drain(..) {
            reap(child);
        }
        for socket_path in &self.socket_paths {
            let _ = std::fs::remove_file(socket_path);
        }
        debug!("reverse bridges cleaned up");
    }
}

impl Drop for ReverseBridge {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn spawn_socat(socat: &PathBuf, from: &str, to: &str) -> Result<Child, FenceError> {
    debug!(%from, %to, "starting socat bridge");
    Command::new(socat)
        .arg(from)
        .arg(to)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| FenceError::ResourceUnavailable(format!("failed to start socat bridge: {e}")))
}

fn reap(mut child: Child) {
    if let Err(e) = child.kill() {
        warn!(error = %e, "failed to kill bridge process");
    }
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_token_is_16_hex() {
        let token = socket_token();
        assert_eq!(token.len(), 16);
        assert!(token.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn tokens_are_unique_per_invocation() {
        assert_ne!(socket_token(), socket_token());
    }

    #[test]
    fn reverse_bridge_without_ports_is_none() {
        assert!(ReverseBridge::new(&[]).unwrap().is_none());
    }

    #[test]
    fn outbound_bridge_lifecycle() {
        if which::which("socat").is_err() {
            return; // environment without socat; covered in CI images that have it
        }
        let mut bridge = LinuxBridge::new(3128, 1080).unwrap();
        assert!(bridge.http_socket_path.exists());
        assert!(bridge.socks_socket_path.exists());
        let http_path = bridge.http_socket_path.clone();
        bridge.cleanup();
        assert!(!http_path.exists());
    }
}
