//! Filtering proxies gating outbound connections against the network policy.
//!
//! Both proxies follow the same lifecycle: bind a loopback listener, accept
//! on a background thread, spawn one handler thread per connection, and shut
//! down when the handle is stopped or dropped. Per-connection state is
//! local; the policy is read-only after initialization, so handlers share it
//! behind an `Arc` without locking.

pub mod http;
pub mod socks;
pub mod ssh;

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::NetworkConfig;
use crate::hosts::any_host_matches;

// ---------------------------------------------------------------------------
// Policy decisions
// ---------------------------------------------------------------------------

/// Why a connection was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// A `deniedDomains` entry matched.
    DeniedByRule(String),
    /// `allowedDomains` is non-empty and nothing matched.
    NotInAllowList,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::DeniedByRule(rule) => write!(f, "denied by rule '{}'", rule),
            DenyReason::NotInAllowList => write!(f, "not in allowedDomains"),
        }
    }
}

/// Decide whether an outbound connection to `host` is permitted.
///
/// `deniedDomains` wins over `allowedDomains`; an empty allow list means
/// any host not explicitly denied is permitted.
pub fn evaluate_domain(network: &NetworkConfig, host: &str) -> Result<(), DenyReason> {
    if let Some(rule) = network
        .denied_domains
        .iter()
        .find(|p| crate::hosts::host_matches(p, host))
    {
        return Err(DenyReason::DeniedByRule(rule.clone()));
    }
    if !network.allowed_domains.is_empty() && !any_host_matches(&network.allowed_domains, host) {
        return Err(DenyReason::NotInAllowList);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Violation records
// ---------------------------------------------------------------------------

/// A single blocked connection or command, self-contained for interleaved
/// logging.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Source layer: "http", "socks", or "ssh".
    pub kind: &'static str,
    pub host: String,
    pub detail: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.host, self.detail)
    }
}

/// Shared sink for violation records. Records always go to tracing; in
/// monitor mode they are echoed to stderr as well.
#[derive(Debug, Default)]
pub struct ViolationLog {
    records: Mutex<Vec<Violation>>,
    echo: AtomicBool,
}

impl ViolationLog {
    pub fn new(echo: bool) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
            echo: AtomicBool::new(echo),
        })
    }

    pub fn record(&self, kind: &'static str, host: &str, detail: impl Into<String>) {
        let violation = Violation {
            kind,
            host: host.to_string(),
            detail: detail.into(),
        };
        warn!(kind, host, detail = %violation.detail, "connection blocked");
        if self.echo.load(Ordering::Relaxed) {
            eprintln!("{}", violation);
        }
        if let Ok(mut records) = self.records.lock() {
            records.push(violation);
        }
    }

    pub fn snapshot(&self) -> Vec<Violation> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Listener lifecycle
// ---------------------------------------------------------------------------

/// Bind a loopback listener on `port` (0 = ephemeral). An already-bound
/// fixed port is retried once before giving up.
pub fn bind_proxy_port(port: u16) -> io::Result<TcpListener> {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            thread::sleep(Duration::from_millis(100));
            TcpListener::bind(("127.0.0.1", port))
        }
        Err(e) => Err(e),
    }
}

/// Handle to a running proxy. Dropping (or calling [`ProxyHandle::stop`])
/// initiates a clean shutdown of the accept loop.
pub struct ProxyHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    listener_thread: Option<thread::JoinHandle<()>>,
}

impl ProxyHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Signal the accept loop to stop and wait for it to exit.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Poke the listener so its non-blocking accept wakes up immediately.
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.listener_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the shared accept loop: poll-accept with a shutdown flag, one
/// handler thread per connection.
pub(crate) fn spawn_accept_loop<F>(
    listener: TcpListener,
    name: &'static str,
    handler: F,
) -> io::Result<ProxyHandle>
where
    F: Fn(TcpStream) + Send + Sync + 'static,
{
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;
    debug!(proxy = name, addr = %addr, "proxy listening");

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let handler = Arc::new(handler);

    let listener_thread = thread::Builder::new()
        .name(format!("{name}-accept"))
        .spawn(move || {
            while !shutdown_flag.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&handler);
                        thread::Builder::new()
                            .name(format!("{name}-conn-{peer}"))
                            .spawn(move || handler(stream))
                            .ok(); // spawn failure just drops the connection
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => {
                        if shutdown_flag.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(proxy = name, error = %e, "accept error");
                        thread::sleep(Duration::from_millis(50));
                    }
                }
            }
            debug!(proxy = name, "accept loop exiting");
        })?;

    Ok(ProxyHandle {
        addr,
        shutdown,
        listener_thread: Some(listener_thread),
    })
}

/// Bidirectional byte relay between `client` and `upstream`.
///
/// Two threads copy each direction; when one side's copy finishes (EOF or
/// error), the opposite write side is shut down so the peer observes the
/// half-close.
pub(crate) fn relay(client: TcpStream, upstream: TcpStream) -> io::Result<()> {
    use std::net::Shutdown;

    let client_r = client.try_clone()?;
    let client_w = client;
    let upstream_r = upstream.try_clone()?;
    let upstream_w = upstream;

    let c2u = thread::Builder::new()
        .name("relay-c2u".into())
        .spawn(move || {
            let mut src = client_r;
            let mut dst = upstream_w;
            let _ = io::copy(&mut src, &mut dst);
            let _ = dst.shutdown(Shutdown::Write);
        })?;

    let u2c = thread::Builder::new()
        .name("relay-u2c".into())
        .spawn(move || {
            let mut src = upstream_r;
            let mut dst = client_w;
            let _ = io::copy(&mut src, &mut dst);
            let _ = dst.shutdown(Shutdown::Write);
        })?;

    let _ = c2u.join();
    let _ = u2c.join();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(allowed: &[&str], denied: &[&str]) -> NetworkConfig {
        NetworkConfig {
            allowed_domains: allowed.iter().map(|s| s.to_string()).collect(),
            denied_domains: denied.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_policy_allows_everything() {
        let net = network(&[], &[]);
        assert!(evaluate_domain(&net, "anything.test").is_ok());
    }

    #[test]
    fn deny_wins_over_allow() {
        let net = network(&["*"], &["bad.test"]);
        assert_eq!(
            evaluate_domain(&net, "bad.test"),
            Err(DenyReason::DeniedByRule("bad.test".into()))
        );
        assert!(evaluate_domain(&net, "good.test").is_ok());
    }

    #[test]
    fn allow_list_is_exclusive_when_non_empty() {
        let net = network(&["example.com"], &[]);
        assert!(evaluate_domain(&net, "example.com").is_ok());
        assert_eq!(
            evaluate_domain(&net, "other.com"),
            Err(DenyReason::NotInAllowList)
        );
    }

    #[test]
    fn wildcard_allow_matches_any_host() {
        let net = network(&["*"], &[]);
        assert!(evaluate_domain(&net, "anything.example").is_ok());
    }

    #[test]
    fn wildcard_subdomain_semantics() {
        let net = network(&["*.example.com"], &[]);
        assert!(evaluate_domain(&net, "api.example.com").is_ok());
        assert_eq!(
            evaluate_domain(&net, "example.com"),
            Err(DenyReason::NotInAllowList)
        );
    }

    #[test]
    fn violation_log_collects_records() {
        let log = ViolationLog::new(false);
        log.record("http", "bad.test", "denied (not in allowedDomains)");
        let records = log.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].to_string(), "[http] bad.test: denied (not in allowedDomains)");
    }

    #[test]
    fn bind_ephemeral_port() {
        let listener = bind_proxy_port(0).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn bind_fixed_port_in_use_errors_after_retry() {
        let holder = bind_proxy_port(0).unwrap();
        let port = holder.local_addr().unwrap().port();
        let err = bind_proxy_port(port).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }
}
