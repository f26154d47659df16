//! SOCKS5 proxy (RFC 1928) with per-request policy decisions.
//!
//! Supports the "no authentication" method and the CONNECT command only.
//! Domain-name targets go through the same allow/deny logic as the HTTP
//! proxy; loopback IP literals honor `allowLocalOutbound`; other IP
//! literals are tunneled unfiltered (only `socks5h://`-style hostname
//! requests carry a name the domain policy can match). SSH traffic —
//! destination port 22 or a client preamble starting with `SSH-` — is
//! handed to the SSH inspector before bytes flow upstream.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::config::{NetworkConfig, SshConfig};
use crate::proxy::ssh;
use crate::proxy::{ProxyHandle, ViolationLog, evaluate_domain, relay, spawn_accept_loop};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_UNACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);
/// How long to wait for a client-first protocol preamble after the success
/// reply, used to recognize SSH on non-standard ports.
const PREAMBLE_PEEK_TIMEOUT: Duration = Duration::from_millis(300);

/// Policy slice the SOCKS proxy needs; shared read-only across handlers.
pub struct SocksPolicy {
    pub network: NetworkConfig,
    pub ssh: SshConfig,
}

/// The requested destination, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Domain(String),
    Ip(IpAddr),
}

impl Target {
    fn display_host(&self) -> String {
        match self {
            Target::Domain(d) => d.clone(),
            Target::Ip(ip) => ip.to_string(),
        }
    }
}

/// Start the SOCKS5 proxy on `listener`.
pub fn start(
    listener: TcpListener,
    policy: Arc<SocksPolicy>,
    violations: Arc<ViolationLog>,
) -> io::Result<ProxyHandle> {
    spawn_accept_loop(listener, "socks-proxy", move |stream| {
        if let Err(e) = handle_client(stream, &policy, &violations) {
            debug!(error = %e, "socks connection finished with error");
        }
    })
}

fn handle_client(
    mut stream: TcpStream,
    policy: &SocksPolicy,
    violations: &ViolationLog,
) -> io::Result<()> {
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    stream.set_write_timeout(Some(CLIENT_TIMEOUT))?;

    negotiate_method(&mut stream)?;
    let (target, port) = match read_request(&mut stream)? {
        Some(parsed) => parsed,
        None => return Ok(()), // reply already sent
    };
    let host = target.display_host();
    trace!(host = %host, port, "socks request");

    // Policy decision — atomic with respect to the tunnel open below.
    match &target {
        Target::Domain(domain) => {
            if let Err(reason) = evaluate_domain(&policy.network, domain) {
                violations.record("socks", domain, format!("CONNECT denied ({})", reason));
                send_reply(&mut stream, REP_NOT_ALLOWED)?;
                return Ok(());
            }
        }
        Target::Ip(ip) => {
            if ip.is_loopback() && !policy.network.local_outbound_allowed() {
                violations.record("socks", &host, "loopback outbound denied");
                send_reply(&mut stream, REP_NOT_ALLOWED)?;
                return Ok(());
            }
            // Non-loopback literals carry no name to match; tunneled as-is.
        }
    }

    // SSH host enforcement happens before the upstream connect.
    if port == 22 {
        if let Err(reason) = ssh::check_host(&policy.ssh, &host) {
            violations.record("ssh", &host, format!("host denied ({})", reason));
            send_reply(&mut stream, REP_NOT_ALLOWED)?;
            return Ok(());
        }
    }

    let upstream = match connect_upstream(&target, port) {
        Ok(upstream) => upstream,
        Err(e) => {
            let rep = match e.kind() {
                io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
                io::ErrorKind::TimedOut => REP_HOST_UNREACHABLE,
                _ => REP_GENERAL_FAILURE,
            };
            send_reply(&mut stream, rep)?;
            return Err(e);
        }
    };

    send_reply(&mut stream, REP_SUCCESS)?;

    // SSH on a non-standard port reveals itself by the client preamble.
    if port != 22 && peek_is_ssh(&stream) {
        if let Err(reason) = ssh::check_host(&policy.ssh, &host) {
            violations.record("ssh", &host, format!("host denied ({})", reason));
            return Ok(()); // drop both sides; no bytes reached upstream
        }
    }

    relay(stream, upstream)
}

/// Method negotiation: only "no authentication" is offered back.
fn negotiate_method(stream: &mut TcpStream) -> io::Result<()> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header)?;
    if header[0] != SOCKS_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported SOCKS version {}", header[0]),
        ));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods)?;

    if methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH])?;
        Ok(())
    } else {
        stream.write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE])?;
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "client offered no acceptable auth method",
        ))
    }
}

/// Read the request; returns None when an error reply was already sent.
fn read_request(stream: &mut TcpStream) -> io::Result<Option<(Target, u16)>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let [version, command, _reserved, atyp] = header;

    if version != SOCKS_VERSION {
        send_reply(stream, REP_GENERAL_FAILURE)?;
        return Ok(None);
    }
    if command != CMD_CONNECT {
        send_reply(stream, REP_COMMAND_NOT_SUPPORTED)?;
        return Ok(None);
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr)?;
            Target::Ip(IpAddr::V4(Ipv4Addr::from(addr)))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name)?;
            match String::from_utf8(name) {
                Ok(domain) => Target::Domain(domain),
                Err(_) => {
                    send_reply(stream, REP_GENERAL_FAILURE)?;
                    return Ok(None);
                }
            }
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr)?;
            Target::Ip(IpAddr::V6(Ipv6Addr::from(addr)))
        }
        _ => {
            send_reply(stream, REP_ATYP_NOT_SUPPORTED)?;
            return Ok(None);
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port)?;
    Ok(Some((target, u16::from_be_bytes(port))))
}

fn connect_upstream(target: &Target, port: u16) -> io::Result<TcpStream> {
    match target {
        Target::Domain(domain) => TcpStream::connect((domain.as_str(), port)),
        Target::Ip(ip) => TcpStream::connect((*ip, port)),
    }
}

/// Reply with the given code and a zeroed IPv4 bind address.
fn send_reply(stream: &mut TcpStream, rep: u8) -> io::Result<()> {
    stream.write_all(&[SOCKS_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])?;
    stream.flush()
}

/// Peek the client's first bytes for an SSH identification string. The peek
/// never consumes; a quiet client (server-speaks-first protocols) just
/// times out and tunnels normally.
fn peek_is_ssh(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 4];
    let _ = stream.set_read_timeout(Some(PREAMBLE_PEEK_TIMEOUT));
    let result = stream.peek(&mut buf);
    let _ = stream.set_read_timeout(Some(CLIENT_TIMEOUT));
    matches!(result, Ok(n) if n >= 4 && &buf[..4] == b"SSH-")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::bind_proxy_port;
    use std::io::BufRead;
    use std::thread;

    fn start_test_proxy(policy: SocksPolicy) -> (ProxyHandle, Arc<ViolationLog>) {
        let violations = ViolationLog::new(false);
        let listener = bind_proxy_port(0).unwrap();
        let handle = start(listener, Arc::new(policy), Arc::clone(&violations)).unwrap();
        (handle, violations)
    }

    fn policy_with(allowed: &[&str], denied: &[&str]) -> SocksPolicy {
        SocksPolicy {
            network: NetworkConfig {
                allowed_domains: allowed.iter().map(|s| s.to_string()).collect(),
                denied_domains: denied.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            ssh: SshConfig::default(),
        }
    }

    fn handshake(addr: std::net::SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(&[0x05, 0x01, 0x00]).unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(reply, [0x05, 0x00]);
        stream
    }

    fn send_domain_connect(stream: &mut TcpStream, domain: &str, port: u16) -> u8 {
        let mut req = vec![0x05, 0x01, 0x00, 0x03, domain.len() as u8];
        req.extend_from_slice(domain.as_bytes());
        req.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&req).unwrap();

        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).unwrap();
        reply[1]
    }

    fn send_ipv4_connect(stream: &mut TcpStream, ip: [u8; 4], port: u16) -> u8 {
        let mut req = vec![0x05, 0x01, 0x00, 0x01];
        req.extend_from_slice(&ip);
        req.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&req).unwrap();

        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).unwrap();
        reply[1]
    }

    #[test]
    fn rejects_clients_without_no_auth() {
        let (handle, _) = start_test_proxy(policy_with(&[], &[]));
        let mut stream = TcpStream::connect(handle.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        // Offer only username/password (0x02).
        stream.write_all(&[0x05, 0x01, 0x02]).unwrap();
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(reply, [0x05, 0xff]);
    }

    #[test]
    fn denied_domain_gets_ruleset_reply_and_violation() {
        let (handle, violations) = start_test_proxy(policy_with(&["example.com"], &[]));
        let mut stream = handshake(handle.addr);
        let rep = send_domain_connect(&mut stream, "bad.test", 443);
        assert_eq!(rep, REP_NOT_ALLOWED);

        let records = violations.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, "socks");
        assert_eq!(records[0].host, "bad.test");
    }

    #[test]
    fn bind_command_is_unsupported() {
        let (handle, _) = start_test_proxy(policy_with(&[], &[]));
        let mut stream = handshake(handle.addr);
        let mut req = vec![0x05, 0x02, 0x00, 0x03, 1, b'x'];
        req.extend_from_slice(&443u16.to_be_bytes());
        stream.write_all(&req).unwrap();
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(reply[1], REP_COMMAND_NOT_SUPPORTED);
    }

    #[test]
    fn loopback_denied_without_local_outbound() {
        let (handle, violations) = start_test_proxy(policy_with(&[], &[]));
        let mut stream = handshake(handle.addr);
        let rep = send_ipv4_connect(&mut stream, [127, 0, 0, 1], 8080);
        assert_eq!(rep, REP_NOT_ALLOWED);
        assert_eq!(violations.snapshot().len(), 1);
    }

    #[test]
    fn loopback_allowed_with_local_outbound() {
        // A live local upstream so the connect succeeds.
        let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        thread::spawn(move || {
            let _ = upstream.accept();
        });

        let mut policy = policy_with(&[], &[]);
        policy.network.allow_local_outbound = Some(true);
        let (handle, violations) = start_test_proxy(policy);
        let mut stream = handshake(handle.addr);
        let rep = send_ipv4_connect(&mut stream, [127, 0, 0, 1], upstream_port);
        assert_eq!(rep, REP_SUCCESS);
        assert!(violations.snapshot().is_empty());
    }

    #[test]
    fn local_binding_implies_local_outbound_when_unset() {
        let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        thread::spawn(move || {
            let _ = upstream.accept();
        });

        let mut policy = policy_with(&[], &[]);
        policy.network.allow_local_binding = true;
        let (handle, _) = start_test_proxy(policy);
        let mut stream = handshake(handle.addr);
        let rep = send_ipv4_connect(&mut stream, [127, 0, 0, 1], upstream_port);
        assert_eq!(rep, REP_SUCCESS);
    }

    #[test]
    fn allowed_domain_tunnels_to_upstream() {
        let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        let upstream_thread = thread::spawn(move || {
            let (mut conn, _) = upstream.accept().unwrap();
            conn.write_all(b"PONG\n").unwrap();
            let mut buf = Vec::new();
            let _ = conn.read_to_end(&mut buf);
        });

        let mut policy = policy_with(&["localhost"], &[]);
        policy.network.allow_local_outbound = Some(true);
        let (handle, _) = start_test_proxy(policy);
        let mut stream = handshake(handle.addr);
        let rep = send_domain_connect(&mut stream, "localhost", upstream_port);
        assert_eq!(rep, REP_SUCCESS);

        let mut reader = std::io::BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "PONG\n");

        let _ = stream.shutdown(std::net::Shutdown::Both);
        let _ = upstream_thread.join();
    }

    #[test]
    fn ssh_port_denied_host_is_refused_before_connect() {
        let mut policy = policy_with(&[], &[]);
        policy.network.allow_local_outbound = Some(true);
        policy.ssh.denied_hosts = vec!["127.0.0.1".into()];
        let (handle, violations) = start_test_proxy(policy);
        let mut stream = handshake(handle.addr);
        let rep = send_ipv4_connect(&mut stream, [127, 0, 0, 1], 22);
        assert_eq!(rep, REP_NOT_ALLOWED);

        let records = violations.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, "ssh");
    }

    #[test]
    fn ssh_preamble_on_nonstandard_port_triggers_host_check() {
        let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        thread::spawn(move || {
            if let Ok((mut conn, _)) = upstream.accept() {
                let mut buf = Vec::new();
                let _ = conn.read_to_end(&mut buf);
            }
        });

        let mut policy = policy_with(&[], &[]);
        policy.network.allow_local_outbound = Some(true);
        policy.ssh.denied_hosts = vec!["127.0.0.1".into()];
        let (handle, violations) = start_test_proxy(policy);

        let mut stream = handshake(handle.addr);
        let rep = send_ipv4_connect(&mut stream, [127, 0, 0, 1], upstream_port);
        assert_eq!(rep, REP_SUCCESS);

        // Client speaks SSH first; inspector must drop the tunnel.
        stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").unwrap();
        thread::sleep(Duration::from_millis(600));
        assert_eq!(violations.snapshot().len(), 1);
        assert_eq!(violations.snapshot()[0].kind, "ssh");
    }
}
