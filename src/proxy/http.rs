//! HTTP CONNECT proxy for domain-level network filtering.
//!
//! Accepts only the `CONNECT host:port HTTP/1.x` request family. Plain HTTP
//! requests are refused — clients must tunnel TLS through the proxy, which
//! keeps the proxy out of the request path and the policy decision down to
//! a single hostname check per connection.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::config::NetworkConfig;
use crate::proxy::{ProxyHandle, ViolationLog, evaluate_domain, relay, spawn_accept_loop};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Start the CONNECT proxy on `listener`.
pub fn start(
    listener: TcpListener,
    network: Arc<NetworkConfig>,
    violations: Arc<ViolationLog>,
) -> io::Result<ProxyHandle> {
    spawn_accept_loop(listener, "http-proxy", move |stream| {
        if let Err(e) = handle_client(stream, &network, &violations) {
            debug!(error = %e, "http connection finished with error");
        }
    })
}

fn handle_client(
    stream: TcpStream,
    network: &NetworkConfig,
    violations: &ViolationLog,
) -> io::Result<()> {
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    stream.set_write_timeout(Some(CLIENT_TIMEOUT))?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let request_line = request_line.trim_end();

    if request_line.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "empty request line",
        ));
    }
    trace!(request_line, "parsed request line");

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 || !parts[2].starts_with("HTTP/1.") {
        send_error(&stream, 400, "Bad Request", "malformed request line")?;
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "malformed request line",
        ));
    }

    if !parts[0].eq_ignore_ascii_case("CONNECT") {
        // Plain HTTP is not forwarded; clients must use TLS through CONNECT.
        send_error(
            &stream,
            405,
            "Method Not Allowed",
            "only CONNECT is supported",
        )?;
        return Ok(());
    }

    let authority = parts[1];
    let host = host_from_authority(authority);
    consume_headers(&mut reader)?;

    if let Err(reason) = evaluate_domain(network, host) {
        violations.record("http", host, format!("CONNECT denied ({})", reason));
        send_error(
            &stream,
            403,
            "Forbidden",
            &format!("CONNECT to {} blocked by sandbox policy ({})", host, reason),
        )?;
        return Ok(());
    }

    debug!(authority, "CONNECT allowed");
    tunnel(stream, authority)
}

/// Establish the upstream connection, confirm the tunnel, then splice.
fn tunnel(mut client: TcpStream, authority: &str) -> io::Result<()> {
    let upstream = TcpStream::connect(authority).map_err(|e| {
        let _ = send_error(&client, 502, "Bad Gateway", "upstream connect failed");
        io::Error::new(
            e.kind(),
            format!("failed to connect to upstream {authority}: {e}"),
        )
    })?;

    client.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")?;
    client.flush()?;

    relay(client, upstream)
}

/// Extract the hostname from an authority string (`host:port`), handling
/// IPv6 bracket notation (`[::1]:443`).
fn host_from_authority(authority: &str) -> &str {
    if authority.starts_with('[')
        && let Some(bracket_end) = authority.find(']')
    {
        return &authority[1..bracket_end];
    }
    authority
        .rsplit_once(':')
        .map(|(host, _port)| host)
        .unwrap_or(authority)
}

/// Consume (and discard) headers until the blank line terminator.
fn consume_headers(reader: &mut BufReader<TcpStream>) -> io::Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 || line == "\r\n" || line == "\n" {
            return Ok(());
        }
    }
}

/// Send a minimal HTTP error response with a diagnostic body.
fn send_error(stream: &TcpStream, code: u16, reason: &str, body: &str) -> io::Result<()> {
    let body = format!("{}\r\n", body);
    let response = format!(
        "HTTP/1.1 {code} {reason}\r\n\
         Content-Length: {}\r\n\
         Content-Type: text/plain\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len(),
    );
    let mut w = stream.try_clone()?;
    w.write_all(response.as_bytes())?;
    w.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::bind_proxy_port;
    use std::io::Read;
    use std::net::Shutdown;
    use std::thread;

    fn start_test_proxy(allowed: &[&str], denied: &[&str]) -> (ProxyHandle, Arc<ViolationLog>) {
        let network = Arc::new(NetworkConfig {
            allowed_domains: allowed.iter().map(|s| s.to_string()).collect(),
            denied_domains: denied.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        });
        let violations = ViolationLog::new(false);
        let listener = bind_proxy_port(0).unwrap();
        let handle = start(listener, network, Arc::clone(&violations)).unwrap();
        (handle, violations)
    }

    fn connect_with(handle: &ProxyHandle, request: &str) -> (TcpStream, String) {
        let mut stream = TcpStream::connect(handle.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(request.as_bytes()).unwrap();
        stream.flush().unwrap();

        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut status_line = String::new();
        reader.read_line(&mut status_line).unwrap();
        (stream, status_line)
    }

    #[test]
    fn host_from_authority_forms() {
        assert_eq!(host_from_authority("example.com:443"), "example.com");
        assert_eq!(host_from_authority("example.com"), "example.com");
        assert_eq!(host_from_authority("[::1]:443"), "::1");
    }

    #[test]
    fn blocked_connect_gets_403_and_violation() {
        let (handle, violations) = start_test_proxy(&["example.com"], &[]);
        let (_stream, status) = connect_with(
            &handle,
            "CONNECT bad.test:443 HTTP/1.1\r\nHost: bad.test\r\n\r\n",
        );
        assert!(status.contains("403"), "{status}");

        let records = violations.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, "http");
        assert_eq!(records[0].host, "bad.test");
    }

    #[test]
    fn denied_domain_gets_403_even_with_wildcard_allow() {
        let (handle, violations) = start_test_proxy(&["*"], &["bad.test"]);
        let (_stream, status) = connect_with(
            &handle,
            "CONNECT bad.test:443 HTTP/1.1\r\n\r\n",
        );
        assert!(status.contains("403"), "{status}");
        assert_eq!(violations.snapshot().len(), 1);
    }

    #[test]
    fn plain_http_is_refused() {
        let (handle, _violations) = start_test_proxy(&["example.com"], &[]);
        let (_stream, status) = connect_with(
            &handle,
            "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n",
        );
        assert!(status.contains("405"), "{status}");
    }

    #[test]
    fn malformed_request_gets_400() {
        let (handle, _violations) = start_test_proxy(&[], &[]);
        let (_stream, status) = connect_with(&handle, "CONNECT\r\n\r\n");
        assert!(status.contains("400"), "{status}");
    }

    #[test]
    fn allowed_connect_tunnels_bytes() {
        // Local upstream that greets then drains.
        let upstream_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        let upstream_thread = thread::spawn(move || {
            let (mut conn, _) = upstream_listener.accept().unwrap();
            conn.write_all(b"HELLO FROM UPSTREAM\n").unwrap();
            let mut buf = Vec::new();
            let _ = conn.read_to_end(&mut buf);
        });

        let (handle, violations) = start_test_proxy(&["localhost"], &[]);
        let (stream, status) = connect_with(
            &handle,
            &format!(
                "CONNECT localhost:{} HTTP/1.1\r\nHost: localhost\r\n\r\n",
                upstream_addr.port()
            ),
        );
        assert!(status.contains("200"), "{status}");

        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut blank = String::new();
        reader.read_line(&mut blank).unwrap();
        let mut greeting = String::new();
        reader.read_line(&mut greeting).unwrap();
        assert_eq!(greeting, "HELLO FROM UPSTREAM\n");

        let _ = stream.shutdown(Shutdown::Both);
        let _ = upstream_thread.join();
        assert!(violations.snapshot().is_empty());
    }

    #[test]
    fn upstream_connect_failure_gets_502() {
        // Reserve a port, then close it so the CONNECT target refuses.
        let dead = TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let (handle, _violations) = start_test_proxy(&["localhost"], &[]);
        let (_stream, status) = connect_with(
            &handle,
            &format!("CONNECT localhost:{} HTTP/1.1\r\n\r\n", dead_port),
        );
        assert!(status.contains("502"), "{status}");
    }

    #[test]
    fn proxy_stops_accepting_after_shutdown() {
        let (handle, _violations) = start_test_proxy(&[], &[]);
        let addr = handle.addr;
        drop(handle);
        thread::sleep(Duration::from_millis(200));
        let conn = TcpStream::connect_timeout(&addr, Duration::from_millis(200));
        assert!(conn.is_err(), "proxy should have stopped accepting");
    }
}
