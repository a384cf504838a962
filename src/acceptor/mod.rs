//! Acceptor bridge (C6, spec.md §4.6): translates client-facing SOCKS5,
//! HTTP-CONNECT and plain-HTTP intents into `TunnelPool` accept calls.
//!
//! Grounded on the teacher's `proxy/server.rs` for the per-connection
//! accept-loop shape (bind, accept, spawn, set `TCP_NODELAY`) and on
//! `proxy/connect.rs` for parsing a `CONNECT host:port` request line. Unlike
//! the teacher, the HTTP-facing listener here never drives a full
//! `hyper::server::conn` service: spec.md §4.6 requires the *raw* hijacked
//! TCP connection (no intervening hyper `Response`/upgrade machinery) because
//! the `Tunnel` itself writes the "200 Connection Established" line directly
//! to that connection (§4.3). A minimal request-line-and-headers reader
//! (below) stands in for hyper's server loop on that one listener, while the
//! admin surface (`crate::admin`) — an ordinary request/response HTTP
//! server — still uses hyper in the usual way.

pub mod http_connect;
pub mod plain_http;
pub mod socks5;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest request head (request line + headers) we'll buffer before giving
/// up. Generous for real client headers, small enough to bound memory for a
/// misbehaving or malicious peer.
const MAX_HEAD_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// The request-target as it appeared on the wire: `host:port` for
    /// CONNECT, an absolute or origin-form URI for everything else.
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HeadReadError {
    #[error("client closed connection before sending a complete request head")]
    ConnectionClosed,
    #[error("request head exceeded {0} bytes")]
    TooLarge(usize),
    #[error("malformed request head")]
    Malformed,
    #[error("io error reading request head: {0}")]
    Io(#[from] std::io::Error),
}

/// Read a request line and headers (up to the blank line) from `stream`,
/// without consuming any bytes past it. Returns the parsed head; any
/// leftover bytes already read (there are none past the terminator, by
/// construction) are not re-buffered, matching the CONNECT/plain-HTTP flows
/// which have no request body to preserve.
pub async fn read_request_head<S>(stream: &mut S) -> Result<RequestHead, HeadReadError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let mut byte = [0u8; 1];
    loop {
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(HeadReadError::TooLarge(MAX_HEAD_SIZE));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(HeadReadError::ConnectionClosed);
        }
        buf.extend_from_slice(&byte);
        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            break;
        }
    }
    parse_request_head(&buf).ok_or(HeadReadError::Malformed)
}

fn parse_request_head(buf: &[u8]) -> Option<RequestHead> {
    let text = std::str::from_utf8(buf).ok()?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    let version = parts.next()?.to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Some(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

/// Split `host:port` (CONNECT authority or a `Host:` header value) into its
/// parts, honoring `[ipv6]:port` bracketing. Returns `(host, Some(port))`
/// or `(host, None)` if no port was present.
pub fn split_host_port(s: &str) -> (String, Option<u16>) {
    if let Some(rest) = s.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &rest[..end];
            let after = &rest[end + 1..];
            let port = after.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host.to_string(), port);
        }
    }
    match s.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            (host.to_string(), port.parse().ok())
        }
        _ => (s.to_string(), None),
    }
}

/// Rebuild a raw HTTP/1.1 request head as bytes, with `Host:` forced to
/// `host_override`. Used by the plain-HTTP acceptor (§4.6) to reconstruct
/// the header it forwards as a single `ReqData` frame.
///
/// spec.md §9 flags the Go original's choice of the client's `RemoteAddr`
/// for this header as almost certainly a bug; per SPEC_FULL.md §6 this
/// implementation uses the intended value, the destination's own address.
pub fn rebuild_request_head(head: &RequestHead, request_line_target: &str, host_override: &str) -> Bytes {
    let mut out = format!(
        "{} {} {}\r\n",
        head.method, request_line_target, head.version
    );
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("Host: ");
    out.push_str(host_override);
    out.push_str("\r\n\r\n");
    Bytes::from(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_connect_request_head() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nUser-Agent: test\r\n\r\n";
        let mut stream = tokio_test::io::Builder::new().read(raw).build();
        let head = read_request_head(&mut stream).await.unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "example.com:443");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.header("host"), Some("example.com:443"));
        assert_eq!(head.header("User-Agent"), Some("test"));
    }

    #[tokio::test]
    async fn rejects_truncated_connection() {
        let mut stream = tokio_test::io::Builder::new()
            .read(b"GET / HTTP/1.1\r\nHost: x\r\n")
            .build();
        let err = read_request_head(&mut stream).await.unwrap_err();
        assert!(matches!(err, HeadReadError::ConnectionClosed));
    }

    #[test]
    fn split_host_port_plain() {
        assert_eq!(
            split_host_port("example.com:80"),
            ("example.com".to_string(), Some(80))
        );
        assert_eq!(split_host_port("example.com"), ("example.com".to_string(), None));
    }

    #[test]
    fn split_host_port_ipv6() {
        assert_eq!(
            split_host_port("[::1]:8080"),
            ("::1".to_string(), Some(8080))
        );
    }

    #[test]
    fn rebuild_forces_host_override() {
        let head = RequestHead {
            method: "GET".to_string(),
            target: "http://old-host/path".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: vec![
                ("Host".to_string(), "old-host".to_string()),
                ("Accept".to_string(), "*/*".to_string()),
            ],
        };
        let rebuilt = rebuild_request_head(&head, "/path", "example.com");
        let text = String::from_utf8(rebuilt.to_vec()).unwrap();
        assert!(text.starts_with("GET /path HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(!text.contains("old-host"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
