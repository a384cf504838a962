//! Plain-HTTP client acceptor plus the shared `http.listenAddress` listener
//! (§4.6): accepts connections, reads the request head, and routes CONNECT
//! to [`super::http_connect`] or (when enabled) forwards everything else
//! here.
//!
//! Grounded on the teacher's `proxy/server.rs` for the bind/accept/spawn
//! loop shape.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::{read_request_head, rebuild_request_head, split_host_port, RequestHead};
use crate::pool::TunnelPool;
use crate::tunnel::DestAddr;

const DEFAULT_PORT: u16 = 80;

/// Run the combined HTTP-CONNECT / plain-HTTP listener on `listen_addr`.
/// `allow_plain_http` mirrors the Go original's "used for non-CONNECT
/// methods when enabled" switch (spec.md §4.6) — when false, non-CONNECT
/// requests get a `405` and the connection is closed.
pub async fn run(
    listen_addr: SocketAddr,
    pool: Arc<TunnelPool>,
    allow_plain_http: bool,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, allow_plain_http, "http acceptor listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "http acceptor accept error");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let pool = Arc::clone(&pool);

        tokio::spawn(async move {
            let mut stream = stream;
            let head = match read_request_head(&mut stream).await {
                Ok(h) => h,
                Err(e) => {
                    debug!(%peer, error = %e, "http acceptor: failed to read request head");
                    return;
                }
            };

            if head.method.eq_ignore_ascii_case("CONNECT") {
                super::http_connect::serve_preparsed(stream, peer, head, pool).await;
            } else if allow_plain_http {
                serve(stream, peer, head, pool).await;
            } else {
                debug!(%peer, method = %head.method, "plain HTTP disabled, rejecting");
                let _ = write_405(&mut stream).await;
            }
        });
    }
}

async fn write_405(stream: &mut tokio::net::TcpStream) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    stream
        .write_all(b"HTTP/1.1 405 Method Not Allowed\r\nAllow: CONNECT\r\nContent-Length: 0\r\n\r\n")
        .await
}

/// Reconstruct the request as raw bytes (request-line + headers, `Host:`
/// forced to the resolved destination) and hand it to the pool as a single
/// `ReqData` frame (§4.3's `on_accept_http`).
async fn serve(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    head: RequestHead,
    pool: Arc<TunnelPool>,
) {
    let dest = match resolve_dest(&head) {
        Some(d) => d,
        None => {
            debug!(%peer, target = %head.target, "plain HTTP: could not resolve destination");
            return;
        }
    };

    let request_line_target = origin_form_target(&head.target);
    let rebuilt = rebuild_request_head(&head, &request_line_target, &dest.addr);

    debug!(%peer, target = %head.target, "plain HTTP accepted");
    pool.on_accept_http(Box::new(stream), dest, rebuilt).await;
}

/// `dest.addr` is set to the destination host, not the original client's
/// `RemoteAddr` — spec.md §9 flags the Go source's `RemoteAddr` choice as
/// almost certainly a bug; SPEC_FULL.md §6 resolves it in favor of the
/// intended behavior.
fn resolve_dest(head: &RequestHead) -> Option<DestAddr> {
    if let Some(rest) = head.target.strip_prefix("http://") {
        let authority = rest.split(['/', '?']).next().unwrap_or(rest);
        let (host, port) = split_host_port(authority);
        return Some(DestAddr {
            addr: host,
            port: port.unwrap_or(DEFAULT_PORT),
        });
    }
    let host_header = head.header("host")?;
    let (host, port) = split_host_port(host_header);
    Some(DestAddr {
        addr: host,
        port: port.unwrap_or(DEFAULT_PORT),
    })
}

/// Forward proxies conventionally send the origin-form (`/path?query`) on
/// the wire to the upstream, even when the client used absolute-form.
fn origin_form_target(target: &str) -> String {
    if let Some(rest) = target.strip_prefix("http://") {
        if let Some(idx) = rest.find('/') {
            return rest[idx..].to_string();
        }
        return "/".to_string();
    }
    target.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(target: &str, host_header: Option<&str>) -> RequestHead {
        let mut headers = vec![("Accept".to_string(), "*/*".to_string())];
        if let Some(h) = host_header {
            headers.push(("Host".to_string(), h.to_string()));
        }
        RequestHead {
            method: "GET".to_string(),
            target: target.to_string(),
            version: "HTTP/1.1".to_string(),
            headers,
        }
    }

    #[test]
    fn resolves_from_absolute_form() {
        let h = head("http://example.com:8080/a/b", None);
        let dest = resolve_dest(&h).unwrap();
        assert_eq!(dest.addr, "example.com");
        assert_eq!(dest.port, 8080);
    }

    #[test]
    fn resolves_from_host_header_when_origin_form() {
        let h = head("/a/b", Some("example.com"));
        let dest = resolve_dest(&h).unwrap();
        assert_eq!(dest.addr, "example.com");
        assert_eq!(dest.port, DEFAULT_PORT);
    }

    #[test]
    fn origin_form_strips_authority() {
        assert_eq!(origin_form_target("http://example.com/a/b?q=1"), "/a/b?q=1");
        assert_eq!(origin_form_target("/already/origin"), "/already/origin");
    }

    #[test]
    fn no_host_available_returns_none() {
        let h = head("/a/b", None);
        assert!(resolve_dest(&h).is_none());
    }
}
