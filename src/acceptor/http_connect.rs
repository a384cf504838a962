//! HTTP-CONNECT client acceptor (§4.6).
//!
//! Reads just the request line and headers off the raw TCP connection
//! (see [`super::read_request_head`]) and hands the still-unanswered
//! connection straight to the pool: the `Tunnel` itself writes the
//! "200 Connection Established" response (§4.3), so this acceptor must not
//! write anything to the socket first.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::debug;

use super::{read_request_head, split_host_port, RequestHead};
use crate::pool::TunnelPool;
use crate::tunnel::DestAddr;

/// Default port when a `CONNECT` target omits one, per spec.md §4.6.
const DEFAULT_PORT: u16 = 80;

/// Handle one already-accepted TCP connection known (or suspected) to start
/// with a CONNECT request line. Reads the request head itself; used when
/// this acceptor runs standalone rather than behind the shared listener.
pub async fn serve(mut stream: TcpStream, peer: SocketAddr, pool: Arc<TunnelPool>) {
    let head = match read_request_head(&mut stream).await {
        Ok(h) => h,
        Err(e) => {
            debug!(%peer, error = %e, "CONNECT: failed to read request head");
            return;
        }
    };
    serve_preparsed(stream, peer, head, pool).await;
}

/// Same as [`serve`] but for a head already read by the shared `http`
/// listener in [`super::plain_http::run`], which must peek the method
/// before deciding where to route the connection.
pub async fn serve_preparsed(
    stream: TcpStream,
    peer: SocketAddr,
    head: RequestHead,
    pool: Arc<TunnelPool>,
) {
    let (host, port) = split_host_port(&head.target);
    let dest = DestAddr {
        addr: host,
        port: port.unwrap_or(DEFAULT_PORT),
    };

    debug!(%peer, target = %head.target, "CONNECT accepted");
    pool.on_accept_https_connect(Box::new(stream), dest).await;
}
