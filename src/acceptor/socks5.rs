//! SOCKS5 client acceptor (§4.6).
//!
//! The handshake is delegated entirely to `fast_socks5`, per spec.md §1's
//! "the SOCKS5 handshake parser itself (an external library)" boundary —
//! only the post-handshake `(conn, dest)` pair crosses into the core.

use std::net::SocketAddr;
use std::sync::Arc;

use fast_socks5::server::{Config as Socks5Config, Socks5Server, Socks5Socket};
use fast_socks5::util::target_addr::TargetAddr;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::pool::TunnelPool;
use crate::tunnel::DestAddr;

pub async fn run(listen_addr: SocketAddr, pool: Arc<TunnelPool>) -> anyhow::Result<()> {
    let mut server = Socks5Server::<TcpStream>::bind(listen_addr).await?;
    server.set_config(Socks5Config::default());
    info!(addr = %listen_addr, "socks5 acceptor listening");

    let mut incoming = server.incoming();
    while let Some(socket) = incoming.next().await {
        let socket = match socket {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "socks5 accept error");
                continue;
            }
        };
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            if let Err(e) = serve(socket, pool).await {
                debug!(error = %e, "socks5 session ended with error");
            }
        });
    }
    Ok(())
}

async fn serve(socket: Socks5Socket<TcpStream>, pool: Arc<TunnelPool>) -> anyhow::Result<()> {
    let socket = socket.upgrade_to_socks5().await?;

    let dest = match socket.target_addr() {
        Some(TargetAddr::Ip(SocketAddr::V4(v4))) => DestAddr {
            addr: v4.ip().to_string(),
            port: v4.port(),
        },
        Some(TargetAddr::Ip(SocketAddr::V6(v6))) => DestAddr {
            addr: v6.ip().to_string(),
            port: v6.port(),
        },
        Some(TargetAddr::Domain(host, port)) => DestAddr {
            addr: host.clone(),
            port: *port,
        },
        None => anyhow::bail!("socks5 handshake produced no target address"),
    };

    pool.on_accept_socks5(Box::new(socket), dest).await;
    Ok(())
}
