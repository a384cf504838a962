//! TunnelPool (§4.4): owns the set of live tunnels, dials replacements,
//! load-balances allocation across them, and supports a hot `reset` to a
//! new target set.
//!
//! Grounded on `original_source/proxy/tunpool.go`'s `TunPool` for the
//! keepalive/refresh/reset shape. Where the Go source offers two competing
//! `allocTunnelForRequest` strategies, this implements the round-robin-with-
//! skip variant per spec.md §9's explicit resolution, not the Go source's
//! "first tunnel in the vector" shortcut.
//!
//! The `TunMgr` indirection the Go source keeps between `TunPool` and its
//! callers (`proxy/tunmgr.go`) adds no behavior of its own, so its accept
//! methods are folded directly onto `TunnelPool` (see SPEC_FULL.md §4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::selector::{Selector, TunInfo};
use crate::tunnel::slot::BoxedStream;
use crate::tunnel::{DestAddr, Tunnel, TunnelDialOptions};

/// Interval shared by the keepalive and refresh background tasks.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);

struct PoolInner {
    tunnels: Vec<Arc<Tunnel>>,
    current_index: usize,
}

pub struct TunnelPool {
    tun_count: usize,
    tun_cap: u16,
    selector: Arc<dyn Selector>,
    dial_opts: TunnelDialOptions,
    inner: Mutex<PoolInner>,
    broken_tx: mpsc::UnboundedSender<String>,
}

impl TunnelPool {
    /// Dial `tun_count` initial tunnels from `selector` and spawn the
    /// keepalive, refresh and broken-tunnel-eviction background tasks.
    /// Fails if zero tunnels survive the initial dial (spec.md §4.4).
    pub async fn start(
        tun_count: usize,
        tun_cap: u16,
        selector: Arc<dyn Selector>,
        dial_opts: TunnelDialOptions,
    ) -> anyhow::Result<Arc<Self>> {
        let (broken_tx, broken_rx) = mpsc::unbounded_channel();

        let pool = Arc::new(Self {
            tun_count,
            tun_cap,
            selector,
            dial_opts,
            inner: Mutex::new(PoolInner {
                tunnels: Vec::new(),
                current_index: 0,
            }),
            broken_tx,
        });

        let tun_infos = pool.selector.get_tun_infos(tun_count).await;
        if tun_infos.is_empty() {
            anyhow::bail!("selector returned zero candidate endpoints");
        }

        let mut tunnels = Vec::new();
        for info in tun_infos {
            match pool.dial(&info).await {
                Ok(t) => tunnels.push(t),
                Err(e) => warn!(node_id = %info.node_id, error = %e, "initial tunnel dial failed"),
            }
        }
        if tunnels.is_empty() {
            anyhow::bail!("no available tunnels after initial dial");
        }
        info!(count = tunnels.len(), "tunnel pool started");

        {
            let mut inner = pool.inner.lock().await;
            inner.tunnels = tunnels;
        }

        spawn_broken_handler(Arc::clone(&pool), broken_rx);
        spawn_keepalive(Arc::clone(&pool));
        spawn_refresh(Arc::clone(&pool));

        Ok(pool)
    }

    async fn dial(&self, info: &TunInfo) -> anyhow::Result<Arc<Tunnel>> {
        Tunnel::connect(
            &info.url,
            self.tun_cap,
            info.node_id.clone(),
            &info.auth,
            &info.relays,
            &self.dial_opts,
            self.broken_tx.clone(),
        )
        .await
    }

    /// Load-balanced allocation (§4.4): round-robin over the tunnel vector
    /// starting at `current_index`, skipping destroyed or full tunnels,
    /// advancing `current_index` past the chosen one, wrapping once.
    pub async fn alloc_tunnel_for_request(&self) -> Option<Arc<Tunnel>> {
        let mut inner = self.inner.lock().await;
        let len = inner.tunnels.len();
        let start = if len == 0 { 0 } else { inner.current_index % len };

        let mut chosen = None;
        for offset in 0..len {
            let i = (start + offset) % len;
            let t = &inner.tunnels[i];
            if t.is_destroyed() {
                continue;
            }
            if t.is_full().await {
                continue;
            }
            chosen = Some(i);
            break;
        }

        let i = chosen?;
        inner.current_index = (i + 1) % len;
        Some(Arc::clone(&inner.tunnels[i]))
    }

    pub async fn on_accept_socks5(&self, conn: BoxedStream, dest: DestAddr) {
        match self.alloc_tunnel_for_request().await {
            Some(tunnel) => tunnel.on_accept_socks5(conn, dest).await,
            None => warn!("no tunnel available for SOCKS5 request, dropping"),
        }
    }

    pub async fn on_accept_https_connect(&self, conn: BoxedStream, dest: DestAddr) {
        match self.alloc_tunnel_for_request().await {
            Some(tunnel) => tunnel.on_accept_https_connect(conn, dest).await,
            None => warn!("no tunnel available for CONNECT request, dropping"),
        }
    }

    pub async fn on_accept_http(
        &self,
        conn: BoxedStream,
        dest: DestAddr,
        rebuilt_header_bytes: bytes::Bytes,
    ) {
        match self.alloc_tunnel_for_request().await {
            Some(tunnel) => {
                tunnel
                    .on_accept_http(conn, dest, rebuilt_header_bytes)
                    .await;
            }
            None => warn!("no tunnel available for plain-HTTP request, dropping"),
        }
    }

    /// Atomically replace every existing tunnel with a single new one
    /// dialed for `tun_info`. Used by the admin surface for operator-driven
    /// node switching (§4.7).
    pub async fn reset(&self, tun_info: TunInfo) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let old = std::mem::take(&mut inner.tunnels);
        for t in old {
            t.destroy().await;
        }
        let tunnel = self.dial(&tun_info).await?;
        inner.tunnels = vec![tunnel];
        inner.current_index = 0;
        Ok(())
    }

    async fn remove_by_id(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        let before = inner.tunnels.len();
        inner.tunnels.retain(|t| t.id() != id);
        if inner.tunnels.len() != before {
            debug!(tunnel_id = id, "removed tunnel from pool");
        }
        if inner.current_index > 0 {
            inner.current_index = 0;
        }
    }

    /// Count of currently live (non-destroyed) tunnels, for admin/metrics.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.tunnels.len()
    }
}

fn spawn_broken_handler(pool: Arc<TunnelPool>, mut broken_rx: mpsc::UnboundedReceiver<String>) {
    tokio::spawn(async move {
        while let Some(id) = broken_rx.recv().await {
            info!(tunnel_id = %id, "tunnel reported broken");
            pool.remove_by_id(&id).await;
        }
    });
}

fn spawn_keepalive(pool: Arc<TunnelPool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        loop {
            ticker.tick().await;

            let tunnels = pool.inner.lock().await.tunnels.clone();
            for t in &tunnels {
                t.send_ping().await;
            }

            for t in &tunnels {
                if t.is_stale(KEEPALIVE_INTERVAL) {
                    warn!(tunnel_id = t.id(), "tunnel stale, evicting");
                    t.destroy().await;
                }
            }

            // Busy-ascending reorder: "first available" approximates
            // "least busy recently" once sorted this way.
            let mut inner = pool.inner.lock().await;
            inner.tunnels.sort_by_key(|t| t.busy());
            for t in &inner.tunnels {
                t.reset_busy();
            }
            inner.current_index = 0;
        }
    });
}

fn spawn_refresh(pool: Arc<TunnelPool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        loop {
            ticker.tick().await;

            let current_len = pool.inner.lock().await.tunnels.len();
            if current_len >= pool.tun_count {
                continue;
            }

            let candidates = pool.selector.get_tun_infos(pool.tun_count).await;
            let existing: HashMap<String, ()> = {
                let inner = pool.inner.lock().await;
                inner
                    .tunnels
                    .iter()
                    .map(|t| (t.target_node_id().to_string(), ()))
                    .collect()
            };

            for info in candidates {
                if existing.contains_key(&info.node_id) {
                    continue;
                }
                let len_now = pool.inner.lock().await.tunnels.len();
                if len_now >= pool.tun_count {
                    break;
                }
                match pool.dial(&info).await {
                    Ok(tunnel) => {
                        pool.inner.lock().await.tunnels.push(tunnel);
                    }
                    Err(e) => {
                        warn!(node_id = %info.node_id, error = %e, "refresh dial failed");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    /// Pure round-robin-with-skip selection logic, extracted so it can be
    /// exercised without dialing real tunnels. Mirrors the body of
    /// `TunnelPool::alloc_tunnel_for_request`'s search loop.
    fn pick(len: usize, start: usize, eligible: impl Fn(usize) -> bool) -> Option<usize> {
        if len == 0 {
            return None;
        }
        for offset in 0..len {
            let i = (start + offset) % len;
            if eligible(i) {
                return Some(i);
            }
        }
        None
    }

    #[test]
    fn empty_vector_returns_none() {
        assert_eq!(pick(0, 0, |_| true), None);
    }

    #[test]
    fn skips_ineligible_and_wraps_once() {
        // tunnels 0,1 are full/disconnected; only 2 is eligible.
        let eligible = |i: usize| i == 2;
        assert_eq!(pick(3, 0, eligible), Some(2));
        // starting past it wraps around back to 2.
        assert_eq!(pick(3, 2, eligible), Some(2));
    }

    #[test]
    fn round_robin_advances_start() {
        let eligible = |_: usize| true;
        assert_eq!(pick(3, 0, eligible), Some(0));
        assert_eq!(pick(3, 1, eligible), Some(1));
        assert_eq!(pick(3, 2, eligible), Some(2));
    }

    #[test]
    fn all_ineligible_returns_none() {
        assert_eq!(pick(4, 0, |_| false), None);
    }
}
