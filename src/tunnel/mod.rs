//! One WebSocket connection multiplexing many logical client streams.
//!
//! Grounded on `original_source/proxy/tunnel.go` (`Tunnel`) for the
//! lifecycle and accept-path shape, and on the teacher's `tunnel/client.rs`
//! for how a WebSocket is dialed, TLS-configured and TCP-tuned, and its
//! `tunnel/writer.rs` for the serialized-write pattern.
//!
//! Unlike the teacher, a `Tunnel` here does not reconnect itself in place:
//! once its read loop exits it reports itself broken and is discarded, the
//! same as the Go original's `onTunnelBroken` / pool-level `refresh` split
//! (`original_source/proxy/tunpool.go`). Reconnection is the pool's job.

pub mod dispatcher;
pub mod protocol;
pub mod slot;
pub mod writer;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{info, warn};

use protocol::Frame;
use slot::{BoxedStream, SlotTable};

/// A destination the acceptor resolved from the client's request.
#[derive(Debug, Clone)]
pub struct DestAddr {
    pub addr: String,
    pub port: u16,
}

/// Tunable parameters affecting tunnel dial behaviour. Mirrors the
/// `tun.*`/`[server]` config surface named in spec §6.
#[derive(Debug, Clone)]
pub struct TunnelDialOptions {
    pub connect_timeout: Duration,
    pub tcp_keepalive: Option<Duration>,
    pub tcp_nodelay: bool,
}

impl Default for TunnelDialOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            tcp_keepalive: Some(Duration::from_secs(30)),
            tcp_nodelay: true,
        }
    }
}

/// One long-lived multiplexed WebSocket connection to a remote node.
pub struct Tunnel {
    id: String,
    target_node_id: String,
    url: String,
    cap: u16,
    slots: AsyncMutex<SlotTable>,
    write_tx: FrameSenderHandle,
    last_pong_epoch_secs: AtomicU64,
    busy: AtomicUsize,
    destroyed: AtomicBool,
    /// Notifies the owning pool by id when the read loop exits. A channel
    /// rather than a back-reference to the pool, so the tunnel never owns
    /// its owner (see spec §9 on callback-style back-references).
    broken_tx: mpsc::UnboundedSender<String>,
}

type FrameSenderHandle = writer::FrameSender;

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Tunnel {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target_node_id(&self) -> &str {
        &self.target_node_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn cap(&self) -> u16 {
        self.cap
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub async fn is_full(&self) -> bool {
        self.slots.lock().await.is_full()
    }

    /// Recent-allocation counter used by the pool's busy-ascending reorder.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }

    pub fn reset_busy(&self) {
        self.busy.store(0, Ordering::Relaxed);
    }

    pub fn last_pong_epoch_secs(&self) -> u64 {
        self.last_pong_epoch_secs.load(Ordering::Acquire)
    }

    /// Dead if no pong has been observed within `3 * keepalive_interval`.
    pub fn is_stale(&self, keepalive_interval: Duration) -> bool {
        let window = keepalive_interval.saturating_mul(3).as_secs();
        now_epoch_secs().saturating_sub(self.last_pong_epoch_secs()) > window
    }

    /// Dial `{url}?cap={cap}&uuid={id}` and spawn the reader/writer tasks.
    /// `relays` are sent as repeated `Relay:` headers (see original
    /// `selector/autoselector.go`'s connectivity probe, carried into the
    /// real dial as well since nothing in the spec contradicts it).
    pub async fn connect(
        url: &str,
        cap: u16,
        target_node_id: String,
        auth: &str,
        relays: &[String],
        opts: &TunnelDialOptions,
        broken_tx: mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<Arc<Tunnel>> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut parsed = url::Url::parse(url)?;
        parsed
            .query_pairs_mut()
            .append_pair("cap", &cap.to_string())
            .append_pair("uuid", &id);
        let dial_url = parsed.to_string();

        let mut request = dial_url.clone().into_client_request()?;
        let headers = request.headers_mut();
        if !auth.is_empty() {
            headers.insert("Authorization", http::HeaderValue::from_str(auth)?);
        }
        for relay in relays {
            headers.append("Relay", http::HeaderValue::from_str(relay)?);
        }

        let is_tls = parsed.scheme() == "wss";
        let host = parsed
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("missing host in tunnel URL"))?
            .to_string();
        let port = parsed.port().unwrap_or(if is_tls { 443 } else { 80 });

        let tcp_stream = tokio::time::timeout(
            opts.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("tunnel TCP connect timeout"))??;

        configure_tcp_socket(&tcp_stream, opts);

        let connector = if is_tls {
            Some(tokio_tungstenite::Connector::Rustls(Arc::new(
                build_tls_config(),
            )))
        } else {
            None
        };
        let ws_config = WebSocketConfig {
            max_frame_size: Some(64 << 20),
            max_message_size: Some(64 << 20),
            ..Default::default()
        };
        let (ws_stream, _response) = tokio::time::timeout(
            opts.connect_timeout,
            tokio_tungstenite::client_async_tls_with_config(
                request,
                tcp_stream,
                Some(ws_config),
                connector,
            ),
        )
        .await
        .map_err(|_| anyhow::anyhow!("tunnel WebSocket handshake timeout"))??;

        info!(tunnel_id = %id, node_id = %target_node_id, url = %dial_url, "tunnel connected");

        let (ws_sink, ws_read) = futures_util::StreamExt::split(ws_stream);
        let (write_tx, writer_handle) = writer::spawn_writer(ws_sink);

        let tunnel = Arc::new(Tunnel {
            id: id.clone(),
            target_node_id,
            url: url.to_string(),
            cap,
            slots: AsyncMutex::new(SlotTable::new(cap)),
            write_tx,
            last_pong_epoch_secs: AtomicU64::new(now_epoch_secs()),
            busy: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            broken_tx,
        });

        dispatcher::spawn(Arc::clone(&tunnel), ws_read, writer_handle);

        Ok(tunnel)
    }

    /// Serialized outbound write. All frame emission funnels through here.
    async fn send_frame(&self, frame: Frame) {
        if self.write_tx.send(frame).await.is_err() {
            warn!(tunnel_id = %self.id, "tunnel writer channel closed, dropping frame");
        }
    }

    pub async fn send_ping(&self) {
        self.send_frame(Frame::ping(now_epoch_secs())).await;
    }

    fn record_pong(&self) {
        self.last_pong_epoch_secs
            .store(now_epoch_secs(), Ordering::Release);
    }

    /// Drain every busy slot (closing its `conn`) and mark the tunnel dead.
    /// Idempotent. Called by the dispatcher on read-loop exit and by the
    /// pool when evicting a stale or superseded tunnel.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slots.lock().await.drain_all();
        let _ = self.broken_tx.send(self.id.clone());
    }

    async fn alloc_slot(&self, conn: BoxedStream) -> Option<(u16, u16)> {
        let slot = self.slots.lock().await.alloc(conn)?;
        self.busy.fetch_add(1, Ordering::Relaxed);
        Some(slot)
    }

    // ---- Accept-request entry points (§4.3) ----------------------------

    /// SOCKS5 flow: allocate, announce the destination, then stream bytes.
    pub async fn on_accept_socks5(self: &Arc<Self>, conn: BoxedStream, dest: DestAddr) {
        let Some((idx, tag)) = self.alloc_slot(conn).await else {
            warn!(tunnel_id = %self.id, "slot table full, dropping SOCKS5 request");
            return;
        };
        self.send_frame(Frame::req_created(idx, tag, &dest.addr, dest.port))
            .await;
        self.serve_conn(idx, tag).await;
    }

    /// HTTP-CONNECT flow: allocate, announce, answer 200, then stream bytes.
    pub async fn on_accept_https_connect(self: &Arc<Self>, conn: BoxedStream, dest: DestAddr) {
        let Some((idx, tag)) = self.alloc_slot(conn).await else {
            warn!(tunnel_id = %self.id, "slot table full, dropping CONNECT request");
            return;
        };
        self.send_frame(Frame::req_created(idx, tag, &dest.addr, dest.port))
            .await;

        const CONNECT_OK: &[u8] =
            b"HTTP/1.1 200 Connection Established\r\nProxy-agent: linproxy\r\n\r\n";
        if let Some(shared) = self.slots.lock().await.get(idx, tag) {
            let mut guard = shared.lock().await;
            if guard.write_all(CONNECT_OK).await.is_err() {
                drop(guard);
                self.slots.lock().await.free(idx, tag);
                return;
            }
        }
        self.serve_conn(idx, tag).await;
    }

    /// Plain-HTTP flow: allocate, announce, forward the rebuilt request
    /// header as a single `ReqData`, then signal client-side finish — the
    /// response streams back asynchronously via `ReqData` frames routed by
    /// the dispatcher to this same slot.
    pub async fn on_accept_http(
        self: &Arc<Self>,
        conn: BoxedStream,
        dest: DestAddr,
        rebuilt_header_bytes: bytes::Bytes,
    ) -> Option<(u16, u16)> {
        let (idx, tag) = self.alloc_slot(conn).await?;
        self.send_frame(Frame::req_created(idx, tag, &dest.addr, dest.port))
            .await;
        self.send_frame(Frame::req_data(idx, tag, rebuilt_header_bytes))
            .await;
        self.send_frame(Frame::req_client_finished(idx, tag)).await;
        Some((idx, tag))
    }

    /// Read loop over the client connection: `ReqData` until EOF, then
    /// `ReqClientFinished`, continuing to read for a trailing close; any
    /// other read error frees the slot and closes the connection.
    async fn serve_conn(self: &Arc<Self>, idx: u16, tag: u16) {
        use tokio::io::AsyncReadExt;

        let Some(shared) = self.slots.lock().await.get(idx, tag) else {
            return;
        };

        let mut buf = vec![0u8; 4096];
        let mut half_closed = false;
        loop {
            let n = {
                let mut guard = shared.lock().await;
                guard.read(&mut buf).await
            };
            match n {
                Ok(0) => {
                    if !half_closed {
                        self.send_frame(Frame::req_client_finished(idx, tag)).await;
                        half_closed = true;
                    }
                    // Keep reading: the far end may still be sending; a
                    // genuine close arrives as a read error or another 0.
                    // Avoid a tight spin by waiting briefly.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    if !self.slots.lock().await.valid(idx, tag) {
                        return;
                    }
                }
                Ok(n) => {
                    let payload = bytes::Bytes::copy_from_slice(&buf[..n]);
                    self.send_frame(Frame::req_data(idx, tag, payload)).await;
                }
                Err(_) => {
                    self.send_frame(Frame::req_client_closed(idx, tag)).await;
                    self.slots.lock().await.free(idx, tag);
                    return;
                }
            }
        }
    }
}

fn configure_tcp_socket(stream: &TcpStream, opts: &TunnelDialOptions) {
    let sock_ref = socket2::SockRef::from(stream);
    if let Some(keepalive_time) = opts.tcp_keepalive {
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(keepalive_time)
            .with_interval(Duration::from_secs(5));
        #[cfg(not(target_os = "windows"))]
        let keepalive = keepalive.with_retries(3);
        if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
            warn!(error = %e, "failed to set TCP keepalive on tunnel socket");
        }
    }
    if opts.tcp_nodelay {
        if let Err(e) = sock_ref.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on tunnel socket");
        }
    }
}

fn build_tls_config() -> rustls::ClientConfig {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_detection_respects_window() {
        // A tunnel that just recorded a pong is never stale.
        let t = Tunnel {
            id: "t".into(),
            target_node_id: "n".into(),
            url: "ws://x".into(),
            cap: 1,
            slots: AsyncMutex::new(SlotTable::new(1)),
            write_tx: mpsc::channel(1).0,
            last_pong_epoch_secs: AtomicU64::new(now_epoch_secs()),
            busy: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            broken_tx: mpsc::unbounded_channel().0,
        };
        assert!(!t.is_stale(Duration::from_secs(3)));

        t.last_pong_epoch_secs
            .store(now_epoch_secs().saturating_sub(100), Ordering::Release);
        assert!(t.is_stale(Duration::from_secs(3)));
    }

    #[test]
    fn busy_counter_reset() {
        let t = Tunnel {
            id: "t".into(),
            target_node_id: "n".into(),
            url: "ws://x".into(),
            cap: 1,
            slots: AsyncMutex::new(SlotTable::new(1)),
            write_tx: mpsc::channel(1).0,
            last_pong_epoch_secs: AtomicU64::new(now_epoch_secs()),
            busy: AtomicUsize::new(5),
            destroyed: AtomicBool::new(false),
            broken_tx: mpsc::unbounded_channel().0,
        };
        assert_eq!(t.busy(), 5);
        t.reset_busy();
        assert_eq!(t.busy(), 0);
    }
}
