//! Tunnel read loop: demultiplexes inbound WebSocket frames by `(idx, tag)`.
//!
//! One task per tunnel, spawned from [`super::Tunnel::connect`]. Grounded on
//! the teacher's `tunnel/dispatcher.rs` for the `tokio::select!` shape
//! (racing the next WebSocket message against a stale-connection timer) and
//! on `original_source/proxy/tunnel.go`'s `onTunnelMsg` for the per-command
//! behavior, adapted to the 5-byte request-frame header this protocol uses
//! instead of the teacher's own JSON-metadata framing.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::protocol::{Cmd, Frame};
use super::Tunnel;

/// Spawn the dispatcher task. `ws_read` is the read half of the split
/// WebSocket stream; `writer_handle` lets the dispatcher notice the writer
/// dying even if the read half stays technically open.
pub fn spawn<S>(tunnel: Arc<Tunnel>, ws_read: S, writer_handle: JoinHandle<()>)
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin
        + Send
        + 'static,
{
    tokio::spawn(async move {
        run(&tunnel, ws_read, writer_handle).await;
        tunnel.destroy().await;
        debug!(tunnel_id = tunnel.id(), "tunnel dispatcher exited");
    });
}

/// Stale-connection window: if nothing at all (not even a pong) arrives for
/// this long, treat the tunnel as dead rather than blocking forever.
const STALE_TIMEOUT: Duration = Duration::from_secs(60);

async fn run<S>(tunnel: &Arc<Tunnel>, mut ws_read: S, mut writer_handle: JoinHandle<()>)
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut last_activity = tokio::time::Instant::now();

    loop {
        let msg = tokio::select! {
            msg = ws_read.next() => msg,
            _ = tokio::time::sleep_until(last_activity + STALE_TIMEOUT) => {
                warn!(tunnel_id = tunnel.id(), "tunnel stale, no data received");
                return;
            }
            result = &mut writer_handle => {
                match result {
                    Ok(()) => warn!(tunnel_id = tunnel.id(), "tunnel writer exited"),
                    Err(e) => warn!(tunnel_id = tunnel.id(), error = %e, "tunnel writer task failed"),
                }
                return;
            }
        };

        let msg = match msg {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                warn!(tunnel_id = tunnel.id(), error = %e, "tunnel read error");
                return;
            }
            None => {
                debug!(tunnel_id = tunnel.id(), "tunnel WebSocket closed");
                return;
            }
        };

        last_activity = tokio::time::Instant::now();

        let data = match msg {
            Message::Binary(data) => data,
            Message::Close(_) => return,
            _ => continue,
        };

        let frame = match Frame::decode(data.into()) {
            Ok(f) => f,
            Err(e) => {
                warn!(tunnel_id = tunnel.id(), error = %e, "failed to decode tunnel frame, skipping");
                continue;
            }
        };

        handle_frame(tunnel, frame).await;
    }
}

async fn handle_frame(tunnel: &Arc<Tunnel>, frame: Frame) {
    match frame {
        Frame::Ping { unix_seconds } => {
            tunnel.send_frame(Frame::pong(unix_seconds)).await;
        }
        Frame::Pong { .. } => {
            tunnel.record_pong();
        }
        Frame::Request {
            cmd, idx, tag, payload,
        } => match cmd {
            Cmd::ReqData => {
                let shared = tunnel.slots.lock().await.get(idx, tag);
                if let Some(shared) = shared {
                    let mut guard = shared.lock().await;
                    if guard.write_all(&payload).await.is_err() {
                        drop(guard);
                        tunnel.slots.lock().await.free(idx, tag);
                    }
                }
                // Else: stream already freed, drop silently (expected race).
            }
            Cmd::ReqServerFinished => {
                if let Some(shared) = tunnel.slots.lock().await.get(idx, tag) {
                    let mut guard = shared.lock().await;
                    let _ = guard.shutdown().await;
                }
            }
            Cmd::ReqServerClosed => {
                tunnel.slots.lock().await.free(idx, tag);
            }
            Cmd::ReqRefreshQuota => {
                // Reserved, ignored per spec.
            }
            Cmd::ReqCreated | Cmd::ReqClientClosed | Cmd::ReqClientFinished => {
                debug!(
                    tunnel_id = tunnel.id(),
                    ?cmd,
                    "ignoring client-direction command received from server"
                );
            }
        },
    }
}
