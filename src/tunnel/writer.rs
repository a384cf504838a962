//! Dedicated WebSocket writer task.
//!
//! Every outbound frame, from any number of producer tasks (accept paths,
//! `serve_conn` loops, the dispatcher's Pong replies), goes through this
//! single task's channel. Because only one task ever touches the sink, frame
//! writes are naturally serialized and never interleave — this is the
//! `write_lock` from the data model, implemented as a queue plus a single
//! consumer rather than a mutex around the sink.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};

use super::protocol::Frame;

/// Sender half — cloned by accept paths and `serve_conn` tasks.
pub type FrameSender = mpsc::Sender<Frame>;

/// Spawn the writer task. Returns the sender and a `JoinHandle` for cleanup.
///
/// The task exits (and closes the sink) once every clone of the sender has
/// been dropped, i.e. once the tunnel and all of its in-flight streams are
/// gone.
pub fn spawn_writer<S>(mut sink: S) -> (FrameSender, JoinHandle<()>)
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Frame>(256);

    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let data = frame.encode();
            if let Err(e) = sink.send(Message::Binary(data)).await {
                error!(error = %e, "failed to write frame to tunnel WebSocket");
                break;
            }
        }
        debug!("tunnel writer task exiting");
        let _ = sink.close().await;
    });

    (tx, handle)
}
