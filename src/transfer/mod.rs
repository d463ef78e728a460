//! Transfer engine: sender and receiver state machines, adaptive chunk
//! sizing, and the end-of-conversation error reporting that keeps the
//! user's terminal usable after a failure.

pub mod flow;
pub mod recv;
pub mod send;

use tokio::io::AsyncWrite;

use crate::error::TrzszError;
use crate::protocol::frame::FrameRead;
use crate::protocol::Conversation;

pub use flow::{ChunkSizer, BASE_CHUNK_SIZE};
pub use recv::{recv_files, CreatedFiles};
pub use send::send_files;

/// Wind down the initiator side after a fatal condition: drain straggling
/// peer bytes, then report the condition over the wire unless the peer
/// raised it first. Returns the diagnostic to show locally, or `None` for
/// conditions whose short message the peer already displays.
pub async fn finish_client_error<F, W>(
    conv: &mut Conversation<F, W>,
    err: &TrzszError,
) -> Option<String>
where
    F: FrameRead,
    W: AsyncWrite + Unpin + Send,
{
    conv.clean_input(conv.clean_timeout()).await;
    if err.is_remote_exit() {
        return None;
    }
    let trace = err.traceable();
    if err.is_remote_fail() {
        // The peer raised it; only echo traced diagnostics locally.
        return trace.then(|| err.to_string());
    }
    let msg = err.to_string();
    let _ = conv.send_fail(&msg, trace).await;
    trace.then_some(msg)
}

/// Wind down the responder side after a fatal condition. Same drain and
/// report rules as the initiator, plus the stop-and-delete rollback. The
/// responder owns the visible terminal, so this always yields a status
/// line to print after the screen restore.
pub async fn finish_server_error<F, W>(
    conv: &mut Conversation<F, W>,
    err: &TrzszError,
    created: &mut CreatedFiles,
) -> String
where
    F: FrameRead,
    W: AsyncWrite + Unpin + Send,
{
    tracing::debug!(%err, "transfer failed");
    conv.clean_input(conv.clean_timeout()).await;
    if err.is_stop_and_delete() {
        let deleted = created.delete_all();
        if !deleted.is_empty() {
            let mut lines = vec![format!("{err}:")];
            lines.extend(deleted);
            return lines.join("\r\n- ");
        }
    }
    let msg = err.to_string();
    if err.is_remote_exit() || err.is_remote_fail() {
        return msg;
    }
    let _ = conv.send_fail(&msg, err.traceable()).await;
    msg
}
