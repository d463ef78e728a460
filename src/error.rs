//! Error taxonomy for the transfer protocol.
//!
//! Almost nothing is recovered locally: a fatal condition unwinds the whole
//! conversation. The only cleanup is draining straggling peer bytes and, for
//! the stop-and-delete variant, removing files created during the transfer.

use thiserror::Error;

/// Main error type for a transfer conversation.
#[derive(Debug, Error)]
pub enum TrzszError {
    /// I/O error from the underlying stream or filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A received line had no colon after the tag. Carries the offending
    /// line encoded as base64(deflate) so it can travel in a FAIL frame
    /// without re-corrupting the terminal.
    #[error("[TrzszError] colon: {encoded_line}")]
    Colon { encoded_line: String },

    /// A frame arrived with a tag other than the expected one (and it was
    /// not one of the distinguished EXIT/FAIL/fail conditions).
    #[error("[TrzszError] {tag}: {payload}")]
    UnexpectedTag { tag: String, payload: String },

    /// The peer finished the conversation gracefully. Arrives on the same
    /// channel as errors but must never be reported as one.
    #[error("{0}")]
    RemoteExit(String),

    /// The peer reported a fatal condition. `trace` distinguishes the
    /// uppercase FAIL (full diagnostic preserved) from the lowercase fail
    /// (short message only).
    #[error("{message}")]
    RemoteFail { message: String, trace: bool },

    /// An echoed acknowledgment or the final MD5 digest did not match.
    /// Never retried.
    #[error("{0}")]
    Integrity(String),

    /// A chunk read blocked longer than the negotiated timeout.
    #[error("Receive data timeout")]
    Timeout,

    /// The local side requested a stop; in-flight reads unwind with this.
    #[error("Stopped")]
    Stopped,

    /// Stop variant that also rolls back every file created so far.
    #[error("Stopped and deleted")]
    StoppedAndDeleted,

    /// A ^C byte arrived on the raw input stream.
    #[error("Interrupted")]
    Interrupted,

    /// Payload failed base64/zlib/json decoding.
    #[error("decode [{input}] error: {reason}")]
    Decode { input: String, reason: String },

    /// Local validation failure detected before the handshake.
    #[error("{0}")]
    Local(String),

    /// Any other protocol violation.
    #[error("{0}")]
    Protocol(String),
}

impl TrzszError {
    pub fn local(msg: impl Into<String>) -> Self {
        TrzszError::Local(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        TrzszError::Protocol(msg.into())
    }

    /// Whether a stack-style diagnostic should be preserved when reporting
    /// this error. Short-message conditions (user cancellation, validation,
    /// peer `fail`/`EXIT`) print only their display form.
    pub fn traceable(&self) -> bool {
        match self {
            TrzszError::RemoteExit(_)
            | TrzszError::RemoteFail { trace: false, .. }
            | TrzszError::Integrity(_)
            | TrzszError::Timeout
            | TrzszError::Stopped
            | TrzszError::StoppedAndDeleted
            | TrzszError::Interrupted
            | TrzszError::Local(_) => false,
            TrzszError::RemoteFail { trace: true, .. } => true,
            _ => true,
        }
    }

    pub fn is_remote_exit(&self) -> bool {
        matches!(self, TrzszError::RemoteExit(_))
    }

    pub fn is_remote_fail(&self) -> bool {
        matches!(self, TrzszError::RemoteFail { .. })
    }

    pub fn is_stop_and_delete(&self) -> bool {
        matches!(self, TrzszError::StoppedAndDeleted)
    }
}

pub type Result<T> = std::result::Result<T, TrzszError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_policy() {
        assert!(!TrzszError::RemoteExit("done".into()).traceable());
        assert!(!TrzszError::RemoteFail {
            message: "oops".into(),
            trace: false
        }
        .traceable());
        assert!(TrzszError::RemoteFail {
            message: "oops".into(),
            trace: true
        }
        .traceable());
        assert!(!TrzszError::Stopped.traceable());
        assert!(!TrzszError::Local("No such file: x".into()).traceable());
        assert!(TrzszError::protocol("bad frame").traceable());
    }

    #[test]
    fn test_distinguished_conditions() {
        assert!(TrzszError::RemoteExit("ok".into()).is_remote_exit());
        assert!(!TrzszError::Timeout.is_remote_exit());
        assert!(TrzszError::RemoteFail {
            message: "x".into(),
            trace: false
        }
        .is_remote_fail());
        assert!(TrzszError::StoppedAndDeleted.is_stop_and_delete());
    }
}
