//! One transfer conversation over one exclusive terminal stream.
//!
//! The conversation owns the reader and writer halves for its whole
//! duration and drives a strict lockstep: every unit of information
//! (count, name, size, chunk, digest) is acknowledged before the next is
//! sent. No frame is ever sent speculatively except the raw bytes of the
//! current binary DATA chunk.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWrite;

use crate::cancel::{drain_timeout, StopToken};
use crate::error::{Result, TrzszError};
use crate::protocol::filter::{locate_frame, strip_tmux_status_line};
use crate::protocol::frame::{
    decode_buffer, encode_buffer, with_deadline, Dialect, FrameRead, FrameWriter,
};
use crate::protocol::negotiate::{Action, ConfigMessage, TransferConfig, PROTOCOL_VERSION};

/// Default drain window before reporting an error or exiting.
const CLEAN_TIMEOUT: Duration = Duration::from_millis(100);

/// Widened drain window after a receive timeout, when the peer may still be
/// mid-chunk.
const TIMEOUT_CLEAN_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Conversation<F, W> {
    reader: F,
    writer: FrameWriter<W>,
    pub config: TransferConfig,
    stop: StopToken,
    max_chunk_time: Duration,
    clean_timeout: Duration,
}

impl<F, W> Conversation<F, W>
where
    F: FrameRead,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: F, writer: FrameWriter<W>, config: TransferConfig, stop: StopToken) -> Self {
        Self {
            reader,
            writer,
            config,
            stop,
            max_chunk_time: Duration::ZERO,
            clean_timeout: CLEAN_TIMEOUT,
        }
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Largest chunk round trip observed so far, used to size the drain
    /// window on the way out of a fatal condition.
    pub fn note_chunk_time(&mut self, elapsed: Duration) {
        if elapsed > self.max_chunk_time {
            self.max_chunk_time = elapsed;
        }
    }

    pub fn stop_drain_timeout(&self) -> Duration {
        drain_timeout(self.max_chunk_time)
    }

    // ------------------------------------------------------------------
    // Frame layer
    // ------------------------------------------------------------------

    pub async fn send_line(&mut self, tag: &str, payload: &str) -> Result<()> {
        self.writer.write_frame(tag, payload).await
    }

    /// Read one line and cut away terminal junk. The junk path is active
    /// when the negotiated config says the channel can carry junk, or when
    /// the caller explicitly allows it (handshake frames arrive before the
    /// config does).
    async fn recv_line(&mut self, expect_tag: &str, may_has_junk: bool) -> Result<Vec<u8>> {
        let mut line = self.reader.read_frame_line().await?;
        if self.config.tmux_output_junk || may_has_junk {
            if self.reader.dialect() == Dialect::Posix {
                // Shell redraws can split a line with trailing carriage
                // returns; keep reading until a real terminator.
                while line.last() == Some(&b'\r') {
                    line.pop();
                    line.extend(self.reader.read_frame_line().await?);
                }
                line = strip_tmux_status_line(&line);
            }
            let frame = locate_frame(&line, expect_tag);
            if frame.len() != line.len() {
                tracing::debug!(
                    cut = line.len() - frame.len(),
                    tag = expect_tag,
                    "dropped junk before frame"
                );
            }
            line = frame.to_vec();
        }
        Ok(line)
    }

    /// Parse one frame, expecting `expect_tag`; returns the raw payload.
    /// EXIT and FAIL/fail tags surface as their distinguished conditions.
    pub async fn recv_check(&mut self, expect_tag: &str, may_has_junk: bool) -> Result<String> {
        let line = self.recv_line(expect_tag, may_has_junk).await?;
        let line = String::from_utf8_lossy(&line).into_owned();
        let colon = match line.find(':') {
            Some(idx) if idx >= 1 => idx,
            _ => {
                return Err(TrzszError::Colon {
                    encoded_line: encode_buffer(line.as_bytes()),
                })
            }
        };
        let tag = &line[1..colon];
        let payload = &line[colon + 1..];
        if tag != expect_tag {
            return Err(tag_error(tag, payload));
        }
        Ok(payload.to_string())
    }

    // ------------------------------------------------------------------
    // Typed units
    // ------------------------------------------------------------------

    pub async fn send_integer(&mut self, tag: &str, value: u64) -> Result<()> {
        self.send_line(tag, &value.to_string()).await
    }

    pub async fn recv_integer(&mut self, tag: &str, may_has_junk: bool) -> Result<u64> {
        let payload = self.recv_check(tag, may_has_junk).await?;
        payload
            .parse()
            .map_err(|_| TrzszError::protocol(format!("invalid integer: {payload}")))
    }

    /// Lockstep ack: the peer must echo the exact integer back.
    pub async fn check_integer(&mut self, expect: u64) -> Result<()> {
        let result = self.recv_integer("SUCC", false).await?;
        if result != expect {
            return Err(TrzszError::Integrity(format!("[{result}] <> [{expect}]")));
        }
        Ok(())
    }

    pub async fn send_string(&mut self, tag: &str, value: &str) -> Result<()> {
        let payload = encode_buffer(value.as_bytes());
        self.send_line(tag, &payload).await
    }

    pub async fn recv_string(&mut self, tag: &str, may_has_junk: bool) -> Result<String> {
        let payload = self.recv_check(tag, may_has_junk).await?;
        let bytes = decode_buffer(&payload)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn check_string(&mut self, expect: &str) -> Result<()> {
        let result = self.recv_string("SUCC", false).await?;
        if result != expect {
            return Err(TrzszError::Integrity(format!("[{result}] <> [{expect}]")));
        }
        Ok(())
    }

    pub async fn send_binary(&mut self, tag: &str, data: &[u8]) -> Result<()> {
        let payload = encode_buffer(data);
        self.send_line(tag, &payload).await
    }

    pub async fn recv_binary(&mut self, tag: &str, may_has_junk: bool) -> Result<Vec<u8>> {
        let payload = self.recv_check(tag, may_has_junk).await?;
        decode_buffer(&payload)
    }

    pub async fn check_binary(&mut self, expect: &[u8]) -> Result<()> {
        let result = self.recv_binary("SUCC", false).await?;
        if result != expect {
            return Err(TrzszError::Integrity(format!(
                "[{result:?}] <> [{expect:?}]"
            )));
        }
        Ok(())
    }

    pub async fn send_json<T: Serialize + Sync>(&mut self, tag: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)
            .map_err(|e| TrzszError::protocol(format!("encode json error: {e}")))?;
        self.send_string(tag, &json).await
    }

    pub async fn recv_json<T: DeserializeOwned>(
        &mut self,
        tag: &str,
        may_has_junk: bool,
    ) -> Result<T> {
        let json = self.recv_string(tag, may_has_junk).await?;
        serde_json::from_str(&json).map_err(|e| TrzszError::Decode {
            input: json,
            reason: e.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Data chunks
    // ------------------------------------------------------------------

    /// Write one file content chunk. Binary mode writes a length-prefixed
    /// escaped frame; otherwise the chunk rides as a structured payload.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        if !self.config.binary {
            return self.send_binary("DATA", data).await;
        }
        let escaped = self.config.escape_table.escape(data);
        self.writer.write_binary_frame(&escaped).await
    }

    /// Read one file content chunk, under the negotiated per-chunk
    /// deadline. A fired deadline is fatal to the conversation and widens
    /// the later drain window, since the peer may still be mid-chunk.
    pub async fn recv_data(&mut self) -> Result<Vec<u8>> {
        let timeout = self.config.timeout;
        let result = with_deadline(timeout, async {
            if !self.config.binary {
                self.recv_binary("DATA", false).await
            } else {
                let size = self.recv_integer("DATA", false).await?;
                // Escaping at most doubles a chunk, so anything larger than
                // twice the negotiated buffer cannot be a legitimate length.
                // Checked before allocating.
                if size > self.config.max_buf_size.saturating_mul(2) {
                    return Err(TrzszError::protocol(format!(
                        "data length {size} exceeds the negotiated buffer size"
                    )));
                }
                let raw = self.reader.read_raw(size as usize).await?;
                Ok(self.config.escape_table.unescape(&raw))
            }
        })
        .await;
        if matches!(result, Err(TrzszError::Timeout)) {
            self.clean_timeout = TIMEOUT_CLEAN_TIMEOUT;
        }
        result
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    /// Initiator: declare capabilities. Switches the frame dialect first so
    /// the declaration itself already uses the newline the peer expects.
    pub async fn send_action(&mut self, action: &Action) -> Result<()> {
        self.adopt_newline(action);
        self.send_json("ACT", action).await
    }

    /// Responder: read the declaration. Handshake frames tolerate junk
    /// even before the config negotiation completes.
    pub async fn recv_action(&mut self) -> Result<Action> {
        let payload = self.recv_check("ACT", true).await?;
        // An initiator on (or talking to) a Windows console has already
        // switched to the "!\n" terminator when it sends this frame, so a
        // newline-dialect read picks up a stray trailing '!'. It can never
        // be part of the base64 payload.
        let payload = payload.trim_end_matches('!');
        let bytes = decode_buffer(payload)?;
        let json = String::from_utf8_lossy(&bytes).into_owned();
        let action: Action = serde_json::from_str(&json).map_err(|e| TrzszError::Decode {
            input: json,
            reason: e.to_string(),
        })?;
        self.adopt_newline(&action);
        Ok(action)
    }

    /// Adopt the declared newline dialect on both halves of the stream.
    /// `"!\n"` means a Windows console is involved, so reads switch to the
    /// `!`-terminated filtering dialect as well.
    fn adopt_newline(&mut self, action: &Action) {
        if let Some(newline) = &action.newline {
            self.config.newline = newline.clone();
            self.writer.set_newline(newline.clone());
            if newline == "!\n" {
                self.reader.set_dialect(Dialect::Windows);
            }
        }
    }

    /// Responder: refine the local option set against the declaration and
    /// send the effective config. Both sides hold identical configs after.
    pub async fn send_config(&mut self, action: &Action) -> Result<()> {
        let mut config = self.config.clone();
        config.negotiate(action)?;
        tracing::debug!(
            protocol = config.protocol,
            binary = config.binary,
            directory = config.directory,
            "negotiated transfer config"
        );
        let msg = config.to_message();
        self.config = config;
        self.send_json("CFG", &msg).await
    }

    /// Initiator: adopt the responder's effective config.
    pub async fn recv_config(&mut self) -> Result<&TransferConfig> {
        let msg: ConfigMessage = self.recv_json("CFG", true).await?;
        let mut config = TransferConfig::from_message(&msg)?;
        config.protocol = config.protocol.min(PROTOCOL_VERSION);
        config.newline = self.config.newline.clone();
        self.config = config;
        Ok(&self.config)
    }

    // ------------------------------------------------------------------
    // Conversation end
    // ------------------------------------------------------------------

    /// Graceful end: the initiator reports its summary through the error
    /// channel, which the responder must not treat as an error.
    pub async fn send_exit(&mut self, msg: &str) -> Result<()> {
        self.clean_input(Duration::from_millis(500)).await;
        self.send_string("EXIT", msg).await
    }

    pub async fn recv_exit(&mut self) -> Result<String> {
        self.recv_string("EXIT", false).await
    }

    /// Report a fatal condition to the peer. Untraceable conditions travel
    /// as the lowercase `fail` so the peer prints only the short message.
    pub async fn send_fail(&mut self, message: &str, trace: bool) -> Result<()> {
        self.send_string(if trace { "FAIL" } else { "fail" }, message)
            .await
    }

    /// Read and discard whatever the peer is still sending, so stray
    /// protocol bytes do not echo into the user's next command line.
    pub async fn clean_input(&mut self, window: Duration) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match tokio::time::timeout(window, self.reader.read_any(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => continue,
                _ => return,
            }
        }
    }

    /// Drain window for the current error path: widened after a receive
    /// timeout, and sized by chunk latency after a stop.
    pub fn clean_timeout(&self) -> Duration {
        if self.stop.is_stopped() {
            std::cmp::max(self.clean_timeout, self.stop_drain_timeout())
        } else {
            self.clean_timeout
        }
    }
}

/// Map a mismatched tag to its distinguished condition. The graceful EXIT
/// and the peer-reported FAIL/fail arrive on the same channel as real tag
/// corruption and must not be flattened into a generic parse failure.
fn tag_error(tag: &str, payload: &str) -> TrzszError {
    match tag {
        "EXIT" => TrzszError::RemoteExit(decode_message(payload)),
        "FAIL" => TrzszError::RemoteFail {
            message: decode_message(payload),
            trace: true,
        },
        "fail" => TrzszError::RemoteFail {
            message: decode_message(payload),
            trace: false,
        },
        _ => TrzszError::UnexpectedTag {
            tag: tag.to_string(),
            payload: payload.to_string(),
        },
    }
}

fn decode_message(payload: &str) -> String {
    match decode_buffer(payload) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => format!("decode [{payload}] error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::FrameReader;
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    type TestConversation =
        Conversation<FrameReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>>;

    fn pair() -> (TestConversation, TestConversation) {
        pair_with(TransferConfig::default(), TransferConfig::default())
    }

    fn pair_with(a: TransferConfig, b: TransferConfig) -> (TestConversation, TestConversation) {
        let (left, right) = duplex(1024 * 1024);
        let (lr, lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);
        let stop = StopToken::new();
        let left = Conversation::new(
            FrameReader::posix(lr, stop.clone()),
            FrameWriter::new(lw, "\n"),
            a,
            stop.clone(),
        );
        let right = Conversation::new(
            FrameReader::posix(rr, stop.clone()),
            FrameWriter::new(rw, "\n"),
            b,
            stop,
        );
        (left, right)
    }

    #[tokio::test]
    async fn test_integer_lockstep() {
        let (mut a, mut b) = pair();
        a.send_integer("NUM", 3).await.unwrap();
        assert_eq!(b.recv_integer("NUM", false).await.unwrap(), 3);
        b.send_integer("SUCC", 3).await.unwrap();
        a.check_integer(3).await.unwrap();
    }

    #[tokio::test]
    async fn test_integer_echo_mismatch_is_integrity_error() {
        let (mut a, mut b) = pair();
        b.send_integer("SUCC", 7).await.unwrap();
        assert!(matches!(
            a.check_integer(8).await,
            Err(TrzszError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn test_string_roundtrip_unicode() {
        let (mut a, mut b) = pair();
        a.send_string("NAME", "文件名 with spaces.txt").await.unwrap();
        assert_eq!(
            b.recv_string("NAME", false).await.unwrap(),
            "文件名 with spaces.txt"
        );
    }

    #[tokio::test]
    async fn test_missing_colon_is_colon_error() {
        let (left, right) = duplex(4096);
        let (_lr, mut lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);
        let stop = StopToken::new();
        let mut b: TestConversation = Conversation::new(
            FrameReader::posix(rr, stop.clone()),
            FrameWriter::new(rw, "\n"),
            TransferConfig::default(),
            stop,
        );
        tokio::io::AsyncWriteExt::write_all(&mut lw, b"#NOCOLON\n")
            .await
            .unwrap();
        assert!(matches!(
            b.recv_check("NUM", false).await,
            Err(TrzszError::Colon { .. })
        ));
    }

    #[tokio::test]
    async fn test_exit_is_distinguished() {
        let (mut a, mut b) = pair();
        a.send_string("EXIT", "all done").await.unwrap();
        match b.recv_check("SUCC", false).await {
            Err(TrzszError::RemoteExit(msg)) => assert_eq!(msg, "all done"),
            other => panic!("expected RemoteExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fail_variants_distinguished() {
        let (mut a, mut b) = pair();
        a.send_fail("boom", false).await.unwrap();
        match b.recv_check("SUCC", false).await {
            Err(TrzszError::RemoteFail { message, trace }) => {
                assert_eq!(message, "boom");
                assert!(!trace);
            }
            other => panic!("expected RemoteFail, got {other:?}"),
        }

        a.send_fail("traced boom", true).await.unwrap();
        match b.recv_check("SUCC", false).await {
            Err(TrzszError::RemoteFail { trace, .. }) => assert!(trace),
            other => panic!("expected RemoteFail, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_junk_recovery_rightmost_tag() {
        let (left, right) = duplex(4096);
        let (_lr, mut lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);
        let stop = StopToken::new();
        let mut b: TestConversation = Conversation::new(
            FrameReader::posix(rr, stop.clone()),
            FrameWriter::new(rw, "\n"),
            TransferConfig::default(),
            stop,
        );
        tokio::io::AsyncWriteExt::write_all(&mut lw, b"garbage#SIZE:2#SIZE:5000\n")
            .await
            .unwrap();
        assert_eq!(b.recv_integer("SIZE", true).await.unwrap(), 5000);
    }

    #[tokio::test]
    async fn test_carriage_return_continuation() {
        let (left, right) = duplex(4096);
        let (_lr, mut lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);
        let stop = StopToken::new();
        let config = TransferConfig {
            tmux_output_junk: true,
            ..TransferConfig::default()
        };
        let mut b: TestConversation = Conversation::new(
            FrameReader::posix(rr, stop.clone()),
            FrameWriter::new(rw, "\n"),
            config,
            stop,
        );
        // A shell redraw split the line with a trailing \r before the
        // real terminator arrived.
        tokio::io::AsyncWriteExt::write_all(&mut lw, b"#SIZE:50\r\n00\n")
            .await
            .unwrap();
        assert_eq!(b.recv_integer("SIZE", false).await.unwrap(), 5000);
    }

    #[tokio::test]
    async fn test_binary_data_roundtrip() {
        let config = TransferConfig {
            binary: true,
            escape_table: crate::escape::EscapeTable::new(true),
            ..TransferConfig::default()
        };
        let (mut a, mut b) = pair_with(config.clone(), config);
        let payload = vec![0u8, 3, 0xEE, 0x7E, 0x1B, 255];
        a.send_data(&payload).await.unwrap();
        assert_eq!(b.recv_data().await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_base64_data_roundtrip() {
        let (mut a, mut b) = pair();
        let payload = vec![9u8; 5000];
        a.send_data(&payload).await.unwrap();
        assert_eq!(b.recv_data().await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_recv_data_timeout() {
        let config = TransferConfig {
            timeout: Some(Duration::from_millis(50)),
            ..TransferConfig::default()
        };
        let (a, mut b) = pair_with(TransferConfig::default(), config);
        let result = b.recv_data().await;
        assert!(matches!(result, Err(TrzszError::Timeout)));
        assert_eq!(b.clean_timeout(), Duration::from_secs(3));
        drop(a);
    }

    #[tokio::test]
    async fn test_handshake_negotiates_min_version() {
        let (mut client, mut server) = pair();
        let client_task = async {
            let mut action = Action::new(true, false, false);
            action.protocol = 1;
            client.send_action(&action).await.unwrap();
            client.recv_config().await.unwrap();
            client.config.protocol
        };
        let server_task = async {
            let action = server.recv_action().await.unwrap();
            server.send_config(&action).await.unwrap();
            server.config.protocol
        };
        let (client_proto, server_proto) = tokio::join!(client_task, server_task);
        assert_eq!(client_proto, 1);
        assert_eq!(server_proto, 1);
    }

    #[tokio::test]
    async fn test_handshake_with_windows_peer_switches_dialect() {
        let (mut client, mut server) = pair();
        let client_task = async {
            // Declaring a Windows remote switches the initiator to the
            // "!\n" terminator before the declaration goes out.
            let action = Action::new(true, false, true);
            client.send_action(&action).await.unwrap();
            client.recv_config().await.unwrap();
            client
        };
        let server_task = async {
            let action = server.recv_action().await.unwrap();
            assert_eq!(action.newline.as_deref(), Some("!\n"));
            server.send_config(&action).await.unwrap();
            server
        };
        let (mut client, mut server) = tokio::join!(client_task, server_task);
        assert_eq!(client.config.newline, "!\n");
        assert_eq!(server.config.newline, "!\n");

        // Frames keep flowing in the console dialect, both directions.
        client.send_integer("NUM", 2).await.unwrap();
        assert_eq!(server.recv_integer("NUM", false).await.unwrap(), 2);
        server.send_integer("SUCC", 2).await.unwrap();
        client.check_integer(2).await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_data_length_rejected_before_allocation() {
        let (left, right) = duplex(4096);
        let (_lr, mut lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);
        let stop = StopToken::new();
        let config = TransferConfig {
            binary: true,
            max_buf_size: 4096,
            ..TransferConfig::default()
        };
        let mut b: TestConversation = Conversation::new(
            FrameReader::posix(rr, stop.clone()),
            FrameWriter::new(rw, "\n"),
            config,
            stop,
        );
        // A length far beyond the negotiated buffer, with no bytes behind
        // it. The length check must fire, not the allocation.
        tokio::io::AsyncWriteExt::write_all(&mut lw, b"#DATA:999999999999\n")
            .await
            .unwrap();
        assert!(matches!(
            b.recv_data().await,
            Err(TrzszError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_data_length_within_escape_expansion_accepted() {
        let config = TransferConfig {
            binary: true,
            max_buf_size: 8,
            escape_table: crate::escape::EscapeTable::new(false),
            ..TransferConfig::default()
        };
        let (mut a, mut b) = pair_with(config.clone(), config);
        // Eight escaped-marker bytes escape to sixteen on the wire, right
        // at the allowed expansion bound.
        let payload = vec![0xEEu8; 8];
        a.send_data(&payload).await.unwrap();
        assert_eq!(b.recv_data().await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_handshake_binary_downgrade() {
        let server_config = TransferConfig {
            binary: true,
            escape_table: crate::escape::EscapeTable::new(false),
            ..TransferConfig::default()
        };
        let (mut client, mut server) = pair_with(TransferConfig::default(), server_config);
        let client_task = async {
            // Peer declares itself unable to do binary mode.
            let mut action = Action::new(true, false, false);
            action.binary = Some(false);
            client.send_action(&action).await.unwrap();
            client.recv_config().await.unwrap();
            client.config.binary
        };
        let server_task = async {
            let action = server.recv_action().await.unwrap();
            server.send_config(&action).await.unwrap();
            server.config.binary
        };
        let (client_binary, server_binary) = tokio::join!(client_task, server_task);
        assert!(!client_binary);
        assert!(!server_binary);
    }
}
