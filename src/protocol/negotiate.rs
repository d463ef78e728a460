//! Action/config handshake.
//!
//! Two frames establish the whole conversation: the initiator declares its
//! capabilities in `ACT`, the responder replies with the effective option
//! set in `CFG`. Both payloads are versioned structs with defined defaults
//! on absence, so independently-versioned peers degrade intentionally
//! rather than implicitly. After the exchange both sides hold an identical
//! `TransferConfig` and every subsequent frame is interpreted against it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrzszError};
use crate::escape::EscapeTable;

/// Highest transfer protocol revision this build speaks. The conversation
/// runs at `min(initiator, responder)`.
pub const PROTOCOL_VERSION: u32 = 2;

/// Default ceiling for the adaptive chunk size.
pub const DEFAULT_MAX_BUF_SIZE: u64 = 10 * 1024 * 1024;

/// Default per-chunk receive deadline in seconds.
pub const DEFAULT_TIMEOUT_SECS: i64 = 100;

fn is_false(v: &bool) -> bool {
    !v
}

/// `ACT` payload: the initiator's capability declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub lang: String,
    pub confirm: bool,
    pub version: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub support_dir: bool,
    #[serde(default)]
    pub protocol: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<bool>,
}

impl Action {
    /// Declaration for this build. `remote_is_windows` forces the `!\n`
    /// newline dialect and rules out binary mode up front; the responder
    /// learns both from the declaration itself.
    pub fn new(confirm: bool, local_is_windows: bool, remote_is_windows: bool) -> Self {
        let windows = local_is_windows || remote_is_windows;
        Action {
            lang: "rs".to_string(),
            confirm,
            version: env!("CARGO_PKG_VERSION").to_string(),
            support_dir: true,
            protocol: PROTOCOL_VERSION,
            newline: windows.then(|| "!\n".to_string()),
            binary: windows.then_some(false),
        }
    }
}

/// `CFG` payload: the responder's effective option set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigMessage {
    pub lang: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub quiet: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub binary: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub directory: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub overwrite: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escape_chars: Option<Vec<[String; 2]>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bufsize: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newline: Option<String>,
    #[serde(default)]
    pub protocol: u32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub tmux_output_junk: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmux_pane_width: Option<i32>,
}

/// Negotiated option set for one conversation. Built from local CLI options
/// on the responder, refined against the initiator's declaration, then
/// treated as immutable for the conversation.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub quiet: bool,
    pub binary: bool,
    pub directory: bool,
    pub overwrite: bool,
    /// `None` means never time out.
    pub timeout: Option<Duration>,
    pub newline: String,
    pub protocol: u32,
    pub max_buf_size: u64,
    pub escape_table: EscapeTable,
    pub tmux_output_junk: bool,
    pub tmux_pane_width: i32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            quiet: false,
            binary: false,
            directory: false,
            overwrite: false,
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS as u64)),
            newline: "\n".to_string(),
            protocol: 0,
            max_buf_size: DEFAULT_MAX_BUF_SIZE,
            escape_table: EscapeTable::default(),
            tmux_output_junk: false,
            tmux_pane_width: -1,
        }
    }
}

impl TransferConfig {
    /// Merge a received `CFG` payload over the defaults.
    pub fn from_message(msg: &ConfigMessage) -> Result<Self> {
        let mut config = TransferConfig {
            quiet: msg.quiet,
            binary: msg.binary,
            directory: msg.directory,
            overwrite: msg.overwrite,
            protocol: msg.protocol,
            tmux_output_junk: msg.tmux_output_junk,
            tmux_pane_width: msg.tmux_pane_width.unwrap_or(-1),
            ..TransferConfig::default()
        };
        if let Some(bufsize) = msg.bufsize {
            config.max_buf_size = bufsize;
        }
        if let Some(timeout) = msg.timeout {
            config.timeout = timeout_from_secs(timeout);
        }
        if let Some(newline) = &msg.newline {
            config.newline = newline.clone();
        }
        if let Some(wire) = &msg.escape_chars {
            config.escape_table = EscapeTable::from_wire(wire)?;
        }
        Ok(config)
    }

    /// Wire form of this option set for the `CFG` frame.
    pub fn to_message(&self) -> ConfigMessage {
        ConfigMessage {
            lang: "rs".to_string(),
            quiet: self.quiet,
            binary: self.binary,
            directory: self.directory,
            overwrite: self.overwrite,
            escape_chars: self
                .binary
                .then(|| self.escape_table.to_wire())
                .filter(|w| !w.is_empty()),
            bufsize: Some(self.max_buf_size),
            timeout: Some(
                self.timeout
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0),
            ),
            newline: (self.newline != "\n").then(|| self.newline.clone()),
            protocol: self.protocol,
            tmux_output_junk: self.tmux_output_junk,
            tmux_pane_width: (self.tmux_pane_width > 0).then_some(self.tmux_pane_width),
        }
    }

    /// Refine the responder's locally-built config against the initiator's
    /// declaration. Downgrades that change semantics silently are refused:
    /// a peer without directory support fails the conversation explicitly.
    pub fn negotiate(&mut self, action: &Action) -> Result<()> {
        self.protocol = action.protocol.min(PROTOCOL_VERSION);
        if self.binary && action.binary == Some(false) {
            self.binary = false;
            self.escape_table = EscapeTable::default();
        }
        if self.directory && !action.support_dir {
            return Err(TrzszError::local(
                "The remote side does not support transferring directories",
            ));
        }
        if let Some(newline) = &action.newline {
            self.newline = newline.clone();
        }
        Ok(())
    }
}

/// Timeout semantics: `<= 0` means never.
pub fn timeout_from_secs(secs: i64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs as u64))
}
