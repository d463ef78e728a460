//! Terminal plumbing around a conversation.
//!
//! The server binaries own the terminal for the duration of a transfer:
//! they print the trigger line the peer's terminal watches for, switch
//! stdin to raw mode, and on the way out restore the saved cursor and wipe
//! the protocol bytes off the screen. Environment discovery stays at the
//! interface level (tmux geometry and mode, terminal width).

use std::fmt;
use std::io::Write;
use std::process::Command;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, TrzszError};

const TRIGGER_PREFIX: &str = "::TRZSZ:TRANSFER:";

/// Which role the trigger line announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Server sends, peer should receive.
    Send,
    /// Server receives, peer should send.
    Recv,
    /// Like `Recv`, with directory transfers allowed.
    RecvDir,
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerMode::Send => "S",
            TriggerMode::Recv => "R",
            TriggerMode::RecvDir => "D",
        })
    }
}

impl FromStr for TriggerMode {
    type Err = TrzszError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "S" => Ok(TriggerMode::Send),
            "R" => Ok(TriggerMode::Recv),
            "D" => Ok(TriggerMode::RecvDir),
            other => Err(TrzszError::protocol(format!("unknown trigger mode: {other}"))),
        }
    }
}

/// The line a server prints to start a transfer. The bell plus
/// save-cursor prefix rides along so the terminal can restore the screen
/// after the protocol traffic, and the unique id keeps repeated triggers
/// distinguishable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerLine {
    pub mode: TriggerMode,
    pub version: String,
    pub unique_id: String,
}

impl TriggerLine {
    pub fn new(mode: TriggerMode, tmux: &TmuxEnv) -> Self {
        TriggerLine {
            mode,
            version: env!("CARGO_PKG_VERSION").to_string(),
            unique_id: unique_id(tmux),
        }
    }

    /// Full byte sequence to print, terminator included.
    pub fn render(&self) -> String {
        format!(
            "\x07\x1b7{}{}:{}:{}\r\n",
            TRIGGER_PREFIX, self.mode, self.version, self.unique_id
        )
    }

    /// Find and parse a trigger anywhere in terminal output.
    pub fn parse(output: &str) -> Option<TriggerLine> {
        let start = output.rfind(TRIGGER_PREFIX)? + TRIGGER_PREFIX.len();
        let rest = &output[start..];
        let end = rest
            .find(|c: char| c == '\r' || c == '\n')
            .unwrap_or(rest.len());
        let mut parts = rest[..end].splitn(3, ':');
        let mode = parts.next()?.parse().ok()?;
        let version = parts.next()?.to_string();
        let unique_id = parts.next()?.to_string();
        Some(TriggerLine {
            mode,
            version,
            unique_id,
        })
    }
}

/// In a tmux normal-mode pane the trigger needs a long unguessable id so
/// the watching terminal can tell a fresh trigger from the pane's redraw
/// of an old one. Outside tmux a constant is enough.
fn unique_id(tmux: &TmuxEnv) -> String {
    match tmux.mode {
        TmuxMode::Normal => {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
                % 10_000_000_000;
            format!("{}", millis * 100).chars().rev().collect()
        }
        _ if cfg!(windows) => "1".to_string(),
        _ => "0".to_string(),
    }
}

// ----------------------------------------------------------------------
// Environment discovery
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TmuxMode {
    #[default]
    None,
    /// Regular pane: output passes through tmux and picks up junk.
    Normal,
    /// Control mode (`tmux -CC`): output wrapped in DCS sequences.
    Control,
}

#[derive(Debug, Clone, Default)]
pub struct TmuxEnv {
    pub mode: TmuxMode,
    pub pane_width: u16,
}

impl TmuxEnv {
    pub fn output_junk(&self) -> bool {
        self.mode != TmuxMode::None
    }
}

/// Ask tmux about the current client through its own CLI. Absent `$TMUX`,
/// or a failing query, means no tmux.
pub fn check_tmux() -> TmuxEnv {
    if std::env::var_os("TMUX").is_none() {
        return TmuxEnv::default();
    }
    let output = Command::new("tmux")
        .args([
            "display-message",
            "-p",
            "#{client_tty}:#{client_control_mode}:#{pane_width}",
        ])
        .output();
    let Ok(output) = output else {
        return TmuxEnv::default();
    };
    let text = String::from_utf8_lossy(&output.stdout);
    let mut parts = text.trim().splitn(3, ':');
    let (Some(tty), Some(control), Some(width)) = (parts.next(), parts.next(), parts.next())
    else {
        return TmuxEnv::default();
    };
    let mode = if control == "1" || !tty.starts_with("/dev/") {
        TmuxMode::Control
    } else {
        TmuxMode::Normal
    };
    TmuxEnv {
        mode,
        pane_width: width.parse().unwrap_or(0),
    }
}

/// Terminal width for progress rendering: the tmux pane when inside one,
/// otherwise what stty reports, with a usable fallback.
pub fn terminal_columns(tmux: &TmuxEnv) -> u16 {
    if tmux.pane_width > 0 {
        return tmux.pane_width;
    }
    let output = Command::new("stty").arg("size").output();
    if let Ok(output) = output {
        let text = String::from_utf8_lossy(&output.stdout);
        if let Some(cols) = text.split_whitespace().nth(1) {
            if let Ok(cols) = cols.parse() {
                return cols;
            }
        }
    }
    80
}

// ----------------------------------------------------------------------
// Raw mode
// ----------------------------------------------------------------------

/// Puts stdin into raw mode for the conversation and restores the saved
/// settings on drop, error paths included.
#[cfg(unix)]
pub struct RawModeGuard {
    saved: libc::termios,
}

#[cfg(unix)]
impl RawModeGuard {
    pub fn new() -> Result<Self> {
        // Safety: termios is plain data; tcgetattr fully initializes it on
        // success.
        unsafe {
            let mut saved: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut saved) != 0 {
                return Err(TrzszError::Io(std::io::Error::last_os_error()));
            }
            let mut raw = saved;
            libc::cfmakeraw(&mut raw);
            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSADRAIN, &raw) != 0 {
                return Err(TrzszError::Io(std::io::Error::last_os_error()));
            }
            Ok(RawModeGuard { saved })
        }
    }
}

#[cfg(unix)]
impl Drop for RawModeGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSADRAIN, &self.saved);
        }
    }
}

/// Restore the screen after a conversation: jump back to the cursor the
/// trigger line saved, clear the protocol leftovers below it, print the
/// final status, and re-show the cursor. When the conversation went
/// through a tmux pane the restore itself can leave a stale status line,
/// so the client is asked to redraw.
pub fn server_exit(message: &str, tmux_output_junk: bool) {
    let mut stdout = std::io::stdout();
    let _ = write!(stdout, "\x1b8\x1b[0J{message}\r\n\x1b[?25h");
    let _ = stdout.flush();
    if tmux_output_junk {
        tmux_refresh_client();
    }
}

/// Ask the attached tmux client to repaint. Failures are ignored; outside
/// tmux there is simply nothing to refresh.
pub fn tmux_refresh_client() {
    let _ = Command::new("tmux").arg("refresh-client").output();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_roundtrip() {
        let tmux = TmuxEnv::default();
        for mode in [TriggerMode::Send, TriggerMode::Recv, TriggerMode::RecvDir] {
            let trigger = TriggerLine::new(mode, &tmux);
            let rendered = trigger.render();
            assert!(rendered.starts_with("\x07\x1b7::TRZSZ:TRANSFER:"));
            assert!(rendered.ends_with("\r\n"));
            let parsed = TriggerLine::parse(&rendered).unwrap();
            assert_eq!(parsed, trigger);
        }
    }

    #[test]
    fn test_trigger_parse_amid_output() {
        let parsed =
            TriggerLine::parse("prompt$ tsz file\r\n\x07\x1b7::TRZSZ:TRANSFER:S:1.0.0:0\r\n")
                .unwrap();
        assert_eq!(parsed.mode, TriggerMode::Send);
        assert_eq!(parsed.version, "1.0.0");
        assert_eq!(parsed.unique_id, "0");
    }

    #[test]
    fn test_trigger_parse_rejects_garbage() {
        assert!(TriggerLine::parse("no trigger here").is_none());
        assert!(TriggerLine::parse("::TRZSZ:TRANSFER:X:1.0.0:0\n").is_none());
    }

    #[test]
    fn test_unique_id_in_tmux_pane_is_long() {
        let tmux = TmuxEnv {
            mode: TmuxMode::Normal,
            pane_width: 80,
        };
        let id = unique_id(&tmux);
        assert!(id.len() > 8);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_tmux_refresh_is_harmless_outside_tmux() {
        // Either tmux is absent or refresh-client fails without a session;
        // both outcomes must be swallowed.
        tmux_refresh_client();
    }

    #[test]
    fn test_mode_letters() {
        assert_eq!(TriggerMode::Send.to_string(), "S");
        assert_eq!("D".parse::<TriggerMode>().unwrap(), TriggerMode::RecvDir);
        assert!("Q".parse::<TriggerMode>().is_err());
    }
}
