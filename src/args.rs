//! CLI options shared by the `trz` and `tsz` binaries.

use clap::Args;

use crate::error::{Result, TrzszError};
use crate::escape::EscapeTable;
use crate::protocol::negotiate::{timeout_from_secs, TransferConfig};
use crate::terminal::TmuxEnv;

const MIN_BUF_SIZE: u64 = 1024;
const MAX_BUF_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Args)]
pub struct TransferArgs {
    /// Quiet (hide progress bar)
    #[arg(short, long)]
    pub quiet: bool,

    /// Yes, overwrite existing file(s)
    #[arg(short = 'y', long)]
    pub overwrite: bool,

    /// Binary transfer mode, faster for binary files
    #[arg(short, long)]
    pub binary: bool,

    /// Escape all known control characters
    #[arg(short, long)]
    pub escape: bool,

    /// Transfer directories and files
    #[arg(short, long)]
    pub directory: bool,

    /// Max buffer chunk size (1K<=N<=1G)
    #[arg(short = 'B', long, default_value = "10M", value_name = "N", value_parser = parse_buf_size)]
    pub bufsize: u64,

    /// Timeout in seconds for each buffer chunk. N <= 0 means never timeout
    #[arg(short, long, default_value_t = 100, value_name = "N", allow_hyphen_values = true)]
    pub timeout: i64,
}

impl TransferArgs {
    /// The responder's local option set, before negotiation.
    pub fn to_config(&self, tmux: &TmuxEnv) -> TransferConfig {
        TransferConfig {
            quiet: self.quiet,
            binary: self.binary,
            directory: self.directory,
            overwrite: self.overwrite,
            timeout: timeout_from_secs(self.timeout),
            max_buf_size: self.bufsize,
            escape_table: if self.binary {
                EscapeTable::new(self.escape)
            } else {
                EscapeTable::default()
            },
            tmux_output_junk: tmux.output_junk(),
            tmux_pane_width: i32::from(tmux.pane_width),
            ..TransferConfig::default()
        }
    }
}

/// Parse a buffer size with an optional `b`/`k`/`m`/`g` suffix, bounded to
/// `[1K, 1G]`.
pub fn parse_buf_size(value: &str) -> Result<u64> {
    let value = value.trim();
    let invalid = || TrzszError::local(format!("Invalid size {value}"));
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(0) | None if value.is_empty() => return Err(invalid()),
        Some(idx) => (&value[..idx], &value[idx..]),
        None => (value, ""),
    };
    let number: u64 = digits.parse().map_err(|_| invalid())?;
    let factor = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        _ => return Err(invalid()),
    };
    let size = number
        .checked_mul(factor)
        .ok_or_else(|| TrzszError::local(format!("Size too large {value}")))?;
    if size < MIN_BUF_SIZE {
        return Err(TrzszError::local(format!("Less than 1K: {value}")));
    }
    if size > MAX_BUF_SIZE {
        return Err(TrzszError::local(format!("Greater than 1G: {value}")));
    }
    Ok(size)
}
