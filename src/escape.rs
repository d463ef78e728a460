//! Binary escape table for raw DATA payloads.
//!
//! Raw binary chunks travel on a terminal stream, so bytes the terminal (or
//! tmux) would interpret are replaced by two-byte substitutes before writing
//! and restored on read. Base64 payloads are already terminal-safe and are
//! never escaped.
//!
//! Every substitute starts with the marker byte `0xEE` and the marker itself
//! is escaped first, so no substitute is a prefix of another literal and a
//! left-to-right single pass is unambiguous in both directions.

use crate::error::{Result, TrzszError};

const MARK: u8 = 0xEE;

/// Ordered list of (literal byte, two-byte substitute) pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscapeTable {
    pairs: Vec<(u8, [u8; 2])>,
}

impl EscapeTable {
    /// The table negotiated for binary mode. `escape_all` additionally
    /// escapes control bytes known to confuse terminals in transit.
    pub fn new(escape_all: bool) -> Self {
        let mut pairs = vec![(MARK, [MARK, MARK]), (0x7E, [MARK, 0x31])];
        if escape_all {
            for (i, b) in [0x02u8, 0x10, 0x1B, 0x1D, 0x9D].iter().enumerate() {
                pairs.push((*b, [MARK, 0x41 + i as u8]));
            }
        }
        EscapeTable { pairs }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Substitute literal bytes left to right in a single pass.
    pub fn escape(&self, data: &[u8]) -> Vec<u8> {
        if self.pairs.is_empty() {
            return data.to_vec();
        }
        let mut out = Vec::with_capacity(data.len() + data.len() / 8);
        for &b in data {
            match self.pairs.iter().find(|(lit, _)| *lit == b) {
                Some((_, sub)) => out.extend_from_slice(sub),
                None => out.push(b),
            }
        }
        out
    }

    /// Reverse of [`escape`](Self::escape). A marker byte that does not
    /// begin a known substitute passes through unchanged.
    pub fn unescape(&self, data: &[u8]) -> Vec<u8> {
        if self.pairs.is_empty() {
            return data.to_vec();
        }
        let mut out = Vec::with_capacity(data.len());
        let mut i = 0;
        while i < data.len() {
            if data[i] == MARK && i + 1 < data.len() {
                let pair = [data[i], data[i + 1]];
                if let Some((lit, _)) = self.pairs.iter().find(|(_, sub)| *sub == pair) {
                    out.push(*lit);
                    i += 2;
                    continue;
                }
            }
            out.push(data[i]);
            i += 1;
        }
        out
    }

    /// Wire form carried inside the CFG payload: a JSON array of
    /// [literal, substitute] string pairs, one latin-1 char per byte.
    pub fn to_wire(&self) -> Vec<[String; 2]> {
        self.pairs
            .iter()
            .map(|(lit, sub)| {
                [
                    char::from(*lit).to_string(),
                    sub.iter().map(|b| char::from(*b)).collect(),
                ]
            })
            .collect()
    }

    pub fn from_wire(wire: &[[String; 2]]) -> Result<Self> {
        let mut pairs = Vec::with_capacity(wire.len());
        for [lit, sub] in wire {
            let lit = latin1_bytes(lit)?;
            let sub = latin1_bytes(sub)?;
            if lit.len() != 1 || sub.len() != 2 {
                return Err(TrzszError::protocol(format!(
                    "invalid escape pair lengths: {} -> {}",
                    lit.len(),
                    sub.len()
                )));
            }
            pairs.push((lit[0], [sub[0], sub[1]]));
        }
        Ok(EscapeTable { pairs })
    }
}

fn latin1_bytes(s: &str) -> Result<Vec<u8>> {
    s.chars()
        .map(|c| {
            let cp = c as u32;
            if cp <= 0xFF {
                Ok(cp as u8)
            } else {
                Err(TrzszError::protocol(format!(
                    "escape char out of latin-1 range: U+{cp:04X}"
                )))
            }
        })
        .collect()
}
