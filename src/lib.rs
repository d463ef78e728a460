//! Inline terminal file transfer, compatible with tmux.
//!
//! Files move over the terminal stream the session already has: the
//! responder (`trz`/`tsz` on the remote side) prints a trigger line, the
//! initiator (the user's terminal) answers with a capability declaration,
//! the two negotiate an effective config, and the entries then flow in a
//! strict lockstep of typed, acknowledged frames. No extra connection, no
//! port, no subsystem.
//!
//! The crate splits along those lines: [`protocol`] owns the frame codec,
//! junk filtering and the handshake, [`transfer`] the sender/receiver state
//! machines, [`terminal`] the trigger line and tty plumbing, and the
//! binaries wire them to stdin/stdout.

pub mod args;
pub mod callback;
pub mod cancel;
pub mod error;
pub mod escape;
pub mod files;
pub mod progress;
pub mod protocol;
pub mod terminal;
pub mod transfer;

pub use error::{Result, TrzszError};
pub use protocol::{Action, Conversation, TransferConfig, PROTOCOL_VERSION};
