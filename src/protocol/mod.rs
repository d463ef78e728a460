//! Wire protocol: frame codec, junk filter, handshake, and the
//! conversation that ties them together.
//!
//! Frame summary (one typed message per line):
//!
//! ```text
//! ACT   initiator -> responder   capability declaration (json)
//! CFG   responder -> initiator   effective negotiated config (json)
//! NUM   sender -> receiver       entry count
//! NAME  sender -> receiver       entry identity (string or json record)
//! SIZE  sender -> receiver       file byte length
//! DATA  sender -> receiver       file content chunk
//! MD5   sender -> receiver       integrity digest
//! SUCC  receiver -> sender       per-step acknowledgment (echo)
//! FAIL / fail                    fatal error (traced / untraced)
//! EXIT                           graceful conversation end
//! ```

pub mod conversation;
pub mod filter;
pub mod frame;
pub mod negotiate;

pub use conversation::Conversation;
pub use frame::{decode_buffer, encode_buffer, Dialect, FrameRead, FrameReader, FrameWriter};
pub use negotiate::{Action, ConfigMessage, TransferConfig, PROTOCOL_VERSION};
