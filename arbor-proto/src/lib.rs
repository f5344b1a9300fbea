//! Wire protocol for the arbor spanning-tree IRC server.
//!
//! This crate knows how to frame and unframe tagged IRC lines
//! (`@tags :source CMD params :trailing`), how to build outgoing
//! command lines, and what server IDs (SIDs) and user IDs (UUIDs)
//! look like. It has no opinion about what any command means —
//! that lives in `arbor-server`.

pub mod builder;
pub mod id;
pub mod message;

pub use builder::CmdBuilder;
pub use id::{Sid, Uid, UidGenerator};
pub use message::{Message, MessageError};

/// Highest server-to-server protocol version we speak.
pub const PROTO_VERSION: u16 = 1207;

/// Oldest protocol version we will still link with.
pub const MIN_PROTO_VERSION: u16 = 1202;

/// Maximum length of a line on the wire, excluding the tag block
/// and the trailing CR/LF.
pub const MAX_LINE_LENGTH: usize = 512;

/// Separate budget for the serialized tag block, including the `@`.
pub const MAX_TAG_LENGTH: usize = 512;

/// Returns true if `name` is an acceptable server name: DNS-like,
/// at most 64 characters, and containing at least one dot.
pub fn valid_server_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 || !name.contains('.') {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_')
}
