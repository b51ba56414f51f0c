//! Protocol module - Defines the multicom wire protocol
//!
//! Every datagram starts with a one byte packet type. Session traffic then carries:
//! - 4 bytes session id
//! - 4 bytes nonce (big-endian when derived from a counter)
//! - Variable length ASCII payload
//!
//! Discovery probes are a single zero byte and discovery replies carry the
//! device identity right after the type byte.

mod codec;
mod discovery;
mod packet;

pub use codec::*;
pub use discovery::*;
pub use packet::*;

/// Default UDP port devices listen on
pub const DEFAULT_PORT: u16 = 5021;

/// Largest datagram the receive paths accept
pub const MAX_DATAGRAM_SIZE: usize = 2560;
