//! # worldgate
//!
//! Message framing and transport security core for a persistent-world game
//! server: raw client bytes in, validated/decrypted/decoded packets out, and
//! the reverse path with padding, checksums, optional streaming compression
//! and block-cipher encryption — batching many logical messages into as few
//! socket writes as possible.
//!
//! ## Components
//! - **[`core::message::NetworkMessage`]**: bounds-checked byte buffer with
//!   typed little-endian encode/decode primitives
//! - **[`core::output::OutputMessage`]**: outgoing buffer with
//!   backward-growing header construction
//! - **[`scheduler::OutputMessagePool`]**: buffer recycling plus deferred,
//!   coalesced flushing of registered connections
//! - **[`protocol::Protocol`]**: per-connection state machine (XTEA session
//!   cipher, checksum policing, per-connection deflate stream)
//!
//! ## Wire Format
//! ```text
//! [Size(2)] [Checksum(4)] [Pad(1)] [Payload(N)] [Zeros(Pad)]
//! ```
//! All fields little-endian. The size field counts 8-byte cipher blocks; the
//! region from the pad byte onward is what the cipher transforms.
//!
//! ## Boundaries
//! Socket I/O and opcode dispatch live outside this crate: the engine talks
//! to a [`protocol::Connection`] for byte delivery and a
//! [`protocol::PacketHandler`] for payload interpretation.

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod utils;

pub use crate::config::ProtocolConfig;
pub use crate::core::message::{NetworkMessage, Position};
pub use crate::core::output::OutputMessage;
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::checksum::ChecksumMode;
pub use crate::protocol::{Connection, PacketHandler, Protocol};
pub use crate::scheduler::OutputMessagePool;
