//! # Error Types
//!
//! Error handling for the framing and transport-security core.
//!
//! Two failure tiers exist by design:
//! - Buffer-level truncation/overrun is *not* an `Err` — the accessors return
//!   zero values, raise the buffer's overrun flag and log the call site, so a
//!   malformed client packet degrades to "ignored" instead of unwinding the
//!   connection handler.
//! - Engine-level validation (framing, checksum, sequence) returns
//!   [`ProtocolError`]; whether a rejected message also costs the client its
//!   connection is the caller's decision.

use std::io;
use thiserror::Error;

/// Primary error type for protocol operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("declared length {declared} does not match actual length {actual}")]
    FramingMismatch { declared: usize, actual: usize },

    #[error("checksum mismatch: header {header:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { header: u32, computed: u32 },

    #[error("sequence violation: expected {expected}, received {received}")]
    SequenceViolation { expected: u32, received: u32 },

    #[error("encrypted region of {0} bytes is not a multiple of the cipher block size")]
    Misaligned(usize),

    #[error("message of {0} bytes exceeds the maximum frame size")]
    OversizedPacket(usize),

    #[error("connection expired")]
    ConnectionExpired,

    #[error("compression failed")]
    CompressionFailure,

    #[error("decompression failed")]
    DecompressionFailure,

    #[error("key exchange failed: {0}")]
    KeyExchangeError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
