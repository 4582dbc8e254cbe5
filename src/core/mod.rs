//! # Core Buffer Components
//!
//! The mutable byte-buffer abstraction shared by both protocol directions.
//!
//! ## Components
//! - **NetworkMessage**: fixed-capacity buffer with a cursor and
//!   bounds-checked typed reads/writes
//! - **OutputMessage**: NetworkMessage plus backward-growing header
//!   construction for outgoing frames
//!
//! ## Wire Format
//! ```text
//! [Size(2)] [Checksum(4)] [Pad(1)] [Payload(N)] [Zeros(Pad)]
//! ```
//!
//! Every buffer reserves the first [`message::HEADER_RESERVE`] bytes for the
//! header stack; payload bytes always start at that offset. Headers are
//! written *after* the payload is known, backwards from the reserved region,
//! so checksum and length never require shifting the body.

pub mod message;
pub mod output;
