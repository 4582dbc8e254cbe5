//! # Utility Modules
//!
//! Supporting utilities for compression, logging and observability.
//!
//! ## Components
//! - **Compression**: per-connection streaming deflate contexts
//! - **Logging**: structured logging configuration (tracing-subscriber)
//! - **Metrics**: thread-safe counters for protocol health

pub mod compression;
pub mod logging;
pub mod metrics;

pub use compression::{StreamCompressor, StreamDecompressor};
