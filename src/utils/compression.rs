//! Per-connection streaming compression.
//!
//! Compression here is a *connection-level* transform, not a per-message
//! one: the deflate context (and its sliding dictionary) lives for the whole
//! connection and carries state from message to message, so repeated game
//! payloads compress far better than they would in isolation. Each message
//! ends with a sync flush, which makes the output decodable at message
//! granularity without resetting the dictionary.
//!
//! Raw deflate (no zlib wrapper) — the frame header already carries size and
//! checksum, so the wrapper would be dead weight.

use crate::error::{ProtocolError, Result};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Default output ceiling for one decompressed message.
pub const MAX_DECOMPRESSED_SIZE: usize = crate::core::message::MAX_MESSAGE_SIZE;

/// Streaming compressor owned by one connection's send path.
pub struct StreamCompressor {
    ctx: Compress,
    scratch: Vec<u8>,
}

impl StreamCompressor {
    /// `level` is the deflate level, 1 (fastest) to 9 (smallest).
    pub fn new(level: u32) -> Self {
        Self {
            ctx: Compress::new(Compression::new(level), false),
            scratch: Vec::with_capacity(4096),
        }
    }

    /// Compress one message, ending with a sync flush. The returned slice
    /// borrows this context's scratch buffer and is only valid until the
    /// next call; the dictionary carries over to the next message.
    pub fn compress(&mut self, input: &[u8]) -> Result<&[u8]> {
        self.scratch.clear();
        self.scratch.reserve(input.len() / 2 + 64);
        let mut consumed = 0usize;
        loop {
            if self.scratch.len() == self.scratch.capacity() {
                self.scratch.reserve(1024);
            }
            let before = self.ctx.total_in();
            let status = self
                .ctx
                .compress_vec(&input[consumed..], &mut self.scratch, FlushCompress::Sync)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            consumed += (self.ctx.total_in() - before) as usize;
            match status {
                Status::Ok | Status::BufError => {
                    // The flush is complete once all input is consumed and
                    // deflate stopped short of the available output space.
                    if consumed == input.len() && self.scratch.len() < self.scratch.capacity() {
                        break;
                    }
                }
                Status::StreamEnd => break,
            }
        }
        Ok(&self.scratch)
    }
}

impl std::fmt::Debug for StreamCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCompressor")
            .field("total_in", &self.ctx.total_in())
            .field("total_out", &self.ctx.total_out())
            .finish()
    }
}

/// Streaming decompressor, the receive-side mirror of [`StreamCompressor`].
/// The server itself only compresses outbound traffic; this lives here for
/// clients and tests.
pub struct StreamDecompressor {
    ctx: Decompress,
    scratch: Vec<u8>,
    limit: usize,
}

impl Default for StreamDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecompressor {
    pub fn new() -> Self {
        Self::with_limit(MAX_DECOMPRESSED_SIZE)
    }

    /// A decompressor that refuses to inflate one message beyond `limit`
    /// bytes (decompression-bomb guard).
    pub fn with_limit(limit: usize) -> Self {
        Self {
            ctx: Decompress::new(false),
            scratch: Vec::with_capacity(4096),
            limit,
        }
    }

    /// Decompress one sync-flushed message. The returned slice borrows this
    /// context's scratch buffer and is only valid until the next call.
    pub fn decompress(&mut self, input: &[u8]) -> Result<&[u8]> {
        self.scratch.clear();
        let mut consumed = 0usize;
        loop {
            if self.scratch.len() == self.scratch.capacity() {
                if self.scratch.capacity() >= self.limit {
                    return Err(ProtocolError::DecompressionFailure);
                }
                self.scratch.reserve(1024);
            }
            let before = self.ctx.total_in();
            let status = self
                .ctx
                .decompress_vec(&input[consumed..], &mut self.scratch, FlushDecompress::Sync)
                .map_err(|_| ProtocolError::DecompressionFailure)?;
            consumed += (self.ctx.total_in() - before) as usize;
            match status {
                Status::Ok | Status::BufError => {
                    if consumed == input.len() && self.scratch.len() < self.scratch.capacity() {
                        break;
                    }
                    if matches!(status, Status::BufError) && consumed == input.len() {
                        break;
                    }
                }
                Status::StreamEnd => break,
            }
        }
        if self.scratch.len() > self.limit {
            return Err(ProtocolError::DecompressionFailure);
        }
        Ok(&self.scratch)
    }
}
