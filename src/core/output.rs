//! Outgoing message buffer with backward-growing header construction.
//!
//! The checksum and length of a frame are only known once the payload is
//! complete, so `OutputMessage` reserves the header region up front and
//! prepends headers backwards from it: `header_start` begins at
//! [`HEADER_RESERVE`](super::message::HEADER_RESERVE) and decreases with each
//! header. Headers closest to the wire are written last and end up
//! physically first — length (outermost), then checksum, then the payload
//! region. No bytes are ever shifted.

use super::message::{NetworkMessage, CIPHER_BLOCK_SIZE, HEADER_RESERVE, WireValue};
use tracing::error;

/// An outgoing frame under construction.
///
/// Owned exclusively by the code building one message; handed off by value
/// once complete (to the scheduler or the engine's send path), after which
/// the builder must not touch it.
pub struct OutputMessage {
    msg: NetworkMessage,
    header_start: usize,
    padded: bool,
}

impl Default for OutputMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputMessage {
    pub fn new() -> Self {
        Self {
            msg: NetworkMessage::new(),
            header_start: HEADER_RESERVE,
            padded: false,
        }
    }

    /// Restore initial cursors for pool reuse.
    pub fn reset(&mut self) {
        self.msg.reset();
        self.header_start = HEADER_RESERVE;
        self.padded = false;
    }

    /// Prepend a header value, moving `header_start` backwards.
    ///
    /// The header region is sized for the maximum header stack, so running
    /// out of space here is a programming error, not a runtime condition: it
    /// fails the debug assertion and drops the header with a loud log in
    /// release builds.
    fn add_header<T: WireValue>(&mut self, value: T) {
        debug_assert!(
            self.header_start >= T::SIZE,
            "header region exhausted: {} < {}",
            self.header_start,
            T::SIZE
        );
        if self.header_start < T::SIZE {
            error!(
                header_start = self.header_start,
                size = T::SIZE,
                "insufficient buffer space for header"
            );
            return;
        }
        self.header_start -= T::SIZE;
        let start = self.header_start;
        value.write_le(&mut self.msg.buffer_mut()[start..]);
        self.msg.set_length(self.msg.length() + T::SIZE);
    }

    /// Pad the payload to the cipher block size: appends zero bytes at the
    /// tail and prepends the 1-byte padding amount. Afterwards the total
    /// length is a multiple of 8. Idempotent; a second call has no effect.
    pub fn write_padding_amount(&mut self) {
        if self.padded {
            return;
        }
        let padding = (CIPHER_BLOCK_SIZE - (self.msg.length() % CIPHER_BLOCK_SIZE) - 1) as u8;
        self.msg.add_padding_bytes(padding as usize);
        self.add_header::<u8>(padding);
        self.padded = true;
    }

    /// Prepend the 2-byte size header: `(length - 4) / 8`, a cipher block
    /// count rather than a byte count.
    pub fn write_message_length(&mut self) {
        self.add_header::<u16>((self.msg.length().saturating_sub(4) / 8) as u16);
    }

    /// Prepend the crypto header stack. The checksum (when requested) is
    /// prepended first and the size header second, so on the wire the size
    /// comes first, then the checksum, then the payload region.
    pub fn add_crypto_header(&mut self, add_checksum: bool, checksum: u32) {
        if add_checksum {
            self.add_header::<u32>(checksum);
        }
        self.write_message_length();
    }

    /// The finished wire bytes: headers written so far plus the payload.
    pub fn output_buffer(&self) -> &[u8] {
        &self.msg.buffer()[self.header_start..self.header_start + self.msg.length()]
    }

    /// Mutable view of the wire bytes, for the in-place cipher pass.
    pub fn output_buffer_mut(&mut self) -> &mut [u8] {
        let start = self.header_start;
        let end = start + self.msg.length();
        &mut self.msg.buffer_mut()[start..end]
    }
}

impl std::ops::Deref for OutputMessage {
    type Target = NetworkMessage;

    fn deref(&self) -> &Self::Target {
        &self.msg
    }
}

impl std::ops::DerefMut for OutputMessage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.msg
    }
}

impl std::fmt::Debug for OutputMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputMessage")
            .field("length", &self.msg.length())
            .field("header_start", &self.header_start)
            .field("padded", &self.padded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_wire_order() {
        // 8-byte payload, checksum 0xAABBCCDD, expected block count 1:
        // [len_lo len_hi][C0 C1 C2 C3][payload].
        let mut out = OutputMessage::new();
        out.add_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]);
        out.add_crypto_header(true, 0xAABB_CCDD);

        let wire = out.output_buffer();
        assert_eq!(wire.len(), 14);
        assert_eq!(&wire[..2], &[0x01, 0x00]);
        assert_eq!(&wire[2..6], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(&wire[6..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_padding_reaches_block_multiple() {
        for body in 0..32usize {
            let mut out = OutputMessage::new();
            out.add_padding_bytes(body);
            out.write_padding_amount();
            assert_eq!(out.length() % CIPHER_BLOCK_SIZE, 0, "body {body}");
            let pad = out.output_buffer()[0];
            assert!(pad < 8);
            assert_eq!(out.length(), body + 1 + pad as usize);
        }
    }

    #[test]
    fn test_padding_is_idempotent() {
        let mut out = OutputMessage::new();
        out.add_bytes(&[9, 9, 9]);
        out.write_padding_amount();
        let len = out.length();
        out.write_padding_amount();
        assert_eq!(out.length(), len);
    }

    #[test]
    fn test_full_header_stack_fills_reserve() {
        let mut out = OutputMessage::new();
        out.add_bytes(&[0; 16]);
        out.write_padding_amount();
        out.add_crypto_header(true, 0x1234_5678);
        // 1 pad + 4 checksum + 2 size = the whole reserved region.
        assert_eq!(out.header_start, 0);
        assert_eq!(out.output_buffer().len(), out.length());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "header region exhausted")]
    fn test_header_overflow_fails_loudly() {
        let mut out = OutputMessage::new();
        out.add_crypto_header(true, 0);
        out.add_crypto_header(true, 0); // second stack cannot fit
    }

    #[test]
    fn test_append_preserves_header_start() {
        let mut sub = OutputMessage::new();
        sub.add_bytes(b"abc");

        let mut out = OutputMessage::new();
        out.add_bytes(b"xy");
        out.append(&sub);
        assert_eq!(out.length(), 5);
        assert_eq!(out.header_start, HEADER_RESERVE);
        assert_eq!(out.body(), b"xyabc");
    }

    #[test]
    fn test_reset_restores_cursors() {
        let mut out = OutputMessage::new();
        out.add_bytes(&[1, 2, 3]);
        out.write_padding_amount();
        out.add_crypto_header(true, 7);
        out.reset();
        assert_eq!(out.length(), 0);
        assert_eq!(out.header_start, HEADER_RESERVE);
        assert!(!out.padded);
    }
}
