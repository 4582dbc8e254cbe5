//! Bounds-checked network message buffer.
//!
//! `NetworkMessage` is the single buffer type used for both directions:
//! incoming frames are staged into one and decoded field by field; outgoing
//! messages are built into one (via [`super::output::OutputMessage`]) before
//! framing. All multi-byte fields are little-endian.
//!
//! Accessors never panic and never throw: a read past the end yields a zero
//! value and raises the `overrun` flag, a write past capacity writes nothing
//! and logs the call site. The protocol engine must keep running after a
//! truncated or malicious client packet.

use std::panic::Location;
use tracing::error;

/// Total buffer capacity, sized for the largest game frame plus headers.
pub const MAX_MESSAGE_SIZE: usize = 24590;

/// Bytes of the size field.
pub const SIZE_LENGTH: usize = 2;

/// Bytes of the checksum field.
pub const CHECKSUM_LENGTH: usize = 4;

/// Bytes of the padding-amount field.
pub const PADDING_LENGTH: usize = 1;

/// Reserved header region at the front of every buffer: size + checksum +
/// padding amount. Payload bytes start here.
pub const HEADER_RESERVE: usize = SIZE_LENGTH + CHECKSUM_LENGTH + PADDING_LENGTH;

/// Block size of the session cipher; encrypted regions are padded to a
/// multiple of this.
pub const CIPHER_BLOCK_SIZE: usize = 8;

/// Maximum payload bytes a single message may carry.
pub const MAX_BODY_LENGTH: usize = MAX_MESSAGE_SIZE - HEADER_RESERVE - CIPHER_BLOCK_SIZE;

/// Flush threshold for batched output buffers; leaves slack for the final
/// padding and compression overhead on an incompressible body.
pub const MAX_PROTOCOL_BODY_LENGTH: usize = MAX_BODY_LENGTH - 10;

mod sealed {
    pub trait Sealed {}
}

/// Fixed-width integer types that may cross the wire through the generic
/// [`NetworkMessage::get`]/[`NetworkMessage::add`] accessors.
///
/// `f64` deliberately has no implementation: raw IEEE754 is not part of the
/// wire contract. Use [`NetworkMessage::add_double`]/
/// [`NetworkMessage::get_double`], the fixed-point codec, instead.
pub trait WireValue: sealed::Sealed + Copy {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// The value returned for a truncated read.
    fn zeroed() -> Self;

    /// Decode from little-endian bytes; `src` holds at least `SIZE` bytes.
    fn read_le(src: &[u8]) -> Self;

    /// Encode as little-endian bytes into `dst` (at least `SIZE` bytes).
    fn write_le(self, dst: &mut [u8]);
}

macro_rules! impl_wire_value {
    ($($t:ty),* $(,)?) => {$(
        impl sealed::Sealed for $t {}

        impl WireValue for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn zeroed() -> Self {
                0
            }

            fn read_le(src: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&src[..std::mem::size_of::<$t>()]);
                <$t>::from_le_bytes(raw)
            }

            fn write_le(self, dst: &mut [u8]) {
                dst[..std::mem::size_of::<$t>()].copy_from_slice(&self.to_le_bytes());
            }
        }
    )*};
}

impl_wire_value!(u8, i8, u16, i16, u32, i32, u64, i64);

/// A 3D world coordinate: two 16-bit axes and an 8-bit floor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub x: u16,
    pub y: u16,
    pub z: u8,
}

impl Position {
    pub fn new(x: u16, y: u16, z: u8) -> Self {
        Self { x, y, z }
    }
}

/// Fixed-capacity message buffer with a read/write cursor.
///
/// `length` counts valid payload bytes (plus any prepended headers for
/// outgoing messages); `position` is the next read/write offset and starts
/// past the reserved header region. Once `overrun` is raised, every
/// subsequent non-reset accessor short-circuits and re-asserts it.
pub struct NetworkMessage {
    length: usize,
    position: usize,
    overrun: bool,
    buffer: Box<[u8; MAX_MESSAGE_SIZE]>,
}

impl Default for NetworkMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkMessage {
    pub fn new() -> Self {
        Self {
            length: 0,
            position: HEADER_RESERVE,
            overrun: false,
            buffer: Box::new([0u8; MAX_MESSAGE_SIZE]),
        }
    }

    /// Stage a received frame for decoding. The frame is copied to offset 0;
    /// `length` covers the whole frame and the cursor is left at 0 so
    /// [`Self::decode_header`] can run. Oversized frames are rejected.
    pub fn from_wire(frame: &[u8]) -> crate::error::Result<Self> {
        if frame.len() > MAX_MESSAGE_SIZE {
            return Err(crate::error::ProtocolError::OversizedPacket(frame.len()));
        }
        let mut msg = Self::new();
        msg.buffer[..frame.len()].copy_from_slice(frame);
        msg.length = frame.len();
        msg.position = 0;
        Ok(msg)
    }

    /// Reset cursors and flags for reuse. The backing storage is kept.
    pub fn reset(&mut self) {
        self.length = 0;
        self.position = HEADER_RESERVE;
        self.overrun = false;
    }

    /// Decode the fixed frame header of a freshly received buffer and return
    /// the declared size field (in cipher blocks). Leaves the cursor at the
    /// start of the payload region; the checksum and padding fields stay
    /// reachable through [`Self::header_checksum`] and
    /// [`Self::padding_amount`].
    pub fn decode_header(&mut self) -> u16 {
        self.position = 0;
        let size = self.get::<u16>();
        self.position = HEADER_RESERVE;
        size
    }

    /// Checksum field of the frame header.
    pub fn header_checksum(&self) -> u32 {
        u32::read_le(&self.buffer[SIZE_LENGTH..SIZE_LENGTH + CHECKSUM_LENGTH])
    }

    /// Padding-amount field of the frame header. Only meaningful after the
    /// cipher region has been decrypted.
    pub fn padding_amount(&self) -> u8 {
        self.buffer[SIZE_LENGTH + CHECKSUM_LENGTH]
    }

    /// Size field of the frame header (unread cursor-free variant).
    pub fn length_header(&self) -> u16 {
        u16::read_le(&self.buffer[..SIZE_LENGTH])
    }

    /// Remaining-bytes predicate for reads. Pure; does not touch the overrun
    /// flag.
    pub fn can_read(&self, size: usize) -> bool {
        !self.overrun && self.position + size <= self.length
    }

    /// Remaining-capacity predicate for writes. The cipher block size is
    /// held back at the tail so padding always fits.
    pub fn can_add(&self, size: usize) -> bool {
        !self.overrun && self.position + size <= MAX_MESSAGE_SIZE - CIPHER_BLOCK_SIZE
    }

    /// Read a fixed-width integer, advancing the cursor. A truncated read
    /// returns zero and raises the overrun flag; callers that care must
    /// check [`Self::can_read`] or [`Self::is_overrun`].
    pub fn get<T: WireValue>(&mut self) -> T {
        if !self.can_read(T::SIZE) {
            self.overrun = true;
            return T::zeroed();
        }
        let value = T::read_le(&self.buffer[self.position..]);
        self.position += T::SIZE;
        value
    }

    /// Read a single byte, logging the call site on truncation.
    #[track_caller]
    pub fn get_byte(&mut self) -> u8 {
        if !self.can_read(1) {
            let caller = Location::caller();
            error!(
                position = self.position,
                length = self.length,
                "cannot read byte past end of message, called from {caller}"
            );
            self.overrun = true;
            return 0;
        }
        self.get::<u8>()
    }

    /// The byte immediately before the cursor.
    pub fn get_previous_byte(&mut self) -> u8 {
        if self.position == 0 {
            self.overrun = true;
            return 0;
        }
        self.position -= 1;
        let value = self.buffer[self.position];
        self.position += 1;
        value
    }

    /// Read a string. A `len` of zero means a 2-byte length prefix comes
    /// first. Returns an empty string (and raises overrun) when the declared
    /// bytes are not available.
    #[track_caller]
    pub fn get_string(&mut self, len: u16) -> String {
        let len = if len == 0 { self.get::<u16>() } else { len } as usize;
        if !self.can_read(len) {
            let caller = Location::caller();
            error!(
                wanted = len,
                position = self.position,
                length = self.length,
                "string extends past end of message, called from {caller}"
            );
            self.overrun = true;
            return String::new();
        }
        let raw = &self.buffer[self.position..self.position + len];
        self.position += len;
        String::from_utf8_lossy(raw).into_owned()
    }

    /// Read a world coordinate: x (u16), y (u16), z (u8), in that order.
    pub fn get_position(&mut self) -> Position {
        Position {
            x: self.get::<u16>(),
            y: self.get::<u16>(),
            z: self.get::<u8>(),
        }
    }

    /// Read a fixed-point double: u8 decimal precision, then the scaled
    /// signed integer.
    pub fn get_double(&mut self) -> f64 {
        let precision = self.get::<u8>();
        let scaled = self.get::<i32>();
        f64::from(scaled) / 10f64.powi(i32::from(precision))
    }

    /// Advance (or with a negative count, rewind) the cursor without reading.
    /// Used for fields the caller intentionally ignores.
    pub fn skip_bytes(&mut self, count: i16) {
        if count >= 0 {
            if !self.can_read(count as usize) {
                self.overrun = true;
                return;
            }
            self.position += count as usize;
        } else {
            let back = (-count) as usize;
            if back > self.position {
                self.overrun = true;
                return;
            }
            self.position -= back;
        }
    }

    /// Write a fixed-width integer at the cursor. A write past capacity
    /// writes nothing; it is logged with the call site and raises the
    /// overrun flag.
    #[track_caller]
    pub fn add<T: WireValue>(&mut self, value: T) {
        if !self.can_add(T::SIZE) {
            let caller = Location::caller();
            error!(
                size = T::SIZE,
                position = self.position,
                "cannot add value: buffer capacity exceeded, called from {caller}"
            );
            self.overrun = true;
            return;
        }
        value.write_le(&mut self.buffer[self.position..]);
        self.position += T::SIZE;
        self.length += T::SIZE;
    }

    #[track_caller]
    pub fn add_byte(&mut self, value: u8) {
        self.add::<u8>(value);
    }

    /// Write raw bytes at the cursor.
    #[track_caller]
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        if !self.can_add(bytes.len()) {
            let caller = Location::caller();
            error!(
                size = bytes.len(),
                position = self.position,
                "cannot add bytes: buffer capacity exceeded, called from {caller}"
            );
            self.overrun = true;
            return;
        }
        self.buffer[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
        self.length += bytes.len();
    }

    /// Zero-fill `n` bytes at the cursor.
    #[track_caller]
    pub fn add_padding_bytes(&mut self, n: usize) {
        if !self.can_add(n) {
            let caller = Location::caller();
            error!(
                size = n,
                position = self.position,
                "cannot add padding: buffer capacity exceeded, called from {caller}"
            );
            self.overrun = true;
            return;
        }
        self.buffer[self.position..self.position + n].fill(0);
        self.position += n;
        self.length += n;
    }

    /// Write a string with a 2-byte length prefix. Strings beyond the 16-bit
    /// length domain are refused: only a zero-length marker is written.
    #[track_caller]
    pub fn add_string(&mut self, value: &str) {
        let len = value.len();
        if len > u16::MAX as usize {
            let caller = Location::caller();
            error!(
                size = len,
                "string exceeds 16-bit length domain, called from {caller}"
            );
            self.add::<u16>(0);
            return;
        }
        if !self.can_add(SIZE_LENGTH + len) {
            let caller = Location::caller();
            error!(
                size = len,
                position = self.position,
                "cannot add string: buffer capacity exceeded, called from {caller}"
            );
            self.overrun = true;
            return;
        }
        self.add::<u16>(len as u16);
        self.add_bytes(value.as_bytes());
    }

    /// Write a fixed-point double as `round(value * 10^precision)` behind a
    /// 1-byte precision field.
    pub fn add_double(&mut self, value: f64, precision: u8) {
        self.add::<u8>(precision);
        self.add::<i32>((value * 10f64.powi(i32::from(precision))).round() as i32);
    }

    /// Write a world coordinate in wire order.
    pub fn add_position(&mut self, pos: Position) {
        self.add::<u16>(pos.x);
        self.add::<u16>(pos.y);
        self.add::<u8>(pos.z);
    }

    /// Copy another message's payload region (header region excluded) to the
    /// cursor, advancing both `length` and `position`. Used to concatenate
    /// pre-built sub-messages into one outgoing frame.
    #[track_caller]
    pub fn append(&mut self, other: &NetworkMessage) {
        let len = other.length;
        if !self.can_add(len) {
            let caller = Location::caller();
            error!(
                size = len,
                position = self.position,
                "cannot append message: buffer capacity exceeded, called from {caller}"
            );
            self.overrun = true;
            return;
        }
        let (dst, src) = (self.position, HEADER_RESERVE);
        self.buffer[dst..dst + len].copy_from_slice(&other.buffer[src..src + len]);
        self.position += len;
        self.length += len;
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn set_length(&mut self, length: usize) {
        self.length = length;
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    pub fn is_overrun(&self) -> bool {
        self.overrun
    }

    pub fn buffer(&self) -> &[u8; MAX_MESSAGE_SIZE] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8; MAX_MESSAGE_SIZE] {
        &mut self.buffer
    }

    /// Payload bytes written so far (outgoing messages only).
    pub fn body(&self) -> &[u8] {
        &self.buffer[HEADER_RESERVE..HEADER_RESERVE + self.length]
    }
}

impl std::fmt::Debug for NetworkMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMessage")
            .field("length", &self.length)
            .field("position", &self.position)
            .field("overrun", &self.overrun)
            .finish_non_exhaustive()
    }
}
