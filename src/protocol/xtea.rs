//! XTEA block cipher for session traffic.
//!
//! 64-bit blocks, 128-bit key, 32 rounds. The session key is recovered from
//! the RSA-encrypted first message; everything after that uses only this
//! fast symmetric transform. Words are read and written little-endian to
//! match the rest of the wire format.

/// Standard XTEA round constant.
const DELTA: u32 = 0x9E37_79B9;

const ROUNDS: u32 = 32;

/// A session cipher keyed with four 32-bit words.
#[derive(Clone, Copy)]
pub struct Xtea {
    key: [u32; 4],
}

impl Xtea {
    pub fn new(key: [u32; 4]) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &[u32; 4] {
        &self.key
    }

    /// Encrypt `data` in place. The length must be a multiple of 8; this is
    /// guaranteed by the padding step of the send path.
    pub fn encrypt(&self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % 8, 0);
        for block in data.chunks_exact_mut(8) {
            let (mut v0, mut v1) = read_block(block);
            let mut sum: u32 = 0;
            for _ in 0..ROUNDS {
                v0 = v0.wrapping_add(
                    (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                        ^ (sum.wrapping_add(self.key[(sum & 3) as usize])),
                );
                sum = sum.wrapping_add(DELTA);
                v1 = v1.wrapping_add(
                    (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                        ^ (sum.wrapping_add(self.key[((sum >> 11) & 3) as usize])),
                );
            }
            write_block(block, v0, v1);
        }
    }

    /// Decrypt `data` in place. The length must be a multiple of 8; the
    /// receive path rejects misaligned regions before calling this.
    pub fn decrypt(&self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % 8, 0);
        for block in data.chunks_exact_mut(8) {
            let (mut v0, mut v1) = read_block(block);
            let mut sum: u32 = DELTA.wrapping_mul(ROUNDS);
            for _ in 0..ROUNDS {
                v1 = v1.wrapping_sub(
                    (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                        ^ (sum.wrapping_add(self.key[((sum >> 11) & 3) as usize])),
                );
                sum = sum.wrapping_sub(DELTA);
                v0 = v0.wrapping_sub(
                    (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                        ^ (sum.wrapping_add(self.key[(sum & 3) as usize])),
                );
            }
            write_block(block, v0, v1);
        }
    }
}

fn read_block(block: &[u8]) -> (u32, u32) {
    let v0 = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
    let v1 = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
    (v0, v1)
}

fn write_block(block: &mut [u8], v0: u32, v1: u32) {
    block[..4].copy_from_slice(&v0.to_le_bytes());
    block[4..8].copy_from_slice(&v1.to_le_bytes());
}

impl std::fmt::Debug for Xtea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.write_str("Xtea { .. }")
    }
}
