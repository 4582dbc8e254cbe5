//! Checksum policing for received and sent frames.
//!
//! Three per-connection modes: none, a rolling adler-32 sum over the
//! plaintext region (detects corruption), and a strict monotonic sequence
//! counter embedded in the checksum field (detects stale, replayed and
//! out-of-order frames). The mode is negotiated when the protocol variant is
//! selected and is treated as fixed for the lifetime of the connection.

use serde::{Deserialize, Serialize};

/// Per-connection checksum policy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChecksumMode {
    /// No policing; the header field is sent as zero and ignored on receive.
    #[default]
    None,
    /// Adler-32 over the padded plaintext region.
    RollingSum,
    /// Strictly incrementing counter, one per direction.
    Sequence,
}

const MOD_ADLER: u32 = 65521;

// Largest n with 255n(n+1)/2 + (n+1)(MOD_ADLER-1) < 2^32, so the inner sums
// only need reducing once per chunk.
const NMAX: usize = 5552;

/// Rolling checksum (adler-32) over `data`.
pub fn adler32(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(NMAX) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }
    (b << 16) | a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adler32_empty() {
        assert_eq!(adler32(&[]), 1);
    }

    #[test]
    fn test_adler32_known_value() {
        assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
    }

    #[test]
    fn test_adler32_long_input_reduction() {
        // Longer than one NMAX chunk; exercises the modular reduction.
        let data = vec![0xFFu8; NMAX * 2 + 17];
        let slow = {
            let mut a: u64 = 1;
            let mut b: u64 = 0;
            for &byte in &data {
                a = (a + u64::from(byte)) % u64::from(MOD_ADLER);
                b = (b + a) % u64::from(MOD_ADLER);
            }
            ((b as u32) << 16) | a as u32
        };
        assert_eq!(adler32(&data), slow);
    }

    #[test]
    fn test_adler32_bit_flip_detected() {
        let data = b"the quick brown fox jumps over the lazy dog".to_vec();
        let reference = adler32(&data);
        for i in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data.clone();
                flipped[i] ^= 1 << bit;
                assert_ne!(adler32(&flipped), reference, "byte {i} bit {bit}");
            }
        }
    }

    #[test]
    fn test_mode_serde_names() {
        assert_eq!(
            toml::to_string(&std::collections::BTreeMap::from([(
                "mode",
                ChecksumMode::RollingSum
            )]))
            .unwrap(),
            "mode = \"rolling-sum\"\n"
        );
    }
}
