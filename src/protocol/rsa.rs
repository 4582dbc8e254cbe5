//! Raw-RSA block decryption for the session-key handshake.
//!
//! The very first message of a connection carries a 128-byte block encrypted
//! with the server's public key; decrypting it recovers the symmetric
//! session key. This is textbook RSA on a fixed-size block (no OAEP/PKCS
//! padding — the client zero-pads and the first decrypted byte must be
//! zero), applied exactly once per connection. Everything after the
//! handshake uses the XTEA session cipher.

use crate::error::{ProtocolError, Result};
use num_bigint::BigUint;

/// Length of the encrypted key block, fixed by the 1024-bit key size.
pub const RSA_BLOCK_SIZE: usize = 128;

/// Server-side RSA private key material.
pub struct RsaDecryptor {
    n: BigUint,
    d: BigUint,
}

impl RsaDecryptor {
    /// Build a decryptor from decimal-encoded modulus and private exponent,
    /// the format they are carried in by the server config.
    pub fn from_decimal(n: &str, d: &str) -> Result<Self> {
        let parse = |name: &str, value: &str| {
            BigUint::parse_bytes(value.as_bytes(), 10).ok_or_else(|| {
                ProtocolError::KeyExchangeError(format!("invalid decimal value for {name}"))
            })
        };
        let n = parse("n", n)?;
        let d = parse("d", d)?;
        if n.bits() < 1000 || n.bits() > 1024 {
            return Err(ProtocolError::KeyExchangeError(format!(
                "modulus of {} bits does not match the 128-byte block size",
                n.bits()
            )));
        }
        Ok(Self { n, d })
    }

    pub fn new(n: BigUint, d: BigUint) -> Self {
        Self { n, d }
    }

    /// Decrypt one 128-byte block in place.
    pub fn decrypt_block(&self, block: &mut [u8; RSA_BLOCK_SIZE]) {
        let c = BigUint::from_bytes_be(block);
        let m = (c % &self.n).modpow(&self.d, &self.n);
        let bytes = m.to_bytes_be();
        // Left-pad the plaintext back out to the block size.
        block.fill(0);
        block[RSA_BLOCK_SIZE - bytes.len()..].copy_from_slice(&bytes);
    }
}

impl std::fmt::Debug for RsaDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Private exponent stays out of logs.
        f.write_str("RsaDecryptor { .. }")
    }
}
