//! # Configuration Management
//!
//! Structured configuration for the protocol core: transport policing
//! (encryption, checksum mode, compression), buffer pool sizing, logging,
//! and the server's RSA key material.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//!
//! Validation is collected rather than fail-fast: `validate()` returns every
//! problem it finds, `validate_strict()` folds them into one error.

use crate::error::{ProtocolError, Result};
use crate::protocol::checksum::ChecksumMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of output buffers kept warm in the pool.
pub const DEFAULT_POOL_SIZE: usize = 64;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// RSA private key for the login handshake; absent when the deployment
    /// profile runs without encryption.
    #[serde(default)]
    pub rsa: Option<RsaConfig>,
}

impl ProtocolConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::ConfigError(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("failed to parse TOML: {e}")))
    }

    /// Validate the configuration; an empty list means it is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.transport.validate());
        errors.extend(self.pool.validate());
        errors.extend(self.logging.validate());
        if let Some(rsa) = &self.rsa {
            errors.extend(rsa.validate());
        }
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Transport policing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Whether sessions enable XTEA encryption after the key handshake.
    pub encryption_enabled: bool,

    /// Checksum policing mode applied to game sessions.
    pub checksum_mode: ChecksumMode,

    /// Whether outgoing traffic runs through the per-connection deflate
    /// stream.
    pub compression_enabled: bool,

    /// Deflate level, 1 (fastest) to 9 (smallest).
    pub compression_level: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            encryption_enabled: true,
            checksum_mode: ChecksumMode::Sequence,
            compression_enabled: false,
            compression_level: 6,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.compression_enabled && !(1..=9).contains(&self.compression_level) {
            errors.push(format!(
                "invalid compression level: {} (valid range: 1-9)",
                self.compression_level
            ));
        }

        if !self.encryption_enabled {
            errors.push("WARNING: encryption is disabled - not recommended for production".into());
        }

        errors
    }
}

/// Output buffer pool sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Buffers allocated up front.
    pub preallocated: usize,

    /// Ceiling on idle buffers retained; recycled buffers beyond this are
    /// dropped.
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            preallocated: DEFAULT_POOL_SIZE,
            max_idle: DEFAULT_POOL_SIZE * 2,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_idle < self.preallocated {
            errors.push(format!(
                "pool max_idle ({}) is below preallocated ({})",
                self.max_idle, self.preallocated
            ));
        }
        if self.preallocated > 10_000 {
            errors.push(format!(
                "pool preallocated very high: {} (each buffer is ~24 KB)",
                self.preallocated
            ));
        }
        errors
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Level or filter directive (e.g. "info", "worldgate=debug").
    pub log_level: String,

    /// Include event targets in log lines.
    pub log_targets: bool,

    /// Emit JSON instead of the human-readable format.
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: String::from("info"),
            log_targets: true,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.log_level.is_empty() {
            errors.push("log level cannot be empty".into());
        }
        errors
    }
}

/// RSA private key material, decimal-encoded as servers ship it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RsaConfig {
    /// Modulus.
    pub n: String,

    /// Private exponent.
    pub d: String,
}

impl RsaConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, value) in [("n", &self.n), ("d", &self.d)] {
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                errors.push(format!("rsa.{name} must be a decimal integer"));
            }
        }
        errors
    }
}
