// Encoder configuration. Architecture names the three supported targets and carries the
// numeric ids used across the C ABI; EncoderConfig bundles the immutable options an Encoder
// is bound to (seed, plain_decoder, encoding_count, save_registers) and validates them once
// at construction so every later encode call can assume a well-formed configuration.
// Architecture also (de)serializes by its lowercase name for pipeline files.

//! Encoder configuration and validation.

use serde::{Deserialize, Serialize};

use super::error::ConfigurationError;
use std::fmt;
use std::str::FromStr;

/// Target instruction-set architecture for the decoder stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// 64-bit x86 (long mode).
    #[serde(alias = "x86_64", alias = "amd64")]
    X64,
    /// 32-bit x86 (protected mode).
    #[serde(alias = "x86", alias = "i386")]
    X32,
    /// 64-bit ARM (A64 instruction set).
    #[serde(alias = "arm64")]
    AArch64,
}

impl Architecture {
    /// All supported architectures.
    pub const ALL: [Architecture; 3] = [Architecture::X64, Architecture::X32, Architecture::AArch64];

    /// Numeric id used by the C ABI.
    pub const fn id(self) -> u32 {
        match self {
            Architecture::X64 => 0,
            Architecture::X32 => 1,
            Architecture::AArch64 => 2,
        }
    }

    /// Inverse of [`Architecture::id`].
    pub fn from_id(id: u32) -> Result<Self, ConfigurationError> {
        match id {
            0 => Ok(Architecture::X64),
            1 => Ok(Architecture::X32),
            2 => Ok(Architecture::AArch64),
            _ => Err(ConfigurationError::UnsupportedArchitecture { id }),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Architecture::X64 => "x64",
            Architecture::X32 => "x32",
            Architecture::AArch64 => "aarch64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x64" | "x86_64" | "amd64" => Ok(Architecture::X64),
            "x32" | "x86" | "i386" => Ok(Architecture::X32),
            "aarch64" | "arm64" => Ok(Architecture::AArch64),
            other => Err(format!("unknown architecture: {other}")),
        }
    }
}

/// Immutable encoder options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderConfig {
    pub architecture: Architecture,
    /// Seeds the key schedule.
    pub seed: u8,
    /// Suppress junk insertion and register randomization.
    pub plain_decoder: bool,
    /// Number of transformation passes, at least 1.
    pub encoding_count: u32,
    /// Preserve every register the stub touches.
    pub save_registers: bool,
}

impl EncoderConfig {
    /// Build and validate a configuration.
    pub fn new(
        architecture: Architecture,
        seed: u8,
        plain_decoder: bool,
        encoding_count: u32,
        save_registers: bool,
    ) -> Result<Self, ConfigurationError> {
        let config = Self {
            architecture,
            seed,
            plain_decoder,
            encoding_count,
            save_registers,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants every encode call relies on.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.encoding_count == 0 {
            return Err(ConfigurationError::ZeroEncodingCount);
        }
        Ok(())
    }
}
