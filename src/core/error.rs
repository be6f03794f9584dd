// This module defines the error types for the sgn-engine encoder using the thiserror crate.
// ConfigurationError covers rejected encoder configurations (zero passes, an architecture
// without a registered backend) and is raised before any byte is emitted. EncodingError
// covers internal synthesis failures: an unresolved layout fixup, an operand combination a
// backend cannot encode, an assembler rejection, or a payload longer than the stub's counter
// can express. AllocationFailure is reported when the output buffer cannot be reserved.
// SgnError is the umbrella type returned by Encoder::encode and wraps all three via #[from],
// so callers can match on the category that the C ABI maps to distinct status codes.
// PipelineError reports pipeline files that cannot be read or parsed, definitions that fail
// validation, and the index of the stage that failed while running.

//! Error types for the encoder.
//!
//! Using thiserror for idiomatic error handling.

use thiserror::Error;

use super::config::Architecture;

/// Configuration rejected at construction or at the start of `encode`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("encoding_count must be at least 1")]
    ZeroEncodingCount,

    #[error("no stub backend registered for architecture id {id}")]
    UnsupportedArchitecture { id: u32 },

    #[error("the {encoder} encoder has no decoder for {architecture}")]
    UnsupportedEncoderArchitecture {
        encoder: &'static str,
        architecture: Architecture,
    },

    #[error("option {option} does not apply to {stage} stages")]
    UnsupportedStageOption {
        stage: &'static str,
        option: &'static str,
    },
}

/// Internal stub synthesis failure. Never caused by payload content.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("payload offset fixup did not converge after {iterations} layout passes")]
    UnresolvedFixup { iterations: usize },

    #[error("assembler error: {0}")]
    Assembler(String),

    #[error("backend cannot encode {operation} with the requested operands")]
    UnsupportedOperand { operation: &'static str },

    #[error("payload of {len} bytes exceeds the {limit}-byte decoder limit")]
    PayloadTooLarge { len: usize, limit: usize },

    #[error("register pool exhausted while assigning {role}")]
    RegisterExhausted { role: &'static str },

    #[error("the {encoder} decoder needs at least one payload byte")]
    EmptyPayload { encoder: &'static str },

    #[error("no two-byte terminator is absent from the {len}-byte payload")]
    TerminatorUnavailable { len: usize },
}

/// The output buffer could not be sized to hold stub and payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("could not allocate {requested} bytes for the output buffer")]
pub struct AllocationFailure {
    pub requested: usize,
}

/// Umbrella error returned by `Encoder::encode`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SgnError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Allocation(#[from] AllocationFailure),
}

/// Result type alias for encoder operations.
pub type SgnResult<T> = Result<T, SgnError>;

/// Pipeline definition or execution failure.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("cannot read pipeline file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pipeline definition: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("pipeline name must not be empty")]
    EmptyName,

    #[error("pipeline defines no stages")]
    NoStages,

    #[error("stage {index}: {source}")]
    Configuration {
        index: usize,
        #[source]
        source: ConfigurationError,
    },

    #[error("stage {index} ({stage}) failed: {source}")]
    Stage {
        index: usize,
        stage: &'static str,
        #[source]
        source: SgnError,
    },
}
