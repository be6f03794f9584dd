//! sgn-engine - polymorphic payload encoding with decoder stub synthesis.
//!
//! A payload is transformed by one or more passes of a reversible additive-feedback
//! cipher and prefixed with a freshly synthesized machine-code stub that undoes every
//! pass in place and falls through into the decoded bytes. Stubs are generated for
//! x86-64, 32-bit x86 and AArch64; unless plain mode is requested, register choice,
//! setup order and inert junk vary with the seed.
//!
//! Two further encoders share the output format: `xor_dynamic`, a repeating-key xor
//! whose decoder finds its key and payload end by scanning for terminators, and
//! `schema`, a per-dword cipher with a call-over x86 decoder. Encoders can be layered
//! with a [`Pipeline`], built in code or loaded from YAML.
//!
//! # Primary Usage
//!
//! ```ignore
//! use sgn_engine::Encoder;
//!
//! let encoder = Encoder::x64(0x42, false, 2, true)?;
//! let buffer = encoder.encode(&payload)?;
//! let bytes: Vec<u8> = buffer.into_vec();
//! ```
//!
//! ```ignore
//! use sgn_engine::Pipeline;
//!
//! let pipeline = Pipeline::from_file("layers.yaml")?;
//! let buffer = pipeline.run(&payload)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Configuration, errors, transform, key schedule, registers, session
//! - [`stub`] - Architecture-neutral stub plan and the layout-resolving synthesizer
//! - [`x86`] - x86-64 and x86 backend (iced-x86)
//! - [`arm64`] - AArch64 backend (dynasmrt)
//! - [`encoder`] - The `Encoder` façade
//! - [`xor_dynamic`] - Self-delimiting repeating-key xor encoder
//! - [`schema`] - Per-dword schema cipher encoder
//! - [`pipeline`] - Stage trait, chained encoders and YAML definitions
//! - [`emulator`] - Software CPUs for verifying generated stubs
//! - [`ffi`] - C ABI (see `include/sgn_encoder.h`)

pub mod arm64;
pub mod core;
pub mod emulator;
pub mod encoder;
pub mod ffi;
pub mod pipeline;
pub mod schema;
pub mod stub;
pub mod x86;
pub mod xor_dynamic;

pub use crate::core::{
    // Configuration
    Architecture, EncoderConfig,
    // Errors
    AllocationFailure, ConfigurationError, EncodingError, PipelineError, SgnError, SgnResult,
    // Transform and key schedule
    decode_all, decode_pass, encode_all, encode_pass, FeedbackOp, KeySchedule, Pass,
    // Output and session
    OutputBuffer, SessionStats,
};
pub use crate::emulator::{EmulationError, EmulationOutcome};
pub use crate::encoder::Encoder;
pub use crate::pipeline::{Pipeline, PipelineConfig, Stage, StageOutput};
pub use crate::schema::SchemaEncoder;
pub use crate::stub::{StubBackend, StubSynthesizer};
pub use crate::xor_dynamic::XorDynamicEncoder;
