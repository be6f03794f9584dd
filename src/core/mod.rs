// This module serves as the central hub for the encoder's architecture-independent
// infrastructure, shared by every stub backend. It exports and organizes the key subsystems:
// configuration (target architecture and the immutable encoder options), error types for each
// layer, the reversible additive-feedback transform that defines the encoded payload, the
// seeded key schedule that derives every per-pass key and synthesis choice from the 8-bit
// seed, register selection with bitset tracking, the per-call arena session that stores the
// stub plan, and the caller-owned output buffer. Nothing in here emits machine code; the
// backends under x86 and arm64 consume these pieces through the stub synthesizer.

//! Core encoder infrastructure.
//!
//! # Key Components
//!
//! ## Configuration (`config`)
//! - `Architecture` ids shared with the C ABI
//! - `EncoderConfig` validated once at construction
//!
//! ## Block Transform (`transform`)
//! - Reverse-order additive feedback with XOR, ADD and SUB operators
//! - Software model of every decoder stub
//!
//! ## Key Schedule (`key_schedule`)
//! - One ChaCha20 stream per pass, plus one for stub-wide layout
//!
//! ## Register Selection (`register_file`)
//! - `AsmReg` / `RegBitSet` tracking of clobbered registers
//!
//! ## Session Management (`session`)
//! - Arena-backed plan storage using `bumpalo`
//! - Synthesis statistics

pub mod buffer;
pub mod config;
pub mod error;
pub mod key_schedule;
pub mod register_file;
pub mod session;
pub mod transform;

pub use buffer::OutputBuffer;

pub use config::{Architecture, EncoderConfig};

pub use error::{AllocationFailure, ConfigurationError, EncodingError, PipelineError, SgnError, SgnResult};

pub use key_schedule::{KeySchedule, PassSchedule};

pub use register_file::{AsmReg, RegBitSet, RegisterFile};

pub use session::{SessionStats, SynthesisSession};

pub use transform::{decode_all, decode_pass, encode_all, encode_pass, FeedbackOp, Pass};
