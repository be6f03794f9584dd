//! AArch64 architecture-specific components.
//!
//! This module contains the AArch64 stub backend:
//! - A64 instruction emission on dynasmrt
//! - Register pools (x18, x29, x30 and sp are off limits)
//! - Junk generation that never touches NZCV
//! - `StubBackend` implementation, including instruction cache maintenance

pub mod backend;
pub mod encoder;
pub mod junk;
pub mod registers;

pub use backend::Arm64Backend;
pub use encoder::A64Encoder;
pub use junk::Arm64Junk;
