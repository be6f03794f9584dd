//! x86 architecture-specific components.
//!
//! This module contains the x86-64 and 32-bit x86 stub backend:
//! - Instruction encoding using iced-x86
//! - Register tables for both bitnesses
//! - Junk generation
//! - `StubBackend` implementation

pub mod backend;
pub mod encoder;
pub mod junk;
pub mod registers;

pub use backend::X86Backend;
pub use encoder::X86Encoder;
pub use junk::X86Junk;
