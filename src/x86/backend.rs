// x86 implementation of StubBackend for both bitnesses. Register selection keeps the stack
// pointer out of every pool and, in protected mode, draws the key register from the four
// registers with a low-byte form before picking the pointer and counter from the remaining
// general-purpose registers. Lowering walks the plan once per layout iteration, emitting each
// item through X86Encoder, and hands back the anchor offsets reported by the assembler. Only
// the protected-mode get-PC add depends on the previous iteration's layout; long-mode stubs
// reach the payload through an assembler label.

//! x86-64 and x86 stub backend.

use log::trace;
use rand::Rng;

use super::encoder::X86Encoder;
use super::junk::X86Junk;
use super::registers::{RAX, RCX, RSI, X32_BYTE_ADDRESSABLE, X32_GENERAL, X64_GENERAL};
use crate::core::config::Architecture;
use crate::core::error::EncodingError;
use crate::core::register_file::{AsmReg, RegBitSet, RegisterFile};
use crate::stub::{LoweredStub, PassRegisters, StubBackend, StubItem, StubLayout};

/// Stub backend for x86 in 64- or 32-bit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X86Backend {
    bitness: u32,
}

impl X86Backend {
    pub const fn x64() -> Self {
        Self { bitness: 64 }
    }

    pub const fn x32() -> Self {
        Self { bitness: 32 }
    }

    pub fn bitness(&self) -> u32 {
        self.bitness
    }

    fn general(&self) -> &'static [AsmReg] {
        if self.bitness == 64 {
            &X64_GENERAL
        } else {
            &X32_GENERAL
        }
    }

    fn key_pool(&self) -> &'static [AsmReg] {
        if self.bitness == 64 {
            &X64_GENERAL
        } else {
            &X32_BYTE_ADDRESSABLE
        }
    }
}

impl StubBackend for X86Backend {
    type Junk = X86Junk;

    fn architecture(&self) -> Architecture {
        if self.bitness == 64 {
            Architecture::X64
        } else {
            Architecture::X32
        }
    }

    fn canonical_registers(&self) -> PassRegisters {
        PassRegisters {
            pointer: RSI,
            counter: RCX,
            key: RAX,
            scratch: None,
        }
    }

    fn choose_registers<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        file: &mut RegisterFile,
    ) -> Result<PassRegisters, EncodingError> {
        let key = file.allocate_random(rng, self.key_pool(), "key")?;
        let pointer = file.allocate_random(rng, self.general(), "pointer")?;
        let counter = file.allocate_random(rng, self.general(), "counter")?;
        Ok(PassRegisters {
            pointer,
            counter,
            key,
            scratch: None,
        })
    }

    fn generate_junk<R: Rng + ?Sized>(&self, rng: &mut R, reserved: RegBitSet) -> X86Junk {
        X86Junk::generate(rng, self.general(), reserved, self.bitness)
    }

    fn lower(&self, items: &[StubItem<X86Junk>], layout: &StubLayout) -> Result<LoweredStub, EncodingError> {
        let mut encoder = X86Encoder::new(self.bitness)?;

        for item in items {
            trace!("x86 lower: {item:?}");
            match item {
                StubItem::SaveRegisters(regs) => encoder.save(*regs)?,
                StubItem::LoadCounter { reg, len } => encoder.load_counter(*reg, *len)?,
                StubItem::LoadKey { reg, key } => encoder.load_key(*reg, *key)?,
                StubItem::LoadPayloadAddress { reg, fixup } => {
                    let anchor = layout.anchors.get(*fixup).copied().unwrap_or(0);
                    encoder.load_payload_address(*reg, *fixup, layout.payload_offset, anchor)?;
                }
                StubItem::DecodeLoop { op, regs } => {
                    encoder.decode_loop(*op, regs.pointer, regs.counter, regs.key)?
                }
                // x86 fetch is coherent with stores on the executing core.
                StubItem::SyncInstructionCache { .. } => {}
                StubItem::Junk(junk) => junk.emit(&mut encoder)?,
                StubItem::RestoreRegisters(regs) => encoder.restore(*regs)?,
            }
        }

        let (bytes, anchors) = encoder.finalize(layout.anchors.len())?;
        Ok(LoweredStub { bytes, anchors })
    }
}
