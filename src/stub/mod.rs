// This module defines the architecture-neutral stub plan and the StubBackend trait that each
// target implements. A plan is a flat list of StubItem values: optional register save, the
// three setup steps of every decode block (counter, key, payload address), the decode loop
// itself, inert junk, an instruction cache sync on targets without coherent fetch, and the
// optional restore. Plans carry no randomness of their own; every
// random decision has already been made by the synthesizer from the key schedule, so lowering
// a plan is a pure function of the plan and a StubLayout. The layout carries the values that
// depend on the final byte layout (the payload offset and, per address materialisation, the
// anchor offset it is relative to). The synthesizer lowers repeatedly until the layout it
// passed in matches the layout the backend reports back.

//! Decoder stub plan and backend interface.

pub mod synthesizer;

use rand::Rng;
use std::fmt;

use crate::core::config::Architecture;
use crate::core::error::EncodingError;
use crate::core::register_file::{AsmReg, RegBitSet, RegisterFile};
use crate::core::transform::FeedbackOp;

pub use synthesizer::StubSynthesizer;

/// Registers holding one decode block's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassRegisters {
    /// Start of the payload.
    pub pointer: AsmReg,
    /// Remaining byte count; also the index of the next byte after decrement.
    pub counter: AsmReg,
    /// Running accumulator (low 8 bits significant).
    pub key: AsmReg,
    /// Byte temporary for load/store targets.
    pub scratch: Option<AsmReg>,
}

impl PassRegisters {
    pub fn as_set(&self) -> RegBitSet {
        let mut set = RegBitSet::from_regs(&[self.pointer, self.counter, self.key]);
        if let Some(scratch) = self.scratch {
            set.set(scratch);
        }
        set
    }
}

/// One step of a block's setup sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    Counter,
    Key,
    PayloadAddress,
}

impl SetupStep {
    /// Order used by plain stubs.
    pub const CANONICAL: [SetupStep; 3] = [SetupStep::Counter, SetupStep::Key, SetupStep::PayloadAddress];
}

/// Arch-neutral stub item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubItem<J> {
    /// Push `regs` (and the flags register where the target has one).
    SaveRegisters(RegBitSet),
    LoadCounter { reg: AsmReg, len: u32 },
    LoadKey { reg: AsmReg, key: u8 },
    /// Materialise the payload start address; `fixup` indexes [`StubLayout::anchors`].
    LoadPayloadAddress { reg: AsmReg, fixup: usize },
    /// Undo one pass whose forward operator is `op`.
    DecodeLoop { op: FeedbackOp, regs: PassRegisters },
    Junk(J),
    /// Make the `len` decoded bytes visible to instruction fetch; clobbers the block's
    /// counter and scratch.
    SyncInstructionCache { regs: PassRegisters, len: u32 },
    /// Pop what [`StubItem::SaveRegisters`] pushed.
    RestoreRegisters(RegBitSet),
}

/// Layout-dependent values fed into a lowering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StubLayout {
    /// Offset of the payload from the stub start, i.e. the stub length.
    pub payload_offset: usize,
    /// Per-fixup offset the materialised address is computed relative to.
    pub anchors: Vec<usize>,
}

/// Result of one lowering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoweredStub {
    pub bytes: Vec<u8>,
    pub anchors: Vec<usize>,
}

/// Target-specific stub emission.
pub trait StubBackend {
    /// Target junk representation, generated up front and lowered later.
    type Junk: Clone + fmt::Debug;

    fn architecture(&self) -> Architecture;

    /// Largest payload the decode loop's counter can describe.
    fn max_payload_len(&self) -> usize {
        u32::MAX as usize
    }

    /// Whether stubs must write back and invalidate the decoded range before it runs.
    fn synchronizes_instruction_cache(&self) -> bool {
        false
    }

    /// Fixed assignment used by plain stubs.
    fn canonical_registers(&self) -> PassRegisters;

    /// Random assignment for metamorphic stubs.
    fn choose_registers<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        file: &mut RegisterFile,
    ) -> Result<PassRegisters, EncodingError>;

    /// Claim the registers for one block.
    fn assign_registers<R: Rng + ?Sized>(
        &self,
        plain: bool,
        rng: &mut R,
        file: &mut RegisterFile,
    ) -> Result<PassRegisters, EncodingError> {
        if !plain {
            return self.choose_registers(rng, file);
        }
        let regs = self.canonical_registers();
        file.allocate_fixed(regs.pointer, "pointer")?;
        file.allocate_fixed(regs.counter, "counter")?;
        file.allocate_fixed(regs.key, "key")?;
        if let Some(scratch) = regs.scratch {
            file.allocate_fixed(scratch, "scratch")?;
        }
        Ok(regs)
    }

    /// Inert junk touching only registers outside `reserved`.
    fn generate_junk<R: Rng + ?Sized>(&self, rng: &mut R, reserved: RegBitSet) -> Self::Junk;

    /// Emit machine code for `items` under `layout`.
    fn lower(&self, items: &[StubItem<Self::Junk>], layout: &StubLayout) -> Result<LoweredStub, EncodingError>;
}
