// AArch64 implementation of StubBackend. A64 has no memory-destination arithmetic, so each
// block also claims a scratch register for the load/modify/store of the current byte. Every
// instruction is a fixed four bytes, which makes the layout converge on the second lowering.
// The adr of each block targets the encoder's payload label, so dynasm resolves the
// displacement; the anchor reported back is the adr's own offset. Instruction fetch is not
// coherent with data stores on AArch64, so after the final loop the stub cleans each line of
// the decoded range to the point of unification, invalidates it in the instruction cache and
// finishes with dsb ish and isb.

//! AArch64 stub backend.

use log::trace;
use rand::Rng;

use super::encoder::{A64Encoder, RegOp, Width, ZR};
use super::junk::Arm64Junk;
use super::registers::{GENERAL, X1, X2, X3, X4};
use crate::core::config::Architecture;
use crate::core::error::EncodingError;
use crate::core::register_file::{RegBitSet, RegisterFile};
use crate::core::transform::FeedbackOp;
use crate::stub::{LoweredStub, PassRegisters, StubBackend, StubItem, StubLayout};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Arm64Backend;

impl Arm64Backend {
    pub const fn new() -> Self {
        Self
    }

    fn save_pairs(regs: RegBitSet) -> Vec<(u8, u8)> {
        let ids: Vec<u8> = regs.iter().map(|reg| reg.id).collect();
        ids.chunks(2)
            .map(|pair| (pair[0], pair.get(1).copied().unwrap_or(ZR)))
            .collect()
    }

    fn decode_loop(encoder: &mut A64Encoder, op: FeedbackOp, regs: &PassRegisters) -> Result<(), EncodingError> {
        let scratch = regs
            .scratch
            .ok_or(EncodingError::RegisterExhausted { role: "scratch" })?
            .id;
        let (ptr, ctr, key) = (regs.pointer.id, regs.counter.id, regs.key.id);
        let apply = match op.inverse() {
            FeedbackOp::Xor => RegOp::Eor,
            FeedbackOp::Add => RegOp::Add,
            FeedbackOp::Sub => RegOp::Sub,
        };

        let top = encoder.new_label();
        let cond = encoder.new_label();

        encoder.b(cond);
        encoder.bind(top);
        encoder.sub_imm(ctr, ctr, 1);
        encoder.ldrb_indexed(scratch, ptr, ctr);
        encoder.reg_op(Width::W, apply, scratch, scratch, key);
        encoder.strb_indexed(scratch, ptr, ctr);
        encoder.reg_op(Width::W, RegOp::Add, key, key, scratch);
        encoder.bind(cond);
        encoder.cbnz(ctr, top);
        Ok(())
    }
}

impl StubBackend for Arm64Backend {
    type Junk = Arm64Junk;

    fn architecture(&self) -> Architecture {
        Architecture::AArch64
    }

    fn synchronizes_instruction_cache(&self) -> bool {
        true
    }

    fn canonical_registers(&self) -> PassRegisters {
        PassRegisters {
            pointer: X1,
            counter: X2,
            key: X3,
            scratch: Some(X4),
        }
    }

    fn choose_registers<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        file: &mut RegisterFile,
    ) -> Result<PassRegisters, EncodingError> {
        let pointer = file.allocate_random(rng, &GENERAL, "pointer")?;
        let counter = file.allocate_random(rng, &GENERAL, "counter")?;
        let key = file.allocate_random(rng, &GENERAL, "key")?;
        let scratch = file.allocate_random(rng, &GENERAL, "scratch")?;
        Ok(PassRegisters {
            pointer,
            counter,
            key,
            scratch: Some(scratch),
        })
    }

    fn generate_junk<R: Rng + ?Sized>(&self, rng: &mut R, reserved: RegBitSet) -> Arm64Junk {
        Arm64Junk::generate(rng, &GENERAL, reserved)
    }

    fn lower(&self, items: &[StubItem<Arm64Junk>], layout: &StubLayout) -> Result<LoweredStub, EncodingError> {
        let mut encoder = A64Encoder::new();
        let payload = encoder.payload_label();
        let mut anchors = vec![0; layout.anchors.len()];

        for item in items {
            trace!("aarch64 lower: {item:?}");
            match item {
                StubItem::SaveRegisters(regs) => {
                    for (first, second) in Self::save_pairs(*regs) {
                        encoder.push_pair(first, second);
                    }
                }
                StubItem::LoadCounter { reg, len } => encoder.mov_u32(*reg, *len),
                StubItem::LoadKey { reg, key } => encoder.movz_w(*reg, u16::from(*key)),
                StubItem::LoadPayloadAddress { reg, fixup } => {
                    if let Some(anchor) = anchors.get_mut(*fixup) {
                        *anchor = encoder.position();
                    }
                    encoder.adr(*reg, payload);
                }
                StubItem::DecodeLoop { op, regs } => Self::decode_loop(&mut encoder, *op, regs)?,
                StubItem::SyncInstructionCache { regs, len } => {
                    let scratch = regs.scratch.ok_or(EncodingError::RegisterExhausted { role: "scratch" })?;
                    encoder.sync_instruction_cache(regs.pointer, regs.counter, scratch, *len);
                }
                StubItem::Junk(junk) => junk.emit(&mut encoder),
                StubItem::RestoreRegisters(regs) => {
                    for (first, second) in Self::save_pairs(*regs).into_iter().rev() {
                        encoder.pop_pair(first, second);
                    }
                }
            }
        }

        Ok(LoweredStub {
            bytes: encoder.finalize()?,
            anchors,
        })
    }
}
