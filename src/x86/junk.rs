// Junk instructions for x86 stubs. Every variant has zero net effect on general-purpose
// registers and memory; flags may change. Leaves are single instructions (nop, flag ops,
// same-register moves and tests, zero immediates, lea with a zero displacement) and jumps
// over random bytes. Composite variants wrap nested junk in a self-inverse pair on one
// register (not/not, neg/neg, inc/dec, add/sub, rol/ror) or skip it with a conditional jump
// whose taken and fall-through paths are equivalent. Jump targets are assembler labels, so
// the block encoder picks the short form whenever the body fits.

//! x86 junk generation and emission.

use rand::Rng;

use super::encoder::{FlagOp, RegImmOp, RegRegOp, UnaryOp, X86Encoder};
use crate::core::error::EncodingError;
use crate::core::key_schedule::{coin_flip, pick_index};
use crate::core::register_file::{AsmReg, RegBitSet};

const MAX_DEPTH: u8 = 2;
const MAX_SKIPPED_BYTES: usize = 6;

/// Self-inverse instruction pair around nested junk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairOp {
    NotNot,
    NegNeg,
    IncDec,
    DecInc,
    AddSub(i32),
    SubAdd(i32),
    RolRor(i32),
    RorRol(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum X86Junk {
    Nop,
    Flag(FlagOp),
    SelfOp { op: RegRegOp, reg: AsmReg },
    LeaSelf(AsmReg),
    /// `op reg, 0` for add, sub, xor and or.
    ZeroImm { op: RegImmOp, reg: AsmReg },
    Pair { pair: PairOp, reg: AsmReg, inner: Vec<X86Junk> },
    /// `jmp` over random bytes.
    JumpOver(Vec<u8>),
    /// `jcc` (condition 0..=15) over nested junk.
    CondJumpOver { condition: u8, inner: Vec<X86Junk> },
}

impl X86Junk {
    /// Random junk using only `candidates` that are not in `reserved`.
    pub fn generate<R: Rng + ?Sized>(
        rng: &mut R,
        candidates: &[AsmReg],
        reserved: RegBitSet,
        bitness: u32,
    ) -> Self {
        let free: Vec<AsmReg> = candidates
            .iter()
            .copied()
            .filter(|reg| !reserved.contains(*reg))
            .collect();
        Self::generate_at(rng, &free, bitness, 0)
    }

    fn generate_at<R: Rng + ?Sized>(rng: &mut R, free: &[AsmReg], bitness: u32, depth: u8) -> Self {
        let kinds = if depth >= MAX_DEPTH { 5 } else { 7 };
        let kind = pick_index(rng, kinds);

        if free.is_empty() && matches!(kind, 2 | 3 | 5) {
            return X86Junk::Nop;
        }

        match kind {
            0 => {
                const FLAGS: [FlagOp; 4] = [FlagOp::Clc, FlagOp::Stc, FlagOp::Cmc, FlagOp::Cld];
                if coin_flip(rng) {
                    X86Junk::Nop
                } else {
                    X86Junk::Flag(FLAGS[pick_index(rng, FLAGS.len())])
                }
            }
            1 => {
                let len = 1 + pick_index(rng, MAX_SKIPPED_BYTES);
                X86Junk::JumpOver((0..len).map(|_| rng.gen()).collect())
            }
            2 => {
                const OPS: [RegRegOp; 6] = [
                    RegRegOp::Mov,
                    RegRegOp::Xchg,
                    RegRegOp::Test,
                    RegRegOp::Cmp,
                    RegRegOp::Or,
                    RegRegOp::And,
                ];
                let op = OPS[pick_index(rng, OPS.len())];
                X86Junk::SelfOp { op, reg: pick_reg(rng, free) }
            }
            3 => {
                const OPS: [RegImmOp; 4] = [RegImmOp::Add, RegImmOp::Sub, RegImmOp::Xor, RegImmOp::Or];
                if coin_flip(rng) {
                    X86Junk::LeaSelf(pick_reg(rng, free))
                } else {
                    let op = OPS[pick_index(rng, OPS.len())];
                    X86Junk::ZeroImm { op, reg: pick_reg(rng, free) }
                }
            }
            4 => X86Junk::Nop,
            5 => {
                let reg = pick_reg(rng, free);
                let width = bitness as usize;
                let pair = match pick_index(rng, 8) {
                    0 => PairOp::NotNot,
                    1 => PairOp::NegNeg,
                    2 => PairOp::IncDec,
                    3 => PairOp::DecInc,
                    4 => PairOp::AddSub(1 + pick_index(rng, 127) as i32),
                    5 => PairOp::SubAdd(1 + pick_index(rng, 127) as i32),
                    6 => PairOp::RolRor(1 + pick_index(rng, width - 1) as i32),
                    _ => PairOp::RorRol(1 + pick_index(rng, width - 1) as i32),
                };
                let count = pick_index(rng, 3);
                let inner = (0..count)
                    .map(|_| Self::generate_at(rng, free, bitness, depth + 1))
                    .collect();
                X86Junk::Pair { pair, reg, inner }
            }
            _ => {
                let condition = pick_index(rng, 16) as u8;
                let count = 1 + pick_index(rng, 2);
                let inner = (0..count)
                    .map(|_| Self::generate_at(rng, free, bitness, depth + 1))
                    .collect();
                X86Junk::CondJumpOver { condition, inner }
            }
        }
    }

    /// Emit into `encoder`.
    pub fn emit(&self, encoder: &mut X86Encoder) -> Result<(), EncodingError> {
        match self {
            X86Junk::Nop => encoder.nop(),
            X86Junk::Flag(op) => encoder.flag_op(*op),
            X86Junk::SelfOp { op, reg } => encoder.reg_reg(*op, *reg),
            X86Junk::LeaSelf(reg) => encoder.lea_self(*reg),
            X86Junk::ZeroImm { op, reg } => encoder.reg_imm(*op, *reg, 0),
            X86Junk::Pair { pair, reg, inner } => {
                let (first, second): (Step, Step) = match *pair {
                    PairOp::NotNot => (Step::Unary(UnaryOp::Not), Step::Unary(UnaryOp::Not)),
                    PairOp::NegNeg => (Step::Unary(UnaryOp::Neg), Step::Unary(UnaryOp::Neg)),
                    PairOp::IncDec => (Step::Unary(UnaryOp::Inc), Step::Unary(UnaryOp::Dec)),
                    PairOp::DecInc => (Step::Unary(UnaryOp::Dec), Step::Unary(UnaryOp::Inc)),
                    PairOp::AddSub(k) => (Step::Imm(RegImmOp::Add, k), Step::Imm(RegImmOp::Sub, k)),
                    PairOp::SubAdd(k) => (Step::Imm(RegImmOp::Sub, k), Step::Imm(RegImmOp::Add, k)),
                    PairOp::RolRor(k) => (Step::Imm(RegImmOp::Rol, k), Step::Imm(RegImmOp::Ror, k)),
                    PairOp::RorRol(k) => (Step::Imm(RegImmOp::Ror, k), Step::Imm(RegImmOp::Rol, k)),
                };
                first.emit(encoder, *reg)?;
                for junk in inner {
                    junk.emit(encoder)?;
                }
                second.emit(encoder, *reg)
            }
            X86Junk::JumpOver(bytes) => {
                let mut skip = encoder.create_label();
                encoder.jmp(skip)?;
                encoder.db(bytes)?;
                encoder.bind(&mut skip)
            }
            X86Junk::CondJumpOver { condition, inner } => {
                let mut skip = encoder.create_label();
                encoder.jcc(*condition, skip)?;
                for junk in inner {
                    junk.emit(encoder)?;
                }
                encoder.bind(&mut skip)
            }
        }
    }
}

fn pick_reg<R: Rng + ?Sized>(rng: &mut R, free: &[AsmReg]) -> AsmReg {
    free[pick_index(rng, free.len())]
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Unary(UnaryOp),
    Imm(RegImmOp, i32),
}

impl Step {
    fn emit(self, encoder: &mut X86Encoder, reg: AsmReg) -> Result<(), EncodingError> {
        match self {
            Step::Unary(op) => encoder.unary(op, reg),
            Step::Imm(op, imm) => encoder.reg_imm(op, reg, imm),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::registers::{X32_GENERAL, X64_GENERAL};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn uses_reg(junk: &X86Junk, reg: AsmReg) -> bool {
        match junk {
            X86Junk::SelfOp { reg: r, .. } | X86Junk::LeaSelf(r) | X86Junk::ZeroImm { reg: r, .. } => *r == reg,
            X86Junk::Pair { reg: r, inner, .. } => *r == reg || inner.iter().any(|j| uses_reg(j, reg)),
            X86Junk::CondJumpOver { inner, .. } => inner.iter().any(|j| uses_reg(j, reg)),
            _ => false,
        }
    }

    #[test]
    fn test_reserved_registers_untouched() {
        let reserved = RegBitSet::from_regs(&[AsmReg::new(0), AsmReg::new(1), AsmReg::new(6)]);
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        for _ in 0..500 {
            let junk = X86Junk::generate(&mut rng, &X64_GENERAL, reserved, 64);
            for reg in reserved.iter() {
                assert!(!uses_reg(&junk, reg), "{junk:?} touches {reg:?}");
            }
        }
    }

    #[test]
    fn test_every_variant_emits() {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        for bitness in [32, 64] {
            let pool: &[AsmReg] = if bitness == 64 { &X64_GENERAL } else { &X32_GENERAL };
            for _ in 0..300 {
                let junk = X86Junk::generate(&mut rng, pool, RegBitSet::new(), bitness);
                let mut encoder = X86Encoder::new(bitness).unwrap();
                junk.emit(&mut encoder).unwrap();
                assert!(!encoder.finalize_code().unwrap().is_empty());
            }
        }
    }

    #[test]
    fn test_no_free_registers_falls_back() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let reserved = RegBitSet::from_regs(&X32_GENERAL);
        for _ in 0..100 {
            let junk = X86Junk::generate(&mut rng, &X32_GENERAL, reserved, 32);
            for reg in X32_GENERAL {
                assert!(!uses_reg(&junk, reg));
            }
        }
    }

    #[test]
    fn test_jump_over_skips_data() {
        let junk = X86Junk::JumpOver(vec![0x0F, 0x0B, 0xCC]);
        let mut encoder = X86Encoder::new(32).unwrap();
        junk.emit(&mut encoder).unwrap();
        assert_eq!(encoder.finalize_code().unwrap(), vec![0xEB, 0x03, 0x0F, 0x0B, 0xCC]);
    }

    #[test]
    fn test_cond_jump_over_nested_junk() {
        let junk = X86Junk::CondJumpOver {
            condition: 0x2,
            inner: vec![X86Junk::Nop, X86Junk::Flag(FlagOp::Stc)],
        };
        let mut encoder = X86Encoder::new(64).unwrap();
        junk.emit(&mut encoder).unwrap();
        // jb +2 ; nop ; stc
        assert_eq!(encoder.finalize_code().unwrap(), vec![0x72, 0x02, 0x90, 0xF9]);
    }
}
