// Junk instructions for AArch64 stubs. Every variant leaves general-purpose registers, memory
// and NZCV exactly as it found them. Leaves are nop, same-register moves and logical ops, and
// an add of zero. Composite variants wrap nested junk in an inverse pair on one register:
// add/sub of an immediate, double mvn, double eor with a second register, or two rotations
// summing to 64. A branch over random words skips data the core never executes.

//! AArch64 junk generation and emission.

use rand::Rng;

use super::encoder::{A64Encoder, RegOp, Width, ZR};
use crate::core::key_schedule::{coin_flip, pick_index};
use crate::core::register_file::{AsmReg, RegBitSet};

const MAX_DEPTH: u8 = 2;
const MAX_SKIPPED_WORDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmPair {
    AddSub(u16),
    SubAdd(u16),
    MvnMvn,
    /// `eor reg, reg, other` twice.
    EorEor(AsmReg),
    /// `ror` by n then by 64 - n.
    RorRor(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arm64Junk {
    Nop,
    /// `mov x, x`
    MovSelf(AsmReg),
    /// `add x, x, #0`
    AddZero(AsmReg),
    OrrSelf(AsmReg),
    AndSelf(AsmReg),
    Pair { pair: ArmPair, reg: AsmReg, inner: Vec<Arm64Junk> },
    /// `b` over random words.
    BranchOver(Vec<u32>),
}

impl Arm64Junk {
    /// Random junk writing only `candidates` that are not in `reserved`.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R, candidates: &[AsmReg], reserved: RegBitSet) -> Self {
        let free: Vec<AsmReg> = candidates
            .iter()
            .copied()
            .filter(|reg| !reserved.contains(*reg))
            .collect();
        Self::generate_at(rng, candidates, &free, 0)
    }

    fn generate_at<R: Rng + ?Sized>(rng: &mut R, readable: &[AsmReg], free: &[AsmReg], depth: u8) -> Self {
        let kinds = if depth >= MAX_DEPTH { 3 } else { 4 };
        let kind = pick_index(rng, kinds);
        if free.is_empty() && kind != 1 {
            return Arm64Junk::Nop;
        }

        match kind {
            0 => {
                let reg = free[pick_index(rng, free.len())];
                match pick_index(rng, 5) {
                    0 => Arm64Junk::Nop,
                    1 => Arm64Junk::MovSelf(reg),
                    2 => Arm64Junk::AddZero(reg),
                    3 => Arm64Junk::OrrSelf(reg),
                    _ => Arm64Junk::AndSelf(reg),
                }
            }
            1 => {
                let count = 1 + pick_index(rng, MAX_SKIPPED_WORDS);
                Arm64Junk::BranchOver((0..count).map(|_| rng.gen()).collect())
            }
            2 => {
                if coin_flip(rng) {
                    Arm64Junk::Nop
                } else {
                    Arm64Junk::MovSelf(free[pick_index(rng, free.len())])
                }
            }
            _ => {
                let reg = free[pick_index(rng, free.len())];
                let others: Vec<AsmReg> = readable.iter().copied().filter(|other| *other != reg).collect();
                let pair = match pick_index(rng, 5) {
                    0 => ArmPair::AddSub(1 + pick_index(rng, 4095) as u16),
                    1 => ArmPair::SubAdd(1 + pick_index(rng, 4095) as u16),
                    2 => ArmPair::MvnMvn,
                    3 if !others.is_empty() => ArmPair::EorEor(others[pick_index(rng, others.len())]),
                    _ => ArmPair::RorRor(1 + pick_index(rng, 63) as u32),
                };
                let count = pick_index(rng, 3);
                let inner = (0..count)
                    .map(|_| Self::generate_at(rng, readable, free, depth + 1))
                    .collect();
                Arm64Junk::Pair { pair, reg, inner }
            }
        }
    }

    /// Emit into `encoder`.
    pub fn emit(&self, encoder: &mut A64Encoder) {
        match self {
            Arm64Junk::Nop => encoder.nop(),
            Arm64Junk::MovSelf(reg) => encoder.mov_x(reg.id, reg.id),
            Arm64Junk::AddZero(reg) => encoder.add_imm(reg.id, reg.id, 0),
            Arm64Junk::OrrSelf(reg) => encoder.reg_op(Width::X, RegOp::Orr, reg.id, reg.id, reg.id),
            Arm64Junk::AndSelf(reg) => encoder.reg_op(Width::X, RegOp::And, reg.id, reg.id, reg.id),
            Arm64Junk::Pair { pair, reg, inner } => {
                let r = reg.id;
                Self::emit_half(encoder, *pair, r, false);
                for junk in inner {
                    junk.emit(encoder);
                }
                Self::emit_half(encoder, *pair, r, true);
            }
            Arm64Junk::BranchOver(words) => {
                let skip = encoder.new_label();
                encoder.b(skip);
                for word in words {
                    encoder.word(*word);
                }
                encoder.bind(skip);
            }
        }
    }

    fn emit_half(encoder: &mut A64Encoder, pair: ArmPair, r: u8, closing: bool) {
        match pair {
            ArmPair::AddSub(k) if closing => encoder.sub_imm(r, r, k),
            ArmPair::AddSub(k) => encoder.add_imm(r, r, k),
            ArmPair::SubAdd(k) if closing => encoder.add_imm(r, r, k),
            ArmPair::SubAdd(k) => encoder.sub_imm(r, r, k),
            ArmPair::MvnMvn => encoder.reg_op(Width::X, RegOp::Orn, r, ZR, r),
            ArmPair::EorEor(other) => encoder.reg_op(Width::X, RegOp::Eor, r, r, other.id),
            ArmPair::RorRor(n) if closing => encoder.extr(r, r, r, 64 - n),
            ArmPair::RorRor(n) => encoder.extr(r, r, r, n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm64::registers::GENERAL;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn writes(junk: &Arm64Junk, reg: AsmReg) -> bool {
        match junk {
            Arm64Junk::MovSelf(r) | Arm64Junk::AddZero(r) | Arm64Junk::OrrSelf(r) | Arm64Junk::AndSelf(r) => *r == reg,
            Arm64Junk::Pair { reg: r, inner, .. } => *r == reg || inner.iter().any(|j| writes(j, reg)),
            _ => false,
        }
    }

    #[test]
    fn test_reserved_registers_not_written() {
        let reserved = RegBitSet::from_regs(&[AsmReg::new(1), AsmReg::new(2), AsmReg::new(3), AsmReg::new(4)]);
        let mut rng = ChaCha20Rng::seed_from_u64(21);
        for _ in 0..500 {
            let junk = Arm64Junk::generate(&mut rng, &GENERAL, reserved);
            for reg in reserved.iter() {
                assert!(!writes(&junk, reg), "{junk:?} writes {reg:?}");
            }
        }
    }

    #[test]
    fn test_eor_pair_uses_distinct_register() {
        let mut rng = ChaCha20Rng::seed_from_u64(8);
        for _ in 0..500 {
            if let Arm64Junk::Pair { pair: ArmPair::EorEor(other), reg, .. } =
                Arm64Junk::generate(&mut rng, &GENERAL, RegBitSet::new())
            {
                assert_ne!(other, reg);
            }
        }
    }

    #[test]
    fn test_branch_over_skips_words() {
        let junk = Arm64Junk::BranchOver(vec![0xDEAD_BEEF, 0x0BAD_F00D]);
        let mut encoder = A64Encoder::new();
        junk.emit(&mut encoder);
        let bytes = encoder.finalize().unwrap();
        assert_eq!(&bytes[..4], &0x1400_0003u32.to_le_bytes());
        assert_eq!(bytes.len(), 12);
    }
}
