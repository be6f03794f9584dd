// This module wraps a dynasmrt VecAssembler for A64 stub emission. A64Encoder converts AsmReg
// ids into dynasm's runtime X/W/XSP registers and exposes the instruction shapes an AArch64
// stub is built from: wide immediate loads, add/sub and logical operations, extr rotations,
// register-offset and post-indexed byte transfers, stp/ldp register pairs on sp, and the
// branch and barrier group. Branch and adr targets are dynasm dynamic labels, so every
// PC-relative field is resolved and range-checked by the assembler at finalize. Each encoder
// owns a payload label that finalize binds at the end of the emitted code; stubs address the
// bytes that follow them through it. None of the data-processing shapes used by the decode
// loop writes NZCV: it decrements with sub (not subs) and tests with cbnz.

//! A64 instruction encoding using dynasmrt.

use dynasmrt::aarch64::Aarch64Relocation;
use dynasmrt::{dynasm, DynamicLabel, DynasmApi, DynasmError, DynasmLabelApi, VecAssembler};

use crate::core::error::EncodingError;
use crate::core::register_file::AsmReg;

/// Register number 31 as the zero register.
pub const ZR: u8 = 31;

/// Byte step of the cache maintenance loop: one word, the smallest line CTR_EL0 can report.
pub const CACHE_SYNC_STRIDE: u32 = 4;

pub(crate) fn asm_error(e: DynasmError) -> EncodingError {
    EncodingError::Assembler(e.to_string())
}

/// Operand width of a data-processing instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W,
    X,
}

/// Logical/arithmetic shifted-register operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegOp {
    Add,
    Sub,
    And,
    Orr,
    Eor,
    /// `orn`, used as `mvn` with a zero first source.
    Orn,
}

/// A64 stub encoder.
pub struct A64Encoder {
    ops: VecAssembler<Aarch64Relocation>,
    payload: DynamicLabel,
}

impl Default for A64Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl A64Encoder {
    pub fn new() -> Self {
        let mut ops = VecAssembler::new(0);
        let payload = ops.new_dynamic_label();
        Self { ops, payload }
    }

    /// Byte offset of the next instruction.
    pub fn position(&self) -> usize {
        self.ops.offset().0
    }

    /// Label bound to the first byte after the emitted code.
    pub fn payload_label(&self) -> DynamicLabel {
        self.payload
    }

    pub fn new_label(&mut self) -> DynamicLabel {
        self.ops.new_dynamic_label()
    }

    pub fn bind(&mut self, label: DynamicLabel) {
        dynasm!(self.ops
            ; .arch aarch64
            ; =>label
        );
    }

    pub fn nop(&mut self) {
        dynasm!(self.ops
            ; .arch aarch64
            ; nop
        );
    }

    /// Raw data word, never executed.
    pub fn word(&mut self, value: u32) {
        dynasm!(self.ops
            ; .arch aarch64
            ; .u32 value
        );
    }

    /// Load a 32-bit value, zero-extended, using exactly two instructions.
    pub fn mov_u32(&mut self, dst: AsmReg, value: u32) {
        let rd = u32::from(dst.id);
        let (low, high) = (value & 0xFFFF, value >> 16);
        dynasm!(self.ops
            ; .arch aarch64
            ; movz W(rd), #low
            ; movk W(rd), #high, lsl #16
        );
    }

    /// `movz wd, #imm16`.
    pub fn movz_w(&mut self, dst: AsmReg, imm16: u16) {
        let (rd, imm) = (u32::from(dst.id), u32::from(imm16));
        dynasm!(self.ops
            ; .arch aarch64
            ; movz W(rd), #imm
        );
    }

    /// `add xd, xn, #imm12`.
    pub fn add_imm(&mut self, dst: u8, src: u8, imm12: u16) {
        let (rd, rn, imm) = (u32::from(dst), u32::from(src), u32::from(imm12 & 0xFFF));
        dynasm!(self.ops
            ; .arch aarch64
            ; add XSP(rd), XSP(rn), #imm
        );
    }

    /// `sub xd, xn, #imm12`.
    pub fn sub_imm(&mut self, dst: u8, src: u8, imm12: u16) {
        let (rd, rn, imm) = (u32::from(dst), u32::from(src), u32::from(imm12 & 0xFFF));
        dynasm!(self.ops
            ; .arch aarch64
            ; sub XSP(rd), XSP(rn), #imm
        );
    }

    /// Shifted-register form with shift amount zero.
    pub fn reg_op(&mut self, width: Width, op: RegOp, dst: u8, left: u8, right: u8) {
        let (rd, rn, rm) = (u32::from(dst), u32::from(left), u32::from(right));
        match (width, op) {
            (Width::W, RegOp::Add) => dynasm!(self.ops ; .arch aarch64 ; add W(rd), W(rn), W(rm)),
            (Width::W, RegOp::Sub) => dynasm!(self.ops ; .arch aarch64 ; sub W(rd), W(rn), W(rm)),
            (Width::W, RegOp::And) => dynasm!(self.ops ; .arch aarch64 ; and W(rd), W(rn), W(rm)),
            (Width::W, RegOp::Orr) => dynasm!(self.ops ; .arch aarch64 ; orr W(rd), W(rn), W(rm)),
            (Width::W, RegOp::Eor) => dynasm!(self.ops ; .arch aarch64 ; eor W(rd), W(rn), W(rm)),
            (Width::W, RegOp::Orn) => dynasm!(self.ops ; .arch aarch64 ; orn W(rd), W(rn), W(rm)),
            (Width::X, RegOp::Add) => dynasm!(self.ops ; .arch aarch64 ; add X(rd), X(rn), X(rm)),
            (Width::X, RegOp::Sub) => dynasm!(self.ops ; .arch aarch64 ; sub X(rd), X(rn), X(rm)),
            (Width::X, RegOp::And) => dynasm!(self.ops ; .arch aarch64 ; and X(rd), X(rn), X(rm)),
            (Width::X, RegOp::Orr) => dynasm!(self.ops ; .arch aarch64 ; orr X(rd), X(rn), X(rm)),
            (Width::X, RegOp::Eor) => dynasm!(self.ops ; .arch aarch64 ; eor X(rd), X(rn), X(rm)),
            (Width::X, RegOp::Orn) => dynasm!(self.ops ; .arch aarch64 ; orn X(rd), X(rn), X(rm)),
        }
    }

    /// `mov xd, xs`.
    pub fn mov_x(&mut self, dst: u8, src: u8) {
        self.reg_op(Width::X, RegOp::Orr, dst, ZR, src);
    }

    /// `extr xd, xn, xm, #lsb`; `ror xd, xs, #lsb` when n == m.
    pub fn extr(&mut self, dst: u8, high: u8, low: u8, lsb: u32) {
        let (rd, rn, rm, lsb) = (u32::from(dst), u32::from(high), u32::from(low), lsb & 0x3F);
        dynasm!(self.ops
            ; .arch aarch64
            ; extr X(rd), X(rn), X(rm), #lsb
        );
    }

    /// `cmp wn, wm`.
    pub fn cmp_w(&mut self, left: u8, right: u8) {
        let (rn, rm) = (u32::from(left), u32::from(right));
        dynasm!(self.ops
            ; .arch aarch64
            ; cmp W(rn), W(rm)
        );
    }

    /// `ldrb wt, [xn, xm]`.
    pub fn ldrb_indexed(&mut self, dst: u8, base: u8, index: u8) {
        let (rt, rn, rm) = (u32::from(dst), u32::from(base), u32::from(index));
        dynasm!(self.ops
            ; .arch aarch64
            ; ldrb W(rt), [X(rn), X(rm)]
        );
    }

    /// `strb wt, [xn, xm]`.
    pub fn strb_indexed(&mut self, src: u8, base: u8, index: u8) {
        let (rt, rn, rm) = (u32::from(src), u32::from(base), u32::from(index));
        dynasm!(self.ops
            ; .arch aarch64
            ; strb W(rt), [X(rn), X(rm)]
        );
    }

    /// `ldrb wt, [xn]`.
    pub fn ldrb(&mut self, dst: u8, base: u8) {
        let (rt, rn) = (u32::from(dst), u32::from(base));
        dynasm!(self.ops
            ; .arch aarch64
            ; ldrb W(rt), [X(rn)]
        );
    }

    /// `ldrb wt, [xn], #1`.
    pub fn ldrb_post_inc(&mut self, dst: u8, base: u8) {
        let (rt, rn) = (u32::from(dst), u32::from(base));
        dynasm!(self.ops
            ; .arch aarch64
            ; ldrb W(rt), [X(rn)], #1
        );
    }

    /// `ldrh wt, [xn]`.
    pub fn ldrh(&mut self, dst: u8, base: u8) {
        let (rt, rn) = (u32::from(dst), u32::from(base));
        dynasm!(self.ops
            ; .arch aarch64
            ; ldrh W(rt), [X(rn)]
        );
    }

    /// `strb wt, [xn]`.
    pub fn strb(&mut self, src: u8, base: u8) {
        let (rt, rn) = (u32::from(src), u32::from(base));
        dynasm!(self.ops
            ; .arch aarch64
            ; strb W(rt), [X(rn)]
        );
    }

    /// `stp xt1, xt2, [sp, #-16]!`.
    pub fn push_pair(&mut self, first: u8, second: u8) {
        let (rt, rt2) = (u32::from(first), u32::from(second));
        dynasm!(self.ops
            ; .arch aarch64
            ; stp X(rt), X(rt2), [sp, #-16]!
        );
    }

    /// `ldp xt1, xt2, [sp], #16`.
    pub fn pop_pair(&mut self, first: u8, second: u8) {
        let (rt, rt2) = (u32::from(first), u32::from(second));
        dynasm!(self.ops
            ; .arch aarch64
            ; ldp X(rt), X(rt2), [sp], #16
        );
    }

    /// `adr xd, label`.
    pub fn adr(&mut self, dst: AsmReg, label: DynamicLabel) {
        let rd = u32::from(dst.id);
        dynasm!(self.ops
            ; .arch aarch64
            ; adr X(rd), =>label
        );
    }

    pub fn b(&mut self, label: DynamicLabel) {
        dynasm!(self.ops
            ; .arch aarch64
            ; b =>label
        );
    }

    pub fn b_eq(&mut self, label: DynamicLabel) {
        dynasm!(self.ops
            ; .arch aarch64
            ; b.eq =>label
        );
    }

    pub fn b_ne(&mut self, label: DynamicLabel) {
        dynasm!(self.ops
            ; .arch aarch64
            ; b.ne =>label
        );
    }

    /// `cbnz xt, label`.
    pub fn cbnz(&mut self, reg: u8, label: DynamicLabel) {
        let rt = u32::from(reg);
        dynasm!(self.ops
            ; .arch aarch64
            ; cbnz X(rt), =>label
        );
    }

    /// `br xn`.
    pub fn br(&mut self, reg: u8) {
        let rn = u32::from(reg);
        dynasm!(self.ops
            ; .arch aarch64
            ; br X(rn)
        );
    }

    /// `dsb ish; isb`.
    pub fn barrier(&mut self) {
        dynasm!(self.ops
            ; .arch aarch64
            ; dsb ish
            ; isb
        );
    }

    /// Clean and invalidate the cache lines holding `[start, start + last]` to the point of
    /// unification, then synchronize the instruction stream. `last` must hold the offset of
    /// the final byte and is clobbered together with `scratch`.
    pub fn sync_range(&mut self, start: u8, last: u8, scratch: u8) {
        let (rp, rc, rs) = (u32::from(start), u32::from(last), u32::from(scratch));
        let stride = CACHE_SYNC_STRIDE;
        let top = self.new_label();
        dynasm!(self.ops
            ; .arch aarch64
            ; =>top
            ; add X(rs), X(rp), X(rc)
            ; dc cvau, X(rs)
            ; dsb ish
            ; ic ivau, X(rs)
            ; sub XSP(rc), XSP(rc), #stride
            ; tbz X(rc), #63, =>top
            ; dc cvau, X(rp)
            ; dsb ish
            ; ic ivau, X(rp)
        );
        self.barrier();
    }

    /// Make `len` freshly written bytes at `start` visible to instruction fetch.
    pub fn sync_instruction_cache(&mut self, start: AsmReg, counter: AsmReg, scratch: AsmReg, len: u32) {
        if let Some(last) = len.checked_sub(1) {
            self.mov_u32(counter, last);
            self.sync_range(start.id, counter.id, scratch.id);
        } else {
            self.barrier();
        }
    }

    /// Bind the payload label and assemble.
    pub fn finalize(mut self) -> Result<Vec<u8>, EncodingError> {
        let payload = self.payload;
        self.bind(payload);
        self.ops.finalize().map_err(asm_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    #[test]
    fn test_known_encodings() {
        let mut encoder = A64Encoder::new();
        encoder.mov_u32(AsmReg::new(2), 0x0001_1234);
        encoder.sub_imm(2, 2, 1);
        encoder.ldrb_indexed(4, 1, 2);
        encoder.strb_indexed(4, 1, 2);
        encoder.reg_op(Width::W, RegOp::Eor, 4, 4, 3);
        encoder.mov_x(5, 5);
        encoder.push_pair(1, 2);
        encoder.pop_pair(1, 2);
        let code = encoder.finalize().unwrap();
        assert_eq!(
            words(&code),
            vec![
                0x5282_4682, // movz w2, #0x1234
                0x72A0_0022, // movk w2, #1, lsl #16
                0xD100_0442, // sub x2, x2, #1
                0x3862_6824, // ldrb w4, [x1, x2]
                0x3822_6824, // strb w4, [x1, x2]
                0x4A03_0084, // eor w4, w4, w3
                0xAA05_03E5, // mov x5, x5
                0xA9BF_0BE1, // stp x1, x2, [sp, #-16]!
                0xA8C1_0BE1, // ldp x1, x2, [sp], #16
            ]
        );
    }

    #[test]
    fn test_adr_reaches_payload_label() {
        let mut encoder = A64Encoder::new();
        let payload = encoder.payload_label();
        encoder.adr(AsmReg::new(1), payload);
        for _ in 0..15 {
            encoder.nop();
        }
        let code = encoder.finalize().unwrap();
        // adr x1, #0x40
        assert_eq!(words(&code)[0], 0x1000_0201);
        assert_eq!(code.len(), 0x40);
    }

    #[test]
    fn test_backward_branches() {
        let mut encoder = A64Encoder::new();
        let top = encoder.new_label();
        encoder.bind(top);
        encoder.nop();
        encoder.cbnz(2, top);
        let code = encoder.finalize().unwrap();
        // cbnz x2, #-4
        assert_eq!(words(&code)[1], 0xB5FF_FFE2);
    }

    #[test]
    fn test_cache_sync_shape() {
        let mut encoder = A64Encoder::new();
        encoder.sync_instruction_cache(AsmReg::new(1), AsmReg::new(2), AsmReg::new(4), 9);
        let code = words(&encoder.finalize().unwrap());
        // movz, movk, 6-word loop, 3-word tail, dsb, isb
        assert_eq!(code.len(), 13);
        assert_eq!(code[3], 0xD50B_7B24); // dc cvau, x4
        assert_eq!(code[5], 0xD50B_7524); // ic ivau, x4
        assert_eq!(code[11], 0xD503_3B9F); // dsb ish
        assert_eq!(code[12], 0xD503_3FDF); // isb

        let mut empty = A64Encoder::new();
        empty.sync_instruction_cache(AsmReg::new(1), AsmReg::new(2), AsmReg::new(4), 0);
        assert_eq!(empty.finalize().unwrap().len(), 8);
    }

    #[test]
    fn test_data_words_are_little_endian() {
        let mut encoder = A64Encoder::new();
        encoder.word(0xD503_201F);
        assert_eq!(encoder.position(), 4);
        assert_eq!(encoder.finalize().unwrap(), vec![0x1F, 0x20, 0x03, 0xD5]);
    }
}
