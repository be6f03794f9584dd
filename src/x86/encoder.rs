// This module wraps iced-x86's CodeAssembler for decoder stub emission in both 64-bit and
// 32-bit mode. X86Encoder converts AsmReg ids into iced registers of the right width for the
// configured bitness and exposes exactly the instruction shapes a stub needs: immediate loads
// of the counter and key, the position-independent payload address sequences (a RIP-relative
// lea of the payload label in long mode, call/pop/add in protected mode), the test-at-bottom
// decode loop with byte memory operands, register and flags save/restore, and the
// register-only operations junk is built from. The payload label is bound to a zero-byte
// instruction after the last emitted one. Address materialisations are tagged with labels so
// that the assembled result can report their offsets back to the layout resolver through
// label_ip. Everything is assembled at ip 0, so label addresses are stub-relative offsets.

//! x86 instruction encoding using iced-x86.

use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, IcedError};

use super::registers::{gp32, gp64, gp8};
use crate::core::error::EncodingError;
use crate::core::register_file::{AsmReg, RegBitSet};
use crate::core::transform::FeedbackOp;

pub(crate) fn asm_error(e: IcedError) -> EncodingError {
    EncodingError::Assembler(e.to_string())
}

/// Native-width register: 64-bit in long mode, 32-bit otherwise.
#[derive(Debug, Clone, Copy)]
enum Native {
    R64(AsmRegister64),
    R32(AsmRegister32),
}

/// Run `$body` with `$r` bound to the native-width form of `$reg`.
macro_rules! with_native {
    ($self:ident, $reg:expr, |$r:ident| $body:expr) => {
        match $self.native($reg)? {
            Native::R64($r) => $body,
            Native::R32($r) => $body,
        }
    };
}

/// Two-operand register op on the same native-width register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegRegOp {
    Mov,
    Xchg,
    Test,
    Cmp,
    Or,
    And,
}

/// Register-immediate op on a native-width register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegImmOp {
    Add,
    Sub,
    Xor,
    Or,
    Rol,
    Ror,
}

/// Single-operand op on a native-width register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Inc,
    Dec,
}

/// Dword memory op at `[base + disp]`; rotate counts are taken mod 32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwordOp {
    Xor(u32),
    Add(u32),
    Sub(u32),
    Rol(u32),
    Ror(u32),
    Not,
}

/// Flags-only instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOp {
    Clc,
    Stc,
    Cmc,
    Cld,
}

/// x86 stub encoder for one bitness.
pub struct X86Encoder {
    assembler: CodeAssembler,
    bitness: u32,
    /// Label in front of each address materialisation, by fixup index.
    anchors: Vec<Option<CodeLabel>>,
    /// Bound to the first byte after the emitted code.
    payload: CodeLabel,
}

impl X86Encoder {
    /// Create an encoder for 64- or 32-bit code.
    pub fn new(bitness: u32) -> Result<Self, EncodingError> {
        let mut assembler = CodeAssembler::new(bitness).map_err(asm_error)?;
        let payload = assembler.create_label();
        Ok(Self {
            assembler,
            bitness,
            anchors: Vec::new(),
            payload,
        })
    }

    pub fn bitness(&self) -> u32 {
        self.bitness
    }

    /// Label bound to the first byte after the emitted code.
    pub fn payload_label(&self) -> CodeLabel {
        self.payload
    }

    pub fn create_label(&mut self) -> CodeLabel {
        self.assembler.create_label()
    }

    /// Bind `label` to the next emitted byte.
    pub fn bind(&mut self, label: &mut CodeLabel) -> Result<(), EncodingError> {
        self.assembler.set_label(label).map_err(asm_error)?;
        self.assembler.zero_bytes().map_err(asm_error)
    }

    /// `jmp label`.
    pub fn jmp(&mut self, label: CodeLabel) -> Result<(), EncodingError> {
        self.assembler.jmp(label).map_err(asm_error)
    }

    /// `jcc label` for condition code `condition` (0..=15, x86 encoding order).
    pub fn jcc(&mut self, condition: u8, label: CodeLabel) -> Result<(), EncodingError> {
        let a = &mut self.assembler;
        match condition & 0x0F {
            0x0 => a.jo(label),
            0x1 => a.jno(label),
            0x2 => a.jb(label),
            0x3 => a.jae(label),
            0x4 => a.je(label),
            0x5 => a.jne(label),
            0x6 => a.jbe(label),
            0x7 => a.ja(label),
            0x8 => a.js(label),
            0x9 => a.jns(label),
            0xA => a.jp(label),
            0xB => a.jnp(label),
            0xC => a.jl(label),
            0xD => a.jge(label),
            0xE => a.jle(label),
            _ => a.jg(label),
        }
        .map_err(asm_error)
    }

    /// `call label`, always the five-byte rel32 form.
    pub fn call(&mut self, label: CodeLabel) -> Result<(), EncodingError> {
        self.assembler.call(label).map_err(asm_error)
    }

    /// `pop reg` at native width.
    pub fn pop_native(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        with_native!(self, reg, |r| self.assembler.pop(r).map_err(asm_error))
    }

    /// `jmp reg` at native width.
    pub fn jmp_native(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        with_native!(self, reg, |r| self.assembler.jmp(r).map_err(asm_error))
    }

    /// `op dword [base + disp]`.
    pub fn dword_op(&mut self, op: DwordOp, base: AsmReg, disp: i32) -> Result<(), EncodingError> {
        with_native!(self, base, |r| {
            let mem = dword_ptr(r + disp);
            match op {
                DwordOp::Xor(k) => self.assembler.xor(mem, k as i32),
                DwordOp::Add(k) => self.assembler.add(mem, k as i32),
                DwordOp::Sub(k) => self.assembler.sub(mem, k as i32),
                DwordOp::Rol(n) => self.assembler.rol(mem, (n & 31) as i32),
                DwordOp::Ror(n) => self.assembler.ror(mem, (n & 31) as i32),
                DwordOp::Not => self.assembler.not(mem),
            }
            .map_err(asm_error)
        })
    }

    fn native(&self, reg: AsmReg) -> Result<Native, EncodingError> {
        if self.bitness == 64 {
            gp64(reg).map(Native::R64)
        } else {
            gp32(reg, self.bitness).map(Native::R32)
        }
    }

    fn index_label(&mut self, fixup: usize) -> Result<(), EncodingError> {
        if self.anchors.len() <= fixup {
            self.anchors.resize(fixup + 1, None);
        }
        let mut label = self.assembler.create_label();
        self.assembler.set_label(&mut label).map_err(asm_error)?;
        self.anchors[fixup] = Some(label);
        Ok(())
    }

    /// `mov r32, len` (zero-extends in long mode).
    pub fn load_counter(&mut self, reg: AsmReg, len: u32) -> Result<(), EncodingError> {
        let dst = gp32(reg, self.bitness)?;
        self.assembler.mov(dst, len as i32).map_err(asm_error)?;
        Ok(())
    }

    /// `mov r8, key`.
    pub fn load_key(&mut self, reg: AsmReg, key: u8) -> Result<(), EncodingError> {
        let dst = gp8(reg, self.bitness)?;
        self.assembler.mov(dst, key as i8 as i32).map_err(asm_error)?;
        Ok(())
    }

    /// Load the payload start address into `reg`.
    ///
    /// Long mode: `lea reg, [rip+payload]`, resolved by the assembler; the anchor
    /// is the lea itself. Protected mode: `call $+5; pop reg; add reg, payload -
    /// anchor` where the anchor is the pop and both offsets come from the previous
    /// lowering.
    pub fn load_payload_address(
        &mut self,
        reg: AsmReg,
        fixup: usize,
        payload_offset: usize,
        anchor: usize,
    ) -> Result<(), EncodingError> {
        if self.bitness == 64 {
            self.index_label(fixup)?;
            self.assembler.lea(gp64(reg)?, ptr(self.payload)).map_err(asm_error)?;
        } else {
            let dst = gp32(reg, self.bitness)?;
            let mut next = self.assembler.create_label();
            self.assembler.call(next).map_err(asm_error)?;
            self.assembler.set_label(&mut next).map_err(asm_error)?;
            self.anchors.resize(self.anchors.len().max(fixup + 1), None);
            self.anchors[fixup] = Some(next);
            self.assembler.pop(dst).map_err(asm_error)?;
            let delta = payload_offset as i64 - anchor as i64;
            let delta = i32::try_from(delta)
                .map_err(|_| EncodingError::UnsupportedOperand { operation: "payload delta" })?;
            self.assembler.add(dst, delta).map_err(asm_error)?;
        }
        Ok(())
    }

    /// Emit the test-at-bottom loop undoing one pass whose forward operator is `op`.
    pub fn decode_loop(
        &mut self,
        op: FeedbackOp,
        pointer: AsmReg,
        counter: AsmReg,
        key: AsmReg,
    ) -> Result<(), EncodingError> {
        let key8 = gp8(key, self.bitness)?;
        let count32 = gp32(counter, self.bitness)?;
        let mut top = self.assembler.create_label();
        let mut cond = self.assembler.create_label();

        self.assembler.jmp(cond).map_err(asm_error)?;
        self.assembler.set_label(&mut top).map_err(asm_error)?;
        self.assembler.dec(count32).map_err(asm_error)?;

        let mem = if self.bitness == 64 {
            byte_ptr(gp64(pointer)? + gp64(counter)?)
        } else {
            byte_ptr(gp32(pointer, self.bitness)? + count32)
        };
        match op.inverse() {
            FeedbackOp::Xor => self.assembler.xor(mem, key8),
            FeedbackOp::Add => self.assembler.add(mem, key8),
            FeedbackOp::Sub => self.assembler.sub(mem, key8),
        }
        .map_err(asm_error)?;
        self.assembler.add(key8, mem).map_err(asm_error)?;

        self.assembler.set_label(&mut cond).map_err(asm_error)?;
        self.assembler.test(count32, count32).map_err(asm_error)?;
        self.assembler.jnz(top).map_err(asm_error)?;
        Ok(())
    }

    /// Push the flags register, then every register in `regs` in ascending order.
    pub fn save(&mut self, regs: RegBitSet) -> Result<(), EncodingError> {
        if self.bitness == 64 {
            self.assembler.pushfq().map_err(asm_error)?;
        } else {
            self.assembler.pushfd().map_err(asm_error)?;
        }
        for reg in regs.iter() {
            with_native!(self, reg, |r| self.assembler.push(r).map_err(asm_error)?);
        }
        Ok(())
    }

    /// Exact inverse of [`X86Encoder::save`].
    pub fn restore(&mut self, regs: RegBitSet) -> Result<(), EncodingError> {
        let ordered: Vec<AsmReg> = regs.iter().collect();
        for reg in ordered.into_iter().rev() {
            with_native!(self, reg, |r| self.assembler.pop(r).map_err(asm_error)?);
        }
        if self.bitness == 64 {
            self.assembler.popfq().map_err(asm_error)?;
        } else {
            self.assembler.popfd().map_err(asm_error)?;
        }
        Ok(())
    }

    pub fn nop(&mut self) -> Result<(), EncodingError> {
        self.assembler.nop().map_err(asm_error)
    }

    pub fn flag_op(&mut self, op: FlagOp) -> Result<(), EncodingError> {
        match op {
            FlagOp::Clc => self.assembler.clc(),
            FlagOp::Stc => self.assembler.stc(),
            FlagOp::Cmc => self.assembler.cmc(),
            FlagOp::Cld => self.assembler.cld(),
        }
        .map_err(asm_error)
    }

    /// `op reg, reg`.
    pub fn reg_reg(&mut self, op: RegRegOp, reg: AsmReg) -> Result<(), EncodingError> {
        with_native!(self, reg, |r| match op {
            RegRegOp::Mov => self.assembler.mov(r, r),
            RegRegOp::Xchg => self.assembler.xchg(r, r),
            RegRegOp::Test => self.assembler.test(r, r),
            RegRegOp::Cmp => self.assembler.cmp(r, r),
            RegRegOp::Or => self.assembler.or(r, r),
            RegRegOp::And => self.assembler.and(r, r),
        }
        .map_err(asm_error))
    }

    /// `lea reg, [reg+0]`.
    pub fn lea_self(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        with_native!(self, reg, |r| self.assembler.lea(r, r + 0).map_err(asm_error))
    }

    /// `op reg, imm`.
    pub fn reg_imm(&mut self, op: RegImmOp, reg: AsmReg, imm: i32) -> Result<(), EncodingError> {
        with_native!(self, reg, |r| match op {
            RegImmOp::Add => self.assembler.add(r, imm),
            RegImmOp::Sub => self.assembler.sub(r, imm),
            RegImmOp::Xor => self.assembler.xor(r, imm),
            RegImmOp::Or => self.assembler.or(r, imm),
            RegImmOp::Rol => self.assembler.rol(r, imm),
            RegImmOp::Ror => self.assembler.ror(r, imm),
        }
        .map_err(asm_error))
    }

    pub fn unary(&mut self, op: UnaryOp, reg: AsmReg) -> Result<(), EncodingError> {
        with_native!(self, reg, |r| match op {
            UnaryOp::Not => self.assembler.not(r),
            UnaryOp::Neg => self.assembler.neg(r),
            UnaryOp::Inc => self.assembler.inc(r),
            UnaryOp::Dec => self.assembler.dec(r),
        }
        .map_err(asm_error))
    }

    /// Raw bytes.
    pub fn db(&mut self, bytes: &[u8]) -> Result<(), EncodingError> {
        self.assembler.db(bytes).map_err(asm_error)
    }

    fn bind_payload(&mut self) -> Result<(), EncodingError> {
        let mut payload = self.payload;
        self.bind(&mut payload)?;
        self.payload = payload;
        Ok(())
    }

    /// Bind the payload label and assemble at ip 0; returns the code and the
    /// anchor offset of every fixup.
    pub fn finalize(mut self, fixups: usize) -> Result<(Vec<u8>, Vec<usize>), EncodingError> {
        self.bind_payload()?;
        let result = self
            .assembler
            .assemble_options(0, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)
            .map_err(asm_error)?;

        let mut anchors = Vec::with_capacity(fixups);
        for index in 0..fixups {
            let label = self
                .anchors
                .get(index)
                .copied()
                .flatten()
                .ok_or(EncodingError::UnsupportedOperand { operation: "unplaced address fixup" })?;
            let ip = result.label_ip(&label).map_err(asm_error)?;
            anchors.push(ip as usize);
        }
        Ok((result.inner.code_buffer, anchors))
    }

    /// Bind the payload label and assemble at ip 0 without fixups.
    pub fn finalize_code(mut self) -> Result<Vec<u8>, EncodingError> {
        self.bind_payload()?;
        self.assembler.assemble(0).map_err(asm_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::registers::{RAX, RCX, RSI};

    #[test]
    fn test_counter_and_key_loads() {
        let mut encoder = X86Encoder::new(64).unwrap();
        encoder.load_counter(RCX, 3).unwrap();
        encoder.load_key(RAX, 0x42).unwrap();
        let code = encoder.finalize_code().unwrap();
        // mov ecx, 3 ; mov al, 0x42
        assert_eq!(code, vec![0xB9, 0x03, 0x00, 0x00, 0x00, 0xB0, 0x42]);
    }

    #[test]
    fn test_rip_relative_lea_reaches_payload_label() {
        let mut encoder = X86Encoder::new(64).unwrap();
        encoder.load_payload_address(RSI, 0, 0, 0).unwrap();
        for _ in 0..0x19 {
            encoder.nop().unwrap();
        }
        let (code, anchors) = encoder.finalize(1).unwrap();
        // lea rsi, [rip+0x19]
        assert_eq!(&code[..7], &[0x48, 0x8D, 0x35, 0x19, 0x00, 0x00, 0x00]);
        assert_eq!(code.len(), 0x20);
        assert_eq!(anchors, vec![0]);
    }

    #[test]
    fn test_label_jumps_pick_short_forms() {
        let mut encoder = X86Encoder::new(64).unwrap();
        let mut skip = encoder.create_label();
        encoder.jcc(0x5, skip).unwrap();
        encoder.db(&[0xCC, 0xCC]).unwrap();
        encoder.bind(&mut skip).unwrap();
        let mut end = encoder.create_label();
        encoder.jmp(end).unwrap();
        encoder.bind(&mut end).unwrap();
        let code = encoder.finalize_code().unwrap();
        // jne +2 ; int3 int3 ; jmp +0
        assert_eq!(code, vec![0x75, 0x02, 0xCC, 0xCC, 0xEB, 0x00]);
    }

    #[test]
    fn test_dword_ops_on_native_base() {
        let mut encoder = X86Encoder::new(64).unwrap();
        encoder.dword_op(DwordOp::Xor(0x1122_3344), AsmReg::new(3), 8).unwrap();
        encoder.dword_op(DwordOp::Not, AsmReg::new(3), 0).unwrap();
        encoder.jmp_native(AsmReg::new(3)).unwrap();
        let code = encoder.finalize_code().unwrap();
        // xor dword [rbx+8], 0x11223344 ; not dword [rbx] ; jmp rbx
        assert_eq!(
            code,
            vec![0x81, 0x73, 0x08, 0x44, 0x33, 0x22, 0x11, 0xF7, 0x13, 0xFF, 0xE3]
        );
    }

    #[test]
    fn test_call_over_data_then_pop() {
        let mut encoder = X86Encoder::new(32).unwrap();
        let mut over = encoder.create_label();
        encoder.call(over).unwrap();
        encoder.db(&[0xAA, 0xBB]).unwrap();
        encoder.bind(&mut over).unwrap();
        encoder.pop_native(AsmReg::new(7)).unwrap();
        let code = encoder.finalize_code().unwrap();
        // call $+7 ; data ; pop edi
        assert_eq!(code, vec![0xE8, 0x02, 0x00, 0x00, 0x00, 0xAA, 0xBB, 0x5F]);
    }

    #[test]
    fn test_get_pc_anchor_is_pop() {
        let mut encoder = X86Encoder::new(32).unwrap();
        encoder.nop().unwrap();
        encoder.load_payload_address(RSI, 0, 0x40, 6).unwrap();
        let (code, anchors) = encoder.finalize(1).unwrap();
        // nop ; call $+5 ; pop esi ; add esi, 0x3a
        assert_eq!(&code[..7], &[0x90, 0xE8, 0x00, 0x00, 0x00, 0x00, 0x5E]);
        assert_eq!(anchors, vec![6]);
    }

    #[test]
    fn test_save_restore_symmetry() {
        let regs = RegBitSet::from_regs(&[RAX, RSI, AsmReg::new(12)]);
        let mut encoder = X86Encoder::new(64).unwrap();
        encoder.save(regs).unwrap();
        encoder.restore(regs).unwrap();
        let code = encoder.finalize_code().unwrap();
        // pushfq push rax push rsi push r12 pop r12 pop rsi pop rax popfq
        assert_eq!(
            code,
            vec![0x9C, 0x50, 0x56, 0x41, 0x54, 0x41, 0x5C, 0x5E, 0x58, 0x9D]
        );
    }

    #[test]
    fn test_decode_loop_assembles() {
        for op in FeedbackOp::ALL {
            for bitness in [32, 64] {
                let mut encoder = X86Encoder::new(bitness).unwrap();
                encoder.decode_loop(op, RSI, RCX, RAX).unwrap();
                encoder.nop().unwrap();
                let code = encoder.finalize_code().unwrap();
                assert!(code.len() > 8);
            }
        }
    }
}
