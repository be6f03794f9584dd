//! x86 register tables.
//!
//! `AsmReg` ids are hardware encoding numbers (rax=0 ... r15=15), shared by
//! both bitnesses. 32-bit stubs only see ids 0-7.

use iced_x86::code_asm::*;
use iced_x86::Register;

use crate::core::error::EncodingError;
use crate::core::register_file::AsmReg;

pub const RAX: AsmReg = AsmReg::new(0);
pub const RCX: AsmReg = AsmReg::new(1);
pub const RSP: AsmReg = AsmReg::new(4);
pub const RSI: AsmReg = AsmReg::new(6);

pub(crate) const GP64_REGS: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi,
    r8, r9, r10, r11, r12, r13, r14, r15,
];

pub(crate) const GP32_REGS: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi,
    r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];

pub(crate) const GP8_REGS: [AsmRegister8; 16] = [
    al, cl, dl, bl, spl, bpl, sil, dil,
    r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
];

/// Full-width iced registers by id, used when decoding stubs.
pub const FULL_REGS: [Register; 16] = [
    Register::RAX, Register::RCX, Register::RDX, Register::RBX,
    Register::RSP, Register::RBP, Register::RSI, Register::RDI,
    Register::R8, Register::R9, Register::R10, Register::R11,
    Register::R12, Register::R13, Register::R14, Register::R15,
];

/// Every x64 general-purpose register except rsp.
pub const X64_GENERAL: [AsmReg; 15] = [
    AsmReg::new(0), AsmReg::new(1), AsmReg::new(2), AsmReg::new(3),
    AsmReg::new(5), AsmReg::new(6), AsmReg::new(7), AsmReg::new(8),
    AsmReg::new(9), AsmReg::new(10), AsmReg::new(11), AsmReg::new(12),
    AsmReg::new(13), AsmReg::new(14), AsmReg::new(15),
];

/// Every x86 general-purpose register except esp.
pub const X32_GENERAL: [AsmReg; 7] = [
    AsmReg::new(0), AsmReg::new(1), AsmReg::new(2), AsmReg::new(3),
    AsmReg::new(5), AsmReg::new(6), AsmReg::new(7),
];

/// Registers with a low-byte form in 32-bit mode (al, cl, dl, bl).
pub const X32_BYTE_ADDRESSABLE: [AsmReg; 4] = [
    AsmReg::new(0), AsmReg::new(1), AsmReg::new(2), AsmReg::new(3),
];

pub(crate) fn gp64(reg: AsmReg) -> Result<AsmRegister64, EncodingError> {
    GP64_REGS
        .get(reg.id as usize)
        .copied()
        .ok_or(EncodingError::UnsupportedOperand { operation: "64-bit register" })
}

pub(crate) fn gp32(reg: AsmReg, bitness: u32) -> Result<AsmRegister32, EncodingError> {
    if bitness == 32 && reg.id >= 8 {
        return Err(EncodingError::UnsupportedOperand { operation: "32-bit register" });
    }
    GP32_REGS
        .get(reg.id as usize)
        .copied()
        .ok_or(EncodingError::UnsupportedOperand { operation: "32-bit register" })
}

pub(crate) fn gp8(reg: AsmReg, bitness: u32) -> Result<AsmRegister8, EncodingError> {
    // spl/bpl/sil/dil need a REX prefix
    if bitness == 32 && reg.id >= 4 {
        return Err(EncodingError::UnsupportedOperand { operation: "byte register" });
    }
    GP8_REGS
        .get(reg.id as usize)
        .copied()
        .ok_or(EncodingError::UnsupportedOperand { operation: "byte register" })
}

/// Id of a general-purpose register of any width, `None` for ah..bh and non-GPRs.
pub fn register_id(register: Register) -> Option<usize> {
    if matches!(register, Register::AH | Register::CH | Register::DH | Register::BH) {
        return None;
    }
    let full = register.full_register();
    FULL_REGS.iter().position(|candidate| *candidate == full)
}
