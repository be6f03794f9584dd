// x86 interpreter for decoder stubs in 64- and 32-bit mode. Instructions are decoded with
// iced-x86 straight from the emulated image and dispatched on their mnemonic; operands are
// read and written through the generic register/memory/immediate accessors so one arm covers
// every operand shape a stub uses. CF, PF, ZF, SF, OF and DF are modelled and round-trip
// through pushf/popf; AF is not tracked. Near direct branches and register-indirect jumps are
// followed; scasb is the only string instruction.

//! x86 stub interpreter.

use std::ops::Range;

use iced_x86::{ConditionCode, Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind, Register};

use super::{check_payload, entry_pattern, EmulationError, EmulationOutcome, Memory, IMAGE_BASE, STACK_TOP};
use crate::x86::registers::register_id;

const CF: u64 = 1 << 0;
const FIXED: u64 = 1 << 1;
const PF: u64 = 1 << 2;
const ZF: u64 = 1 << 6;
const SF: u64 = 1 << 7;
const DF: u64 = 1 << 10;
const OF: u64 = 1 << 11;
const MODELLED: u64 = CF | PF | ZF | SF | DF | OF;

const RAX_ID: usize = 0;
const RSP_ID: usize = 4;
const RDI_ID: usize = 7;

fn width_mask(bits: usize) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

struct X86Cpu {
    bitness: u32,
    regs: [u64; 16],
    rip: u64,
    rflags: u64,
    memory: Memory,
}

impl X86Cpu {
    fn new(bitness: u32, image: &[u8]) -> Self {
        let native = width_mask(bitness as usize);
        let mut regs = [0u64; 16];
        let count = if bitness == 64 { 16 } else { 8 };
        for (index, reg) in regs.iter_mut().enumerate().take(count) {
            *reg = entry_pattern(index) & native;
        }
        regs[RSP_ID] = STACK_TOP;
        Self {
            bitness,
            regs,
            rip: IMAGE_BASE,
            rflags: FIXED | PF | ZF,
            memory: Memory::new(image),
        }
    }

    fn native_bits(&self) -> usize {
        self.bitness as usize
    }

    fn unsupported(&self, instruction: &Instruction) -> EmulationError {
        EmulationError::Unsupported {
            pc: instruction.ip(),
            instruction: instruction.to_string(),
        }
    }

    fn flag(&self, bit: u64) -> bool {
        self.rflags & bit != 0
    }

    fn set_flag(&mut self, bit: u64, value: bool) {
        if value {
            self.rflags |= bit;
        } else {
            self.rflags &= !bit;
        }
    }

    fn set_result_flags(&mut self, result: u64, bits: usize) {
        self.set_flag(ZF, result & width_mask(bits) == 0);
        self.set_flag(SF, result & (1u64 << (bits - 1)) != 0);
        self.set_flag(PF, (result as u8).count_ones() % 2 == 0);
    }

    fn fetch(&self) -> Result<Instruction, EmulationError> {
        let bytes = self.memory.fetch(self.rip).ok_or(EmulationError::Fault {
            pc: self.rip,
            reason: "instruction fetch outside the image",
        })?;
        let mut decoder = Decoder::with_ip(self.bitness, bytes, self.rip, DecoderOptions::NONE);
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(EmulationError::Unsupported {
                pc: self.rip,
                instruction: "invalid encoding".to_string(),
            });
        }
        Ok(instruction)
    }

    fn read_register(&self, instruction: &Instruction, register: Register) -> Result<u64, EmulationError> {
        let id = register_id(register).ok_or_else(|| self.unsupported(instruction))?;
        Ok(self.regs[id] & width_mask(register.size() * 8))
    }

    fn write_register(&mut self, instruction: &Instruction, register: Register, value: u64) -> Result<(), EmulationError> {
        let id = register_id(register).ok_or_else(|| self.unsupported(instruction))?;
        let native = width_mask(self.native_bits());
        self.regs[id] = match register.size() {
            8 => value,
            4 => value & 0xFFFF_FFFF,
            2 => (self.regs[id] & !0xFFFF) | (value & 0xFFFF),
            1 => (self.regs[id] & !0xFF) | (value & 0xFF),
            _ => return Err(self.unsupported(instruction)),
        } & native;
        Ok(())
    }

    fn effective_address(&self, instruction: &Instruction) -> Result<u64, EmulationError> {
        let base = instruction.memory_base();
        if matches!(base, Register::RIP | Register::EIP) {
            return Ok(instruction.memory_displacement64());
        }
        let mut address = instruction.memory_displacement64();
        if base != Register::None {
            address = address.wrapping_add(self.read_register(instruction, base)?);
        }
        let index = instruction.memory_index();
        if index != Register::None {
            let scaled = self
                .read_register(instruction, index)?
                .wrapping_mul(u64::from(instruction.memory_index_scale()));
            address = address.wrapping_add(scaled);
        }
        Ok(address & width_mask(self.native_bits()))
    }

    fn operand_bits(&self, instruction: &Instruction, operand: u32) -> usize {
        match instruction.op_kind(operand) {
            OpKind::Register => instruction.op_register(operand).size() * 8,
            OpKind::Memory => instruction.memory_size().size() * 8,
            _ => self.native_bits(),
        }
    }

    fn read_operand(&mut self, instruction: &Instruction, operand: u32) -> Result<u64, EmulationError> {
        match instruction.op_kind(operand) {
            OpKind::Register => self.read_register(instruction, instruction.op_register(operand)),
            OpKind::Memory => {
                let address = self.effective_address(instruction)?;
                self.memory.read(address, instruction.memory_size().size())
            }
            OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Ok(instruction.immediate(operand)),
            _ => Err(self.unsupported(instruction)),
        }
    }

    fn write_operand(&mut self, instruction: &Instruction, operand: u32, value: u64) -> Result<(), EmulationError> {
        match instruction.op_kind(operand) {
            OpKind::Register => self.write_register(instruction, instruction.op_register(operand), value),
            OpKind::Memory => {
                let address = self.effective_address(instruction)?;
                self.memory.write(address, instruction.memory_size().size(), value)
            }
            _ => Err(self.unsupported(instruction)),
        }
    }

    fn push(&mut self, value: u64) -> Result<(), EmulationError> {
        let size = self.native_bits() / 8;
        let sp = self.regs[RSP_ID].wrapping_sub(size as u64) & width_mask(self.native_bits());
        self.memory.write(sp, size, value)?;
        self.regs[RSP_ID] = sp;
        Ok(())
    }

    fn pop(&mut self) -> Result<u64, EmulationError> {
        let size = self.native_bits() / 8;
        let sp = self.regs[RSP_ID];
        let value = self.memory.read(sp, size)?;
        self.regs[RSP_ID] = sp.wrapping_add(size as u64) & width_mask(self.native_bits());
        Ok(value)
    }

    fn condition(&self, instruction: &Instruction) -> Result<bool, EmulationError> {
        let (cf, zf, sf, of, pf) = (
            self.flag(CF),
            self.flag(ZF),
            self.flag(SF),
            self.flag(OF),
            self.flag(PF),
        );
        Ok(match instruction.condition_code() {
            ConditionCode::o => of,
            ConditionCode::no => !of,
            ConditionCode::b => cf,
            ConditionCode::ae => !cf,
            ConditionCode::e => zf,
            ConditionCode::ne => !zf,
            ConditionCode::be => cf || zf,
            ConditionCode::a => !cf && !zf,
            ConditionCode::s => sf,
            ConditionCode::ns => !sf,
            ConditionCode::p => pf,
            ConditionCode::np => !pf,
            ConditionCode::l => sf != of,
            ConditionCode::ge => sf == of,
            ConditionCode::le => zf || sf != of,
            ConditionCode::g => !zf && sf == of,
            _ => return Err(self.unsupported(instruction)),
        })
    }

    fn alu(&mut self, mnemonic: Mnemonic, left: u64, right: u64, bits: usize) -> u64 {
        let mask = width_mask(bits);
        let sign = 1u64 << (bits - 1);
        let (left, right) = (left & mask, right & mask);
        let (result, cf, of) = match mnemonic {
            Mnemonic::Add => {
                let result = left.wrapping_add(right) & mask;
                let carry = u128::from(left) + u128::from(right) > u128::from(mask);
                (result, carry, (left ^ result) & (right ^ result) & sign != 0)
            }
            Mnemonic::Sub | Mnemonic::Cmp => {
                let result = left.wrapping_sub(right) & mask;
                (result, left < right, (left ^ right) & (left ^ result) & sign != 0)
            }
            Mnemonic::Xor => (left ^ right, false, false),
            Mnemonic::Or => (left | right, false, false),
            _ => (left & right, false, false),
        };
        self.set_flag(CF, cf);
        self.set_flag(OF, of);
        self.set_result_flags(result, bits);
        result
    }

    fn rotate(&mut self, rotate_left: bool, value: u64, count: u64, bits: usize) -> u64 {
        let mask = width_mask(bits);
        let count = (count % bits as u64) as u32;
        let value = value & mask;
        let result = if count == 0 {
            value
        } else if rotate_left {
            ((value << count) | (value >> (bits as u32 - count))) & mask
        } else {
            ((value >> count) | (value << (bits as u32 - count))) & mask
        };
        let msb = result >> (bits - 1) & 1 != 0;
        if rotate_left {
            let cf = result & 1 != 0;
            self.set_flag(CF, cf);
            self.set_flag(OF, msb ^ cf);
        } else {
            let next = result >> (bits - 2) & 1 != 0;
            self.set_flag(CF, msb);
            self.set_flag(OF, msb ^ next);
        }
        result
    }

    fn execute(&mut self, instruction: &Instruction) -> Result<(), EmulationError> {
        match instruction.mnemonic() {
            Mnemonic::Nop => {}
            Mnemonic::Clc => self.set_flag(CF, false),
            Mnemonic::Stc => self.set_flag(CF, true),
            Mnemonic::Cmc => self.set_flag(CF, !self.flag(CF)),
            Mnemonic::Cld => self.set_flag(DF, false),
            Mnemonic::Mov => {
                let value = self.read_operand(instruction, 1)?;
                self.write_operand(instruction, 0, value)?;
            }
            Mnemonic::Xchg => {
                let first = self.read_operand(instruction, 0)?;
                let second = self.read_operand(instruction, 1)?;
                self.write_operand(instruction, 0, second)?;
                self.write_operand(instruction, 1, first)?;
            }
            Mnemonic::Lea => {
                let address = self.effective_address(instruction)?;
                self.write_operand(instruction, 0, address)?;
            }
            mnemonic @ (Mnemonic::Add
            | Mnemonic::Sub
            | Mnemonic::Xor
            | Mnemonic::Or
            | Mnemonic::And
            | Mnemonic::Cmp
            | Mnemonic::Test) => {
                let bits = self.operand_bits(instruction, 0);
                let left = self.read_operand(instruction, 0)?;
                let right = self.read_operand(instruction, 1)?;
                let result = self.alu(mnemonic, left, right, bits);
                if !matches!(mnemonic, Mnemonic::Cmp | Mnemonic::Test) {
                    self.write_operand(instruction, 0, result)?;
                }
            }
            mnemonic @ (Mnemonic::Inc | Mnemonic::Dec) => {
                let bits = self.operand_bits(instruction, 0);
                let value = self.read_operand(instruction, 0)?;
                let carry = self.flag(CF);
                let op = if mnemonic == Mnemonic::Inc { Mnemonic::Add } else { Mnemonic::Sub };
                let result = self.alu(op, value, 1, bits);
                self.set_flag(CF, carry);
                self.write_operand(instruction, 0, result)?;
            }
            Mnemonic::Not => {
                let bits = self.operand_bits(instruction, 0);
                let value = self.read_operand(instruction, 0)?;
                self.write_operand(instruction, 0, !value & width_mask(bits))?;
            }
            Mnemonic::Neg => {
                let bits = self.operand_bits(instruction, 0);
                let value = self.read_operand(instruction, 0)? & width_mask(bits);
                let result = self.alu(Mnemonic::Sub, 0, value, bits);
                self.set_flag(CF, value != 0);
                self.write_operand(instruction, 0, result)?;
            }
            mnemonic @ (Mnemonic::Rol | Mnemonic::Ror) => {
                let bits = self.operand_bits(instruction, 0);
                let value = self.read_operand(instruction, 0)?;
                let count = self.read_operand(instruction, 1)? & if bits == 64 { 0x3F } else { 0x1F };
                if count != 0 {
                    let result = self.rotate(mnemonic == Mnemonic::Rol, value, count, bits);
                    self.write_operand(instruction, 0, result)?;
                }
            }
            Mnemonic::Push => {
                let value = self.read_operand(instruction, 0)?;
                self.push(value)?;
            }
            Mnemonic::Pop => {
                let value = self.pop()?;
                self.write_operand(instruction, 0, value)?;
            }
            Mnemonic::Pushfq | Mnemonic::Pushfd => self.push(self.rflags)?,
            Mnemonic::Popfq | Mnemonic::Popfd => {
                let value = self.pop()?;
                self.rflags = (value & MODELLED) | FIXED;
            }
            Mnemonic::Call if instruction.flow_control() == FlowControl::Call => {
                self.push(self.rip)?;
                self.rip = instruction.near_branch_target();
            }
            Mnemonic::Jmp if instruction.flow_control() == FlowControl::UnconditionalBranch => {
                self.rip = instruction.near_branch_target();
            }
            Mnemonic::Jmp
                if instruction.flow_control() == FlowControl::IndirectBranch
                    && instruction.op_kind(0) == OpKind::Register =>
            {
                self.rip = self.read_operand(instruction, 0)?;
            }
            Mnemonic::Scasb if !instruction.has_rep_prefix() && !instruction.has_repne_prefix() => {
                let native = width_mask(self.native_bits());
                let address = self.regs[RDI_ID] & native;
                let value = self.memory.read(address, 1)?;
                let al = self.regs[RAX_ID];
                self.alu(Mnemonic::Cmp, al, value, 8);
                let step = if self.flag(DF) { u64::MAX } else { 1 };
                self.regs[RDI_ID] = self.regs[RDI_ID].wrapping_add(step) & native;
            }
            _ if instruction.flow_control() == FlowControl::ConditionalBranch => {
                if self.condition(instruction)? {
                    self.rip = instruction.near_branch_target();
                }
            }
            _ => return Err(self.unsupported(instruction)),
        }
        Ok(())
    }
}

/// Interpret `image` in `bitness`-bit mode until control reaches `payload.start`.
pub fn run(
    bitness: u32,
    image: &[u8],
    payload: Range<usize>,
    step_limit: usize,
) -> Result<EmulationOutcome, EmulationError> {
    check_payload(image, &payload)?;

    let mut cpu = X86Cpu::new(bitness, image);
    let entry_regs = cpu.regs;
    let entry_flags = cpu.rflags & MODELLED;
    let payload_start = IMAGE_BASE + payload.start as u64;

    let mut steps = 0;
    while cpu.rip != payload_start {
        if steps == step_limit {
            return Err(EmulationError::StepLimit { limit: step_limit });
        }
        steps += 1;
        let instruction = cpu.fetch()?;
        cpu.rip = instruction.next_ip();
        cpu.execute(&instruction)?;
    }

    Ok(EmulationOutcome {
        payload: cpu.memory.image()[payload].to_vec(),
        registers_preserved: cpu.regs == entry_regs && cpu.rflags & MODELLED == entry_flags,
        icache_coherent: true,
        steps,
    })
}
