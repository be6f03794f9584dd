// AArch64 interpreter for decoders. There is no A64 decoder in the dependency stack, so words
// are matched against the fixed bit patterns of the shapes the encoders emit: wide moves,
// add/sub (immediate, shifted and extended register, with or without flags), logical shifted
// register, extr, adr, b, b.cond, br, cbz/cbnz, tbz/tbnz, register-offset and unsigned-offset byte
// loads and stores, post-indexed ldrb, ldrh, 64-bit ldp/stp, the hint and barrier group, and
// dc cvau / ic ivau. NZCV is compared together with the register file and sp.
//
// Stores into the image are tracked per cache line in a small coherence model: a store leaves
// its line stale, dc cvau cleans it, ic ivau on a cleaned line invalidates the stale copy,
// and isb retires invalidations. Instruction fetch does not consult the model; it only
// reports whether the decoder left anything stale behind.

//! AArch64 decoder interpreter.

use std::ops::Range;

use hashbrown::HashSet;

use super::{check_payload, entry_pattern, EmulationError, EmulationOutcome, Memory, IMAGE_BASE, STACK_TOP};

const NOP: u32 = 0xD503_201F;
const DSB_ISH: u32 = 0xD503_3B9F;
const ISB: u32 = 0xD503_3FDF;
const DC_CVAU: u32 = 0xD50B_7B20;
const IC_IVAU: u32 = 0xD50B_7520;

/// Smallest instruction cache line CTR_EL0 can describe.
const LINE_BYTES: u64 = 4;

const N: u8 = 0b1000;
const Z: u8 = 0b0100;
const C: u8 = 0b0010;
const V: u8 = 0b0001;

fn field(word: u32, shift: u32, bits: u32) -> u32 {
    (word >> shift) & ((1 << bits) - 1)
}

fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Per-line state of rewritten image bytes.
#[derive(Debug, Default)]
struct LineTracker {
    /// Written and not yet cleaned.
    dirty: HashSet<u64>,
    /// Cleaned, still stale in the instruction cache.
    cleaned: HashSet<u64>,
    /// Invalidated, waiting for a context synchronization event.
    invalidated: HashSet<u64>,
}

impl LineTracker {
    fn line(address: u64) -> u64 {
        address & !(LINE_BYTES - 1)
    }

    fn store(&mut self, address: u64) {
        let line = Self::line(address);
        self.cleaned.remove(&line);
        self.invalidated.remove(&line);
        self.dirty.insert(line);
    }

    fn clean(&mut self, address: u64) {
        let line = Self::line(address);
        if self.dirty.remove(&line) {
            self.cleaned.insert(line);
        }
    }

    fn invalidate(&mut self, address: u64) {
        let line = Self::line(address);
        if self.cleaned.remove(&line) {
            self.invalidated.insert(line);
        }
    }

    fn synchronize(&mut self) {
        self.invalidated.clear();
    }

    fn coherent(&self) -> bool {
        self.dirty.is_empty() && self.cleaned.is_empty() && self.invalidated.is_empty()
    }
}

struct A64Cpu {
    x: [u64; 31],
    sp: u64,
    pc: u64,
    nzcv: u8,
    memory: Memory,
    lines: LineTracker,
}

impl A64Cpu {
    fn new(image: &[u8]) -> Self {
        let mut x = [0u64; 31];
        for (index, reg) in x.iter_mut().enumerate() {
            *reg = entry_pattern(index);
        }
        Self {
            x,
            sp: STACK_TOP,
            pc: IMAGE_BASE,
            nzcv: 0,
            memory: Memory::new(image),
            lines: LineTracker::default(),
        }
    }

    /// Register 31 reads as zero.
    fn reg(&self, id: u32) -> u64 {
        self.x.get(id as usize).copied().unwrap_or(0)
    }

    /// Register 31 reads as sp.
    fn reg_or_sp(&self, id: u32) -> u64 {
        self.x.get(id as usize).copied().unwrap_or(self.sp)
    }

    /// Register 31 discards the write.
    fn set_reg(&mut self, id: u32, value: u64) {
        if let Some(reg) = self.x.get_mut(id as usize) {
            *reg = value;
        }
    }

    fn set_reg_or_sp(&mut self, id: u32, value: u64) {
        match self.x.get_mut(id as usize) {
            Some(reg) => *reg = value,
            None => self.sp = value,
        }
    }

    fn unsupported(&self, word: u32) -> EmulationError {
        EmulationError::Unsupported {
            pc: self.pc,
            instruction: format!("{word:#010x}"),
        }
    }

    fn fetch(&self) -> Result<u32, EmulationError> {
        self.memory
            .fetch(self.pc)
            .filter(|bytes| bytes.len() >= 4)
            .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .ok_or(EmulationError::Fault {
                pc: self.pc,
                reason: "instruction fetch outside the image",
            })
    }

    fn store(&mut self, address: u64, size: usize, value: u64) -> Result<(), EmulationError> {
        self.memory.write(address, size, value)?;
        for offset in 0..size as u64 {
            let byte = address.wrapping_add(offset);
            if self.memory.in_image(byte) {
                self.lines.store(byte);
            }
        }
        Ok(())
    }

    fn shifted(&self, word: u32, value: u64, is64: bool) -> Result<u64, EmulationError> {
        let amount = field(word, 10, 6);
        let width = if is64 { 64 } else { 32 };
        if amount >= width {
            return Err(self.unsupported(word));
        }
        let value = if is64 { value } else { value & 0xFFFF_FFFF };
        let result = match field(word, 22, 2) {
            0 => value << amount,
            1 => value >> amount,
            2 if is64 => (value as i64 >> amount) as u64,
            2 => ((value as u32 as i32) >> amount) as u32 as u64,
            _ if is64 => value.rotate_right(amount),
            _ => (value as u32).rotate_right(amount) as u64,
        };
        Ok(result)
    }

    fn sized(value: u64, is64: bool) -> u64 {
        if is64 {
            value
        } else {
            value & 0xFFFF_FFFF
        }
    }

    /// `left + right` or `left - right` at the operand width, optionally setting NZCV.
    fn add_sub(&mut self, left: u64, right: u64, subtract: bool, set_flags: bool, is64: bool) -> u64 {
        let (bits, mask) = if is64 { (64, u64::MAX) } else { (32, 0xFFFF_FFFF) };
        let (left, right) = (left & mask, right & mask);
        let operand = if subtract { !right & mask } else { right };
        let wide = u128::from(left) + u128::from(operand) + u128::from(subtract);
        let result = (wide as u64) & mask;
        if set_flags {
            let sign = 1u64 << (bits - 1);
            let mut flags = 0;
            if result & sign != 0 {
                flags |= N;
            }
            if result == 0 {
                flags |= Z;
            }
            if wide > u128::from(mask) {
                flags |= C;
            }
            if (!(left ^ operand) & (left ^ result)) & sign != 0 {
                flags |= V;
            }
            self.nzcv = flags;
        }
        result
    }

    fn condition_holds(&self, cond: u32) -> bool {
        let (n, z, c, v) = (
            self.nzcv & N != 0,
            self.nzcv & Z != 0,
            self.nzcv & C != 0,
            self.nzcv & V != 0,
        );
        let base = match cond >> 1 {
            0 => z,
            1 => c,
            2 => n,
            3 => v,
            4 => c && !z,
            5 => n == v,
            6 => !z && n == v,
            _ => true,
        };
        if cond & 1 == 1 && cond != 0b1111 {
            !base
        } else {
            base
        }
    }

    fn pair_transfer(&mut self, word: u32, load: bool, writeback: bool, post: bool) -> Result<(), EmulationError> {
        let offset = sign_extend(u64::from(field(word, 15, 7)), 7) * 8;
        let base = self.reg_or_sp(field(word, 5, 5));
        let address = if post { base } else { base.wrapping_add(offset as u64) };
        let (first, second) = (field(word, 0, 5), field(word, 10, 5));
        if load {
            let low = self.memory.read(address, 8)?;
            let high = self.memory.read(address.wrapping_add(8), 8)?;
            self.set_reg(first, low);
            self.set_reg(second, high);
        } else {
            let (low, high) = (self.reg(first), self.reg(second));
            self.store(address, 8, low)?;
            self.store(address.wrapping_add(8), 8, high)?;
        }
        if writeback {
            self.set_reg_or_sp(field(word, 5, 5), base.wrapping_add(offset as u64));
        }
        Ok(())
    }

    fn register_offset_byte(&mut self, word: u32, load: bool) -> Result<(), EmulationError> {
        let index = self.reg(field(word, 16, 5));
        let extended = match field(word, 13, 3) {
            0b010 => index & 0xFFFF_FFFF,
            0b011 | 0b111 => index,
            0b110 => index as u32 as i32 as i64 as u64,
            _ => return Err(self.unsupported(word)),
        };
        let address = self.reg_or_sp(field(word, 5, 5)).wrapping_add(extended);
        self.transfer(address, 1, field(word, 0, 5), load)
    }

    fn transfer(&mut self, address: u64, size: usize, target: u32, load: bool) -> Result<(), EmulationError> {
        if load {
            let value = self.memory.read(address, size)?;
            self.set_reg(target, value);
        } else {
            let value = self.reg(target);
            self.store(address, size, value)?;
        }
        Ok(())
    }

    /// Execute `word`; returns the next pc.
    fn execute(&mut self, word: u32) -> Result<u64, EmulationError> {
        let next = self.pc.wrapping_add(4);
        let is64 = word >> 31 == 1;
        let (rd, rn, rm) = (field(word, 0, 5), field(word, 5, 5), field(word, 16, 5));

        match word {
            NOP | DSB_ISH => return Ok(next),
            ISB => {
                self.lines.synchronize();
                return Ok(next);
            }
            _ => {}
        }

        match word & 0xFFFF_FFE0 {
            DC_CVAU => {
                self.lines.clean(self.reg(rd));
                return Ok(next);
            }
            IC_IVAU => {
                self.lines.invalidate(self.reg(rd));
                return Ok(next);
            }
            _ => {}
        }

        match word & 0x7F80_0000 {
            // movz
            0x5280_0000 => {
                let shift = field(word, 21, 2) * 16;
                let value = u64::from(field(word, 5, 16)) << shift;
                self.set_reg(rd, Self::sized(value, is64));
                return Ok(next);
            }
            // movk
            0x7280_0000 => {
                let shift = field(word, 21, 2) * 16;
                let kept = self.reg(rd) & !(0xFFFFu64 << shift);
                let value = kept | (u64::from(field(word, 5, 16)) << shift);
                self.set_reg(rd, Self::sized(value, is64));
                return Ok(next);
            }
            _ => {}
        }

        // add/sub immediate
        if word & 0x1F00_0000 == 0x1100_0000 {
            let imm = u64::from(field(word, 10, 12)) << (field(word, 22, 1) * 12);
            let subtract = word & (1 << 30) != 0;
            let set_flags = word & (1 << 29) != 0;
            let result = self.add_sub(self.reg_or_sp(rn), imm, subtract, set_flags, is64);
            if set_flags {
                self.set_reg(rd, result);
            } else {
                self.set_reg_or_sp(rd, result);
            }
            return Ok(next);
        }

        // logical shifted register
        if word & 0x1F00_0000 == 0x0A00_0000 {
            let opc = field(word, 29, 2);
            if opc == 3 {
                return Err(self.unsupported(word));
            }
            let mut right = self.shifted(word, self.reg(rm), is64)?;
            if field(word, 21, 1) == 1 {
                right = !right;
            }
            let left = self.reg(rn);
            let result = match opc {
                0 => left & right,
                1 => left | right,
                _ => left ^ right,
            };
            self.set_reg(rd, Self::sized(result, is64));
            return Ok(next);
        }

        // add/sub shifted register
        if word & 0x1F20_0000 == 0x0B00_0000 {
            let right = self.shifted(word, self.reg(rm), is64)?;
            let subtract = word & (1 << 30) != 0;
            let set_flags = word & (1 << 29) != 0;
            let result = self.add_sub(self.reg(rn), right, subtract, set_flags, is64);
            self.set_reg(rd, result);
            return Ok(next);
        }

        // add/sub extended register
        if word & 0x1FE0_0000 == 0x0B20_0000 {
            let shift = field(word, 10, 3);
            if shift > 4 {
                return Err(self.unsupported(word));
            }
            let value = self.reg(rm);
            let extended = match field(word, 13, 3) {
                0b000 => value & 0xFF,
                0b001 => value & 0xFFFF,
                0b010 => value & 0xFFFF_FFFF,
                0b011 | 0b111 => value,
                0b100 => value as u8 as i8 as i64 as u64,
                0b101 => value as u16 as i16 as i64 as u64,
                _ => value as u32 as i32 as i64 as u64,
            } << shift;
            let subtract = word & (1 << 30) != 0;
            let set_flags = word & (1 << 29) != 0;
            let result = self.add_sub(self.reg_or_sp(rn), extended, subtract, set_flags, is64);
            if set_flags {
                self.set_reg(rd, result);
            } else {
                self.set_reg_or_sp(rd, result);
            }
            return Ok(next);
        }

        // extr (64-bit)
        if word & 0xFFE0_0000 == 0x93C0_0000 {
            let lsb = field(word, 10, 6);
            let (high, low) = (self.reg(rn), self.reg(rm));
            let result = if lsb == 0 {
                low
            } else {
                (low >> lsb) | (high << (64 - lsb))
            };
            self.set_reg(rd, result);
            return Ok(next);
        }

        // adr
        if word & 0x9F00_0000 == 0x1000_0000 {
            let imm = (u64::from(field(word, 5, 19)) << 2) | u64::from(field(word, 29, 2));
            let offset = sign_extend(imm, 21);
            self.set_reg(rd, self.pc.wrapping_add(offset as u64));
            return Ok(next);
        }

        // b
        if word & 0xFC00_0000 == 0x1400_0000 {
            let offset = sign_extend(u64::from(field(word, 0, 26)), 26) * 4;
            return Ok(self.pc.wrapping_add(offset as u64));
        }

        // b.cond
        if word & 0xFF00_0010 == 0x5400_0000 {
            if self.condition_holds(field(word, 0, 4)) {
                let offset = sign_extend(u64::from(field(word, 5, 19)), 19) * 4;
                return Ok(self.pc.wrapping_add(offset as u64));
            }
            return Ok(next);
        }

        // br
        if word & 0xFFFF_FC1F == 0xD61F_0000 {
            return Ok(self.reg(rn));
        }

        // cbz/cbnz
        if word & 0x7E00_0000 == 0x3400_0000 {
            let value = Self::sized(self.reg(rd), is64);
            let nonzero = word & (1 << 24) != 0;
            if (value != 0) == nonzero {
                let offset = sign_extend(u64::from(field(word, 5, 19)), 19) * 4;
                return Ok(self.pc.wrapping_add(offset as u64));
            }
            return Ok(next);
        }

        // tbz/tbnz
        if word & 0x7E00_0000 == 0x3600_0000 {
            let bit = (field(word, 31, 1) << 5) | field(word, 19, 5);
            let set = (self.reg(rd) >> bit) & 1 == 1;
            let nonzero = word & (1 << 24) != 0;
            if set == nonzero {
                let offset = sign_extend(u64::from(field(word, 5, 14)), 14) * 4;
                return Ok(self.pc.wrapping_add(offset as u64));
            }
            return Ok(next);
        }

        // ldrb/strb register offset, ldrb post-index
        match word & 0xFFE0_0C00 {
            0x3860_0800 => {
                self.register_offset_byte(word, true)?;
                return Ok(next);
            }
            0x3820_0800 => {
                self.register_offset_byte(word, false)?;
                return Ok(next);
            }
            0x3840_0400 => {
                let base = self.reg_or_sp(rn);
                self.transfer(base, 1, rd, true)?;
                let offset = sign_extend(u64::from(field(word, 12, 9)), 9);
                self.set_reg_or_sp(rn, base.wrapping_add(offset as u64));
                return Ok(next);
            }
            _ => {}
        }

        // unsigned-offset ldrb/strb/ldrh
        let imm12 = u64::from(field(word, 10, 12));
        match word & 0xFFC0_0000 {
            0x3940_0000 => {
                let address = self.reg_or_sp(rn).wrapping_add(imm12);
                self.transfer(address, 1, rd, true)?;
                return Ok(next);
            }
            0x3900_0000 => {
                let address = self.reg_or_sp(rn).wrapping_add(imm12);
                self.transfer(address, 1, rd, false)?;
                return Ok(next);
            }
            0x7940_0000 => {
                let address = self.reg_or_sp(rn).wrapping_add(imm12 * 2);
                self.transfer(address, 2, rd, true)?;
                return Ok(next);
            }
            _ => {}
        }

        // 64-bit ldp/stp
        match word & 0xFFC0_0000 {
            0xA980_0000 => self.pair_transfer(word, false, true, false)?,
            0xA880_0000 => self.pair_transfer(word, false, true, true)?,
            0xA900_0000 => self.pair_transfer(word, false, false, false)?,
            0xA9C0_0000 => self.pair_transfer(word, true, true, false)?,
            0xA8C0_0000 => self.pair_transfer(word, true, true, true)?,
            0xA940_0000 => self.pair_transfer(word, true, false, false)?,
            _ => return Err(self.unsupported(word)),
        }
        Ok(next)
    }
}

/// Interpret `image` until control reaches `payload.start`.
pub fn run(image: &[u8], payload: Range<usize>, step_limit: usize) -> Result<EmulationOutcome, EmulationError> {
    check_payload(image, &payload)?;

    let mut cpu = A64Cpu::new(image);
    let entry = (cpu.x, cpu.sp, cpu.nzcv);
    let payload_start = IMAGE_BASE + payload.start as u64;

    let mut steps = 0;
    while cpu.pc != payload_start {
        if steps == step_limit {
            return Err(EmulationError::StepLimit { limit: step_limit });
        }
        if cpu.pc % 4 != 0 {
            return Err(EmulationError::Fault {
                pc: cpu.pc,
                reason: "misaligned pc",
            });
        }
        steps += 1;
        let word = cpu.fetch()?;
        cpu.pc = cpu.execute(word)?;
    }

    Ok(EmulationOutcome {
        payload: cpu.memory.image()[payload].to_vec(),
        registers_preserved: (cpu.x, cpu.sp, cpu.nzcv) == entry,
        icache_coherent: cpu.lines.coherent(),
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm64::encoder::{A64Encoder, RegOp, Width, ZR};
    use crate::core::register_file::AsmReg;

    fn image(build: impl FnOnce(&mut A64Encoder), payload: &[u8]) -> (Vec<u8>, Range<usize>) {
        let mut encoder = A64Encoder::new();
        build(&mut encoder);
        let mut bytes = encoder.finalize().unwrap();
        let start = bytes.len();
        bytes.extend_from_slice(payload);
        (bytes, start..start + payload.len())
    }

    /// Two-byte xor loop over the payload, optionally followed by cache maintenance.
    fn xor_loop(encoder: &mut A64Encoder, sync: bool) {
        let (ptr, ctr, key, scratch) = (AsmReg::new(1), AsmReg::new(2), AsmReg::new(3), AsmReg::new(4));
        let (top, cond) = (encoder.new_label(), encoder.new_label());
        encoder.mov_u32(ctr, 2);
        encoder.movz_w(key, 0x0F);
        let payload = encoder.payload_label();
        encoder.adr(ptr, payload);
        encoder.b(cond);
        encoder.bind(top);
        encoder.sub_imm(ctr.id, ctr.id, 1);
        encoder.ldrb_indexed(scratch.id, ptr.id, ctr.id);
        encoder.reg_op(Width::W, RegOp::Eor, scratch.id, scratch.id, key.id);
        encoder.strb_indexed(scratch.id, ptr.id, ctr.id);
        encoder.bind(cond);
        encoder.cbnz(ctr.id, top);
        if sync {
            encoder.sync_instruction_cache(ptr, ctr, scratch, 2);
        }
    }

    #[test]
    fn test_byte_loop_rewrites_payload() {
        let (bytes, payload) = image(|e| xor_loop(e, false), &[0xF0, 0x0F]);
        let outcome = run(&bytes, payload, 100).unwrap();
        assert_eq!(outcome.payload, vec![0xFF, 0x00]);
        assert!(!outcome.registers_preserved);
        assert!(!outcome.icache_coherent);
    }

    #[test]
    fn test_cache_maintenance_retires_stale_lines() {
        let (bytes, payload) = image(|e| xor_loop(e, true), &[0xF0, 0x0F]);
        let outcome = run(&bytes, payload, 100).unwrap();
        assert_eq!(outcome.payload, vec![0xFF, 0x00]);
        assert!(outcome.icache_coherent);
    }

    #[test]
    fn test_barriers_alone_leave_lines_stale() {
        let (bytes, payload) = image(
            |e| {
                xor_loop(e, false);
                e.barrier();
            },
            &[0xF0, 0x0F],
        );
        assert!(!run(&bytes, payload, 100).unwrap().icache_coherent);
    }

    #[test]
    fn test_invalidate_without_isb_is_incomplete() {
        let mut lines = LineTracker::default();
        lines.store(IMAGE_BASE + 9);
        lines.invalidate(IMAGE_BASE + 8);
        assert!(!lines.coherent());
        lines.clean(IMAGE_BASE + 10);
        lines.invalidate(IMAGE_BASE + 11);
        assert!(!lines.coherent());
        lines.synchronize();
        assert!(lines.coherent());
    }

    #[test]
    fn test_pair_save_restore_preserves() {
        let (bytes, payload) = image(
            |e| {
                e.push_pair(1, 2);
                e.push_pair(3, ZR);
                e.mov_u32(AsmReg::new(1), 7);
                e.movz_w(AsmReg::new(3), 9);
                e.extr(2, 2, 2, 13);
                e.pop_pair(3, ZR);
                e.pop_pair(1, 2);
            },
            &[],
        );
        let outcome = run(&bytes, payload, 100).unwrap();
        assert!(outcome.registers_preserved);
        assert!(outcome.icache_coherent);
        assert_eq!(outcome.steps, 8);
    }

    #[test]
    fn test_ror_pair_is_identity() {
        let (bytes, payload) = image(
            |e| {
                e.extr(5, 5, 5, 20);
                e.extr(5, 5, 5, 44);
                e.reg_op(Width::X, RegOp::Orn, 6, ZR, 6);
                e.reg_op(Width::X, RegOp::Orn, 6, ZR, 6);
            },
            &[],
        );
        assert!(run(&bytes, payload, 10).unwrap().registers_preserved);
    }

    #[test]
    fn test_terminator_scan_and_register_branch() {
        // scan for 'A' with a post-indexed load, then branch to the byte after it
        let (bytes, payload) = image(
            |e| {
                let (data, scan) = (e.new_label(), e.new_label());
                e.adr(AsmReg::new(0), data);
                e.movz_w(AsmReg::new(1), u16::from(b'A'));
                e.bind(scan);
                e.ldrb_post_inc(2, 0);
                e.cmp_w(2, 1);
                e.b_ne(scan);
                e.br(0);
                e.bind(data);
                e.word(u32::from_le_bytes([0x11, 0x22, b'A', 0x00]));
            },
            &[],
        );
        let start = bytes.len() - 1;
        let outcome = run(&bytes, start..bytes.len(), 100).unwrap();
        assert_eq!(outcome.payload, vec![0x00]);
        // adr, movz, three scan rounds, br
        assert_eq!(outcome.steps, 2 + 3 * 3 + 1);
        assert!(!outcome.registers_preserved);
    }

    #[test]
    fn test_cmp_sets_flags() {
        let mut cpu = A64Cpu::new(&[]);
        cpu.add_sub(1, 2, true, true, false);
        assert_eq!(cpu.nzcv, N);
        assert!(cpu.condition_holds(0b1011)); // lt
        assert!(!cpu.condition_holds(0b0010)); // cs
        cpu.add_sub(5, 5, true, true, true);
        assert_eq!(cpu.nzcv, Z | C);
        assert!(cpu.condition_holds(0b0000)); // eq
        assert!(cpu.condition_holds(0b1110)); // al
        cpu.add_sub(0x7FFF_FFFF, 1, false, true, false);
        assert_eq!(cpu.nzcv, N | V);
    }

    #[test]
    fn test_unknown_word_is_unsupported() {
        let (bytes, payload) = image(|e| e.word(0), &[]);
        assert!(matches!(
            run(&bytes, payload, 10),
            Err(EmulationError::Unsupported { pc: IMAGE_BASE, .. })
        ));
    }
}
