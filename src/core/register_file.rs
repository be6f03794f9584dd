//! Register selection for decoder stubs.
//!
//! A stub only ever needs a handful of general-purpose registers, so this is a
//! much smaller cousin of a compiler register allocator: a bit set of
//! architecture register ids plus a `RegisterFile` that hands out registers
//! either deterministically (plain stubs) or at random from an explicitly
//! threaded RNG (metamorphic stubs), and remembers everything it handed out so
//! the synthesizer knows what to save and restore.

use rand::Rng;

use super::error::EncodingError;
use super::key_schedule::pick_index;

/// Maximum register id representable in a [`RegBitSet`].
pub const MAX_REGISTERS: u8 = 64;

/// Architecture register id (hardware encoding number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsmReg {
    pub id: u8,
}

impl AsmReg {
    pub const fn new(id: u8) -> Self {
        Self { id }
    }
}

/// Bit set for tracking register sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegBitSet {
    bits: u64,
}

impl RegBitSet {
    pub const fn new() -> Self {
        Self { bits: 0 }
    }

    /// Set containing every register in `regs`.
    pub fn from_regs(regs: &[AsmReg]) -> Self {
        let mut set = Self::new();
        for reg in regs {
            set.set(*reg);
        }
        set
    }

    pub fn contains(&self, reg: AsmReg) -> bool {
        reg.id < MAX_REGISTERS && (self.bits & (1u64 << reg.id)) != 0
    }

    pub fn set(&mut self, reg: AsmReg) {
        if reg.id < MAX_REGISTERS {
            self.bits |= 1u64 << reg.id;
        }
    }

    pub fn clear(&mut self, reg: AsmReg) {
        if reg.id < MAX_REGISTERS {
            self.bits &= !(1u64 << reg.id);
        }
    }

    pub fn union(&mut self, other: &RegBitSet) {
        self.bits |= other.bits;
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn count(&self) -> u32 {
        self.bits.count_ones()
    }

    /// Registers in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = AsmReg> + '_ {
        (0..MAX_REGISTERS)
            .map(AsmReg::new)
            .filter(move |reg| self.contains(*reg))
    }
}

/// Hands out stub registers and tracks which ones were clobbered.
#[derive(Debug, Clone, Default)]
pub struct RegisterFile {
    /// Registers handed out for the current block.
    used: RegBitSet,
    /// Every register written by the stub so far.
    clobbered: RegBitSet,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new functional block; registers become free again but stay clobbered.
    pub fn release_all(&mut self) {
        self.used = RegBitSet::new();
    }

    /// Claim a specific register.
    pub fn allocate_fixed(&mut self, reg: AsmReg, role: &'static str) -> Result<AsmReg, EncodingError> {
        if self.used.contains(reg) {
            return Err(EncodingError::RegisterExhausted { role });
        }
        self.used.set(reg);
        self.clobbered.set(reg);
        Ok(reg)
    }

    /// Claim a random free register among `candidates`.
    pub fn allocate_random<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        candidates: &[AsmReg],
        role: &'static str,
    ) -> Result<AsmReg, EncodingError> {
        let free: Vec<AsmReg> = candidates
            .iter()
            .copied()
            .filter(|reg| !self.used.contains(*reg))
            .collect();
        if free.is_empty() {
            return Err(EncodingError::RegisterExhausted { role });
        }
        let reg = free[pick_index(rng, free.len())];
        self.allocate_fixed(reg, role)
    }

    /// Registers currently holding block state.
    pub fn used(&self) -> RegBitSet {
        self.used
    }

    /// Every register written since construction.
    pub fn clobbered(&self) -> RegBitSet {
        self.clobbered
    }
}
