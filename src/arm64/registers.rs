//! AArch64 register pools.
//!
//! x18 (platform register), x29 (frame pointer), x30 (link register) and sp
//! are never handed out.

use crate::core::register_file::AsmReg;

pub const X1: AsmReg = AsmReg::new(1);
pub const X2: AsmReg = AsmReg::new(2);
pub const X3: AsmReg = AsmReg::new(3);
pub const X4: AsmReg = AsmReg::new(4);

pub const GENERAL: [AsmReg; 28] = [
    AsmReg::new(0), AsmReg::new(1), AsmReg::new(2), AsmReg::new(3),
    AsmReg::new(4), AsmReg::new(5), AsmReg::new(6), AsmReg::new(7),
    AsmReg::new(8), AsmReg::new(9), AsmReg::new(10), AsmReg::new(11),
    AsmReg::new(12), AsmReg::new(13), AsmReg::new(14), AsmReg::new(15),
    AsmReg::new(16), AsmReg::new(17), AsmReg::new(19), AsmReg::new(20),
    AsmReg::new(21), AsmReg::new(22), AsmReg::new(23), AsmReg::new(24),
    AsmReg::new(25), AsmReg::new(26), AsmReg::new(27), AsmReg::new(28),
];

pub fn is_reserved(reg: AsmReg) -> bool {
    matches!(reg.id, 18 | 29 | 30 | 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_excludes_reserved() {
        assert!(GENERAL.iter().all(|reg| !is_reserved(*reg)));
        assert_eq!(GENERAL.len(), 28);
    }
}
