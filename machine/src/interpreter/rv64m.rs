// SPDX-FileCopyrightText: 2024 Nomadic Labs <contact@nomadic-labs.com>
//
// SPDX-License-Identifier: MIT

//! Implementation of the RV64 M extension.
//!
//! Chapter 7 - Unprivileged spec

use crate::machine_state::registers::{XRegister, XRegisters};

impl XRegisters {
    /// `MUL` R-type instruction
    pub fn run_mul(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let result = self.read(rs1).wrapping_mul(self.read(rs2));
        self.write(rd, result)
    }

    /// `MULH` R-type instruction
    pub fn run_mulh(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let lhs = self.read(rs1) as i64 as i128;
        let rhs = self.read(rs2) as i64 as i128;
        self.write(rd, ((lhs * rhs) >> 64) as u64)
    }

    /// `MULHSU` R-type instruction
    pub fn run_mulhsu(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let lhs = self.read(rs1) as i64 as i128;
        let rhs = self.read(rs2) as i128;
        self.write(rd, ((lhs * rhs) >> 64) as u64)
    }

    /// `MULHU` R-type instruction
    pub fn run_mulhu(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let lhs = self.read(rs1) as u128;
        let rhs = self.read(rs2) as u128;
        self.write(rd, ((lhs * rhs) >> 64) as u64)
    }

    /// `DIV` R-type instruction
    ///
    /// Division by zero returns all ones; the signed-overflow case
    /// `i64::MIN / -1` returns the dividend. Section 7.2
    pub fn run_div(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let dividend = self.read(rs1) as i64;
        let divisor = self.read(rs2) as i64;
        let result = if divisor == 0 {
            -1
        } else {
            dividend.wrapping_div(divisor)
        };
        self.write(rd, result as u64)
    }

    /// `DIVU` R-type instruction
    pub fn run_divu(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let dividend = self.read(rs1);
        let divisor = self.read(rs2);
        let result = if divisor == 0 {
            u64::MAX
        } else {
            dividend / divisor
        };
        self.write(rd, result)
    }

    /// `REM` R-type instruction
    pub fn run_rem(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let dividend = self.read(rs1) as i64;
        let divisor = self.read(rs2) as i64;
        let result = if divisor == 0 {
            dividend
        } else {
            dividend.wrapping_rem(divisor)
        };
        self.write(rd, result as u64)
    }

    /// `REMU` R-type instruction
    pub fn run_remu(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let dividend = self.read(rs1);
        let divisor = self.read(rs2);
        let result = if divisor == 0 {
            dividend
        } else {
            dividend % divisor
        };
        self.write(rd, result)
    }

    /// `MULW` R-type instruction
    pub fn run_mulw(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let lhs = self.read(rs1) as i32;
        let rhs = self.read(rs2) as i32;
        self.write(rd, lhs.wrapping_mul(rhs) as u64)
    }

    /// `DIVW` R-type instruction
    pub fn run_divw(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let dividend = self.read(rs1) as i32;
        let divisor = self.read(rs2) as i32;
        let result = if divisor == 0 {
            -1
        } else {
            dividend.wrapping_div(divisor)
        };
        self.write(rd, result as u64)
    }

    /// `DIVUW` R-type instruction
    pub fn run_divuw(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let dividend = self.read(rs1) as u32;
        let divisor = self.read(rs2) as u32;
        let result = if divisor == 0 {
            u32::MAX as i32
        } else {
            (dividend / divisor) as i32
        };
        self.write(rd, result as u64)
    }

    /// `REMW` R-type instruction
    pub fn run_remw(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let dividend = self.read(rs1) as i32;
        let divisor = self.read(rs2) as i32;
        let result = if divisor == 0 {
            dividend
        } else {
            dividend.wrapping_rem(divisor)
        };
        self.write(rd, result as u64)
    }

    /// `REMUW` R-type instruction
    pub fn run_remuw(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let dividend = self.read(rs1) as u32;
        let divisor = self.read(rs2) as u32;
        let result = if divisor == 0 {
            dividend as i32
        } else {
            (dividend % divisor) as i32
        };
        self.write(rd, result as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine_state::registers::{a0, a1, a2};
    use proptest::prelude::*;

    #[test]
    fn test_division_edge_cases() {
        let mut xregs = XRegisters::new();

        // Division by zero
        xregs.write(a0, 42);
        xregs.write(a1, 0);
        xregs.run_div(a0, a1, a2);
        assert_eq!(xregs.read(a2), u64::MAX);
        xregs.run_divu(a0, a1, a2);
        assert_eq!(xregs.read(a2), u64::MAX);
        xregs.run_rem(a0, a1, a2);
        assert_eq!(xregs.read(a2), 42);
        xregs.run_remu(a0, a1, a2);
        assert_eq!(xregs.read(a2), 42);

        // Signed overflow
        xregs.write(a0, i64::MIN as u64);
        xregs.write(a1, -1_i64 as u64);
        xregs.run_div(a0, a1, a2);
        assert_eq!(xregs.read(a2), i64::MIN as u64);
        xregs.run_rem(a0, a1, a2);
        assert_eq!(xregs.read(a2), 0);
    }

    #[test]
    fn test_mulh_matches_wide_multiplication() {
        proptest!(|(lhs: u64, rhs: u64)| {
            let mut xregs = XRegisters::new();
            xregs.write(a0, lhs);
            xregs.write(a1, rhs);

            xregs.run_mulhu(a0, a1, a2);
            let wide = (lhs as u128) * (rhs as u128);
            prop_assert_eq!(xregs.read(a2), (wide >> 64) as u64);

            xregs.run_mulh(a0, a1, a2);
            let wide = (lhs as i64 as i128) * (rhs as i64 as i128);
            prop_assert_eq!(xregs.read(a2), ((wide >> 64) as u64));
        });
    }

    #[test]
    fn test_word_variants_sign_extend() {
        let mut xregs = XRegisters::new();
        xregs.write(a0, 0xFFFF_FFFF); // -1 as i32
        xregs.write(a1, 0xFFFF_FFFF);
        xregs.run_mulw(a0, a1, a2);
        assert_eq!(xregs.read(a2), 1);

        xregs.write(a0, 0x8000_0000); // i32::MIN
        xregs.write(a1, u64::MAX); // -1
        xregs.run_divw(a0, a1, a2);
        assert_eq!(xregs.read(a2), 0x8000_0000_u32 as i32 as u64);
    }
}
