// SPDX-FileCopyrightText: 2023 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Implementation of the RV64 I extension.
//!
//! Chapters 2 & 5 - Unprivileged spec

use crate::{
    interpreter::ProgramCounterUpdate::{self, Next, Set},
    machine_state::{
        registers::{XRegister, XRegisters},
        MachineState,
    },
    parser::instruction::{FenceSet, InstrWidth},
    traps::Exception,
};

impl XRegisters {
    /// `ADD` R-type instruction
    pub fn run_add(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let result = self.read(rs1).wrapping_add(self.read(rs2));
        self.write(rd, result)
    }

    /// `SUB` R-type instruction
    pub fn run_sub(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let result = self.read(rs1).wrapping_sub(self.read(rs2));
        self.write(rd, result)
    }

    /// `XOR` R-type instruction
    pub fn run_xor(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        self.write(rd, self.read(rs1) ^ self.read(rs2))
    }

    /// `OR` R-type instruction
    pub fn run_or(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        self.write(rd, self.read(rs1) | self.read(rs2))
    }

    /// `AND` R-type instruction
    pub fn run_and(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        self.write(rd, self.read(rs1) & self.read(rs2))
    }

    /// `SLL` R-type instruction
    ///
    /// Only the lowest 6 bits of rs2 constitute the shift amount.
    pub fn run_sll(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let sh_amt = self.read(rs2) & 0b11_1111;
        self.write(rd, self.read(rs1) << sh_amt)
    }

    /// `SRL` R-type instruction
    pub fn run_srl(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let sh_amt = self.read(rs2) & 0b11_1111;
        self.write(rd, self.read(rs1) >> sh_amt)
    }

    /// `SRA` R-type instruction
    pub fn run_sra(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let sh_amt = self.read(rs2) & 0b11_1111;
        // Right shift on i64 is an arithmetic shift
        self.write(rd, ((self.read(rs1) as i64) >> sh_amt) as u64)
    }

    /// `SLT` R-type instruction
    pub fn run_slt(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let result = ((self.read(rs1) as i64) < (self.read(rs2) as i64)) as u64;
        self.write(rd, result)
    }

    /// `SLTU` R-type instruction
    pub fn run_sltu(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let result = (self.read(rs1) < self.read(rs2)) as u64;
        self.write(rd, result)
    }

    /// `ADDW` R-type instruction
    pub fn run_addw(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let result = self.read(rs1).wrapping_add(self.read(rs2));
        // Truncate to lower 32 bits, then sign-extend to 64 bits.
        self.write(rd, result as i32 as u64)
    }

    /// `SUBW` R-type instruction
    pub fn run_subw(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let result = self.read(rs1).wrapping_sub(self.read(rs2));
        self.write(rd, result as i32 as u64)
    }

    /// `SLLW` R-type instruction
    ///
    /// Only the lowest 5 bits of rs2 constitute the shift amount.
    pub fn run_sllw(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let sh_amt = self.read(rs2) & 0b1_1111;
        let result = (self.read(rs1) as u32) << sh_amt;
        self.write(rd, result as i32 as u64)
    }

    /// `SRLW` R-type instruction
    pub fn run_srlw(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let sh_amt = self.read(rs2) & 0b1_1111;
        let result = (self.read(rs1) as u32) >> sh_amt;
        self.write(rd, result as i32 as u64)
    }

    /// `SRAW` R-type instruction
    pub fn run_sraw(&mut self, rs1: XRegister, rs2: XRegister, rd: XRegister) {
        let sh_amt = self.read(rs2) & 0b1_1111;
        let result = (self.read(rs1) as i32) >> sh_amt;
        self.write(rd, result as u64)
    }

    /// `ADDI` I-type instruction
    pub fn run_addi(&mut self, imm: i64, rs1: XRegister, rd: XRegister) {
        // Return the lower XLEN (64 bits) of the addition, ignoring overflow
        let result = self.read(rs1).wrapping_add(imm as u64);
        self.write(rd, result)
    }

    /// `ADDIW` I-type instruction
    pub fn run_addiw(&mut self, imm: i64, rs1: XRegister, rd: XRegister) {
        // Perform addition only on the lower 32 bits, ignoring the upper 32
        // bits. We do not need to explicitly truncate for the lower bits
        // since wrapping_add has the same semantics & result on the lower 32
        // bits irrespective of bit width.
        let result = self.read(rs1).wrapping_add(imm as u64);
        // Truncate result to use only the lower 32 bits, then sign-extend to
        // 64 bits.
        self.write(rd, result as i32 as u64)
    }

    /// `XORI` I-type instruction
    pub fn run_xori(&mut self, imm: i64, rs1: XRegister, rd: XRegister) {
        self.write(rd, self.read(rs1) ^ imm as u64)
    }

    /// `ORI` I-type instruction
    pub fn run_ori(&mut self, imm: i64, rs1: XRegister, rd: XRegister) {
        self.write(rd, self.read(rs1) | imm as u64)
    }

    /// `ANDI` I-type instruction
    pub fn run_andi(&mut self, imm: i64, rs1: XRegister, rd: XRegister) {
        self.write(rd, self.read(rs1) & imm as u64)
    }

    /// `SLLI` I-type instruction
    ///
    /// NOTE: RV64I makes the shift amount (shamt) be 6 bits wide for SLLI
    pub fn run_slli(&mut self, imm: i64, rs1: XRegister, rd: XRegister) {
        // The encoding allows to consider the whole immediate as the shift
        // amount
        self.write(rd, self.read(rs1) << imm)
    }

    /// `SRLI` I-type instruction
    pub fn run_srli(&mut self, imm: i64, rs1: XRegister, rd: XRegister) {
        self.write(rd, self.read(rs1) >> imm)
    }

    /// `SRAI` I-type instruction
    pub fn run_srai(&mut self, imm: i64, rs1: XRegister, rd: XRegister) {
        // SRAI encoding has bit imm[10] set, so need to mask the shift amount
        let sh_amt = imm & 0b11_1111;
        let result = (self.read(rs1) as i64) >> sh_amt;
        self.write(rd, result as u64)
    }

    /// `SLLIW` I-type instruction
    pub fn run_slliw(&mut self, imm: i64, rs1: XRegister, rd: XRegister) {
        let result = (self.read(rs1) as u32) << imm;
        // Sign-extend the lower 32 bits per RISC-V convention.
        self.write(rd, result as i32 as u64)
    }

    /// `SRLIW` I-type instruction
    pub fn run_srliw(&mut self, imm: i64, rs1: XRegister, rd: XRegister) {
        let result = (self.read(rs1) as u32) >> imm;
        self.write(rd, result as i32 as u64)
    }

    /// `SRAIW` I-type instruction
    pub fn run_sraiw(&mut self, imm: i64, rs1: XRegister, rd: XRegister) {
        // SRAIW encoding has bit imm[10] set, so need to mask the shift amount
        let sh_amt = imm & 0b1_1111;
        let result = (self.read(rs1) as i32) >> sh_amt;
        self.write(rd, result as u64)
    }

    /// `SLTI` I-type instruction
    pub fn run_slti(&mut self, imm: i64, rs1: XRegister, rd: XRegister) {
        let result = ((self.read(rs1) as i64) < imm) as u64;
        self.write(rd, result)
    }

    /// `SLTIU` I-type instruction
    pub fn run_sltiu(&mut self, imm: i64, rs1: XRegister, rd: XRegister) {
        let result = (self.read(rs1) < imm as u64) as u64;
        self.write(rd, result)
    }

    /// `LUI` U-type instruction
    pub fn run_lui(&mut self, imm: i64, rd: XRegister) {
        // Set the upper 20 bits; the parser already placed the immediate.
        self.write(rd, imm as u64)
    }
}

impl MachineState {
    /// `AUIPC` U-type instruction
    pub fn run_auipc(&mut self, imm: i64, rd: XRegister) {
        let result = self.pc.wrapping_add(imm as u64);
        self.xregisters.write(rd, result)
    }

    /// `LB` I-type instruction
    pub fn run_lb(&mut self, imm: i64, rs1: XRegister, rd: XRegister) -> Result<(), Exception> {
        let address = self.xregisters.read(rs1).wrapping_add(imm as u64);
        let value: u8 = self.load(address)?;
        self.xregisters.write(rd, value as i8 as u64);
        Ok(())
    }

    /// `LH` I-type instruction
    pub fn run_lh(&mut self, imm: i64, rs1: XRegister, rd: XRegister) -> Result<(), Exception> {
        let address = self.xregisters.read(rs1).wrapping_add(imm as u64);
        let value: u16 = self.load(address)?;
        self.xregisters.write(rd, value as i16 as u64);
        Ok(())
    }

    /// `LW` I-type instruction
    pub fn run_lw(&mut self, imm: i64, rs1: XRegister, rd: XRegister) -> Result<(), Exception> {
        let address = self.xregisters.read(rs1).wrapping_add(imm as u64);
        let value: u32 = self.load(address)?;
        self.xregisters.write(rd, value as i32 as u64);
        Ok(())
    }

    /// `LD` I-type instruction
    pub fn run_ld(&mut self, imm: i64, rs1: XRegister, rd: XRegister) -> Result<(), Exception> {
        let address = self.xregisters.read(rs1).wrapping_add(imm as u64);
        let value: u64 = self.load(address)?;
        self.xregisters.write(rd, value);
        Ok(())
    }

    /// `LBU` I-type instruction
    pub fn run_lbu(&mut self, imm: i64, rs1: XRegister, rd: XRegister) -> Result<(), Exception> {
        let address = self.xregisters.read(rs1).wrapping_add(imm as u64);
        let value: u8 = self.load(address)?;
        self.xregisters.write(rd, value as u64);
        Ok(())
    }

    /// `LHU` I-type instruction
    pub fn run_lhu(&mut self, imm: i64, rs1: XRegister, rd: XRegister) -> Result<(), Exception> {
        let address = self.xregisters.read(rs1).wrapping_add(imm as u64);
        let value: u16 = self.load(address)?;
        self.xregisters.write(rd, value as u64);
        Ok(())
    }

    /// `LWU` I-type instruction
    pub fn run_lwu(&mut self, imm: i64, rs1: XRegister, rd: XRegister) -> Result<(), Exception> {
        let address = self.xregisters.read(rs1).wrapping_add(imm as u64);
        let value: u32 = self.load(address)?;
        self.xregisters.write(rd, value as u64);
        Ok(())
    }

    /// `SB` S-type instruction
    pub fn run_sb(&mut self, imm: i64, rs1: XRegister, rs2: XRegister) -> Result<(), Exception> {
        let address = self.xregisters.read(rs1).wrapping_add(imm as u64);
        self.store(address, self.xregisters.read(rs2) as u8)
    }

    /// `SH` S-type instruction
    pub fn run_sh(&mut self, imm: i64, rs1: XRegister, rs2: XRegister) -> Result<(), Exception> {
        let address = self.xregisters.read(rs1).wrapping_add(imm as u64);
        self.store(address, self.xregisters.read(rs2) as u16)
    }

    /// `SW` S-type instruction
    pub fn run_sw(&mut self, imm: i64, rs1: XRegister, rs2: XRegister) -> Result<(), Exception> {
        let address = self.xregisters.read(rs1).wrapping_add(imm as u64);
        self.store(address, self.xregisters.read(rs2) as u32)
    }

    /// `SD` S-type instruction
    pub fn run_sd(&mut self, imm: i64, rs1: XRegister, rs2: XRegister) -> Result<(), Exception> {
        let address = self.xregisters.read(rs1).wrapping_add(imm as u64);
        self.store(address, self.xregisters.read(rs2))
    }

    fn branch(
        &self,
        taken: bool,
        imm: i64,
        width: InstrWidth,
    ) -> ProgramCounterUpdate {
        if taken {
            Set(self.pc.wrapping_add(imm as u64))
        } else {
            Next(width)
        }
    }

    /// `BEQ` B-type instruction
    pub fn run_beq(
        &mut self,
        imm: i64,
        rs1: XRegister,
        rs2: XRegister,
        width: InstrWidth,
    ) -> ProgramCounterUpdate {
        self.branch(
            self.xregisters.read(rs1) == self.xregisters.read(rs2),
            imm,
            width,
        )
    }

    /// `BNE` B-type instruction
    pub fn run_bne(
        &mut self,
        imm: i64,
        rs1: XRegister,
        rs2: XRegister,
        width: InstrWidth,
    ) -> ProgramCounterUpdate {
        self.branch(
            self.xregisters.read(rs1) != self.xregisters.read(rs2),
            imm,
            width,
        )
    }

    /// `BLT` B-type instruction
    pub fn run_blt(
        &mut self,
        imm: i64,
        rs1: XRegister,
        rs2: XRegister,
        width: InstrWidth,
    ) -> ProgramCounterUpdate {
        self.branch(
            (self.xregisters.read(rs1) as i64) < (self.xregisters.read(rs2) as i64),
            imm,
            width,
        )
    }

    /// `BGE` B-type instruction
    pub fn run_bge(
        &mut self,
        imm: i64,
        rs1: XRegister,
        rs2: XRegister,
        width: InstrWidth,
    ) -> ProgramCounterUpdate {
        self.branch(
            (self.xregisters.read(rs1) as i64) >= (self.xregisters.read(rs2) as i64),
            imm,
            width,
        )
    }

    /// `BLTU` B-type instruction
    pub fn run_bltu(
        &mut self,
        imm: i64,
        rs1: XRegister,
        rs2: XRegister,
        width: InstrWidth,
    ) -> ProgramCounterUpdate {
        self.branch(
            self.xregisters.read(rs1) < self.xregisters.read(rs2),
            imm,
            width,
        )
    }

    /// `BGEU` B-type instruction
    pub fn run_bgeu(
        &mut self,
        imm: i64,
        rs1: XRegister,
        rs2: XRegister,
        width: InstrWidth,
    ) -> ProgramCounterUpdate {
        self.branch(
            self.xregisters.read(rs1) >= self.xregisters.read(rs2),
            imm,
            width,
        )
    }

    /// `JAL` J-type instruction
    ///
    /// The return address is the instruction after this one, which is
    /// `pc + 2` for the compressed form.
    pub fn run_jal(&mut self, imm: i64, rd: XRegister, width: InstrWidth) -> u64 {
        let return_address = self.pc.wrapping_add(width as u64);
        self.xregisters.write(rd, return_address);
        self.pc.wrapping_add(imm as u64)
    }

    /// `JALR` I-type instruction
    pub fn run_jalr(&mut self, imm: i64, rs1: XRegister, rd: XRegister, width: InstrWidth) -> u64 {
        let return_address = self.pc.wrapping_add(width as u64);
        // The target address drops its lowest bit.
        let target = self.xregisters.read(rs1).wrapping_add(imm as u64) & !1;
        self.xregisters.write(rd, return_address);
        target
    }

    /// `FENCE` instruction
    ///
    /// A single hart with a strongly ordered memory view: nothing to do.
    pub fn run_fence(&mut self, _pred: FenceSet, _succ: FenceSet) {}

    /// `FENCE.I` instruction
    ///
    /// Writes to instruction memory become visible through the code TLB.
    pub fn run_fence_i(&mut self) {
        self.tlb.code.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine_state::registers::{a0, a1, a2, t0};
    use proptest::prelude::*;

    #[test]
    fn test_addi_wraps() {
        let mut xregs = XRegisters::new();
        xregs.write(a0, u64::MAX);
        xregs.run_addi(1, a0, a1);
        assert_eq!(xregs.read(a1), 0);
    }

    #[test]
    fn test_addiw_sign_extends() {
        let mut xregs = XRegisters::new();
        xregs.write(a0, 0x7FFF_FFFF);
        xregs.run_addiw(1, a0, a1);
        assert_eq!(xregs.read(a1), 0xFFFF_FFFF_8000_0000);
    }

    #[test]
    fn test_shifts() {
        proptest!(|(value: u64, shift in 0_u64..64)| {
            let mut xregs = XRegisters::new();
            xregs.write(a0, value);
            xregs.write(a1, shift);

            xregs.run_sll(a0, a1, a2);
            prop_assert_eq!(xregs.read(a2), value << shift);

            xregs.run_srl(a0, a1, a2);
            prop_assert_eq!(xregs.read(a2), value >> shift);

            xregs.run_sra(a0, a1, a2);
            prop_assert_eq!(xregs.read(a2), ((value as i64) >> shift) as u64);

            // Bits above the shift amount are ignored.
            xregs.write(a1, shift + 64);
            xregs.run_sll(a0, a1, a2);
            prop_assert_eq!(xregs.read(a2), value << shift);
        });
    }

    #[test]
    fn test_slt_family() {
        let mut xregs = XRegisters::new();
        xregs.write(a0, u64::MAX); // -1 signed, huge unsigned
        xregs.write(a1, 1);

        xregs.run_slt(a0, a1, t0);
        assert_eq!(xregs.read(t0), 1);

        xregs.run_sltu(a0, a1, t0);
        assert_eq!(xregs.read(t0), 0);
    }

    #[test]
    fn test_jalr_clears_low_bit() {
        let mut state = crate::interpreter::tests::state_with_ram(0x1000);
        state.pc = crate::pma::RAM_START;
        state.xregisters.write(a0, 0x8000_0105);
        let target = state.run_jalr(0, a0, a1, InstrWidth::Uncompressed);
        assert_eq!(target, 0x8000_0104);
        assert_eq!(state.xregisters.read(a1), crate::pma::RAM_START + 4);
    }
}
