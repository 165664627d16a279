// SPDX-FileCopyrightText: 2023 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Implementation of the Zicsr extension: atomic CSR read-modify-write.
//!
//! Chapter 9 - Unprivileged spec

use crate::{
    machine_state::{
        csregisters::{xstatus, CSRegister},
        registers::XRegister,
        MachineState,
    },
    traps::Exception,
};

impl MachineState {
    /// Execute a CSRRW instruction.
    pub fn run_csrrw(
        &mut self,
        csr: CSRegister,
        rs1: XRegister,
        rd: XRegister,
    ) -> Result<(), Exception> {
        let value = self.xregisters.read(rs1);
        self.csr_replace(csr, value, rd)
    }

    /// Execute a CSRRWI instruction.
    pub fn run_csrrwi(
        &mut self,
        csr: CSRegister,
        imm: u64,
        rd: XRegister,
    ) -> Result<(), Exception> {
        self.csr_replace(csr, imm & 0b11111, rd)
    }

    /// Replace the value in `csr` with `value` and write the previous value
    /// to `rd`. When `rd = x0`, no read side effects are triggered.
    fn csr_replace(
        &mut self,
        csr: CSRegister,
        value: u64,
        rd: XRegister,
    ) -> Result<(), Exception> {
        self.csr_write_check(csr)?;

        if rd.is_zero() {
            self.csregisters.write(csr, value);
        } else {
            let old = self.csregisters.replace(csr, value);
            self.xregisters.write(rd, old);
        }
        self.csr_side_effects(csr);
        Ok(())
    }

    /// Execute the CSRRS instruction.
    pub fn run_csrrs(
        &mut self,
        csr: CSRegister,
        rs1: XRegister,
        rd: XRegister,
    ) -> Result<(), Exception> {
        // When `rs1 = x0`, we don't want to trigger any CSR write effects.
        let old = if rs1.is_zero() {
            self.csr_read(csr)?
        } else {
            self.csr_write_check(csr)?;
            let value = self.xregisters.read(rs1);
            let old = self.csregisters.set_bits(csr, value);
            self.csr_side_effects(csr);
            old
        };

        self.xregisters.write(rd, old);
        Ok(())
    }

    /// Execute the CSRRSI instruction.
    pub fn run_csrrsi(
        &mut self,
        csr: CSRegister,
        imm: u64,
        rd: XRegister,
    ) -> Result<(), Exception> {
        let imm = imm & 0b11111;
        let old = if imm == 0 {
            self.csr_read(csr)?
        } else {
            self.csr_write_check(csr)?;
            let old = self.csregisters.set_bits(csr, imm);
            self.csr_side_effects(csr);
            old
        };

        self.xregisters.write(rd, old);
        Ok(())
    }

    /// Execute the CSRRC instruction.
    pub fn run_csrrc(
        &mut self,
        csr: CSRegister,
        rs1: XRegister,
        rd: XRegister,
    ) -> Result<(), Exception> {
        let old = if rs1.is_zero() {
            self.csr_read(csr)?
        } else {
            self.csr_write_check(csr)?;
            let value = self.xregisters.read(rs1);
            let old = self.csregisters.clear_bits(csr, value);
            self.csr_side_effects(csr);
            old
        };

        self.xregisters.write(rd, old);
        Ok(())
    }

    /// Execute the CSRRCI instruction.
    pub fn run_csrrci(
        &mut self,
        csr: CSRegister,
        imm: u64,
        rd: XRegister,
    ) -> Result<(), Exception> {
        let imm = imm & 0b11111;
        let old = if imm == 0 {
            self.csr_read(csr)?
        } else {
            self.csr_write_check(csr)?;
            let old = self.csregisters.clear_bits(csr, imm);
            self.csr_side_effects(csr);
            old
        };

        self.xregisters.write(rd, old);
        Ok(())
    }

    /// The floating-point CSRs are only accessible while `mstatus.FS` is on.
    pub(crate) fn check_fcsr_enabled(&self, csr: CSRegister) -> Result<(), Exception> {
        match csr {
            CSRegister::fflags | CSRegister::frm | CSRegister::fcsr
                if xstatus::get_FS(self.csregisters.mstatus) == xstatus::ExtensionValue::Off =>
            {
                Err(Exception::IllegalInstruction(0))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine_state::{
        mode::Mode,
        registers::{a0, a1, x0},
    };

    #[test]
    fn test_csrrw_round_trip() {
        let mut state = MachineState::new();
        state.xregisters.write(a0, 0x8000_0100);
        state
            .run_csrrw(CSRegister::mtvec, a0, a1)
            .unwrap();
        assert_eq!(state.xregisters.read(a1), 0);
        assert_eq!(state.csregisters.mtvec, 0x8000_0100);
    }

    #[test]
    fn test_csrrs_with_x0_is_pure_read() {
        let mut state = MachineState::new();
        state.csregisters.mscratch = 0xAA;
        state
            .run_csrrs(CSRegister::mscratch, x0, a0)
            .unwrap();
        assert_eq!(state.xregisters.read(a0), 0xAA);
        assert_eq!(state.csregisters.mscratch, 0xAA);
    }

    #[test]
    fn test_privilege_enforced() {
        let mut state = MachineState::new();
        state.mode = Mode::User;
        assert!(state.run_csrrw(CSRegister::mtvec, a0, a1).is_err());

        // Reads of machine counters from U-mode require counter-enable.
        assert!(state.run_csrrs(CSRegister::cycle, x0, a0).is_err());
        state.csregisters.mcounteren = 0b1;
        state.csregisters.scounteren = 0b1;
        assert!(state.run_csrrs(CSRegister::cycle, x0, a0).is_ok());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let mut state = MachineState::new();
        assert_eq!(
            state.run_csrrw(CSRegister::mvendorid, a0, a1),
            Err(Exception::IllegalInstruction(0))
        );
        // Reading through csrrs with x0 is fine.
        assert!(state.run_csrrs(CSRegister::mvendorid, x0, a0).is_ok());
    }

    #[test]
    fn test_fcsr_gated_by_fs() {
        let mut state = MachineState::new();
        // FS starts Off.
        assert!(state.run_csrrs(CSRegister::fcsr, x0, a0).is_err());

        state.csregisters.mstatus =
            xstatus::set_FS(state.csregisters.mstatus, xstatus::ExtensionValue::Initial);
        assert!(state.run_csrrs(CSRegister::fcsr, x0, a0).is_ok());
    }
}
