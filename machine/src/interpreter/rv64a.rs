// SPDX-FileCopyrightText: 2024 Nomadic Labs <contact@nomadic-labs.com>
//
// SPDX-License-Identifier: MIT

//! Implementation of the RV64 A extension.
//!
//! Chapter 8 - Unprivileged spec
//!
//! With a single hart there is no other agent to contend with, so the
//! `aq`/`rl` ordering bits are ignored. The LR/SC reservation is tracked in
//! the `ilrsc` register: any trap or conflicting store invalidates it.

use crate::{
    machine_state::{address_translation::AccessType, registers::XRegister, MachineState},
    traps::Exception,
};

impl MachineState {
    /// Translate a virtual address through the matching TLB, falling back to
    /// the full walk. Used when the physical address itself is needed.
    fn translate(&mut self, vaddr: u64, access: AccessType) -> Result<u64, Exception> {
        let tlb = match access {
            AccessType::Read => &self.tlb.read,
            AccessType::Write => &self.tlb.write,
            AccessType::Execute => &self.tlb.code,
        };
        if let Some((paddr, _)) = tlb.hit(vaddr) {
            return Ok(paddr);
        }
        self.translate_slow(vaddr, access)
    }

    /// `LR.W` R-type instruction
    pub fn run_lrw(&mut self, rs1: XRegister, rd: XRegister) -> Result<(), Exception> {
        let vaddr = self.xregisters.read(rs1);
        if vaddr % 4 != 0 {
            return Err(Exception::LoadAddressMisaligned(vaddr));
        }
        let paddr = self.translate(vaddr, AccessType::Read)?;
        let value: u32 = self.load(vaddr)?;
        self.reservation_set(paddr);
        self.xregisters.write(rd, value as i32 as u64);
        Ok(())
    }

    /// `LR.D` R-type instruction
    pub fn run_lrd(&mut self, rs1: XRegister, rd: XRegister) -> Result<(), Exception> {
        let vaddr = self.xregisters.read(rs1);
        if vaddr % 8 != 0 {
            return Err(Exception::LoadAddressMisaligned(vaddr));
        }
        let paddr = self.translate(vaddr, AccessType::Read)?;
        let value: u64 = self.load(vaddr)?;
        self.reservation_set(paddr);
        self.xregisters.write(rd, value);
        Ok(())
    }

    /// `SC.W` R-type instruction
    ///
    /// Succeeds only if the reservation is still valid and covers the bytes
    /// being written: write 0 to `rd` on success, 1 on failure. The
    /// reservation is consumed either way.
    pub fn run_scw(
        &mut self,
        rs1: XRegister,
        rs2: XRegister,
        rd: XRegister,
    ) -> Result<(), Exception> {
        let vaddr = self.xregisters.read(rs1);
        if vaddr % 4 != 0 {
            return Err(Exception::StoreAddressMisaligned(vaddr));
        }
        let paddr = self.translate(vaddr, AccessType::Write)?;
        if self.reservation_check(paddr) {
            self.reservation_clear();
            self.store(vaddr, self.xregisters.read(rs2) as u32)?;
            self.xregisters.write(rd, 0);
        } else {
            self.reservation_clear();
            self.xregisters.write(rd, 1);
        }
        Ok(())
    }

    /// `SC.D` R-type instruction
    ///
    /// See [Self::run_scw].
    pub fn run_scd(
        &mut self,
        rs1: XRegister,
        rs2: XRegister,
        rd: XRegister,
    ) -> Result<(), Exception> {
        let vaddr = self.xregisters.read(rs1);
        if vaddr % 8 != 0 {
            return Err(Exception::StoreAddressMisaligned(vaddr));
        }
        let paddr = self.translate(vaddr, AccessType::Write)?;
        if self.reservation_check(paddr) {
            self.reservation_clear();
            self.store(vaddr, self.xregisters.read(rs2))?;
            self.xregisters.write(rd, 0);
        } else {
            self.reservation_clear();
            self.xregisters.write(rd, 1);
        }
        Ok(())
    }

    /// Generic `AMO*.W` read-modify-write. AMOs fault as stores throughout.
    pub fn run_amo_w(
        &mut self,
        rs1: XRegister,
        rs2: XRegister,
        rd: XRegister,
        f: impl FnOnce(i32, i32) -> i32,
    ) -> Result<(), Exception> {
        let vaddr = self.xregisters.read(rs1);
        if vaddr % 4 != 0 {
            return Err(Exception::StoreAddressMisaligned(vaddr));
        }
        // Check write permission up front so a read-only mapping faults as a
        // store, per the AMO rules.
        self.translate(vaddr, AccessType::Write)?;
        let old: u32 = self.load(vaddr)?;
        let new = f(old as i32, self.xregisters.read(rs2) as i32);
        self.store(vaddr, new as u32)?;
        self.xregisters.write(rd, old as i32 as u64);
        Ok(())
    }

    /// Generic `AMO*.D` read-modify-write.
    pub fn run_amo_d(
        &mut self,
        rs1: XRegister,
        rs2: XRegister,
        rd: XRegister,
        f: impl FnOnce(u64, u64) -> u64,
    ) -> Result<(), Exception> {
        let vaddr = self.xregisters.read(rs1);
        if vaddr % 8 != 0 {
            return Err(Exception::StoreAddressMisaligned(vaddr));
        }
        self.translate(vaddr, AccessType::Write)?;
        let old: u64 = self.load(vaddr)?;
        let new = f(old, self.xregisters.read(rs2));
        self.store(vaddr, new)?;
        self.xregisters.write(rd, old);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        interpreter::tests::state_with_ram,
        machine_state::registers::{a0, a1, a2, a3},
        pma::RAM_START,
    };

    #[test]
    fn test_lr_sc_success_then_fail() {
        let mut state = state_with_ram(0x1000);
        let addr = RAM_START + 64;
        state.store::<u64>(addr, 0x1111).unwrap();
        state.xregisters.write(a0, addr);
        state.xregisters.write(a1, 0x2222);

        // LR.D sets the reservation.
        state.run_lrd(a0, a2).unwrap();
        assert_eq!(state.xregisters.read(a2), 0x1111);

        // SC.D succeeds: rd = 0, memory updated.
        state.run_scd(a0, a1, a3).unwrap();
        assert_eq!(state.xregisters.read(a3), 0);
        assert_eq!(state.load::<u64>(addr).unwrap(), 0x2222);

        // A second SC.D without a fresh LR fails: rd = 1, no store.
        state.xregisters.write(a1, 0x3333);
        state.run_scd(a0, a1, a3).unwrap();
        assert_eq!(state.xregisters.read(a3), 1);
        assert_eq!(state.load::<u64>(addr).unwrap(), 0x2222);
    }

    #[test]
    fn test_sc_fails_after_conflicting_store() {
        let mut state = state_with_ram(0x1000);
        let addr = RAM_START + 64;
        state.xregisters.write(a0, addr);

        state.run_lrd(a0, a2).unwrap();
        // An ordinary store to the reserved doubleword invalidates it.
        state.store::<u8>(addr + 3, 0xFF).unwrap();

        state.run_scd(a0, a1, a3).unwrap();
        assert_eq!(state.xregisters.read(a3), 1);
    }

    #[test]
    fn test_amoadd() {
        let mut state = state_with_ram(0x1000);
        let addr = RAM_START + 32;
        state.store::<u32>(addr, 10).unwrap();
        state.xregisters.write(a0, addr);
        state.xregisters.write(a1, 5);

        state
            .run_amo_w(a0, a1, a2, i32::wrapping_add)
            .unwrap();
        assert_eq!(state.xregisters.read(a2), 10);
        assert_eq!(state.load::<u32>(addr).unwrap(), 15);
    }

    #[test]
    fn test_amo_misaligned() {
        let mut state = state_with_ram(0x1000);
        state.xregisters.write(a0, RAM_START + 2);
        assert_eq!(
            state.run_amo_w(a0, a1, a2, i32::wrapping_add),
            Err(Exception::StoreAddressMisaligned(RAM_START + 2))
        );
    }
}
