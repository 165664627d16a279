// SPDX-FileCopyrightText: 2024 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Privileged instructions: trap returns, WFI and address-translation
//! fences.
//!
//! Chapter 3 - Privileged spec

use crate::{
    machine_state::{
        csregisters::xstatus::{self, MPPValue, SPPValue},
        mode::Mode,
        registers::XRegister,
        MachineState,
    },
    traps::Exception,
};

impl MachineState {
    /// `ECALL` instruction: an environment call from the current mode.
    pub fn run_ecall(&self) -> Exception {
        match self.mode {
            Mode::User => Exception::EnvCallFromUMode,
            Mode::Supervisor => Exception::EnvCallFromSMode,
            Mode::Machine => Exception::EnvCallFromMMode,
        }
    }

    /// `MRET` instruction: return from a machine-mode trap handler.
    /// Returns the new program counter.
    pub fn run_mret(&mut self) -> Result<u64, Exception> {
        if self.mode != Mode::Machine {
            return Err(Exception::IllegalInstruction(0));
        }

        let mstatus = self.csregisters.mstatus;
        let previous = xstatus::get_MPP(mstatus);

        // Restore the interrupt-enable stack.
        let mstatus = xstatus::set_MIE(mstatus, xstatus::get_MPIE(mstatus));
        let mstatus = xstatus::set_MPIE(mstatus, true);
        let mstatus = xstatus::set_MPP(mstatus, MPPValue::User);
        // Leaving machine mode drops the modified-privilege override.
        let mstatus = if previous != MPPValue::Machine {
            xstatus::set_MPRV(mstatus, false)
        } else {
            mstatus
        };

        self.csregisters.mstatus = mstatus;
        self.mode = previous.into();
        self.invalidate_caches();
        Ok(self.csregisters.mepc)
    }

    /// `SRET` instruction: return from a supervisor-mode trap handler.
    /// Returns the new program counter.
    pub fn run_sret(&mut self) -> Result<u64, Exception> {
        match self.mode {
            Mode::User => return Err(Exception::IllegalInstruction(0)),
            Mode::Supervisor if xstatus::get_TSR(self.csregisters.mstatus) => {
                return Err(Exception::IllegalInstruction(0))
            }
            _ => {}
        }

        let mstatus = self.csregisters.mstatus;
        let previous = xstatus::get_SPP(mstatus);

        let mstatus = xstatus::set_SIE(mstatus, xstatus::get_SPIE(mstatus));
        let mstatus = xstatus::set_SPIE(mstatus, true);
        let mstatus = xstatus::set_SPP(mstatus, SPPValue::User);
        // The target of sret is never machine mode.
        let mstatus = xstatus::set_MPRV(mstatus, false);

        self.csregisters.mstatus = mstatus;
        self.mode = previous.into();
        self.invalidate_caches();
        Ok(self.csregisters.sepc)
    }

    /// `WFI` instruction: enter the idle state until an interrupt is
    /// pending. With `mstatus.TW` set, supervisor-mode WFI traps instead.
    pub fn run_wfi(&mut self) -> Result<(), Exception> {
        match self.mode {
            Mode::User => return Err(Exception::IllegalInstruction(0)),
            Mode::Supervisor if xstatus::get_TW(self.csregisters.mstatus) => {
                return Err(Exception::IllegalInstruction(0))
            }
            _ => {}
        }

        // If an interrupt is already pending, WFI is a no-op.
        if self.csregisters.mip & self.csregisters.mie == 0 {
            self.iflags.i = true;
        }
        Ok(())
    }

    /// `SFENCE.VMA` instruction: order page-table updates before subsequent
    /// translations. All cached translations are discarded regardless of
    /// the requested address/ASID granularity.
    pub fn run_sfence_vma(
        &mut self,
        _vaddr: XRegister,
        _asid: XRegister,
    ) -> Result<(), Exception> {
        match self.mode {
            Mode::User => return Err(Exception::IllegalInstruction(0)),
            Mode::Supervisor if xstatus::get_TVM(self.csregisters.mstatus) => {
                return Err(Exception::IllegalInstruction(0))
            }
            _ => {}
        }

        self.tlb.flush();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine_state::{csregisters::xstatus, MachineState};

    #[test]
    fn test_mret_restores_previous_mode() {
        let mut state = MachineState::new();
        state.csregisters.mepc = 0x8000_0040;
        let mstatus = xstatus::set_MPP(state.csregisters.mstatus, xstatus::MPPValue::Supervisor);
        state.csregisters.mstatus = xstatus::set_MPIE(mstatus, true);

        let pc = state.run_mret().unwrap();
        assert_eq!(pc, 0x8000_0040);
        assert_eq!(state.mode, Mode::Supervisor);
        assert!(xstatus::get_MIE(state.csregisters.mstatus));
        assert!(xstatus::get_MPIE(state.csregisters.mstatus));
        assert_eq!(
            xstatus::get_MPP(state.csregisters.mstatus),
            xstatus::MPPValue::User
        );
    }

    #[test]
    fn test_mret_requires_machine_mode() {
        let mut state = MachineState::new();
        state.mode = Mode::Supervisor;
        assert_eq!(state.run_mret(), Err(Exception::IllegalInstruction(0)));
    }

    #[test]
    fn test_sret_honours_tsr() {
        let mut state = MachineState::new();
        state.mode = Mode::Supervisor;
        state.csregisters.mstatus = xstatus::set_TSR(state.csregisters.mstatus, true);
        assert_eq!(state.run_sret(), Err(Exception::IllegalInstruction(0)));
    }

    #[test]
    fn test_sfence_vma_flushes_translations() {
        use crate::machine_state::registers::x0;

        let mut state = MachineState::new();
        state.tlb.read.refill(0x8000_0000, 0x8000_0000, 0);
        state.tlb.code.refill(0x8000_0000, 0x8000_0000, 0);

        state.run_sfence_vma(x0, x0).unwrap();
        assert_eq!(state.tlb.read.hit(0x8000_0000), None);
        assert_eq!(state.tlb.code.hit(0x8000_0000), None);

        // TVM traps supervisor-mode fences.
        state.mode = Mode::Supervisor;
        state.csregisters.mstatus = xstatus::set_TVM(state.csregisters.mstatus, true);
        assert_eq!(
            state.run_sfence_vma(x0, x0),
            Err(Exception::IllegalInstruction(0))
        );
    }

    #[test]
    fn test_wfi_sets_idle_only_without_pending() {
        let mut state = MachineState::new();
        state.run_wfi().unwrap();
        assert!(state.iflags.i);

        let mut state = MachineState::new();
        state.csregisters.mie = 1 << 7;
        state.csregisters.mip = 1 << 7;
        state.run_wfi().unwrap();
        assert!(!state.iflags.i);
    }
}
