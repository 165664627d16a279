// SPDX-FileCopyrightText: 2024 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Committed layout of the processor state.
//!
//! Every architectural register has a fixed word address inside the shadow
//! range at physical address 0. This is what makes the whole machine state
//! Merkle-addressable: hashing the shadow page commits the processor, and
//! the uarch manipulates the big machine purely through these addresses.
//!
//! Layout of the shadow page:
//!
//! | Offset  | Contents                         |
//! |---------|----------------------------------|
//! | `0x000` | `x0`..`x31`                      |
//! | `0x100` | `f0`..`f31`                      |
//! | `0x180` | CSRs and machine registers, in [MachineCsr] order |
//! | `0x800` | PMA board: `(istart, ilength)` pairs |
//!
//! The uarch shadow at [crate::pma::UARCH_SHADOW_START] holds the uarch
//! registers: `x0..x31`, then pc, cycle and the halt flag.

use crate::{
    machine_state::MachineState,
    pma::{self, PMA_MAX},
};
use num_enum::TryFromPrimitive;

/// Offset of the f-register file within the shadow
pub const F_BASE: u64 = 0x100;

/// Offset of the machine registers within the shadow
pub const CSR_BASE: u64 = 0x180;

/// Offset of the PMA board within the shadow
pub const PMA_BOARD_BASE: u64 = 0x800;

/// Offset of the uarch pc within the uarch shadow
pub const UARCH_PC: u64 = 0x100;

/// Offset of the uarch cycle counter within the uarch shadow
pub const UARCH_CYCLE: u64 = 0x108;

/// Offset of the uarch halt flag within the uarch shadow
pub const UARCH_HALT: u64 = 0x110;

/// Machine registers with a committed shadow address, in shadow order.
///
/// This is the flat register namespace of the host API: every committed
/// field that is not an x/f register or memory has an entry here.
#[allow(non_camel_case_types)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::EnumIter,
    strum::Display,
    TryFromPrimitive,
)]
#[repr(usize)]
pub enum MachineCsr {
    pc = 0,
    fcsr,
    mvendorid,
    marchid,
    mimpid,
    mcycle,
    minstret,
    mstatus,
    mtvec,
    mscratch,
    mepc,
    mcause,
    mtval,
    misa,
    mie,
    mip,
    medeleg,
    mideleg,
    mcounteren,
    menvcfg,
    stvec,
    sscratch,
    sepc,
    scause,
    stval,
    satp,
    scounteren,
    senvcfg,
    ilrsc,
    iflags,
    clint_mtimecmp,
    htif_tohost,
    htif_fromhost,
    htif_ihalt,
    htif_iconsole,
    htif_iyield,
}

impl MachineCsr {
    /// Number of registers committed inside the processor shadow. The
    /// device registers that follow are committed inside their device
    /// ranges instead, so every committed field has exactly one address.
    pub(crate) const SHADOW_COUNT: usize = MachineCsr::iflags as usize + 1;

    /// Committed physical address of this register.
    pub const fn address(self) -> u64 {
        match self {
            MachineCsr::clint_mtimecmp => {
                pma::CLINT_START + crate::devices::clint::MTIMECMP_REL_ADDR
            }
            MachineCsr::htif_tohost => pma::HTIF_START + crate::devices::htif::TOHOST_REL_ADDR,
            MachineCsr::htif_fromhost => {
                pma::HTIF_START + crate::devices::htif::FROMHOST_REL_ADDR
            }
            MachineCsr::htif_ihalt => pma::HTIF_START + crate::devices::htif::IHALT_REL_ADDR,
            MachineCsr::htif_iconsole => {
                pma::HTIF_START + crate::devices::htif::ICONSOLE_REL_ADDR
            }
            MachineCsr::htif_iyield => pma::HTIF_START + crate::devices::htif::IYIELD_REL_ADDR,
            _ => pma::SHADOW_STATE_START + CSR_BASE + 8 * self as u64,
        }
    }
}

/// Committed physical address of integer register `x<index>`.
pub const fn x_address(index: usize) -> u64 {
    pma::SHADOW_STATE_START + 8 * index as u64
}

/// Committed physical address of floating-point register `f<index>`.
pub const fn f_address(index: usize) -> u64 {
    pma::SHADOW_STATE_START + F_BASE + 8 * index as u64
}

/// Committed physical address of uarch register `x<index>`.
pub const fn uarch_x_address(index: usize) -> u64 {
    pma::UARCH_SHADOW_START + 8 * index as u64
}

/// Committed physical address of the uarch pc.
pub const fn uarch_pc_address() -> u64 {
    pma::UARCH_SHADOW_START + UARCH_PC
}

/// Committed physical address of the uarch cycle counter.
pub const fn uarch_cycle_address() -> u64 {
    pma::UARCH_SHADOW_START + UARCH_CYCLE
}

/// Committed physical address of the uarch halt flag.
pub const fn uarch_halt_address() -> u64 {
    pma::UARCH_SHADOW_START + UARCH_HALT
}

/// Raw read of a machine register.
pub fn read_machine_csr(state: &MachineState, csr: MachineCsr) -> u64 {
    let csrs = &state.csregisters;
    match csr {
        MachineCsr::pc => state.pc,
        MachineCsr::fcsr => csrs.fcsr,
        MachineCsr::mvendorid => csrs.mvendorid,
        MachineCsr::marchid => csrs.marchid,
        MachineCsr::mimpid => csrs.mimpid,
        MachineCsr::mcycle => csrs.mcycle,
        MachineCsr::minstret => csrs.minstret,
        MachineCsr::mstatus => csrs.mstatus,
        MachineCsr::mtvec => csrs.mtvec,
        MachineCsr::mscratch => csrs.mscratch,
        MachineCsr::mepc => csrs.mepc,
        MachineCsr::mcause => csrs.mcause,
        MachineCsr::mtval => csrs.mtval,
        MachineCsr::misa => csrs.misa,
        MachineCsr::mie => csrs.mie,
        MachineCsr::mip => csrs.mip,
        MachineCsr::medeleg => csrs.medeleg,
        MachineCsr::mideleg => csrs.mideleg,
        MachineCsr::mcounteren => csrs.mcounteren,
        MachineCsr::menvcfg => csrs.menvcfg,
        MachineCsr::stvec => csrs.stvec,
        MachineCsr::sscratch => csrs.sscratch,
        MachineCsr::sepc => csrs.sepc,
        MachineCsr::scause => csrs.scause,
        MachineCsr::stval => csrs.stval,
        MachineCsr::satp => csrs.satp,
        MachineCsr::scounteren => csrs.scounteren,
        MachineCsr::senvcfg => csrs.senvcfg,
        MachineCsr::ilrsc => state.ilrsc,
        MachineCsr::iflags => state.read_iflags(),
        MachineCsr::clint_mtimecmp => state.clint.mtimecmp,
        MachineCsr::htif_tohost => state.htif.tohost,
        MachineCsr::htif_fromhost => state.htif.fromhost,
        MachineCsr::htif_ihalt => state.htif.ihalt,
        MachineCsr::htif_iconsole => state.htif.iconsole,
        MachineCsr::htif_iyield => state.htif.iyield,
    }
}

/// Raw write of a machine register.
///
/// No WARL masking is applied: this is the committed-state update
/// primitive, and whoever drives it (the uarch program, the host API) is
/// expected to implement the architectural rules itself. Caches that
/// depend on the written value are invalidated.
pub fn write_machine_csr(state: &mut MachineState, csr: MachineCsr, value: u64) {
    let csrs = &mut state.csregisters;
    match csr {
        MachineCsr::pc => state.pc = value,
        MachineCsr::fcsr => csrs.fcsr = value,
        MachineCsr::mvendorid => csrs.mvendorid = value,
        MachineCsr::marchid => csrs.marchid = value,
        MachineCsr::mimpid => csrs.mimpid = value,
        MachineCsr::mcycle => csrs.mcycle = value,
        MachineCsr::minstret => csrs.minstret = value,
        MachineCsr::mstatus => csrs.mstatus = value,
        MachineCsr::mtvec => csrs.mtvec = value,
        MachineCsr::mscratch => csrs.mscratch = value,
        MachineCsr::mepc => csrs.mepc = value,
        MachineCsr::mcause => csrs.mcause = value,
        MachineCsr::mtval => csrs.mtval = value,
        MachineCsr::misa => csrs.misa = value,
        MachineCsr::mie => csrs.mie = value,
        MachineCsr::mip => csrs.mip = value,
        MachineCsr::medeleg => csrs.medeleg = value,
        MachineCsr::mideleg => csrs.mideleg = value,
        MachineCsr::mcounteren => csrs.mcounteren = value,
        MachineCsr::menvcfg => csrs.menvcfg = value,
        MachineCsr::stvec => csrs.stvec = value,
        MachineCsr::sscratch => csrs.sscratch = value,
        MachineCsr::sepc => csrs.sepc = value,
        MachineCsr::scause => csrs.scause = value,
        MachineCsr::stval => csrs.stval = value,
        MachineCsr::satp => csrs.satp = value,
        MachineCsr::scounteren => csrs.scounteren = value,
        MachineCsr::senvcfg => csrs.senvcfg = value,
        MachineCsr::ilrsc => state.ilrsc = value,
        MachineCsr::iflags => state.write_iflags(value),
        MachineCsr::clint_mtimecmp => state.clint.mtimecmp = value,
        MachineCsr::htif_tohost => state.htif.tohost = value,
        MachineCsr::htif_fromhost => state.htif.fromhost = value,
        MachineCsr::htif_ihalt => state.htif.ihalt = value,
        MachineCsr::htif_iconsole => state.htif.iconsole = value,
        MachineCsr::htif_iyield => state.htif.iyield = value,
    }
    state.invalidate_caches();
}

impl MachineState {
    /// Invalidate everything derived from the committed state: TLBs and the
    /// loop-break flag. Used after raw state updates that bypass the
    /// architectural write paths.
    pub(crate) fn invalidate_caches(&mut self) {
        self.tlb.flush();
        self.set_brk();
    }
}

/// Read the committed word at `offset` inside the shadow range. Unoccupied
/// offsets read as zero; `None` only for out-of-range offsets.
pub fn read_shadow_word(state: &MachineState, offset: u64) -> Option<u64> {
    if offset >= pma::SHADOW_STATE_LENGTH || offset & 7 != 0 {
        return None;
    }

    let word = if offset < F_BASE {
        state.xregisters.read_index((offset / 8) as usize)
    } else if offset < CSR_BASE {
        state.fregisters.read_index(((offset - F_BASE) / 8) as usize)
    } else {
        match MachineCsr::try_from(((offset - CSR_BASE) / 8) as usize) {
            Ok(csr) if (csr as usize) < MachineCsr::SHADOW_COUNT => read_machine_csr(state, csr),
            _ => pma_board_word(state, offset).unwrap_or(0),
        }
    };
    Some(word)
}

fn pma_board_word(state: &MachineState, offset: u64) -> Option<u64> {
    if !(PMA_BOARD_BASE..PMA_BOARD_BASE + (PMA_MAX as u64) * 16).contains(&offset) {
        return None;
    }
    let slot = ((offset - PMA_BOARD_BASE) / 16) as usize;
    if slot >= state.pmas.len() {
        // Unpopulated board slots are pristine.
        return Some(0);
    }
    let entry = state.pmas.get(slot);
    if (offset - PMA_BOARD_BASE) % 16 == 0 {
        Some(entry.istart())
    } else {
        Some(entry.ilength())
    }
}

/// Write the committed word at `offset` inside the shadow range. The PMA
/// board and unoccupied offsets are not writable.
pub fn write_shadow_word(state: &mut MachineState, offset: u64, value: u64) -> Option<()> {
    if offset >= pma::SHADOW_STATE_LENGTH || offset & 7 != 0 {
        return None;
    }

    if offset < F_BASE {
        state.xregisters.write_index((offset / 8) as usize, value);
        Some(())
    } else if offset < CSR_BASE {
        state
            .fregisters
            .write_index(((offset - F_BASE) / 8) as usize, value);
        Some(())
    } else {
        let csr = MachineCsr::try_from(((offset - CSR_BASE) / 8) as usize).ok()?;
        if csr as usize >= MachineCsr::SHADOW_COUNT {
            return None;
        }
        write_machine_csr(state, csr, value);
        Some(())
    }
}

/// Read the committed word at `offset` inside the uarch shadow.
pub fn read_uarch_shadow_word(state: &MachineState, offset: u64) -> Option<u64> {
    if offset >= pma::UARCH_SHADOW_LENGTH || offset & 7 != 0 {
        return None;
    }

    let word = if offset < UARCH_PC {
        state.uarch.read_x((offset / 8) as usize)
    } else {
        match offset {
            UARCH_PC => state.uarch.pc,
            UARCH_CYCLE => state.uarch.cycle,
            UARCH_HALT => state.uarch.halt as u64,
            _ => 0,
        }
    };
    Some(word)
}

/// Write the committed word at `offset` inside the uarch shadow.
pub fn write_uarch_shadow_word(state: &mut MachineState, offset: u64, value: u64) -> Option<()> {
    if offset >= pma::UARCH_SHADOW_LENGTH || offset & 7 != 0 {
        return None;
    }

    if offset < UARCH_PC {
        state.uarch.write_x((offset / 8) as usize, value);
        return Some(());
    }

    match offset {
        UARCH_PC => {
            state.uarch.pc = value;
            Some(())
        }
        UARCH_CYCLE => {
            state.uarch.cycle = value;
            Some(())
        }
        UARCH_HALT => {
            state.uarch.halt = value != 0;
            Some(())
        }
        _ => None,
    }
}

/// Materialise the shadow page for hashing. The shadow is a single page
/// and is never pristine (misa alone is non-zero).
pub fn fill_shadow_page(state: &MachineState, scratch: &mut [u8]) {
    scratch.fill(0);
    for offset in (0..pma::SHADOW_STATE_LENGTH).step_by(8) {
        let word = read_shadow_word(state, offset).unwrap_or(0);
        if word != 0 {
            scratch[offset as usize..offset as usize + 8].copy_from_slice(&word.to_le_bytes());
        }
    }
}

/// Materialise the uarch shadow page for hashing.
pub fn fill_uarch_shadow_page(state: &MachineState, scratch: &mut [u8]) {
    scratch.fill(0);
    for offset in (0..pma::UARCH_SHADOW_LENGTH).step_by(8) {
        let word = read_uarch_shadow_word(state, offset).unwrap_or(0);
        if word != 0 {
            scratch[offset as usize..offset as usize + 8].copy_from_slice(&word.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine_state::registers;
    use strum::IntoEnumIterator;

    #[test]
    fn test_addresses_are_disjoint_words() {
        let mut addresses: Vec<u64> = (0..32).map(x_address).collect();
        addresses.extend((0..32).map(f_address));
        addresses.extend(MachineCsr::iter().map(MachineCsr::address));

        let mut sorted = addresses.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), addresses.len());
        assert!(addresses.iter().all(|a| a % 8 == 0));

        // The shadow-resident registers fit below the PMA board; the rest
        // are committed inside their device ranges.
        for csr in MachineCsr::iter() {
            if (csr as usize) < MachineCsr::SHADOW_COUNT {
                assert!(csr.address() < PMA_BOARD_BASE);
            } else {
                assert!(csr.address() >= pma::CLINT_START);
            }
        }
    }

    #[test]
    fn test_round_trip_through_shadow() {
        let mut state = MachineState::new();
        state.xregisters.write(registers::x5, 0xDEAD);
        state.csregisters.mepc = 0xBEEF;

        assert_eq!(read_shadow_word(&state, x_address(5)), Some(0xDEAD));
        assert_eq!(
            read_shadow_word(&state, MachineCsr::mepc.address()),
            Some(0xBEEF)
        );

        write_shadow_word(&mut state, MachineCsr::mepc.address(), 0x1234).unwrap();
        assert_eq!(state.csregisters.mepc, 0x1234);

        // x0 writes are discarded.
        write_shadow_word(&mut state, x_address(0), 7).unwrap();
        assert_eq!(read_shadow_word(&state, x_address(0)), Some(0));
    }

    #[test]
    fn test_shadow_page_matches_words() {
        let mut state = MachineState::new();
        state.pc = 0x8000_1234;
        state.ilrsc = 77;

        let mut scratch = vec![0u8; pma::SHADOW_STATE_LENGTH as usize];
        fill_shadow_page(&state, &mut scratch);

        for offset in (0..pma::SHADOW_STATE_LENGTH).step_by(8) {
            let from_page =
                u64::from_le_bytes(scratch[offset as usize..offset as usize + 8].try_into().unwrap());
            assert_eq!(
                read_shadow_word(&state, offset),
                Some(from_page),
                "mismatch at shadow offset {offset:#x}"
            );
        }
    }

    #[test]
    fn test_uarch_shadow_round_trip() {
        let mut state = MachineState::new();
        write_uarch_shadow_word(&mut state, UARCH_PC, 0x7000_0000).unwrap();
        write_uarch_shadow_word(&mut state, UARCH_HALT, 1).unwrap();
        assert_eq!(state.uarch.pc, 0x7000_0000);
        assert!(state.uarch.halt);
        assert_eq!(read_uarch_shadow_word(&state, UARCH_HALT), Some(1));
    }
}
