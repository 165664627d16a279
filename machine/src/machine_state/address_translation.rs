// SPDX-FileCopyrightText: 2024 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Sv39/Sv48/Sv57 address translation.
//!
//! The walk reads page tables straight from physical memory, updates the
//! A/D bits in place, and raises exactly the page faults mandated by
//! sections 5.3.2 of the privileged spec. Successful translations are
//! cached by the caller in the appropriate TLB.

pub mod pte;
pub mod virtual_address;

use super::{
    csregisters::{satp, xstatus},
    mode::Mode,
    MachineState,
};
use crate::{bits::ones, traps::Exception};
use pte::PPNField;
use satp::{SvLength, TranslationAlgorithm};

/// Offset of the `page offset` field in virtual and physical addresses.
pub const PAGE_OFFSET_WIDTH: usize = 12;

/// The kind of memory access being translated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    /// The page fault corresponding to this access.
    pub const fn page_fault(&self, vaddr: u64) -> Exception {
        match self {
            AccessType::Read => Exception::LoadPageFault(vaddr),
            AccessType::Write => Exception::StorePageFault(vaddr),
            AccessType::Execute => Exception::InstructionPageFault(vaddr),
        }
    }

    /// The access fault corresponding to this access.
    pub const fn access_fault(&self, vaddr: u64) -> Exception {
        match self {
            AccessType::Read => Exception::LoadAccessFault(vaddr),
            AccessType::Write => Exception::StoreAccessFault(vaddr),
            AccessType::Execute => Exception::InstructionAccessFault(vaddr),
        }
    }

    /// The misaligned-address fault corresponding to this access.
    pub const fn misaligned(&self, vaddr: u64) -> Exception {
        match self {
            AccessType::Read => Exception::LoadAddressMisaligned(vaddr),
            AccessType::Write => Exception::StoreAddressMisaligned(vaddr),
            AccessType::Execute => Exception::InstructionAddressMisaligned(vaddr),
        }
    }
}

impl MachineState {
    /// Mode that governs this access: loads and stores honour
    /// `mstatus.MPRV`, instruction fetches never do. Section 3.1.6.3
    pub(crate) fn effective_mode(&self, access: AccessType) -> Mode {
        if access == AccessType::Execute {
            return self.mode;
        }

        let mstatus = self.csregisters.mstatus;
        if xstatus::get_MPRV(mstatus) {
            Mode::from(xstatus::get_MPP(mstatus))
        } else {
            self.mode
        }
    }

    /// Translation algorithm in effect for this access.
    fn translation_algorithm(&self, access: AccessType) -> TranslationAlgorithm {
        if self.effective_mode(access) == Mode::Machine {
            return TranslationAlgorithm::Bare;
        }

        // The WARL transform keeps satp.MODE valid; raw state updates that
        // bypass it fall back to no translation.
        satp::get_MODE(self.csregisters.satp).unwrap_or(TranslationAlgorithm::Bare)
    }

    /// Translate a virtual address, performing the full page-table walk.
    ///
    /// The caller is responsible for caching the result in a TLB.
    pub(crate) fn translate_slow(
        &mut self,
        vaddr: u64,
        access: AccessType,
    ) -> Result<u64, Exception> {
        let length = match self.translation_algorithm(access) {
            TranslationAlgorithm::Bare => return Ok(vaddr),
            TranslationAlgorithm::Sv(length) => length,
        };

        if !virtual_address::is_canonical(vaddr, &length) {
            return Err(access.page_fault(vaddr));
        }

        let mode = self.effective_mode(access);
        let mstatus = self.csregisters.mstatus;
        let sum = xstatus::get_SUM(mstatus);
        let mxr = xstatus::get_MXR(mstatus);

        let levels = length.levels();
        let mut pte_base = satp::get_PPN(self.csregisters.satp) << PAGE_OFFSET_WIDTH;
        let mut i = levels - 1;

        loop {
            let vpn = virtual_address::get_VPN_IDX(vaddr, &length, i)
                .expect("level is always within the virtualization standard");
            let pte_addr = pte_base + vpn * 8;
            let raw_pte: u64 = self
                .read_phys_mem(pte_addr)
                .ok_or_else(|| access.page_fault(vaddr))?;

            if !pte::get_FLAG_V(raw_pte)
                || (!pte::get_FLAG_R(raw_pte) && pte::get_FLAG_W(raw_pte))
                || raw_pte & pte::RESERVED_BITS != 0
            {
                return Err(access.page_fault(vaddr));
            }

            if pte::get_FLAG_R(raw_pte) || pte::get_FLAG_X(raw_pte) {
                return self.leaf_pte(
                    vaddr, access, mode, sum, mxr, &length, i, pte_addr, raw_pte,
                );
            }

            if i == 0 {
                return Err(access.page_fault(vaddr));
            }
            i -= 1;
            pte_base = pte::get_PPN(raw_pte).value() << PAGE_OFFSET_WIDTH;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn leaf_pte(
        &mut self,
        vaddr: u64,
        access: AccessType,
        mode: Mode,
        sum: bool,
        mxr: bool,
        length: &SvLength,
        level: usize,
        pte_addr: u64,
        raw_pte: u64,
    ) -> Result<u64, Exception> {
        // Permission bits for the access itself
        let allowed = match access {
            AccessType::Execute => pte::get_FLAG_X(raw_pte),
            AccessType::Read => pte::get_FLAG_R(raw_pte) || (mxr && pte::get_FLAG_X(raw_pte)),
            AccessType::Write => pte::get_FLAG_W(raw_pte),
        };
        if !allowed {
            return Err(access.page_fault(vaddr));
        }

        // U-bit versus the effective mode. SUM only unlocks loads and
        // stores, never execution. Section 5.3.2, step 6
        match mode {
            Mode::User => {
                if !pte::get_FLAG_U(raw_pte) {
                    return Err(access.page_fault(vaddr));
                }
            }
            Mode::Supervisor => {
                if pte::get_FLAG_U(raw_pte) && (!sum || access == AccessType::Execute) {
                    return Err(access.page_fault(vaddr));
                }
            }
            Mode::Machine => {}
        }

        // Misaligned superpage
        let ppn = pte::get_PPN(raw_pte);
        for j in 0..level {
            if ppn.get_ppn_i(length, j) != Some(0) {
                return Err(access.page_fault(vaddr));
            }
        }

        // A/D update, performed in place
        let mut new_pte = pte::set_FLAG_A(raw_pte, true);
        if access == AccessType::Write {
            new_pte = pte::set_FLAG_D(new_pte, true);
        }
        if new_pte != raw_pte {
            self.write_phys_mem(pte_addr, new_pte)
                .ok_or_else(|| access.page_fault(vaddr))?;
        }

        Ok(compose_paddr(vaddr, length, level, &ppn))
    }
}

/// Join the PPN of a leaf PTE with the untranslated low bits of the virtual
/// address. For superpages (level > 0), the lower VPN fields pass through.
fn compose_paddr(vaddr: u64, length: &SvLength, level: usize, ppn: &PPNField) -> u64 {
    let mut paddr = vaddr & ones(PAGE_OFFSET_WIDTH as u64);

    for j in 0..level {
        let vpn = virtual_address::get_VPN_IDX(vaddr, length, j)
            .expect("level is always within the virtualization standard");
        paddr |= vpn << (PAGE_OFFSET_WIDTH + 9 * j);
    }

    for j in level..length.levels() {
        let part = ppn
            .get_ppn_i(length, j)
            .expect("level is always within the virtualization standard");
        paddr |= part << (PAGE_OFFSET_WIDTH + 9 * j);
    }

    paddr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::Bits64;

    #[test]
    fn test_compose_paddr_regular_page() {
        // Leaf at level 0: all address bits come from the PTE.
        let ppn = PPNField::from_bits(0x80000); // PPN = 0x80000 pages
        let paddr = compose_paddr(0xFFFF_FFC0_0000_0ABC, &SvLength::Sv39, 0, &ppn);
        assert_eq!(paddr, (0x80000 << 12) | 0xABC);
    }

    #[test]
    fn test_compose_paddr_superpage() {
        // 2 MiB superpage (level 1 leaf in Sv39): VPN[0] passes through.
        let vaddr = (0x12_u64 << 21) | (0x55 << 12) | 0x678;
        let ppn = PPNField::from_bits(0x200); // PPN[1] = 1, PPN[0] = 0
        let paddr = compose_paddr(vaddr, &SvLength::Sv39, 1, &ppn);
        assert_eq!(paddr, (1 << 21) | (0x55 << 12) | 0x678);
    }
}
