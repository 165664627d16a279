// SPDX-FileCopyrightText: 2023 TriliTech <contact@trili.tech>
// SPDX-FileCopyrightText: 2024 Nomadic Labs <contact@nomadic-labs.com>
//
// SPDX-License-Identifier: MIT

pub mod address_translation;
pub mod csregisters;
pub mod mode;
pub mod registers;
pub mod tlb;

use crate::{
    devices::{clint::ClintState, htif::HtifState},
    pma::{DeviceKind, PmaBody, Pmas},
    traps::Exception,
    uarch::UarchState,
};
use address_translation::AccessType;
use csregisters::{CSRegister, CSRegisters};
use mode::Mode;
use registers::{FRegisters, XRegisters};
use tlb::TlbSet;

/// Elements that can travel over the memory bus
pub trait Elem: Copy {
    const LOG2_SIZE: u64;

    fn load_le(bytes: &[u8]) -> Self;

    fn store_le(self, bytes: &mut [u8]);

    fn to_u64(self) -> u64;

    fn from_u64(value: u64) -> Self;
}

macro_rules! impl_elem_prim {
    ( $x:ty, $log2:expr ) => {
        impl Elem for $x {
            const LOG2_SIZE: u64 = $log2;

            #[inline(always)]
            fn load_le(bytes: &[u8]) -> Self {
                <$x>::from_le_bytes(bytes.try_into().expect("slice has element width"))
            }

            #[inline(always)]
            fn store_le(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_le_bytes())
            }

            #[inline(always)]
            fn to_u64(self) -> u64 {
                self as u64
            }

            #[inline(always)]
            fn from_u64(value: u64) -> Self {
                value as $x
            }
        }
    };
}

impl_elem_prim!(u8, 0);
impl_elem_prim!(u16, 1);
impl_elem_prim!(u32, 2);
impl_elem_prim!(u64, 3);

const fn elem_size<T: Elem>() -> u64 {
    1 << T::LOG2_SIZE
}

// Packed iflags field placement
const IFLAGS_H_SHIFT: u64 = 0;
const IFLAGS_Y_SHIFT: u64 = 1;
const IFLAGS_X_SHIFT: u64 = 2;
const IFLAGS_I_SHIFT: u64 = 3;
const IFLAGS_PRV_SHIFT: u64 = 4;

/// Unpacked iflags register: halted, yielded (manually/automatically) and
/// WFI-idle bits. The privilege field of the packed representation is the
/// [MachineState::mode].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IFlags {
    /// Hart is idle, waiting for an interrupt
    pub i: bool,
    /// Hart yielded manually; absorbing for the current run
    pub y: bool,
    /// Hart halted permanently
    pub h: bool,
    /// Hart yielded automatically (externally interrupted)
    pub x: bool,
}

/// Value of the LR/SC reservation register when no reservation is held
pub const ILRSC_NONE: u64 = u64::MAX;

/// The entire architectural state of the machine.
///
/// A single owning aggregate: it is never copied and carries no host
/// pointers, so it can be committed to the Merkle tree field by field.
pub struct MachineState {
    pub pc: u64,
    pub xregisters: XRegisters,
    pub fregisters: FRegisters,
    pub csregisters: CSRegisters,
    /// LR/SC reservation: physical address of the reserved doubleword, or
    /// [ILRSC_NONE]
    pub ilrsc: u64,
    pub iflags: IFlags,
    /// Current privilege (the PRV field of the packed iflags)
    pub mode: Mode,
    pub clint: ClintState,
    pub htif: HtifState,
    pub uarch: UarchState,
    pub pmas: Pmas,
    pub(crate) tlb: TlbSet,
    /// Loop-break flag; see [MachineState::set_brk]
    pub brk: bool,
}

impl MachineState {
    pub fn new() -> Self {
        Self {
            pc: 0,
            xregisters: XRegisters::new(),
            fregisters: FRegisters::new(),
            csregisters: CSRegisters::new(),
            ilrsc: ILRSC_NONE,
            iflags: IFlags::default(),
            mode: Mode::Machine,
            clint: ClintState::new(0),
            htif: HtifState::new(),
            uarch: UarchState::new(),
            pmas: Pmas::new(),
            tlb: TlbSet::new(),
            brk: false,
        }
    }

    /// Recompute the loop-break flag:
    /// `brk <=> (mip & mie) != 0 \/ iflags.H \/ iflags.Y \/ iflags.X`
    #[inline]
    pub fn set_brk(&mut self) {
        self.brk = (self.csregisters.mip & self.csregisters.mie) != 0
            || self.iflags.h
            || self.iflags.y
            || self.iflags.x;
    }

    /// Packed representation of the iflags register.
    pub fn read_iflags(&self) -> u64 {
        (self.iflags.h as u64) << IFLAGS_H_SHIFT
            | (self.iflags.y as u64) << IFLAGS_Y_SHIFT
            | (self.iflags.x as u64) << IFLAGS_X_SHIFT
            | (self.iflags.i as u64) << IFLAGS_I_SHIFT
            | (self.mode as u64) << IFLAGS_PRV_SHIFT
    }

    /// Replace the iflags register from its packed representation.
    pub fn write_iflags(&mut self, value: u64) {
        self.iflags.h = value >> IFLAGS_H_SHIFT & 1 != 0;
        self.iflags.y = value >> IFLAGS_Y_SHIFT & 1 != 0;
        self.iflags.x = value >> IFLAGS_X_SHIFT & 1 != 0;
        self.iflags.i = value >> IFLAGS_I_SHIFT & 1 != 0;
        // The reserved privilege encoding 0b10 reads back as machine mode.
        self.mode = Mode::try_from((value >> IFLAGS_PRV_SHIFT & 0b11) as u8)
            .unwrap_or(Mode::Machine);
        self.set_brk();
    }

    /// The packed iflags value that a raw write of `value` settles on; the
    /// pure counterpart of [MachineState::write_iflags] followed by
    /// [MachineState::read_iflags]. Used to keep logged writes and their
    /// replay in agreement.
    pub(crate) fn canonical_iflags(value: u64) -> u64 {
        let low = value & 0b1111;
        let prv = match value >> IFLAGS_PRV_SHIFT & 0b11 {
            prv @ (0 | 1) => prv,
            _ => Mode::Machine as u64,
        };
        low | prv << IFLAGS_PRV_SHIFT
    }

    pub fn set_iflags_h(&mut self) {
        self.iflags.h = true;
        self.set_brk();
    }

    pub fn set_iflags_y(&mut self) {
        self.iflags.y = true;
        self.set_brk();
    }

    pub fn set_iflags_x(&mut self) {
        self.iflags.x = true;
        self.set_brk();
    }

    // -------------------------------------------------------------------
    // Raw physical memory access (memory-backed ranges only)
    // -------------------------------------------------------------------

    /// Read an element straight from a memory-backed range. Used by the
    /// page-table walker and the host API; no PMA flags are consulted.
    pub(crate) fn read_phys_mem<T: Elem>(&self, paddr: u64) -> Option<T> {
        let index = self.pmas.find(paddr, elem_size::<T>())?;
        let entry = self.pmas.get(index);
        let range = entry.memory()?;
        let offset = (paddr - entry.start()) as usize;
        Some(T::load_le(
            &range.data()[offset..offset + elem_size::<T>() as usize],
        ))
    }

    /// Write an element straight to a memory-backed range, marking the page
    /// dirty. Used by the page-table walker (A/D updates) and the host API.
    pub(crate) fn write_phys_mem<T: Elem>(&mut self, paddr: u64, value: T) -> Option<()> {
        let index = self.pmas.find(paddr, elem_size::<T>())?;
        let entry = self.pmas.get_mut(index);
        let start = entry.start();
        let range = entry.memory_mut()?;
        let offset = paddr - start;
        range.mark_dirty(offset);
        value.store_le(
            &mut range.data_mut()[offset as usize..(offset + elem_size::<T>()) as usize],
        );
        Some(())
    }

    // -------------------------------------------------------------------
    // Guest memory access
    // -------------------------------------------------------------------

    /// Load an element from virtual address `vaddr` on behalf of the guest.
    pub(crate) fn load<T: Elem>(&mut self, vaddr: u64) -> Result<T, Exception> {
        if vaddr % elem_size::<T>() != 0 {
            return Err(Exception::LoadAddressMisaligned(vaddr));
        }

        if let Some((paddr, index)) = self.tlb.read.hit(vaddr) {
            let entry = self.pmas.get(index);
            let offset = (paddr - entry.start()) as usize;
            let range = entry.memory().expect("read TLB only caches memory ranges");
            return Ok(T::load_le(
                &range.data()[offset..offset + elem_size::<T>() as usize],
            ));
        }

        let paddr = self.translate_slow(vaddr, AccessType::Read)?;
        let Some(index) = self.pmas.find(paddr, elem_size::<T>()) else {
            return Err(Exception::LoadAccessFault(vaddr));
        };

        let entry = self.pmas.get(index);
        let start = entry.start();
        let readable = entry.flags.readable;
        let device = match &entry.body {
            PmaBody::Memory(_) => None,
            PmaBody::Device(kind) => Some(*kind),
        };

        match device {
            None => {
                if !readable {
                    return Err(Exception::LoadAccessFault(vaddr));
                }
                let range = self
                    .pmas
                    .get(index)
                    .memory()
                    .expect("entry is memory-backed");
                let offset = (paddr - start) as usize;
                let value = T::load_le(&range.data()[offset..offset + elem_size::<T>() as usize]);
                self.tlb.read.refill(vaddr, paddr, index);
                Ok(value)
            }
            Some(kind) => {
                let value = self
                    .device_read(kind, paddr - start, T::LOG2_SIZE)
                    .ok_or(Exception::LoadAccessFault(vaddr))?;
                Ok(T::from_u64(value))
            }
        }
    }

    /// Store an element to virtual address `vaddr` on behalf of the guest.
    pub(crate) fn store<T: Elem>(&mut self, vaddr: u64, value: T) -> Result<(), Exception> {
        if vaddr % elem_size::<T>() != 0 {
            return Err(Exception::StoreAddressMisaligned(vaddr));
        }

        if let Some((paddr, index)) = self.tlb.write.hit(vaddr) {
            self.reservation_invalidate(paddr);
            let entry = self.pmas.get_mut(index);
            let start = entry.start();
            let range = entry
                .memory_mut()
                .expect("write TLB only caches memory ranges");
            let offset = paddr - start;
            // The dirty bit is set before the store itself.
            range.mark_dirty(offset);
            value.store_le(
                &mut range.data_mut()[offset as usize..(offset + elem_size::<T>()) as usize],
            );
            return Ok(());
        }

        let paddr = self.translate_slow(vaddr, AccessType::Write)?;
        let Some(index) = self.pmas.find(paddr, elem_size::<T>()) else {
            return Err(Exception::StoreAccessFault(vaddr));
        };

        self.reservation_invalidate(paddr);

        let entry = self.pmas.get(index);
        let start = entry.start();
        let writable = entry.flags.writable;
        let device = match &entry.body {
            PmaBody::Memory(_) => None,
            PmaBody::Device(kind) => Some(*kind),
        };

        match device {
            None => {
                if !writable {
                    return Err(Exception::StoreAccessFault(vaddr));
                }
                let range = self
                    .pmas
                    .get_mut(index)
                    .memory_mut()
                    .expect("entry is memory-backed");
                let offset = paddr - start;
                range.mark_dirty(offset);
                value.store_le(
                    &mut range.data_mut()[offset as usize..(offset + elem_size::<T>()) as usize],
                );
                self.tlb.write.refill(vaddr, paddr, index);
                Ok(())
            }
            Some(kind) => self
                .device_write(kind, paddr - start, value.to_u64(), T::LOG2_SIZE)
                .ok_or(Exception::StoreAccessFault(vaddr)),
        }
    }

    /// Fetch one 16-bit instruction parcel from virtual address `vaddr`.
    /// The caller guarantees 2-byte alignment.
    pub(crate) fn fetch_u16(&mut self, vaddr: u64) -> Result<u16, Exception> {
        if let Some((paddr, index)) = self.tlb.code.hit(vaddr) {
            let entry = self.pmas.get(index);
            let offset = (paddr - entry.start()) as usize;
            let range = entry.memory().expect("code TLB only caches memory ranges");
            return Ok(u16::load_le(&range.data()[offset..offset + 2]));
        }

        let paddr = self.translate_slow(vaddr, AccessType::Execute)?;
        let Some(index) = self.pmas.find(paddr, 2) else {
            return Err(Exception::InstructionAccessFault(vaddr));
        };

        let entry = self.pmas.get(index);
        let (Some(range), true) = (entry.memory(), entry.flags.executable) else {
            return Err(Exception::InstructionAccessFault(vaddr));
        };

        let offset = (paddr - entry.start()) as usize;
        let parcel = u16::load_le(&range.data()[offset..offset + 2]);
        self.tlb.code.refill(vaddr, paddr, index);
        Ok(parcel)
    }

    fn device_read(&mut self, kind: DeviceKind, offset: u64, log2_size: u64) -> Option<u64> {
        match kind {
            DeviceKind::Clint => self.clint_read(offset, log2_size),
            DeviceKind::Htif => self.htif_read(offset, log2_size),
            // The shadows are observable but read-only for the guest.
            DeviceKind::ShadowState | DeviceKind::UarchShadow
                if log2_size == 3 && offset & 7 == 0 =>
            {
                match kind {
                    DeviceKind::ShadowState => crate::shadow::read_shadow_word(self, offset),
                    _ => crate::shadow::read_uarch_shadow_word(self, offset),
                }
            }
            _ => None,
        }
    }

    fn device_write(
        &mut self,
        kind: DeviceKind,
        offset: u64,
        value: u64,
        log2_size: u64,
    ) -> Option<()> {
        match kind {
            DeviceKind::Clint => self.clint_write(offset, value, log2_size),
            DeviceKind::Htif => self.htif_write(offset, value, log2_size),
            DeviceKind::ShadowState | DeviceKind::UarchShadow => None,
        }
    }

    // -------------------------------------------------------------------
    // LR/SC reservation
    // -------------------------------------------------------------------

    /// Record a reservation on the doubleword containing `paddr`.
    #[inline]
    pub(crate) fn reservation_set(&mut self, paddr: u64) {
        self.ilrsc = paddr & !7;
    }

    /// Check whether a reservation matching `paddr` is held.
    #[inline]
    pub(crate) fn reservation_check(&self, paddr: u64) -> bool {
        self.ilrsc == paddr & !7
    }

    /// Drop any reservation.
    #[inline]
    pub(crate) fn reservation_clear(&mut self) {
        self.ilrsc = ILRSC_NONE;
    }

    /// Drop the reservation if `paddr` conflicts with it.
    #[inline]
    fn reservation_invalidate(&mut self, paddr: u64) {
        if self.reservation_check(paddr) {
            self.reservation_clear();
        }
    }

    // -------------------------------------------------------------------
    // CSR access with machine-level side effects
    // -------------------------------------------------------------------

    /// Read a CSR on behalf of the guest, honouring privilege,
    /// counter-enable and floating-point-state rules.
    pub(crate) fn csr_read(&self, csr: CSRegister) -> Result<u64, Exception> {
        self.check_fcsr_enabled(csr)?;
        csregisters::check_privilege(csr, self.mode)?;
        self.csregisters.check_counter_enable(csr, self.mode)?;
        Ok(self.csregisters.read(csr))
    }

    /// Check that the guest may write `csr` at all.
    pub(crate) fn csr_write_check(&self, csr: CSRegister) -> Result<(), Exception> {
        self.check_fcsr_enabled(csr)?;
        csregisters::check_privilege(csr, self.mode)?;
        csregisters::check_write(csr)?;

        // mstatus.TVM traps supervisor access to satp. Section 3.1.6.5
        if csr == CSRegister::satp
            && self.mode == Mode::Supervisor
            && csregisters::xstatus::get_TVM(self.csregisters.mstatus)
        {
            return Err(Exception::IllegalInstruction(0));
        }

        Ok(())
    }

    /// Propagate the machine-level consequences of a CSR write.
    pub(crate) fn csr_side_effects(&mut self, csr: CSRegister) {
        match csr {
            CSRegister::mie | CSRegister::mip | CSRegister::sie | CSRegister::sip => {
                self.set_brk()
            }
            // Anything that can change the active translation invalidates
            // the TLBs.
            CSRegister::satp | CSRegister::mstatus | CSRegister::sstatus => self.tlb.flush(),
            _ => {}
        }
    }

    // -------------------------------------------------------------------
    // Dirty-page bookkeeping
    // -------------------------------------------------------------------

    /// Mark the physical pages cached by live write-TLB entries as dirty.
    /// Called before a Merkle update so no store can be missed.
    pub fn mark_write_tlb_dirty_pages(&mut self) {
        let pages: Vec<(u64, usize)> = self.tlb.write.live_pages().collect();
        for (paddr_page, index) in pages {
            let entry = self.pmas.get_mut(index);
            let start = entry.start();
            if let Some(range) = entry.memory_mut() {
                range.mark_dirty(paddr_page - start);
            }
        }
    }

    // -------------------------------------------------------------------
    // Committed-word access
    // -------------------------------------------------------------------

    /// Read the committed 64-bit word at `paddr`: the exact bytes the
    /// Merkle tree hashes at that address. Device words are materialised
    /// through the same peek used for hashing.
    pub fn read_word(&self, paddr: u64) -> Result<u64, crate::MachineError> {
        if paddr & 7 != 0 {
            return Err(crate::MachineError::OutOfRange {
                address: paddr,
                log2_size: 3,
            });
        }

        let index = self
            .pmas
            .find(paddr, 8)
            .ok_or(crate::MachineError::OutOfRange {
                address: paddr,
                log2_size: 3,
            })?;
        let entry = self.pmas.get(index);
        match &entry.body {
            PmaBody::Memory(range) => {
                let offset = (paddr - entry.start()) as usize;
                Ok(u64::load_le(&range.data()[offset..offset + 8]))
            }
            PmaBody::Device(_) => {
                let page = paddr & !(crate::pma::PAGE_SIZE - 1);
                let mut scratch = vec![0u8; crate::pma::PAGE_SIZE as usize];
                self.peek_page(page, &mut scratch);
                let offset = (paddr - page) as usize;
                Ok(u64::load_le(&scratch[offset..offset + 8]))
            }
        }
    }

    /// Raw write of the committed word at `paddr`. This is the state-update
    /// primitive of the uarch bridge: no architectural side effects beyond
    /// invalidating caches derived from the written state. The write is
    /// canonical: reading the word back yields exactly `value`.
    pub fn write_word(&mut self, paddr: u64, value: u64) -> Result<(), crate::MachineError> {
        use crate::devices::{clint, htif};

        let out_of_range = crate::MachineError::OutOfRange {
            address: paddr,
            log2_size: 3,
        };

        if paddr & 7 != 0 {
            return Err(out_of_range);
        }

        let index = self.pmas.find(paddr, 8).ok_or_else(|| {
            crate::MachineError::OutOfRange {
                address: paddr,
                log2_size: 3,
            }
        })?;
        let entry = self.pmas.get(index);
        let offset = paddr - entry.start();
        let device = match &entry.body {
            PmaBody::Memory(_) => None,
            PmaBody::Device(kind) => Some(*kind),
        };
        match device {
            None => {
                self.write_phys_mem(paddr, value)
                    .expect("range was found and is memory-backed");
                Ok(())
            }
            Some(kind) => match kind {
                DeviceKind::ShadowState => {
                    crate::shadow::write_shadow_word(self, offset, value).ok_or(out_of_range)
                }
                DeviceKind::UarchShadow => {
                    crate::shadow::write_uarch_shadow_word(self, offset, value)
                        .ok_or(out_of_range)
                }
                // Only words the device actually commits are writable;
                // msip0 and mtime are views of shadow-committed state.
                DeviceKind::Clint => match offset {
                    clint::MTIMECMP_REL_ADDR => {
                        self.clint.mtimecmp = value;
                        Ok(())
                    }
                    _ => Err(out_of_range),
                },
                DeviceKind::Htif => match offset {
                    htif::TOHOST_REL_ADDR => {
                        self.htif.tohost = value;
                        Ok(())
                    }
                    htif::FROMHOST_REL_ADDR => {
                        self.htif.fromhost = value;
                        Ok(())
                    }
                    htif::IHALT_REL_ADDR => {
                        self.htif.ihalt = value;
                        Ok(())
                    }
                    htif::ICONSOLE_REL_ADDR => {
                        self.htif.iconsole = value;
                        Ok(())
                    }
                    htif::IYIELD_REL_ADDR => {
                        self.htif.iyield = value;
                        Ok(())
                    }
                    _ => Err(out_of_range),
                },
            },
        }
    }

    /// Materialise the content of the page at `paddr_page` for hashing.
    /// Returns false when the page is pristine.
    pub(crate) fn peek_page(&self, paddr_page: u64, scratch: &mut [u8]) -> bool {
        debug_assert_eq!(paddr_page % crate::pma::PAGE_SIZE, 0);

        let Some(index) = self.pmas.find(paddr_page, crate::pma::PAGE_SIZE) else {
            scratch.fill(0);
            return false;
        };

        let entry = self.pmas.get(index);
        let offset = paddr_page - entry.start();
        match &entry.body {
            PmaBody::Memory(range) => {
                let offset = offset as usize;
                scratch
                    .copy_from_slice(&range.data()[offset..offset + crate::pma::PAGE_SIZE as usize]);
                scratch.iter().any(|byte| *byte != 0)
            }
            PmaBody::Device(kind) => match kind {
                DeviceKind::ShadowState => {
                    crate::shadow::fill_shadow_page(self, scratch);
                    true
                }
                DeviceKind::UarchShadow => {
                    crate::shadow::fill_uarch_shadow_page(self, scratch);
                    true
                }
                DeviceKind::Clint => self.clint_peek(offset, scratch),
                DeviceKind::Htif => self.htif_peek(offset, scratch),
            },
        }
    }
}

impl Default for MachineState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pma::{PmaDid, PmaEntry, PmaFlags, RAM_START};

    fn state_with_ram(length: u64) -> MachineState {
        let mut state = MachineState::new();
        state
            .pmas
            .register(
                PmaEntry::new_memory(RAM_START, length, PmaFlags::ram(), PmaDid::Memory, None)
                    .unwrap(),
            )
            .unwrap();
        state
    }

    #[test]
    fn test_load_store_round_trip() {
        let mut state = state_with_ram(0x4000);
        state.store::<u64>(RAM_START + 8, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(state.load::<u64>(RAM_START + 8).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(state.load::<u32>(RAM_START + 8).unwrap(), 0x5566_7788);
        assert_eq!(state.load::<u8>(RAM_START + 15).unwrap(), 0x11);
    }

    #[test]
    fn test_misaligned_access_traps() {
        let mut state = state_with_ram(0x1000);
        assert_eq!(
            state.load::<u32>(RAM_START + 2),
            Err(Exception::LoadAddressMisaligned(RAM_START + 2))
        );
        assert_eq!(
            state.store::<u16>(RAM_START + 1, 0),
            Err(Exception::StoreAddressMisaligned(RAM_START + 1))
        );
    }

    #[test]
    fn test_unmapped_access_faults() {
        let mut state = state_with_ram(0x1000);
        assert_eq!(
            state.load::<u64>(0x9000_0000),
            Err(Exception::LoadAccessFault(0x9000_0000))
        );
        assert_eq!(
            state.store::<u64>(0x9000_0000, 1),
            Err(Exception::StoreAccessFault(0x9000_0000))
        );
    }

    #[test]
    fn test_store_marks_page_dirty() {
        let mut state = state_with_ram(0x3000);
        let index = state.pmas.find(RAM_START, 8).unwrap();
        state.pmas.get_mut(index).memory_mut().unwrap().clear_dirty();

        state.store::<u8>(RAM_START + 0x1004, 0xAB).unwrap();
        let range = state.pmas.get(index).memory().unwrap();
        assert!(range.is_page_dirty(1));
        assert!(!range.is_page_dirty(0));
        assert!(!range.is_page_dirty(2));
    }

    #[test]
    fn test_store_invalidates_matching_reservation() {
        let mut state = state_with_ram(0x1000);
        state.reservation_set(RAM_START + 16);
        assert!(state.reservation_check(RAM_START + 16));

        // A store elsewhere leaves the reservation alone.
        state.store::<u64>(RAM_START + 32, 1).unwrap();
        assert!(state.reservation_check(RAM_START + 16));

        // A conflicting store drops it.
        state.store::<u32>(RAM_START + 20, 1).unwrap();
        assert!(!state.reservation_check(RAM_START + 16));
    }

    #[test]
    fn test_sv39_translation_and_ad_bits() {
        const V: u64 = 1;
        const R: u64 = 1 << 1;
        const W: u64 = 1 << 2;
        const X: u64 = 1 << 3;
        const A: u64 = 1 << 6;
        const D: u64 = 1 << 7;

        let mut state = state_with_ram(0x4000);
        let root = RAM_START; // level-2 table
        let l1 = RAM_START + 0x1000;
        let l0 = RAM_START + 0x2000;
        let frame = RAM_START + 0x3000;

        // A three-level walk down to virtual page 1.
        state.write_phys_mem::<u64>(root, (l1 >> 12) << 10 | V).unwrap();
        state.write_phys_mem::<u64>(l1, (l0 >> 12) << 10 | V).unwrap();
        state
            .write_phys_mem::<u64>(l0 + 8, (frame >> 12) << 10 | V | R | W | X)
            .unwrap();

        state.csregisters.satp = 8 << 60 | root >> 12;
        state.mode = Mode::Supervisor;

        state.write_phys_mem::<u64>(frame + 0x18, 0xFEED).unwrap();
        assert_eq!(state.load::<u64>(0x1018).unwrap(), 0xFEED);

        // The walk set the A bit in place; D is still clear.
        let pte = state.read_phys_mem::<u64>(l0 + 8).unwrap();
        assert_ne!(pte & A, 0);
        assert_eq!(pte & D, 0);

        state.store::<u64>(0x1018, 0xBEEF).unwrap();
        let pte = state.read_phys_mem::<u64>(l0 + 8).unwrap();
        assert_ne!(pte & D, 0);
        assert_eq!(state.read_phys_mem::<u64>(frame + 0x18), Some(0xBEEF));

        // An unmapped virtual page faults with the faulting address.
        assert_eq!(
            state.load::<u64>(0x2018),
            Err(Exception::LoadPageFault(0x2018))
        );

        // U-mode cannot use a mapping without the U bit.
        state.tlb.flush();
        state.mode = Mode::User;
        assert_eq!(
            state.load::<u64>(0x1018),
            Err(Exception::LoadPageFault(0x1018))
        );
    }

    #[test]
    fn test_iflags_round_trip() {
        let mut state = MachineState::new();
        state.iflags.h = true;
        state.iflags.i = true;
        state.mode = Mode::Supervisor;

        let packed = state.read_iflags();
        let mut other = MachineState::new();
        other.write_iflags(packed);
        assert_eq!(other.iflags, state.iflags);
        assert_eq!(other.mode, Mode::Supervisor);
        assert!(other.brk);
    }

    #[test]
    fn test_brk_follows_mip_mie() {
        let mut state = MachineState::new();
        assert!(!state.brk);

        state.csregisters.mie = CSRegister::MTIP_BIT;
        state.csregisters.mip = CSRegister::MTIP_BIT;
        state.set_brk();
        assert!(state.brk);

        state.csregisters.mip = 0;
        state.set_brk();
        assert!(!state.brk);
    }

    #[test]
    fn test_fetch_requires_executable_range() {
        let mut state = state_with_ram(0x1000);
        // RAM is executable.
        state.store::<u16>(RAM_START, 0x1234).unwrap();
        assert_eq!(state.fetch_u16(RAM_START).unwrap(), 0x1234);

        // Devices are not.
        state
            .pmas
            .register(PmaEntry::device(
                crate::pma::HTIF_START,
                crate::pma::HTIF_LENGTH,
                DeviceKind::Htif,
                PmaDid::Htif,
            ))
            .unwrap();
        assert_eq!(
            state.fetch_u16(crate::pma::HTIF_START),
            Err(Exception::InstructionAccessFault(crate::pma::HTIF_START))
        );
    }
}
