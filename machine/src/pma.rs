// SPDX-FileCopyrightText: 2024 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! # Physical Memory Attributes
//!
//! The physical address space is described by an ordered set of disjoint
//! ranges, each either *memory* (owning host storage plus a dirty-page
//! bitmap) or a *device* (a tagged state machine dispatched by kind).
//!
//! ## Memory map
//!
//! | Start         | Range            | Contents                        |
//! |---------------|------------------|---------------------------------|
//! | `0x0000_0000` | 4 KiB            | processor shadow state          |
//! | `0x0000_1000` | 60 KiB           | ROM (reset code)                |
//! | `0x0040_0000` | 4 KiB            | uarch shadow state              |
//! | `0x0200_0000` | 768 KiB          | CLINT                           |
//! | `0x4000_8000` | 4 KiB            | HTIF                            |
//! | `0x7000_0000` | configurable     | uarch RAM                       |
//! | `0x8000_0000` | configurable     | RAM                             |
//!
//! Flash drives may be mapped anywhere that does not collide with the above.

use crate::MachineError;

/// log<sub>2</sub> of the page size
pub const PAGE_LOG2_SIZE: u64 = 12;

/// Page size used for dirty tracking and Merkle leaves
pub const PAGE_SIZE: u64 = 1 << PAGE_LOG2_SIZE;

/// Maximum number of PMA entries
pub const PMA_MAX: usize = 32;

/// Maximum number of flash drives
pub const FLASH_DRIVE_MAX: usize = 8;

/// Start of the processor shadow
pub const SHADOW_STATE_START: u64 = 0x0;
pub const SHADOW_STATE_LENGTH: u64 = 0x1000;

/// Start of the boot ROM
pub const ROM_START: u64 = 0x1000;
pub const ROM_LENGTH: u64 = 0xF000;

/// Start of the uarch shadow
pub const UARCH_SHADOW_START: u64 = 0x40_0000;
pub const UARCH_SHADOW_LENGTH: u64 = 0x1000;

/// Start of the CLINT device
pub const CLINT_START: u64 = 0x0200_0000;
pub const CLINT_LENGTH: u64 = 0xC_0000;

/// Start of the HTIF device
pub const HTIF_START: u64 = 0x4000_8000;
pub const HTIF_LENGTH: u64 = 0x1000;

/// Start of the uarch RAM
pub const UARCH_RAM_START: u64 = 0x7000_0000;

/// Start of main RAM
pub const RAM_START: u64 = 0x8000_0000;

/// What a range is backed by, as recorded in the committed PMA board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PmaDid {
    Memory = 0,
    ShadowState = 1,
    FlashDrive = 2,
    Clint = 3,
    Htif = 4,
    UarchShadow = 5,
    UarchRam = 6,
}

/// Access flags of a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmaFlags {
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// Reads have no side effects
    pub idempotent_read: bool,
    /// Writes have no side effects
    pub idempotent_write: bool,
}

impl PmaFlags {
    /// Flags for RAM-like memory.
    pub const fn ram() -> Self {
        Self {
            readable: true,
            writable: true,
            executable: true,
            idempotent_read: true,
            idempotent_write: true,
        }
    }

    /// Flags for the boot ROM.
    pub const fn rom() -> Self {
        Self {
            readable: true,
            writable: false,
            executable: true,
            idempotent_read: true,
            idempotent_write: false,
        }
    }

    /// Flags for flash drives.
    pub const fn flash_drive() -> Self {
        Self {
            readable: true,
            writable: true,
            executable: false,
            idempotent_read: true,
            idempotent_write: true,
        }
    }

    /// Flags for memory-mapped devices.
    pub const fn device() -> Self {
        Self {
            readable: true,
            writable: true,
            executable: false,
            idempotent_read: false,
            idempotent_write: false,
        }
    }
}

/// Device state machines a PMA can dispatch to. The state itself lives in
/// the machine; the tag only selects the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    ShadowState,
    UarchShadow,
    Clint,
    Htif,
}

/// Memory-backed range: host storage plus a dirty-page bitmap.
#[derive(Debug)]
pub struct MemoryRange {
    data: Vec<u8>,
    /// One bit per page; bit set means the page must be rehashed before the
    /// next Merkle root is produced.
    dirty: Vec<u64>,
}

impl MemoryRange {
    fn new(length: u64) -> Self {
        let pages = (length / PAGE_SIZE) as usize;
        Self {
            data: vec![0; length as usize],
            dirty: vec![u64::MAX; pages.div_ceil(64)],
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Number of pages in this range.
    pub fn page_count(&self) -> u64 {
        self.data.len() as u64 / PAGE_SIZE
    }

    /// Mark the page containing `offset` as dirty.
    #[inline]
    pub fn mark_dirty(&mut self, offset: u64) {
        let page = offset >> PAGE_LOG2_SIZE;
        self.dirty[(page / 64) as usize] |= 1 << (page % 64);
    }

    /// Mark every page as dirty.
    pub fn mark_all_dirty(&mut self) {
        self.dirty.fill(u64::MAX);
    }

    #[inline]
    pub fn is_page_dirty(&self, page: u64) -> bool {
        self.dirty[(page / 64) as usize] & (1 << (page % 64)) != 0
    }

    /// Clear the whole bitmap.
    pub fn clear_dirty(&mut self) {
        self.dirty.fill(0);
    }

    /// Iterate over the indices of dirty pages.
    pub fn dirty_pages(&self) -> impl Iterator<Item = u64> + '_ {
        let pages = self.page_count();
        (0..pages).filter(move |page| self.is_page_dirty(*page))
    }
}

/// What backs a PMA entry
#[derive(Debug)]
pub enum PmaBody {
    Memory(MemoryRange),
    Device(DeviceKind),
}

/// One entry of the PMA map
#[derive(Debug)]
pub struct PmaEntry {
    start: u64,
    length: u64,
    pub flags: PmaFlags,
    pub did: PmaDid,
    pub body: PmaBody,
}

// Field placement within the packed `istart` word of the PMA board.
const ISTART_M: u64 = 1 << 0;
const ISTART_IO: u64 = 1 << 1;
const ISTART_R: u64 = 1 << 3;
const ISTART_W: u64 = 1 << 4;
const ISTART_X: u64 = 1 << 5;
const ISTART_IR: u64 = 1 << 6;
const ISTART_IW: u64 = 1 << 7;
const ISTART_DID_SHIFT: u64 = 8;

impl PmaEntry {
    /// Construct a memory-backed entry, optionally initialised from an image.
    /// The image may be shorter than the range; the rest stays zero.
    pub fn new_memory(
        start: u64,
        length: u64,
        flags: PmaFlags,
        did: PmaDid,
        image: Option<&[u8]>,
    ) -> Result<Self, MachineError> {
        let mut range = MemoryRange::new(length);
        if let Some(image) = image {
            if image.len() as u64 > length {
                return Err(MachineError::ConfigInvalid(format!(
                    "image of {} bytes does not fit in range of {} bytes at {start:#x}",
                    image.len(),
                    length
                )));
            }
            range.data_mut()[..image.len()].copy_from_slice(image);
        }
        Ok(Self {
            start,
            length,
            flags,
            did,
            body: PmaBody::Memory(range),
        })
    }

    /// Construct a device-backed entry.
    pub fn device(start: u64, length: u64, kind: DeviceKind, did: PmaDid) -> Self {
        Self {
            start,
            length,
            flags: PmaFlags::device(),
            did,
            body: PmaBody::Device(kind),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Does `[paddr, paddr + len)` lie entirely within this range?
    #[inline]
    pub fn contains(&self, paddr: u64, len: u64) -> bool {
        paddr >= self.start
            && len <= self.length
            && paddr - self.start <= self.length - len
    }

    pub fn memory(&self) -> Option<&MemoryRange> {
        match &self.body {
            PmaBody::Memory(range) => Some(range),
            PmaBody::Device(_) => None,
        }
    }

    pub fn memory_mut(&mut self) -> Option<&mut MemoryRange> {
        match &mut self.body {
            PmaBody::Memory(range) => Some(range),
            PmaBody::Device(_) => None,
        }
    }

    /// The packed `istart` word recorded in the committed PMA board.
    pub fn istart(&self) -> u64 {
        let mut istart = self.start;
        match self.body {
            PmaBody::Memory(_) => istart |= ISTART_M,
            PmaBody::Device(_) => istart |= ISTART_IO,
        }
        if self.flags.readable {
            istart |= ISTART_R;
        }
        if self.flags.writable {
            istart |= ISTART_W;
        }
        if self.flags.executable {
            istart |= ISTART_X;
        }
        if self.flags.idempotent_read {
            istart |= ISTART_IR;
        }
        if self.flags.idempotent_write {
            istart |= ISTART_IW;
        }
        istart | ((self.did as u64) << ISTART_DID_SHIFT)
    }

    /// The packed `ilength` word recorded in the committed PMA board.
    pub fn ilength(&self) -> u64 {
        self.length
    }
}

/// The PMA map: disjoint entries sorted by start address.
#[derive(Debug, Default)]
pub struct Pmas {
    entries: Vec<PmaEntry>,
}

impl Pmas {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a new entry. Fails on misalignment, overlap, or a full board.
    pub fn register(&mut self, entry: PmaEntry) -> Result<usize, MachineError> {
        if entry.start % PAGE_SIZE != 0 {
            return Err(MachineError::ConfigInvalid(format!(
                "range start {:#x} is not page-aligned",
                entry.start
            )));
        }
        if entry.length == 0 || entry.length % PAGE_SIZE != 0 {
            return Err(MachineError::ConfigInvalid(format!(
                "range length {:#x} is not a positive multiple of the page size",
                entry.length
            )));
        }
        if self.entries.len() >= PMA_MAX {
            return Err(MachineError::ConfigInvalid(format!(
                "too many ranges (max {PMA_MAX})"
            )));
        }
        let end = entry.start.checked_add(entry.length).ok_or_else(|| {
            MachineError::ConfigInvalid(format!(
                "range at {:#x} wraps the address space",
                entry.start
            ))
        })?;
        for existing in &self.entries {
            if entry.start < existing.start + existing.length && existing.start < end {
                return Err(MachineError::ConfigInvalid(format!(
                    "range {:#x}+{:#x} overlaps existing range {:#x}+{:#x}",
                    entry.start,
                    entry.length,
                    existing.start,
                    existing.length
                )));
            }
        }

        let pos = self
            .entries
            .partition_point(|existing| existing.start < entry.start);
        self.entries.insert(pos, entry);
        Ok(pos)
    }

    /// Index of the entry containing `[paddr, paddr + length)`, if any.
    #[inline]
    pub fn find(&self, paddr: u64, length: u64) -> Option<usize> {
        // First match wins; entries are disjoint so there is at most one.
        self.entries
            .iter()
            .position(|entry| entry.contains(paddr, length))
    }

    pub fn get(&self, index: usize) -> &PmaEntry {
        &self.entries[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut PmaEntry {
        &mut self.entries[index]
    }

    /// Iterate over entries in start order.
    pub fn iter(&self) -> impl Iterator<Item = &PmaEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PmaEntry> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the memory range that matches `(start, length)` exactly with
    /// new contents, preserving flags and ordering. All its pages become
    /// dirty.
    pub fn replace_memory_range(
        &mut self,
        start: u64,
        length: u64,
        image: Option<&[u8]>,
    ) -> Result<(), MachineError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.start == start && entry.length == length)
            .ok_or_else(|| {
                MachineError::ConfigInvalid(format!(
                    "no existing memory range at {start:#x}+{length:#x}"
                ))
            })?;

        let Some(range) = entry.memory_mut() else {
            return Err(MachineError::ConfigInvalid(format!(
                "range at {start:#x} is not memory-backed"
            )));
        };

        if let Some(image) = image {
            if image.len() as u64 > length {
                return Err(MachineError::ConfigInvalid(format!(
                    "image of {} bytes does not fit in range of {length} bytes",
                    image.len()
                )));
            }
        }

        range.data_mut().fill(0);
        if let Some(image) = image {
            let len = image.len();
            range.data_mut()[..len].copy_from_slice(image);
        }
        range.mark_all_dirty();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ram(start: u64, length: u64) -> PmaEntry {
        PmaEntry::new_memory(start, length, PmaFlags::ram(), PmaDid::Memory, None).unwrap()
    }

    #[test]
    fn test_register_and_find() {
        let mut pmas = Pmas::new();
        pmas.register(ram(RAM_START, 0x4000)).unwrap();
        pmas.register(PmaEntry::device(
            CLINT_START,
            CLINT_LENGTH,
            DeviceKind::Clint,
            PmaDid::Clint,
        ))
        .unwrap();

        // Entries are iterated in start order regardless of registration
        // order.
        let starts: Vec<u64> = pmas.iter().map(|e| e.start()).collect();
        assert_eq!(starts, vec![CLINT_START, RAM_START]);

        let ram_index = pmas.find(RAM_START + 0x3FF8, 8).unwrap();
        assert_eq!(pmas.get(ram_index).start(), RAM_START);

        // Straddling the end of the range must not match.
        assert_eq!(pmas.find(RAM_START + 0x3FFC, 8), None);
        assert_eq!(pmas.find(0x1234_5678, 8), None);
    }

    #[test]
    fn test_register_rejects_overlap() {
        let mut pmas = Pmas::new();
        pmas.register(ram(RAM_START, 0x4000)).unwrap();
        assert!(pmas.register(ram(RAM_START + 0x2000, 0x4000)).is_err());
        assert!(pmas.register(ram(RAM_START - 0x1000, 0x2000)).is_err());
    }

    #[test]
    fn test_register_rejects_misalignment() {
        let mut pmas = Pmas::new();
        assert!(pmas
            .register(PmaEntry::new_memory(0x1234, 0x1000, PmaFlags::ram(), PmaDid::Memory, None).unwrap())
            .is_err());
        assert!(pmas
            .register(PmaEntry::new_memory(0x1000, 0x123, PmaFlags::ram(), PmaDid::Memory, None).unwrap())
            .is_err());
    }

    #[test]
    fn test_dirty_tracking() {
        let mut range = MemoryRange::new(0x3000);
        range.clear_dirty();
        assert_eq!(range.dirty_pages().count(), 0);

        range.mark_dirty(0x1234);
        assert!(range.is_page_dirty(1));
        assert_eq!(range.dirty_pages().collect::<Vec<_>>(), vec![1]);

        range.clear_dirty();
        assert_eq!(range.dirty_pages().count(), 0);
    }

    #[test]
    fn test_istart_packing() {
        let entry = ram(RAM_START, 0x1000);
        let istart = entry.istart();
        assert_eq!(istart & !0xFFF, RAM_START);
        assert_ne!(istart & ISTART_M, 0);
        assert_eq!(istart & ISTART_IO, 0);
        assert_eq!((istart >> ISTART_DID_SHIFT) & 0xF, PmaDid::Memory as u64);
    }

    #[test]
    fn test_replace_memory_range() {
        let mut pmas = Pmas::new();
        pmas.register(ram(RAM_START, 0x2000)).unwrap();

        pmas.replace_memory_range(RAM_START, 0x2000, Some(&[1, 2, 3]))
            .unwrap();
        let entry = pmas.get(pmas.find(RAM_START, 1).unwrap());
        assert_eq!(&entry.memory().unwrap().data()[..4], &[1, 2, 3, 0]);

        // Length mismatch is an error.
        assert!(pmas.replace_memory_range(RAM_START, 0x1000, None).is_err());
    }
}
