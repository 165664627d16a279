// SPDX-FileCopyrightText: 2024 Nomadic Labs <contact@nomadic-labs.com>
// SPDX-FileCopyrightText: 2024 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! A deterministic RISC-V machine emulator whose entire architectural
//! state is committed to a Merkle tree.
//!
//! A prover runs guest programs at speed through the interpreter. A
//! verifier, given a pre-state root, a single-step access log of the
//! embedded microarchitecture, and a post-state root, independently
//! checks that the step was the unique legal transition, with no access to
//! the emulator.
//!
//! Architectural faults (misaligned accesses, page faults, illegal
//! instructions, environment calls) are delivered to the guest per the
//! privileged spec and never surface here. [MachineError] covers only
//! engine-level failures, and no partial mutation is observable when one
//! is returned.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod access_log;
pub mod bits;
pub mod config;
pub mod devices;
pub mod interpreter;
pub mod machine_state;
pub mod merkle;
pub mod parser;
pub mod pma;
pub mod rtc;
pub mod shadow;
pub mod traps;
pub mod uarch;

use access_log::{Access, AccessKind, Replay};
use machine_state::MachineState;
use merkle::{hash_data, page_sibling_hashes, MerkleHash, MerkleProof, MerkleTree};
use pma::{DeviceKind, PmaBody, PmaDid, PmaEntry, PmaFlags, PAGE_LOG2_SIZE, PAGE_SIZE};
use uarch::{LoggedAccessExt, UarchAccess};

pub use access_log::AccessLog;
pub use config::MachineConfig;
pub use interpreter::BreakReason;
pub use merkle::{MerkleHash as Hash, MerkleProof as Proof};
pub use shadow::MachineCsr;
pub use uarch::UarchBreakReason;

/// Engine-level failures surfaced to the caller.
///
/// These never reach the guest, and a returned error leaves the machine
/// observably unchanged.
#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("invalid machine configuration: {0}")]
    ConfigInvalid(String),
    #[error("address {address:#x} is out of range for a node of log2_size {log2_size}")]
    OutOfRange { address: u64, log2_size: u64 },
    #[error("machine state is inconsistent: {0}")]
    StateInconsistent(String),
    #[error("access log verification failed: {0}")]
    LogMismatch(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The machine: architectural state plus its Merkle commitment.
///
/// A single owning aggregate with a pinned identity for the lifetime of a
/// run; it is never copied and multiple independent instances can coexist.
pub struct Machine {
    state: MachineState,
    tree: MerkleTree,
    config: MachineConfig,
}

impl Machine {
    /// Build a machine from its configuration. The Merkle tree is brought
    /// up to date, so the initial root hash is immediately available.
    pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
        config.validate()?;

        let mut state = MachineState::new();

        // Processor registers
        let processor = &config.processor;
        for (index, value) in processor.x.iter().enumerate() {
            state.xregisters.write_index(index, *value);
        }
        state.pc = processor.pc;
        state.ilrsc = processor.ilrsc;
        state.write_iflags(processor.iflags);

        let csrs = &mut state.csregisters;
        csrs.fcsr = processor.fcsr;
        csrs.mvendorid = processor.mvendorid;
        csrs.marchid = processor.marchid;
        csrs.mimpid = processor.mimpid;
        csrs.mcycle = processor.mcycle;
        csrs.minstret = processor.minstret;
        csrs.mstatus = processor.mstatus;
        csrs.mtvec = processor.mtvec;
        csrs.mscratch = processor.mscratch;
        csrs.mepc = processor.mepc;
        csrs.mcause = processor.mcause;
        csrs.mtval = processor.mtval;
        csrs.mie = processor.mie;
        csrs.mip = processor.mip;
        csrs.medeleg = processor.medeleg;
        csrs.mideleg = processor.mideleg;
        csrs.mcounteren = processor.mcounteren;
        csrs.menvcfg = processor.menvcfg;
        csrs.stvec = processor.stvec;
        csrs.sscratch = processor.sscratch;
        csrs.sepc = processor.sepc;
        csrs.scause = processor.scause;
        csrs.stval = processor.stval;
        csrs.satp = processor.satp;
        csrs.scounteren = processor.scounteren;
        csrs.senvcfg = processor.senvcfg;

        // Device state
        state.clint.mtimecmp = config.clint.mtimecmp;
        state.htif.tohost = config.htif.tohost;
        state.htif.fromhost = config.htif.fromhost;
        state.htif.ihalt = 1 << devices::htif::HALT_CMD_HALT;
        state.htif.iconsole = (1 << devices::htif::CONSOLE_CMD_PUTCHAR)
            | (config.htif.console_getchar as u64) << devices::htif::CONSOLE_CMD_GETCHAR;
        state.htif.iyield = (config.htif.yield_progress as u64)
            << devices::htif::YIELD_CMD_PROGRESS
            | (config.htif.yield_rollup as u64) << devices::htif::YIELD_CMD_ROLLUP;

        // The PMA board
        state.pmas.register(PmaEntry::device(
            pma::SHADOW_STATE_START,
            pma::SHADOW_STATE_LENGTH,
            DeviceKind::ShadowState,
            PmaDid::ShadowState,
        ))?;
        state.pmas.register(PmaEntry::new_memory(
            pma::ROM_START,
            pma::ROM_LENGTH,
            PmaFlags::rom(),
            PmaDid::Memory,
            Some(&config.rom.image),
        )?)?;
        state.pmas.register(PmaEntry::device(
            pma::UARCH_SHADOW_START,
            pma::UARCH_SHADOW_LENGTH,
            DeviceKind::UarchShadow,
            PmaDid::UarchShadow,
        ))?;
        state.pmas.register(PmaEntry::device(
            pma::CLINT_START,
            pma::CLINT_LENGTH,
            DeviceKind::Clint,
            PmaDid::Clint,
        ))?;
        state.pmas.register(PmaEntry::device(
            pma::HTIF_START,
            pma::HTIF_LENGTH,
            DeviceKind::Htif,
            PmaDid::Htif,
        ))?;
        state.pmas.register(PmaEntry::new_memory(
            pma::UARCH_RAM_START,
            config.uarch.ram_length,
            PmaFlags::ram(),
            PmaDid::UarchRam,
            Some(&config.uarch.ram_image),
        )?)?;
        state.pmas.register(PmaEntry::new_memory(
            pma::RAM_START,
            config.ram.length,
            PmaFlags::ram(),
            PmaDid::Memory,
            Some(&config.ram.image),
        )?)?;
        for drive in &config.flash_drives {
            state.pmas.register(PmaEntry::new_memory(
                drive.start,
                drive.length,
                PmaFlags::flash_drive(),
                PmaDid::FlashDrive,
                Some(&drive.image),
            )?)?;
        }

        state.set_brk();

        let mut machine = Self {
            state,
            tree: MerkleTree::new(),
            config,
        };
        machine.update_merkle_tree()?;
        log::debug!(
            "machine built with {} physical memory ranges",
            machine.state.pmas.len()
        );
        Ok(machine)
    }

    /// The configuration the machine was built from.
    pub fn initial_config(&self) -> &MachineConfig {
        &self.config
    }

    // -------------------------------------------------------------------
    // Running
    // -------------------------------------------------------------------

    /// Run until `mcycle` reaches `mcycle_end`, the machine halts, or the
    /// guest yields.
    pub fn run(&mut self, mcycle_end: u64) -> BreakReason {
        self.state.run(mcycle_end)
    }

    /// Run the microarchitecture until it halts or its cycle counter
    /// reaches `uarch_cycle_end`.
    pub fn run_uarch(&mut self, uarch_cycle_end: u64) -> Result<UarchBreakReason, MachineError> {
        uarch::run_uarch(&mut self.state, uarch_cycle_end)
    }

    /// Restore the microarchitecture to its boot state: registers reset
    /// and RAM reloaded from the configured image.
    pub fn reset_uarch(&mut self) -> Result<(), MachineError> {
        self.state.uarch.reset();
        self.state.pmas.replace_memory_range(
            pma::UARCH_RAM_START,
            self.config.uarch.ram_length,
            Some(&self.config.uarch.ram_image),
        )?;
        self.state.invalidate_caches();
        Ok(())
    }

    // -------------------------------------------------------------------
    // Merkle tree
    // -------------------------------------------------------------------

    fn rehash_page(&mut self, paddr_page: u64, scratch: &mut [u8]) {
        let hash = if self.state.peek_page(paddr_page, scratch) {
            hash_data(scratch, PAGE_LOG2_SIZE)
        } else {
            self.tree.pristine_hash(PAGE_LOG2_SIZE)
        };
        self.tree.set_page_hash(paddr_page, hash);
    }

    /// Bring the tree in sync with the machine state: flush TLB-known
    /// dirty pages, rehash every dirty or device page, recompute the spine
    /// and clear the dirty bitmaps.
    pub fn update_merkle_tree(&mut self) -> Result<(), MachineError> {
        self.state.mark_write_tlb_dirty_pages();

        let mut scratch = vec![0u8; PAGE_SIZE as usize];
        for index in 0..self.state.pmas.len() {
            let entry = self.state.pmas.get(index);
            let start = entry.start();
            let length = entry.length();

            match &entry.body {
                PmaBody::Memory(range) => {
                    let dirty: Vec<u64> = range.dirty_pages().collect();
                    for page in dirty {
                        self.rehash_page(start + page * PAGE_SIZE, &mut scratch);
                    }
                    self.state
                        .pmas
                        .get_mut(index)
                        .memory_mut()
                        .expect("entry was memory-backed above")
                        .clear_dirty();
                }
                PmaBody::Device(_) => {
                    // Device state has no dirty tracking; its few pages are
                    // re-peeked on every update.
                    for offset in (0..length).step_by(PAGE_SIZE as usize) {
                        self.rehash_page(start + offset, &mut scratch);
                    }
                }
            }
        }

        self.tree.recompute_root();
        Ok(())
    }

    /// Rehash the page containing `address` and patch the root.
    pub fn update_merkle_tree_page(&mut self, address: u64) -> Result<(), MachineError> {
        let page = address & !(PAGE_SIZE - 1);
        let mut scratch = vec![0u8; PAGE_SIZE as usize];
        self.rehash_page(page, &mut scratch);
        self.tree.recompute_root();
        Ok(())
    }

    /// Root hash of the up-to-date tree.
    pub fn root_hash(&mut self) -> Result<MerkleHash, MachineError> {
        self.update_merkle_tree()?;
        Ok(self.tree.root_hash())
    }

    /// Proof for the node covering `[address, address + 2^log2_size)`.
    /// The node must be aligned, `3 <= log2_size <= 64`, and sub-page
    /// nodes must lie inside a single PMA range.
    pub fn get_proof(&mut self, address: u64, log2_size: u64) -> Result<MerkleProof, MachineError> {
        self.update_merkle_tree()?;

        let out_of_range = MachineError::OutOfRange { address, log2_size };
        if !(merkle::WORD_LOG2_SIZE..=merkle::TREE_LOG2_SIZE).contains(&log2_size) {
            return Err(out_of_range);
        }
        if log2_size == merkle::TREE_LOG2_SIZE {
            if address != 0 {
                return Err(out_of_range);
            }
            return Ok(MerkleProof {
                address,
                log2_size,
                target_hash: self.tree.root_hash(),
                sibling_hashes: Vec::new(),
                root_hash: self.tree.root_hash(),
            });
        }
        if address & ((1 << log2_size) - 1) != 0 {
            return Err(out_of_range);
        }

        let (target_hash, sibling_hashes) = if log2_size >= PAGE_LOG2_SIZE {
            (
                self.tree.node_hash(address, log2_size),
                self.tree.sibling_hashes_above(address, log2_size),
            )
        } else {
            // Sub-page targets must lie entirely within one PMA range.
            self.state
                .pmas
                .find(address, 1 << log2_size)
                .ok_or(MachineError::OutOfRange { address, log2_size })?;

            let page = address & !(PAGE_SIZE - 1);
            let offset = address - page;
            let mut scratch = vec![0u8; PAGE_SIZE as usize];
            self.state.peek_page(page, &mut scratch);

            let target = hash_data(
                &scratch[offset as usize..(offset + (1 << log2_size)) as usize],
                log2_size,
            );
            let mut siblings = page_sibling_hashes(&scratch, offset, log2_size);
            siblings.extend(self.tree.sibling_hashes_above(page, PAGE_LOG2_SIZE));
            (target, siblings)
        };

        Ok(MerkleProof {
            address,
            log2_size,
            target_hash,
            sibling_hashes,
            root_hash: self.tree.root_hash(),
        })
    }

    /// Recompute every page hash from the machine state and check the tree
    /// agrees. Meant to be run on a freshly updated tree.
    pub fn verify_merkle_tree(&mut self) -> Result<bool, MachineError> {
        let mut scratch = vec![0u8; PAGE_SIZE as usize];
        for index in 0..self.state.pmas.len() {
            let entry = self.state.pmas.get(index);
            let start = entry.start();
            let length = entry.length();
            for offset in (0..length).step_by(PAGE_SIZE as usize) {
                let page = start + offset;
                let expected = if self.state.peek_page(page, &mut scratch) {
                    hash_data(&scratch, PAGE_LOG2_SIZE)
                } else {
                    self.tree.pristine_hash(PAGE_LOG2_SIZE)
                };
                if self.tree.page_hash(page) != expected {
                    log::warn!("merkle tree mismatch on page {page:#x}");
                    return Ok(false);
                }
            }
        }
        Ok(self.tree.node_hash(0, merkle::TREE_LOG2_SIZE) == self.tree.root_hash())
    }

    /// Check that every page whose content differs from its recorded hash
    /// is marked dirty.
    pub fn verify_dirty_page_maps(&mut self) -> Result<bool, MachineError> {
        self.state.mark_write_tlb_dirty_pages();
        for index in 0..self.state.pmas.len() {
            let entry = self.state.pmas.get(index);
            let Some(range) = entry.memory() else {
                continue;
            };
            let start = entry.start();
            for page in 0..range.page_count() {
                if range.is_page_dirty(page) {
                    continue;
                }
                let offset = (page * PAGE_SIZE) as usize;
                let content = &range.data()[offset..offset + PAGE_SIZE as usize];
                let expected = if content.iter().any(|byte| *byte != 0) {
                    hash_data(content, PAGE_LOG2_SIZE)
                } else {
                    self.tree.pristine_hash(PAGE_LOG2_SIZE)
                };
                if self.tree.page_hash(start + page * PAGE_SIZE) != expected {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    // -------------------------------------------------------------------
    // Logged uarch operations
    // -------------------------------------------------------------------

    /// Sibling path for the committed word at `paddr`, against the
    /// current tree.
    fn word_sibling_hashes(&self, paddr: u64) -> Vec<MerkleHash> {
        let page = paddr & !(PAGE_SIZE - 1);
        let mut scratch = vec![0u8; PAGE_SIZE as usize];
        self.state.peek_page(page, &mut scratch);
        let mut siblings =
            page_sibling_hashes(&scratch, paddr - page, merkle::WORD_LOG2_SIZE);
        siblings.extend(self.tree.sibling_hashes_above(page, PAGE_LOG2_SIZE));
        siblings
    }

    /// Advance the microarchitecture by one cycle, recording every state
    /// access with proofs against the live tree. The log is self-contained
    /// and can be verified with no machine at hand.
    pub fn log_uarch_step(&mut self) -> Result<AccessLog, MachineError> {
        self.update_merkle_tree()?;
        let mut access = LoggingAccess {
            machine: self,
            log: AccessLog::new(),
        };
        uarch::uarch_step(&mut access)?;
        Ok(access.log)
    }

    /// Restore the microarchitecture to its boot state, recording the
    /// restoration as an access log (register words, then one write per
    /// uarch RAM page).
    pub fn log_uarch_reset(&mut self) -> Result<AccessLog, MachineError> {
        self.update_merkle_tree()?;
        let ram_length = self.config.uarch.ram_length;
        let image = self.config.uarch.ram_image.clone();

        let mut access = LoggingAccess {
            machine: self,
            log: AccessLog::new(),
        };
        uarch::uarch_reset_registers(&mut access)?;

        for page in 0..ram_length / PAGE_SIZE {
            let paddr = pma::UARCH_RAM_START + page * PAGE_SIZE;
            let start = (page * PAGE_SIZE) as usize;
            let mut content = vec![0u8; PAGE_SIZE as usize];
            if start < image.len() {
                let end = image.len().min(start + PAGE_SIZE as usize);
                content[..end - start].copy_from_slice(&image[start..end]);
            }
            access.write_page(paddr, &content)?;
        }

        Ok(access.log)
    }

    /// Check the internal consistency of a step log: replay the uarch
    /// against it and return the pre and post roots it binds.
    pub fn verify_uarch_step_log(
        log: &AccessLog,
    ) -> Result<(MerkleHash, MerkleHash), MachineError> {
        let root_before = log.implied_root_before()?;
        let mut replay = ReplayAccess {
            replay: Replay::new(log, root_before),
        };
        uarch::uarch_step(&mut replay)?;
        let root_after = replay.replay.finish()?;
        Ok((root_before, root_after))
    }

    /// Check that `log` is the unique legal uarch step from
    /// `root_hash_before` to `root_hash_after`. Verification failures are
    /// final; there is no retry path.
    pub fn verify_uarch_step_state_transition(
        root_hash_before: &MerkleHash,
        log: &AccessLog,
        root_hash_after: &MerkleHash,
    ) -> Result<(), MachineError> {
        let mut replay = ReplayAccess {
            replay: Replay::new(log, *root_hash_before),
        };
        uarch::uarch_step(&mut replay)?;
        let computed = replay.replay.finish()?;
        if computed != *root_hash_after {
            return Err(MachineError::LogMismatch(format!(
                "post-state root mismatch: expected {root_hash_after:?}, computed {computed:?}"
            )));
        }
        Ok(())
    }

    /// Check the internal consistency of a reset log and return the roots
    /// it binds.
    pub fn verify_uarch_reset_log(
        log: &AccessLog,
    ) -> Result<(MerkleHash, MerkleHash), MachineError> {
        let root_before = log.implied_root_before()?;
        let root_after = Self::replay_uarch_reset(log, root_before)?;
        Ok((root_before, root_after))
    }

    /// Check that `log` restores the uarch between the two given roots.
    pub fn verify_uarch_reset_state_transition(
        root_hash_before: &MerkleHash,
        log: &AccessLog,
        root_hash_after: &MerkleHash,
    ) -> Result<(), MachineError> {
        let computed = Self::replay_uarch_reset(log, *root_hash_before)?;
        if computed != *root_hash_after {
            return Err(MachineError::LogMismatch(format!(
                "post-state root mismatch: expected {root_hash_after:?}, computed {computed:?}"
            )));
        }
        Ok(())
    }

    fn replay_uarch_reset(
        log: &AccessLog,
        root_before: MerkleHash,
    ) -> Result<MerkleHash, MachineError> {
        let mut replay = ReplayAccess {
            replay: Replay::new(log, root_before),
        };
        uarch::uarch_reset_registers(&mut replay)?;

        // The RAM restoration is page-granular; the page count is whatever
        // the log carries, and the restored contents are bound by the
        // post-state root.
        let mut page = 0;
        while replay.replay.remaining() > 0 {
            replay.replay.write_node(
                pma::UARCH_RAM_START + page * PAGE_SIZE,
                PAGE_LOG2_SIZE,
            )?;
            page += 1;
        }
        replay.replay.finish()
    }

    // -------------------------------------------------------------------
    // State access for the host
    // -------------------------------------------------------------------

    /// Read a machine register from the flat committed namespace.
    pub fn read_csr(&self, csr: MachineCsr) -> u64 {
        shadow::read_machine_csr(&self.state, csr)
    }

    /// Raw write of a machine register. No WARL masking is applied; this
    /// is host tooling, not the guest path.
    pub fn write_csr(&mut self, csr: MachineCsr, value: u64) {
        shadow::write_machine_csr(&mut self.state, csr, value);
    }

    pub fn read_x(&self, index: usize) -> u64 {
        self.state.xregisters.read_index(index)
    }

    pub fn write_x(&mut self, index: usize, value: u64) {
        self.state.xregisters.write_index(index, value);
    }

    pub fn read_f(&self, index: usize) -> u64 {
        self.state.fregisters.read_index(index)
    }

    pub fn write_f(&mut self, index: usize, value: u64) {
        self.state.fregisters.write_index(index, value);
    }

    pub fn read_pc(&self) -> u64 {
        self.state.pc
    }

    pub fn write_pc(&mut self, value: u64) {
        self.state.pc = value;
    }

    pub fn read_mcycle(&self) -> u64 {
        self.state.csregisters.mcycle
    }

    pub fn read_htif_tohost(&self) -> u64 {
        self.state.htif.tohost
    }

    pub fn read_htif_fromhost(&self) -> u64 {
        self.state.htif.fromhost
    }

    pub fn read_iflags_h(&self) -> bool {
        self.state.iflags.h
    }

    pub fn read_iflags_y(&self) -> bool {
        self.state.iflags.y
    }

    pub fn read_iflags_x(&self) -> bool {
        self.state.iflags.x
    }

    /// Clear the manual-yield flag so the machine can be resumed.
    pub fn reset_iflags_y(&mut self) {
        self.state.iflags.y = false;
        self.state.set_brk();
    }

    /// Raise interrupt-pending bits on behalf of an external
    /// interrupt-source collaborator (PLIC, VirtIO back-ends). Only the
    /// standard mip bits can be raised.
    pub fn set_mip(&mut self, mask: u64) {
        self.state.csregisters.mip |=
            mask & machine_state::csregisters::CSRegister::WARL_MASK_MIP_MIE;
        self.state.set_brk();
    }

    /// Clear interrupt-pending bits on behalf of an external collaborator.
    pub fn reset_mip(&mut self, mask: u64) {
        self.state.csregisters.mip &=
            !(mask & machine_state::csregisters::CSRegister::WARL_MASK_MIP_MIE);
        self.state.set_brk();
    }

    /// Read the committed word at `address`.
    pub fn read_word(&self, address: u64) -> Result<u64, MachineError> {
        self.state.read_word(address)
    }

    /// Read a chunk of physical memory. The whole chunk must lie in one
    /// memory-backed range.
    pub fn read_memory(&self, address: u64, length: u64) -> Result<Vec<u8>, MachineError> {
        let index = self
            .state
            .pmas
            .find(address, length.max(1))
            .ok_or(MachineError::OutOfRange {
                address,
                log2_size: 0,
            })?;
        let entry = self.state.pmas.get(index);
        let range = entry.memory().ok_or(MachineError::OutOfRange {
            address,
            log2_size: 0,
        })?;
        let offset = (address - entry.start()) as usize;
        Ok(range.data()[offset..offset + length as usize].to_vec())
    }

    /// Write a chunk of physical memory. The whole chunk must lie in one
    /// memory-backed range; the touched pages become dirty.
    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), MachineError> {
        let index = self
            .state
            .pmas
            .find(address, data.len().max(1) as u64)
            .ok_or(MachineError::OutOfRange {
                address,
                log2_size: 0,
            })?;
        let entry = self.state.pmas.get_mut(index);
        let start = entry.start();
        let range = entry.memory_mut().ok_or(MachineError::OutOfRange {
            address,
            log2_size: 0,
        })?;
        let offset = address - start;
        for page_offset in (offset..offset + data.len() as u64).step_by(PAGE_SIZE as usize) {
            range.mark_dirty(page_offset);
        }
        // A chunk can straddle pages; make sure the last one is covered.
        range.mark_dirty(offset + data.len().saturating_sub(1) as u64);
        range.data_mut()[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Read guest-virtual memory through the MMU.
    pub fn read_virtual_memory(
        &mut self,
        vaddr: u64,
        length: u64,
    ) -> Result<Vec<u8>, MachineError> {
        let mut data = Vec::with_capacity(length as usize);
        for offset in 0..length {
            let byte = self.state.load::<u8>(vaddr + offset).map_err(|_| {
                MachineError::OutOfRange {
                    address: vaddr + offset,
                    log2_size: 0,
                }
            })?;
            data.push(byte);
        }
        Ok(data)
    }

    /// Write guest-virtual memory through the MMU.
    pub fn write_virtual_memory(
        &mut self,
        vaddr: u64,
        data: &[u8],
    ) -> Result<(), MachineError> {
        for (offset, byte) in data.iter().enumerate() {
            self.state
                .store::<u8>(vaddr + offset as u64, *byte)
                .map_err(|_| MachineError::OutOfRange {
                    address: vaddr + offset as u64,
                    log2_size: 0,
                })?;
        }
        Ok(())
    }

    /// Replace an existing memory range (e.g. swap a flash drive),
    /// preserving the PMA board layout.
    pub fn replace_memory_range(
        &mut self,
        start: u64,
        length: u64,
        image: Option<&[u8]>,
    ) -> Result<(), MachineError> {
        self.state.pmas.replace_memory_range(start, length, image)?;
        self.state.invalidate_caches();
        Ok(())
    }

    /// Queue bytes for the interactive console.
    pub fn push_console_input(&mut self, bytes: &[u8]) {
        self.state.htif.console.push_input(bytes);
    }

    /// Redirect console output, e.g. into a buffer.
    pub fn set_console_sink(&mut self, sink: Box<dyn std::io::Write + Send>) {
        self.state.htif.console.set_sink(sink);
    }
}

/// Records every uarch access with proofs against the live tree.
struct LoggingAccess<'a> {
    machine: &'a mut Machine,
    log: AccessLog,
}

impl UarchAccess for LoggingAccess<'_> {
    fn read_word(&mut self, paddr: u64) -> Result<u64, MachineError> {
        let value = self.machine.state.read_word(paddr)?;
        let sibling_hashes = self.machine.word_sibling_hashes(paddr);
        self.log.push(Access {
            kind: AccessKind::Read,
            address: paddr,
            log2_size: merkle::WORD_LOG2_SIZE,
            value_before: value.to_le_bytes().to_vec(),
            value_after: Vec::new(),
            sibling_hashes,
        });
        Ok(value)
    }

    fn write_word(&mut self, paddr: u64, value: u64) -> Result<(), MachineError> {
        let before = self.machine.state.read_word(paddr)?;
        let sibling_hashes = self.machine.word_sibling_hashes(paddr);

        self.machine.state.write_word(paddr, value)?;
        self.machine.update_merkle_tree_page(paddr)?;
        debug_assert_eq!(
            self.machine.state.read_word(paddr).ok(),
            Some(value),
            "raw word writes must be canonical"
        );

        self.log.push(Access {
            kind: AccessKind::Write,
            address: paddr,
            log2_size: merkle::WORD_LOG2_SIZE,
            value_before: before.to_le_bytes().to_vec(),
            value_after: value.to_le_bytes().to_vec(),
            sibling_hashes,
        });
        Ok(())
    }
}

impl LoggedAccessExt for LoggingAccess<'_> {
    /// Page-granular logged write, used by the reset log for the uarch RAM.
    fn write_page(&mut self, paddr: u64, content: &[u8]) -> Result<(), MachineError> {
        let mut before = vec![0u8; PAGE_SIZE as usize];
        self.machine.state.peek_page(paddr, &mut before);
        let sibling_hashes = self
            .machine
            .tree
            .sibling_hashes_above(paddr, PAGE_LOG2_SIZE);

        self.machine.write_memory(paddr, content)?;
        self.machine.update_merkle_tree_page(paddr)?;

        self.log.push(Access {
            kind: AccessKind::Write,
            address: paddr,
            log2_size: PAGE_LOG2_SIZE,
            value_before: before,
            value_after: content.to_vec(),
            sibling_hashes,
        });
        Ok(())
    }
}

/// Replays a log with no machine state at all.
struct ReplayAccess<'a> {
    replay: Replay<'a>,
}

impl UarchAccess for ReplayAccess<'_> {
    fn read_word(&mut self, paddr: u64) -> Result<u64, MachineError> {
        self.replay.read_word(paddr)
    }

    fn write_word(&mut self, paddr: u64, value: u64) -> Result<(), MachineError> {
        self.replay.write_word(paddr, value)
    }
}
