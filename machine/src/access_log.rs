// SPDX-FileCopyrightText: 2024 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Typed access logs.
//!
//! A logged machine step records every read of and write to committed
//! state, each with the sibling hashes that tie it to the state root. The
//! resulting log is self-contained: replaying it checks each read against
//! the running root and folds each write into the next root, with no
//! access to the emulator state. Verification failures are final.

use crate::{
    merkle::{fold_siblings, hash_data, MerkleHash, TREE_LOG2_SIZE},
    MachineError,
};
use serde::{Deserialize, Serialize};

/// Direction of a logged access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKind {
    Read,
    Write,
}

/// One logged access to committed state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    pub kind: AccessKind,
    /// Physical address of the accessed node; `2^log2_size`-aligned
    pub address: u64,
    pub log2_size: u64,
    /// Bytes found at the address before the access; for a read, this is
    /// the value read
    pub value_before: Vec<u8>,
    /// Bytes written; empty for reads
    pub value_after: Vec<u8>,
    /// One sibling hash per level from `log2_size` up to the root
    pub sibling_hashes: Vec<MerkleHash>,
}

impl Access {
    fn check_shape(&self) -> Result<(), MachineError> {
        let size = 1u64 << self.log2_size;
        let ok = self.log2_size < TREE_LOG2_SIZE
            && self.address & (size - 1) == 0
            && self.value_before.len() as u64 == size
            && match self.kind {
                AccessKind::Read => self.value_after.is_empty(),
                AccessKind::Write => self.value_after.len() as u64 == size,
            }
            && self.sibling_hashes.len() as u64 == TREE_LOG2_SIZE - self.log2_size;
        if ok {
            Ok(())
        } else {
            Err(MachineError::LogMismatch(format!(
                "malformed access at {:#x} (log2_size {})",
                self.address, self.log2_size
            )))
        }
    }

    /// Root implied by the pre-access value and the sibling path.
    pub fn root_before(&self) -> MerkleHash {
        fold_siblings(
            &hash_data(&self.value_before, self.log2_size),
            self.address,
            self.log2_size,
            &self.sibling_hashes,
        )
    }

    /// Root implied by the post-access value and the same sibling path.
    /// Only the target node changed, so the path still applies.
    pub fn root_after(&self) -> MerkleHash {
        match self.kind {
            AccessKind::Read => self.root_before(),
            AccessKind::Write => fold_siblings(
                &hash_data(&self.value_after, self.log2_size),
                self.address,
                self.log2_size,
                &self.sibling_hashes,
            ),
        }
    }
}

/// Ordered record of the accesses of one logged operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLog {
    pub accesses: Vec<Access>,
}

impl AccessLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, access: Access) {
        self.accesses.push(access);
    }

    /// Root implied by the first access. A valid log of a state transition
    /// always starts by proving something against the pre-state.
    pub fn implied_root_before(&self) -> Result<MerkleHash, MachineError> {
        let first = self.accesses.first().ok_or_else(|| {
            MachineError::LogMismatch("empty access log".to_owned())
        })?;
        first.check_shape()?;
        Ok(first.root_before())
    }
}

/// Cursor replaying an access log against a running root hash.
///
/// The replaying interpreter asks for exactly the accesses it would
/// perform itself; any divergence between the log and those requests is a
/// mismatch.
pub struct Replay<'a> {
    accesses: &'a [Access],
    next: usize,
    current_root: MerkleHash,
}

impl<'a> Replay<'a> {
    pub fn new(log: &'a AccessLog, initial_root: MerkleHash) -> Self {
        Self {
            accesses: &log.accesses,
            next: 0,
            current_root: initial_root,
        }
    }

    fn mismatch(&self, message: String) -> MachineError {
        MachineError::LogMismatch(format!("access {}: {message}", self.next))
    }

    fn take(
        &mut self,
        kind: AccessKind,
        address: u64,
        log2_size: u64,
    ) -> Result<&'a Access, MachineError> {
        let access = self.accesses.get(self.next).ok_or_else(|| {
            self.mismatch(format!(
                "log ended before expected {kind:?} of {address:#x}"
            ))
        })?;
        access.check_shape()?;

        if access.kind != kind || access.address != address || access.log2_size != log2_size {
            return Err(self.mismatch(format!(
                "expected {kind:?} of {address:#x} (log2_size {log2_size}), \
                 found {:?} of {:#x} (log2_size {})",
                access.kind, access.address, access.log2_size
            )));
        }

        if access.root_before() != self.current_root {
            return Err(self.mismatch(format!(
                "proof for {address:#x} does not match the current root"
            )));
        }

        self.next += 1;
        Ok(access)
    }

    /// Replay a word read at `address`, returning the logged value.
    pub fn read_word(&mut self, address: u64) -> Result<u64, MachineError> {
        let access = self.take(AccessKind::Read, address, crate::merkle::WORD_LOG2_SIZE)?;
        Ok(u64::from_le_bytes(
            access.value_before[..8]
                .try_into()
                .expect("shape was checked"),
        ))
    }

    /// Replay a word write at `address`, checking the logged post-value and
    /// folding it into the running root.
    pub fn write_word(&mut self, address: u64, value: u64) -> Result<(), MachineError> {
        let access = self.take(AccessKind::Write, address, crate::merkle::WORD_LOG2_SIZE)?;
        if access.value_after != value.to_le_bytes() {
            return Err(MachineError::LogMismatch(format!(
                "write of {value:#x} to {address:#x} does not match the logged value"
            )));
        }
        self.current_root = access.root_after();
        Ok(())
    }

    /// Replay a write of arbitrary granularity without constraining the
    /// written bytes (they are bound by the final root instead). Returns
    /// the logged post-value.
    pub fn write_node(
        &mut self,
        address: u64,
        log2_size: u64,
    ) -> Result<&'a [u8], MachineError> {
        let access = self.take(AccessKind::Write, address, log2_size)?;
        self.current_root = access.root_after();
        Ok(&access.value_after)
    }

    /// The root after the last consumed access.
    pub fn current_root(&self) -> MerkleHash {
        self.current_root
    }

    /// Number of accesses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.accesses.len() - self.next
    }

    /// Assert the log carries no unconsumed accesses and return the final
    /// root.
    pub fn finish(self) -> Result<MerkleHash, MachineError> {
        if self.next != self.accesses.len() {
            return Err(MachineError::LogMismatch(format!(
                "{} unconsumed accesses remain in the log",
                self.accesses.len() - self.next
            )));
        }
        Ok(self.current_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::{MerkleTree, WORD_LOG2_SIZE};

    fn tree_with_word(address: u64, value: u64) -> (MerkleTree, Vec<MerkleHash>) {
        let mut tree = MerkleTree::new();
        let mut page = vec![0u8; 4096];
        let offset = (address % 4096) as usize;
        page[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        tree.set_page_hash(address & !0xFFF, crate::merkle::hash_data(&page, 12));
        tree.recompute_root();

        let mut siblings = crate::merkle::page_sibling_hashes(&page, address % 4096, 3);
        siblings.extend(tree.sibling_hashes_above(address & !0xFFF, 12));
        (tree, siblings)
    }

    #[test]
    fn test_read_replay() {
        let address = 0x8000_0010;
        let (tree, siblings) = tree_with_word(address, 0x1234);

        let mut log = AccessLog::new();
        log.push(Access {
            kind: AccessKind::Read,
            address,
            log2_size: WORD_LOG2_SIZE,
            value_before: 0x1234_u64.to_le_bytes().to_vec(),
            value_after: vec![],
            sibling_hashes: siblings,
        });

        let mut replay = Replay::new(&log, tree.root_hash());
        assert_eq!(replay.read_word(address).unwrap(), 0x1234);
        assert_eq!(replay.finish().unwrap(), tree.root_hash());
    }

    #[test]
    fn test_write_replay_produces_new_root() {
        let address = 0x8000_0010;
        let (tree, siblings) = tree_with_word(address, 0x1234);

        let mut log = AccessLog::new();
        log.push(Access {
            kind: AccessKind::Write,
            address,
            log2_size: WORD_LOG2_SIZE,
            value_before: 0x1234_u64.to_le_bytes().to_vec(),
            value_after: 0x5678_u64.to_le_bytes().to_vec(),
            sibling_hashes: siblings,
        });

        let mut replay = Replay::new(&log, tree.root_hash());
        replay.write_word(address, 0x5678).unwrap();
        let new_root = replay.finish().unwrap();

        // The new root equals a tree that always carried the new value.
        let (expected, _) = tree_with_word(address, 0x5678);
        assert_eq!(new_root, expected.root_hash());
    }

    #[test]
    fn test_replay_rejects_divergence() {
        let address = 0x8000_0010;
        let (tree, siblings) = tree_with_word(address, 0x1234);

        let access = Access {
            kind: AccessKind::Read,
            address,
            log2_size: WORD_LOG2_SIZE,
            value_before: 0x1234_u64.to_le_bytes().to_vec(),
            value_after: vec![],
            sibling_hashes: siblings,
        };

        // Wrong address requested by the replayer.
        let mut log = AccessLog::new();
        log.push(access.clone());
        let mut replay = Replay::new(&log, tree.root_hash());
        assert!(replay.read_word(address + 8).is_err());

        // Tampered value.
        let mut tampered = access.clone();
        tampered.value_before[0] ^= 1;
        let mut log = AccessLog::new();
        log.push(tampered);
        let mut replay = Replay::new(&log, tree.root_hash());
        assert!(replay.read_word(address).is_err());

        // Leftover accesses.
        let mut log = AccessLog::new();
        log.push(access.clone());
        log.push(access);
        let mut replay = Replay::new(&log, tree.root_hash());
        replay.read_word(address).unwrap();
        assert!(replay.finish().is_err());
    }
}
