// SPDX-FileCopyrightText: 2024 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Merkle tree over the physical address space.
//!
//! Conceptually a complete binary tree of depth 64 over byte addresses,
//! with Keccak-256 leaves at word (2^3) granularity. Concretely only
//! non-pristine page (2^12) hashes are stored; everything below a page is
//! hashed on demand from page bytes, everything above is folded by
//! recursion with pristine-subtree pruning. The dirty-page bitmaps of the
//! PMA map decide which pages must be rehashed on update.

use crate::pma::{PAGE_LOG2_SIZE, PAGE_SIZE};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::BTreeMap;

/// log<sub>2</sub> of the leaf (word) size
pub const WORD_LOG2_SIZE: u64 = 3;

/// log<sub>2</sub> of the full tree span
pub const TREE_LOG2_SIZE: u64 = 64;

/// A Keccak-256 digest
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MerkleHash(pub [u8; 32]);

impl std::fmt::Debug for MerkleHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

fn keccak(data: &[u8]) -> MerkleHash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    MerkleHash(hasher.finalize().into())
}

fn keccak_pair(left: &MerkleHash, right: &MerkleHash) -> MerkleHash {
    let mut hasher = Keccak256::new();
    hasher.update(left.0);
    hasher.update(right.0);
    MerkleHash(hasher.finalize().into())
}

/// Hash `bytes` as the content of a node of size `2^log2_size`, by
/// recursively splitting down to word leaves.
pub fn hash_data(bytes: &[u8], log2_size: u64) -> MerkleHash {
    debug_assert_eq!(bytes.len() as u64, 1 << log2_size);
    if log2_size == WORD_LOG2_SIZE {
        return keccak(bytes);
    }
    let half = bytes.len() / 2;
    keccak_pair(
        &hash_data(&bytes[..half], log2_size - 1),
        &hash_data(&bytes[half..], log2_size - 1),
    )
}

/// Sibling hashes inside one page for a target of size `2^log2_size` at
/// `offset` within the page, ordered from the target level up to the page
/// level (exclusive).
pub fn page_sibling_hashes(page: &[u8], offset: u64, log2_size: u64) -> Vec<MerkleHash> {
    debug_assert_eq!(page.len() as u64, PAGE_SIZE);
    (log2_size..PAGE_LOG2_SIZE)
        .map(|level| {
            let sibling_offset = (offset ^ (1 << level)) & !((1 << level) - 1);
            hash_data(
                &page[sibling_offset as usize..(sibling_offset + (1 << level)) as usize],
                level,
            )
        })
        .collect()
}

/// Fold a target hash up to a root, consuming one sibling per level
/// starting at `log2_size`.
pub fn fold_siblings(
    target: &MerkleHash,
    address: u64,
    log2_size: u64,
    sibling_hashes: &[MerkleHash],
) -> MerkleHash {
    let mut hash = *target;
    for (i, sibling) in sibling_hashes.iter().enumerate() {
        let level = log2_size + i as u64;
        if address & (1 << level) != 0 {
            hash = keccak_pair(sibling, &hash);
        } else {
            hash = keccak_pair(&hash, sibling);
        }
    }
    hash
}

/// Proof that a node carries a given hash under a given root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub address: u64,
    pub log2_size: u64,
    pub target_hash: MerkleHash,
    /// One sibling per level, from `log2_size` up to 63
    pub sibling_hashes: Vec<MerkleHash>,
    pub root_hash: MerkleHash,
}

impl MerkleProof {
    /// Recompute the root from the target and sibling path and compare.
    pub fn verify(&self) -> bool {
        self.log2_size >= WORD_LOG2_SIZE
            && self.log2_size <= TREE_LOG2_SIZE
            && self.sibling_hashes.len() as u64 == TREE_LOG2_SIZE - self.log2_size
            && (self.log2_size == TREE_LOG2_SIZE
                || self.address & ((1 << self.log2_size) - 1) == 0)
            && fold_siblings(
                &self.target_hash,
                self.address,
                self.log2_size,
                &self.sibling_hashes,
            ) == self.root_hash
    }
}

/// The sparse, paged Merkle tree.
pub struct MerkleTree {
    /// Hashes of non-pristine pages, keyed by page start address
    page_hashes: BTreeMap<u64, MerkleHash>,
    /// `pristine[i]` is the hash of an all-zero subtree of size
    /// `2^(WORD_LOG2_SIZE + i)`
    pristine: Vec<MerkleHash>,
    root: MerkleHash,
}

impl MerkleTree {
    pub fn new() -> Self {
        let mut pristine = Vec::with_capacity((TREE_LOG2_SIZE - WORD_LOG2_SIZE + 1) as usize);
        pristine.push(keccak(&[0u8; 8]));
        for _ in WORD_LOG2_SIZE..TREE_LOG2_SIZE {
            let last = pristine.last().expect("pristine table is never empty");
            pristine.push(keccak_pair(last, last));
        }

        let root = pristine[(TREE_LOG2_SIZE - WORD_LOG2_SIZE) as usize];
        Self {
            page_hashes: BTreeMap::new(),
            pristine,
            root,
        }
    }

    /// Hash of an all-zero subtree of the given size.
    pub fn pristine_hash(&self, log2_size: u64) -> MerkleHash {
        self.pristine[(log2_size - WORD_LOG2_SIZE) as usize]
    }

    /// The root hash as of the last [MerkleTree::recompute_root].
    pub fn root_hash(&self) -> MerkleHash {
        self.root
    }

    /// Record the hash of the page at `page_address`. Pristine pages are
    /// dropped from the map so the pruning stays effective.
    pub fn set_page_hash(&mut self, page_address: u64, hash: MerkleHash) {
        debug_assert_eq!(page_address % PAGE_SIZE, 0);
        if hash == self.pristine_hash(PAGE_LOG2_SIZE) {
            self.page_hashes.remove(&page_address);
        } else {
            self.page_hashes.insert(page_address, hash);
        }
    }

    /// Stored hash of the page at `page_address`.
    pub fn page_hash(&self, page_address: u64) -> MerkleHash {
        self.page_hashes
            .get(&page_address)
            .copied()
            .unwrap_or_else(|| self.pristine_hash(PAGE_LOG2_SIZE))
    }

    /// Does `[address, address + 2^log2_size)` contain any non-pristine
    /// page?
    fn is_pristine(&self, address: u64, log2_size: u64) -> bool {
        if log2_size >= TREE_LOG2_SIZE {
            return self.page_hashes.is_empty();
        }
        match address.checked_add(1 << log2_size) {
            Some(end) => self.page_hashes.range(address..end).next().is_none(),
            None => self.page_hashes.range(address..).next().is_none(),
        }
    }

    /// Hash of the node covering `[address, address + 2^log2_size)`, for
    /// nodes at page granularity or above.
    pub fn node_hash(&self, address: u64, log2_size: u64) -> MerkleHash {
        debug_assert!(log2_size >= PAGE_LOG2_SIZE);
        debug_assert!(
            log2_size == TREE_LOG2_SIZE || address & ((1 << log2_size) - 1) == 0
        );

        if self.is_pristine(address, log2_size) {
            return self.pristine_hash(log2_size);
        }
        if log2_size == PAGE_LOG2_SIZE {
            return self.page_hash(address);
        }

        let half = 1 << (log2_size - 1);
        keccak_pair(
            &self.node_hash(address, log2_size - 1),
            &self.node_hash(address + half, log2_size - 1),
        )
    }

    /// Recompute the root from the page map.
    pub fn recompute_root(&mut self) {
        self.root = self.node_hash(0, TREE_LOG2_SIZE);
    }

    /// Sibling path from the page level (or `from_log2_size`) up to the
    /// root, for the node at `address`.
    pub fn sibling_hashes_above(&self, address: u64, from_log2_size: u64) -> Vec<MerkleHash> {
        (from_log2_size..TREE_LOG2_SIZE)
            .map(|level| {
                let sibling = (address ^ (1 << level)) & !((1 << level) - 1);
                self.node_hash(sibling, level)
            })
            .collect()
    }
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::new()
    }
}
