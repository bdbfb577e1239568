// Copyright (c) 2018-2021 The MobileCoin Foundation

//! The stash: real blocks currently held outside the tree.

use crate::counters;
use oram_types::Block;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

/// A bounded overflow store with O(1) lookup by block id. All operations are
/// linearizable with respect to [`Stash::snapshot`], which the flusher uses
/// to collect eviction candidates.
pub struct Stash {
    blocks: Mutex<HashMap<u64, Block>>,
}

impl Default for Stash {
    fn default() -> Self {
        Self::new()
    }
}

impl Stash {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::default()),
        }
    }

    /// Insert a block, replacing any prior copy with the same id.
    pub fn add(&self, block: Block) {
        let mut blocks = self.blocks();
        blocks.insert(block.id(), block);
        counters::STASH_SIZE.set(blocks.len() as i64);
    }

    /// Remove the block with the given id, if present.
    pub fn remove(&self, block_id: u64) -> bool {
        let mut blocks = self.blocks();
        let removed = blocks.remove(&block_id).is_some();
        counters::STASH_SIZE.set(blocks.len() as i64);
        removed
    }

    /// A copy of the block with the given id, if present.
    pub fn find(&self, block_id: u64) -> Option<Block> {
        self.blocks().get(&block_id).cloned()
    }

    /// Overwrite the payload of a stashed block in place.
    pub fn write_data(&self, block_id: u64, data: &[u8]) -> bool {
        match self.blocks().get_mut(&block_id) {
            Some(block) => {
                block.set_data(data.to_vec());
                true
            }
            None => false,
        }
    }

    /// A copy of every stashed block.
    pub fn snapshot(&self) -> Vec<Block> {
        self.blocks().values().cloned().collect()
    }

    /// Number of blocks currently stashed.
    pub fn len(&self) -> usize {
        self.blocks().len()
    }

    /// Whether the stash is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks().is_empty()
    }

    fn blocks(&self) -> MutexGuard<HashMap<u64, Block>> {
        self.blocks.lock().expect("mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_find_remove() {
        let stash = Stash::new();
        assert!(stash.is_empty());

        stash.add(Block::new(3, vec![1; 4]));
        assert_eq!(stash.find(3).unwrap().data(), &[1; 4]);
        assert_eq!(stash.find(4), None);

        assert!(stash.remove(3));
        assert!(!stash.remove(3));
        assert!(stash.is_empty());
    }

    #[test]
    fn same_id_replaces() {
        let stash = Stash::new();
        stash.add(Block::new(3, vec![1; 4]));
        stash.add(Block::new(3, vec![2; 4]));
        assert_eq!(stash.len(), 1);
        assert_eq!(stash.find(3).unwrap().data(), &[2; 4]);
    }

    #[test]
    fn write_data_in_place() {
        let stash = Stash::new();
        stash.add(Block::new(3, vec![0; 4]));
        assert!(stash.write_data(3, &[9; 4]));
        assert!(!stash.write_data(4, &[9; 4]));
        assert_eq!(stash.find(3).unwrap().data(), &[9; 4]);
    }

    #[test]
    fn snapshot_copies_everything() {
        let stash = Stash::new();
        stash.add(Block::new(1, vec![1; 4]));
        stash.add(Block::new(2, vec![2; 4]));
        let mut ids: Vec<u64> = stash.snapshot().iter().map(|b| b.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }
}
