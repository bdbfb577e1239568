// Copyright (c) 2018-2021 The MobileCoin Foundation

//! The authoritative block-id to leaf-id map, plus the leaf partitioning
//! across storage servers.
//!
//! Leaves are partitioned contiguously: server `i` of `n` owns leaves
//! `[i * 2^H / n, (i + 1) * 2^H / n)`. The partition mapping is pure
//! arithmetic; only the block positions themselves are stateful.

use oram_types::num_leaves;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

pub struct PositionMap {
    positions: Mutex<HashMap<u64, u64>>,
    height: u32,
    num_servers: u64,
}

impl PositionMap {
    pub fn new(height: u32, num_servers: usize) -> Self {
        assert!(num_servers > 0);
        assert_eq!(
            num_leaves(height) % num_servers as u64,
            0,
            "servers must evenly partition the leaves"
        );
        Self {
            positions: Mutex::new(HashMap::default()),
            height,
            num_servers: num_servers as u64,
        }
    }

    /// The leaf a block currently lives on, or `None` if the block has never
    /// been written.
    pub fn get(&self, block_id: u64) -> Option<u64> {
        self.positions().get(&block_id).copied()
    }

    /// Remap a block to a new leaf.
    pub fn set(&self, block_id: u64, leaf: u64) {
        debug_assert!(leaf < num_leaves(self.height));
        self.positions().insert(block_id, leaf);
    }

    /// Number of leaves each server owns.
    pub fn leaves_per_partition(&self) -> u64 {
        num_leaves(self.height) / self.num_servers
    }

    /// Index of the server owning a leaf.
    pub fn server_of(&self, leaf: u64) -> usize {
        (leaf / self.leaves_per_partition()) as usize
    }

    /// A leaf's 0-based index within its owning partition.
    pub fn relative_leaf(&self, leaf: u64) -> u64 {
        leaf % self.leaves_per_partition()
    }

    fn positions(&self) -> MutexGuard<HashMap<u64, u64>> {
        self.positions.lock().expect("mutex poisoned")
    }
}
