// Copyright (c) 2018-2021 The MobileCoin Foundation

//! A root-to-leaf sequence of buckets.

use crate::bucket::Bucket;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

/// The buckets along one root-to-leaf walk of the tree, root first. A path
/// over a tree of height `H` carries `H + 1` buckets.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Path {
    leaf: u64,
    buckets: Vec<Bucket>,
}

impl Path {
    /// A path to `leaf` made of the given buckets, root first.
    pub fn new(leaf: u64, buckets: Vec<Bucket>) -> Self {
        Self { leaf, buckets }
    }

    /// A path of empty buckets, for seeding fresh storage.
    pub fn empty(leaf: u64, height: u32, bucket_capacity: usize) -> Self {
        let buckets = (0..=height).map(|_| Bucket::new(bucket_capacity)).collect();
        Self { leaf, buckets }
    }

    /// The leaf this path ends at.
    pub fn leaf(&self) -> u64 {
        self.leaf
    }

    /// Restamp the leaf id. Server responses carry partition-relative leaves;
    /// the proxy restamps them with the absolute id before merging.
    pub fn set_leaf(&mut self, leaf: u64) {
        self.leaf = leaf;
    }

    /// Buckets root first.
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Mutable buckets root first.
    pub fn buckets_mut(&mut self) -> &mut [Bucket] {
        &mut self.buckets
    }

    /// The tree height this path spans (`buckets.len() - 1`).
    pub fn height(&self) -> u32 {
        (self.buckets.len() - 1) as u32
    }
}
