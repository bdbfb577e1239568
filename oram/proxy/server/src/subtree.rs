// Copyright (c) 2018-2021 The MobileCoin Foundation

//! The subtree cache: a sparse in-memory image of the ORAM tree.
//!
//! A bucket is resident from the moment a fetched path installs it until the
//! write-back pruner drops it. The cache keeps a block-id -> node back-index
//! so the processor can find a block's bucket in O(1); every placement goes
//! through [`Subtree::place_block`] so bucket contents and back-index move
//! under the same bucket lock.
//!
//! Lock order is nodes map, then a bucket's state, then the back-index.
//! Additive mutation (path merges) happens under the nodes map lock;
//! destructive mutation (pruning) additionally takes each bucket's state
//! lock while the write-back holds the batch.

use crate::counters;
use oram_types::{greatest_common_level, node_id, Block, Bucket, Path};
use slog::{trace, Logger};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

/// One resident bucket. The state lock is the per-bucket lock the flusher
/// holds while rearranging a path.
pub struct SubtreeBucket {
    node: u64,
    state: Mutex<Bucket>,
}

impl SubtreeBucket {
    fn new(node: u64, bucket: Bucket) -> Self {
        Self {
            node,
            state: Mutex::new(bucket),
        }
    }

    /// Heap-style id of the tree node this bucket occupies.
    pub fn node(&self) -> u64 {
        self.node
    }

    /// Lock the bucket contents.
    pub fn lock(&self) -> MutexGuard<Bucket> {
        self.state.lock().expect("mutex poisoned")
    }
}

pub struct Subtree {
    height: u32,
    bucket_size: usize,
    nodes: Mutex<HashMap<u64, Arc<SubtreeBucket>>>,
    block_index: Mutex<HashMap<u64, u64>>,
    logger: Logger,
}

impl Subtree {
    pub fn new(height: u32, bucket_size: usize, logger: Logger) -> Self {
        Self {
            height,
            bucket_size,
            nodes: Mutex::new(HashMap::default()),
            block_index: Mutex::new(HashMap::default()),
            logger,
        }
    }

    /// Merge a freshly decrypted path. Already-resident buckets win: they
    /// may hold writes newer than what the server returned.
    pub fn add_path(&self, path: Path) {
        let leaf = path.leaf();
        let mut nodes = self.nodes();
        for (level, bucket) in path.buckets().iter().enumerate() {
            let node = node_id(self.height, leaf, level as u32);
            if nodes.contains_key(&node) {
                continue;
            }
            let mut index = self.block_index();
            for block in bucket.blocks() {
                index.insert(block.id(), node);
            }
            drop(index);
            nodes.insert(node, Arc::new(SubtreeBucket::new(node, bucket.clone())));
        }
        counters::RESIDENT_BUCKETS.set(nodes.len() as i64);
    }

    /// The resident path to `leaf`, root first, installing empty buckets for
    /// any level the pruner raced away since the path was fetched.
    pub fn ensure_path(&self, leaf: u64) -> Vec<Arc<SubtreeBucket>> {
        let mut nodes = self.nodes();
        let path = (0..=self.height)
            .map(|level| {
                let node = node_id(self.height, leaf, level);
                nodes
                    .entry(node)
                    .or_insert_with(|| {
                        Arc::new(SubtreeBucket::new(node, Bucket::new(self.bucket_size)))
                    })
                    .clone()
            })
            .collect();
        counters::RESIDENT_BUCKETS.set(nodes.len() as i64);
        path
    }

    /// A value copy of the resident path to `leaf`, for encryption.
    pub fn snapshot_path(&self, leaf: u64) -> Path {
        let buckets = self
            .ensure_path(leaf)
            .iter()
            .map(|b| b.lock().clone())
            .collect();
        Path::new(leaf, buckets)
    }

    /// The bucket currently holding a block, if the block is resident.
    pub fn bucket_with_block(&self, block_id: u64) -> Option<Arc<SubtreeBucket>> {
        let node = *self.block_index().get(&block_id)?;
        self.nodes().get(&node).cloned()
    }

    /// Payload copy of a resident block.
    pub fn read_block(&self, block_id: u64) -> Option<Vec<u8>> {
        let bucket = self.bucket_with_block(block_id)?;
        let guard = bucket.lock();
        guard.data_of(block_id).map(|d| d.to_vec())
    }

    /// Overwrite a resident block's payload in place.
    pub fn write_block(&self, block_id: u64, data: &[u8]) -> bool {
        match self.bucket_with_block(block_id) {
            Some(bucket) => bucket.lock().write_data(block_id, data),
            None => false,
        }
    }

    /// Place a block into a locked bucket and update the back-index. The
    /// caller holds the bucket's state lock and passes the guard in, so the
    /// two updates cannot be observed apart.
    pub fn place_block(
        &self,
        node: u64,
        bucket: &mut Bucket,
        block: Block,
        timestamp: u64,
    ) -> bool {
        let block_id = block.id();
        if bucket.try_add(block, timestamp) {
            self.block_index().insert(block_id, node);
            true
        } else {
            false
        }
    }

    /// Empty a locked bucket, scrubbing the back-index entries of the blocks
    /// it held, and hand the blocks back.
    pub fn clear_bucket(&self, node: u64, bucket: &mut Bucket) -> Vec<Block> {
        let drained = bucket.clear();
        let mut index = self.block_index();
        for block in &drained {
            if index.get(&block.id()) == Some(&node) {
                index.remove(&block.id());
            }
        }
        drained
    }

    /// Prune the path to `leaf` after a successful write-back. Walks leaf to
    /// root, removing each bucket written no later than `cutoff` whose
    /// subtree contains no leaf in `protected`, and stops at the first
    /// bucket failing either test so that ancestors of surviving buckets
    /// stay resident.
    pub fn delete_nodes(&self, leaf: u64, cutoff: u64, protected: &HashSet<u64>) {
        let mut nodes = self.nodes();
        for level in (0..=self.height).rev() {
            let node = node_id(self.height, leaf, level);
            let bucket = match nodes.get(&node) {
                Some(bucket) => bucket.clone(),
                // Already pruned through a sibling path; keep walking up.
                None => continue,
            };

            let guard = bucket.lock();
            if guard.last_touched() > cutoff {
                break;
            }
            if protected
                .iter()
                .any(|p| greatest_common_level(self.height, leaf, *p) >= level)
            {
                break;
            }

            let mut index = self.block_index();
            for block in guard.blocks() {
                if index.get(&block.id()) == Some(&node) {
                    index.remove(&block.id());
                }
            }
            drop(index);
            drop(guard);
            nodes.remove(&node);
            trace!(self.logger, "pruned node {} of leaf {}", node, leaf);
        }
        counters::RESIDENT_BUCKETS.set(nodes.len() as i64);
    }

    /// Number of resident buckets.
    pub fn resident_len(&self) -> usize {
        self.nodes().len()
    }

    /// Total real blocks across resident buckets.
    pub fn resident_blocks(&self) -> usize {
        self.nodes()
            .values()
            .map(|b| b.lock().blocks().len())
            .sum()
    }

    fn nodes(&self) -> MutexGuard<HashMap<u64, Arc<SubtreeBucket>>> {
        self.nodes.lock().expect("mutex poisoned")
    }

    fn block_index(&self) -> MutexGuard<HashMap<u64, u64>> {
        self.block_index.lock().expect("mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_logger;

    const HEIGHT: u32 = 3;
    const Z: usize = 4;

    fn subtree() -> Subtree {
        Subtree::new(HEIGHT, Z, test_logger())
    }

    fn path_with_block(leaf: u64, level: usize, block: Block, timestamp: u64) -> Path {
        let mut path = Path::empty(leaf, HEIGHT, Z);
        path.buckets_mut()[level].try_add(block, timestamp);
        path
    }

    #[test]
    fn add_path_installs_back_index() {
        let subtree = subtree();
        subtree.add_path(path_with_block(5, 2, Block::new(17, vec![1; 4]), 1));

        assert_eq!(subtree.resident_len(), HEIGHT as usize + 1);
        assert_eq!(subtree.read_block(17).unwrap(), vec![1; 4]);
        let bucket = subtree.bucket_with_block(17).unwrap();
        assert_eq!(bucket.node(), node_id(HEIGHT, 5, 2));
    }

    #[test]
    fn resident_copy_is_authoritative() {
        let subtree = subtree();
        subtree.add_path(path_with_block(5, 2, Block::new(17, vec![1; 4]), 1));
        subtree.write_block(17, &[9; 4]);

        // A second fetch of the same path must not clobber the local write.
        subtree.add_path(path_with_block(5, 2, Block::new(17, vec![1; 4]), 1));
        assert_eq!(subtree.read_block(17).unwrap(), vec![9; 4]);
    }

    #[test]
    fn overlapping_paths_share_nodes() {
        let subtree = subtree();
        subtree.add_path(Path::empty(0, HEIGHT, Z));
        subtree.add_path(Path::empty(1, HEIGHT, Z));

        // Leaves 0 and 1 differ only at the leaf level.
        assert_eq!(subtree.resident_len(), HEIGHT as usize + 2);
    }

    #[test]
    fn place_and_clear_keep_the_index_coherent() {
        let subtree = subtree();
        let path = subtree.ensure_path(2);
        let leaf_node = path[HEIGHT as usize].node();

        {
            let mut guard = path[HEIGHT as usize].lock();
            assert!(subtree.place_block(leaf_node, &mut guard, Block::new(8, vec![8; 4]), 1));
        }
        assert_eq!(subtree.read_block(8).unwrap(), vec![8; 4]);

        {
            let mut guard = path[HEIGHT as usize].lock();
            let drained = subtree.clear_bucket(leaf_node, &mut guard);
            assert_eq!(drained.len(), 1);
        }
        assert!(subtree.read_block(8).is_none());
    }

    #[test]
    fn delete_nodes_respects_cutoff() {
        let subtree = subtree();
        subtree.add_path(path_with_block(5, 3, Block::new(17, vec![1; 4]), 10));

        // Cutoff below the leaf bucket's stamp: the walk stops immediately,
        // everything survives.
        subtree.delete_nodes(5, 9, &HashSet::new());
        assert_eq!(subtree.resident_len(), HEIGHT as usize + 1);

        // Cutoff at the stamp: the whole path goes, back-index included.
        subtree.delete_nodes(5, 10, &HashSet::new());
        assert_eq!(subtree.resident_len(), 0);
        assert!(subtree.read_block(17).is_none());
    }

    #[test]
    fn delete_nodes_respects_inflight_leaves() {
        let subtree = subtree();
        subtree.add_path(Path::empty(0, HEIGHT, Z));

        // Leaf 1 shares every level but the leaf bucket with leaf 0, so only
        // leaf 0's leaf bucket may go.
        let protected: HashSet<u64> = [1u64].iter().copied().collect();
        subtree.delete_nodes(0, u64::MAX, &protected);
        assert_eq!(subtree.resident_len(), HEIGHT as usize);

        subtree.delete_nodes(0, u64::MAX, &HashSet::new());
        assert_eq!(subtree.resident_len(), 0);
    }

    #[test]
    fn delete_nodes_preserves_ancestors_of_survivors() {
        let subtree = subtree();
        let mut path = Path::empty(5, HEIGHT, Z);
        // Fresh leaf bucket, stale interior.
        path.buckets_mut()[HEIGHT as usize].try_add(Block::new(1, vec![1; 4]), 50);
        subtree.add_path(path);

        subtree.delete_nodes(5, 10, &HashSet::new());
        // The leaf bucket failed the cutoff test, so the walk never reached
        // the stale interior buckets.
        assert_eq!(subtree.resident_len(), HEIGHT as usize + 1);
    }

    #[test]
    fn ensure_path_reinstalls_pruned_levels() {
        let subtree = subtree();
        subtree.add_path(Path::empty(3, HEIGHT, Z));
        subtree.delete_nodes(3, u64::MAX, &HashSet::new());
        assert_eq!(subtree.resident_len(), 0);

        let path = subtree.ensure_path(3);
        assert_eq!(path.len(), HEIGHT as usize + 1);
        assert_eq!(subtree.resident_len(), HEIGHT as usize + 1);
    }
}
