// Copyright (c) 2018-2021 The MobileCoin Foundation

//! HeapStorage keeps a partition's buckets in a HashMap to provide storage
//! in the simplest way possible. It does no encryption and has no oblivious
//! properties itself; it exists so that the proxy core can be exercised
//! without network or a real server. This is suitable for tests.

use crate::StorageConnection;
use core::fmt;
use oram_types::{node_id, path_node_ids};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

/// Error type for [`HeapStorage`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HeapStorageError {
    /// An injected transient failure.
    Injected,
}

impl fmt::Display for HeapStorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeapStorageError::Injected => write!(f, "injected storage failure"),
        }
    }
}

struct HeapStorageState {
    /// Bucket ciphertexts keyed by node id over the partition's tree.
    buckets: HashMap<u64, Vec<u8>>,
    /// Every write batch received, in arrival order, as relative leaf lists.
    write_batches: Vec<Vec<u64>>,
}

/// In-memory stand-in for one storage server partition.
///
/// Paths are split into their per-level bucket ciphertexts and stored keyed
/// by tree-node id, so overlapping paths share upper buckets exactly like a
/// real bucket store. Nodes never written yet are served from a caller
/// provided template (any valid ciphertext of an empty bucket).
pub struct HeapStorage {
    height: u32,
    empty_bucket: Vec<u8>,
    state: Mutex<HeapStorageState>,
    write_failures: AtomicUsize,
}

impl HeapStorage {
    /// A fresh partition over a tree of the given height. `empty_bucket` is
    /// handed back for any bucket that has never been written.
    pub fn new(height: u32, empty_bucket: Vec<u8>) -> Self {
        Self {
            height,
            empty_bucket,
            state: Mutex::new(HeapStorageState {
                buckets: HashMap::default(),
                write_batches: Vec::new(),
            }),
            write_failures: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` calls to `write_paths` fail.
    pub fn inject_write_failures(&self, count: usize) {
        self.write_failures.store(count, Ordering::SeqCst);
    }

    /// The relative-leaf batches received so far, in arrival order.
    pub fn write_batches(&self) -> Vec<Vec<u64>> {
        self.state.lock().expect("mutex poisoned").write_batches.clone()
    }
}

impl StorageConnection for HeapStorage {
    type Error = HeapStorageError;

    fn read_path(&self, relative_leaf: u64) -> Result<Vec<u8>, Self::Error> {
        let state = self.state.lock().expect("mutex poisoned");
        let mut out = Vec::new();
        for node in path_node_ids(self.height, relative_leaf) {
            match state.buckets.get(&node) {
                Some(bytes) => out.extend_from_slice(bytes),
                None => out.extend_from_slice(&self.empty_bucket),
            }
        }
        Ok(out)
    }

    fn write_paths(&self, paths: &[(u64, Vec<u8>)]) -> Result<bool, Self::Error> {
        if self
            .write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(HeapStorageError::Injected);
        }

        let mut state = self.state.lock().expect("mutex poisoned");
        let mut batch = Vec::with_capacity(paths.len());
        for (relative_leaf, bytes) in paths {
            let levels = self.height as usize + 1;
            debug_assert!(bytes.len() % levels == 0, "ragged path ciphertext");
            let stride = bytes.len() / levels;
            for (level, chunk) in bytes.chunks_exact(stride).enumerate() {
                let node = node_id(self.height, *relative_leaf, level as u32);
                state.buckets.insert(node, chunk.to_vec());
            }
            batch.push(*relative_leaf);
        }
        state.write_batches.push(batch);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Two one-byte "buckets" per level make the chunking easy to eyeball.
    fn storage() -> HeapStorage {
        HeapStorage::new(1, vec![0u8; 1])
    }

    #[test]
    fn unwritten_paths_serve_the_template() {
        let storage = storage();
        assert_eq!(storage.read_path(0).unwrap(), vec![0, 0]);
    }

    #[test]
    fn sibling_paths_share_the_root() {
        let storage = storage();
        storage.write_paths(&[(0, vec![7, 8])]).unwrap();

        // Leaf 1 shares the root bucket with leaf 0.
        assert_eq!(storage.read_path(0).unwrap(), vec![7, 8]);
        assert_eq!(storage.read_path(1).unwrap(), vec![7, 0]);
    }

    #[test]
    fn injected_failures_are_transient() {
        let storage = storage();
        storage.inject_write_failures(1);
        assert_eq!(
            storage.write_paths(&[(0, vec![1, 2])]),
            Err(HeapStorageError::Injected)
        );
        assert_eq!(storage.write_paths(&[(0, vec![1, 2])]), Ok(true));
        assert_eq!(storage.write_batches(), vec![vec![0]]);
    }
}
