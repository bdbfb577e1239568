// Copyright (c) 2018-2021 The MobileCoin Foundation

//! A fixed-size ORAM block: a 64-bit id plus an opaque payload.

use alloc::{vec, vec::Vec};
use serde::{Deserialize, Serialize};

/// Sentinel id carried by dummy blocks. No client-visible block may use it.
pub const DUMMY_BLOCK_ID: u64 = u64::MAX;

/// A single ORAM block. Identity is the id alone; two blocks with the same id
/// are the same logical block regardless of payload.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Block {
    id: u64,
    data: Vec<u8>,
}

impl Block {
    /// A real block carrying client data.
    pub fn new(id: u64, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    /// A dummy block: sentinel id, zeroed payload.
    pub fn dummy(block_size: usize) -> Self {
        Self {
            id: DUMMY_BLOCK_ID,
            data: vec![0u8; block_size],
        }
    }

    /// Whether this is a dummy slot filler.
    pub fn is_dummy(&self) -> bool {
        self.id == DUMMY_BLOCK_ID
    }

    /// The block id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Overwrite the payload bytes.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }
}
