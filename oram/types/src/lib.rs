// Copyright (c) 2018-2021 The MobileCoin Foundation

//! Value objects shared between the ORAM proxy core and its storage servers:
//! blocks, buckets, paths, complete-binary-tree index math, and the framed
//! wire messages exchanged on the client and server channels.

#![no_std]
#![deny(missing_docs)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod messages;

#[cfg(feature = "std")]
pub mod framed;

mod block;
mod bucket;
mod path;
mod tree;

pub use block::{Block, DUMMY_BLOCK_ID};
pub use bucket::Bucket;
pub use path::Path;
pub use tree::{greatest_common_level, node_id, num_leaves, path_node_ids, random_leaf};
