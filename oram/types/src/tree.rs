// Copyright (c) 2018-2021 The MobileCoin Foundation

//! Index math over the complete binary tree of height `H`.
//!
//! Leaves are numbered `0..2^H`. Nodes are numbered heap-style: the node at
//! level `l` along the path to leaf `p` has id `(2^l - 1) + (p >> (H - l))`,
//! so the root is node 0 and every path through a node agrees on its id.

use rand_core::{CryptoRng, RngCore};

/// Number of leaves in a tree of the given height.
pub fn num_leaves(height: u32) -> u64 {
    1u64 << height
}

/// The deepest level at which the paths to leaves `p` and `q` share a
/// bucket. Level 0 is the root; two equal leaves share all `height + 1`
/// levels.
pub fn greatest_common_level(height: u32, p: u64, q: u64) -> u32 {
    let diff = p ^ q;
    if diff == 0 {
        return height;
    }
    // The paths diverge at the most significant differing bit of the leaf
    // ids, viewed as height-bit strings.
    let diverge_bit = 63 - diff.leading_zeros();
    height - 1 - diverge_bit
}

/// Heap-style id of the node at `level` along the path to `leaf`.
pub fn node_id(height: u32, leaf: u64, level: u32) -> u64 {
    debug_assert!(level <= height);
    ((1u64 << level) - 1) + (leaf >> (height - level))
}

/// Node ids along the path to `leaf`, root first.
pub fn path_node_ids(height: u32, leaf: u64) -> impl Iterator<Item = u64> {
    (0..=height).map(move |level| node_id(height, leaf, level))
}

/// Draw a uniformly random leaf. ORAM security requires the rng to be
/// cryptographically strong, hence the `CryptoRng` bound.
pub fn random_leaf<R: RngCore + CryptoRng>(height: u32, rng: &mut R) -> u64 {
    rng.next_u64() & (num_leaves(height) - 1)
}
