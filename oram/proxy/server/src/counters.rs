// Copyright (c) 2018-2021 The MobileCoin Foundation

use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};

lazy_static::lazy_static! {
    /// Path fetches that answered a coalesced group.
    pub static ref REAL_READS: IntCounter =
        register_int_counter!("oram_proxy_real_reads", "Real path reads issued").unwrap();

    /// Path fetches issued only for unlinkability.
    pub static ref FAKE_READS: IntCounter =
        register_int_counter!("oram_proxy_fake_reads", "Fake path reads issued").unwrap();

    /// Completed write-back batches.
    pub static ref WRITE_BACKS: IntCounter =
        register_int_counter!("oram_proxy_write_backs", "Write-back batches shipped").unwrap();

    /// Write-back batches that failed and were re-queued.
    pub static ref WRITE_BACK_FAILURES: IntCounter =
        register_int_counter!("oram_proxy_write_back_failures", "Write-back batches re-queued after server failure").unwrap();

    /// Blocks currently held in the stash.
    pub static ref STASH_SIZE: IntGauge =
        register_int_gauge!("oram_proxy_stash_size", "Blocks currently in the stash").unwrap();

    /// Times the stash exceeded its configured capacity after a flush.
    /// Repeated overflow means the tree height or bucket size is undersized.
    pub static ref STASH_OVERFLOWS: IntCounter =
        register_int_counter!("oram_proxy_stash_overflows", "Stash capacity overruns").unwrap();

    /// Buckets currently resident in the subtree cache.
    pub static ref RESIDENT_BUCKETS: IntGauge =
        register_int_gauge!("oram_proxy_resident_buckets", "Buckets resident in the subtree cache").unwrap();
}
