// Copyright (c) 2018-2021 The MobileCoin Foundation

//! Configuration parameters for the ORAM proxy server.

use crate::error::{Error, Result};
use oram_types::num_leaves;
use serde::Serialize;
use std::net::SocketAddr;
use structopt::StructOpt;

#[derive(Clone, Serialize, StructOpt)]
pub struct ProxyServerConfig {
    /// Listening address for client connections.
    #[structopt(long, default_value = "127.0.0.1:12339")]
    pub client_listen_addr: SocketAddr,

    /// Height of the ORAM tree. The tree holds 2^height leaves.
    #[structopt(long, default_value = "10")]
    pub tree_height: u32,

    /// Number of block slots per bucket.
    #[structopt(long, default_value = "4")]
    pub bucket_size: usize,

    /// Size of a block payload in bytes.
    #[structopt(long, default_value = "4096")]
    pub block_size: usize,

    /// Storage server addresses. Leaves are partitioned contiguously across
    /// these servers in the order given, so the list must divide the leaf
    /// count evenly.
    #[structopt(long, required = true, use_delimiter = true)]
    pub storage_servers: Vec<SocketAddr>,

    /// Number of path flushes between write-backs.
    #[structopt(long, default_value = "40")]
    pub write_back_threshold: u64,

    /// Stash size above which overflow is reported.
    #[structopt(long, default_value = "128")]
    pub stash_capacity: usize,

    /// Worker threads serving client requests.
    #[structopt(long, default_value = "8")]
    pub request_workers: usize,

    /// Hex-encoded 32 byte AES-256-GCM key protecting paths at rest and on
    /// the storage wire.
    #[structopt(long, parse(try_from_str=hex::FromHex::from_hex))]
    pub path_encryption_key: [u8; 32],
}

impl ProxyServerConfig {
    /// Check the deployment constants for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.tree_height == 0 || self.tree_height > 40 {
            return Err(Error::Config(format!(
                "tree height {} out of range",
                self.tree_height
            )));
        }
        if self.bucket_size == 0 {
            return Err(Error::Config("bucket size must be nonzero".into()));
        }
        if self.block_size == 0 {
            return Err(Error::Config("block size must be nonzero".into()));
        }
        if self.write_back_threshold == 0 {
            return Err(Error::Config("write-back threshold must be nonzero".into()));
        }
        let servers = self.storage_servers.len() as u64;
        if servers == 0 {
            return Err(Error::Config("at least one storage server required".into()));
        }
        if num_leaves(self.tree_height) % servers != 0 {
            return Err(Error::Config(format!(
                "{} storage servers do not evenly partition {} leaves",
                servers,
                num_leaves(self.tree_height)
            )));
        }
        Ok(())
    }
}
