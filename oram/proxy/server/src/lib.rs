// Copyright (c) 2018-2021 The MobileCoin Foundation

//! The ORAM proxy core: the oblivious-access engine between untrusted
//! clients and untrusted bucket-storage servers.
//!
//! A client request flows sequencer -> dispatcher -> processor. The
//! processor fetches a (real or fake) path, merges it into the subtree
//! cache, answers every coalesced waiter, remaps the block, flushes the
//! path, and periodically ships re-encrypted paths back to storage.

pub mod config;
pub mod counters;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod listener;
pub mod position_map;
pub mod processor;
pub mod sequencer;
pub mod stash;
pub mod subtree;

pub use crate::{
    config::ProxyServerConfig,
    error::{Error, Result},
};

use slog::{o, Drain, Logger};

/// Build the root logger: compact terminal output behind an async drain.
pub fn create_root_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

#[cfg(test)]
pub(crate) fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}
