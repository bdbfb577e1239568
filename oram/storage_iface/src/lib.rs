// Copyright (c) 2018-2021 The MobileCoin Foundation

//! Abstract interface to the ORAM bucket storage servers.
//!
//! A storage server is a dumb bucket store: it hands back encrypted paths by
//! partition-relative leaf and accepts batches of re-encrypted paths. The
//! proxy core only ever talks to storage through this trait, which keeps the
//! transport swappable and lets tests run against [`testing::HeapStorage`].

#![deny(missing_docs)]

pub mod testing;

use core::fmt::{Debug, Display};

/// A generic error type for storage connection operations.
pub trait StorageConnectionError: Debug + Display + Send + Sync {}
impl<T> StorageConnectionError for T where T: Debug + Display + Send + Sync {}

/// One proxy-side connection to a single storage server.
///
/// Implementations are shared across worker threads, so every call takes
/// `&self` and must be safe under concurrent use. A call may block; callers
/// hold no proxy locks across these calls.
pub trait StorageConnection: Send + Sync {
    /// The error type returned by the calls in this trait.
    type Error: StorageConnectionError;

    /// Fetch the encrypted path for a partition-relative leaf.
    ///
    /// Returns the path ciphertext, root bucket first. Transient transport
    /// failures are retried internally; an error means the server could not
    /// be reached at all.
    fn read_path(&self, relative_leaf: u64) -> Result<Vec<u8>, Self::Error>;

    /// Ship a batch of freshly encrypted paths.
    ///
    /// Returns the server's ack status: `true` means every path in the batch
    /// was durably accepted. `false` or an error leaves the caller free to
    /// retry the batch; the server must treat a batch atomically.
    fn write_paths(&self, paths: &[(u64, Vec<u8>)]) -> Result<bool, Self::Error>;
}

// A shared handle to a connection is a connection.
impl<C: StorageConnection> StorageConnection for std::sync::Arc<C> {
    type Error = C::Error;

    fn read_path(&self, relative_leaf: u64) -> Result<Vec<u8>, Self::Error> {
        (**self).read_path(relative_leaf)
    }

    fn write_paths(&self, paths: &[(u64, Vec<u8>)]) -> Result<bool, Self::Error> {
        (**self).write_paths(paths)
    }
}
