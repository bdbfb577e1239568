// Copyright (c) 2018-2021 The MobileCoin Foundation

//! Error type for the proxy server.

use displaydoc::Display;
use oram_types::messages::MessageError;
use std::result::Result as StdResult;

/// A generic result type for proxy operations.
pub type Result<T> = StdResult<T, Error>;

/// An error inside the proxy core.
#[derive(Debug, Display)]
pub enum Error {
    /// Invalid configuration: {0}
    Config(String),
    /// Path decryption failed; a storage server returned inauthentic data
    PathAuthentication,
    /// Crypto failure: {0}
    Crypto(String),
    /// Message codec: {0}
    Message(MessageError),
    /// Storage server: {0}
    Storage(String),
    /// Client channel: {0}
    ClientIo(std::io::Error),
    /// The dispatcher is shut down
    Dispatch,
}

impl Error {
    /// Whether this error must bring the proxy down. An authentication
    /// failure during path decryption means a compromised or misbehaving
    /// server and is never survivable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::PathAuthentication)
    }
}

impl From<MessageError> for Error {
    fn from(src: MessageError) -> Self {
        Self::Message(src)
    }
}

impl From<std::io::Error> for Error {
    fn from(src: std::io::Error) -> Self {
        Self::ClientIo(src)
    }
}
