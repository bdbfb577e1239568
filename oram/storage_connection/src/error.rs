// Copyright (c) 2018-2021 The MobileCoin Foundation

//! Error type for storage connections.

use displaydoc::Display;
use oram_types::messages::MessageError;
use std::net::SocketAddr;

/// An error talking to a storage server.
#[derive(Debug, Display)]
pub enum Error {
    /// Transport: {0}
    Io(std::io::Error),
    /// Malformed server message: {0}
    Message(MessageError),
    /// Server sent an unexpected message type: {0}
    UnexpectedResponse(u32),
    /// Server {0} unreachable after retries: {1}
    Exhausted(SocketAddr, String),
}

impl From<std::io::Error> for Error {
    fn from(src: std::io::Error) -> Self {
        Self::Io(src)
    }
}

impl From<MessageError> for Error {
    fn from(src: MessageError) -> Self {
        Self::Message(src)
    }
}
