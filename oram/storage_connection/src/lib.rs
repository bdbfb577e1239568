// Copyright (c) 2018-2021 The MobileCoin Foundation

//! A blocking framed-TCP implementation of [`StorageConnection`].
//!
//! One `TcpStorageConnection` serves one storage server. The socket is
//! opened on demand and dropped on any transport error; transient failures
//! are retried with exponential backoff before surfacing to the caller.
//! Leaves map to servers deterministically, so a failed read is always
//! retried against the same server.

#![deny(missing_docs)]

mod error;

pub use error::Error;

use oram_storage_iface::StorageConnection;
use oram_types::{
    framed::{read_frame, write_frame},
    messages::{
        ProxyReadRequest, ProxyWriteRequest, ServerReadResponse, ServerWriteResponse,
        PROXY_READ_REQUEST, PROXY_WRITE_REQUEST, SERVER_RESPONSE,
    },
};
use slog::{info, warn, Logger};
use std::{
    net::{SocketAddr, TcpStream},
    sync::Mutex,
    thread::sleep,
    time::Duration,
};

/// Attempts made against a server before an operation is surfaced as failed.
pub const MAX_ATTEMPTS: usize = 5;

/// Backoff before the second attempt; doubles per attempt after that.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// A connection to a single storage server.
pub struct TcpStorageConnection {
    addr: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
    logger: Logger,
}

impl TcpStorageConnection {
    /// A connection to the server at `addr`. No socket is opened until the
    /// first request.
    pub fn new(addr: SocketAddr, logger: Logger) -> Self {
        Self {
            addr,
            stream: Mutex::new(None),
            logger,
        }
    }

    /// The server this connection talks to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Run one framed request/response exchange, reconnecting and backing
    /// off on transport errors.
    fn exchange(&self, message_type: u32, payload: &[u8]) -> Result<(u32, Vec<u8>), Error> {
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = INITIAL_BACKOFF * (1 << (attempt - 1)) as u32;
                warn!(
                    self.logger,
                    "retrying {} after {:?} (attempt {})", self.addr, backoff, attempt
                );
                sleep(backoff);
            }

            match self.try_exchange(message_type, payload) {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    // Drop the socket; the next attempt reconnects.
                    *self.stream.lock().expect("mutex poisoned") = None;
                    last_err = Some(err);
                }
            }
        }
        Err(Error::Exhausted(
            self.addr,
            last_err.expect("at least one attempt ran").to_string(),
        ))
    }

    fn try_exchange(&self, message_type: u32, payload: &[u8]) -> Result<(u32, Vec<u8>), Error> {
        let mut guard = self.stream.lock().expect("mutex poisoned");
        if guard.is_none() {
            let stream = TcpStream::connect(self.addr)?;
            stream.set_nodelay(true)?;
            info!(self.logger, "connected to storage server {}", self.addr);
            *guard = Some(stream);
        }
        let stream = guard.as_mut().expect("stream was just set");
        write_frame(stream, message_type, payload)?;
        Ok(read_frame(stream)?)
    }
}

impl StorageConnection for TcpStorageConnection {
    type Error = Error;

    fn read_path(&self, relative_leaf: u64) -> Result<Vec<u8>, Error> {
        let request = ProxyReadRequest { relative_leaf };
        let (message_type, payload) = self.exchange(PROXY_READ_REQUEST, &request.encode())?;
        if message_type != SERVER_RESPONSE {
            return Err(Error::UnexpectedResponse(message_type));
        }
        let response = ServerReadResponse::decode(&payload)?;
        Ok(response.path_bytes)
    }

    fn write_paths(&self, paths: &[(u64, Vec<u8>)]) -> Result<bool, Error> {
        let request = ProxyWriteRequest {
            paths: paths.to_vec(),
        };
        let (message_type, payload) = self.exchange(PROXY_WRITE_REQUEST, &request.encode())?;
        if message_type != SERVER_RESPONSE {
            return Err(Error::UnexpectedResponse(message_type));
        }
        let response = ServerWriteResponse::decode(&payload)?;
        Ok(response.success)
    }
}
