// Copyright (c) 2018-2021 The MobileCoin Foundation

//! The message types exchanged on the client and storage-server channels.
//!
//! Every message is framed as `[message_type: u32 BE][payload_len: u32 BE]`
//! followed by the payload. All integer fields are big-endian.

use alloc::{string::String, vec::Vec};
use core::convert::TryInto;
use displaydoc::Display;
use serde::{Deserialize, Serialize};

/// A client asks the proxy to read a block.
pub const CLIENT_READ_REQUEST: u32 = 1;
/// A client asks the proxy to write a block.
pub const CLIENT_WRITE_REQUEST: u32 = 2;
/// The proxy answers a client request.
pub const PROXY_RESPONSE: u32 = 3;
/// The proxy fetches one path from a storage server.
pub const PROXY_READ_REQUEST: u32 = 4;
/// The proxy ships a batch of encrypted paths to a storage server.
pub const PROXY_WRITE_REQUEST: u32 = 5;
/// A storage server answers a proxy request.
pub const SERVER_RESPONSE: u32 = 6;

/// Length of the `[type][len]` frame header.
pub const FRAME_HEADER_LEN: usize = 8;

/// An error arising while encoding or decoding a message.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum MessageError {
    /// payload is shorter than its fixed fields require
    Truncated,
    /// payload length does not match the declared layout
    LengthMismatch,
    /// unexpected message type: {0}
    UnexpectedType(u32),
    /// client host is not valid utf-8
    HostEncoding,
}

/// The `[type][len]` header in front of every message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    /// One of the `*_REQUEST` / `*_RESPONSE` constants.
    pub message_type: u32,
    /// Length of the payload that follows.
    pub payload_len: u32,
}

impl FrameHeader {
    /// Serialize the header.
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0u8; FRAME_HEADER_LEN];
        out[0..4].copy_from_slice(&self.message_type.to_be_bytes());
        out[4..8].copy_from_slice(&self.payload_len.to_be_bytes());
        out
    }

    /// Parse a header from the first [`FRAME_HEADER_LEN`] bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(MessageError::Truncated);
        }
        Ok(Self {
            message_type: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            payload_len: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
        })
    }
}

/// Prepend a frame header to a payload.
pub fn frame(message_type: u32, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader {
        message_type,
        payload_len: payload.len() as u32,
    };
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    out
}

/// The `host:port` a client wants its response delivered to.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    /// Hostname or address literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl HostPort {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.host.len() as u16).to_be_bytes());
        out.extend_from_slice(self.host.as_bytes());
        out.extend_from_slice(&self.port.to_be_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<(Self, usize), MessageError> {
        if bytes.len() < 2 {
            return Err(MessageError::Truncated);
        }
        let host_len = u16::from_be_bytes(bytes[0..2].try_into().unwrap()) as usize;
        if bytes.len() < 2 + host_len + 2 {
            return Err(MessageError::Truncated);
        }
        let host = core::str::from_utf8(&bytes[2..2 + host_len])
            .map_err(|_| MessageError::HostEncoding)?;
        let port = u16::from_be_bytes(bytes[2 + host_len..2 + host_len + 2].try_into().unwrap());
        Ok((
            Self {
                host: String::from(host),
                port,
            },
            2 + host_len + 2,
        ))
    }
}

impl core::fmt::Display for HostPort {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Read or write, as requested by the client.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ClientOp {
    /// Return the block's bytes.
    Read,
    /// Replace the block's bytes.
    Write,
}

/// Identifies one client request across the proxy's tables. Request ids are
/// assigned by clients and are only unique per client, so the response
/// address is part of the key.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct RequestKey {
    /// Where the response goes.
    pub client: HostPort,
    /// The client-assigned request id.
    pub request_id: u64,
}

/// A client-issued block read or write.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    /// Read or write.
    pub op: ClientOp,
    /// Client-assigned id, echoed in the response.
    pub request_id: u64,
    /// The logical block being accessed.
    pub block_id: u64,
    /// Payload for writes; empty for reads.
    pub data: Vec<u8>,
    /// Where the response goes.
    pub client: HostPort,
}

impl ClientRequest {
    /// The key this request occupies in the proxy's tables.
    pub fn key(&self) -> RequestKey {
        RequestKey {
            client: self.client.clone(),
            request_id: self.request_id,
        }
    }

    /// The message type this request is framed as.
    pub fn message_type(&self) -> u32 {
        match self.op {
            ClientOp::Read => CLIENT_READ_REQUEST,
            ClientOp::Write => CLIENT_WRITE_REQUEST,
        }
    }

    /// Serialize the payload (header not included).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.request_id.to_be_bytes());
        out.extend_from_slice(&self.block_id.to_be_bytes());
        if self.op == ClientOp::Write {
            out.extend_from_slice(&self.data);
        }
        self.client.encode_into(&mut out);
        out
    }

    /// Parse a payload of the given message type. Write payloads carry
    /// exactly `block_size` data bytes between the fixed fields and the
    /// response address.
    pub fn decode(
        message_type: u32,
        payload: &[u8],
        block_size: usize,
    ) -> Result<Self, MessageError> {
        let op = match message_type {
            CLIENT_READ_REQUEST => ClientOp::Read,
            CLIENT_WRITE_REQUEST => ClientOp::Write,
            other => return Err(MessageError::UnexpectedType(other)),
        };
        if payload.len() < 16 {
            return Err(MessageError::Truncated);
        }
        let request_id = u64::from_be_bytes(payload[0..8].try_into().unwrap());
        let block_id = u64::from_be_bytes(payload[8..16].try_into().unwrap());
        let (data, rest) = match op {
            ClientOp::Read => (Vec::new(), &payload[16..]),
            ClientOp::Write => {
                if payload.len() < 16 + block_size {
                    return Err(MessageError::Truncated);
                }
                (
                    payload[16..16 + block_size].to_vec(),
                    &payload[16 + block_size..],
                )
            }
        };
        let (client, used) = HostPort::decode(rest)?;
        if used != rest.len() {
            return Err(MessageError::LengthMismatch);
        }
        Ok(Self {
            op,
            request_id,
            block_id,
            data,
            client,
        })
    }
}

/// The proxy's answer to a client request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProxyResponse {
    /// Answer to a read: the block's bytes.
    Read {
        /// Echoed request id.
        request_id: u64,
        /// The block payload.
        data: Vec<u8>,
    },
    /// Answer to a write: whether it was applied.
    Write {
        /// Echoed request id.
        request_id: u64,
        /// Write status.
        success: bool,
    },
}

impl ProxyResponse {
    /// Serialize the payload (header not included).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ProxyResponse::Read { request_id, data } => {
                let mut out = Vec::with_capacity(8 + data.len());
                out.extend_from_slice(&request_id.to_be_bytes());
                out.extend_from_slice(data);
                out
            }
            ProxyResponse::Write {
                request_id,
                success,
            } => {
                let mut out = Vec::with_capacity(9);
                out.extend_from_slice(&request_id.to_be_bytes());
                out.push(*success as u8);
                out
            }
        }
    }

    /// Parse a response to a read request.
    pub fn decode_read(payload: &[u8], block_size: usize) -> Result<Self, MessageError> {
        if payload.len() != 8 + block_size {
            return Err(MessageError::LengthMismatch);
        }
        Ok(ProxyResponse::Read {
            request_id: u64::from_be_bytes(payload[0..8].try_into().unwrap()),
            data: payload[8..].to_vec(),
        })
    }

    /// Parse a response to a write request.
    pub fn decode_write(payload: &[u8]) -> Result<Self, MessageError> {
        if payload.len() != 9 {
            return Err(MessageError::LengthMismatch);
        }
        Ok(ProxyResponse::Write {
            request_id: u64::from_be_bytes(payload[0..8].try_into().unwrap()),
            success: payload[8] != 0,
        })
    }
}

/// Proxy-to-server request for one encrypted path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProxyReadRequest {
    /// Partition-relative leaf to fetch.
    pub relative_leaf: u64,
}

impl ProxyReadRequest {
    /// Serialize the payload.
    pub fn encode(&self) -> Vec<u8> {
        self.relative_leaf.to_be_bytes().to_vec()
    }

    /// Parse the payload.
    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        if payload.len() != 8 {
            return Err(MessageError::LengthMismatch);
        }
        Ok(Self {
            relative_leaf: u64::from_be_bytes(payload.try_into().unwrap()),
        })
    }
}

/// Proxy-to-server batch of freshly encrypted paths. Every path ciphertext
/// in a batch has the same length, so the layout is self-describing:
/// `path_count: u32 BE`, then per path `relative_leaf: u64 BE || ciphertext`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProxyWriteRequest {
    /// `(relative_leaf, encrypted path)` pairs.
    pub paths: Vec<(u64, Vec<u8>)>,
}

impl ProxyWriteRequest {
    /// Serialize the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.paths.len() as u32).to_be_bytes());
        for (relative_leaf, bytes) in &self.paths {
            out.extend_from_slice(&relative_leaf.to_be_bytes());
            out.extend_from_slice(bytes);
        }
        out
    }

    /// Parse the payload.
    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        if payload.len() < 4 {
            return Err(MessageError::Truncated);
        }
        let count = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as usize;
        let body = &payload[4..];
        if count == 0 {
            return if body.is_empty() {
                Ok(Self { paths: Vec::new() })
            } else {
                Err(MessageError::LengthMismatch)
            };
        }
        if body.len() % count != 0 || body.len() / count < 8 {
            return Err(MessageError::LengthMismatch);
        }
        let stride = body.len() / count;
        let mut paths = Vec::with_capacity(count);
        for chunk in body.chunks_exact(stride) {
            let relative_leaf = u64::from_be_bytes(chunk[0..8].try_into().unwrap());
            paths.push((relative_leaf, chunk[8..].to_vec()));
        }
        Ok(Self { paths })
    }
}

/// Server answer to a path read: the relative leaf plus the encrypted path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerReadResponse {
    /// Partition-relative leaf this path belongs to.
    pub leaf: u64,
    /// The encrypted path, root bucket first.
    pub path_bytes: Vec<u8>,
}

impl ServerReadResponse {
    /// Serialize the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.path_bytes.len());
        out.extend_from_slice(&self.leaf.to_be_bytes());
        out.extend_from_slice(&self.path_bytes);
        out
    }

    /// Parse the payload.
    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        if payload.len() < 8 {
            return Err(MessageError::Truncated);
        }
        Ok(Self {
            leaf: u64::from_be_bytes(payload[0..8].try_into().unwrap()),
            path_bytes: payload[8..].to_vec(),
        })
    }
}

/// Server answer to a path write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServerWriteResponse {
    /// Whether the whole batch was committed.
    pub success: bool,
}

impl ServerWriteResponse {
    /// Serialize the payload.
    pub fn encode(&self) -> Vec<u8> {
        alloc::vec![self.success as u8]
    }

    /// Parse the payload.
    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        if payload.len() != 1 {
            return Err(MessageError::LengthMismatch);
        }
        Ok(Self {
            success: payload[0] != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    fn client() -> HostPort {
        HostPort {
            host: "127.0.0.1".to_string(),
            port: 9876,
        }
    }

    #[test]
    fn frame_header_round_trip() {
        let header = FrameHeader {
            message_type: CLIENT_WRITE_REQUEST,
            payload_len: 1234,
        };
        assert_eq!(FrameHeader::parse(&header.to_bytes()).unwrap(), header);
        assert_eq!(FrameHeader::parse(&[0u8; 5]), Err(MessageError::Truncated));
    }

    #[test]
    fn client_read_request_round_trip() {
        let req = ClientRequest {
            op: ClientOp::Read,
            request_id: 42,
            block_id: 7,
            data: Vec::new(),
            client: client(),
        };
        let parsed = ClientRequest::decode(CLIENT_READ_REQUEST, &req.encode(), 4).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn client_write_request_round_trip() {
        let req = ClientRequest {
            op: ClientOp::Write,
            request_id: 43,
            block_id: 9,
            data: alloc::vec![0xCA, 0xFE, 0xBA, 0xBE],
            client: client(),
        };
        let parsed = ClientRequest::decode(CLIENT_WRITE_REQUEST, &req.encode(), 4).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn client_request_rejects_bad_type_and_truncation() {
        assert_eq!(
            ClientRequest::decode(SERVER_RESPONSE, &[], 4),
            Err(MessageError::UnexpectedType(SERVER_RESPONSE))
        );
        assert_eq!(
            ClientRequest::decode(CLIENT_READ_REQUEST, &[0u8; 10], 4),
            Err(MessageError::Truncated)
        );
    }

    #[test]
    fn request_keys_distinguish_clients() {
        let a = ClientRequest {
            op: ClientOp::Read,
            request_id: 1,
            block_id: 0,
            data: Vec::new(),
            client: client(),
        };
        let mut b = a.clone();
        b.client.port = 9877;
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn proxy_response_round_trips() {
        let read = ProxyResponse::Read {
            request_id: 5,
            data: alloc::vec![1, 2, 3, 4],
        };
        assert_eq!(ProxyResponse::decode_read(&read.encode(), 4).unwrap(), read);

        let write = ProxyResponse::Write {
            request_id: 6,
            success: true,
        };
        assert_eq!(ProxyResponse::decode_write(&write.encode()).unwrap(), write);
    }

    #[test]
    fn proxy_write_request_round_trip() {
        let req = ProxyWriteRequest {
            paths: alloc::vec![(0, alloc::vec![0xAA; 32]), (3, alloc::vec![0xBB; 32])],
        };
        assert_eq!(ProxyWriteRequest::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn proxy_write_request_rejects_ragged_batches() {
        // Two paths of unequal length cannot have produced this payload.
        let mut payload = 2u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0u8; 25]);
        assert_eq!(
            ProxyWriteRequest::decode(&payload),
            Err(MessageError::LengthMismatch)
        );
    }

    #[test]
    fn server_responses_round_trip() {
        let read = ServerReadResponse {
            leaf: 11,
            path_bytes: alloc::vec![9u8; 64],
        };
        assert_eq!(ServerReadResponse::decode(&read.encode()).unwrap(), read);

        let write = ServerWriteResponse { success: false };
        assert_eq!(ServerWriteResponse::decode(&write.encode()).unwrap(), write);
    }
}
