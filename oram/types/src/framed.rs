// Copyright (c) 2018-2021 The MobileCoin Foundation

//! Blocking framed I/O over any `Read`/`Write` stream.

use crate::messages::{frame, FrameHeader, FRAME_HEADER_LEN};
use alloc::{string::ToString, vec, vec::Vec};
use std::io::{Error, ErrorKind, Read, Result, Write};

/// Upper bound on an accepted payload. Anything larger is a framing error
/// and the connection should be dropped.
pub const MAX_PAYLOAD_LEN: u32 = 1 << 28;

/// Write one framed message.
pub fn write_frame<W: Write>(writer: &mut W, message_type: u32, payload: &[u8]) -> Result<()> {
    writer.write_all(&frame(message_type, payload))?;
    writer.flush()
}

/// Read one framed message, returning `(message_type, payload)`.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<(u32, Vec<u8>)> {
    let mut header_bytes = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header_bytes)?;
    let header = FrameHeader::parse(&header_bytes)
        .map_err(|e| Error::new(ErrorKind::InvalidData, e.to_string()))?;
    if header.payload_len > MAX_PAYLOAD_LEN {
        return Err(Error::new(
            ErrorKind::InvalidData,
            "frame payload exceeds limit",
        ));
    }
    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload)?;
    Ok((header.message_type, payload))
}
