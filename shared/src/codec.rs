//! Line-delimited JSON codec
//!
//! All messages, on the TCP link and on the serial link, are framed as:
//! ```text
//! [ N bytes: UTF-8 JSON object ][ '\n' ]
//! ```
//!
//! A `\r` before the newline is tolerated so firmware printing with
//! `println` talks to the bridge unchanged. Blank lines are skipped.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum line length (64 KiB); longer input is discarded
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Line too long: {0} bytes (max: {MAX_LINE_LEN})")]
    LineTooLong(usize),

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode a message into a newline-terminated byte buffer
pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(128);
    encode_into(msg, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a message directly into a provided buffer
pub fn encode_into<T: Serialize>(msg: &T, buf: &mut BytesMut) -> Result<(), CodecError> {
    let json = serde_json::to_vec(msg)?;

    if json.len() > MAX_LINE_LEN {
        return Err(CodecError::LineTooLong(json.len()));
    }

    buf.reserve(json.len() + 1);
    buf.put_slice(&json);
    buf.put_u8(b'\n');

    Ok(())
}

/// Try to decode one line from the buffer
///
/// Returns:
/// - `Ok(Some(msg))` if a complete line was decoded
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if the line was invalid; the offending bytes are consumed so
///   the next call resumes at the following line
pub fn decode<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, CodecError> {
    loop {
        let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
            if buf.len() > MAX_LINE_LEN {
                let len = buf.len();
                buf.clear();
                return Err(CodecError::LineTooLong(len));
            }
            return Ok(None);
        };

        let line = buf.split_to(pos);
        buf.advance(1);

        let trimmed = trim_line(&line);
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.len() > MAX_LINE_LEN {
            return Err(CodecError::LineTooLong(trimmed.len()));
        }

        return Ok(Some(serde_json::from_slice(trimmed)?));
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &line[start..end]
}

/// Decoder state for streaming input
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Partial line data being accumulated
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next line from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete lines.
    /// An error only affects the line that caused it.
    pub fn decode_next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, CodecError> {
        decode(&mut self.buffer)
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}
