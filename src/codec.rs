//! Newline framing for the TCP control channel.
//!
//! A malformed line yields an `Err` item for that line only; the stream keeps
//! going. Partial lines stay buffered until their `\n` arrives, up to
//! [`MAX_LINE_LENGTH`]; a longer line is reported once and skipped.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{AzmError, Result};
use crate::protocol::{decode_message, Message, Request};

/// One decoded line: a message, or the protocol error for that line
pub type Frame = Result<Message>;

/// Longest line accepted from the device, not counting its terminator
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Line codec for JSON-RPC frames
#[derive(Debug)]
pub struct AzmCodec {
    /// Bytes already scanned for a terminator
    next_index: usize,
    max_length: usize,
    /// Skipping the rest of an overlong line
    discarding: bool,
}

impl AzmCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length,
            discarding: false,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for AzmCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AzmCodec {
    type Item = Frame;
    type Error = AzmError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            let read_to = self.max_length.saturating_add(1).min(buf.len());
            let newline = buf[self.next_index..read_to].iter().position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.next_index = 0;
                    self.discarding = false;
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let line = buf.split_to(self.next_index + offset + 1);
                    self.next_index = 0;
                    if let Some(frame) = decode_line(&line) {
                        return Ok(Some(frame));
                    }
                }
                (false, None) if buf.len() > self.max_length => {
                    self.discarding = true;
                    return Ok(Some(Err(AzmError::Protocol(format!(
                        "line exceeds {} bytes",
                        self.max_length
                    )))));
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split();
        Ok(decode_line(&rest))
    }
}

impl Encoder<Request> for AzmCodec {
    type Error = AzmError;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<()> {
        let line = request.encode()?;
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Decode a UDP datagram; each one is a complete frame
pub fn decode_datagram(datagram: &[u8]) -> Frame {
    decode_line(datagram).unwrap_or_else(|| Err(AzmError::Protocol("empty datagram".to_string())))
}

/// `None` for blank lines
fn decode_line(raw: &[u8]) -> Option<Frame> {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text.trim(),
        Err(e) => return Some(Err(AzmError::Protocol(format!("invalid UTF-8: {}", e)))),
    };
    if text.is_empty() {
        return None;
    }
    Some(decode_message(text))
}
