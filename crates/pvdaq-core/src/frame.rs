//! Frame decoder for the serial reply stream.
//!
//! Instrument replies arrive either as a fixed number of CR LF terminated
//! lines, or (for bulk data reads) as a fixed-length binary block with an
//! optional CRC-8 trailer. The decoder accumulates raw bytes as they arrive
//! and reports completion once the declared frame shape is satisfied; the
//! consumed prefix is discarded so leftover bytes from a previous overrun do
//! not corrupt the next frame.
//!
//! Framing rules (mirroring the instrument firmware):
//!
//! - `Lines(n)`: the n-th terminator completes the frame. The chunks before
//!   the final terminator form the payload; the chunk in front of the last
//!   terminator is the acknowledgement line and is dropped, so a frame with
//!   n terminators yields n-1 payload lines.
//! - A command may declare a leading status byte; the first delimited chunk
//!   is then captured as a single health byte and excluded from the payload.
//! - `Binary { len, crc }`: complete once `len` bytes are buffered. With
//!   `crc`, the last byte is a CRC-8 trailer (polynomial 0x1D, MSB-first,
//!   no reflection) over the preceding bytes; a mismatch is a retryable
//!   decode failure, not a protocol abort.

use bytes::{Buf, BytesMut};

use crate::error::{EngineError, EngineResult};

/// Two-byte line terminator used by every supported firmware.
pub const TERMINATOR: &[u8] = b"\r\n";

/// Declared shape of an expected reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Complete after this many CR LF terminators.
    Lines(usize),
    /// Complete after exactly `len` buffered bytes.
    Binary { len: usize, crc: bool },
}

/// A complete, decoded reply unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    /// Leading status/health byte, when the command declared one.
    pub status: Option<u8>,
    /// Delimited payload chunks (line mode), in arrival order.
    pub lines: Vec<Vec<u8>>,
    /// Binary payload (binary mode), CRC trailer stripped.
    pub binary: Option<Vec<u8>>,
}

impl Frame {
    /// Payload lines decoded as trimmed UTF-8 text.
    pub fn text_lines(&self) -> EngineResult<Vec<String>> {
        self.lines
            .iter()
            .map(|raw| {
                std::str::from_utf8(raw)
                    .map(|s| s.trim().to_string())
                    .map_err(|_| EngineError::Decode("payload line is not UTF-8".into()))
            })
            .collect()
    }

    /// First payload line as text, for single-value replies.
    pub fn first_text(&self) -> EngineResult<String> {
        self.text_lines()?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Decode("frame has no payload line".into()))
    }
}

/// CRC-8, polynomial 0x1D, MSB-first, no reflection, zero init.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x1D
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Incremental decoder for one expected frame.
///
/// Feed incoming chunks with [`extend`](Self::extend), then call
/// [`try_complete`](Self::try_complete); `Ok(None)` means more bytes are
/// needed. A partial buffer never completes early.
#[derive(Debug)]
pub struct FrameDecoder {
    format: FrameFormat,
    leading_status: bool,
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new(format: FrameFormat, leading_status: bool) -> Self {
        Self {
            format,
            leading_status,
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Append newly received bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes currently buffered (for diagnostics).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Attempt to extract a complete frame from the buffered bytes.
    ///
    /// On completion (or CRC failure) the consumed prefix is discarded;
    /// trailing bytes stay buffered.
    pub fn try_complete(&mut self) -> EngineResult<Option<Frame>> {
        match self.format {
            FrameFormat::Lines(n) => self.try_complete_lines(n),
            FrameFormat::Binary { len, crc } => self.try_complete_binary(len, crc),
        }
    }

    fn try_complete_lines(&mut self, n: usize) -> EngineResult<Option<Frame>> {
        let terminators = find_terminators(&self.buf);
        if n == 0 || terminators.len() < n {
            return Ok(None);
        }

        // Split the consumed prefix off so leftovers survive for the next
        // frame.
        let consumed_len = terminators[n - 1] + TERMINATOR.len();
        let consumed = self.buf.split_to(consumed_len);

        let mut chunks: Vec<Vec<u8>> = Vec::with_capacity(n);
        let mut start = 0usize;
        for &term_at in terminators.iter().take(n) {
            chunks.push(consumed[start..term_at].to_vec());
            start = term_at + TERMINATOR.len();
        }

        // The chunk ahead of the final terminator is the acknowledgement.
        chunks.pop();

        let mut frame = Frame::default();
        if self.leading_status {
            if chunks.is_empty() {
                return Err(EngineError::Decode(
                    "status byte declared but frame has a single line".into(),
                ));
            }
            let head = chunks.remove(0);
            let byte = *head
                .first()
                .ok_or_else(|| EngineError::Decode("empty status chunk".into()))?;
            frame.status = Some(byte);
        }
        frame.lines = chunks;
        Ok(Some(frame))
    }

    fn try_complete_binary(&mut self, len: usize, crc: bool) -> EngineResult<Option<Frame>> {
        if self.buf.len() < len {
            return Ok(None);
        }

        let mut payload = self.buf.split_to(len).to_vec();
        if crc {
            let trailer = match payload.pop() {
                Some(t) => t,
                None => return Err(EngineError::Decode("zero-length CRC frame".into())),
            };
            let expected = crc8(&payload);
            if trailer != expected {
                // Frame bytes are already consumed, so a retry reads fresh
                // data rather than the same corrupt prefix.
                return Err(EngineError::Crc {
                    expected,
                    actual: trailer,
                });
            }
        }

        Ok(Some(Frame {
            status: None,
            lines: Vec::new(),
            binary: Some(payload),
        }))
    }

    /// Discard everything buffered (used when a command is abandoned).
    pub fn clear(&mut self) {
        self.buf.advance(self.buf.len());
    }
}

fn find_terminators(buf: &[u8]) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut i = 0;
    while i + TERMINATOR.len() <= buf.len() {
        if &buf[i..i + TERMINATOR.len()] == TERMINATOR {
            positions.push(i);
            i += TERMINATOR.len();
        } else {
            i += 1;
        }
    }
    positions
}
