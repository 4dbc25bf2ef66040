//! DAP wire framing.
//!
//! Every message is a header block terminated by an empty line, followed by exactly
//! `Content-Length` bytes of payload. Reads are buffered, so a message may arrive
//! split across any number of underlying reads and several messages may arrive in one.

use crate::dap::tracer::{Direction, FileTracer};
use std::io::{self, Read, Write};
use std::sync::{Mutex, PoisonError};

const READ_CHUNK: usize = 8 * 1024;
const MAX_HEADER_LEN: usize = 8 * 1024;
const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "content-length";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport i/o: {0}")]
    Io(#[from] io::Error),
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(String),
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("header block exceeds {MAX_HEADER_LEN} bytes")]
    HeaderTooLong,
    #[error("stream closed inside a header block")]
    TruncatedHeader,
    #[error("stream closed after {received} of {expected} payload bytes")]
    TruncatedPayload { expected: usize, received: usize },
}

/// Splits a byte stream into message payloads.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    tracer: Option<FileTracer>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, tracer: Option<FileTracer>) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
            tracer,
        }
    }

    /// Read next message payload.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a message boundary.
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let header_end = loop {
            self.skip_leading_line_breaks();
            if let Some(pos) = find(&self.buf, HEADER_TERMINATOR) {
                break pos;
            }
            if self.buf.len() > MAX_HEADER_LEN {
                return Err(TransportError::HeaderTooLong);
            }
            if self.fill()? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::TruncatedHeader);
            }
        };

        let len = content_length(&self.buf[..header_end])?;
        let body_start = header_end + HEADER_TERMINATOR.len();
        while self.buf.len() < body_start + len {
            if self.fill()? == 0 {
                return Err(TransportError::TruncatedPayload {
                    expected: len,
                    received: self.buf.len() - body_start,
                });
            }
        }

        let payload = self.buf[body_start..body_start + len].to_vec();
        self.buf.drain(..body_start + len);

        if let Some(tracer) = &self.tracer {
            tracer.message(Direction::Incoming, &payload);
        }
        Ok(Some(payload))
    }

    fn skip_leading_line_breaks(&mut self) {
        let skip = self
            .buf
            .iter()
            .take_while(|b| **b == b'\r' || **b == b'\n')
            .count();
        if skip > 0 {
            self.buf.drain(..skip);
        }
    }

    fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn content_length(header_block: &[u8]) -> Result<usize, TransportError> {
    let block = String::from_utf8_lossy(header_block);
    let mut length = None;
    for line in block.split("\r\n") {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| TransportError::MalformedHeader(line.to_string()))?;
        if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            let value = value.trim();
            let parsed = value
                .parse::<usize>()
                .ok()
                .filter(|len| *len <= MAX_PAYLOAD_LEN)
                .ok_or_else(|| TransportError::InvalidContentLength(value.to_string()))?;
            length = Some(parsed);
        }
    }
    length.ok_or(TransportError::MissingContentLength)
}

/// Writes framed messages.
///
/// The whole frame (header and payload) is written under one lock, so frames from
/// different threads never interleave.
pub struct FrameWriter<W> {
    inner: Mutex<W>,
    tracer: Option<FileTracer>,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W, tracer: Option<FileTracer>) -> Self {
        Self {
            inner: Mutex::new(inner),
            tracer,
        }
    }

    pub fn write_frame(&self, payload: &[u8]) -> Result<(), TransportError> {
        let mut out = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        write!(out, "Content-Length: {}\r\n\r\n", payload.len())?;
        out.write_all(payload)?;
        out.flush()?;
        drop(out);

        if let Some(tracer) = &self.tracer {
            tracer.message(Direction::Outgoing, payload);
        }
        Ok(())
    }
}
