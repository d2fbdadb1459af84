//! Encoder and streaming decoder for RESP traffic.

use crate::command::Command;
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::{MAX_AGGREGATE_LEN, MAX_BULK_LEN, MAX_DEPTH};
use bytes::{Bytes, BytesMut};

/// Encodes commands into request bytes.
pub struct Encoder;

impl Encoder {
    /// Encodes a single command.
    pub fn encode_command(command: &Command) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        command.encode(&mut buf);
        buf
    }

    /// Encodes several commands into one contiguous block, preserving order.
    pub fn encode_batch<'a, I>(commands: I) -> BytesMut
    where
        I: IntoIterator<Item = &'a Command>,
    {
        let mut buf = BytesMut::with_capacity(256);
        for command in commands {
            command.encode(&mut buf);
        }
        buf
    }
}

/// Accumulates bytes from a stream and yields complete frames.
///
/// A frame is only built once all of its bytes have arrived. Until then the
/// decoder remembers how far it got, so every byte is looked at a bounded
/// number of times however finely the frame is split across reads.
pub struct Decoder {
    buffer: BytesMut,
    progress: Progress,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            progress: Progress::default(),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        match self.progress.scan(&self.buffer) {
            Scan::Incomplete => Ok(None),
            Scan::Complete | Scan::Malformed => {
                // the full parse builds the frame or reports the exact error
                self.progress.reset();
                Frame::decode(&mut self.buffer)
            }
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns whether a frame has started arriving but is not complete yet.
    pub fn is_mid_frame(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.progress.reset();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

enum Scan {
    Complete,
    Incomplete,
    Malformed,
}

/// How much of the frame at the front of the buffer is known to be present.
#[derive(Default)]
struct Progress {
    /// Start of the first element not yet seen in full.
    offset: usize,
    /// Where the search for the current header's CRLF resumes, relative
    /// to `offset`.
    searched: usize,
    /// Elements each open aggregate still expects, innermost last.
    open: Vec<usize>,
}

impl Progress {
    fn reset(&mut self) {
        self.offset = 0;
        self.searched = 0;
        self.open.clear();
    }

    /// Walks element headers from where the last call stopped. Contents are
    /// not validated here; that is left to the frame parser.
    fn scan(&mut self, input: &[u8]) -> Scan {
        loop {
            if self.open.len() > MAX_DEPTH {
                return Scan::Malformed;
            }
            let rest = &input[self.offset..];
            let Some(&tag) = rest.first() else {
                return Scan::Incomplete;
            };
            if !b"+-:,#(_$!=*~>%".contains(&tag) {
                return Scan::Malformed;
            }

            let Some(end) = find_crlf(rest, self.searched.max(1)) else {
                // a trailing CR may still be followed by its LF
                self.searched = rest.len().saturating_sub(1);
                return Scan::Incomplete;
            };
            let line = &rest[1..end];
            let header = end + 2;

            let (used, children) = match tag {
                b'+' | b'-' | b':' | b',' | b'#' | b'(' | b'_' => (header, 0),
                b'$' | b'!' | b'=' => match length(line, MAX_BULK_LEN) {
                    Some(None) => (header, 0),
                    Some(Some(len)) if rest.len() >= header + len + 2 => (header + len + 2, 0),
                    Some(Some(_)) => {
                        self.searched = end;
                        return Scan::Incomplete;
                    }
                    None => return Scan::Malformed,
                },
                b'*' | b'~' | b'>' => match length(line, MAX_AGGREGATE_LEN) {
                    Some(len) => (header, len.unwrap_or(0)),
                    None => return Scan::Malformed,
                },
                b'%' => match length(line, MAX_AGGREGATE_LEN / 2) {
                    Some(len) => (header, len.unwrap_or(0) * 2),
                    None => return Scan::Malformed,
                },
                _ => return Scan::Malformed,
            };

            self.offset += used;
            self.searched = 0;
            if children > 0 {
                self.open.push(children);
                continue;
            }

            // one element finished; close every aggregate it completes
            loop {
                match self.open.last_mut() {
                    None => return Scan::Complete,
                    Some(remaining) => {
                        *remaining -= 1;
                        if *remaining > 0 {
                            break;
                        }
                        self.open.pop();
                    }
                }
            }
        }
    }
}

fn find_crlf(input: &[u8], from: usize) -> Option<usize> {
    input
        .get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|pos| from + pos)
}

/// Parses a length header: `Some(None)` for null, `None` if invalid.
fn length(line: &[u8], max: usize) -> Option<Option<usize>> {
    let len: i64 = std::str::from_utf8(line).ok()?.parse().ok()?;
    match len {
        -1 => Some(None),
        n if n < 0 => None,
        n if n as usize > max => None,
        n => Some(Some(n as usize)),
    }
}
