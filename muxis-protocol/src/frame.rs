//! RESP frames (RESP2 plus the RESP3 types a server may send back).
//!
//! Every frame starts with a type byte and ends with CRLF:
//!
//! ```text
//! +OK\r\n                      simple string
//! -ERR message\r\n             error
//! :1000\r\n                    integer
//! $5\r\nhello\r\n              bulk string   ($-1\r\n is null)
//! *2\r\n:1\r\n:2\r\n           array         (*-1\r\n is null)
//! _\r\n                        null          (RESP3)
//! ,3.14\r\n                    double        (RESP3)
//! #t\r\n                       boolean       (RESP3)
//! (3492890328409238509\r\n     big number    (RESP3)
//! !21\r\nSYNTAX invalid syntax\r\n  bulk error (RESP3)
//! =15\r\ntxt:Some string\r\n   verbatim      (RESP3)
//! %1\r\n+key\r\n:1\r\n         map           (RESP3)
//! ~2\r\n:1\r\n:2\r\n           set           (RESP3)
//! >3\r\n$7\r\nmessage\r\n...   push          (RESP3)
//! ```
//!
//! Parsing is incremental: [`Frame::parse`] returns `Ok(None)` until a full
//! frame is available and never consumes a partial one.

use crate::error::ProtocolError;
use crate::{MAX_AGGREGATE_LEN, MAX_BULK_LEN, MAX_DEPTH};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A decoded RESP frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    BigNumber(String),
    Bulk(Bytes),
    Verbatim { format: String, text: Bytes },
    Null,
    Array(Vec<Frame>),
    Set(Vec<Frame>),
    Map(Vec<(Frame, Frame)>),
    Push(Vec<Frame>),
}

type ParseResult<T> = Result<Option<(T, usize)>, ProtocolError>;

impl Frame {
    /// Parses one frame from the front of `input`.
    ///
    /// Returns the frame and the number of bytes it occupied, or `Ok(None)`
    /// if `input` does not yet hold a complete frame.
    pub fn parse(input: &[u8]) -> ParseResult<Frame> {
        parse_frame(input, 0)
    }

    /// Decodes one frame from `buf`, consuming its bytes on success.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        match Frame::parse(buf)? {
            Some((frame, consumed)) => {
                buf.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Appends the wire form of this frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Simple(s) => put_line(buf, b'+', s.as_bytes()),
            Frame::Error(s) => put_line(buf, b'-', s.as_bytes()),
            Frame::Integer(i) => put_line(buf, b':', i.to_string().as_bytes()),
            Frame::Double(d) => {
                let text = if d.is_nan() {
                    "nan".to_string()
                } else if d.is_infinite() {
                    (if *d > 0.0 { "inf" } else { "-inf" }).to_string()
                } else {
                    d.to_string()
                };
                put_line(buf, b',', text.as_bytes())
            }
            Frame::Boolean(b) => put_line(buf, b'#', if *b { b"t" } else { b"f" }),
            Frame::BigNumber(n) => put_line(buf, b'(', n.as_bytes()),
            Frame::Bulk(data) => put_blob(buf, b'$', data),
            Frame::Verbatim { format, text } => {
                let mut body = Vec::with_capacity(format.len() + 1 + text.len());
                body.extend_from_slice(format.as_bytes());
                body.push(b':');
                body.extend_from_slice(text);
                put_blob(buf, b'=', &body)
            }
            Frame::Null => buf.put_slice(b"_\r\n"),
            Frame::Array(items) => put_aggregate(buf, b'*', items),
            Frame::Set(items) => put_aggregate(buf, b'~', items),
            Frame::Push(items) => put_aggregate(buf, b'>', items),
            Frame::Map(pairs) => {
                put_line(buf, b'%', pairs.len().to_string().as_bytes());
                for (key, value) in pairs {
                    key.encode(buf);
                    value.encode(buf);
                }
            }
        }
    }

    /// Returns the wire form of this frame.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Shorthand for a bulk frame holding `data`.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::Bulk(data.into())
    }

    /// Returns the textual content of a simple or bulk frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Simple(s) => Some(s),
            Frame::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Returns whether this frame is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Returns a short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Simple(_) => "simple",
            Frame::Error(_) => "error",
            Frame::Integer(_) => "integer",
            Frame::Double(_) => "double",
            Frame::Boolean(_) => "boolean",
            Frame::BigNumber(_) => "big-number",
            Frame::Bulk(_) => "bulk",
            Frame::Verbatim { .. } => "verbatim",
            Frame::Null => "null",
            Frame::Array(_) => "array",
            Frame::Set(_) => "set",
            Frame::Map(_) => "map",
            Frame::Push(_) => "push",
        }
    }
}

fn put_line(buf: &mut BytesMut, tag: u8, body: &[u8]) {
    buf.put_u8(tag);
    buf.put_slice(body);
    buf.put_slice(b"\r\n");
}

fn put_blob(buf: &mut BytesMut, tag: u8, data: &[u8]) {
    put_line(buf, tag, data.len().to_string().as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}

fn put_aggregate(buf: &mut BytesMut, tag: u8, items: &[Frame]) {
    put_line(buf, tag, items.len().to_string().as_bytes());
    for item in items {
        item.encode(buf);
    }
}

/// Finds the CRLF-terminated line starting at `input[0]`.
/// Returns the line without the terminator and the bytes consumed.
fn read_line(input: &[u8]) -> Option<(&[u8], usize)> {
    let pos = input.windows(2).position(|w| w == b"\r\n")?;
    Some((&input[..pos], pos + 2))
}

fn parse_int(line: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ProtocolError::InvalidInteger(String::from_utf8_lossy(line).into_owned()))
}

fn parse_text(line: &[u8]) -> Result<String, ProtocolError> {
    std::str::from_utf8(line)
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidUtf8)
}

fn parse_double(line: &[u8]) -> Result<f64, ProtocolError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::InvalidDouble(String::from_utf8_lossy(line).into_owned()))?;
    match text {
        "inf" | "+inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        "nan" | "-nan" => Ok(f64::NAN),
        _ => text
            .parse::<f64>()
            .map_err(|_| ProtocolError::InvalidDouble(text.to_string())),
    }
}

/// Parses a length header. `Ok(None)` inside the option means a null (-1).
fn parse_len(line: &[u8], max: usize, bulk: bool) -> Result<Option<usize>, ProtocolError> {
    let len = parse_int(line)?;
    if len == -1 {
        return Ok(None);
    }
    if len < 0 {
        return Err(ProtocolError::InvalidLength(len));
    }
    let len = len as usize;
    if len > max {
        return Err(if bulk {
            ProtocolError::BulkTooLarge { size: len, max }
        } else {
            ProtocolError::AggregateTooLarge { len, max }
        });
    }
    Ok(Some(len))
}

fn parse_frame(input: &[u8], depth: usize) -> ParseResult<Frame> {
    if depth > MAX_DEPTH {
        return Err(ProtocolError::NestingTooDeep(MAX_DEPTH));
    }
    let Some(&tag) = input.first() else {
        return Ok(None);
    };
    let rest = &input[1..];

    match tag {
        b'+' | b'-' | b':' | b',' | b'#' | b'(' | b'_' => {
            let Some((line, used)) = read_line(rest) else {
                return Ok(None);
            };
            let frame = match tag {
                b'+' => Frame::Simple(parse_text(line)?),
                b'-' => Frame::Error(String::from_utf8_lossy(line).into_owned()),
                b':' => Frame::Integer(parse_int(line)?),
                b',' => Frame::Double(parse_double(line)?),
                b'#' => match line {
                    b"t" => Frame::Boolean(true),
                    b"f" => Frame::Boolean(false),
                    _ => {
                        return Err(ProtocolError::InvalidInteger(
                            String::from_utf8_lossy(line).into_owned(),
                        ))
                    }
                },
                b'(' => Frame::BigNumber(parse_text(line)?),
                _ => Frame::Null,
            };
            Ok(Some((frame, 1 + used)))
        }
        b'$' | b'!' | b'=' => {
            let Some((line, header)) = read_line(rest) else {
                return Ok(None);
            };
            let Some(len) = parse_len(line, MAX_BULK_LEN, true)? else {
                return Ok(Some((Frame::Null, 1 + header)));
            };
            let body = &rest[header..];
            if body.len() < len + 2 {
                return Ok(None);
            }
            if &body[len..len + 2] != b"\r\n" {
                return Err(ProtocolError::MissingCrlf);
            }
            let data = &body[..len];
            let frame = match tag {
                b'$' => Frame::Bulk(Bytes::copy_from_slice(data)),
                b'!' => Frame::Error(String::from_utf8_lossy(data).into_owned()),
                _ => {
                    // "txt:" style prefix; tolerate servers that omit it
                    if data.len() >= 4 && data[3] == b':' {
                        Frame::Verbatim {
                            format: String::from_utf8_lossy(&data[..3]).into_owned(),
                            text: Bytes::copy_from_slice(&data[4..]),
                        }
                    } else {
                        Frame::Verbatim {
                            format: "txt".to_string(),
                            text: Bytes::copy_from_slice(data),
                        }
                    }
                }
            };
            Ok(Some((frame, 1 + header + len + 2)))
        }
        b'*' | b'~' | b'>' => {
            let Some((line, header)) = read_line(rest) else {
                return Ok(None);
            };
            let Some(len) = parse_len(line, MAX_AGGREGATE_LEN, false)? else {
                return Ok(Some((Frame::Null, 1 + header)));
            };
            let Some((items, used)) = parse_items(&rest[header..], len, depth)? else {
                return Ok(None);
            };
            let frame = match tag {
                b'*' => Frame::Array(items),
                b'~' => Frame::Set(items),
                _ => Frame::Push(items),
            };
            Ok(Some((frame, 1 + header + used)))
        }
        b'%' => {
            let Some((line, header)) = read_line(rest) else {
                return Ok(None);
            };
            let Some(len) = parse_len(line, MAX_AGGREGATE_LEN / 2, false)? else {
                return Ok(Some((Frame::Null, 1 + header)));
            };
            let Some((flat, used)) = parse_items(&rest[header..], len * 2, depth)? else {
                return Ok(None);
            };
            let mut pairs = Vec::with_capacity(len);
            let mut iter = flat.into_iter();
            while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                pairs.push((key, value));
            }
            Ok(Some((Frame::Map(pairs), 1 + header + used)))
        }
        other => Err(ProtocolError::InvalidTypeByte(other)),
    }
}

fn parse_items(input: &[u8], count: usize, depth: usize) -> ParseResult<Vec<Frame>> {
    // Cap the preallocation: the length header is untrusted until the items arrive.
    let mut items = Vec::with_capacity(count.min(1024));
    let mut offset = 0;
    for _ in 0..count {
        match parse_frame(&input[offset..], depth + 1)? {
            Some((frame, used)) => {
                items.push(frame);
                offset += used;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((items, offset)))
}
