//! Commands: a name plus an ordered list of heterogeneous arguments.
//!
//! The core never interprets command names. Any name and argument list is
//! framed the same way, as a RESP array of bulk strings:
//!
//! ```text
//! *3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// A single command argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Str(String),
    Int(i64),
    Float(f64),
    Bytes(Bytes),
}

impl Arg {
    /// Writes the argument as a bulk string.
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Arg::Str(s) => put_bulk(buf, s.as_bytes()),
            Arg::Bytes(b) => put_bulk(buf, b),
            Arg::Int(i) => put_bulk(buf, i.to_string().as_bytes()),
            Arg::Float(f) => put_bulk(buf, format_float(*f).as_bytes()),
        }
    }
}

/// Formats a float the way the server parses it back.
fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        (if f > 0.0 { "inf" } else { "-inf" }).to_string()
    } else {
        f.to_string()
    }
}

fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u8(b'$');
    buf.put_slice(data.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(s)
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Arg::Str(s.clone())
    }
}

impl From<i64> for Arg {
    fn from(i: i64) -> Self {
        Arg::Int(i)
    }
}

impl From<i32> for Arg {
    fn from(i: i32) -> Self {
        Arg::Int(i as i64)
    }
}

impl From<u32> for Arg {
    fn from(i: u32) -> Self {
        Arg::Int(i as i64)
    }
}

impl From<usize> for Arg {
    fn from(i: usize) -> Self {
        Arg::Int(i as i64)
    }
}

impl From<f64> for Arg {
    fn from(f: f64) -> Self {
        Arg::Float(f)
    }
}

impl From<f32> for Arg {
    fn from(f: f32) -> Self {
        Arg::Float(f as f64)
    }
}

impl From<Bytes> for Arg {
    fn from(b: Bytes) -> Self {
        Arg::Bytes(b)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(b: Vec<u8>) -> Self {
        Arg::Bytes(Bytes::from(b))
    }
}

impl From<&[u8]> for Arg {
    fn from(b: &[u8]) -> Self {
        Arg::Bytes(Bytes::copy_from_slice(b))
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Str(s) => write!(f, "{}", s),
            Arg::Int(i) => write!(f, "{}", i),
            Arg::Float(x) => f.write_str(&format_float(*x)),
            Arg::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

/// A named remote command. Built once, then only read.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    name: String,
    args: Vec<Arg>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends every argument from an iterator.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[Arg] {
        &self.args
    }

    /// Returns whether this command's name matches `name`, ignoring case.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Appends the wire form of this command to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(b'*');
        buf.put_slice((self.args.len() + 1).to_string().as_bytes());
        buf.put_slice(b"\r\n");
        put_bulk(buf, self.name.as_bytes());
        for arg in &self.args {
            arg.encode(buf);
        }
    }

    /// Returns the wire form of this command.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32 + self.args.len() * 16);
        self.encode(&mut buf);
        buf.freeze()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_set() {
        let cmd = Command::new("SET").arg("key").arg("value");
        assert_eq!(
            &cmd.to_bytes()[..],
            b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n"
        );
    }

    #[test]
    fn test_encode_no_args() {
        let cmd = Command::new("PING");
        assert_eq!(&cmd.to_bytes()[..], b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn test_encode_mixed_args() {
        let cmd = Command::new("ZADD")
            .arg("scores")
            .arg(1.5)
            .arg(-42i64)
            .arg(Bytes::from_static(b"\x00\xff"));
        let encoded = cmd.to_bytes();
        assert_eq!(
            &encoded[..],
            &b"*5\r\n$4\r\nZADD\r\n$6\r\nscores\r\n$3\r\n1.5\r\n$3\r\n-42\r\n$2\r\n\x00\xff\r\n"[..]
        );
    }

    #[test]
    fn test_float_formatting() {
        assert_eq!(format_float(f64::INFINITY), "inf");
        assert_eq!(format_float(f64::NEG_INFINITY), "-inf");
        assert_eq!(format_float(f64::NAN), "nan");
        assert_eq!(format_float(0.1), "0.1");
        assert_eq!(format_float(3.0), "3");
    }

    #[test]
    fn test_args_from_iterator() {
        let cmd = Command::new("DEL").args(["a", "b", "c"]);
        assert_eq!(cmd.arguments().len(), 3);
        assert_eq!(cmd.to_string(), "DEL a b c");
    }

    #[test]
    fn test_binary_payload_length_counts_bytes() {
        let cmd = Command::new("SET").arg("k").arg("héllo");
        let encoded = cmd.to_bytes();
        // "héllo" is six bytes in UTF-8
        assert!(encoded.windows(4).any(|w| w == b"$6\r\n"));
    }

    #[test]
    fn test_is_case_insensitive() {
        let cmd = Command::new("subscribe").arg("news");
        assert!(cmd.is("SUBSCRIBE"));
        assert!(!cmd.is("PSUBSCRIBE"));
    }
}
