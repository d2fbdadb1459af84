//! Protocol error types and server error codes.

use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur while framing or parsing the stream.
///
/// Every variant is fatal to the connection that produced it: once the byte
/// stream cannot be parsed there is no way to find the next frame boundary.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame type byte: {0:#04x}")]
    InvalidTypeByte(u8),

    #[error("invalid integer: {0:?}")]
    InvalidInteger(String),

    #[error("invalid double: {0:?}")]
    InvalidDouble(String),

    #[error("invalid length: {0}")]
    InvalidLength(i64),

    #[error("bulk too large: {size} bytes (max {max})")]
    BulkTooLarge { size: usize, max: usize },

    #[error("aggregate too large: {len} elements (max {max})")]
    AggregateTooLarge { len: usize, max: usize },

    #[error("frame nesting exceeds {0} levels")]
    NestingTooDeep(usize),

    #[error("missing CRLF terminator")]
    MissingCrlf,

    #[error("invalid UTF-8 in simple frame")]
    InvalidUtf8,

    #[error("truncated frame: {buffered} bytes buffered when the read deadline passed")]
    Truncated { buffered: usize },

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error class reported by the server, taken from the leading word of an
/// error reply (`-WRONGTYPE Operation against ...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Err,
    WrongType,
    ExecAbort,
    NoScript,
    Busy,
    Loading,
    TryAgain,
    NoAuth,
    WrongPass,
    NoPerm,
    ReadOnly,
    Moved,
    Ask,
    ClusterDown,
    MasterDown,
    Other,
}

impl ErrorCode {
    /// Maps the leading word of an error line to a code.
    pub fn from_prefix(prefix: &str) -> Self {
        match prefix {
            "ERR" => ErrorCode::Err,
            "WRONGTYPE" => ErrorCode::WrongType,
            "EXECABORT" => ErrorCode::ExecAbort,
            "NOSCRIPT" => ErrorCode::NoScript,
            "BUSY" => ErrorCode::Busy,
            "LOADING" => ErrorCode::Loading,
            "TRYAGAIN" => ErrorCode::TryAgain,
            "NOAUTH" => ErrorCode::NoAuth,
            "WRONGPASS" => ErrorCode::WrongPass,
            "NOPERM" => ErrorCode::NoPerm,
            "READONLY" => ErrorCode::ReadOnly,
            "MOVED" => ErrorCode::Moved,
            "ASK" => ErrorCode::Ask,
            "CLUSTERDOWN" => ErrorCode::ClusterDown,
            "MASTERDOWN" => ErrorCode::MasterDown,
            _ => ErrorCode::Other,
        }
    }

    /// Returns whether the server signalled a transient condition.
    ///
    /// Advisory only: the client core never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Busy
                | ErrorCode::Loading
                | ErrorCode::TryAgain
                | ErrorCode::ClusterDown
                | ErrorCode::MasterDown
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Err => "ERR",
            ErrorCode::WrongType => "WRONGTYPE",
            ErrorCode::ExecAbort => "EXECABORT",
            ErrorCode::NoScript => "NOSCRIPT",
            ErrorCode::Busy => "BUSY",
            ErrorCode::Loading => "LOADING",
            ErrorCode::TryAgain => "TRYAGAIN",
            ErrorCode::NoAuth => "NOAUTH",
            ErrorCode::WrongPass => "WRONGPASS",
            ErrorCode::NoPerm => "NOPERM",
            ErrorCode::ReadOnly => "READONLY",
            ErrorCode::Moved => "MOVED",
            ErrorCode::Ask => "ASK",
            ErrorCode::ClusterDown => "CLUSTERDOWN",
            ErrorCode::MasterDown => "MASTERDOWN",
            ErrorCode::Other => "OTHER",
        };
        f.write_str(s)
    }
}

/// A per-command failure reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ServerError {
    /// Error class.
    pub code: ErrorCode,
    /// Full error line as sent by the server (without the type byte).
    pub message: String,
}

impl ServerError {
    /// Parses an error line such as `WRONGTYPE Operation against a key`.
    pub fn parse(line: impl Into<String>) -> Self {
        let message = line.into();
        let prefix = message.split_whitespace().next().unwrap_or("");
        Self {
            code: ErrorCode::from_prefix(prefix),
            message,
        }
    }

    /// Returns the message without its leading error class, when one is known.
    pub fn detail(&self) -> &str {
        if self.code == ErrorCode::Other {
            return &self.message;
        }
        self.message
            .split_once(' ')
            .map(|(_, rest)| rest)
            .unwrap_or("")
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}
