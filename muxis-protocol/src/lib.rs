//! # muxis-protocol
//!
//! RESP wire protocol for muxis.
//!
//! This crate provides:
//! - Command construction and request encoding (any name, any arguments)
//! - Incremental frame decoding for RESP2 and RESP3 replies
//! - Reply values and server error classification
//! - Protocol limits and constants

pub mod codec;
pub mod command;
pub mod error;
pub mod frame;
pub mod value;

pub use codec::{Decoder, Encoder};
pub use command::{Arg, Command};
pub use error::{ErrorCode, ProtocolError, ServerError};
pub use frame::Frame;
pub use value::Value;

/// Default port for RESP servers.
pub const DEFAULT_PORT: u16 = 6379;

/// Maximum bulk string length (512 MiB).
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Maximum number of elements in one aggregate frame.
pub const MAX_AGGREGATE_LEN: usize = 1 << 24;

/// Maximum nesting depth of aggregate frames.
pub const MAX_DEPTH: usize = 64;
