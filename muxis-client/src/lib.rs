//! # muxis-client
//!
//! Multiplexed async client for RESP servers.
//!
//! This crate provides:
//! - One connection shared by many tasks, with replies matched strictly in
//!   wire order ([`Dispatcher`])
//! - Pipelines and `MULTI`/`EXEC` transactions that hold the write path
//!   exclusively
//! - Pub/sub subscriptions with pull-based message delivery
//! - A supervising connection pool and a small high-level [`Client`]
//! - TCP, TLS and Unix socket transports

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod pubsub;
pub mod stream;
pub mod tls;
pub mod transaction;

pub use client::Client;
pub use config::{ClientSettings, ConfigError, ProtocolSetting};
pub use connection::{Connection, ConnectionConfig, Endpoint, ProtocolVersion, TlsClientConfig};
pub use dispatcher::{BatchReply, Dispatcher, Reply};
pub use error::ClientError;
pub use muxis_protocol::{Command, ServerError, Value};
pub use pipeline::Pipeline;
pub use pool::Pool;
pub use pubsub::{PublishedMessage, Subscription, SubscriptionKind};
pub use transaction::{Ack, Transaction, TxOutcome, TxState};
