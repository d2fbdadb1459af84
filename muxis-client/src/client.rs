//! High-level client API.

use crate::connection::ConnectionConfig;
use crate::dispatcher::Dispatcher;
use crate::error::ClientError;
use crate::pipeline::Pipeline;
use crate::pool::Pool;
use crate::pubsub::Subscription;
use crate::transaction::Transaction;
use muxis_protocol::{Arg, Command, ServerError, Value};
use std::time::Duration;

/// Pool-backed client.
pub struct Client {
    pool: Pool,
}

impl Client {
    /// Creates a client and opens its first connection.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let client = Self {
            pool: Pool::new(config),
        };
        client.pool.get().await?;
        Ok(client)
    }

    /// Returns a dispatcher from the pool.
    pub async fn dispatcher(&self) -> Result<Dispatcher, ClientError> {
        self.pool.get().await
    }

    pub fn config(&self) -> &ConnectionConfig {
        self.pool.config()
    }

    /// Closes every pooled connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.pool.close().await
    }

    // =========================================================================
    // Generic entry points
    // =========================================================================

    /// Runs any command.
    pub async fn command(&self, command: Command) -> Result<Value, ClientError> {
        self.pool.get().await?.submit(command).await
    }

    /// Starts an empty pipeline.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new()
    }

    /// Runs a pipeline on one pooled connection.
    pub async fn execute(
        &self,
        pipeline: Pipeline,
    ) -> Result<Vec<Result<Value, ServerError>>, ClientError> {
        let dispatcher = self.pool.get().await?;
        pipeline.execute(&dispatcher).await
    }

    /// Starts a transaction on one pooled connection.
    pub async fn transaction(&self) -> Result<Transaction, ClientError> {
        self.pool.get().await?.begin().await
    }

    // =========================================================================
    // Pub/sub
    // =========================================================================

    /// Subscribes on a dedicated connection.
    pub async fn subscribe<I, S>(&self, channels: I) -> Result<Subscription, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let dispatcher = Dispatcher::connect(self.config().clone()).await?;
        dispatcher.subscribe(channels).await
    }

    /// Pattern-subscribes on a dedicated connection.
    pub async fn psubscribe<I, S>(&self, patterns: I) -> Result<Subscription, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let dispatcher = Dispatcher::connect(self.config().clone()).await?;
        dispatcher.psubscribe(patterns).await
    }

    /// Publishes a message. Returns the number of receivers.
    pub async fn publish(
        &self,
        channel: &str,
        message: impl Into<Arg>,
    ) -> Result<i64, ClientError> {
        let reply = self
            .command(Command::new("PUBLISH").arg(channel).arg(message))
            .await?;
        expect_int(reply)
    }

    // =========================================================================
    // Typed helpers
    // =========================================================================

    /// Pings the server.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.command(Command::new("PING")).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
        let reply = self.command(Command::new("GET").arg(key)).await?;
        Ok(reply.into_bytes().map(|b| b.to_vec()))
    }

    pub async fn set(&self, key: &str, value: impl Into<Arg>) -> Result<(), ClientError> {
        self.command(Command::new("SET").arg(key).arg(value)).await?;
        Ok(())
    }

    /// Sets `key` with an expiry.
    pub async fn set_ex(
        &self,
        key: &str,
        value: impl Into<Arg>,
        ttl: Duration,
    ) -> Result<(), ClientError> {
        let millis = ttl.as_millis().max(1) as i64;
        self.command(Command::new("SET").arg(key).arg(value).arg("PX").arg(millis))
            .await?;
        Ok(())
    }

    /// Deletes keys. Returns how many existed.
    pub async fn del(&self, keys: &[&str]) -> Result<i64, ClientError> {
        let reply = self
            .command(Command::new("DEL").args(keys.iter().copied()))
            .await?;
        expect_int(reply)
    }

    pub async fn incr(&self, key: &str) -> Result<i64, ClientError> {
        let reply = self.command(Command::new("INCR").arg(key)).await?;
        expect_int(reply)
    }
}

fn expect_int(value: Value) -> Result<i64, ClientError> {
    value.as_int().ok_or_else(|| {
        ClientError::Protocol(muxis_protocol::ProtocolError::UnexpectedFrame(format!(
            "expected integer reply, got {:?}",
            value
        )))
    })
}
