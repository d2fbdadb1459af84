//! Connection pool.
//!
//! The pool is the supervisor of its dispatchers: a broken dispatcher is
//! never repaired, it is replaced by a fresh connection the next time its
//! slot is handed out.

use crate::connection::ConnectionConfig;
use crate::dispatcher::Dispatcher;
use crate::error::ClientError;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// A fixed number of lazily opened, multiplexed connections.
pub struct Pool {
    config: ConnectionConfig,
    slots: Vec<Mutex<Option<Dispatcher>>>,
    next: AtomicUsize,
}

impl Pool {
    /// Creates a pool with `config.pool_size` slots. No connection is opened
    /// until [`get`](Pool::get).
    pub fn new(config: ConnectionConfig) -> Self {
        let size = config.pool_size.max(1);
        Self {
            slots: (0..size).map(|_| Mutex::new(None)).collect(),
            next: AtomicUsize::new(0),
            config,
        }
    }

    /// Returns a healthy dispatcher, round-robin across slots.
    pub async fn get(&self) -> Result<Dispatcher, ClientError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let mut slot = self.slots[index].lock().await;

        if let Some(ref dispatcher) = *slot {
            if !dispatcher.is_broken() {
                return Ok(dispatcher.clone());
            }
            tracing::info!("Replacing broken connection in pool slot {}", index);
        }

        let dispatcher = Dispatcher::connect(self.config.clone()).await?;
        tracing::info!(
            "Pool slot {} connected to {}",
            index,
            self.config.endpoint
        );
        *slot = Some(dispatcher.clone());
        Ok(dispatcher)
    }

    /// Number of slots.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently holding a healthy connection.
    pub async fn live_connections(&self) -> usize {
        let mut live = 0;
        for slot in &self.slots {
            if matches!(*slot.lock().await, Some(ref d) if !d.is_broken()) {
                live += 1;
            }
        }
        live
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Closes every open connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        for slot in &self.slots {
            if let Some(dispatcher) = slot.lock().await.take() {
                dispatcher.close().await?;
            }
        }
        Ok(())
    }
}
