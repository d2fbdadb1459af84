//! Transactions (`MULTI` / `EXEC`).
//!
//! A [`Transaction`] holds the connection's write lock from
//! [`Dispatcher::begin`] until it is committed, discarded or dropped, so no
//! other caller's command can land between its `MULTI` and `EXEC`.

use crate::connection::WriteGuard;
use crate::dispatcher::{Dispatcher, PendingKind, Slot};
use crate::error::ClientError;
use muxis_protocol::{Command, Encoder, Frame, ProtocolError, ServerError, Value};

/// Provisional acknowledgement of a staged command. The command's actual
/// result only arrives with the commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Queued,
}

/// Result of committing a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TxOutcome {
    /// Every queued command ran; one result per command, in order.
    Committed(Vec<Result<Value, ServerError>>),
    /// A watched key changed; nothing ran.
    Aborted,
}

impl TxOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TxOutcome::Committed(_))
    }

    /// Returns the per-command results, or `None` if aborted.
    pub fn into_results(self) -> Option<Vec<Result<Value, ServerError>>> {
        match self {
            TxOutcome::Committed(results) => Some(results),
            TxOutcome::Aborted => None,
        }
    }
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Queuing,
    Committing,
    Discarding,
    Committed,
    Aborted,
}

/// An open transaction.
pub struct Transaction {
    dispatcher: Dispatcher,
    guard: Option<WriteGuard>,
    /// Commands buffered locally, written with the next stage or the commit.
    queued: Vec<Command>,
    /// `MULTI` is on the wire and not yet ended by `EXEC`/`DISCARD`.
    multi_sent: bool,
    /// `WATCH` is on the wire and not yet cleared.
    watched: bool,
    staged: usize,
    state: TxState,
}

impl Transaction {
    pub(crate) fn new(dispatcher: Dispatcher, guard: WriteGuard) -> Self {
        tracing::debug!("Transaction started");
        Self {
            dispatcher,
            guard: Some(guard),
            queued: Vec::new(),
            multi_sent: false,
            watched: false,
            staged: 0,
            state: TxState::Queuing,
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Number of commands queued or staged so far.
    pub fn len(&self) -> usize {
        self.staged + self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes the commit conditional on `keys` being unchanged until `EXEC`.
    /// Must come before any command is staged.
    pub async fn watch<I, K>(&mut self, keys: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = K>,
        K: Into<muxis_protocol::Arg>,
    {
        if self.multi_sent {
            return Err(ClientError::TransactionState(
                "WATCH is not allowed after staging",
            ));
        }

        let slot = self.write_one(Command::new("WATCH").args(keys)).await?;
        self.watched = true;
        match self.dispatcher.await_frame(slot).await? {
            Frame::Error(line) => Err(ClientError::Command(ServerError::parse(line))),
            _ => Ok(()),
        }
    }

    /// Buffers `command`. Nothing is transmitted until the next stage or the
    /// commit.
    pub fn queue(&mut self, command: Command) {
        self.queued.push(command);
    }

    /// Transmits `command` into the open transaction now (together with
    /// anything queued before it) and waits for the server's acknowledgement.
    pub async fn stage(&mut self, command: Command) -> Result<Ack, ClientError> {
        let mut block = Vec::with_capacity(self.queued.len() + 2);
        if !self.multi_sent {
            block.push(Command::new("MULTI"));
        }
        block.append(&mut self.queued);
        block.push(command);
        let count = block.len() - usize::from(!self.multi_sent);

        let slots = self.write(&block).await?;
        self.multi_sent = true;
        self.staged += count;

        let mut rejected = None;
        for slot in slots {
            if let Frame::Error(line) = self.dispatcher.await_frame(slot).await? {
                rejected.get_or_insert_with(|| ServerError::parse(line));
            }
        }
        match rejected {
            Some(err) => Err(ClientError::Command(err)),
            None => Ok(Ack::Queued),
        }
    }

    /// Executes the transaction.
    ///
    /// Returns [`TxOutcome::Aborted`] if a watched key changed. If the server
    /// refused the transaction outright (a queued command was rejected), the
    /// `EXECABORT` error is returned.
    pub async fn commit(mut self) -> Result<TxOutcome, ClientError> {
        let mut block = Vec::with_capacity(self.queued.len() + 2);
        if !self.multi_sent {
            block.push(Command::new("MULTI"));
        }
        block.append(&mut self.queued);
        block.push(Command::new("EXEC"));

        self.state = TxState::Committing;
        let mut slots = self.write(&block).await?;
        self.multi_sent = false;
        self.watched = false;

        let exec = slots
            .pop()
            .ok_or_else(|| ClientError::TransactionState("empty commit block"))?;
        for slot in slots {
            // individual rejections surface as EXECABORT on EXEC
            self.dispatcher.await_frame(slot).await?;
        }

        let outcome = match self.dispatcher.await_frame(exec).await? {
            Frame::Null => TxOutcome::Aborted,
            Frame::Array(items) => {
                TxOutcome::Committed(items.into_iter().map(Frame::into_value).collect())
            }
            Frame::Error(line) => {
                self.state = TxState::Aborted;
                return Err(ClientError::Command(ServerError::parse(line)));
            }
            other => {
                return Err(ClientError::Protocol(ProtocolError::UnexpectedFrame(
                    other.kind().to_string(),
                )))
            }
        };

        self.state = match outcome {
            TxOutcome::Committed(_) => TxState::Committed,
            TxOutcome::Aborted => TxState::Aborted,
        };
        self.guard = None;
        tracing::debug!("Transaction finished: {:?}", self.state);
        Ok(outcome)
    }

    /// Abandons the transaction. Transmits `DISCARD` if anything was staged,
    /// `UNWATCH` if only keys were watched, and nothing otherwise.
    pub async fn discard(mut self) -> Result<(), ClientError> {
        self.state = TxState::Discarding;
        self.queued.clear();

        if let Some(command) = self.cleanup_command() {
            let slot = self.write_one(command).await?;
            self.multi_sent = false;
            self.watched = false;
            if let Frame::Error(line) = self.dispatcher.await_frame(slot).await? {
                return Err(ClientError::Command(ServerError::parse(line)));
            }
        }

        self.guard = None;
        tracing::debug!("Transaction discarded");
        Ok(())
    }

    fn cleanup_command(&self) -> Option<Command> {
        if self.multi_sent {
            Some(Command::new("DISCARD"))
        } else if self.watched {
            Some(Command::new("UNWATCH"))
        } else {
            None
        }
    }

    async fn write(&mut self, commands: &[Command]) -> Result<Vec<Slot>, ClientError> {
        let guard = self
            .guard
            .as_mut()
            .ok_or(ClientError::TransactionState("transaction already finished"))?;
        let bytes = Encoder::encode_batch(commands);
        self.dispatcher
            .write_locked(guard, &bytes, commands.len(), PendingKind::Reply)
            .await
    }

    async fn write_one(&mut self, command: Command) -> Result<Slot, ClientError> {
        self.write(std::slice::from_ref(&command))
            .await?
            .pop()
            .ok_or(ClientError::TransactionState("no reply slot"))
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let Some(mut guard) = self.guard.take() else {
            return;
        };
        let Some(command) = self.cleanup_command() else {
            return;
        };
        if self.dispatcher.is_broken() {
            return;
        }

        tracing::warn!(
            "Transaction dropped while open, sending {}",
            command.name()
        );
        let dispatcher = self.dispatcher.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let bytes = Encoder::encode_command(&command);
                    let written = dispatcher
                        .write_locked(&mut guard, &bytes, 1, PendingKind::Reply)
                        .await;
                    drop(guard);
                    match written {
                        Ok(mut slots) => {
                            if let Some(slot) = slots.pop() {
                                let _ = dispatcher.await_frame(slot).await;
                            }
                        }
                        Err(e) => tracing::debug!("Cleanup of dropped transaction failed: {}", e),
                    }
                });
            }
            Err(_) => dispatcher.break_connection("transaction dropped outside a runtime"),
        }
    }
}
