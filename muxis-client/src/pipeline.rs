//! Command pipelines.

use crate::dispatcher::Dispatcher;
use crate::error::ClientError;
use crate::transaction::TxOutcome;
use muxis_protocol::{Command, ServerError, Value};

/// A batch of commands written in one block.
///
/// Replies come back in order; a rejected command fails only its own entry.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a command.
    pub fn add(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Sends every command and collects the replies.
    pub async fn execute(
        self,
        dispatcher: &Dispatcher,
    ) -> Result<Vec<Result<Value, ServerError>>, ClientError> {
        dispatcher.submit_batch(self.commands).await
    }

    /// Runs the same commands atomically inside `MULTI`/`EXEC`.
    pub async fn into_transaction(self, dispatcher: &Dispatcher) -> Result<TxOutcome, ClientError> {
        let mut tx = dispatcher.begin().await?;
        for command in self.commands {
            tx.queue(command);
        }
        tx.commit().await
    }
}

impl FromIterator<Command> for Pipeline {
    fn from_iter<I: IntoIterator<Item = Command>>(iter: I) -> Self {
        Self {
            commands: iter.into_iter().collect(),
        }
    }
}

impl Extend<Command> for Pipeline {
    fn extend<I: IntoIterator<Item = Command>>(&mut self, iter: I) {
        self.commands.extend(iter);
    }
}
