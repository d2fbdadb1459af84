//! Request multiplexing over a single connection.
//!
//! Many tasks share one [`Dispatcher`]. Each request is written under the
//! connection's write lock and, in the same critical section, an entry is
//! appended to the pending queue, so queue order always equals wire order.
//! One background read loop decodes replies and completes the queue head.

use crate::connection::{Connection, ConnectionConfig, WriteGuard};
use crate::error::ClientError;
use crate::pubsub::{self, Multiplexer, PublishedMessage, Subscription, SubscriptionKind};
use crate::stream::ClientStream;
use crate::transaction::Transaction;
use muxis_protocol::{Command, Decoder, Encoder, Frame, ProtocolError, ServerError, Value};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

pub(crate) type Slot = oneshot::Receiver<Result<Frame, ClientError>>;

/// What the reply at this queue position answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingKind {
    /// An ordinary command reply.
    Reply,
    /// A subscribe confirmation.
    Subscribe,
    /// An unsubscribe confirmation.
    Unsubscribe,
}

struct Pending {
    kind: PendingKind,
    /// Entries written by the same call share a group.
    group: u64,
    slot: oneshot::Sender<Result<Frame, ClientError>>,
}

#[derive(Default)]
struct Queue {
    entries: VecDeque<Pending>,
    /// Why the connection stopped accepting work.
    closed: Option<String>,
    /// Push mode: set when a subscribe is written, cleared when the server
    /// confirms zero remaining subscriptions.
    subscribed: bool,
    next_group: u64,
}

struct Shared {
    conn: Connection,
    queue: parking_lot::Mutex<Queue>,
    mux: Multiplexer,
    reader: parking_lot::Mutex<Option<AbortHandle>>,
}

impl Shared {
    /// Marks the queue closed and fails everything pending. Returns false if
    /// it was already closed.
    fn close_queue(&self, reason: &str) -> bool {
        let drained = {
            let mut queue = self.queue.lock();
            if queue.closed.is_some() {
                return false;
            }
            queue.closed = Some(reason.to_string());
            queue.subscribed = false;
            std::mem::take(&mut queue.entries)
        };

        for pending in drained {
            let _ = pending
                .slot
                .send(Err(ClientError::ConnectionLost(reason.to_string())));
        }
        self.mux.close_all();

        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        true
    }

    fn break_connection(&self, reason: &str) {
        if self.close_queue(reason) {
            tracing::warn!("Connection to {} broken: {}", self.conn.config().endpoint, reason);
        }
    }

    /// Routes one decoded frame.
    fn route(&self, frame: Frame) -> Result<(), ClientError> {
        let mut queue = self.queue.lock();
        let head = queue.entries.front().map(|p| p.kind);
        let is_push = matches!(frame, Frame::Push(_));

        if is_push || head != Some(PendingKind::Reply) {
            if let Some(message) = PublishedMessage::from_frame(&frame) {
                drop(queue);
                tracing::debug!("Message on {}", message.channel);
                self.mux.deliver(message);
                return Ok(());
            }
        }

        let confirmation = pubsub::confirmation(&frame).map(|(_, count)| count);
        if is_push && confirmation.is_none() {
            tracing::debug!("Ignoring unsolicited push frame");
            return Ok(());
        }

        let pending = queue
            .entries
            .pop_front()
            .ok_or_else(|| {
                ProtocolError::UnexpectedFrame(format!("{} with no pending request", frame.kind()))
            })?;

        // a rejected (un)subscribe is answered by one error, not one
        // confirmation per name
        let mut rejected = Vec::new();
        if pending.kind != PendingKind::Reply && frame.is_error() {
            while queue
                .entries
                .front()
                .is_some_and(|p| p.group == pending.group)
            {
                rejected.extend(queue.entries.pop_front());
            }
        }

        if pending.kind == PendingKind::Unsubscribe && confirmation == Some(0) {
            let still_subscribing = queue
                .entries
                .iter()
                .any(|p| p.kind == PendingKind::Subscribe);
            if !still_subscribing && self.mux.is_empty() {
                tracing::debug!("Leaving subscribed mode");
                queue.subscribed = false;
            }
        }
        drop(queue);

        for sibling in rejected {
            let _ = sibling.slot.send(Ok(frame.clone()));
        }
        // the caller may have stopped waiting
        let _ = pending.slot.send(Ok(frame));
        Ok(())
    }
}

/// Stops the read loop once the last dispatcher handle is gone.
struct Lifetime {
    shared: Arc<Shared>,
}

impl Drop for Lifetime {
    fn drop(&mut self) {
        if self.shared.close_queue("dispatcher dropped") {
            tracing::debug!("Dispatcher for {} dropped", self.shared.conn.config().endpoint);
        }
    }
}

/// Breaks the connection if a write is abandoned half-way.
struct PoisonOnDrop<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl<'a> PoisonOnDrop<'a> {
    fn new(shared: &'a Shared) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PoisonOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.break_connection("write cancelled mid-operation");
        }
    }
}

/// A multiplexed connection handle. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    _lifetime: Arc<Lifetime>,
}

impl Dispatcher {
    /// Opens a connection and starts its read loop.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let conn = Connection::open(config).await?;
        Self::start(conn)
    }

    /// Starts the read loop on an open connection.
    pub fn start(conn: Connection) -> Result<Self, ClientError> {
        let (reader, decoder) = conn
            .take_reader()
            .ok_or_else(|| ClientError::ConnectionLost("read half already taken".to_string()))?;
        let read_timeout = conn.config().read_timeout;
        let buffer_size = conn.config().read_buffer_size;

        let shared = Arc::new(Shared {
            conn,
            queue: parking_lot::Mutex::new(Queue::default()),
            mux: Multiplexer::new(),
            reader: parking_lot::Mutex::new(None),
        });

        let task = tokio::spawn(read_loop(
            shared.clone(),
            reader,
            decoder,
            read_timeout,
            buffer_size,
        ));
        *shared.reader.lock() = Some(task.abort_handle());

        Ok(Self {
            _lifetime: Arc::new(Lifetime {
                shared: shared.clone(),
            }),
            shared,
        })
    }

    /// Writes `command` and returns a future for its reply.
    pub async fn send(&self, command: &Command) -> Reply {
        let mut guard = self.shared.conn.lock_writer().await;
        let bytes = Encoder::encode_command(command);
        match self
            .write_locked(&mut guard, &bytes, 1, PendingKind::Reply)
            .await
        {
            Ok(mut slots) => Reply::waiting(slots.remove(0)),
            Err(e) => Reply::failed(e),
        }
    }

    /// Sends `command` and waits for its reply, up to the request timeout.
    ///
    /// On timeout the request stays queued and its late reply is discarded.
    pub async fn submit(&self, command: Command) -> Result<Value, ClientError> {
        tracing::debug!("Submitting {}", command.name());
        tokio::time::timeout(self.request_timeout(), async {
            self.send(&command).await.await
        })
        .await
        .map_err(|_| ClientError::Timeout)?
    }

    /// Writes all `commands` as one contiguous block.
    pub async fn send_batch(&self, commands: &[Command]) -> BatchReply {
        if commands.is_empty() {
            return BatchReply::new(Vec::new());
        }
        let mut guard = self.shared.conn.lock_writer().await;
        let bytes = Encoder::encode_batch(commands);
        match self
            .write_locked(&mut guard, &bytes, commands.len(), PendingKind::Reply)
            .await
        {
            Ok(slots) => BatchReply::new(slots),
            Err(e) => BatchReply::failed(e),
        }
    }

    /// Sends a batch and waits for every reply. A rejected command only
    /// fails its own entry.
    pub async fn submit_batch(
        &self,
        commands: Vec<Command>,
    ) -> Result<Vec<Result<Value, ServerError>>, ClientError> {
        tracing::debug!("Submitting batch of {} commands", commands.len());
        tokio::time::timeout(self.request_timeout(), async {
            self.send_batch(&commands).await.await
        })
        .await
        .map_err(|_| ClientError::Timeout)?
    }

    /// Starts a transaction, taking exclusive use of the write path until it
    /// is committed, discarded or dropped.
    pub async fn begin(&self) -> Result<Transaction, ClientError> {
        let guard = self.shared.conn.lock_writer().await;
        {
            let queue = self.shared.queue.lock();
            if let Some(ref reason) = queue.closed {
                return Err(ClientError::ConnectionLost(reason.clone()));
            }
            if queue.subscribed {
                return Err(ClientError::SubscribedMode);
            }
        }
        Ok(Transaction::new(self.clone(), guard))
    }

    /// Subscribes to channels.
    pub async fn subscribe<I, S>(&self, channels: I) -> Result<Subscription, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribe_kind(SubscriptionKind::Channel, channels)
            .await
    }

    /// Subscribes to channel patterns.
    pub async fn psubscribe<I, S>(&self, patterns: I) -> Result<Subscription, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribe_kind(SubscriptionKind::Pattern, patterns)
            .await
    }

    async fn subscribe_kind<I, S>(
        &self,
        kind: SubscriptionKind,
        names: I,
    ) -> Result<Subscription, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(ClientError::Config(
                "at least one channel is required".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let command = Command::new(kind.subscribe_command()).args(names.iter());

        // Routes change only under the write lock, so the routing table
        // always agrees with the order of (UN)SUBSCRIBE commands on the wire.
        // They exist before the command is written, so no message after the
        // confirmation can be missed.
        let (id, written) = {
            let mut guard = self.shared.conn.lock_writer().await;
            let id = self.shared.mux.register(kind, &names, tx);
            let bytes = Encoder::encode_command(&command);
            let written = self
                .write_locked(&mut guard, &bytes, names.len(), PendingKind::Subscribe)
                .await;
            (id, written)
        };

        let result = match written {
            Ok(slots) => self.await_confirmations(slots).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::debug!("Subscribed to {} {}", names.len(), kind.subscribe_command());
                Ok(Subscription::new(self.clone(), id, kind, names, rx))
            }
            Err(e) => {
                tracing::debug!("{} failed: {}", kind.subscribe_command(), e);
                {
                    let _guard = self.shared.conn.lock_writer().await;
                    self.shared.mux.remove(kind, id, &names);
                }
                self.leave_subscribed_mode_if_idle();
                Err(e)
            }
        }
    }

    /// Drops route `id` from `names` and unsubscribes, on the server, the
    /// names no other subscription still listens on.
    pub(crate) async fn unsubscribe(
        &self,
        kind: SubscriptionKind,
        id: u64,
        names: &[String],
    ) -> Result<(), ClientError> {
        let slots = {
            let mut guard = self.shared.conn.lock_writer().await;
            let orphaned = self.shared.mux.remove(kind, id, names);
            if orphaned.is_empty() || self.is_broken() {
                return Ok(());
            }
            let command = Command::new(kind.unsubscribe_command()).args(orphaned.iter());
            let bytes = Encoder::encode_command(&command);
            self.write_locked(&mut guard, &bytes, orphaned.len(), PendingKind::Unsubscribe)
                .await?
        };
        self.await_confirmations(slots).await
    }

    async fn await_confirmations(&self, slots: Vec<Slot>) -> Result<(), ClientError> {
        for slot in slots {
            if let Frame::Error(line) = self.await_frame(slot).await? {
                return Err(ClientError::Command(ServerError::parse(line)));
            }
        }
        Ok(())
    }

    fn leave_subscribed_mode_if_idle(&self) {
        let mut queue = self.shared.queue.lock();
        let waiting = queue.entries.iter().any(|p| p.kind != PendingKind::Reply);
        if self.shared.mux.is_empty() && !waiting {
            queue.subscribed = false;
        }
    }

    /// Writes `bytes` through a held write guard and queues `count` entries of
    /// `kind` for the replies.
    pub(crate) async fn write_locked(
        &self,
        guard: &mut WriteGuard,
        bytes: &[u8],
        count: usize,
        kind: PendingKind,
    ) -> Result<Vec<Slot>, ClientError> {
        let mut slots = Vec::with_capacity(count);
        {
            let mut queue = self.shared.queue.lock();
            if let Some(ref reason) = queue.closed {
                return Err(ClientError::ConnectionLost(reason.clone()));
            }
            match kind {
                PendingKind::Reply if queue.subscribed => return Err(ClientError::SubscribedMode),
                PendingKind::Subscribe => queue.subscribed = true,
                _ => {}
            }
            let group = queue.next_group;
            queue.next_group = queue.next_group.wrapping_add(1);
            for _ in 0..count {
                let (tx, rx) = oneshot::channel();
                queue.entries.push_back(Pending {
                    kind,
                    group,
                    slot: tx,
                });
                slots.push(rx);
            }
        }

        let poison = PoisonOnDrop::new(&self.shared);
        let written = guard.write_all(bytes).await;
        poison.disarm();

        if let Err(e) = written {
            let reason = format!("write failed: {}", e);
            self.shared.break_connection(&reason);
            return Err(ClientError::ConnectionLost(reason));
        }
        Ok(slots)
    }

    /// Waits for a raw reply frame, up to the request timeout.
    pub(crate) async fn await_frame(&self, slot: Slot) -> Result<Frame, ClientError> {
        tokio::time::timeout(self.request_timeout(), receive(slot))
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    pub(crate) fn break_connection(&self, reason: &str) {
        self.shared.break_connection(reason);
    }

    pub(crate) fn multiplexer(&self) -> &Multiplexer {
        &self.shared.mux
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        self.shared.conn.config().request_timeout
    }

    /// Returns whether the connection has failed or been closed.
    pub fn is_broken(&self) -> bool {
        self.shared.queue.lock().closed.is_some()
    }

    /// Returns whether the connection is in push mode.
    pub fn is_subscribed(&self) -> bool {
        self.shared.queue.lock().subscribed
    }

    /// Number of requests written but not yet answered.
    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().entries.len()
    }

    pub fn config(&self) -> &ConnectionConfig {
        self.shared.conn.config()
    }

    /// Closes the connection. Pending requests fail with `ConnectionLost`.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.shared.conn.close().await?;
        if self.shared.close_queue("connection closed") {
            tracing::debug!("Closed connection to {}", self.shared.conn.config().endpoint);
        }
        Ok(())
    }
}

async fn receive(slot: Slot) -> Result<Frame, ClientError> {
    slot.await
        .map_err(|_| ClientError::ConnectionLost("reply channel closed".to_string()))?
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: ReadHalf<ClientStream>,
    mut decoder: Decoder,
    read_timeout: Duration,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];

    let error = 'outer: loop {
        loop {
            match decoder.decode_frame() {
                Ok(Some(frame)) => {
                    tracing::debug!("Received {} frame", frame.kind());
                    if let Err(e) = shared.route(frame) {
                        break 'outer e;
                    }
                }
                Ok(None) => break,
                Err(e) => break 'outer ClientError::Protocol(e),
            }
        }

        let read = if decoder.is_mid_frame() {
            match tokio::time::timeout(read_timeout, reader.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    break ClientError::Protocol(ProtocolError::Truncated {
                        buffered: decoder.buffered(),
                    })
                }
            }
        } else {
            reader.read(&mut buf).await
        };

        match read {
            Ok(0) if decoder.is_mid_frame() => {
                break ClientError::Protocol(ProtocolError::Truncated {
                    buffered: decoder.buffered(),
                })
            }
            Ok(0) => break ClientError::ConnectionLost("closed by peer".to_string()),
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) => break ClientError::Io(e),
        }
    };

    shared.break_connection(&error.to_string());
}

/// Future resolving to the reply of one command.
pub struct Reply {
    state: ReplyState,
}

enum ReplyState {
    Waiting(Slot),
    Failed(Option<ClientError>),
}

impl Reply {
    fn waiting(slot: Slot) -> Self {
        Self {
            state: ReplyState::Waiting(slot),
        }
    }

    fn failed(error: ClientError) -> Self {
        Self {
            state: ReplyState::Failed(Some(error)),
        }
    }
}

impl Future for Reply {
    type Output = Result<Value, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            ReplyState::Waiting(slot) => Pin::new(slot).poll(cx).map(|received| {
                match received {
                    Ok(Ok(frame)) => frame.into_value().map_err(ClientError::Command),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(ClientError::ConnectionLost(
                        "reply channel closed".to_string(),
                    )),
                }
            }),
            ReplyState::Failed(error) => Poll::Ready(Err(error.take().unwrap_or_else(|| {
                ClientError::ConnectionLost("reply already taken".to_string())
            }))),
        }
    }
}

/// Future resolving to the replies of a batch, in order.
pub struct BatchReply {
    slots: Vec<Slot>,
    results: Vec<Result<Value, ServerError>>,
    error: Option<ClientError>,
}

impl BatchReply {
    fn new(slots: Vec<Slot>) -> Self {
        Self {
            results: Vec::with_capacity(slots.len()),
            slots,
            error: None,
        }
    }

    fn failed(error: ClientError) -> Self {
        Self {
            slots: Vec::new(),
            results: Vec::new(),
            error: Some(error),
        }
    }

    /// Number of commands in the batch.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Future for BatchReply {
    type Output = Result<Vec<Result<Value, ServerError>>, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(error) = this.error.take() {
            return Poll::Ready(Err(error));
        }

        while this.results.len() < this.slots.len() {
            let next = this.results.len();
            match Pin::new(&mut this.slots[next]).poll(cx) {
                Poll::Ready(Ok(Ok(frame))) => this.results.push(frame.into_value()),
                Poll::Ready(Ok(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(Err(_)) => {
                    return Poll::Ready(Err(ClientError::ConnectionLost(
                        "reply channel closed".to_string(),
                    )))
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(std::mem::take(&mut this.results)))
    }
}
