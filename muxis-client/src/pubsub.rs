//! Publish/subscribe routing.
//!
//! A subscribed connection receives server-initiated messages interleaved
//! with command replies. The read loop hands every message event to the
//! [`Multiplexer`], which fans it out to the unbounded queue of each
//! [`Subscription`] registered for the channel or pattern.

use crate::dispatcher::Dispatcher;
use crate::error::ClientError;
use bytes::Bytes;
use dashmap::DashMap;
use muxis_protocol::Frame;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// A message delivered to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    pub payload: Bytes,
}

impl PublishedMessage {
    /// Returns the payload as UTF-8, if it is.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Parses a `message`, `smessage` or `pmessage` event.
    pub(crate) fn from_frame(frame: &Frame) -> Option<Self> {
        let items = match frame {
            Frame::Push(items) | Frame::Array(items) => items,
            _ => return None,
        };
        let kind = items.first()?.as_text()?;
        match (kind, items.len()) {
            ("message" | "smessage", 3) => Some(Self {
                channel: items[1].as_text()?.to_string(),
                pattern: None,
                payload: payload_bytes(&items[2])?,
            }),
            ("pmessage", 4) => Some(Self {
                channel: items[2].as_text()?.to_string(),
                pattern: Some(items[1].as_text()?.to_string()),
                payload: payload_bytes(&items[3])?,
            }),
            _ => None,
        }
    }
}

fn payload_bytes(frame: &Frame) -> Option<Bytes> {
    match frame {
        Frame::Bulk(b) => Some(b.clone()),
        Frame::Simple(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
        Frame::Verbatim { text, .. } => Some(text.clone()),
        _ => None,
    }
}

/// Returns the confirmation kind and remaining subscription count of a
/// `subscribe`/`unsubscribe`/`psubscribe`/`punsubscribe` frame.
pub(crate) fn confirmation(frame: &Frame) -> Option<(&str, i64)> {
    let items = match frame {
        Frame::Push(items) | Frame::Array(items) if items.len() == 3 => items,
        _ => return None,
    };
    let kind = items[0].as_text()?;
    let count = match items[2] {
        Frame::Integer(n) => n,
        _ => return None,
    };
    match kind {
        "subscribe" | "unsubscribe" | "psubscribe" | "punsubscribe" | "ssubscribe"
        | "sunsubscribe" => Some((kind, count)),
        _ => None,
    }
}

/// Channel or pattern subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Channel,
    Pattern,
}

impl SubscriptionKind {
    pub(crate) fn subscribe_command(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "SUBSCRIBE",
            SubscriptionKind::Pattern => "PSUBSCRIBE",
        }
    }

    pub(crate) fn unsubscribe_command(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "UNSUBSCRIBE",
            SubscriptionKind::Pattern => "PUNSUBSCRIBE",
        }
    }
}

struct Route {
    id: u64,
    tx: mpsc::UnboundedSender<PublishedMessage>,
}

/// Routing table from channel and pattern names to subscription queues.
pub(crate) struct Multiplexer {
    channels: DashMap<String, Vec<Route>>,
    patterns: DashMap<String, Vec<Route>>,
    next_id: AtomicU64,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            patterns: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn table(&self, kind: SubscriptionKind) -> &DashMap<String, Vec<Route>> {
        match kind {
            SubscriptionKind::Channel => &self.channels,
            SubscriptionKind::Pattern => &self.patterns,
        }
    }

    /// Registers one queue under every name. Returns the route id.
    pub fn register(
        &self,
        kind: SubscriptionKind,
        names: &[String],
        tx: mpsc::UnboundedSender<PublishedMessage>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let table = self.table(kind);
        for name in names {
            table.entry(name.clone()).or_default().push(Route {
                id,
                tx: tx.clone(),
            });
        }
        id
    }

    /// Removes route `id` from `names`. Returns the names nobody else
    /// listens on any more.
    pub fn remove(&self, kind: SubscriptionKind, id: u64, names: &[String]) -> Vec<String> {
        let table = self.table(kind);
        let mut orphaned = Vec::new();
        for name in names {
            let emptied = match table.get_mut(name) {
                Some(mut routes) => {
                    routes.retain(|r| r.id != id);
                    routes.is_empty()
                }
                None => false,
            };
            if emptied && table.remove_if(name, |_, routes| routes.is_empty()).is_some() {
                orphaned.push(name.clone());
            }
        }
        orphaned
    }

    /// Queues a message on every matching route.
    pub fn deliver(&self, message: PublishedMessage) {
        let routes = match message.pattern {
            Some(ref pattern) => self.patterns.get(pattern),
            None => self.channels.get(&message.channel),
        };
        match routes {
            Some(routes) => {
                for route in routes.iter() {
                    let _ = route.tx.send(message.clone());
                }
            }
            None => {
                tracing::debug!("Dropping message for unrouted channel {}", message.channel);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }

    /// Drops every route, closing all subscription queues.
    pub fn close_all(&self) {
        self.channels.clear();
        self.patterns.clear();
    }
}

/// A handle receiving messages for a set of channels or patterns.
///
/// Messages are pulled with [`next`](Subscription::next). Dropping the
/// handle unsubscribes in the background.
pub struct Subscription {
    dispatcher: Dispatcher,
    id: u64,
    kind: SubscriptionKind,
    names: Vec<String>,
    rx: mpsc::UnboundedReceiver<PublishedMessage>,
    active: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("names", &self.names)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub(crate) fn new(
        dispatcher: Dispatcher,
        id: u64,
        kind: SubscriptionKind,
        names: Vec<String>,
        rx: mpsc::UnboundedReceiver<PublishedMessage>,
    ) -> Self {
        Self {
            dispatcher,
            id,
            kind,
            names,
            rx,
            active: true,
        }
    }

    /// Waits for the next message. Returns `None` once the connection is lost.
    pub async fn next(&mut self) -> Option<PublishedMessage> {
        if !self.active {
            return None;
        }
        self.rx.recv().await
    }

    /// Returns a message if one is already queued.
    pub fn try_next(&mut self) -> Option<PublishedMessage> {
        self.rx.try_recv().ok()
    }

    /// Channel names or patterns this handle listens on.
    pub fn channels(&self) -> &[String] {
        &self.names
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    /// Stops receiving. Names no other handle uses are unsubscribed on the
    /// server; anything still queued is discarded.
    pub async fn unsubscribe(mut self) -> Result<(), ClientError> {
        self.active = false;
        self.rx.close();
        while self.rx.try_recv().is_ok() {}

        if self.dispatcher.is_broken() {
            return Ok(());
        }
        self.dispatcher
            .unsubscribe(self.kind, self.id, &self.names)
            .await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.active || self.dispatcher.is_broken() {
            return;
        }

        let dispatcher = self.dispatcher.clone();
        let (kind, id) = (self.kind, self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let names = std::mem::take(&mut self.names);
                handle.spawn(async move {
                    if let Err(e) = dispatcher.unsubscribe(kind, id, &names).await {
                        tracing::debug!("Background unsubscribe failed: {}", e);
                    }
                });
            }
            Err(_) => {
                let orphaned = dispatcher.multiplexer().remove(kind, id, &self.names);
                if !orphaned.is_empty() {
                    dispatcher.break_connection("subscription dropped outside a runtime");
                }
            }
        }
    }
}
