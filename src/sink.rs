//! Delivery of notifications to connected clients.
//!
//! The dispatcher hands each notification to a [`ResultSink`]. The
//! [`ChannelSink`] implementation keeps one bounded channel per connection;
//! the connection side drains it through a [`ConnectionHandle`].

use crate::subscriptions::{AttributeSelection, SubscriptionKey};
use crate::types::{Attribute, ConnectionId, Csn, Entry, MessageId};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Client update control attached to every entry notification.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryUpdate {
    pub state_update: bool,
    /// The entry was deleted or left the search scope.
    pub entry_deleted: bool,
    /// Resumption cookie, sent every `interval` notifications.
    pub cookie: Option<Csn>,
    pub critical: bool,
}

/// Result of handing a notification to the sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    /// Dropped without harm to the connection.
    NotSent,
    /// The connection is gone; the subscription cannot continue.
    ConnectionGone,
}

/// A message queued for a connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A changed entry with its update control.
    Entry {
        msg_id: MessageId,
        dn: String,
        attributes: Vec<Attribute>,
        control: EntryUpdate,
    },
    /// A search continuation reference.
    Reference { msg_id: MessageId, urls: Vec<String> },
}

impl Notification {
    pub fn msg_id(&self) -> MessageId {
        match self {
            Notification::Entry { msg_id, .. } | Notification::Reference { msg_id, .. } => *msg_id,
        }
    }
}

/// Wire delivery collaborator.
pub trait ResultSink: Send + Sync {
    /// Send an entry with the selected attributes and its update control.
    fn send_entry(
        &self,
        target: SubscriptionKey,
        entry: &Entry,
        attrs: &AttributeSelection,
        attrs_only: bool,
        control: &EntryUpdate,
    ) -> SendStatus;

    /// Send a search continuation reference.
    fn send_reference(&self, target: SubscriptionKey, entry: &Entry, urls: &[String]) -> SendStatus;
}

/// Receiving side of one connection.
pub struct ConnectionHandle {
    pub conn: ConnectionId,
    pub receiver: Receiver<Notification>,
}

impl ConnectionHandle {
    /// Receive the next notification (blocking).
    pub fn recv(&self) -> Result<Notification, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a notification (non-blocking).
    pub fn try_recv(&self) -> Result<Notification, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Notification, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything queued right now.
    pub fn drain(&self) -> Vec<Notification> {
        self.receiver.try_iter().collect()
    }
}

/// Sink backed by per-connection bounded channels.
pub struct ChannelSink {
    connections: RwLock<HashMap<ConnectionId, Sender<Notification>>>,
    buffer_size: usize,
}

impl ChannelSink {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            buffer_size,
        }
    }

    /// Open a channel for `conn`, replacing any previous one.
    pub fn connect(&self, conn: ConnectionId) -> ConnectionHandle {
        let (sender, receiver) = bounded(self.buffer_size);
        self.connections.write().insert(conn, sender);
        ConnectionHandle { conn, receiver }
    }

    pub fn disconnect(&self, conn: ConnectionId) -> bool {
        self.connections.write().remove(&conn).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    fn deliver(&self, conn: ConnectionId, notification: Notification) -> SendStatus {
        let connections = self.connections.read();
        let Some(sender) = connections.get(&conn) else {
            debug!(%conn, "No channel for connection");
            return SendStatus::ConnectionGone;
        };
        match sender.try_send(notification) {
            Ok(()) => SendStatus::Sent,
            Err(TrySendError::Full(_)) => {
                warn!(%conn, buffer = self.buffer_size, "Notification buffer full, dropping");
                SendStatus::NotSent
            }
            Err(TrySendError::Disconnected(_)) => SendStatus::ConnectionGone,
        }
    }
}

impl Default for ChannelSink {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl ResultSink for ChannelSink {
    fn send_entry(
        &self,
        target: SubscriptionKey,
        entry: &Entry,
        attrs: &AttributeSelection,
        attrs_only: bool,
        control: &EntryUpdate,
    ) -> SendStatus {
        let notification = Notification::Entry {
            msg_id: target.msg_id,
            dn: entry.dn.raw().to_string(),
            attributes: attrs.project(entry, attrs_only),
            control: control.clone(),
        };
        self.deliver(target.conn, notification)
    }

    fn send_reference(&self, target: SubscriptionKey, _entry: &Entry, urls: &[String]) -> SendStatus {
        let notification = Notification::Reference {
            msg_id: target.msg_id,
            urls: urls.to_vec(),
        };
        self.deliver(target.conn, notification)
    }
}
