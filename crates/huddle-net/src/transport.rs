//! Signaling transport seam.
//!
//! A transport is constructed together with the receiving half of its
//! notification channel (see [`crate::websocket::WsTransport::new`]); the
//! session task drains that receiver while the trait methods below are used
//! to open, write to and close the channel.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use huddle_shared::protocol::{ClientEvent, ServerEvent};
use huddle_shared::TransportError;

/// Notifications sent *from* the transport to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportNotification {
    /// The channel is open (first connect).
    Connected,
    /// An event pushed by the server.
    Event(ServerEvent),
    /// The channel dropped; a retry is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// The channel is open again after one or more retries.
    Reconnected,
    /// Retries are exhausted or the server refused the reconnect.
    Lost { reason: TransportError },
}

pub type NotificationSender = mpsc::UnboundedSender<TransportNotification>;
pub type NotificationReceiver = mpsc::UnboundedReceiver<TransportNotification>;

/// Unbounded: the socket task must never wait on the session, which may
/// itself be waiting on the socket task for a send acknowledgement.
pub fn notification_channel() -> (NotificationSender, NotificationReceiver) {
    mpsc::unbounded_channel()
}

/// Bidirectional, authenticated event channel to the session server.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open the channel. Resolves once the connection is established.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Hand an event to the channel. Resolves on transport-level acceptance.
    async fn send(&self, event: ClientEvent) -> Result<(), TransportError>;

    /// Close the channel. No reconnect is attempted afterwards.
    async fn close(&self);

    fn is_connected(&self) -> bool;
}
