//! In-process signaling transport for tests.
//!
//! [`ChannelTransport`] records every outbound event and lets the test push
//! server events and connection notifications into the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use huddle_shared::protocol::{ClientEvent, ServerEvent};
use huddle_shared::TransportError;

use crate::transport::{
    notification_channel, NotificationReceiver, NotificationSender, SignalingTransport,
    TransportNotification,
};

#[derive(Default)]
struct Faults {
    connect: Option<TransportError>,
    send: Option<TransportError>,
}

pub struct ChannelTransport {
    sent: Mutex<Vec<ClientEvent>>,
    faults: Mutex<Faults>,
    connected: AtomicBool,
    closed: AtomicBool,
    notif_tx: NotificationSender,
}

impl ChannelTransport {
    pub fn new() -> (Self, NotificationReceiver) {
        let (notif_tx, notif_rx) = notification_channel();
        let transport = Self {
            sent: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            notif_tx,
        };
        (transport, notif_rx)
    }

    /// Make the next `connect` calls fail with `err` until cleared.
    pub fn fail_connect(&self, err: Option<TransportError>) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.connect = err;
        }
    }

    /// Make `send` calls fail with `err` until cleared.
    pub fn fail_send(&self, err: Option<TransportError>) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.send = err;
        }
    }

    /// Deliver a server event as if it arrived on the socket.
    pub async fn push(&self, event: ServerEvent) {
        self.notify(TransportNotification::Event(event)).await;
    }

    pub async fn notify(&self, notification: TransportNotification) {
        let _ = self.notif_tx.send(notification);
    }

    pub fn sent(&self) -> Vec<ClientEvent> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Names of sent events, in order.
    pub fn sent_names(&self) -> Vec<&'static str> {
        self.sent().iter().map(ClientEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.sent().iter().filter(|e| e.name() == name).count()
    }

    pub fn clear_sent(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingTransport for ChannelTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let fault = self.faults.lock().ok().and_then(|f| f.connect.clone());
        if let Some(err) = fault {
            return Err(err);
        }
        self.connected.store(true, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, event: ClientEvent) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let fault = self.faults.lock().ok().and_then(|f| f.send.clone());
        if let Some(err) = fault {
            return Err(err);
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(event);
        }
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_shared::types::SessionId;

    #[tokio::test]
    async fn test_records_sends_after_connect() {
        let (transport, _rx) = ChannelTransport::new();
        let leave = ClientEvent::LeaveSession {
            session_id: SessionId::new("m1"),
        };

        assert_eq!(
            transport.send(leave.clone()).await,
            Err(TransportError::Disconnected)
        );

        transport.connect().await.unwrap();
        transport.send(leave).await.unwrap();
        assert_eq!(transport.sent_names(), vec!["leave-session"]);

        transport.close().await;
        assert!(transport.was_closed());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.fail_connect(Some(TransportError::Unreachable("down".into())));
        assert!(transport.connect().await.is_err());
        transport.fail_connect(None);
        transport.connect().await.unwrap();

        transport.notify(TransportNotification::Reconnected).await;
        assert_eq!(rx.recv().await, Some(TransportNotification::Reconnected));
    }
}
