//! WebSocket signaling transport built on `tokio-tungstenite`.
//!
//! The socket is driven by a dedicated tokio task. Outbound events reach it
//! through a command channel; inbound frames are decoded into
//! [`ServerEvent`]s and forwarded on the notification channel handed out by
//! [`WsTransport::new`]. Unexpected drops are retried according to the
//! configured [`Backoff`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use huddle_shared::constants::{CHANNEL_CAPACITY, DEFAULT_SIGNALING_URL};
use huddle_shared::protocol::{ClientEvent, ServerEvent};
use huddle_shared::TransportError;

use crate::backoff::Backoff;
use crate::transport::{
    notification_channel, NotificationReceiver, NotificationSender, SignalingTransport,
    TransportNotification,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection settings for [`WsTransport`].
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Full WebSocket URL, e.g. `wss://host/signaling`.
    pub url: String,
    /// Sent as `Authorization: Bearer <token>` on every (re)connect.
    pub auth_token: Option<String>,
    pub backoff: Backoff,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SIGNALING_URL.to_string(),
            auth_token: None,
            backoff: Backoff::default(),
        }
    }
}

/// Commands sent *into* the connection task.
#[derive(Debug)]
enum WsCommand {
    Send {
        frame: String,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Close,
}

enum ConnectionEnd {
    Closed,
    Dropped,
}

pub struct WsTransport {
    config: WsConfig,
    notif_tx: NotificationSender,
    cmd_tx: Mutex<Option<mpsc::Sender<WsCommand>>>,
    connected: Arc<AtomicBool>,
}

impl WsTransport {
    /// Create the transport and the receiver its notifications arrive on.
    /// Nothing is dialed until [`SignalingTransport::connect`].
    pub fn new(config: WsConfig) -> (Self, NotificationReceiver) {
        let (notif_tx, notif_rx) = notification_channel();
        let transport = Self {
            config,
            notif_tx,
            cmd_tx: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        };
        (transport, notif_rx)
    }

    fn command_sender(&self) -> Option<mpsc::Sender<WsCommand>> {
        self.cmd_tx.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait]
impl SignalingTransport for WsTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }

        let stream = open_socket(&self.config).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
        if let Ok(mut guard) = self.cmd_tx.lock() {
            *guard = Some(cmd_tx);
        }
        self.connected.store(true, Ordering::SeqCst);

        let _ = self.notif_tx.send(TransportNotification::Connected);

        let config = self.config.clone();
        let notif_tx = self.notif_tx.clone();
        let connected = self.connected.clone();
        tokio::spawn(async move {
            run_connection(stream, cmd_rx, notif_tx, config, connected).await;
        });
        Ok(())
    }

    async fn send(&self, event: ClientEvent) -> Result<(), TransportError> {
        let cmd_tx = self.command_sender().ok_or(TransportError::Disconnected)?;
        let frame = event
            .to_json()
            .map_err(|e| TransportError::Encode(e.to_string()))?;

        debug!(event = event.name(), "Sending signaling event");

        let (reply, reply_rx) = oneshot::channel();
        cmd_tx
            .send(WsCommand::Send { frame, reply })
            .await
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Disconnected)?
    }

    async fn close(&self) {
        let cmd_tx = self.cmd_tx.lock().ok().and_then(|mut guard| guard.take());
        if let Some(cmd_tx) = cmd_tx {
            let _ = cmd_tx.send(WsCommand::Close).await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn open_socket(config: &WsConfig) -> Result<WsStream, TransportError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::Unreachable(e.to_string()))?;

    if let Some(token) = &config.auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::Unreachable(format!("invalid auth token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    info!(url = %config.url, "Connecting to signaling server");

    let (stream, response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| match e {
            tokio_tungstenite::tungstenite::Error::Http(resp) => TransportError::Rejected {
                status: resp.status().as_u16(),
            },
            other => TransportError::Unreachable(other.to_string()),
        })?;

    info!(status = %response.status(), "Signaling connected");
    Ok(stream)
}

/// Connection task: pumps one socket until it ends, then reconnects with
/// backoff until closed or exhausted.
async fn run_connection(
    mut stream: WsStream,
    mut cmd_rx: mpsc::Receiver<WsCommand>,
    notif_tx: NotificationSender,
    config: WsConfig,
    connected: Arc<AtomicBool>,
) {
    loop {
        match pump(stream, &mut cmd_rx, &notif_tx).await {
            ConnectionEnd::Closed => {
                connected.store(false, Ordering::SeqCst);
                debug!("Signaling connection closed");
                return;
            }
            ConnectionEnd::Dropped => {
                connected.store(false, Ordering::SeqCst);
                warn!("Signaling connection dropped");
            }
        }

        stream = match reconnect(&mut cmd_rx, &notif_tx, &config).await {
            Some(s) => s,
            None => return,
        };

        connected.store(true, Ordering::SeqCst);
        let _ = notif_tx.send(TransportNotification::Reconnected);
    }
}

async fn pump(
    stream: WsStream,
    cmd_rx: &mut mpsc::Receiver<WsCommand>,
    notif_tx: &NotificationSender,
) -> ConnectionEnd {
    let (mut writer, mut reader) = stream.split();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(WsCommand::Send { frame, reply }) => {
                    let result = writer
                        .send(Message::Text(frame))
                        .await
                        .map_err(|_| TransportError::Disconnected);
                    let failed = result.is_err();
                    let _ = reply.send(result);
                    if failed {
                        return ConnectionEnd::Dropped;
                    }
                }
                Some(WsCommand::Close) | None => {
                    if let Err(e) = writer.send(Message::Close(None)).await {
                        debug!(error = %e, "Close frame not delivered");
                    }
                    return ConnectionEnd::Closed;
                }
            },
            msg = reader.next() => match msg {
                Some(Ok(Message::Text(text))) => match ServerEvent::from_json(&text) {
                    Ok(event) => {
                        if notif_tx.send(TransportNotification::Event(event)).is_err() {
                            debug!("Notification receiver dropped");
                            return ConnectionEnd::Closed;
                        }
                    }
                    Err(e) => warn!(error = %e, "Skipping undecodable signaling frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Signaling server closed the connection");
                    return ConnectionEnd::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Signaling read error");
                    return ConnectionEnd::Dropped;
                }
                None => return ConnectionEnd::Dropped,
            },
        }
    }
}

/// Retry until a socket opens. Returns `None` when the transport was closed
/// or gave up (after notifying `Lost`).
async fn reconnect(
    cmd_rx: &mut mpsc::Receiver<WsCommand>,
    notif_tx: &NotificationSender,
    config: &WsConfig,
) -> Option<WsStream> {
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let delay = match config.backoff.delay(attempt) {
            Some(d) => d,
            None => {
                let reason = TransportError::RetriesExhausted {
                    attempts: attempt - 1,
                };
                warn!(%reason, "Giving up on signaling server");
                let _ = notif_tx.send(TransportNotification::Lost { reason });
                return None;
            }
        };

        let _ = notif_tx.send(TransportNotification::Reconnecting { attempt, delay });

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(WsCommand::Send { reply, .. }) => {
                        let _ = reply.send(Err(TransportError::Disconnected));
                    }
                    Some(WsCommand::Close) | None => return None,
                },
            }
        }

        match open_socket(config).await {
            Ok(stream) => return Some(stream),
            Err(TransportError::Rejected { status }) if status == 401 || status == 403 => {
                let reason = TransportError::Rejected { status };
                warn!(%reason, "Reconnect refused");
                let _ = notif_tx.send(TransportNotification::Lost { reason });
                return None;
            }
            Err(e) => debug!(attempt, error = %e, "Reconnect attempt failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use huddle_shared::types::{ParticipantId, SessionId};
    use tokio::net::TcpListener;

    type ServerStream = WebSocketStream<TcpStream>;

    fn leave() -> ClientEvent {
        ClientEvent::LeaveSession {
            session_id: SessionId::new("m1"),
        }
    }

    fn local_config(addr: SocketAddr, backoff: Backoff) -> WsConfig {
        WsConfig {
            url: format!("ws://{addr}/signaling"),
            auth_token: None,
            backoff,
        }
    }

    fn fast_backoff(max_attempts: u32) -> Backoff {
        Backoff {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(50),
            multiplier: 1.0,
            max_attempts,
            jitter: 0.0,
        }
    }

    async fn accept(listener: &TcpListener) -> ServerStream {
        let (tcp, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(tcp).await.unwrap()
    }

    async fn next_notification(rx: &mut NotificationReceiver) -> TransportNotification {
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out waiting for a notification")
            .expect("notification channel closed")
    }

    #[tokio::test]
    async fn test_send_before_connect_is_disconnected() {
        let (transport, _rx) = WsTransport::new(WsConfig::default());
        assert!(!transport.is_connected());

        let result = transport
            .send(ClientEvent::LeaveSession {
                session_id: SessionId::new("m1"),
            })
            .await;
        assert_eq!(result, Err(TransportError::Disconnected));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_unreachable() {
        let config = WsConfig {
            url: "ws://127.0.0.1:9/signaling".to_string(),
            ..WsConfig::default()
        };
        let (transport, _rx) = WsTransport::new(config);
        match transport.connect().await {
            Err(TransportError::Unreachable(_)) => {}
            other => panic!("expected unreachable, got {other:?}"),
        }
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected_before_dialing() {
        let config = WsConfig {
            url: "not a url".to_string(),
            ..WsConfig::default()
        };
        let (transport, _rx) = WsTransport::new(config);
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_sends_complete_while_inbound_events_pile_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let backlog = CHANNEL_CAPACITY + 64;
        let (got_tx, got_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let frame = ServerEvent::ParticipantLeft {
                participant_id: ParticipantId::new("p-c"),
                reason: None,
            }
            .to_json()
            .unwrap();
            for _ in 0..backlog {
                ws.send(Message::Text(frame.clone())).await.unwrap();
            }
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let _ = got_tx.send(text);
                    break;
                }
            }
            // Hold the socket until the client goes away.
            while ws.next().await.is_some() {}
        });

        let (transport, mut rx) = WsTransport::new(local_config(addr, fast_backoff(0)));
        transport.connect().await.unwrap();

        // Nobody drains `rx` while the server floods the socket.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let sent = tokio::time::timeout(Duration::from_secs(3), transport.send(leave()))
            .await
            .expect("send stalled behind undrained notifications");
        assert_eq!(sent, Ok(()));

        let text = tokio::time::timeout(Duration::from_secs(3), got_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(text.contains("leave-session"));

        assert_eq!(next_notification(&mut rx).await, TransportNotification::Connected);
        for _ in 0..backlog {
            assert!(matches!(
                next_notification(&mut rx).await,
                TransportNotification::Event(ServerEvent::ParticipantLeft { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_reconnects_after_server_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (got_tx, got_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut first = accept(&listener).await;
            first.close(None).await.unwrap();

            let mut second = accept(&listener).await;
            while let Some(Ok(msg)) = second.next().await {
                if let Message::Text(text) = msg {
                    let _ = got_tx.send(text);
                    break;
                }
            }
            while second.next().await.is_some() {}
        });

        let (transport, mut rx) = WsTransport::new(local_config(addr, fast_backoff(5)));
        transport.connect().await.unwrap();

        assert_eq!(next_notification(&mut rx).await, TransportNotification::Connected);
        assert_eq!(
            next_notification(&mut rx).await,
            TransportNotification::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(20),
            }
        );
        assert_eq!(next_notification(&mut rx).await, TransportNotification::Reconnected);
        assert!(transport.is_connected());

        transport.send(leave()).await.unwrap();
        let text = tokio::time::timeout(Duration::from_secs(3), got_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(text.contains("leave-session"));
    }

    #[tokio::test]
    async fn test_lost_after_retries_exhausted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            drop(listener);
            let _ = ws.close(None).await;
        });

        let (transport, mut rx) = WsTransport::new(local_config(addr, fast_backoff(2)));
        transport.connect().await.unwrap();

        assert_eq!(next_notification(&mut rx).await, TransportNotification::Connected);
        for attempt in 1..=2 {
            assert!(matches!(
                next_notification(&mut rx).await,
                TransportNotification::Reconnecting { attempt: a, .. } if a == attempt
            ));
        }
        assert_eq!(
            next_notification(&mut rx).await,
            TransportNotification::Lost {
                reason: TransportError::RetriesExhausted { attempts: 2 },
            }
        );
        assert!(!transport.is_connected());
        assert_eq!(transport.send(leave()).await, Err(TransportError::Closed));
    }
}
