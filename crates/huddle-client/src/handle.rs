//! Session task and the cloneable handle used to drive it.
//!
//! The task owns the [`SessionClient`] and serialises everything that
//! touches it: UI commands, transport notifications, runtime media events
//! and the results of captures that were started off the task.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use huddle_media::{DeviceInfo, LocalTrack, MediaEventReceiver};
use huddle_net::NotificationReceiver;
use huddle_shared::constants::CHANNEL_CAPACITY;
use huddle_shared::models::Session;
use huddle_shared::types::{MediaKind, ParticipantId, SessionId};
use huddle_shared::{MediaAccessError, SessionError};

use crate::events::{EventBus, EventFilter, SessionEvent, SubscriptionToken};
use crate::session::{capture_device, capture_media, SessionClient};
use crate::state::{Lifecycle, SessionSnapshot};

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Commands accepted by the session task. Every command carries the
/// channel its outcome is reported on.
#[derive(Debug)]
pub enum SessionCommand {
    Join {
        session_id: SessionId,
        password: Option<String>,
        reply: Reply<Session>,
    },
    Leave(Reply<()>),
    ToggleVideo(Reply<bool>),
    ToggleAudio(Reply<bool>),
    StartScreenShare(Reply<()>),
    StopScreenShare(Reply<()>),
    SendChat {
        content: String,
        private: bool,
        recipient_id: Option<ParticipantId>,
        reply: Reply<()>,
    },
    SetDevice {
        kind: MediaKind,
        device_id: String,
        reply: Reply<()>,
    },
    RaiseHand(Reply<()>),
    LowerHand(Reply<()>),
    ListDevices(Reply<Vec<DeviceInfo>>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    /// Leave (if needed) and stop the task.
    Shutdown,
}

/// Work finished outside the task, fed back in for the epoch check.
enum Internal {
    JoinCaptured {
        epoch: u64,
        result: Result<Vec<LocalTrack>, MediaAccessError>,
    },
    DeviceCaptured {
        kind: MediaKind,
        epoch: u64,
        result: Result<LocalTrack, MediaAccessError>,
        reply: Reply<()>,
    },
}

#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
    events: EventBus,
}

/// Move `client` into its own task. `media_rx` is the receiver returned by
/// [`SessionClient::new`]; `notif_rx` is the transport's notification
/// receiver.
pub fn spawn_session(
    client: SessionClient,
    media_rx: MediaEventReceiver,
    notif_rx: NotificationReceiver,
) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let events = client.event_bus();
    tokio::spawn(run(client, cmd_rx, media_rx, notif_rx));
    SessionHandle { cmd_tx, events }
}

impl SessionHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Resolves once the server confirms the join, or with the error that
    /// returned the session to idle.
    pub async fn join(
        &self,
        session_id: SessionId,
        password: Option<String>,
    ) -> Result<Session, SessionError> {
        self.request(|reply| SessionCommand::Join {
            session_id,
            password,
            reply,
        })
        .await
    }

    pub async fn leave(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::Leave).await
    }

    pub async fn toggle_video(&self) -> Result<bool, SessionError> {
        self.request(SessionCommand::ToggleVideo).await
    }

    pub async fn toggle_audio(&self) -> Result<bool, SessionError> {
        self.request(SessionCommand::ToggleAudio).await
    }

    pub async fn start_screen_share(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::StartScreenShare).await
    }

    pub async fn stop_screen_share(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::StopScreenShare).await
    }

    pub async fn send_chat_message(
        &self,
        content: impl Into<String>,
        private: bool,
        recipient_id: Option<ParticipantId>,
    ) -> Result<(), SessionError> {
        let content = content.into();
        self.request(|reply| SessionCommand::SendChat {
            content,
            private,
            recipient_id,
            reply,
        })
        .await
    }

    pub async fn set_video_device(&self, device_id: impl Into<String>) -> Result<(), SessionError> {
        self.set_device(MediaKind::Video, device_id.into()).await
    }

    pub async fn set_audio_device(&self, device_id: impl Into<String>) -> Result<(), SessionError> {
        self.set_device(MediaKind::Audio, device_id.into()).await
    }

    async fn set_device(&self, kind: MediaKind, device_id: String) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::SetDevice {
            kind,
            device_id,
            reply,
        })
        .await
    }

    pub async fn raise_hand(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::RaiseHand).await
    }

    pub async fn lower_hand(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::LowerHand).await
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>, SessionError> {
        self.request(SessionCommand::ListDevices).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Snapshot(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub fn subscribe(
        &self,
        filter: EventFilter,
        handler: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        self.events.subscribe(filter, handler)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.events.unsubscribe(token)
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
    }
}

struct Actor {
    client: SessionClient,
    pending_join: Option<Reply<Session>>,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

async fn run(
    client: SessionClient,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    mut media_rx: MediaEventReceiver,
    mut notif_rx: NotificationReceiver,
) {
    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();
    let mut actor = Actor {
        client,
        pending_join: None,
        internal_tx,
    };
    info!(user = %actor.client.identity().user_id, "Session task started");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::Shutdown) | None => {
                    info!("Session task shutting down");
                    actor.shutdown().await;
                    break;
                }
                Some(cmd) => actor.handle_command(cmd).await,
            },

            Some(notification) = notif_rx.recv() => {
                actor.client.handle_transport_notification(notification).await;
            }

            Some(event) = media_rx.recv() => {
                actor.client.handle_media_event(event).await;
            }

            Some(internal) = internal_rx.recv() => {
                actor.handle_internal(internal).await;
            }
        }
        actor.resolve_pending_join();
    }
}

impl Actor {
    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Join {
                session_id,
                password,
                reply,
            } => self.start_join(session_id, password, reply),
            SessionCommand::Leave(reply) => {
                let _ = reply.send(self.client.leave().await);
            }
            SessionCommand::ToggleVideo(reply) => {
                let _ = reply.send(self.client.toggle_video().await);
            }
            SessionCommand::ToggleAudio(reply) => {
                let _ = reply.send(self.client.toggle_audio().await);
            }
            SessionCommand::StartScreenShare(reply) => {
                let _ = reply.send(self.client.start_screen_share().await);
            }
            SessionCommand::StopScreenShare(reply) => {
                let _ = reply.send(self.client.stop_screen_share().await);
            }
            SessionCommand::SendChat {
                content,
                private,
                recipient_id,
                reply,
            } => {
                let result = self
                    .client
                    .send_chat_message(&content, private, recipient_id)
                    .await;
                let _ = reply.send(result);
            }
            SessionCommand::SetDevice {
                kind,
                device_id,
                reply,
            } => self.start_device_switch(kind, device_id, reply),
            SessionCommand::RaiseHand(reply) => {
                let _ = reply.send(self.client.raise_hand().await);
            }
            SessionCommand::LowerHand(reply) => {
                let _ = reply.send(self.client.lower_hand().await);
            }
            SessionCommand::ListDevices(reply) => {
                let _ = reply.send(self.client.list_devices().await);
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.client.snapshot());
            }
            SessionCommand::Shutdown => {}
        }
    }

    /// Capture runs off the task so a `leave` can be processed meanwhile.
    fn start_join(&mut self, session_id: SessionId, password: Option<String>, reply: Reply<Session>) {
        if self.pending_join.is_some() {
            let _ = reply.send(Err(SessionError::Busy));
            return;
        }
        let ticket = match self.client.begin_join(session_id, password) {
            Ok(ticket) => ticket,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        self.pending_join = Some(reply);

        let devices = self.client.devices();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = capture_media(devices.as_ref(), &ticket.constraints).await;
            let _ = internal_tx.send(Internal::JoinCaptured {
                epoch: ticket.epoch,
                result,
            });
        });
    }

    fn start_device_switch(&mut self, kind: MediaKind, device_id: String, reply: Reply<()>) {
        let epoch = match self.client.begin_device_switch(kind) {
            Ok(epoch) => epoch,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let devices = self.client.devices();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = capture_device(devices.as_ref(), kind, &device_id).await;
            let _ = internal_tx.send(Internal::DeviceCaptured {
                kind,
                epoch,
                result,
                reply,
            });
        });
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::JoinCaptured { epoch, result } => {
                if let Err(e) = self.client.continue_join(epoch, result).await {
                    debug!(error = %e, "Join did not reach the server");
                }
            }
            Internal::DeviceCaptured {
                kind,
                epoch,
                result,
                reply,
            } => {
                let outcome = self.client.complete_device_switch(kind, epoch, result).await;
                let _ = reply.send(outcome);
            }
        }
    }

    fn resolve_pending_join(&mut self) {
        if self.pending_join.is_none() {
            return;
        }
        let outcome = match self.client.lifecycle() {
            Lifecycle::Joined => match self.client.session() {
                Some(session) => Ok(session.clone()),
                None => return,
            },
            Lifecycle::Idle => Err(self
                .client
                .take_last_error()
                .unwrap_or(SessionError::Cancelled)),
            Lifecycle::Joining | Lifecycle::Leaving => return,
        };
        if let Some(reply) = self.pending_join.take() {
            let _ = reply.send(outcome);
        }
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.client.leave().await {
            debug!(error = %e, "Leave on shutdown failed");
        }
        self.resolve_pending_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use huddle_media::testing::{FakeDevices, FakeFactory};
    use huddle_net::testing::ChannelTransport;
    use huddle_shared::models::{
        MediaState, Participant, ParticipantRole, ParticipantStatus, SessionSettings,
        SessionStatus,
    };
    use huddle_shared::protocol::ServerEvent;
    use huddle_shared::types::UserId;

    use crate::config::{LocalIdentity, MediaPreferences};
    use crate::events::SessionEventKind;

    struct Fixture {
        handle: SessionHandle,
        transport: Arc<ChannelTransport>,
        devices: Arc<FakeDevices>,
    }

    fn fixture() -> Fixture {
        let (transport, notif_rx) = ChannelTransport::new();
        let transport = Arc::new(transport);
        let devices = Arc::new(FakeDevices::new());
        let (client, media_rx) = SessionClient::new(
            LocalIdentity {
                user_id: UserId::new("u-self"),
                display_name: "Me".into(),
            },
            MediaPreferences::default(),
            transport.clone(),
            devices.clone(),
            Arc::new(FakeFactory::new()),
        );
        Fixture {
            handle: spawn_session(client, media_rx, notif_rx),
            transport,
            devices,
        }
    }

    fn participant(id: &str, user: &str) -> Participant {
        Participant {
            id: ParticipantId::new(id),
            user_id: UserId::new(user),
            display_name: id.to_string(),
            role: ParticipantRole::Attendee,
            status: ParticipantStatus::Joined,
            media: MediaState::default(),
            permissions: None,
            hand_raised: false,
            joined_at: None,
        }
    }

    fn session_joined() -> ServerEvent {
        ServerEvent::SessionJoined {
            session: Session {
                id: SessionId::new("m1"),
                title: "Standup".into(),
                description: None,
                starts_at: Utc::now(),
                ends_at: Utc::now() + chrono::Duration::minutes(15),
                status: SessionStatus::Live,
                host_id: UserId::new("u-a"),
                settings: SessionSettings::default(),
            },
            participants: vec![participant("p-self", "u-self"), participant("p-a", "u-a")],
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn wait_for_lifecycle(handle: &SessionHandle, lifecycle: Lifecycle) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.snapshot().await.unwrap().lifecycle != lifecycle {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("lifecycle not reached in time");
    }

    async fn joined(f: &Fixture) {
        let handle = f.handle.clone();
        let join = tokio::spawn(async move { handle.join(SessionId::new("m1"), None).await });
        wait_until(|| f.transport.count("join-session") == 1).await;
        f.transport.push(session_joined()).await;
        let session = join.await.unwrap().unwrap();
        assert_eq!(session.id, SessionId::new("m1"));
    }

    #[tokio::test]
    async fn test_join_resolves_on_server_confirmation() {
        let f = fixture();
        joined(&f).await;

        let snapshot = f.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.lifecycle, Lifecycle::Joined);
        assert_eq!(snapshot.peers.len(), 1);
        assert_eq!(snapshot.self_id, Some(ParticipantId::new("p-self")));
        assert_eq!(f.transport.count("webrtc-offer"), 1);
    }

    #[tokio::test]
    async fn test_leave_while_awaiting_confirmation_cancels_join() {
        let f = fixture();
        let handle = f.handle.clone();
        let join = tokio::spawn(async move { handle.join(SessionId::new("m1"), None).await });
        wait_until(|| f.transport.count("join-session") == 1).await;

        f.handle.leave().await.unwrap();

        assert_eq!(join.await.unwrap(), Err(SessionError::Cancelled));
        assert_eq!(f.devices.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_leave_during_capture_cancels_join() {
        let f = fixture();
        f.devices.pause();
        let handle = f.handle.clone();
        let join = tokio::spawn(async move { handle.join(SessionId::new("m1"), None).await });
        wait_for_lifecycle(&f.handle, Lifecycle::Joining).await;

        f.handle.leave().await.unwrap();
        assert_eq!(join.await.unwrap(), Err(SessionError::Cancelled));

        f.devices.resume();
        wait_until(|| !f.devices.issued().is_empty() && f.devices.live_tracks() == 0).await;
        assert_eq!(f.transport.count("join-session"), 0);
        assert_eq!(
            f.handle.snapshot().await.unwrap().lifecycle,
            Lifecycle::Idle
        );
    }

    #[tokio::test]
    async fn test_join_failure_is_reported() {
        let f = fixture();
        f.devices.deny(MediaKind::Audio);
        assert_eq!(
            f.handle.join(SessionId::new("m1"), None).await,
            Err(SessionError::Media(MediaAccessError::PermissionDenied(
                MediaKind::Audio
            )))
        );
        assert_eq!(
            f.handle.join(SessionId::new(""), None).await,
            Err(huddle_shared::ValidationError::InvalidSessionId.into())
        );
    }

    #[tokio::test]
    async fn test_device_switch_outlived_by_leave_is_cancelled() {
        let f = fixture();
        joined(&f).await;
        let issued_before = f.devices.issued().len();

        f.devices.pause();
        let handle = f.handle.clone();
        let switch = tokio::spawn(async move { handle.set_video_device("cam-1").await });
        tokio::task::yield_now().await;
        f.handle.snapshot().await.unwrap();

        f.handle.leave().await.unwrap();
        f.devices.resume();

        assert_eq!(switch.await.unwrap(), Err(SessionError::Cancelled));
        let issued = f.devices.issued();
        assert_eq!(issued.len(), issued_before + 1);
        assert!(issued.iter().all(|t| t.is_ended()));
        assert_eq!(
            f.handle.snapshot().await.unwrap().lifecycle,
            Lifecycle::Idle
        );
    }

    #[tokio::test]
    async fn test_chat_before_leave_is_delivered() {
        let f = fixture();
        joined(&f).await;

        let (chat, leave) = tokio::join!(
            f.handle.send_chat_message("bye all", false, None),
            f.handle.leave()
        );
        assert_eq!(chat, Ok(()));
        assert_eq!(leave, Ok(()));

        let names = f.transport.sent_names();
        let chat_at = names.iter().position(|n| *n == "send-chat").unwrap();
        let leave_at = names.iter().position(|n| *n == "leave-session").unwrap();
        assert!(chat_at < leave_at);
    }

    #[tokio::test]
    async fn test_chat_after_leave_is_rejected() {
        let f = fixture();
        joined(&f).await;
        f.handle.leave().await.unwrap();

        assert_eq!(
            f.handle.send_chat_message("anyone?", false, None).await,
            Err(SessionError::NotJoined)
        );
        assert_eq!(f.transport.count("send-chat"), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_session_events() {
        let f = fixture();
        let joins = Arc::new(AtomicUsize::new(0));
        let counter = joins.clone();
        let token = f
            .handle
            .subscribe(EventFilter::Kind(SessionEventKind::Joined), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        joined(&f).await;
        assert_eq!(joins.load(Ordering::SeqCst), 1);
        assert!(f.handle.unsubscribe(token));
    }

    #[tokio::test]
    async fn test_commands_after_shutdown_fail_closed() {
        let f = fixture();
        joined(&f).await;

        f.handle.shutdown().await;
        wait_until(|| f.transport.count("leave-session") == 1).await;
        assert_eq!(f.handle.toggle_video().await, Err(SessionError::Closed));
        assert_eq!(f.devices.live_tracks(), 0);
    }
}
