//! Observer events surfaced by a session, and the bus that delivers them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use huddle_media::{LinkState, RemoteTrack};
use huddle_shared::models::{ChatMessage, MediaState, Participant, Session, TranscriptSegment};
use huddle_shared::types::{MediaKind, ParticipantId};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Joined { session: Session },
    Left,
    ParticipantJoined { participant: Participant },
    ParticipantLeft {
        participant_id: ParticipantId,
        reason: Option<String>,
    },
    ParticipantUpdated { participant: Participant },
    MediaStateChanged {
        participant_id: ParticipantId,
        media_state: MediaState,
    },
    PeerStateChanged {
        participant_id: ParticipantId,
        state: LinkState,
    },
    RemoteTrack {
        participant_id: ParticipantId,
        track: RemoteTrack,
    },
    ChatMessage { message: ChatMessage },
    ScreenShareStarted { participant_id: ParticipantId },
    ScreenShareStopped { participant_id: ParticipantId },
    RecordingStarted { url: Option<String> },
    RecordingStopped { url: Option<String> },
    Transcription { segment: TranscriptSegment },
    HandRaised { participant_id: ParticipantId },
    HandLowered { participant_id: ParticipantId },
    DeviceChanged {
        kind: MediaKind,
        device_id: String,
    },
    Reconnecting { attempt: u32, delay: Duration },
    Reconnected,
    SessionEnded { reason: String },
    /// The signaling channel could not be recovered. Fatal for the session.
    SessionLost { reason: String },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    Joined,
    Left,
    ParticipantJoined,
    ParticipantLeft,
    ParticipantUpdated,
    MediaStateChanged,
    PeerStateChanged,
    RemoteTrack,
    ChatMessage,
    ScreenShareStarted,
    ScreenShareStopped,
    RecordingStarted,
    RecordingStopped,
    Transcription,
    HandRaised,
    HandLowered,
    DeviceChanged,
    Reconnecting,
    Reconnected,
    SessionEnded,
    SessionLost,
    Error,
}

impl SessionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Joined => "joined",
            Self::Left => "left",
            Self::ParticipantJoined => "participant-joined",
            Self::ParticipantLeft => "participant-left",
            Self::ParticipantUpdated => "participant-updated",
            Self::MediaStateChanged => "media-state-changed",
            Self::PeerStateChanged => "peer-state-changed",
            Self::RemoteTrack => "remote-track",
            Self::ChatMessage => "chat-message",
            Self::ScreenShareStarted => "screen-share-started",
            Self::ScreenShareStopped => "screen-share-stopped",
            Self::RecordingStarted => "recording-started",
            Self::RecordingStopped => "recording-stopped",
            Self::Transcription => "transcription",
            Self::HandRaised => "hand-raised",
            Self::HandLowered => "hand-lowered",
            Self::DeviceChanged => "device-changed",
            Self::Reconnecting => "reconnecting",
            Self::Reconnected => "reconnected",
            Self::SessionEnded => "session-ended",
            Self::SessionLost => "session-lost",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SessionEvent {
    pub fn kind(&self) -> SessionEventKind {
        match self {
            Self::Joined { .. } => SessionEventKind::Joined,
            Self::Left => SessionEventKind::Left,
            Self::ParticipantJoined { .. } => SessionEventKind::ParticipantJoined,
            Self::ParticipantLeft { .. } => SessionEventKind::ParticipantLeft,
            Self::ParticipantUpdated { .. } => SessionEventKind::ParticipantUpdated,
            Self::MediaStateChanged { .. } => SessionEventKind::MediaStateChanged,
            Self::PeerStateChanged { .. } => SessionEventKind::PeerStateChanged,
            Self::RemoteTrack { .. } => SessionEventKind::RemoteTrack,
            Self::ChatMessage { .. } => SessionEventKind::ChatMessage,
            Self::ScreenShareStarted { .. } => SessionEventKind::ScreenShareStarted,
            Self::ScreenShareStopped { .. } => SessionEventKind::ScreenShareStopped,
            Self::RecordingStarted { .. } => SessionEventKind::RecordingStarted,
            Self::RecordingStopped { .. } => SessionEventKind::RecordingStopped,
            Self::Transcription { .. } => SessionEventKind::Transcription,
            Self::HandRaised { .. } => SessionEventKind::HandRaised,
            Self::HandLowered { .. } => SessionEventKind::HandLowered,
            Self::DeviceChanged { .. } => SessionEventKind::DeviceChanged,
            Self::Reconnecting { .. } => SessionEventKind::Reconnecting,
            Self::Reconnected => SessionEventKind::Reconnected,
            Self::SessionEnded { .. } => SessionEventKind::SessionEnded,
            Self::SessionLost { .. } => SessionEventKind::SessionLost,
            Self::Error { .. } => SessionEventKind::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Kind(SessionEventKind),
}

impl EventFilter {
    fn matches(&self, event: &SessionEvent) -> bool {
        match self {
            Self::All => true,
            Self::Kind(kind) => event.kind() == *kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

pub type EventHandler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct Subscription {
    token: SubscriptionToken,
    filter: EventFilter,
    handler: EventHandler,
}

#[derive(Default)]
struct BusInner {
    next_token: u64,
    subscriptions: Vec<Subscription>,
}

/// Synchronous fan-out of [`SessionEvent`]s to registered handlers.
///
/// Handlers run on the emitting task, in subscription order. A handler may
/// subscribe or unsubscribe from inside its callback.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        filter: EventFilter,
        handler: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.next_token += 1;
        let token = SubscriptionToken(inner.next_token);
        inner.subscriptions.push(Subscription {
            token,
            filter,
            handler: Arc::new(handler),
        });
        token
    }

    /// Returns `false` when the token was not registered.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|s| s.token != token);
        inner.subscriptions.len() != before
    }

    pub fn emit(&self, event: &SessionEvent) {
        let handlers: Vec<EventHandler> = {
            let inner = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner
                .subscriptions
                .iter()
                .filter(|s| s.filter.matches(event))
                .map(|s| s.handler.clone())
                .collect()
        };
        tracing::trace!(event = %event.kind(), handlers = handlers.len(), "Emitting session event");
        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.subscriptions.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_filtered_delivery() {
        let bus = EventBus::new();
        let all = Arc::new(AtomicUsize::new(0));
        let left = Arc::new(AtomicUsize::new(0));

        let counter = all.clone();
        bus.subscribe(EventFilter::All, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = left.clone();
        bus.subscribe(EventFilter::Kind(SessionEventKind::Left), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&SessionEvent::Reconnected);
        bus.emit(&SessionEvent::Left);

        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(left.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let token = bus.subscribe(EventFilter::All, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.unsubscribe(token));
        assert!(!bus.unsubscribe(token));
        bus.emit(&SessionEvent::Left);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_handler_can_unsubscribe_itself() {
        let bus = EventBus::new();
        let slot: Arc<Mutex<Option<SubscriptionToken>>> = Arc::new(Mutex::new(None));

        let inner_bus = bus.clone();
        let inner_slot = slot.clone();
        let token = bus.subscribe(EventFilter::All, move |_| {
            if let Some(token) = inner_slot.lock().unwrap().take() {
                inner_bus.unsubscribe(token);
            }
        });
        *slot.lock().unwrap() = Some(token);

        bus.emit(&SessionEvent::Reconnected);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_kind_names() {
        let event = SessionEvent::SessionLost {
            reason: "gone".into(),
        };
        assert_eq!(event.kind().as_str(), "session-lost");
        assert_eq!(SessionEventKind::PeerStateChanged.to_string(), "peer-state-changed");
    }
}
