//! Per-peer negotiation state.
//!
//! A [`PeerLink`] wraps one runtime connection to a remote participant and
//! tracks where the offer/answer exchange stands, which local tracks occupy
//! its outbound senders, the remote streams it has received, and the ICE
//! candidates that arrived before the remote description did.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, warn};

use huddle_shared::constants::ICE_RESTART_ATTEMPTS;
use huddle_shared::protocol::{IceCandidate, SdpKind, SessionDescription};
use huddle_shared::types::{MediaKind, ParticipantId, StreamKind, TrackId};
use huddle_shared::NegotiationError;

use crate::rtc::{
    ConnectionState, MediaEventSender, PeerConnectionFactory, RemoteTrack, ReplaceTrackError,
    RtcPeerConnection, SenderId,
};
use crate::track::LocalTrack;

/// `New → Negotiating → Connected → {Failed | Closed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Outbound sender slots. Camera and screen share the video slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboundSlot {
    Audio,
    Video,
}

impl OutboundSlot {
    pub fn for_kind(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self::Audio,
            MediaKind::Video | MediaKind::Screen => Self::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Outbound {
    sender: SenderId,
    track: TrackId,
}

/// What the owner must do after a connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Send an ICE-restart offer on the same link.
    RestartIce,
    /// The failure is terminal: close this link and open a fresh one.
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The sender now carries the new track; no renegotiation needed.
    InPlace,
    /// The sender set changed; a new offer must be sent.
    Renegotiate,
}

pub struct PeerLink {
    participant_id: ParticipantId,
    connection: Arc<dyn RtcPeerConnection>,
    state: LinkState,
    awaiting_answer: bool,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
    initiator: bool,
    restarts: u32,
    outbound: HashMap<OutboundSlot, Outbound>,
    remote_streams: HashMap<StreamKind, RemoteTrack>,
}

impl PeerLink {
    pub async fn open(
        participant_id: ParticipantId,
        factory: &dyn PeerConnectionFactory,
        events: MediaEventSender,
    ) -> Result<Self, NegotiationError> {
        let connection = factory.create(&participant_id, events).await?;
        debug!(peer = %participant_id.short(), "Peer link opened");
        Ok(Self {
            participant_id,
            connection,
            state: LinkState::New,
            awaiting_answer: false,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            initiator: false,
            restarts: 0,
            outbound: HashMap::new(),
            remote_streams: HashMap::new(),
        })
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == LinkState::Closed
    }

    /// An offer of ours is outstanding.
    pub fn is_awaiting_answer(&self) -> bool {
        self.awaiting_answer
    }

    /// A remote description has been applied at least once, so the
    /// connection has an agreed session to fall back to.
    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    /// The local side sent the first offer on this link.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn outbound_track(&self, slot: OutboundSlot) -> Option<TrackId> {
        self.outbound.get(&slot).map(|o| o.track)
    }

    pub fn remote_streams(&self) -> impl Iterator<Item = &RemoteTrack> {
        self.remote_streams.values()
    }

    pub fn remote_stream(&self, kind: StreamKind) -> Option<&RemoteTrack> {
        self.remote_streams.get(&kind)
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::LinkClosed);
        }
        Ok(())
    }

    fn begin_negotiating(&mut self) {
        if matches!(self.state, LinkState::New | LinkState::Failed) {
            self.state = LinkState::Negotiating;
        }
    }

    /// Attach local tracks to empty outbound slots. Occupied slots are left
    /// alone.
    pub async fn attach(&mut self, tracks: &[LocalTrack]) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        for track in tracks {
            let slot = OutboundSlot::for_kind(track.kind());
            if self.outbound.contains_key(&slot) {
                continue;
            }
            let sender = self.connection.add_track(track).await?;
            self.outbound.insert(
                slot,
                Outbound {
                    sender,
                    track: track.id(),
                },
            );
        }
        Ok(())
    }

    pub async fn create_offer(
        &mut self,
        ice_restart: bool,
    ) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        let offer = self.connection.create_offer(ice_restart).await?;
        self.connection.set_local_description(&offer).await?;

        self.awaiting_answer = true;
        if !ice_restart {
            self.initiator = true;
        }
        self.begin_negotiating();
        debug!(peer = %self.participant_id.short(), ice_restart, "Offer created");
        Ok(offer)
    }

    /// Drop our outstanding offer so a colliding remote offer can be
    /// answered on the same connection.
    pub async fn rollback_offer(&mut self) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if !self.awaiting_answer {
            return Ok(());
        }
        self.connection.rollback().await?;
        self.awaiting_answer = false;
        debug!(peer = %self.participant_id.short(), "Local offer rolled back");
        Ok(())
    }

    /// Apply a remote offer and produce the answer to send back.
    pub async fn accept_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        if offer.kind != SdpKind::Offer {
            return Err(NegotiationError::MalformedDescription(
                "expected an offer".into(),
            ));
        }

        self.connection.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;

        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(&answer).await?;
        self.awaiting_answer = false;
        self.begin_negotiating();
        debug!(peer = %self.participant_id.short(), "Answer created");
        Ok(answer)
    }

    pub async fn accept_answer(
        &mut self,
        answer: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if !self.awaiting_answer {
            return Err(NegotiationError::UnexpectedAnswer);
        }
        if answer.kind != SdpKind::Answer {
            return Err(NegotiationError::MalformedDescription(
                "expected an answer".into(),
            ));
        }

        self.connection.set_remote_description(answer).await?;
        self.remote_description_set = true;
        self.awaiting_answer = false;
        self.flush_candidates().await;
        debug!(peer = %self.participant_id.short(), "Answer applied");
        Ok(())
    }

    /// Apply a remote candidate, or queue it until the remote description
    /// is set. Returns `true` when applied immediately.
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<bool, NegotiationError> {
        self.ensure_open()?;
        if !self.remote_description_set {
            self.pending_candidates.push_back(candidate);
            debug!(
                peer = %self.participant_id.short(),
                queued = self.pending_candidates.len(),
                "Queued early ICE candidate"
            );
            return Ok(false);
        }
        self.connection.add_ice_candidate(&candidate).await?;
        Ok(true)
    }

    async fn flush_candidates(&mut self) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = self.connection.add_ice_candidate(&candidate).await {
                warn!(peer = %self.participant_id.short(), error = %e, "Dropping ICE candidate");
            }
        }
    }

    /// Feed a runtime connection-state change into the link.
    pub fn on_connection_state(&mut self, state: ConnectionState) -> Option<FailureAction> {
        if self.is_closed() {
            return None;
        }
        match state {
            ConnectionState::Connected => {
                if self.state != LinkState::Connected {
                    info!(peer = %self.participant_id.short(), "Peer connected");
                }
                self.state = LinkState::Connected;
                self.restarts = 0;
                None
            }
            ConnectionState::Failed => {
                self.state = LinkState::Failed;
                if self.restarts < ICE_RESTART_ATTEMPTS {
                    self.restarts += 1;
                    warn!(peer = %self.participant_id.short(), "Peer link failed, restarting ICE");
                    Some(FailureAction::RestartIce)
                } else {
                    warn!(peer = %self.participant_id.short(), "Peer link failed after ICE restart");
                    Some(FailureAction::Replace)
                }
            }
            ConnectionState::Closed => {
                self.state = LinkState::Closed;
                None
            }
            ConnectionState::New | ConnectionState::Connecting | ConnectionState::Disconnected => {
                None
            }
        }
    }

    /// Put `track` on the outbound sender for its slot.
    pub async fn replace_outbound(
        &mut self,
        track: &LocalTrack,
    ) -> Result<ReplaceOutcome, NegotiationError> {
        self.ensure_open()?;
        let slot = OutboundSlot::for_kind(track.kind());

        let current = match self.outbound.get(&slot).copied() {
            Some(current) if current.track == track.id() => return Ok(ReplaceOutcome::InPlace),
            Some(current) => current,
            None => {
                let sender = self.connection.add_track(track).await?;
                self.outbound.insert(slot, Outbound { sender, track: track.id() });
                return Ok(ReplaceOutcome::Renegotiate);
            }
        };

        match self.connection.replace_track(current.sender, track).await {
            Ok(()) => {
                self.outbound.insert(
                    slot,
                    Outbound {
                        sender: current.sender,
                        track: track.id(),
                    },
                );
                Ok(ReplaceOutcome::InPlace)
            }
            Err(ReplaceTrackError::Unsupported) => {
                debug!(peer = %self.participant_id.short(), "Replacing sender instead of track");
                self.connection.remove_track(current.sender).await?;
                self.outbound.remove(&slot);
                let sender = self.connection.add_track(track).await?;
                self.outbound.insert(slot, Outbound { sender, track: track.id() });
                Ok(ReplaceOutcome::Renegotiate)
            }
            Err(ReplaceTrackError::Rtc(e)) => Err(NegotiationError::Rtc(e)),
        }
    }

    /// Drop the sender for `slot`. Returns `true` when a sender was removed
    /// and the link needs renegotiating.
    pub async fn remove_outbound(&mut self, slot: OutboundSlot) -> Result<bool, NegotiationError> {
        self.ensure_open()?;
        match self.outbound.remove(&slot) {
            Some(current) => {
                self.connection.remove_track(current.sender).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn record_remote_track(&mut self, track: RemoteTrack) {
        debug!(
            peer = %self.participant_id.short(),
            stream = ?track.stream,
            kind = %track.kind,
            "Remote track added"
        );
        self.remote_streams.insert(track.stream, track);
    }

    /// Reclassify the remote video after the peer announced a screen share
    /// change. A sender swapped in place keeps the stream label it was
    /// negotiated with, so the announcement is the only signal. Returns the
    /// track under its new classification when it moved.
    pub fn set_remote_screen_share(&mut self, active: bool) -> Option<RemoteTrack> {
        let (from, to) = if active {
            (StreamKind::Camera, StreamKind::Screen)
        } else {
            (StreamKind::Screen, StreamKind::Camera)
        };
        if self.remote_streams.contains_key(&to) {
            return None;
        }
        let mut track = self.remote_streams.remove(&from)?;
        track.stream = to;
        self.remote_streams.insert(to, track.clone());
        Some(track)
    }

    /// Close the connection. Shared local tracks keep running; queued
    /// candidates and any outstanding offer are discarded.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.connection.close().await;
        self.state = LinkState::Closed;
        self.awaiting_answer = false;
        self.pending_candidates.clear();
        self.remote_streams.clear();
        debug!(peer = %self.participant_id.short(), "Peer link closed");
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("participant_id", &self.participant_id)
            .field("state", &self.state)
            .field("awaiting_answer", &self.awaiting_answer)
            .field("pending_candidates", &self.pending_candidates.len())
            .field("initiator", &self.initiator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::media_channel;
    use crate::testing::FakeFactory;

    async fn open(factory: &FakeFactory, id: &str) -> PeerLink {
        let (tx, _rx) = media_channel();
        PeerLink::open(ParticipantId::new(id), factory, tx)
            .await
            .unwrap()
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"))
    }

    #[tokio::test]
    async fn test_offer_answer_flow() {
        let factory = FakeFactory::new();
        let mut link = open(&factory, "p-b").await;
        assert_eq!(link.state(), LinkState::New);

        let offer = link.create_offer(false).await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert_eq!(link.state(), LinkState::Negotiating);
        assert!(link.is_awaiting_answer());
        assert!(link.is_initiator());

        link.accept_answer(&SessionDescription::answer("v=0 remote"))
            .await
            .unwrap();
        assert!(!link.is_awaiting_answer());

        assert_eq!(link.on_connection_state(ConnectionState::Connected), None);
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_rollback_then_answer_on_same_connection() {
        let factory = FakeFactory::new();
        let mut link = open(&factory, "p-b").await;
        link.create_offer(false).await.unwrap();
        link.accept_answer(&SessionDescription::answer("v=0 remote"))
            .await
            .unwrap();
        link.on_connection_state(ConnectionState::Connected);
        assert!(link.has_remote_description());

        link.create_offer(false).await.unwrap();
        link.rollback_offer().await.unwrap();
        assert!(!link.is_awaiting_answer());

        link.accept_offer(&SessionDescription::offer("v=0 renegotiate"))
            .await
            .unwrap();
        assert_eq!(link.state(), LinkState::Connected);

        let log = factory.latest(&ParticipantId::new("p-b")).unwrap().log();
        assert_eq!(log.rollbacks, 1);
        assert_eq!(log.answers.len(), 1);
        assert!(!log.closed);
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let factory = FakeFactory::new();
        let mut link = open(&factory, "p-b").await;

        for n in 1..=3 {
            assert!(!link.add_remote_candidate(candidate(n)).await.unwrap());
        }
        assert_eq!(link.pending_candidates(), 3);
        let conn = factory.latest(&ParticipantId::new("p-b")).unwrap();
        assert!(conn.log().candidates.is_empty());

        link.accept_offer(&SessionDescription::offer("v=0 remote"))
            .await
            .unwrap();
        assert_eq!(link.pending_candidates(), 0);
        let applied = conn.log().candidates;
        assert_eq!(applied, vec![candidate(1), candidate(2), candidate(3)]);

        assert!(link.add_remote_candidate(candidate(4)).await.unwrap());
        assert_eq!(conn.log().candidates.len(), 4);
    }

    #[tokio::test]
    async fn test_unexpected_answer_is_rejected() {
        let factory = FakeFactory::new();
        let mut link = open(&factory, "p-b").await;
        let result = link
            .accept_answer(&SessionDescription::answer("v=0 stray"))
            .await;
        assert_eq!(result, Err(NegotiationError::UnexpectedAnswer));
    }

    #[tokio::test]
    async fn test_one_ice_restart_then_replace() {
        let factory = FakeFactory::new();
        let mut link = open(&factory, "p-b").await;
        link.create_offer(false).await.unwrap();

        assert_eq!(
            link.on_connection_state(ConnectionState::Failed),
            Some(FailureAction::RestartIce)
        );
        assert_eq!(link.state(), LinkState::Failed);
        link.create_offer(true).await.unwrap();
        assert_eq!(link.state(), LinkState::Negotiating);

        assert_eq!(
            link.on_connection_state(ConnectionState::Failed),
            Some(FailureAction::Replace)
        );
    }

    #[tokio::test]
    async fn test_connected_resets_restart_allowance() {
        let factory = FakeFactory::new();
        let mut link = open(&factory, "p-b").await;

        assert_eq!(
            link.on_connection_state(ConnectionState::Failed),
            Some(FailureAction::RestartIce)
        );
        link.on_connection_state(ConnectionState::Connected);
        assert_eq!(
            link.on_connection_state(ConnectionState::Failed),
            Some(FailureAction::RestartIce)
        );
    }

    #[tokio::test]
    async fn test_replace_in_place_and_fallback() {
        let camera = LocalTrack::new(MediaKind::Video, Some("cam-0".into()), "Camera");
        let screen = LocalTrack::new(MediaKind::Screen, None, "Display");

        let factory = FakeFactory::new();
        let mut link = open(&factory, "p-b").await;
        link.attach(&[camera.clone()]).await.unwrap();
        assert_eq!(
            link.replace_outbound(&screen).await.unwrap(),
            ReplaceOutcome::InPlace
        );
        assert_eq!(link.outbound_track(OutboundSlot::Video), Some(screen.id()));

        factory.set_supports_replace(false);
        let mut legacy = open(&factory, "p-c").await;
        legacy.attach(&[camera.clone()]).await.unwrap();
        assert_eq!(
            legacy.replace_outbound(&screen).await.unwrap(),
            ReplaceOutcome::Renegotiate
        );
        let log = factory.latest(&ParticipantId::new("p-c")).unwrap().log();
        assert_eq!(log.removed.len(), 1);
        assert_eq!(log.added, vec![camera.id(), screen.id()]);
    }

    #[tokio::test]
    async fn test_remote_screen_share_relabels_video() {
        let factory = FakeFactory::new();
        let mut link = open(&factory, "p-b").await;
        assert_eq!(link.set_remote_screen_share(true), None);

        link.record_remote_track(RemoteTrack {
            id: "v1".into(),
            kind: MediaKind::Video,
            stream: StreamKind::Camera,
        });
        let moved = link.set_remote_screen_share(true).unwrap();
        assert_eq!(moved.stream, StreamKind::Screen);
        assert!(link.remote_stream(StreamKind::Camera).is_none());
        assert_eq!(link.remote_stream(StreamKind::Screen).map(|t| t.id.as_str()), Some("v1"));

        link.set_remote_screen_share(false).unwrap();
        assert_eq!(
            link.remote_stream(StreamKind::Camera).map(|t| t.stream),
            Some(StreamKind::Camera)
        );
    }

    #[tokio::test]
    async fn test_close_keeps_tracks_running() {
        let camera = LocalTrack::new(MediaKind::Video, None, "Camera");
        let factory = FakeFactory::new();
        let mut link = open(&factory, "p-b").await;
        link.attach(&[camera.clone()]).await.unwrap();
        link.add_remote_candidate(candidate(1)).await.unwrap();

        link.close().await;
        assert!(link.is_closed());
        assert_eq!(link.pending_candidates(), 0);
        assert!(!camera.is_ended());
        assert_eq!(link.create_offer(false).await, Err(NegotiationError::LinkClosed));
        assert_eq!(link.on_connection_state(ConnectionState::Failed), None);
    }
}
