//! Peer-connection runtime seam.
//!
//! Runtime callbacks (local ICE candidates, connection-state changes, remote
//! tracks) are not delivered through the trait. Each connection is handed a
//! [`MediaEventSender`] at creation and pushes [`MediaEvent`]s into it; the
//! session task drains the receiving end.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use huddle_shared::protocol::{IceCandidate, SessionDescription};
use huddle_shared::types::{MediaKind, ParticipantId, StreamKind, TrackId};
use huddle_shared::NegotiationError;

use crate::track::LocalTrack;

/// Opaque handle for one outbound sender on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplaceTrackError {
    /// The runtime cannot swap the track in place; the caller must remove,
    /// re-add and renegotiate.
    #[error("In-place track replacement unsupported")]
    Unsupported,

    #[error("Track replacement failed: {0}")]
    Rtc(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Inbound media from a remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub stream: StreamKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    RemoteTrack(RemoteTrack),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    Peer {
        participant_id: ParticipantId,
        event: PeerEvent,
    },
    /// A local track ended without the session asking for it.
    LocalTrackEnded { track_id: TrackId, kind: MediaKind },
}

pub type MediaEventSender = mpsc::UnboundedSender<MediaEvent>;
pub type MediaEventReceiver = mpsc::UnboundedReceiver<MediaEvent>;

pub fn media_channel() -> (MediaEventSender, MediaEventReceiver) {
    mpsc::unbounded_channel()
}

/// One negotiated connection to a remote participant.
#[async_trait]
pub trait RtcPeerConnection: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(&self, desc: &SessionDescription)
        -> Result<(), NegotiationError>;
    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError>;
    /// Withdraw the outstanding local offer, returning to the last stable
    /// state.
    async fn rollback(&self) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError>;
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, NegotiationError>;
    async fn replace_track(
        &self,
        sender: SenderId,
        track: &LocalTrack,
    ) -> Result<(), ReplaceTrackError>;
    async fn remove_track(&self, sender: SenderId) -> Result<(), NegotiationError>;
    /// Close the connection. Attached local tracks are left running.
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        participant_id: &ParticipantId,
        events: MediaEventSender,
    ) -> Result<Arc<dyn RtcPeerConnection>, NegotiationError>;
}
