//! The session client: lifecycle, roster, local media and one peer link per
//! remote participant.
//!
//! [`SessionClient`] is a plain `&mut self` state machine. It never spawns
//! its own event loop; inbound server events, runtime media events and
//! transport notifications are fed in through the three `handle_*` methods.
//! [`crate::handle::spawn_session`] wraps it in a task for concurrent use.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use huddle_media::{
    media_channel, ConnectionState, DeviceInfo, FailureAction, LinkState, LocalMediaState,
    LocalTrack, MediaConstraints, MediaDevices, MediaEvent, MediaEventReceiver, MediaEventSender,
    OutboundSlot, PeerConnectionFactory, PeerEvent, PeerLink, PeerRegistry, PeerRegistryError,
    ReplaceOutcome,
};
use huddle_net::{SignalingTransport, TransportNotification};
use huddle_shared::constants::{MAX_CHAT_MESSAGE_CHARS, MAX_MESH_PEERS};
use huddle_shared::models::{ChatMessage, Participant, Session, TranscriptSegment};
use huddle_shared::protocol::{
    ClientEvent, IceCandidate, OutgoingChat, ServerEvent, SessionDescription,
};
use huddle_shared::types::{MediaKind, ParticipantId, SessionId};
use huddle_shared::{
    DeviceSwitchError, MediaAccessError, SessionError, TransportError, ValidationError,
};

use crate::config::{LocalIdentity, MediaPreferences};
use crate::events::{EventBus, SessionEvent};
use crate::state::{Lifecycle, SessionSnapshot, SessionState};

/// Issued by [`SessionClient::begin_join`]; carries what the capture step
/// needs and the epoch the join belongs to.
#[derive(Debug, Clone)]
pub struct JoinTicket {
    pub epoch: u64,
    pub constraints: MediaConstraints,
}

/// Capture camera/microphone for a join. An empty request captures nothing.
pub async fn capture_media(
    devices: &dyn MediaDevices,
    constraints: &MediaConstraints,
) -> Result<Vec<LocalTrack>, MediaAccessError> {
    if constraints.is_empty() {
        return Ok(Vec::new());
    }
    devices.get_user_media(constraints).await
}

/// Capture a single replacement track from `device_id`.
pub async fn capture_device(
    devices: &dyn MediaDevices,
    kind: MediaKind,
    device_id: &str,
) -> Result<LocalTrack, MediaAccessError> {
    let constraints = match kind {
        MediaKind::Video => MediaConstraints::video_only(Some(device_id.to_string())),
        MediaKind::Audio => MediaConstraints::audio_only(Some(device_id.to_string())),
        MediaKind::Screen => return Err(MediaAccessError::Unsupported(kind)),
    };

    let mut wanted = None;
    for track in devices.get_user_media(&constraints).await? {
        if track.kind() == kind && wanted.is_none() {
            wanted = Some(track);
        } else {
            track.stop();
        }
    }
    wanted.ok_or_else(|| MediaAccessError::DeviceNotFound(device_id.to_string()))
}

pub struct SessionClient {
    identity: LocalIdentity,
    prefs: MediaPreferences,
    transport: Arc<dyn SignalingTransport>,
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn PeerConnectionFactory>,
    media_tx: MediaEventSender,
    bus: EventBus,

    lifecycle: Lifecycle,
    session_id: Option<SessionId>,
    password: Option<String>,
    state: SessionState,
    local: LocalMediaState,
    peers: PeerRegistry,
    /// Participants that left; their late signaling is dropped until they
    /// join again.
    departed: HashSet<ParticipantId>,
    /// Bumped on every join and teardown. Work started under an older epoch
    /// must not touch the current session.
    epoch: u64,
    last_error: Option<SessionError>,
}

impl SessionClient {
    /// Returns the client and the receiver for runtime media events, which
    /// the owner must drain into [`handle_media_event`](Self::handle_media_event).
    pub fn new(
        identity: LocalIdentity,
        prefs: MediaPreferences,
        transport: Arc<dyn SignalingTransport>,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> (Self, MediaEventReceiver) {
        let (media_tx, media_rx) = media_channel();
        let client = Self {
            identity,
            prefs,
            transport,
            devices,
            factory,
            media_tx,
            bus: EventBus::new(),
            lifecycle: Lifecycle::Idle,
            session_id: None,
            password: None,
            state: SessionState::default(),
            local: LocalMediaState::new(),
            peers: PeerRegistry::new(MAX_MESH_PEERS),
            departed: HashSet::new(),
            epoch: 0,
            last_error: None,
        };
        (client, media_rx)
    }

    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.peers = PeerRegistry::new(max_peers);
        self
    }

    /// Applies to the next join.
    pub fn set_media_preferences(&mut self, prefs: MediaPreferences) {
        self.prefs = prefs;
    }

    pub fn event_bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn devices(&self) -> Arc<dyn MediaDevices> {
        self.devices.clone()
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn session(&self) -> Option<&Session> {
        self.state.session.as_ref()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.state.roster.list()
    }

    pub fn self_participant(&self) -> Option<&Participant> {
        self.state
            .self_id
            .as_ref()
            .and_then(|id| self.state.roster.get(id))
    }

    pub fn peer(&self, id: &ParticipantId) -> Option<&PeerLink> {
        self.peers.get(id)
    }

    pub fn peers(&self) -> Vec<(ParticipantId, LinkState)> {
        self.peers.states()
    }

    pub fn local_media(&self) -> &LocalMediaState {
        &self.local
    }

    pub fn chat_log(&self) -> &[ChatMessage] {
        &self.state.chat
    }

    pub fn transcript(&self) -> &[TranscriptSegment] {
        &self.state.transcript
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    pub fn take_last_error(&mut self) -> Option<SessionError> {
        self.last_error.take()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            lifecycle: self.lifecycle,
            session: self.state.session.clone(),
            self_id: self.state.self_id.clone(),
            participants: self.state.roster.list(),
            peers: self.peers.states(),
            local_media: self.local.media_state(),
            chat: self.state.chat.clone(),
            recording: self.state.recording.clone(),
            transcript: self.state.transcript.clone(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        self.bus.emit(&event);
    }

    fn joined_session_id(&self) -> Result<SessionId, SessionError> {
        match (self.lifecycle, &self.session_id) {
            (Lifecycle::Joined, Some(id)) => Ok(id.clone()),
            _ => Err(SessionError::NotJoined),
        }
    }

    async fn send(&self, event: ClientEvent) -> Result<(), SessionError> {
        debug!(event = event.name(), "Sending signaling event");
        self.transport.send(event).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Join / leave
    // ------------------------------------------------------------------

    /// Join `session_id`. Resolves once `join-session` has been sent; the
    /// session is entered when the server's `session-joined` arrives through
    /// [`handle_server_event`](Self::handle_server_event).
    pub async fn join(
        &mut self,
        session_id: SessionId,
        password: Option<String>,
    ) -> Result<(), SessionError> {
        let ticket = self.begin_join(session_id, password)?;
        let captured = capture_media(self.devices.as_ref(), &ticket.constraints).await;
        self.continue_join(ticket.epoch, captured).await
    }

    /// Check preconditions and move to `joining`.
    pub fn begin_join(
        &mut self,
        session_id: SessionId,
        password: Option<String>,
    ) -> Result<JoinTicket, SessionError> {
        match self.lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Joined if self.session_id.as_ref() == Some(&session_id) => {
                return Err(SessionError::AlreadyJoined)
            }
            _ => return Err(SessionError::Busy),
        }
        if session_id.is_blank() {
            return Err(ValidationError::InvalidSessionId.into());
        }

        self.epoch += 1;
        self.lifecycle = Lifecycle::Joining;
        self.last_error = None;
        info!(session = %session_id, epoch = self.epoch, "Joining session");
        self.session_id = Some(session_id);
        self.password = password;

        Ok(JoinTicket {
            epoch: self.epoch,
            constraints: MediaConstraints {
                video: self.prefs.video,
                audio: self.prefs.audio,
                video_device: self.prefs.video_device.clone(),
                audio_device: self.prefs.audio_device.clone(),
            },
        })
    }

    /// Finish the client side of a join with the captured media: connect the
    /// transport and send `join-session`.
    pub async fn continue_join(
        &mut self,
        epoch: u64,
        captured: Result<Vec<LocalTrack>, MediaAccessError>,
    ) -> Result<(), SessionError> {
        if epoch != self.epoch || self.lifecycle != Lifecycle::Joining {
            if let Ok(tracks) = &captured {
                tracks.iter().for_each(LocalTrack::stop);
            }
            debug!(epoch, current = self.epoch, "Discarding capture for abandoned join");
            return Err(SessionError::Cancelled);
        }

        let tracks = match captured {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!(error = %e, "Local media unavailable");
                return Err(self.fail_join(e.into()));
            }
        };
        for track in &tracks {
            self.watch_track(track);
        }
        self.local = LocalMediaState::from_tracks(tracks);

        if let Err(e) = self.transport.connect().await {
            warn!(error = %e, "Signaling connect failed");
            return Err(self.fail_join(e.into()));
        }

        let Some(session_id) = self.session_id.clone() else {
            return Err(self.fail_join(SessionError::Cancelled));
        };
        let join = ClientEvent::JoinSession {
            session_id,
            password: self.password.clone(),
        };
        if let Err(e) = self.send(join).await {
            self.transport.close().await;
            return Err(self.fail_join(e));
        }
        Ok(())
    }

    fn fail_join(&mut self, err: SessionError) -> SessionError {
        self.local.release();
        self.session_id = None;
        self.password = None;
        self.lifecycle = Lifecycle::Idle;
        self.last_error = Some(err.clone());
        err
    }

    /// Leave the session. No-op when idle or already leaving.
    pub async fn leave(&mut self) -> Result<(), SessionError> {
        if matches!(self.lifecycle, Lifecycle::Idle | Lifecycle::Leaving) {
            return Ok(());
        }
        let was_joining = self.lifecycle == Lifecycle::Joining;
        self.lifecycle = Lifecycle::Leaving;
        info!(session = ?self.session_id, "Leaving session");

        self.teardown(true).await;
        if was_joining {
            self.last_error = Some(SessionError::Cancelled);
        }
        self.emit(SessionEvent::Left);
        Ok(())
    }

    async fn teardown(&mut self, notify_server: bool) {
        self.epoch += 1;
        for mut link in self.peers.drain() {
            link.close().await;
        }

        if notify_server {
            if let Some(session_id) = self.session_id.clone() {
                if let Err(e) = self.send(ClientEvent::LeaveSession { session_id }).await {
                    debug!(error = %e, "leave-session not delivered");
                }
            }
        }
        self.transport.close().await;

        self.local.release();
        self.state.clear();
        self.departed.clear();
        self.session_id = None;
        self.password = None;
        self.lifecycle = Lifecycle::Idle;
    }

    /// Server-driven end of the session: tear down without `leave-session`.
    async fn force_end(&mut self, error: SessionError) {
        warn!(error = %error, "Session ended remotely");
        self.teardown(false).await;
        self.last_error = Some(error);
    }

    async fn complete_join(&mut self, session: Session, participants: Vec<Participant>) {
        self.state.session = Some(session.clone());
        self.state.roster.replace_all(participants);
        self.state.self_id = self
            .state
            .roster
            .find_user(&self.identity.user_id)
            .map(|p| p.id.clone());
        if self.state.self_id.is_none() {
            warn!(user = %self.identity.user_id, "Own participant missing from roster");
        }
        self.departed.clear();
        self.lifecycle = Lifecycle::Joined;

        let remotes = self.state.roster.joined_remotes(self.state.self_id.as_ref());
        info!(
            session = %session.id,
            participants = self.state.roster.len(),
            remotes = remotes.len(),
            "Joined session"
        );
        for participant_id in remotes {
            if let Err(e) = self.connect_peer(&participant_id).await {
                warn!(peer = %participant_id.short(), error = %e, "Could not connect to peer");
            }
        }
        self.emit(SessionEvent::Joined { session });
    }

    /// Roster refresh after the transport reconnected.
    async fn resync(&mut self, session: Session, participants: Vec<Participant>) {
        let before: BTreeSet<ParticipantId> = self.state.roster.ids().into_iter().collect();

        self.state.session = Some(session);
        self.state.roster.replace_all(participants);
        if let Some(me) = self.state.roster.find_user(&self.identity.user_id) {
            self.state.self_id = Some(me.id.clone());
        }
        let after: BTreeSet<ParticipantId> = self.state.roster.ids().into_iter().collect();
        let remotes = self.state.roster.joined_remotes(self.state.self_id.as_ref());

        for participant_id in self.peers.ids() {
            if !remotes.contains(&participant_id) {
                self.close_link(&participant_id).await;
            }
        }
        for participant_id in &remotes {
            if !self.peers.contains(participant_id) {
                if let Err(e) = self.connect_peer(participant_id).await {
                    warn!(peer = %participant_id.short(), error = %e, "Could not connect to peer");
                }
            }
        }

        info!(
            left = before.difference(&after).count(),
            joined = after.difference(&before).count(),
            "Roster resynchronised"
        );
        for participant_id in before.difference(&after) {
            self.departed.insert(participant_id.clone());
            self.emit(SessionEvent::ParticipantLeft {
                participant_id: participant_id.clone(),
                reason: None,
            });
        }
        for participant_id in after.difference(&before) {
            if let Some(participant) = self.state.roster.get(participant_id).cloned() {
                self.emit(SessionEvent::ParticipantJoined { participant });
            }
        }
    }

    // ------------------------------------------------------------------
    // Peer links
    // ------------------------------------------------------------------

    async fn open_link(&mut self, participant_id: &ParticipantId) -> Result<(), SessionError> {
        if self.peers.contains(participant_id) {
            return Ok(());
        }
        if self.peers.len() >= self.peers.max_peers() {
            return Err(SessionError::PeerLimit(self.peers.max_peers()));
        }

        let mut link = PeerLink::open(
            participant_id.clone(),
            self.factory.as_ref(),
            self.media_tx.clone(),
        )
        .await?;
        link.attach(&self.local.outbound_tracks()).await?;

        self.peers.insert(link).map_err(|e| match e {
            PeerRegistryError::Full(max) => SessionError::PeerLimit(max),
            PeerRegistryError::AlreadyPresent(_) => SessionError::Busy,
        })
    }

    async fn offer_to(
        &mut self,
        participant_id: &ParticipantId,
        ice_restart: bool,
    ) -> Result<(), SessionError> {
        let session_id = self.joined_session_id()?;
        let Some(link) = self.peers.get_mut(participant_id) else {
            return Ok(());
        };
        let offer = link.create_offer(ice_restart).await?;
        self.send(ClientEvent::WebrtcOffer {
            session_id,
            offer,
            target_participant_id: participant_id.clone(),
        })
        .await
    }

    /// Open a link and send the initial offer.
    async fn connect_peer(&mut self, participant_id: &ParticipantId) -> Result<(), SessionError> {
        self.open_link(participant_id).await?;
        self.offer_to(participant_id, false).await
    }

    async fn close_link(&mut self, participant_id: &ParticipantId) {
        if let Some(mut link) = self.peers.remove(participant_id) {
            link.close().await;
            self.emit(SessionEvent::PeerStateChanged {
                participant_id: participant_id.clone(),
                state: LinkState::Closed,
            });
        }
    }

    /// Close the link and start over with a fresh one. The local side offers
    /// again only if it started the original negotiation.
    async fn replace_link(&mut self, participant_id: &ParticipantId) {
        let was_initiator = self
            .peers
            .get(participant_id)
            .is_some_and(PeerLink::is_initiator);
        self.close_link(participant_id).await;

        let present = self
            .state
            .roster
            .get(participant_id)
            .is_some_and(Participant::is_joined);
        if !present || self.departed.contains(participant_id) {
            return;
        }

        info!(peer = %participant_id.short(), reoffer = was_initiator, "Replacing peer link");
        let result = if was_initiator {
            self.connect_peer(participant_id).await
        } else {
            self.open_link(participant_id).await
        };
        match result {
            Ok(()) => self.emit(SessionEvent::PeerStateChanged {
                participant_id: participant_id.clone(),
                state: LinkState::New,
            }),
            Err(e) => warn!(peer = %participant_id.short(), error = %e, "Link replacement failed"),
        }
    }

    /// The side with the smaller participant id keeps its own offer.
    fn wins_glare(&self, remote: &ParticipantId) -> bool {
        self.state.self_id.as_ref().is_some_and(|me| me < remote)
    }

    /// Signaling from this participant should be processed.
    fn accepts_signaling_from(&self, from: &ParticipantId) -> bool {
        if self.lifecycle != Lifecycle::Joined {
            debug!(peer = %from.short(), lifecycle = %self.lifecycle, "Signaling outside session");
            return false;
        }
        if self.departed.contains(from) {
            debug!(peer = %from.short(), "Dropping signaling from departed participant");
            return false;
        }
        !self.state.is_self(from)
    }

    async fn on_remote_offer(&mut self, from: ParticipantId, offer: SessionDescription) {
        if !self.accepts_signaling_from(&from) {
            return;
        }

        let mut reoffer = false;
        if self.peers.get(&from).is_some_and(PeerLink::is_awaiting_answer) {
            if self.wins_glare(&from) {
                info!(peer = %from.short(), "Offer collision, keeping ours");
                return;
            }
            reoffer = self.yield_offer(&from).await;
        }

        if let Err(e) = self.open_link(&from).await {
            warn!(peer = %from.short(), error = %e, "Cannot accept offer");
            return;
        }
        let Ok(session_id) = self.joined_session_id() else {
            return;
        };
        let Some(link) = self.peers.get_mut(&from) else {
            return;
        };

        match link.accept_offer(&offer).await {
            Ok(answer) => {
                let event = ClientEvent::WebrtcAnswer {
                    session_id,
                    answer,
                    target_participant_id: from.clone(),
                };
                if let Err(e) = self.send(event).await {
                    warn!(peer = %from.short(), error = %e, "Failed to send answer");
                    return;
                }
                // Our withdrawn offer may have carried sender changes.
                if reoffer {
                    if let Err(e) = self.offer_to(&from, false).await {
                        warn!(peer = %from.short(), error = %e, "Re-offer after collision failed");
                    }
                }
            }
            Err(e) => {
                warn!(peer = %from.short(), error = %e, "Rejected remote offer");
                self.replace_link(&from).await;
            }
        }
    }

    /// Lose an offer collision. A link that never completed a negotiation
    /// is replaced; an established one rolls back its offer and stays up.
    /// Returns `true` when the rolled-back offer must be sent again.
    async fn yield_offer(&mut self, from: &ParticipantId) -> bool {
        let Some(link) = self.peers.get_mut(from) else {
            return false;
        };
        if !link.has_remote_description() {
            info!(peer = %from.short(), "Offer collision, yielding to remote");
            self.close_link(from).await;
            return false;
        }

        info!(peer = %from.short(), state = %link.state(), "Offer collision, rolling back ours");
        match link.rollback_offer().await {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %from.short(), error = %e, "Rollback failed, replacing link");
                self.close_link(from).await;
                false
            }
        }
    }

    async fn on_remote_answer(&mut self, from: ParticipantId, answer: SessionDescription) {
        if !self.accepts_signaling_from(&from) {
            return;
        }
        let Some(link) = self.peers.get_mut(&from) else {
            debug!(peer = %from.short(), "Answer for unknown peer");
            return;
        };
        if let Err(e) = link.accept_answer(&answer).await {
            warn!(peer = %from.short(), error = %e, "Rejected remote answer");
            self.replace_link(&from).await;
        }
    }

    async fn on_remote_candidate(&mut self, from: ParticipantId, candidate: IceCandidate) {
        if !self.accepts_signaling_from(&from) {
            return;
        }
        if let Err(e) = self.open_link(&from).await {
            warn!(peer = %from.short(), error = %e, "Dropping ICE candidate");
            return;
        }
        if let Some(link) = self.peers.get_mut(&from) {
            if let Err(e) = link.add_remote_candidate(candidate).await {
                warn!(peer = %from.short(), error = %e, "Failed to add ICE candidate");
            }
        }
    }

    /// Put `track` on every link's outbound path, renegotiating links that
    /// could not swap it in place.
    async fn route_outbound(&mut self, track: &LocalTrack) {
        let mut renegotiate = Vec::new();
        for participant_id in self.peers.ids() {
            let Some(link) = self.peers.get_mut(&participant_id) else {
                continue;
            };
            match link.replace_outbound(track).await {
                Ok(ReplaceOutcome::InPlace) => {}
                Ok(ReplaceOutcome::Renegotiate) => renegotiate.push(participant_id),
                Err(e) => {
                    warn!(peer = %participant_id.short(), error = %e, "Outbound track not replaced")
                }
            }
        }
        self.renegotiate(renegotiate).await;
    }

    async fn remove_outbound(&mut self, slot: OutboundSlot) {
        let mut renegotiate = Vec::new();
        for participant_id in self.peers.ids() {
            let Some(link) = self.peers.get_mut(&participant_id) else {
                continue;
            };
            match link.remove_outbound(slot).await {
                Ok(true) => renegotiate.push(participant_id),
                Ok(false) => {}
                Err(e) => {
                    warn!(peer = %participant_id.short(), error = %e, "Outbound track not removed")
                }
            }
        }
        self.renegotiate(renegotiate).await;
    }

    async fn renegotiate(&mut self, participants: Vec<ParticipantId>) {
        for participant_id in participants {
            if let Err(e) = self.offer_to(&participant_id, false).await {
                warn!(peer = %participant_id.short(), error = %e, "Renegotiation failed");
            }
        }
    }

    /// Report the track through the media channel once it ends.
    fn watch_track(&self, track: &LocalTrack) {
        let track = track.clone();
        let events = self.media_tx.clone();
        tokio::spawn(async move {
            track.ended().await;
            let _ = events.send(MediaEvent::LocalTrackEnded {
                track_id: track.id(),
                kind: track.kind(),
            });
        });
    }

    // ------------------------------------------------------------------
    // Local media
    // ------------------------------------------------------------------

    pub async fn toggle_video(&mut self) -> Result<bool, SessionError> {
        self.toggle(MediaKind::Video).await
    }

    pub async fn toggle_audio(&mut self) -> Result<bool, SessionError> {
        self.toggle(MediaKind::Audio).await
    }

    async fn toggle(&mut self, kind: MediaKind) -> Result<bool, SessionError> {
        let enabled = self
            .local
            .toggle(kind)
            .ok_or(SessionError::NoLocalTrack(kind))?;

        if let Ok(session_id) = self.joined_session_id() {
            let media = self.local.media_state();
            if let Some(me) = self.state.self_participant_mut() {
                me.media.video = media.video;
                me.media.audio = media.audio;
            }
            let event = ClientEvent::ToggleMedia {
                session_id,
                kind,
                enabled,
            };
            if let Err(e) = self.send(event).await {
                warn!(%kind, error = %e, "Media toggle not published");
            }
        }
        Ok(enabled)
    }

    pub async fn start_screen_share(&mut self) -> Result<(), SessionError> {
        let session_id = self.joined_session_id()?;
        if self.local.is_screen_sharing() {
            return Ok(());
        }

        let screen = self.devices.get_display_media().await?;
        info!(track = %screen.id(), "Screen share started");
        self.local.set_screen(Some(screen.clone()));
        self.route_outbound(&screen).await;
        self.watch_track(&screen);

        if let Some(me) = self.state.self_participant_mut() {
            me.media.screen_share = true;
        }
        if let Err(e) = self.send(ClientEvent::StartScreenShare { session_id }).await {
            warn!(error = %e, "Screen share start not published");
        }
        if let Some(participant_id) = self.state.self_id.clone() {
            self.emit(SessionEvent::ScreenShareStarted { participant_id });
        }
        Ok(())
    }

    pub async fn stop_screen_share(&mut self) -> Result<(), SessionError> {
        let Some(screen) = self.local.set_screen(None) else {
            return Ok(());
        };

        match self.local.camera().cloned() {
            Some(camera) => self.route_outbound(&camera).await,
            None => self.remove_outbound(OutboundSlot::Video).await,
        }
        screen.stop();
        info!(track = %screen.id(), "Screen share stopped");

        if let Some(me) = self.state.self_participant_mut() {
            me.media.screen_share = false;
        }
        if let Ok(session_id) = self.joined_session_id() {
            if let Err(e) = self.send(ClientEvent::StopScreenShare { session_id }).await {
                warn!(error = %e, "Screen share stop not published");
            }
        }
        if let Some(participant_id) = self.state.self_id.clone() {
            self.emit(SessionEvent::ScreenShareStopped { participant_id });
        }
        Ok(())
    }

    pub async fn set_video_device(&mut self, device_id: &str) -> Result<(), SessionError> {
        self.set_device(MediaKind::Video, device_id).await
    }

    pub async fn set_audio_device(&mut self, device_id: &str) -> Result<(), SessionError> {
        self.set_device(MediaKind::Audio, device_id).await
    }

    pub async fn set_device(&mut self, kind: MediaKind, device_id: &str) -> Result<(), SessionError> {
        let epoch = self.begin_device_switch(kind)?;
        let captured = capture_device(self.devices.as_ref(), kind, device_id).await;
        self.complete_device_switch(kind, epoch, captured).await
    }

    /// Returns the epoch the switch belongs to.
    pub fn begin_device_switch(&self, kind: MediaKind) -> Result<u64, SessionError> {
        if kind == MediaKind::Screen || self.local.track(kind).is_none() {
            return Err(DeviceSwitchError::NoLocalTrack(kind).into());
        }
        Ok(self.epoch)
    }

    pub async fn complete_device_switch(
        &mut self,
        kind: MediaKind,
        epoch: u64,
        captured: Result<LocalTrack, MediaAccessError>,
    ) -> Result<(), SessionError> {
        let track = captured.map_err(|e| {
            warn!(%kind, error = %e, "Device switch failed");
            SessionError::DeviceSwitch(e.into())
        })?;

        if epoch != self.epoch {
            debug!(%kind, epoch, current = self.epoch, "Device switch outlived its session");
            track.stop();
            return Err(SessionError::Cancelled);
        }
        let Some(old) = self.local.track(kind).cloned() else {
            track.stop();
            return Err(DeviceSwitchError::NoLocalTrack(kind).into());
        };

        track.set_enabled(old.is_enabled());
        self.local.replace(track.clone());
        if kind == MediaKind::Audio || !self.local.is_screen_sharing() {
            self.route_outbound(&track).await;
        }
        old.stop();
        self.watch_track(&track);

        let device_id = track.device_id().unwrap_or_default().to_string();
        info!(%kind, device = %device_id, "Input device switched");
        self.emit(SessionEvent::DeviceChanged { kind, device_id });
        Ok(())
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>, SessionError> {
        Ok(self.devices.enumerate_devices().await?)
    }

    // ------------------------------------------------------------------
    // Chat and hand raising
    // ------------------------------------------------------------------

    pub async fn send_chat_message(
        &mut self,
        content: &str,
        private: bool,
        recipient_id: Option<ParticipantId>,
    ) -> Result<(), SessionError> {
        let session_id = self.joined_session_id()?;
        if self
            .state
            .session
            .as_ref()
            .is_some_and(|s| !s.settings.chat_enabled)
        {
            return Err(SessionError::ChatDisabled);
        }
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        if content.chars().count() > MAX_CHAT_MESSAGE_CHARS {
            return Err(ValidationError::MessageTooLong {
                max: MAX_CHAT_MESSAGE_CHARS,
            }
            .into());
        }
        if private && recipient_id.is_none() {
            return Err(ValidationError::MissingRecipient.into());
        }

        self.send(ClientEvent::SendChat {
            session_id,
            message: OutgoingChat {
                content: content.to_string(),
                is_private: private,
                recipient_id: if private { recipient_id } else { None },
            },
        })
        .await
    }

    pub async fn raise_hand(&mut self) -> Result<(), SessionError> {
        self.set_hand(true).await
    }

    pub async fn lower_hand(&mut self) -> Result<(), SessionError> {
        self.set_hand(false).await
    }

    async fn set_hand(&mut self, raised: bool) -> Result<(), SessionError> {
        let session_id = self.joined_session_id()?;
        let event = if raised {
            ClientEvent::RaiseHand { session_id }
        } else {
            ClientEvent::LowerHand { session_id }
        };
        self.send(event).await?;
        if let Some(me) = self.state.self_participant_mut() {
            me.hand_raised = raised;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    pub async fn handle_server_event(&mut self, event: ServerEvent) {
        debug!(lifecycle = %self.lifecycle, "Server event: {}", server_event_name(&event));
        if matches!(self.lifecycle, Lifecycle::Idle | Lifecycle::Leaving) {
            return;
        }

        match event {
            ServerEvent::SessionJoined {
                session,
                participants,
            } => match self.lifecycle {
                Lifecycle::Joining => self.complete_join(session, participants).await,
                _ => self.resync(session, participants).await,
            },

            ServerEvent::ParticipantJoined { participant } => {
                self.on_participant_joined(participant).await
            }

            ServerEvent::ParticipantLeft {
                participant_id,
                reason,
            } => self.on_participant_left(participant_id, reason).await,

            ServerEvent::ParticipantUpdated { participant } => {
                self.on_participant_updated(participant).await
            }

            ServerEvent::MediaStateChanged {
                participant_id,
                media_state,
            } => {
                if let Some(p) = self.state.roster.get_mut(&participant_id) {
                    p.media = media_state;
                }
                self.emit(SessionEvent::MediaStateChanged {
                    participant_id,
                    media_state,
                });
            }

            ServerEvent::ChatMessage { message } => {
                self.state.chat.push(message.clone());
                self.emit(SessionEvent::ChatMessage { message });
            }

            ServerEvent::WebrtcOfferReceived { offer, from_id } => {
                self.on_remote_offer(from_id, offer).await
            }
            ServerEvent::WebrtcAnswerReceived { answer, from_id } => {
                self.on_remote_answer(from_id, answer).await
            }
            ServerEvent::IceCandidateReceived { candidate, from_id } => {
                self.on_remote_candidate(from_id, candidate).await
            }

            ServerEvent::ScreenShareStarted { participant_id } => {
                if let Some(p) = self.state.roster.get_mut(&participant_id) {
                    p.media.screen_share = true;
                }
                self.relabel_remote_video(&participant_id, true);
                self.emit(SessionEvent::ScreenShareStarted { participant_id });
            }
            ServerEvent::ScreenShareStopped { participant_id } => {
                if let Some(p) = self.state.roster.get_mut(&participant_id) {
                    p.media.screen_share = false;
                }
                self.relabel_remote_video(&participant_id, false);
                self.emit(SessionEvent::ScreenShareStopped { participant_id });
            }

            ServerEvent::HandRaised { participant_id } => {
                if let Some(p) = self.state.roster.get_mut(&participant_id) {
                    p.hand_raised = true;
                }
                self.emit(SessionEvent::HandRaised { participant_id });
            }
            ServerEvent::HandLowered { participant_id } => {
                if let Some(p) = self.state.roster.get_mut(&participant_id) {
                    p.hand_raised = false;
                }
                self.emit(SessionEvent::HandLowered { participant_id });
            }

            ServerEvent::RecordingStarted { recording_url } => {
                info!(url = ?recording_url, "Recording started");
                self.state.recording.active = true;
                self.state.recording.url = recording_url.clone();
                self.emit(SessionEvent::RecordingStarted { url: recording_url });
            }
            ServerEvent::RecordingStopped { recording_url } => {
                info!(url = ?recording_url, "Recording stopped");
                self.state.recording.active = false;
                if recording_url.is_some() {
                    self.state.recording.url = recording_url.clone();
                }
                self.emit(SessionEvent::RecordingStopped { url: recording_url });
            }

            ServerEvent::TranscriptionUpdate { transcript } => {
                self.state.push_transcript(transcript.clone());
                self.emit(SessionEvent::Transcription {
                    segment: transcript,
                });
            }

            ServerEvent::SessionEnded { reason } => {
                self.force_end(SessionError::SessionEnded(reason.clone()))
                    .await;
                self.emit(SessionEvent::SessionEnded { reason });
            }

            ServerEvent::Error { message } => {
                warn!(message = %message, "Server reported an error");
                if self.lifecycle == Lifecycle::Joining {
                    self.teardown(false).await;
                    self.last_error = Some(SessionError::Server(message.clone()));
                }
                self.emit(SessionEvent::Error { message });
            }
        }
    }

    fn relabel_remote_video(&mut self, participant_id: &ParticipantId, screen: bool) {
        let Some(link) = self.peers.get_mut(participant_id) else {
            return;
        };
        if let Some(track) = link.set_remote_screen_share(screen) {
            debug!(peer = %participant_id.short(), stream = ?track.stream, "Remote video reclassified");
            self.emit(SessionEvent::RemoteTrack {
                participant_id: participant_id.clone(),
                track,
            });
        }
    }

    async fn on_participant_joined(&mut self, participant: Participant) {
        let participant_id = participant.id.clone();
        let is_self = self.state.is_self(&participant_id);
        let joined = participant.is_joined();
        debug!(peer = %participant_id.short(), is_self, "Participant joined");

        self.departed.remove(&participant_id);
        self.state.roster.upsert(participant.clone());

        if self.lifecycle == Lifecycle::Joined && joined && !is_self {
            if let Err(e) = self.open_link(&participant_id).await {
                warn!(peer = %participant_id.short(), error = %e, "Could not prepare peer link");
            }
        }
        self.emit(SessionEvent::ParticipantJoined { participant });
    }

    async fn on_participant_left(&mut self, participant_id: ParticipantId, reason: Option<String>) {
        if self.state.is_self(&participant_id) {
            let reason = reason.unwrap_or_else(|| "removed from session".to_string());
            self.force_end(SessionError::SessionEnded(reason.clone()))
                .await;
            self.emit(SessionEvent::SessionEnded { reason });
            return;
        }

        info!(peer = %participant_id.short(), reason = ?reason, "Participant left");
        self.state.roster.remove(&participant_id);
        self.close_link(&participant_id).await;
        self.departed.insert(participant_id.clone());
        self.emit(SessionEvent::ParticipantLeft {
            participant_id,
            reason,
        });
    }

    async fn on_participant_updated(&mut self, participant: Participant) {
        let participant_id = participant.id.clone();
        let joined = participant.is_joined();
        self.state.roster.upsert(participant.clone());

        if !self.state.is_self(&participant_id) && self.lifecycle == Lifecycle::Joined {
            if joined {
                self.departed.remove(&participant_id);
                if let Err(e) = self.open_link(&participant_id).await {
                    warn!(peer = %participant_id.short(), error = %e, "Could not prepare peer link");
                }
            } else {
                self.close_link(&participant_id).await;
            }
        }
        self.emit(SessionEvent::ParticipantUpdated { participant });
    }

    pub async fn handle_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::Peer {
                participant_id,
                event,
            } => self.on_peer_event(participant_id, event).await,

            MediaEvent::LocalTrackEnded { track_id, kind } => {
                if self.local.screen().is_some_and(|t| t.id() == track_id) {
                    info!("Screen capture ended by the system");
                    if let Err(e) = self.stop_screen_share().await {
                        warn!(error = %e, "Failed to stop screen share");
                    }
                } else if self.local.track(kind).is_some_and(|t| t.id() == track_id) {
                    warn!(%kind, track = %track_id, "Local capture ended unexpectedly");
                    self.emit(SessionEvent::Error {
                        message: format!("local {kind} capture ended"),
                    });
                } else {
                    debug!(%kind, track = %track_id, "Released track ended");
                }
            }
        }
    }

    async fn on_peer_event(&mut self, participant_id: ParticipantId, event: PeerEvent) {
        if !self.peers.contains(&participant_id) {
            debug!(peer = %participant_id.short(), "Event for closed link");
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let Ok(session_id) = self.joined_session_id() else {
                    return;
                };
                let event = ClientEvent::IceCandidate {
                    session_id,
                    candidate,
                    target_participant_id: participant_id.clone(),
                };
                if let Err(e) = self.send(event).await {
                    warn!(peer = %participant_id.short(), error = %e, "Failed to relay candidate");
                }
            }

            // Links are only closed by the session; a runtime close belongs to
            // a connection that has already been discarded.
            PeerEvent::StateChanged(ConnectionState::Closed) => {}

            PeerEvent::StateChanged(state) => {
                let Some(link) = self.peers.get_mut(&participant_id) else {
                    return;
                };
                let before = link.state();
                let action = link.on_connection_state(state);
                let after = link.state();

                if before != after {
                    self.emit(SessionEvent::PeerStateChanged {
                        participant_id: participant_id.clone(),
                        state: after,
                    });
                }
                match action {
                    Some(FailureAction::RestartIce) => {
                        if let Err(e) = self.offer_to(&participant_id, true).await {
                            warn!(peer = %participant_id.short(), error = %e, "ICE restart failed");
                        }
                    }
                    Some(FailureAction::Replace) => self.replace_link(&participant_id).await,
                    None => {}
                }
            }

            PeerEvent::RemoteTrack(track) => {
                if let Some(link) = self.peers.get_mut(&participant_id) {
                    link.record_remote_track(track.clone());
                }
                self.emit(SessionEvent::RemoteTrack {
                    participant_id,
                    track,
                });
            }
        }
    }

    pub async fn handle_transport_notification(&mut self, notification: TransportNotification) {
        match notification {
            TransportNotification::Connected => debug!("Signaling connected"),
            TransportNotification::Event(event) => self.handle_server_event(event).await,
            TransportNotification::Reconnecting { attempt, delay } => {
                info!(attempt, delay_ms = delay.as_millis() as u64, "Signaling reconnecting");
                self.emit(SessionEvent::Reconnecting { attempt, delay });
            }
            TransportNotification::Reconnected => {
                info!("Signaling reconnected, resynchronising");
                if matches!(self.lifecycle, Lifecycle::Joining | Lifecycle::Joined) {
                    if let Some(session_id) = self.session_id.clone() {
                        let join = ClientEvent::JoinSession {
                            session_id,
                            password: self.password.clone(),
                        };
                        if let Err(e) = self.send(join).await {
                            warn!(error = %e, "Rejoin after reconnect failed");
                        }
                    }
                }
                self.emit(SessionEvent::Reconnected);
            }
            TransportNotification::Lost { reason } => self.on_transport_lost(reason).await,
        }
    }

    async fn on_transport_lost(&mut self, reason: TransportError) {
        if matches!(self.lifecycle, Lifecycle::Idle | Lifecycle::Leaving) {
            debug!(error = %reason, "Transport lost while not in a session");
            return;
        }
        self.force_end(reason.clone().into()).await;
        self.emit(SessionEvent::SessionLost {
            reason: reason.to_string(),
        });
    }
}

fn server_event_name(event: &ServerEvent) -> &'static str {
    match event {
        ServerEvent::SessionJoined { .. } => "session-joined",
        ServerEvent::ParticipantJoined { .. } => "participant-joined",
        ServerEvent::ParticipantLeft { .. } => "participant-left",
        ServerEvent::ParticipantUpdated { .. } => "participant-updated",
        ServerEvent::MediaStateChanged { .. } => "media-state-changed",
        ServerEvent::ChatMessage { .. } => "chat-message",
        ServerEvent::WebrtcOfferReceived { .. } => "webrtc-offer-received",
        ServerEvent::WebrtcAnswerReceived { .. } => "webrtc-answer-received",
        ServerEvent::IceCandidateReceived { .. } => "ice-candidate-received",
        ServerEvent::ScreenShareStarted { .. } => "screen-share-started",
        ServerEvent::ScreenShareStopped { .. } => "screen-share-stopped",
        ServerEvent::HandRaised { .. } => "hand-raised",
        ServerEvent::HandLowered { .. } => "hand-lowered",
        ServerEvent::RecordingStarted { .. } => "recording-started",
        ServerEvent::RecordingStopped { .. } => "recording-stopped",
        ServerEvent::TranscriptionUpdate { .. } => "transcription-update",
        ServerEvent::SessionEnded { .. } => "session-ended",
        ServerEvent::Error { .. } => "error",
    }
}
