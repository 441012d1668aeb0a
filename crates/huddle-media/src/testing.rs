//! Deterministic capture and peer-connection doubles.
//!
//! [`FakeDevices`] hands out real [`LocalTrack`]s without touching hardware
//! and can deny permissions, pause captures or refuse display capture.
//! [`FakeFactory`] builds [`FakeConnection`]s that record every call made by
//! a peer link and let the test inject runtime callbacks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use huddle_shared::protocol::{IceCandidate, SdpKind, SessionDescription};
use huddle_shared::types::{DeviceKind, MediaKind, ParticipantId, TrackId};
use huddle_shared::{MediaAccessError, NegotiationError};

use crate::devices::{DeviceInfo, MediaConstraints, MediaDevices};
use crate::rtc::{
    MediaEvent, MediaEventSender, PeerConnectionFactory, PeerEvent, ReplaceTrackError,
    RtcPeerConnection, SenderId,
};
use crate::track::LocalTrack;

pub struct FakeDevices {
    devices: Mutex<Vec<DeviceInfo>>,
    denied: Mutex<HashSet<MediaKind>>,
    display_supported: AtomicBool,
    paused: watch::Sender<bool>,
    issued: Mutex<Vec<LocalTrack>>,
}

impl Default for FakeDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDevices {
    /// Two cameras (`cam-0`, `cam-1`) and two microphones (`mic-0`, `mic-1`);
    /// the first of each kind is the default.
    pub fn new() -> Self {
        let device = |id: &str, label: &str, kind, is_default| DeviceInfo {
            id: id.to_string(),
            label: label.to_string(),
            kind,
            is_default,
        };
        let (paused, _) = watch::channel(false);
        Self {
            devices: Mutex::new(vec![
                device("cam-0", "Built-in camera", DeviceKind::VideoInput, true),
                device("cam-1", "USB camera", DeviceKind::VideoInput, false),
                device("mic-0", "Built-in microphone", DeviceKind::AudioInput, true),
                device("mic-1", "Headset", DeviceKind::AudioInput, false),
            ]),
            denied: Mutex::new(HashSet::new()),
            display_supported: AtomicBool::new(true),
            paused,
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn deny(&self, kind: MediaKind) {
        if let Ok(mut denied) = self.denied.lock() {
            denied.insert(kind);
        }
    }

    pub fn allow(&self, kind: MediaKind) {
        if let Ok(mut denied) = self.denied.lock() {
            denied.remove(&kind);
        }
    }

    pub fn set_display_supported(&self, supported: bool) {
        self.display_supported.store(supported, Ordering::SeqCst);
    }

    /// Hold every capture until [`resume`](Self::resume) is called.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Every track handed out so far, in order.
    pub fn issued(&self) -> Vec<LocalTrack> {
        self.issued.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn live_tracks(&self) -> usize {
        self.issued().iter().filter(|t| !t.is_ended()).count()
    }

    fn is_denied(&self, kind: MediaKind) -> bool {
        self.denied
            .lock()
            .map(|d| d.contains(&kind))
            .unwrap_or(false)
    }

    fn resolve(&self, kind: DeviceKind, requested: Option<&str>) -> Result<DeviceInfo, MediaAccessError> {
        let devices = self.devices.lock().map(|d| d.clone()).unwrap_or_default();
        let found = match requested {
            Some(id) => devices.into_iter().find(|d| d.kind == kind && d.id == id),
            None => devices.into_iter().find(|d| d.kind == kind && d.is_default),
        };
        found.ok_or_else(|| {
            MediaAccessError::DeviceNotFound(requested.unwrap_or("default").to_string())
        })
    }

    async fn wait_unpaused(&self) {
        let mut rx = self.paused.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }

    fn issue(&self, track: LocalTrack) -> LocalTrack {
        if let Ok(mut issued) = self.issued.lock() {
            issued.push(track.clone());
        }
        track
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaAccessError> {
        Ok(self.devices.lock().map(|d| d.clone()).unwrap_or_default())
    }

    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<LocalTrack>, MediaAccessError> {
        self.wait_unpaused().await;

        let mut plan = Vec::new();
        if constraints.video {
            if self.is_denied(MediaKind::Video) {
                return Err(MediaAccessError::PermissionDenied(MediaKind::Video));
            }
            let device = self.resolve(DeviceKind::VideoInput, constraints.video_device.as_deref())?;
            plan.push((MediaKind::Video, device));
        }
        if constraints.audio {
            if self.is_denied(MediaKind::Audio) {
                return Err(MediaAccessError::PermissionDenied(MediaKind::Audio));
            }
            let device = self.resolve(DeviceKind::AudioInput, constraints.audio_device.as_deref())?;
            plan.push((MediaKind::Audio, device));
        }

        Ok(plan
            .into_iter()
            .map(|(kind, device)| self.issue(LocalTrack::new(kind, Some(device.id), device.label)))
            .collect())
    }

    async fn get_display_media(&self) -> Result<LocalTrack, MediaAccessError> {
        self.wait_unpaused().await;
        if !self.display_supported.load(Ordering::SeqCst) {
            return Err(MediaAccessError::Unsupported(MediaKind::Screen));
        }
        if self.is_denied(MediaKind::Screen) {
            return Err(MediaAccessError::PermissionDenied(MediaKind::Screen));
        }
        Ok(self.issue(LocalTrack::new(MediaKind::Screen, None, "Entire screen")))
    }
}

/// Snapshot of everything a [`FakeConnection`] was asked to do.
#[derive(Debug, Clone, Default)]
pub struct ConnectionLog {
    pub offers: Vec<SessionDescription>,
    pub ice_restarts: usize,
    pub rollbacks: usize,
    pub answers: Vec<SessionDescription>,
    pub local_descriptions: Vec<SessionDescription>,
    pub remote_descriptions: Vec<SessionDescription>,
    pub candidates: Vec<IceCandidate>,
    pub senders: HashMap<SenderId, TrackId>,
    pub added: Vec<TrackId>,
    pub replaced: Vec<(SenderId, TrackId)>,
    pub removed: Vec<SenderId>,
    pub closed: bool,
}

pub struct FakeConnection {
    participant_id: ParticipantId,
    events: MediaEventSender,
    supports_replace: bool,
    next_sender: AtomicU64,
    log: Mutex<ConnectionLog>,
}

impl FakeConnection {
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn log(&self) -> ConnectionLog {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Deliver a runtime callback as the real runtime would.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(MediaEvent::Peer {
            participant_id: self.participant_id.clone(),
            event,
        });
    }

    /// Track currently attached to each sender.
    pub fn outbound_tracks(&self) -> Vec<TrackId> {
        self.log().senders.values().copied().collect()
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut ConnectionLog) -> T) -> Result<T, NegotiationError> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| NegotiationError::Rtc("log poisoned".into()))?;
        if log.closed {
            return Err(NegotiationError::LinkClosed);
        }
        Ok(f(&mut log))
    }
}

#[async_trait]
impl RtcPeerConnection for FakeConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        let participant = self.participant_id.clone();
        self.with_log(|log| {
            let mut sdp = format!("v=0 offer {} #{}", participant, log.offers.len() + 1);
            if ice_restart {
                sdp.push_str(" ice-restart");
                log.ice_restarts += 1;
            }
            let offer = SessionDescription::offer(sdp);
            log.offers.push(offer.clone());
            offer
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let participant = self.participant_id.clone();
        self.with_log(|log| {
            if !matches!(log.remote_descriptions.last(), Some(d) if d.kind == SdpKind::Offer) {
                return Err(NegotiationError::Rtc("no remote offer to answer".into()));
            }
            let answer =
                SessionDescription::answer(format!("v=0 answer {} #{}", participant, log.answers.len() + 1));
            log.answers.push(answer.clone());
            Ok(answer)
        })?
    }

    async fn set_local_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.with_log(|log| log.local_descriptions.push(desc.clone()))
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        if !desc.sdp.starts_with("v=0") {
            return Err(NegotiationError::MalformedDescription(desc.sdp.clone()));
        }
        self.with_log(|log| log.remote_descriptions.push(desc.clone()))
    }

    async fn rollback(&self) -> Result<(), NegotiationError> {
        self.with_log(|log| log.rollbacks += 1)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        self.with_log(|log| {
            if log.remote_descriptions.is_empty() {
                return Err(NegotiationError::Rtc("remote description not set".into()));
            }
            log.candidates.push(candidate.clone());
            Ok(())
        })?
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, NegotiationError> {
        let sender = SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst));
        let track_id = track.id();
        self.with_log(|log| {
            log.senders.insert(sender, track_id);
            log.added.push(track_id);
        })?;
        Ok(sender)
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: &LocalTrack,
    ) -> Result<(), ReplaceTrackError> {
        if !self.supports_replace {
            return Err(ReplaceTrackError::Unsupported);
        }
        let track_id = track.id();
        self.with_log(|log| {
            if !log.senders.contains_key(&sender) {
                return Err(ReplaceTrackError::Rtc(format!("unknown sender {}", sender.0)));
            }
            log.senders.insert(sender, track_id);
            log.replaced.push((sender, track_id));
            Ok(())
        })
        .map_err(|e| ReplaceTrackError::Rtc(e.to_string()))?
    }

    async fn remove_track(&self, sender: SenderId) -> Result<(), NegotiationError> {
        self.with_log(|log| {
            log.senders.remove(&sender);
            log.removed.push(sender);
        })
    }

    async fn close(&self) {
        if let Ok(mut log) = self.log.lock() {
            log.closed = true;
        }
    }
}

pub struct FakeFactory {
    supports_replace: AtomicBool,
    fail_create: AtomicBool,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl Default for FakeFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeFactory {
    pub fn new() -> Self {
        Self {
            supports_replace: AtomicBool::new(true),
            fail_create: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Connections created from now on report in-place replacement as
    /// unsupported.
    pub fn set_supports_replace(&self, supported: bool) {
        self.supports_replace.store(supported, Ordering::SeqCst);
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn connections_for(&self, participant_id: &ParticipantId) -> Vec<Arc<FakeConnection>> {
        self.connections()
            .into_iter()
            .filter(|c| c.participant_id() == participant_id)
            .collect()
    }

    /// Most recently created connection for a participant.
    pub fn latest(&self, participant_id: &ParticipantId) -> Option<Arc<FakeConnection>> {
        self.connections_for(participant_id).pop()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(
        &self,
        participant_id: &ParticipantId,
        events: MediaEventSender,
    ) -> Result<Arc<dyn RtcPeerConnection>, NegotiationError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(NegotiationError::Rtc("factory refused".into()));
        }
        let connection = Arc::new(FakeConnection {
            participant_id: participant_id.clone(),
            events,
            supports_replace: self.supports_replace.load(Ordering::SeqCst),
            next_sender: AtomicU64::new(1),
            log: Mutex::new(ConnectionLog::default()),
        });
        if let Ok(mut connections) = self.connections.lock() {
            connections.push(connection.clone());
        }
        Ok(connection)
    }
}
