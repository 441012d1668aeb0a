//! `webrtc-rs` backed peer connections.
//!
//! Every local track maps to one shared `TrackLocalStaticSample`, so the same
//! camera or microphone feeds all links without being duplicated. Outbound
//! tracks use the stream id `camera` or `screen`, which lets the receiving
//! side tell the two video sources apart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use huddle_shared::constants::DEFAULT_STUN_SERVERS;
use huddle_shared::protocol::{IceCandidate, SdpKind, SessionDescription};
use huddle_shared::types::{MediaKind, ParticipantId, StreamKind, TrackId};
use huddle_shared::NegotiationError;

use crate::rtc::{
    ConnectionState, MediaEvent, MediaEventSender, PeerConnectionFactory, PeerEvent, RemoteTrack,
    ReplaceTrackError, RtcPeerConnection, SenderId,
};
use crate::track::LocalTrack;

fn rtc_err(e: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::Rtc(e.to_string())
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        MediaKind::Video | MediaKind::Screen => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

fn stream_kind_of(kind: MediaKind) -> StreamKind {
    match kind {
        MediaKind::Screen => StreamKind::Screen,
        MediaKind::Audio | MediaKind::Video => StreamKind::Camera,
    }
}

/// Local track id → runtime track, shared by every connection of a factory.
#[derive(Default)]
struct SampleTracks {
    tracks: Mutex<HashMap<TrackId, (LocalTrack, Arc<TrackLocalStaticSample>)>>,
}

impl SampleTracks {
    fn get_or_create(&self, track: &LocalTrack) -> Result<Arc<TrackLocalStaticSample>, NegotiationError> {
        let mut tracks = self.tracks.lock().map_err(rtc_err)?;
        tracks.retain(|_, (local, _)| !local.is_ended());

        let entry = tracks.entry(track.id()).or_insert_with(|| {
            let sample = Arc::new(TrackLocalStaticSample::new(
                codec_for(track.kind()),
                track.id().to_string(),
                stream_kind_of(track.kind()).stream_label().to_owned(),
            ));
            (track.clone(), sample)
        });
        Ok(entry.1.clone())
    }

    /// Runtime track for a local track already attached somewhere.
    fn sample(&self, id: &TrackId) -> Option<Arc<TrackLocalStaticSample>> {
        self.tracks.lock().ok()?.get(id).map(|(_, s)| s.clone())
    }
}

pub struct WebRtcPeerFactory {
    api: API,
    ice_servers: Vec<String>,
    tracks: Arc<SampleTracks>,
}

impl WebRtcPeerFactory {
    /// Build the API with default codecs and interceptors. An empty
    /// `ice_servers` list falls back to public STUN servers.
    pub fn new(ice_servers: Vec<String>) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_err)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(rtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if ice_servers.is_empty() {
            DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
        } else {
            ice_servers
        };

        Ok(Self {
            api,
            ice_servers,
            tracks: Arc::new(SampleTracks::default()),
        })
    }

    /// Runtime track that carries samples for `track`, once attached to a
    /// link. Capture code writes encoded media into it.
    pub fn sample_track(&self, track: &LocalTrack) -> Option<Arc<TrackLocalStaticSample>> {
        self.tracks.sample(&track.id())
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        participant_id: &ParticipantId,
        events: MediaEventSender,
    ) -> Result<Arc<dyn RtcPeerConnection>, NegotiationError> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(rtc_err)?);
        install_callbacks(&pc, participant_id, events);

        Ok(Arc::new(WebRtcPeer {
            participant_id: participant_id.clone(),
            pc,
            tracks: self.tracks.clone(),
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(1),
        }))
    }
}

fn emit(events: &MediaEventSender, participant_id: &ParticipantId, event: PeerEvent) {
    let _ = events.send(MediaEvent::Peer {
        participant_id: participant_id.clone(),
        event,
    });
}

fn install_callbacks(pc: &RTCPeerConnection, participant_id: &ParticipantId, events: MediaEventSender) {
    let tx = events.clone();
    let peer = participant_id.clone();
    pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
        if let Some(candidate) = c {
            match candidate.to_json() {
                Ok(init) => emit(
                    &tx,
                    &peer,
                    PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                ),
                Err(e) => warn!(peer = %peer.short(), error = %e, "Unserializable local candidate"),
            }
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    let peer = participant_id.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        info!(peer = %peer.short(), state = %s, "Peer connection state changed");
        let state = match s {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        };
        emit(&tx, &peer, PeerEvent::StateChanged(state));
        Box::pin(async {})
    }));

    let tx = events;
    let peer = participant_id.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let stream = StreamKind::from_stream_label(&track.stream_id());
            let kind = match (track.kind(), stream) {
                (RTPCodecType::Audio, _) => MediaKind::Audio,
                (_, StreamKind::Screen) => MediaKind::Screen,
                _ => MediaKind::Video,
            };
            emit(
                &tx,
                &peer,
                PeerEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    kind,
                    stream,
                }),
            );
            Box::pin(async {})
        },
    ));
}

struct WebRtcPeer {
    participant_id: ParticipantId,
    pc: Arc<RTCPeerConnection>,
    tracks: Arc<SampleTracks>,
    senders: Mutex<HashMap<SenderId, Arc<RTCRtpSender>>>,
    next_sender: AtomicU64,
}

impl WebRtcPeer {
    fn sender(&self, id: SenderId) -> Option<Arc<RTCRtpSender>> {
        self.senders.lock().ok()?.get(&id).cloned()
    }
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    };
    parsed.map_err(|e| NegotiationError::MalformedDescription(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(NegotiationError::MalformedDescription(format!(
            "unexpected sdp type {other}"
        ))),
    }
}

#[async_trait]
impl RtcPeerConnection for WebRtcPeer {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, NegotiationError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await.map_err(rtc_err)?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_err)?;
        from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(rtc_err)
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(rtc_err)
    }

    async fn rollback(&self) -> Result<(), NegotiationError> {
        let Some(pending) = self.pc.pending_local_description().await else {
            return Ok(());
        };
        // The runtime parses the SDP even for a rollback, so reuse ours.
        let mut desc = RTCSessionDescription::default();
        desc.sdp_type = RTCSdpType::Rollback;
        desc.sdp = pending.sdp;
        self.pc.set_local_description(desc).await.map_err(rtc_err)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment.clone(),
            })
            .await
            .map_err(rtc_err)
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, NegotiationError> {
        let sample = self.tracks.get_or_create(track)?;
        let rtp_sender = self
            .pc
            .add_track(sample as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_err)?;

        // RTCP has to be read for interceptors such as NACK to run.
        let reader = rtp_sender.clone();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while reader.read(&mut rtcp_buf).await.is_ok() {}
        });

        let id = SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst));
        self.senders.lock().map_err(rtc_err)?.insert(id, rtp_sender);
        debug!(peer = %self.participant_id.short(), track = %track.id(), "Track added");
        Ok(id)
    }

    /// The sender keeps the stream id it was negotiated with, so a screen
    /// swapped in here still arrives labelled `camera` on the far side. The
    /// session announces the switch with `start-screen-share`.
    async fn replace_track(
        &self,
        sender: SenderId,
        track: &LocalTrack,
    ) -> Result<(), ReplaceTrackError> {
        let rtp_sender = self
            .sender(sender)
            .ok_or_else(|| ReplaceTrackError::Rtc(format!("unknown sender {}", sender.0)))?;
        let sample = self
            .tracks
            .get_or_create(track)
            .map_err(|e| ReplaceTrackError::Rtc(e.to_string()))?;
        rtp_sender
            .replace_track(Some(sample as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| ReplaceTrackError::Rtc(e.to_string()))
    }

    async fn remove_track(&self, sender: SenderId) -> Result<(), NegotiationError> {
        let rtp_sender = self.senders.lock().map_err(rtc_err)?.remove(&sender);
        match rtp_sender {
            Some(rtp_sender) => self.pc.remove_track(&rtp_sender).await.map_err(rtc_err),
            None => Ok(()),
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(peer = %self.participant_id.short(), error = %e, "Failed to close peer connection");
        }
        if let Ok(mut senders) = self.senders.lock() {
            senders.clear();
        }
    }
}
