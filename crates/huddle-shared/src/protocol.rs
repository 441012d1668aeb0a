use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, MediaState, Participant, Session, TranscriptSegment};
use crate::types::{MediaKind, ParticipantId, SessionId};

/// SDP offer or answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Chat payload as sent by the client. The server assigns id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingChat {
    pub content: String,
    pub is_private: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<ParticipantId>,
}

/// Where a signaling message is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addressee {
    /// Broadcast to everyone in the session (and the server roster).
    Session,
    /// Relayed to exactly one participant.
    Peer(ParticipantId),
}

/// Events emitted by the client on the signaling channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    JoinSession {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    LeaveSession {
        session_id: SessionId,
    },
    ToggleMedia {
        session_id: SessionId,
        kind: MediaKind,
        enabled: bool,
    },
    StartScreenShare {
        session_id: SessionId,
    },
    StopScreenShare {
        session_id: SessionId,
    },
    SendChat {
        session_id: SessionId,
        message: OutgoingChat,
    },
    WebrtcOffer {
        session_id: SessionId,
        offer: SessionDescription,
        target_participant_id: ParticipantId,
    },
    WebrtcAnswer {
        session_id: SessionId,
        answer: SessionDescription,
        target_participant_id: ParticipantId,
    },
    IceCandidate {
        session_id: SessionId,
        candidate: IceCandidate,
        target_participant_id: ParticipantId,
    },
    RaiseHand {
        session_id: SessionId,
    },
    LowerHand {
        session_id: SessionId,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinSession { .. } => "join-session",
            Self::LeaveSession { .. } => "leave-session",
            Self::ToggleMedia { .. } => "toggle-media",
            Self::StartScreenShare { .. } => "start-screen-share",
            Self::StopScreenShare { .. } => "stop-screen-share",
            Self::SendChat { .. } => "send-chat",
            Self::WebrtcOffer { .. } => "webrtc-offer",
            Self::WebrtcAnswer { .. } => "webrtc-answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::RaiseHand { .. } => "raise-hand",
            Self::LowerHand { .. } => "lower-hand",
        }
    }

    pub fn addressee(&self) -> Addressee {
        match self {
            Self::WebrtcOffer {
                target_participant_id,
                ..
            }
            | Self::WebrtcAnswer {
                target_participant_id,
                ..
            }
            | Self::IceCandidate {
                target_participant_id,
                ..
            } => Addressee::Peer(target_participant_id.clone()),
            Self::SendChat { message, .. } => match (&message.recipient_id, message.is_private) {
                (Some(recipient), true) => Addressee::Peer(recipient.clone()),
                _ => Addressee::Session,
            },
            _ => Addressee::Session,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

/// Events pushed by the session server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    SessionJoined {
        session: Session,
        participants: Vec<Participant>,
    },
    ParticipantJoined {
        participant: Participant,
    },
    ParticipantLeft {
        participant_id: ParticipantId,
        #[serde(default)]
        reason: Option<String>,
    },
    ParticipantUpdated {
        participant: Participant,
    },
    MediaStateChanged {
        participant_id: ParticipantId,
        media_state: MediaState,
    },
    ChatMessage {
        message: ChatMessage,
    },
    WebrtcOfferReceived {
        offer: SessionDescription,
        from_id: ParticipantId,
    },
    WebrtcAnswerReceived {
        answer: SessionDescription,
        from_id: ParticipantId,
    },
    IceCandidateReceived {
        candidate: IceCandidate,
        from_id: ParticipantId,
    },
    ScreenShareStarted {
        participant_id: ParticipantId,
    },
    ScreenShareStopped {
        participant_id: ParticipantId,
    },
    HandRaised {
        participant_id: ParticipantId,
    },
    HandLowered {
        participant_id: ParticipantId,
    },
    RecordingStarted {
        #[serde(default)]
        recording_url: Option<String>,
    },
    RecordingStopped {
        #[serde(default)]
        recording_url: Option<String>,
    },
    TranscriptionUpdate {
        transcript: TranscriptSegment,
    },
    SessionEnded {
        reason: String,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionJoined { .. } => "session-joined",
            Self::ParticipantJoined { .. } => "participant-joined",
            Self::ParticipantLeft { .. } => "participant-left",
            Self::ParticipantUpdated { .. } => "participant-updated",
            Self::MediaStateChanged { .. } => "media-state-changed",
            Self::ChatMessage { .. } => "chat-message",
            Self::WebrtcOfferReceived { .. } => "webrtc-offer-received",
            Self::WebrtcAnswerReceived { .. } => "webrtc-answer-received",
            Self::IceCandidateReceived { .. } => "ice-candidate-received",
            Self::ScreenShareStarted { .. } => "screen-share-started",
            Self::ScreenShareStopped { .. } => "screen-share-stopped",
            Self::HandRaised { .. } => "hand-raised",
            Self::HandLowered { .. } => "hand-lowered",
            Self::RecordingStarted { .. } => "recording-started",
            Self::RecordingStopped { .. } => "recording-stopped",
            Self::TranscriptionUpdate { .. } => "transcription-update",
            Self::SessionEnded { .. } => "session-ended",
            Self::Error { .. } => "error",
        }
    }

    /// Remote participant a negotiation message came from, if any.
    pub fn signaling_source(&self) -> Option<&ParticipantId> {
        match self {
            Self::WebrtcOfferReceived { from_id, .. }
            | Self::WebrtcAnswerReceived { from_id, .. }
            | Self::IceCandidateReceived { from_id, .. } => Some(from_id),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_wire_shape() {
        let event = ClientEvent::WebrtcOffer {
            session_id: SessionId::new("m1"),
            offer: SessionDescription::offer("v=0"),
            target_participant_id: ParticipantId::new("p-a"),
        };

        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["event"], "webrtc-offer");
        assert_eq!(json["data"]["sessionId"], "m1");
        assert_eq!(json["data"]["targetParticipantId"], "p-a");
        assert_eq!(json["data"]["offer"]["type"], "offer");
        assert_eq!(event.addressee(), Addressee::Peer(ParticipantId::new("p-a")));
    }

    #[test]
    fn test_join_omits_missing_password() {
        let event = ClientEvent::JoinSession {
            session_id: SessionId::new("m1"),
            password: None,
        };
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["event"], "join-session");
        assert!(json["data"].get("password").is_none());
    }

    #[test]
    fn test_parse_server_candidate() {
        let raw = r#"{
            "event": "ice-candidate-received",
            "data": {
                "fromId": "p-b",
                "candidate": {
                    "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                }
            }
        }"#;
        let event = ServerEvent::from_json(raw).unwrap();
        match &event {
            ServerEvent::IceCandidateReceived { candidate, from_id } => {
                assert_eq!(from_id.as_str(), "p-b");
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(event.name(), "ice-candidate-received");
        assert_eq!(event.signaling_source().map(|p| p.as_str()), Some("p-b"));
    }

    #[test]
    fn test_parse_participant_left_without_reason() {
        let raw = r#"{"event":"participant-left","data":{"participantId":"p-c"}}"#;
        let event = ServerEvent::from_json(raw).unwrap();
        assert_eq!(
            event,
            ServerEvent::ParticipantLeft {
                participant_id: ParticipantId::new("p-c"),
                reason: None,
            }
        );
    }

    #[test]
    fn test_private_chat_is_addressed_to_recipient() {
        let event = ClientEvent::SendChat {
            session_id: SessionId::new("m1"),
            message: OutgoingChat {
                content: "hi".into(),
                is_private: true,
                recipient_id: Some(ParticipantId::new("p-z")),
            },
        };
        assert_eq!(event.addressee(), Addressee::Peer(ParticipantId::new("p-z")));
        assert_eq!(event.name(), "send-chat");
    }
}
