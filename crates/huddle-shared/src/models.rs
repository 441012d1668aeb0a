//! Domain records exchanged with the session server.
//!
//! Field names follow the server's camelCase JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ParticipantId, SessionId, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    Live,
    Ended,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMode {
    #[default]
    Off,
    Manual,
    Automatic,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdmitPolicy {
    #[default]
    Everyone,
    InvitedOnly,
    HostApproval,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub chat_enabled: bool,
    pub recording: RecordingMode,
    pub auto_admit: AdmitPolicy,
    pub require_password: bool,
    pub max_participants: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            chat_enabled: true,
            recording: RecordingMode::Off,
            auto_admit: AdmitPolicy::Everyone,
            require_password: false,
            max_participants: 50,
        }
    }
}

/// One meeting instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub host_id: UserId,
    #[serde(default)]
    pub settings: SessionSettings,
}

impl Session {
    pub fn is_active(&self) -> bool {
        matches!(self.status, SessionStatus::Scheduled | SessionStatus::Live)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Host,
    CoHost,
    Presenter,
    Attendee,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Invited,
    Joined,
    Left,
    Waiting,
}

/// Per-participant media flags as published to the roster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaState {
    pub video: bool,
    pub audio: bool,
    pub screen_share: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Permissions {
    pub can_mute_others: bool,
    pub can_record: bool,
    pub can_manage_participants: bool,
}

impl Permissions {
    /// Default grant for a role when the server omits explicit permissions.
    pub fn for_role(role: ParticipantRole) -> Self {
        match role {
            ParticipantRole::Host | ParticipantRole::CoHost => Self {
                can_mute_others: true,
                can_record: true,
                can_manage_participants: true,
            },
            ParticipantRole::Presenter => Self {
                can_mute_others: false,
                can_record: true,
                can_manage_participants: false,
            },
            ParticipantRole::Attendee => Self::default(),
        }
    }
}

/// One user's membership record within a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub user_id: UserId,
    #[serde(default)]
    pub display_name: String,
    pub role: ParticipantRole,
    pub status: ParticipantStatus,
    #[serde(default)]
    pub media: MediaState,
    #[serde(default)]
    pub permissions: Option<Permissions>,
    #[serde(default)]
    pub hand_raised: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn is_joined(&self) -> bool {
        self.status == ParticipantStatus::Joined
    }

    /// Explicit permissions if the server sent them, otherwise the role
    /// defaults.
    pub fn effective_permissions(&self) -> Permissions {
        self.permissions
            .unwrap_or_else(|| Permissions::for_role(self.role))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Visibility {
    Broadcast,
    Private {
        #[serde(rename = "recipientId")]
        recipient_id: ParticipantId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    pub participant_ids: Vec<ParticipantId>,
}

/// Session-scoped chat message as delivered by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: SessionId,
    pub sender_id: ParticipantId,
    pub content: String,
    pub visibility: Visibility,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    pub id: Uuid,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSegment {
    pub speaker_id: ParticipantId,
    pub text: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub is_final: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Invite {
    pub email: String,
    pub role: ParticipantRole,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_from_server_json() {
        let json = r#"{
            "id": "p-1",
            "userId": "u-1",
            "displayName": "Ada",
            "role": "co_host",
            "status": "joined",
            "media": {"video": true, "audio": false}
        }"#;
        let p: Participant = serde_json::from_str(json).unwrap();
        assert_eq!(p.id, ParticipantId::new("p-1"));
        assert!(p.is_joined());
        assert!(p.media.video);
        assert!(!p.media.screen_share);
        assert!(p.effective_permissions().can_manage_participants);
    }

    #[test]
    fn test_private_visibility_shape() {
        let v = Visibility::Private {
            recipient_id: ParticipantId::new("p-2"),
        };
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["type"], "private");
        assert_eq!(json["recipientId"], "p-2");
    }

    #[test]
    fn test_attendee_has_no_permissions() {
        assert_eq!(
            Permissions::for_role(ParticipantRole::Attendee),
            Permissions::default()
        );
    }
}
