//! In-process [`ControlPlane`] for tests and offline development.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use huddle_shared::models::{
    ChatMessage, Invite, Participant, Recording, Session, SessionStatus, TranscriptSegment,
};
use huddle_shared::types::{SessionId, UserId};

use crate::control::{ControlPlane, CreateSessionRequest, SessionUpdate};
use crate::error::ApiError;

#[derive(Default)]
struct SessionRecord {
    session: Option<Session>,
    participants: Vec<Participant>,
    invites: Vec<Invite>,
    active_recording: Option<Recording>,
    recordings: Vec<Recording>,
    transcript: Vec<TranscriptSegment>,
    chat: Vec<ChatMessage>,
}

/// Control plane backed by in-memory maps. Sessions are created on behalf
/// of a fixed host user.
pub struct InMemoryControlPlane {
    host_id: UserId,
    records: RwLock<HashMap<SessionId, SessionRecord>>,
}

impl InMemoryControlPlane {
    pub fn new(host_id: UserId) -> Self {
        Self {
            host_id,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a session as-is, replacing any previous record with the same id.
    pub async fn insert_session(&self, session: Session) {
        let id = session.id.clone();
        let mut records = self.records.write().await;
        records.entry(id).or_default().session = Some(session);
    }

    pub async fn add_participant(&self, session_id: &SessionId, participant: Participant) {
        let mut records = self.records.write().await;
        let record = records.entry(session_id.clone()).or_default();
        record.participants.retain(|p| p.id != participant.id);
        record.participants.push(participant);
    }

    pub async fn append_chat(&self, message: ChatMessage) {
        let mut records = self.records.write().await;
        records
            .entry(message.session_id.clone())
            .or_default()
            .chat
            .push(message);
    }

    pub async fn append_transcript(&self, session_id: &SessionId, segment: TranscriptSegment) {
        let mut records = self.records.write().await;
        records
            .entry(session_id.clone())
            .or_default()
            .transcript
            .push(segment);
    }

    pub async fn invites(&self, session_id: &SessionId) -> Vec<Invite> {
        let records = self.records.read().await;
        records
            .get(session_id)
            .map(|r| r.invites.clone())
            .unwrap_or_default()
    }
}

fn not_found(id: &SessionId) -> ApiError {
    ApiError::NotFound(format!("session {id}"))
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<Session, ApiError> {
        request.validate()?;

        let session = Session {
            id: SessionId::new(Uuid::new_v4().to_string()),
            title: request.title.clone(),
            description: request.description.clone(),
            starts_at: request.starts_at,
            ends_at: request.ends_at,
            status: SessionStatus::Scheduled,
            host_id: self.host_id.clone(),
            settings: request.settings.clone(),
        };
        debug!(session = %session.id, title = %session.title, "Session created");

        self.insert_session(session.clone()).await;
        Ok(session)
    }

    async fn update_session(
        &self,
        id: &SessionId,
        update: &SessionUpdate,
    ) -> Result<Session, ApiError> {
        let mut records = self.records.write().await;
        let session = records
            .get_mut(id)
            .and_then(|r| r.session.as_mut())
            .ok_or_else(|| not_found(id))?;

        let mut updated = session.clone();
        update.apply(&mut updated);
        if updated.ends_at <= updated.starts_at {
            return Err(ApiError::Invalid("session ends before it starts".into()));
        }
        *session = updated.clone();
        Ok(updated)
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), ApiError> {
        let mut records = self.records.write().await;
        let session = records
            .get_mut(id)
            .and_then(|r| r.session.as_mut())
            .ok_or_else(|| not_found(id))?;
        // Soft delete: the record stays readable with a terminal status.
        session.status = SessionStatus::Cancelled;
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Session, ApiError> {
        let records = self.records.read().await;
        records
            .get(id)
            .and_then(|r| r.session.clone())
            .ok_or_else(|| not_found(id))
    }

    async fn list_participants(&self, id: &SessionId) -> Result<Vec<Participant>, ApiError> {
        let records = self.records.read().await;
        match records.get(id) {
            Some(record) if record.session.is_some() => Ok(record.participants.clone()),
            _ => Err(not_found(id)),
        }
    }

    async fn send_invites(&self, id: &SessionId, invites: &[Invite]) -> Result<usize, ApiError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .filter(|r| r.session.is_some())
            .ok_or_else(|| not_found(id))?;

        let mut added = 0;
        for invite in invites {
            if invite.email.trim().is_empty() || !invite.email.contains('@') {
                return Err(ApiError::Invalid(format!("bad invite address: {}", invite.email)));
            }
            if !record.invites.iter().any(|i| i.email == invite.email) {
                record.invites.push(invite.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    async fn start_recording(&self, id: &SessionId) -> Result<Recording, ApiError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| not_found(id))?;
        let active = record
            .session
            .as_ref()
            .map(Session::is_active)
            .ok_or_else(|| not_found(id))?;
        if !active {
            return Err(ApiError::Rejected("session is not active".into()));
        }
        if record.active_recording.is_some() {
            return Err(ApiError::Rejected("recording already in progress".into()));
        }

        let recording = Recording {
            id: Uuid::new_v4(),
            session_id: id.clone(),
            url: None,
            started_at: Utc::now(),
            ended_at: None,
        };
        record.active_recording = Some(recording.clone());
        Ok(recording)
    }

    async fn stop_recording(&self, id: &SessionId) -> Result<Recording, ApiError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| not_found(id))?;
        let mut recording = record
            .active_recording
            .take()
            .ok_or_else(|| ApiError::Rejected("no recording in progress".into()))?;

        recording.ended_at = Some(Utc::now());
        recording.url = Some(format!("memory://recordings/{}", recording.id));
        record.recordings.push(recording.clone());
        Ok(recording)
    }

    async fn get_transcript(&self, id: &SessionId) -> Result<Vec<TranscriptSegment>, ApiError> {
        let records = self.records.read().await;
        records
            .get(id)
            .filter(|r| r.session.is_some())
            .map(|r| r.transcript.clone())
            .ok_or_else(|| not_found(id))
    }

    async fn get_chat_history(&self, id: &SessionId) -> Result<Vec<ChatMessage>, ApiError> {
        let records = self.records.read().await;
        records
            .get(id)
            .filter(|r| r.session.is_some())
            .map(|r| r.chat.clone())
            .ok_or_else(|| not_found(id))
    }
}
