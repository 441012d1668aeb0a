//! Session state owned by the session client.

use std::collections::BTreeMap;

use huddle_media::LinkState;
use huddle_shared::models::{ChatMessage, MediaState, Participant, Session, TranscriptSegment};
use huddle_shared::types::{ParticipantId, UserId};

/// `Idle → Joining → Joined → Leaving → Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    #[default]
    Idle,
    Joining,
    Joined,
    Leaving,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Joining => "joining",
            Self::Joined => "joined",
            Self::Leaving => "leaving",
        };
        f.write_str(s)
    }
}

/// Participants of the current session, ordered by id.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    participants: BTreeMap<ParticipantId, Participant>,
}

impl Roster {
    pub fn replace_all(&mut self, participants: Vec<Participant>) {
        self.participants = participants.into_iter().map(|p| (p.id.clone(), p)).collect();
    }

    pub fn upsert(&mut self, participant: Participant) -> Option<Participant> {
        self.participants.insert(participant.id.clone(), participant)
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        self.participants.remove(id)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut Participant> {
        self.participants.get_mut(id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    pub fn find_user(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.values().find(|p| &p.user_id == user_id)
    }

    /// Joined participants other than `self_id`.
    pub fn joined_remotes(&self, self_id: Option<&ParticipantId>) -> Vec<ParticipantId> {
        self.participants
            .values()
            .filter(|p| p.is_joined() && Some(&p.id) != self_id)
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<ParticipantId> {
        self.participants.keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingState {
    pub active: bool,
    pub url: Option<String>,
}

#[derive(Debug, Default)]
pub struct SessionState {
    pub session: Option<Session>,
    pub roster: Roster,
    pub self_id: Option<ParticipantId>,
    pub chat: Vec<ChatMessage>,
    pub recording: RecordingState,
    pub transcript: Vec<TranscriptSegment>,
}

impl SessionState {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_self(&self, id: &ParticipantId) -> bool {
        self.self_id.as_ref() == Some(id)
    }

    pub fn self_participant_mut(&mut self) -> Option<&mut Participant> {
        let id = self.self_id.clone()?;
        self.roster.get_mut(&id)
    }

    /// Interim segments from a speaker are replaced by their successor.
    pub fn push_transcript(&mut self, segment: TranscriptSegment) {
        if let Some(last) = self.transcript.last_mut() {
            if !last.is_final && last.speaker_id == segment.speaker_id {
                *last = segment;
                return;
            }
        }
        self.transcript.push(segment);
    }
}

/// Point-in-time copy of the session for observers.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub lifecycle: Lifecycle,
    pub session: Option<Session>,
    pub self_id: Option<ParticipantId>,
    pub participants: Vec<Participant>,
    pub peers: Vec<(ParticipantId, LinkState)>,
    pub local_media: MediaState,
    pub chat: Vec<ChatMessage>,
    pub recording: RecordingState,
    pub transcript: Vec<TranscriptSegment>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use huddle_shared::models::{ParticipantRole, ParticipantStatus};

    fn participant(id: &str, user: &str, status: ParticipantStatus) -> Participant {
        Participant {
            id: ParticipantId::new(id),
            user_id: UserId::new(user),
            display_name: id.to_uppercase(),
            role: ParticipantRole::Attendee,
            status,
            media: MediaState::default(),
            permissions: None,
            hand_raised: false,
            joined_at: None,
        }
    }

    #[test]
    fn test_joined_remotes_excludes_self_and_waiting() {
        let mut roster = Roster::default();
        roster.replace_all(vec![
            participant("p-self", "u-self", ParticipantStatus::Joined),
            participant("p-a", "u-a", ParticipantStatus::Joined),
            participant("p-w", "u-w", ParticipantStatus::Waiting),
        ]);
        let me = ParticipantId::new("p-self");
        assert_eq!(roster.joined_remotes(Some(&me)), vec![ParticipantId::new("p-a")]);
        assert_eq!(
            roster.find_user(&UserId::new("u-self")).map(|p| p.id.clone()),
            Some(me)
        );
    }

    #[test]
    fn test_interim_transcript_is_replaced() {
        let mut state = SessionState::default();
        let seg = |text: &str, is_final| TranscriptSegment {
            speaker_id: ParticipantId::new("p-a"),
            text: text.into(),
            at: Utc::now(),
            is_final,
        };
        state.push_transcript(seg("hel", false));
        state.push_transcript(seg("hello", true));
        state.push_transcript(seg("next", false));
        let texts: Vec<_> = state.transcript.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "next"]);
    }

    #[test]
    fn test_lifecycle_display() {
        assert_eq!(Lifecycle::default().to_string(), "idle");
        assert_eq!(Lifecycle::Leaving.to_string(), "leaving");
    }
}
