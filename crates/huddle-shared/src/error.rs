use thiserror::Error;

use crate::types::MediaKind;

/// Capture failures. Recoverable by retrying with reduced constraints.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("Permission denied for {0}")]
    PermissionDenied(MediaKind),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Capture of {0} is not supported by this runtime")]
    Unsupported(MediaKind),

    #[error("Media runtime error: {0}")]
    Runtime(String),
}

impl MediaAccessError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }
}

/// Signaling channel failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Signaling server unreachable: {0}")]
    Unreachable(String),

    #[error("Signaling upgrade rejected with HTTP {status}")]
    Rejected { status: u16 },

    #[error("Signaling channel disconnected")]
    Disconnected,

    #[error("Reconnect attempts exhausted after {attempts} tries")]
    RetriesExhausted { attempts: u32 },

    #[error("Transport closed")]
    Closed,

    #[error("Failed to encode event: {0}")]
    Encode(String),
}

/// Offer/answer/candidate failures. Local to one peer link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Malformed session description: {0}")]
    MalformedDescription(String),

    #[error("Answer received with no offer outstanding")]
    UnexpectedAnswer,

    #[error("Peer link is closed")]
    LinkClosed,

    #[error("RTC runtime error: {0}")]
    Rtc(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceSwitchError {
    #[error("New device unusable: {0}")]
    Capture(#[from] MediaAccessError),

    #[error("No local {0} track to replace")]
    NoLocalTrack(MediaKind),
}

/// Rejected before any network call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Chat message is empty")]
    EmptyMessage,

    #[error("Chat message exceeds {max} characters")]
    MessageTooLong { max: usize },

    #[error("Private message requires a recipient")]
    MissingRecipient,

    #[error("Session id is empty")]
    InvalidSessionId,
}

/// Error returned by every public session operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Media access error: {0}")]
    Media(#[from] MediaAccessError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Device switch error: {0}")]
    DeviceSwitch(#[from] DeviceSwitchError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Already joined this session")]
    AlreadyJoined,

    #[error("Another session is joining or joined")]
    Busy,

    #[error("Not joined to a session")]
    NotJoined,

    #[error("No local {0} track")]
    NoLocalTrack(MediaKind),

    #[error("Chat is disabled for this session")]
    ChatDisabled,

    #[error("Peer limit reached ({0})")]
    PeerLimit(usize),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Operation cancelled by leave")]
    Cancelled,

    #[error("Session ended: {0}")]
    SessionEnded(String),

    #[error("Session task has shut down")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion_keeps_kind() {
        let err: SessionError = MediaAccessError::PermissionDenied(MediaKind::Video).into();
        match err {
            SessionError::Media(inner) => assert!(inner.is_permission_denied()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_device_switch_wraps_capture_error() {
        let err: DeviceSwitchError = MediaAccessError::DeviceNotFound("cam-9".into()).into();
        assert!(err.to_string().contains("cam-9"));
    }
}
