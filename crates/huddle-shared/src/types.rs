use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First eight characters, for log lines.
            pub fn short(&self) -> &str {
                match self.0.char_indices().nth(8) {
                    Some((idx, _)) => &self.0[..idx],
                    None => &self.0,
                }
            }

            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Server-assigned session (meeting) identifier.
    SessionId
);

string_id!(
    /// Membership record identifier, unique within a session.
    ParticipantId
);

string_id!(
    /// Authenticated account identifier. One user may own several
    /// participant records over time.
    UserId
);

/// Identity of a local track. Clones of a track share the same id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TrackId(pub Uuid);

impl TrackId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of media a track or toggle refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
    Screen,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Screen => "screen",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound stream kinds a remote peer can publish.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Camera,
    Screen,
}

impl StreamKind {
    /// Stream id used on outbound tracks so the receiving side can tell
    /// camera and screen apart.
    pub fn stream_label(&self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Screen => "screen",
        }
    }

    pub fn from_stream_label(label: &str) -> Self {
        if label == "screen" {
            Self::Screen
        } else {
            Self::Camera
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id() {
        let id = ParticipantId::new("0123456789abcdef");
        assert_eq!(id.short(), "01234567");

        let id = ParticipantId::new("abc");
        assert_eq!(id.short(), "abc");
    }

    #[test]
    fn test_id_serializes_transparently() {
        let id = SessionId::new("m1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"m1\"");
    }

    #[test]
    fn test_stream_label() {
        assert_eq!(StreamKind::from_stream_label("screen"), StreamKind::Screen);
        assert_eq!(StreamKind::from_stream_label("camera"), StreamKind::Camera);
        assert_eq!(StreamKind::from_stream_label("other"), StreamKind::Camera);
    }
}
