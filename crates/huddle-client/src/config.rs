//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so a client can start against a local
//! development server with no configuration at all.

use huddle_net::{Backoff, WsConfig};
use huddle_shared::constants::{
    DEFAULT_API_URL, DEFAULT_SIGNALING_URL, MAX_MESH_PEERS, RECONNECT_MAX_ATTEMPTS,
};
use huddle_shared::types::UserId;

/// The authenticated local user. Passed in explicitly; there is no global
/// "current user".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub user_id: UserId,
    pub display_name: String,
}

/// Which local media to capture on join, and from which devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPreferences {
    pub video: bool,
    pub audio: bool,
    pub video_device: Option<String>,
    pub audio_device: Option<String>,
}

impl Default for MediaPreferences {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            video_device: None,
            audio_device: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Env: `HUDDLE_SIGNALING_URL`
    pub signaling_url: String,

    /// Env: `HUDDLE_API_URL`
    pub api_url: String,

    /// Bearer token for both the signaling socket and the REST API.
    /// Env: `HUDDLE_AUTH_TOKEN`
    pub auth_token: Option<String>,

    /// Env: `HUDDLE_USER_ID`, `HUDDLE_DISPLAY_NAME`
    pub identity: LocalIdentity,

    /// Env: `HUDDLE_VIDEO`, `HUDDLE_AUDIO` (true/false),
    /// `HUDDLE_VIDEO_DEVICE`, `HUDDLE_AUDIO_DEVICE`
    pub media: MediaPreferences,

    /// STUN/TURN URLs, comma-separated.
    /// Env: `HUDDLE_ICE_SERVERS`
    /// Default: empty (public STUN servers)
    pub ice_servers: Vec<String>,

    /// Env: `HUDDLE_RECONNECT_ATTEMPTS`
    pub reconnect_attempts: u32,

    /// Env: `HUDDLE_MAX_PEERS`
    pub max_peers: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            auth_token: None,
            identity: LocalIdentity {
                user_id: UserId::new("anonymous"),
                display_name: "Guest".to_string(),
            },
            media: MediaPreferences::default(),
            ice_servers: Vec::new(),
            reconnect_attempts: RECONNECT_MAX_ATTEMPTS,
            max_peers: MAX_MESH_PEERS,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("HUDDLE_SIGNALING_URL") {
            if url.starts_with("ws://") || url.starts_with("wss://") {
                config.signaling_url = url;
            } else {
                tracing::warn!(value = %url, "Invalid HUDDLE_SIGNALING_URL, using default");
            }
        }

        if let Some(url) = lookup("HUDDLE_API_URL") {
            config.api_url = url;
        }

        if let Some(token) = lookup("HUDDLE_AUTH_TOKEN") {
            if !token.is_empty() {
                config.auth_token = Some(token);
            }
        }

        if let Some(user) = lookup("HUDDLE_USER_ID") {
            if user.trim().is_empty() {
                tracing::warn!("Empty HUDDLE_USER_ID, using default");
            } else {
                config.identity.user_id = UserId::new(user.trim());
            }
        }

        if let Some(name) = lookup("HUDDLE_DISPLAY_NAME") {
            config.identity.display_name = name;
        }

        if let Some(val) = lookup("HUDDLE_VIDEO") {
            config.media.video = parse_flag("HUDDLE_VIDEO", &val, config.media.video);
        }

        if let Some(val) = lookup("HUDDLE_AUDIO") {
            config.media.audio = parse_flag("HUDDLE_AUDIO", &val, config.media.audio);
        }

        config.media.video_device = lookup("HUDDLE_VIDEO_DEVICE").filter(|d| !d.is_empty());
        config.media.audio_device = lookup("HUDDLE_AUDIO_DEVICE").filter(|d| !d.is_empty());

        if let Some(val) = lookup("HUDDLE_ICE_SERVERS") {
            config.ice_servers = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(val) = lookup("HUDDLE_RECONNECT_ATTEMPTS") {
            match val.parse::<u32>() {
                Ok(n) => config.reconnect_attempts = n,
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid HUDDLE_RECONNECT_ATTEMPTS, using default")
                }
            }
        }

        if let Some(val) = lookup("HUDDLE_MAX_PEERS") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_peers = n,
                _ => tracing::warn!(value = %val, "Invalid HUDDLE_MAX_PEERS, using default"),
            }
        }

        config
    }

    /// Transport settings derived from this config.
    pub fn ws_config(&self) -> WsConfig {
        WsConfig {
            url: self.signaling_url.clone(),
            auth_token: self.auth_token.clone(),
            backoff: Backoff {
                max_attempts: self.reconnect_attempts,
                ..Backoff::default()
            },
        }
    }
}

fn parse_flag(key: &str, value: &str, default: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            tracing::warn!(key, value, "Invalid boolean, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::from_lookup(|_| None);
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
        assert!(config.media.video && config.media.audio);
        assert_eq!(config.max_peers, MAX_MESH_PEERS);
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("HUDDLE_SIGNALING_URL", "wss://meet.example.test/ws"),
            ("HUDDLE_AUTH_TOKEN", "tok"),
            ("HUDDLE_USER_ID", " u-42 "),
            ("HUDDLE_DISPLAY_NAME", "Ada"),
            ("HUDDLE_VIDEO", "off"),
            ("HUDDLE_AUDIO_DEVICE", "mic-1"),
            ("HUDDLE_ICE_SERVERS", "stun:a.test:3478, turn:b.test:3478,"),
            ("HUDDLE_RECONNECT_ATTEMPTS", "3"),
        ]));

        assert_eq!(config.signaling_url, "wss://meet.example.test/ws");
        assert_eq!(config.identity.user_id, UserId::new("u-42"));
        assert_eq!(config.identity.display_name, "Ada");
        assert!(!config.media.video);
        assert!(config.media.audio);
        assert_eq!(config.media.audio_device.as_deref(), Some("mic-1"));
        assert_eq!(config.ice_servers, vec!["stun:a.test:3478", "turn:b.test:3478"]);

        let ws = config.ws_config();
        assert_eq!(ws.auth_token.as_deref(), Some("tok"));
        assert_eq!(ws.backoff.max_attempts, 3);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("HUDDLE_SIGNALING_URL", "http://wrong.test"),
            ("HUDDLE_VIDEO", "maybe"),
            ("HUDDLE_MAX_PEERS", "0"),
            ("HUDDLE_RECONNECT_ATTEMPTS", "-1"),
        ]));
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
        assert!(config.media.video);
        assert_eq!(config.max_peers, MAX_MESH_PEERS);
        assert_eq!(config.reconnect_attempts, RECONNECT_MAX_ATTEMPTS);
    }
}
