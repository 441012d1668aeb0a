/// Application name
pub const APP_NAME: &str = "Huddle";

/// Maximum chat message length in characters
pub const MAX_CHAT_MESSAGE_CHARS: usize = 4000;

/// Maximum number of simultaneous peer links in mesh mode
pub const MAX_MESH_PEERS: usize = 16;

/// ICE restarts attempted before a failed link is treated as terminal
pub const ICE_RESTART_ATTEMPTS: u32 = 1;

/// Default signaling endpoint (WebSocket)
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/signaling";

/// Default control-plane base URL
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080/api/v1";

/// Public STUN servers used when none are configured
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Reconnect backoff defaults
pub const RECONNECT_INITIAL_MS: u64 = 500;
pub const RECONNECT_MAX_MS: u64 = 15_000;
pub const RECONNECT_MAX_ATTEMPTS: u32 = 8;

/// Capacity of internal command/notification channels
pub const CHANNEL_CAPACITY: usize = 256;
