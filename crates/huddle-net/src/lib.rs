//! Network seams for the session client: the signaling transport and the
//! REST control plane.

pub mod backoff;
pub mod control;
pub mod error;
pub mod memory;
pub mod transport;
pub mod websocket;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backoff::Backoff;
pub use control::{ApiEnvelope, ControlPlane, CreateSessionRequest, HttpControlPlane, SessionUpdate};
pub use error::ApiError;
pub use memory::InMemoryControlPlane;
pub use transport::{
    notification_channel, NotificationReceiver, NotificationSender, SignalingTransport,
    TransportNotification,
};
pub use websocket::{WsConfig, WsTransport};
