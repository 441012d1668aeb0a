//! Local media and peer-connection management for a session.

pub mod audio;
pub mod devices;
pub mod local;
pub mod peer_link;
pub mod registry;
pub mod rtc;
pub mod track;
pub mod webrtc_peer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use audio::{AudioConfig, AudioFrame, HostAudioDevices};
pub use devices::{DeviceInfo, MediaConstraints, MediaDevices};
pub use local::LocalMediaState;
pub use peer_link::{FailureAction, LinkState, OutboundSlot, PeerLink, ReplaceOutcome};
pub use registry::{PeerRegistry, PeerRegistryError};
pub use rtc::{
    media_channel, ConnectionState, MediaEvent, MediaEventReceiver, MediaEventSender,
    PeerConnectionFactory, PeerEvent, RemoteTrack, ReplaceTrackError, RtcPeerConnection, SenderId,
};
pub use track::LocalTrack;
pub use webrtc_peer::WebRtcPeerFactory;
