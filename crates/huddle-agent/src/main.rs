//! # huddle-agent
//!
//! Headless meeting participant. Joins one session with the host
//! microphone, logs everything that happens in it and leaves cleanly on
//! Ctrl+C or when the session ends.
//!
//! Configuration comes from the `HUDDLE_*` environment variables read by
//! [`ClientConfig::from_env`], plus:
//! - `HUDDLE_SESSION_ID` (required)
//! - `HUDDLE_SESSION_PASSWORD` (optional)

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use huddle_client::{
    init_tracing, spawn_session, ClientConfig, EventFilter, SessionClient, SessionEvent,
};
use huddle_media::{AudioConfig, AudioFrame, HostAudioDevices, WebRtcPeerFactory};
use huddle_net::{ControlPlane, HttpControlPlane, WsTransport};
use huddle_shared::constants::APP_NAME;
use huddle_shared::types::SessionId;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Tracing and configuration
    // -----------------------------------------------------------------------
    init_tracing();
    info!("Starting {} agent v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    let mut config = ClientConfig::from_env();
    let session_id = std::env::var("HUDDLE_SESSION_ID")
        .map(SessionId::new)
        .context("HUDDLE_SESSION_ID is not set")?;
    let password = std::env::var("HUDDLE_SESSION_PASSWORD").ok();

    if config.media.video {
        warn!("Camera capture is not available in the agent, joining with audio only");
        config.media.video = false;
    }
    info!(
        signaling = %config.signaling_url,
        api = %config.api_url,
        user = %config.identity.user_id,
        audio = config.media.audio,
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 2. Control plane lookup (informational)
    // -----------------------------------------------------------------------
    let api = HttpControlPlane::new(&config.api_url, config.auth_token.clone());
    match api.get_session(&session_id).await {
        Ok(session) => info!(
            session = %session.id,
            title = %session.title,
            status = ?session.status,
            "Session found"
        ),
        Err(e) => warn!(session = %session_id, error = %e, "Session lookup failed, joining anyway"),
    }

    // -----------------------------------------------------------------------
    // 3. Transport, media and the session task
    // -----------------------------------------------------------------------
    let (transport, notif_rx) = WsTransport::new(config.ws_config());
    let factory = WebRtcPeerFactory::new(config.ice_servers.clone())
        .context("Failed to initialise the WebRTC runtime")?;

    let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(64);
    let devices = HostAudioDevices::new(AudioConfig::default(), Some(frame_tx));
    tokio::spawn(drain_audio(frame_rx));

    let (client, media_rx) = SessionClient::new(
        config.identity.clone(),
        config.media.clone(),
        Arc::new(transport),
        Arc::new(devices),
        Arc::new(factory),
    );
    let client = client.with_max_peers(config.max_peers);
    let handle = spawn_session(client, media_rx, notif_rx);

    let (end_tx, mut end_rx) = mpsc::unbounded_channel::<String>();
    handle.subscribe(EventFilter::All, move |event| {
        log_event(event);
        match event {
            SessionEvent::SessionEnded { reason } | SessionEvent::SessionLost { reason } => {
                let _ = end_tx.send(reason.clone());
            }
            _ => {}
        }
    });

    // -----------------------------------------------------------------------
    // 4. Join and wait
    // -----------------------------------------------------------------------
    let session = handle
        .join(session_id, password)
        .await
        .context("Failed to join session")?;
    info!(session = %session.id, title = %session.title, "In session, press Ctrl+C to leave");

    tokio::select! {
        reason = end_rx.recv() => {
            info!(reason = ?reason, "Session is over");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, leaving");
        }
    }

    handle.shutdown().await;
    info!("Agent stopped");
    Ok(())
}

/// Captured PCM has no encoder on this path yet; keep the channel drained
/// and report levels at trace.
async fn drain_audio(mut frames: mpsc::Receiver<AudioFrame>) {
    let mut count: u64 = 0;
    while let Some(frame) = frames.recv().await {
        count += 1;
        if count % 250 == 0 {
            let peak = frame.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
            trace!(track = %frame.track_id, frames = count, peak, "Audio capture running");
        }
    }
    debug!(frames = count, "Audio frame channel closed");
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::ParticipantJoined { participant } => {
            info!(peer = %participant.id.short(), name = %participant.display_name, "Participant joined")
        }
        SessionEvent::ParticipantLeft {
            participant_id,
            reason,
        } => info!(peer = %participant_id.short(), reason = ?reason, "Participant left"),
        SessionEvent::PeerStateChanged {
            participant_id,
            state,
        } => info!(peer = %participant_id.short(), %state, "Peer link state"),
        SessionEvent::ChatMessage { message } => {
            info!(from = %message.sender_id.short(), "Chat: {}", message.content)
        }
        SessionEvent::Reconnecting { attempt, delay } => {
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Signaling reconnecting")
        }
        SessionEvent::Error { message } => warn!(message = %message, "Session error"),
        other => debug!(event = %other.kind(), "Session event"),
    }
}
