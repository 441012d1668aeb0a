use tracing::debug;

use huddle_shared::models::MediaState;
use huddle_shared::types::MediaKind;

use crate::track::LocalTrack;

/// Local camera, microphone and screen tracks plus the current device
/// selection. Owned by the session; peer links only hold clones.
#[derive(Debug, Default)]
pub struct LocalMediaState {
    camera: Option<LocalTrack>,
    microphone: Option<LocalTrack>,
    screen: Option<LocalTrack>,
}

impl LocalMediaState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from freshly captured camera/microphone tracks.
    pub fn from_tracks(tracks: Vec<LocalTrack>) -> Self {
        let mut state = Self::default();
        for track in tracks {
            match track.kind() {
                MediaKind::Video => state.camera = Some(track),
                MediaKind::Audio => state.microphone = Some(track),
                MediaKind::Screen => state.screen = Some(track),
            }
        }
        state
    }

    pub fn camera(&self) -> Option<&LocalTrack> {
        self.camera.as_ref()
    }

    pub fn microphone(&self) -> Option<&LocalTrack> {
        self.microphone.as_ref()
    }

    pub fn screen(&self) -> Option<&LocalTrack> {
        self.screen.as_ref()
    }

    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        match kind {
            MediaKind::Video => self.camera(),
            MediaKind::Audio => self.microphone(),
            MediaKind::Screen => self.screen(),
        }
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    pub fn video_device(&self) -> Option<&str> {
        self.camera.as_ref().and_then(|t| t.device_id())
    }

    pub fn audio_device(&self) -> Option<&str> {
        self.microphone.as_ref().and_then(|t| t.device_id())
    }

    /// Flip the enabled flag of `kind`. Returns the new state, or `None` when
    /// there is no such track.
    pub fn toggle(&mut self, kind: MediaKind) -> Option<bool> {
        let track = self.track(kind)?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        debug!(%kind, enabled, "Local track toggled");
        Some(enabled)
    }

    /// Swap in a new camera or microphone track, returning the previous one.
    /// The caller stops the old track once every link has moved over.
    pub fn replace(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        let slot = match track.kind() {
            MediaKind::Video => &mut self.camera,
            MediaKind::Audio => &mut self.microphone,
            MediaKind::Screen => &mut self.screen,
        };
        slot.replace(track)
    }

    pub fn set_screen(&mut self, track: Option<LocalTrack>) -> Option<LocalTrack> {
        std::mem::replace(&mut self.screen, track)
    }

    /// Tracks currently sent to every link: the microphone and whichever of
    /// screen or camera occupies the video slot.
    pub fn outbound_tracks(&self) -> Vec<LocalTrack> {
        let video = self.screen.as_ref().or(self.camera.as_ref());
        self.microphone.iter().chain(video).cloned().collect()
    }

    pub fn media_state(&self) -> MediaState {
        MediaState {
            video: self.camera.as_ref().is_some_and(|t| t.is_enabled()),
            audio: self.microphone.as_ref().is_some_and(|t| t.is_enabled()),
            screen_share: self.screen.is_some(),
        }
    }

    /// Stop every track and forget them.
    pub fn release(&mut self) {
        for track in [self.camera.take(), self.microphone.take(), self.screen.take()]
            .into_iter()
            .flatten()
        {
            track.stop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.camera.is_none() && self.microphone.is_none() && self.screen.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera_and_mic() -> LocalMediaState {
        LocalMediaState::from_tracks(vec![
            LocalTrack::new(MediaKind::Video, Some("cam-0".into()), "Camera"),
            LocalTrack::new(MediaKind::Audio, Some("mic-0".into()), "Microphone"),
        ])
    }

    #[test]
    fn test_toggle_keeps_track_identity() {
        let mut state = camera_and_mic();
        let id = state.camera().map(|t| t.id());

        assert_eq!(state.toggle(MediaKind::Video), Some(false));
        assert!(!state.media_state().video);
        assert_eq!(state.toggle(MediaKind::Video), Some(true));
        assert_eq!(state.camera().map(|t| t.id()), id);
        assert_eq!(state.toggle(MediaKind::Screen), None);
    }

    #[test]
    fn test_screen_occupies_video_slot() {
        let mut state = camera_and_mic();
        let screen = LocalTrack::new(MediaKind::Screen, None, "Display");
        state.set_screen(Some(screen.clone()));

        let outbound = state.outbound_tracks();
        assert_eq!(outbound.len(), 2);
        assert!(outbound.contains(&screen));
        assert!(state.media_state().screen_share);

        state.set_screen(None);
        let kinds: Vec<_> = state.outbound_tracks().iter().map(|t| t.kind()).collect();
        assert_eq!(kinds, vec![MediaKind::Audio, MediaKind::Video]);
    }

    #[test]
    fn test_replace_returns_previous() {
        let mut state = camera_and_mic();
        let next = LocalTrack::new(MediaKind::Video, Some("cam-1".into()), "USB camera");
        let old = state.replace(next).unwrap();
        assert_eq!(old.device_id(), Some("cam-0"));
        assert_eq!(state.video_device(), Some("cam-1"));
    }

    #[test]
    fn test_release_stops_everything() {
        let mut state = camera_and_mic();
        let cam = state.camera().cloned().unwrap();
        state.release();
        assert!(cam.is_ended());
        assert!(state.is_empty());
    }
}
