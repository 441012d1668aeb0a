use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use huddle_shared::types::{MediaKind, TrackId};

struct TrackInner {
    id: TrackId,
    kind: MediaKind,
    device_id: Option<String>,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

/// A captured local track.
///
/// Clones share identity, the enabled flag and the ended signal, so the same
/// track can be attached to every peer link without being duplicated.
/// Disabling a track keeps it attached; the capture runtime sends silence or
/// black frames instead.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, device_id: Option<String>, label: impl Into<String>) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: TrackId::new(),
                kind,
                device_id,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended,
            }),
        }
    }

    pub fn id(&self) -> TrackId {
        self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn device_id(&self) -> Option<&str> {
        self.inner.device_id.as_deref()
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Flag shared with capture callbacks.
    pub(crate) fn is_live(&self) -> bool {
        !self.is_ended()
    }

    /// Stop capture. Idempotent.
    pub fn stop(&self) {
        let was_ended = self.inner.ended.send_replace(true);
        if !was_ended {
            debug!(track = %self.inner.id, kind = %self.inner.kind, "Local track stopped");
        }
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Resolves once the track has ended, whether stopped locally or by the
    /// capture runtime (e.g. the user closed the shared window).
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("device_id", &self.inner.device_id)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for LocalTrack {}
