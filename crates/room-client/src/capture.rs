//! Local capture boundary (microphone and camera)

use crate::engine::MediaKind;
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A local media track handed to [`crate::engine::SendTransport::produce`]
pub trait MediaTrack: Send + Sync {
    /// Track id
    fn id(&self) -> &str;
    /// Media kind
    fn kind(&self) -> MediaKind;
    /// Enable or disable the track without releasing it
    fn set_enabled(&self, enabled: bool);
    /// Whether the track is enabled
    fn is_enabled(&self) -> bool;
    /// Release the underlying source
    fn dispose(&self);
}

/// Completion callback of [`MediaCaptureProvider::switch_camera`]
pub type SwitchCameraCallback = Box<dyn FnOnce(std::result::Result<(), String>) + Send>;

/// Creates local tracks and controls capture devices
pub trait MediaCaptureProvider: Send + Sync {
    /// Create the microphone track
    fn create_audio_track(&self) -> Result<Arc<dyn MediaTrack>>;

    /// Create the camera track
    fn create_video_track(&self) -> Result<Arc<dyn MediaTrack>>;

    /// Switch to the next camera; `on_done` runs exactly once, on any thread
    fn switch_camera(&self, on_done: SwitchCameraCallback);

    /// Release capture devices
    fn dispose(&self) {}
}

/// Track with no media behind it
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    disposed: AtomicBool,
}

impl LocalTrack {
    /// Create an enabled track with a random id
    pub fn new(kind: MediaKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            enabled: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
        }
    }

    /// Whether [`MediaTrack::dispose`] was called
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl MediaTrack for LocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            debug!("Disposed {} track {}", self.kind, self.id);
        }
    }
}

/// Capture provider without devices
///
/// Hands out [`LocalTrack`]s and fails camera switches.
#[derive(Debug, Default)]
pub struct NullCapture;

impl MediaCaptureProvider for NullCapture {
    fn create_audio_track(&self) -> Result<Arc<dyn MediaTrack>> {
        Ok(Arc::new(LocalTrack::new(MediaKind::Audio)))
    }

    fn create_video_track(&self) -> Result<Arc<dyn MediaTrack>> {
        Ok(Arc::new(LocalTrack::new(MediaKind::Video)))
    }

    fn switch_camera(&self, on_done: SwitchCameraCallback) {
        on_done(Err("no camera available".to_string()));
    }
}
