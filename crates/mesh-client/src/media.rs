//! Local capture.
//!
//! [`LocalMediaController`] owns the local camera and microphone tracks.
//! Muting flips a track's enabled flag and keeps the device open; stopping
//! releases the device. A device switch is two-phase so the old camera stays
//! live until the new track has been swapped into every connection:
//! [`prepare_video_switch`](LocalMediaController::prepare_video_switch), swap,
//! then [`commit_video_switch`](LocalMediaController::commit_video_switch).
//!
//! Every track is stopped on [`release`](LocalMediaController::release) and
//! when the controller is dropped.

use crate::errors::MeshError;
use async_trait::async_trait;
use signal_protocol::TrackState;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Local track kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Camera request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    /// Exact device, or the platform default.
    pub device_id: Option<String>,
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub ideal_frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            device_id: None,
            ideal_width: 1920,
            ideal_height: 1080,
            ideal_frame_rate: 30,
        }
    }
}

/// Microphone request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConstraints {
    pub device_id: Option<String>,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            device_id: None,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// What to capture. `None` skips that kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: Option<AudioConstraints>,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            video: Some(VideoConstraints::default()),
            audio: Some(AudioConstraints::default()),
        }
    }
}

/// An enumerated capture device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDeviceInfo {
    pub device_id: String,
    pub label: String,
    pub kind: TrackKind,
}

/// A native capture track.
///
/// Implementations wrap a media engine handle; `stop` must release the device.
pub trait CaptureTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn device_id(&self) -> &str;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

/// Shared handle to a capture track.
pub type TrackRef = Arc<dyn CaptureTrack>;

/// The local tracks handed to peer connections.
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    pub audio: Option<TrackRef>,
    pub video: Option<TrackRef>,
}

impl LocalStream {
    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<&TrackRef> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &TrackRef> {
        self.audio.iter().chain(self.video.iter())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

/// Device access seam (camera/microphone permission and enumeration).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LocalStream, MeshError>;

    async fn enumerate(&self) -> Result<Vec<MediaDeviceInfo>, MeshError>;
}

/// Owner of the local capture tracks.
pub struct LocalMediaController {
    devices: Arc<dyn MediaDevices>,
    constraints: CaptureConstraints,
    stream: Option<LocalStream>,
    pending_video: Option<TrackRef>,
}

impl LocalMediaController {
    #[must_use]
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            constraints: CaptureConstraints::default(),
            stream: None,
            pending_video: None,
        }
    }

    /// Open capture with `constraints`, replacing any current capture.
    ///
    /// # Errors
    ///
    /// `MediaUnavailable` if the devices refuse or return no tracks.
    pub async fn acquire(&mut self, constraints: CaptureConstraints) -> Result<LocalStream, MeshError> {
        self.release();

        let stream = self.devices.acquire(&constraints).await?;
        if stream.is_empty() {
            return Err(MeshError::MediaUnavailable(
                "no capture tracks returned".to_string(),
            ));
        }

        info!(
            target: "mesh.media",
            audio = stream.audio.is_some(),
            video = stream.video.is_some(),
            "Local media acquired"
        );
        self.constraints = constraints;
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    #[must_use]
    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.stream.is_some()
    }

    #[must_use]
    pub fn constraints(&self) -> &CaptureConstraints {
        &self.constraints
    }

    /// Current enabled flags. A missing track counts as disabled.
    #[must_use]
    pub fn track_state(&self) -> TrackState {
        let enabled = |kind| {
            self.stream
                .as_ref()
                .and_then(|s| s.track(kind))
                .is_some_and(|t| t.is_enabled())
        };
        TrackState {
            video_enabled: enabled(TrackKind::Video),
            audio_enabled: enabled(TrackKind::Audio),
        }
    }

    /// Mute or unmute a track. Capture keeps running.
    ///
    /// # Errors
    ///
    /// `MediaUnavailable` if there is no track of that kind.
    pub fn set_enabled(&mut self, kind: TrackKind, enabled: bool) -> Result<TrackState, MeshError> {
        let track = self
            .stream
            .as_ref()
            .and_then(|s| s.track(kind))
            .ok_or_else(|| MeshError::MediaUnavailable(format!("no local {kind} track")))?;
        track.set_enabled(enabled);
        debug!(target: "mesh.media", kind = %kind, enabled = enabled, "Track toggled");
        Ok(self.track_state())
    }

    /// List capture devices.
    ///
    /// # Errors
    ///
    /// Whatever the device seam returns.
    pub async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>, MeshError> {
        self.devices.enumerate().await
    }

    /// Open the camera `device_id` without touching the current one.
    ///
    /// The new track inherits the current enabled flag. A previous
    /// unfinished switch is aborted.
    ///
    /// # Errors
    ///
    /// `MediaUnavailable` if there is no current video track or the new
    /// device yields none.
    pub async fn prepare_video_switch(&mut self, device_id: &str) -> Result<TrackRef, MeshError> {
        let current = self
            .stream
            .as_ref()
            .and_then(|s| s.video.clone())
            .ok_or_else(|| MeshError::MediaUnavailable("no local video track".to_string()))?;
        self.abort_video_switch();

        let video = VideoConstraints {
            device_id: Some(device_id.to_string()),
            ..self.constraints.video.clone().unwrap_or_default()
        };
        let acquired = self
            .devices
            .acquire(&CaptureConstraints {
                video: Some(video),
                audio: None,
            })
            .await?;
        if let Some(audio) = &acquired.audio {
            audio.stop();
        }
        let replacement = acquired.video.ok_or_else(|| {
            MeshError::MediaUnavailable(format!("device {device_id} returned no video track"))
        })?;

        replacement.set_enabled(current.is_enabled());
        debug!(
            target: "mesh.media",
            from_device = current.device_id(),
            to_device = device_id,
            "Video switch prepared"
        );
        self.pending_video = Some(Arc::clone(&replacement));
        Ok(replacement)
    }

    /// Adopt the prepared track and stop the old camera.
    ///
    /// # Errors
    ///
    /// `Internal` if no switch was prepared; `MediaUnavailable` if capture
    /// was released meanwhile.
    pub fn commit_video_switch(&mut self) -> Result<(), MeshError> {
        let replacement = self
            .pending_video
            .take()
            .ok_or_else(|| MeshError::Internal("no video switch in progress".to_string()))?;
        let Some(stream) = self.stream.as_mut() else {
            replacement.stop();
            return Err(MeshError::MediaUnavailable(
                "local media released during switch".to_string(),
            ));
        };

        let device_id = replacement.device_id().to_string();
        if let Some(previous) = stream.video.replace(replacement) {
            previous.stop();
        }
        if let Some(video) = self.constraints.video.as_mut() {
            video.device_id = Some(device_id.clone());
        }
        info!(target: "mesh.media", device_id = %device_id, "Video device switched");
        Ok(())
    }

    /// Drop a prepared switch, stopping the new track.
    pub fn abort_video_switch(&mut self) {
        if let Some(pending) = self.pending_video.take() {
            pending.stop();
            debug!(target: "mesh.media", device_id = pending.device_id(), "Video switch aborted");
        }
    }

    /// Stop every track.
    pub fn release(&mut self) {
        self.abort_video_switch();
        if let Some(stream) = self.stream.take() {
            stream.stop_all();
            info!(target: "mesh.media", "Local media released");
        }
    }
}

impl Drop for LocalMediaController {
    fn drop(&mut self) {
        if self.stream.is_some() || self.pending_video.is_some() {
            warn!(target: "mesh.media", "Media controller dropped with live tracks; stopping them");
            self.release();
        }
    }
}
