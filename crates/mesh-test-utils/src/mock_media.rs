//! Fake capture devices.

use async_trait::async_trait;
use mesh_client::media::{
    CaptureConstraints, CaptureTrack, LocalStream, MediaDeviceInfo, MediaDevices, TrackKind,
    TrackRef,
};
use mesh_client::MeshError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory capture track.
#[derive(Debug)]
pub struct MockTrack {
    id: String,
    kind: TrackKind,
    device_id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MockTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, device_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            device_id: device_id.into(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }
}

impl CaptureTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Device seam handing out [`MockTrack`]s.
#[derive(Debug, Default)]
pub struct MockMediaDevices {
    refuse: AtomicBool,
    next_id: AtomicUsize,
    acquired: Mutex<Vec<TrackRef>>,
    requests: Mutex<Vec<CaptureConstraints>>,
}

impl MockMediaDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following acquire fail, as if permission was denied.
    pub fn refuse(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    /// Every track handed out so far, oldest first.
    pub fn acquired_tracks(&self) -> Vec<TrackRef> {
        self.acquired.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<CaptureConstraints> {
        self.requests.lock().unwrap().clone()
    }

    /// True once every track handed out has been stopped.
    pub fn all_stopped(&self) -> bool {
        self.acquired.lock().unwrap().iter().all(|t| t.is_stopped())
    }

    fn track(&self, kind: TrackKind, device_id: Option<&str>) -> TrackRef {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let device_id = device_id.unwrap_or(match kind {
            TrackKind::Audio => "default-mic",
            TrackKind::Video => "default-cam",
        });
        let track: TrackRef = Arc::new(MockTrack::new(format!("{kind}-{n}"), kind, device_id));
        self.acquired.lock().unwrap().push(Arc::clone(&track));
        track
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LocalStream, MeshError> {
        self.requests.lock().unwrap().push(constraints.clone());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(MeshError::MediaUnavailable("permission denied".to_string()));
        }

        Ok(LocalStream {
            audio: constraints
                .audio
                .as_ref()
                .map(|a| self.track(TrackKind::Audio, a.device_id.as_deref())),
            video: constraints
                .video
                .as_ref()
                .map(|v| self.track(TrackKind::Video, v.device_id.as_deref())),
        })
    }

    async fn enumerate(&self) -> Result<Vec<MediaDeviceInfo>, MeshError> {
        Ok(vec![
            MediaDeviceInfo {
                device_id: "default-cam".to_string(),
                label: "Built-in camera".to_string(),
                kind: TrackKind::Video,
            },
            MediaDeviceInfo {
                device_id: "usb-cam".to_string(),
                label: "USB camera".to_string(),
                kind: TrackKind::Video,
            },
            MediaDeviceInfo {
                device_id: "default-mic".to_string(),
                label: "Built-in microphone".to_string(),
                kind: TrackKind::Audio,
            },
        ])
    }
}
