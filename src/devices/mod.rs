//! Camera and microphone acquisition
//!
//! `DeviceResourceManager` never raises past its boundary: every acquisition
//! ends in success, degraded (video without microphone) or failed.

#[cfg(feature = "camera")]
mod camera;
mod system;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::voice::AudioFrame;

pub use system::SystemMediaBackend;

/// A live microphone track
pub trait AudioTrack: Send + Sync {
    /// Drain samples captured since the last call
    fn take_frame(&self) -> AudioFrame;

    /// Release the device
    fn stop(&self);

    /// Whether the device is still held
    fn is_live(&self) -> bool;

    /// Human-readable device name
    fn label(&self) -> String;
}

/// A single RGB camera frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Packed RGB8 pixels, row-major
    pub rgb: Vec<u8>,
}

/// A live camera track
pub trait VideoTrack: Send + Sync {
    /// Grab the most recent frame
    ///
    /// # Errors
    ///
    /// Returns error if the camera cannot produce a frame
    fn grab_frame(&self) -> Result<VideoFrame>;

    /// Release the device
    fn stop(&self);

    /// Whether the device is still held
    fn is_live(&self) -> bool;

    /// Human-readable device name
    fn label(&self) -> String;
}

/// Tracks acquired together
#[derive(Clone, Default)]
pub struct MediaStream {
    audio: Option<Arc<dyn AudioTrack>>,
    video: Option<Arc<dyn VideoTrack>>,
}

impl MediaStream {
    /// Bundle tracks into a stream
    #[must_use]
    pub fn new(audio: Option<Arc<dyn AudioTrack>>, video: Option<Arc<dyn VideoTrack>>) -> Self {
        Self { audio, video }
    }

    /// Microphone track, if acquired
    #[must_use]
    pub fn audio(&self) -> Option<&Arc<dyn AudioTrack>> {
        self.audio.as_ref()
    }

    /// Camera track, if acquired
    #[must_use]
    pub fn video(&self) -> Option<&Arc<dyn VideoTrack>> {
        self.video.as_ref()
    }

    /// Whether any track still holds its device
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.audio.as_ref().is_some_and(|t| t.is_live())
            || self.video.as_ref().is_some_and(|t| t.is_live())
    }

    /// Release every track
    pub fn stop(&self) {
        if let Some(track) = &self.audio {
            track.stop();
        }
        if let Some(track) = &self.video {
            track.stop();
        }
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("audio", &self.audio.as_ref().map(|t| t.label()))
            .field("video", &self.video.as_ref().map(|t| t.label()))
            .finish()
    }
}

/// An enumerated camera
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDevice {
    /// Backend index
    pub index: u32,
    /// Human-readable name
    pub label: String,
}

/// What to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    /// Open the default microphone
    pub audio: bool,
    /// Open this camera
    pub camera: Option<CameraDevice>,
}

/// Platform media access
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// List available cameras
    ///
    /// # Errors
    ///
    /// Returns error if enumeration is not permitted
    async fn enumerate_cameras(&self) -> Result<Vec<CameraDevice>>;

    /// Open the requested tracks; all or nothing
    ///
    /// # Errors
    ///
    /// Returns `Error::DeviceUnavailable` if any requested track cannot open
    async fn open(&self, request: &MediaRequest) -> Result<MediaStream>;
}

/// Snapshot of the devices seen on the last acquisition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInventory {
    /// Cameras found
    pub cameras: Vec<CameraDevice>,
    /// Index into `cameras` of the selected device
    pub current_index: usize,
    /// Whether the last acquisition obtained a microphone
    pub mic_available: bool,
}

/// Result of an acquisition attempt
#[derive(Debug)]
pub enum AcquireOutcome {
    /// Everything requested was opened
    Success(MediaStream),
    /// Camera opened but the microphone did not
    Degraded(MediaStream),
    /// Nothing could be opened
    Failed(String),
}

impl AcquireOutcome {
    /// Whether the microphone is missing from an otherwise usable stream
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }

    /// The acquired stream, if any
    #[must_use]
    pub const fn stream(&self) -> Option<&MediaStream> {
        match self {
            Self::Success(stream) | Self::Degraded(stream) => Some(stream),
            Self::Failed(_) => None,
        }
    }
}

/// Acquires, enumerates and falls back across cameras and microphones
pub struct DeviceResourceManager {
    backend: Arc<dyn MediaBackend>,
    inventory: DeviceInventory,
    current: Option<MediaStream>,
    mic_degraded: bool,
}

impl DeviceResourceManager {
    /// Create a manager over a media backend
    #[must_use]
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            inventory: DeviceInventory::default(),
            current: None,
            mic_degraded: false,
        }
    }

    /// Devices seen on the last acquisition
    #[must_use]
    pub const fn inventory(&self) -> &DeviceInventory {
        &self.inventory
    }

    /// Whether the last acquisition fell back to video-only
    #[must_use]
    pub const fn mic_degraded(&self) -> bool {
        self.mic_degraded
    }

    /// Stop the current stream, if any
    pub fn release(&mut self) {
        if let Some(stream) = self.current.take() {
            stream.stop();
            tracing::debug!("media stream released");
        }
    }

    /// Acquire camera and microphone, preferring camera `preferred_index`
    pub async fn acquire(&mut self, preferred_index: usize) -> AcquireOutcome {
        self.release();

        let cameras = match self.backend.enumerate_cameras().await {
            Ok(cameras) => cameras,
            Err(e) => {
                tracing::warn!(error = %e, "camera enumeration failed");
                Vec::new()
            }
        };
        let current_index = if cameras.is_empty() {
            0
        } else {
            preferred_index % cameras.len()
        };
        let camera = cameras.get(current_index).cloned();
        self.inventory = DeviceInventory {
            cameras,
            current_index,
            mic_available: false,
        };

        let combined = MediaRequest {
            audio: true,
            camera: camera.clone(),
        };
        let outcome = match self.backend.open(&combined).await {
            Ok(stream) => {
                tracing::info!(camera = ?camera.as_ref().map(|c| &c.label), "media acquired");
                self.mic_degraded = false;
                self.inventory.mic_available = true;
                AcquireOutcome::Success(stream)
            }
            Err(audio_err) => {
                tracing::warn!(error = %audio_err, "audio+video request failed, retrying video only");
                match camera {
                    Some(camera) => {
                        let video_only = MediaRequest {
                            audio: false,
                            camera: Some(camera),
                        };
                        match self.backend.open(&video_only).await {
                            Ok(stream) => {
                                tracing::warn!("microphone unavailable, continuing video-only");
                                self.mic_degraded = true;
                                AcquireOutcome::Degraded(stream)
                            }
                            Err(video_err) => {
                                tracing::error!(error = %video_err, "media acquisition failed");
                                AcquireOutcome::Failed(format!("{audio_err}; {video_err}"))
                            }
                        }
                    }
                    None => {
                        tracing::error!("no camera to fall back to");
                        AcquireOutcome::Failed(audio_err.to_string())
                    }
                }
            }
        };

        self.current = outcome.stream().cloned();
        outcome
    }

    /// Advance to the next camera and re-acquire
    pub async fn cycle(&mut self) -> AcquireOutcome {
        let count = self.inventory.cameras.len().max(1);
        let next = (self.inventory.current_index + 1) % count;
        tracing::debug!(next, "cycling camera");
        self.acquire(next).await
    }
}

impl Drop for DeviceResourceManager {
    fn drop(&mut self) {
        self.release();
    }
}
