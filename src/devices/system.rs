//! Media backend over the host's real devices

use std::sync::Arc;

use async_trait::async_trait;

use super::{AudioTrack, CameraDevice, MediaBackend, MediaRequest, MediaStream, VideoTrack};
use crate::voice::AudioCapture;
use crate::{Error, Result};

/// Microphone via cpal, cameras via nokhwa when built with `camera`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMediaBackend;

impl SystemMediaBackend {
    /// Create the backend
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaBackend for SystemMediaBackend {
    async fn enumerate_cameras(&self) -> Result<Vec<CameraDevice>> {
        #[cfg(feature = "camera")]
        {
            tokio::task::spawn_blocking(super::camera::enumerate)
                .await
                .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        }

        #[cfg(not(feature = "camera"))]
        {
            Ok(Vec::new())
        }
    }

    async fn open(&self, request: &MediaRequest) -> Result<MediaStream> {
        let audio: Option<Arc<dyn AudioTrack>> = if request.audio {
            let capture = tokio::task::spawn_blocking(AudioCapture::start)
                .await
                .map_err(|e| Error::DeviceUnavailable(e.to_string()))??;
            Some(Arc::new(capture))
        } else {
            None
        };

        let video = match &request.camera {
            Some(camera) => match open_camera(camera).await {
                Ok(track) => Some(track),
                Err(e) => {
                    // All or nothing: release the microphone we just opened
                    if let Some(track) = &audio {
                        track.stop();
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        Ok(MediaStream::new(audio, video))
    }
}

#[cfg(feature = "camera")]
async fn open_camera(camera: &CameraDevice) -> Result<Arc<dyn VideoTrack>> {
    let track = super::camera::CameraTrack::open(camera.clone()).await?;
    Ok(Arc::new(track))
}

#[cfg(not(feature = "camera"))]
#[allow(clippy::unused_async)]
async fn open_camera(camera: &CameraDevice) -> Result<Arc<dyn VideoTrack>> {
    Err(Error::DeviceUnavailable(format!(
        "camera {} requested but camera support is not compiled in",
        camera.label
    )))
}
