//! Camera access via nokhwa
//!
//! nokhwa cameras are driven from a dedicated thread; the track talks to it
//! over a command channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};

use nokhwa::Camera;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType};

use super::{CameraDevice, VideoFrame, VideoTrack};
use crate::{Error, Result};

enum CameraCommand {
    Grab(std_mpsc::Sender<Result<VideoFrame>>),
    Stop,
}

/// List cameras known to the platform backend
///
/// # Errors
///
/// Returns error if the platform refuses enumeration
pub fn enumerate() -> Result<Vec<CameraDevice>> {
    let cameras =
        nokhwa::query(ApiBackend::Auto).map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    Ok(cameras
        .iter()
        .enumerate()
        .map(|(i, info)| CameraDevice {
            index: u32::try_from(i).unwrap_or(u32::MAX),
            label: info.human_name(),
        })
        .collect())
}

/// An open camera
pub struct CameraTrack {
    device: CameraDevice,
    commands: Mutex<std_mpsc::Sender<CameraCommand>>,
    live: Arc<AtomicBool>,
}

impl CameraTrack {
    /// Open a camera and start streaming
    ///
    /// # Errors
    ///
    /// Returns `Error::DeviceUnavailable` if the camera cannot be opened
    pub async fn open(device: CameraDevice) -> Result<Self> {
        let (command_tx, command_rx) = std_mpsc::channel::<CameraCommand>();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<Result<()>>();
        let live = Arc::new(AtomicBool::new(false));

        let index = device.index;
        let thread_live = Arc::clone(&live);
        std::thread::Builder::new()
            .name("silvercare-camera".to_string())
            .spawn(move || camera_thread(index, &command_rx, ready_tx, &thread_live))?;

        ready_rx
            .await
            .map_err(|_| Error::DeviceUnavailable("camera thread exited".to_string()))??;

        tracing::debug!(camera = %device.label, "camera opened");
        Ok(Self {
            device,
            commands: Mutex::new(command_tx),
            live,
        })
    }
}

impl VideoTrack for CameraTrack {
    fn grab_frame(&self) -> Result<VideoFrame> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(CameraCommand::Grab(reply_tx))
            .map_err(|_| Error::Video("camera closed".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| Error::Video("camera closed".to_string()))?
    }

    fn stop(&self) {
        let _ = self
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(CameraCommand::Stop);
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn label(&self) -> String {
        self.device.label.clone()
    }
}

impl Drop for CameraTrack {
    fn drop(&mut self) {
        VideoTrack::stop(self);
    }
}

fn camera_thread(
    index: u32,
    commands: &std_mpsc::Receiver<CameraCommand>,
    ready: tokio::sync::oneshot::Sender<Result<()>>,
    live: &AtomicBool,
) {
    let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
    let mut camera = match Camera::new(CameraIndex::Index(index), format) {
        Ok(camera) => camera,
        Err(e) => {
            let _ = ready.send(Err(Error::DeviceUnavailable(e.to_string())));
            return;
        }
    };
    if let Err(e) = camera.open_stream() {
        let _ = ready.send(Err(Error::DeviceUnavailable(e.to_string())));
        return;
    }
    live.store(true, Ordering::SeqCst);
    let _ = ready.send(Ok(()));

    while let Ok(command) = commands.recv() {
        match command {
            CameraCommand::Grab(reply) => {
                let frame = camera
                    .frame()
                    .and_then(|buffer| buffer.decode_image::<RgbFormat>())
                    .map(|image| VideoFrame {
                        width: image.width(),
                        height: image.height(),
                        rgb: image.into_raw(),
                    })
                    .map_err(|e| Error::Video(e.to_string()));
                let _ = reply.send(frame);
            }
            CameraCommand::Stop => break,
        }
    }

    if let Err(e) = camera.stop_stream() {
        tracing::warn!(error = %e, "camera did not stop cleanly");
    }
    live.store(false, Ordering::SeqCst);
    tracing::debug!(index, "camera released");
}
