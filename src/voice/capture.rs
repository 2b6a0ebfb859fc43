//! Audio capture from microphone

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use super::codec::{AudioFrame, INPUT_SAMPLE_RATE};
use crate::devices::AudioTrack;
use crate::{Error, Result};

/// Captures audio from the default input device
///
/// The cpal stream is owned by a dedicated thread so the capture handle can
/// be shared with async loops; dropping or stopping the handle ends it.
pub struct AudioCapture {
    buffer: Arc<Mutex<Vec<f32>>>,
    sample_rate: u32,
    channels: u16,
    label: String,
    shutdown: Mutex<Option<std_mpsc::Sender<()>>>,
}

impl AudioCapture {
    /// Open the default input device and start capturing
    ///
    /// # Errors
    ///
    /// Returns error if the audio device cannot be opened
    pub fn start() -> Result<Self> {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(StreamConfig, String)>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let thread_buffer = Arc::clone(&buffer);
        std::thread::Builder::new()
            .name("silvercare-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(thread_buffer) {
                    Ok((stream, config, label)) => {
                        let _ = ready_tx.send(Ok((config, label)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = shutdown_rx.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            })?;

        let (config, label) = ready_rx
            .recv()
            .map_err(|_| Error::Audio("capture thread exited during init".to_string()))??;

        tracing::debug!(
            device = %label,
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio capture started"
        );

        Ok(Self {
            buffer,
            sample_rate: config.sample_rate.0,
            channels: config.channels,
            label,
            shutdown: Mutex::new(Some(shutdown_tx)),
        })
    }

    /// Get captured audio buffer and clear it
    ///
    /// Returns the audio samples captured since last call
    #[must_use]
    pub fn take_buffer(&self) -> Vec<f32> {
        self.buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }

    /// Clear the audio buffer
    pub fn clear_buffer(&self) {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.clear();
        }
    }

    /// Stop capturing audio
    pub fn stop(&self) {
        let sender = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
        self.clear_buffer();
    }

    /// Check if currently capturing
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.shutdown
            .lock()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    /// Get the device sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Get the device channel count
    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }
}

impl AudioTrack for AudioCapture {
    fn take_frame(&self) -> AudioFrame {
        AudioFrame::new(self.take_buffer(), self.sample_rate, self.channels)
    }

    fn stop(&self) {
        Self::stop(self);
    }

    fn is_live(&self) -> bool {
        self.is_capturing()
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        Self::stop(self);
    }
}

/// Prefer 16kHz mono, fall back to the device default
fn input_config(device: &cpal::Device) -> Result<StreamConfig> {
    let preferred = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(INPUT_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(INPUT_SAMPLE_RATE)
        });

    if let Some(range) = preferred {
        return Ok(range.with_sample_rate(SampleRate(INPUT_SAMPLE_RATE)).config());
    }

    device
        .default_input_config()
        .map(|c| c.config())
        .map_err(|e| Error::Audio(format!("no suitable audio config found: {e}")))
}

fn build_input_stream(buffer: Arc<Mutex<Vec<f32>>>) -> Result<(cpal::Stream, StreamConfig, String)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;
    let label = device.name().unwrap_or_default();
    let config = input_config(&device)?;

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend_from_slice(data);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    Ok((stream, config, label))
}
