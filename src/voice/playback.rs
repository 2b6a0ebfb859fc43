//! Gapless playback scheduling on a single output timeline
//!
//! Every buffer's start time derives from the previous buffer's computed end,
//! so playback never overlaps and always follows enqueue order. `flush_all`
//! is the only way audio is cancelled.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use super::codec::{self, OUTPUT_SAMPLE_RATE, PlayableBuffer};
use crate::{Error, Result};

/// Handle of a source scheduled on an output device
pub type SourceId = u64;

/// An output device with its own clock
pub trait AudioOutput: Send + Sync {
    /// Seconds elapsed on the device clock
    fn current_time(&self) -> f64;

    /// Schedule `buffer` to start at device time `at`
    ///
    /// # Errors
    ///
    /// Returns error if the device is unavailable
    fn start(&self, buffer: &PlayableBuffer, at: f64) -> Result<SourceId>;

    /// Stop a scheduled or playing source immediately
    fn stop(&self, id: SourceId);
}

/// A buffer placed on the timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    /// Device handle
    pub id: SourceId,
    /// Device time the buffer starts
    pub start: f64,
    /// Device time the buffer ends
    pub end: f64,
}

#[derive(Debug, Default)]
struct SchedulerState {
    next_start_time: f64,
    active: Vec<ScheduledPlayback>,
}

impl SchedulerState {
    fn prune(&mut self, now: f64) {
        self.active.retain(|source| source.end > now);
    }
}

/// Owns the single audio output timeline
pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    state: Mutex<SchedulerState>,
}

impl PlaybackScheduler {
    /// Create a scheduler over an output device
    #[must_use]
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current device time in seconds
    #[must_use]
    pub fn now(&self) -> f64 {
        self.output.current_time()
    }

    /// Append a buffer to the timeline
    ///
    /// Returns `None` when the buffer is empty or the device refused it; both
    /// cases leave the timeline untouched.
    pub fn enqueue(&self, buffer: &PlayableBuffer) -> Option<ScheduledPlayback> {
        if buffer.frames() == 0 {
            return None;
        }

        let now = self.output.current_time();
        let mut state = self.state();
        state.prune(now);

        let start = state.next_start_time.max(now);
        match self.output.start(buffer, start) {
            Ok(id) => {
                let scheduled = ScheduledPlayback {
                    id,
                    start,
                    end: start + buffer.duration_secs(),
                };
                state.next_start_time = scheduled.end;
                state.active.push(scheduled);
                tracing::trace!(id, start, end = scheduled.end, "buffer scheduled");
                Some(scheduled)
            }
            Err(e) => {
                tracing::warn!(error = %e, "output unavailable, dropping buffer");
                None
            }
        }
    }

    /// Stop everything and reset the timeline to "now"
    ///
    /// Returns the number of sources that were stopped. Calling it on an
    /// empty timeline is a no-op.
    pub fn flush_all(&self) -> usize {
        let mut state = self.state();
        let stopped = std::mem::take(&mut state.active);
        state.next_start_time = 0.0;
        drop(state);

        for source in &stopped {
            self.output.stop(source.id);
        }

        if !stopped.is_empty() {
            tracing::debug!(stopped = stopped.len(), "playback flushed");
        }
        stopped.len()
    }

    /// Number of sources scheduled or still playing
    #[must_use]
    pub fn active_count(&self) -> usize {
        let now = self.output.current_time();
        let mut state = self.state();
        state.prune(now);
        state.active.len()
    }

    /// Device time the next buffer would start at, before clamping to now
    #[must_use]
    pub fn next_start_time(&self) -> f64 {
        self.state().next_start_time
    }

    /// Time left until the timeline drains
    #[must_use]
    pub fn remaining(&self) -> Duration {
        let now = self.output.current_time();
        let next = self.state().next_start_time;
        Duration::from_secs_f64((next - now).max(0.0))
    }

    /// Wait until everything currently scheduled has played
    pub async fn wait_idle(&self) {
        let remaining = self.remaining();
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }
    }
}

struct MixSource {
    id: SourceId,
    start_frame: u64,
    samples: Arc<[f32]>,
}

impl MixSource {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

#[derive(Default)]
struct Mixer {
    frames_rendered: u64,
    next_id: SourceId,
    sources: Vec<MixSource>,
}

/// Plays scheduled buffers to the default output device
///
/// The cpal stream lives on its own thread (cpal streams aren't `Send`) and
/// mixes sources against a frame counter that doubles as the device clock.
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    sample_rate: u32,
    shutdown: Mutex<Option<std_mpsc::Sender<()>>>,
}

impl CpalOutput {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns error if no output device or stream config is available
    pub fn new() -> Result<Self> {
        let mixer = Arc::new(Mutex::new(Mixer::default()));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let thread_mixer = Arc::clone(&mixer);
        std::thread::Builder::new()
            .name("silvercare-playback".to_string())
            .spawn(move || {
                let stream = match build_output_stream(thread_mixer) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Blocks until the owner is dropped
                let _ = shutdown_rx.recv();
                drop(stream);
                tracing::debug!("audio playback stopped");
            })?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| Error::Audio("playback thread exited during init".to_string()))??;

        Ok(Self {
            mixer,
            sample_rate,
            shutdown: Mutex::new(Some(shutdown_tx)),
        })
    }

    fn mixer(&self) -> MutexGuard<'_, Mixer> {
        self.mixer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AudioOutput for CpalOutput {
    #[allow(clippy::cast_precision_loss)]
    fn current_time(&self) -> f64 {
        self.mixer().frames_rendered as f64 / f64::from(self.sample_rate)
    }

    fn start(&self, buffer: &PlayableBuffer, at: f64) -> Result<SourceId> {
        if self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
        {
            return Err(Error::Playback("output closed".to_string()));
        }

        let mono = codec::downmix(buffer.samples(), buffer.channels());
        let samples: Arc<[f32]> =
            codec::resample(&mono, buffer.sample_rate(), self.sample_rate)?.into();

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let start_frame = (at.max(0.0) * f64::from(self.sample_rate)).round() as u64;

        let mut mixer = self.mixer();
        mixer.next_id += 1;
        let id = mixer.next_id;
        mixer.sources.push(MixSource {
            id,
            start_frame,
            samples,
        });
        Ok(id)
    }

    fn stop(&self, id: SourceId) {
        self.mixer().sources.retain(|source| source.id != id);
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Some(tx) = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }
    }
}

/// Pick an output config, preferring the synthesis rate
fn output_config(device: &cpal::Device) -> Result<StreamConfig> {
    let preferred = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter(|c| {
            c.min_sample_rate() <= SampleRate(OUTPUT_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(OUTPUT_SAMPLE_RATE)
        })
        .min_by_key(cpal::SupportedStreamConfigRange::channels);

    if let Some(range) = preferred {
        return Ok(range.with_sample_rate(SampleRate(OUTPUT_SAMPLE_RATE)).config());
    }

    // Fallback: device default, buffers get resampled on submission
    device
        .default_output_config()
        .map(|c| c.config())
        .map_err(|e| Error::Audio(format!("no suitable output config found: {e}")))
}

fn build_output_stream(mixer: Arc<Mutex<Mixer>>) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let config = output_config(&device)?;
    let channels = usize::from(config.channels);
    let sample_rate = config.sample_rate.0;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio playback initialized"
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut guard) = mixer.lock() else {
                    data.fill(0.0);
                    return;
                };
                let Mixer {
                    frames_rendered,
                    sources,
                    ..
                } = &mut *guard;

                for frame in data.chunks_mut(channels) {
                    let t = *frames_rendered;
                    let mut value = 0.0f32;
                    for source in sources.iter() {
                        if t >= source.start_frame {
                            #[allow(clippy::cast_possible_truncation)]
                            let index = (t - source.start_frame) as usize;
                            if let Some(sample) = source.samples.get(index) {
                                value += sample;
                            }
                        }
                    }
                    frame.fill(value.clamp(-1.0, 1.0));
                    *frames_rendered += 1;
                }

                let now = *frames_rendered;
                sources.retain(|source| source.end_frame() > now);
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok((stream, sample_rate))
}
