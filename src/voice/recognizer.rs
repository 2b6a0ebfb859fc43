//! Continuous speech recognition
//!
//! Recognizers push `RecognitionEvent`s into a channel owned by the
//! listener. Every recognition run ends with exactly one `Ended`, whether it
//! was stopped on purpose or the microphone went away; the listener decides
//! whether to restart.
//!
//! Engines report growing `Interim` hypotheses and leave the decision of
//! where an utterance ends to the listener's segmenter, which signals it back
//! through `utterance_complete`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::codec::{self, INPUT_SAMPLE_RATE};
use super::stt::Transcriber;
use crate::devices::{AudioTrack, MediaBackend, MediaRequest};
use crate::{Error, Result};

/// Minimum audio energy threshold to consider speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum duration of speech to keep a segment (in samples at 16kHz)
const MIN_SPEECH_SAMPLES: usize = 4800; // 0.3 seconds

/// Silence that closes a phrase and triggers a new hypothesis (in samples)
const SILENCE_SAMPLES: usize = 8000; // 0.5 seconds

/// Longest segment sent for transcription in one piece
const MAX_SEGMENT_SAMPLES: usize = INPUT_SAMPLE_RATE as usize * 15;

/// Longest utterance re-transcribed as one hypothesis
const MAX_UTTERANCE_SAMPLES: usize = INPUT_SAMPLE_RATE as usize * 30;

/// How often captured audio is drained from the microphone
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Transcript events produced by a recognizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Current best hypothesis for the utterance in progress
    Interim(String),
    /// Engine-confirmed transcript
    Final(String),
    /// The recognition run ended (stopped, device lost, or engine timeout)
    Ended,
}

/// A continuous speech recognition engine
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Whether this platform can recognize speech at all
    fn is_available(&self) -> bool;

    /// Begin a recognition run that reports into `events`
    ///
    /// # Errors
    ///
    /// Returns error if the engine or microphone cannot be started
    async fn start(&self, events: mpsc::Sender<RecognitionEvent>) -> Result<()>;

    /// End the current run; a no-op when nothing is running
    fn stop(&self);

    /// The listener closed the current utterance; later hypotheses start fresh
    fn utterance_complete(&self) {}
}

/// Recognizer for platforms without a speech engine
#[derive(Debug, Default)]
pub struct UnavailableRecognizer;

#[async_trait]
impl SpeechRecognizer for UnavailableRecognizer {
    fn is_available(&self) -> bool {
        false
    }

    async fn start(&self, _events: mpsc::Sender<RecognitionEvent>) -> Result<()> {
        Err(Error::RecognitionUnavailable(
            "no speech recognition engine configured".to_string(),
        ))
    }

    fn stop(&self) {}
}

/// Segments a 16kHz sample stream into speech chunks by energy
#[derive(Debug, Default)]
pub struct SpeechActivityDetector {
    listening: bool,
    speech_buffer: Vec<f32>,
    silence_counter: usize,
}

impl SpeechActivityDetector {
    /// Create an idle detector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed samples; returns a finished speech segment when one completes
    pub fn process(&mut self, samples: &[f32]) -> Option<Vec<f32>> {
        if samples.is_empty() {
            return None;
        }
        let energy = calculate_energy(samples);
        let is_speech = energy > ENERGY_THRESHOLD;

        if !self.listening {
            if is_speech {
                self.listening = true;
                self.speech_buffer.clear();
                self.speech_buffer.extend_from_slice(samples);
                self.silence_counter = 0;
                tracing::trace!(energy, "speech detected, listening");
            }
            return None;
        }

        self.speech_buffer.extend_from_slice(samples);
        if is_speech {
            self.silence_counter = 0;
        } else {
            self.silence_counter += samples.len();
        }

        // Enough speech followed by silence, or the segment is too long to hold
        if (self.silence_counter > SILENCE_SAMPLES && self.speech_buffer.len() > MIN_SPEECH_SAMPLES)
            || self.speech_buffer.len() >= MAX_SEGMENT_SAMPLES
        {
            tracing::debug!(samples = self.speech_buffer.len(), "speech segment complete");
            self.listening = false;
            self.silence_counter = 0;
            return Some(std::mem::take(&mut self.speech_buffer));
        }

        // Too much silence without enough speech
        if self.silence_counter > SILENCE_SAMPLES * 2 {
            tracing::trace!("timeout - resetting");
            self.reset();
        }

        None
    }

    /// Whether speech is currently being accumulated
    #[must_use]
    pub const fn is_listening(&self) -> bool {
        self.listening
    }

    /// Drop any partial segment
    pub fn reset(&mut self) {
        self.listening = false;
        self.speech_buffer.clear();
        self.silence_counter = 0;
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Recognizer built from local speech detection and a batch transcriber
///
/// Speech is cut into phrases at short pauses. After each phrase the whole
/// utterance so far is transcribed and reported as an `Interim` hypothesis,
/// so a pause mid-sentence never splits it. The microphone is opened per run
/// and released when it ends.
pub struct CloudRecognizer {
    media: Arc<dyn MediaBackend>,
    transcriber: Arc<dyn Transcriber>,
    running: Mutex<Option<CancellationToken>>,
    boundary: Arc<AtomicBool>,
}

impl CloudRecognizer {
    /// Create a recognizer over a media backend and a transcriber
    #[must_use]
    pub fn new(media: Arc<dyn MediaBackend>, transcriber: Arc<dyn Transcriber>) -> Self {
        Self {
            media,
            transcriber,
            running: Mutex::new(None),
            boundary: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl SpeechRecognizer for CloudRecognizer {
    fn is_available(&self) -> bool {
        true
    }

    async fn start(&self, events: mpsc::Sender<RecognitionEvent>) -> Result<()> {
        let stream = self
            .media
            .open(&MediaRequest {
                audio: true,
                camera: None,
            })
            .await?;
        let track = stream
            .audio()
            .cloned()
            .ok_or_else(|| Error::DeviceUnavailable("no microphone track".to_string()))?;

        let cancel = CancellationToken::new();
        let previous = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(cancel.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        tracing::info!(mic = %track.label(), "recognition started");
        self.boundary.store(false, Ordering::SeqCst);
        tokio::spawn(run_recognition(
            track,
            Arc::clone(&self.transcriber),
            events,
            Arc::clone(&self.boundary),
            cancel,
        ));
        Ok(())
    }

    fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cancel) = running {
            tracing::debug!("stopping recognition");
            cancel.cancel();
        }
    }

    fn utterance_complete(&self) {
        self.boundary.store(true, Ordering::SeqCst);
    }
}

async fn run_recognition(
    track: Arc<dyn AudioTrack>,
    transcriber: Arc<dyn Transcriber>,
    events: mpsc::Sender<RecognitionEvent>,
    boundary: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut detector = SpeechActivityDetector::new();
    let mut resampler: Option<codec::StreamResampler> = None;
    let mut utterance: Vec<f32> = Vec::new();
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        if !track.is_live() {
            tracing::warn!("microphone ended, recognition stopping");
            break;
        }

        let frame = track.take_frame();
        if frame.is_empty() {
            continue;
        }
        let mono = codec::downmix(&frame.samples, frame.channels);
        let stream = match resampler.take() {
            Some(stream) if stream.from_rate() == frame.sample_rate => Ok(stream),
            _ => codec::StreamResampler::new(frame.sample_rate, INPUT_SAMPLE_RATE),
        };
        let samples = match stream {
            Ok(stream) => resampler.insert(stream).process(&mono),
            Err(e) => Err(e),
        };
        let samples = match samples {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unresampleable frame");
                resampler = None;
                continue;
            }
        };

        let Some(phrase) = detector.process(&samples) else {
            continue;
        };

        if boundary.swap(false, Ordering::SeqCst) {
            utterance.clear();
        }
        if utterance.len() + phrase.len() > MAX_UTTERANCE_SAMPLES {
            tracing::debug!("utterance too long, starting a new hypothesis");
            utterance.clear();
        }
        utterance.extend_from_slice(&phrase);

        let text = match transcribe_segment(transcriber.as_ref(), &utterance).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "segment transcription failed");
                continue;
            }
        };
        // A stop during transcription discards the result
        if cancel.is_cancelled() {
            break;
        }
        if text.trim().is_empty() {
            continue;
        }
        tracing::debug!(samples = utterance.len(), "utterance hypothesis updated");
        if events.send(RecognitionEvent::Interim(text)).await.is_err() {
            break;
        }
    }

    track.stop();
    let _ = events.send(RecognitionEvent::Ended).await;
    tracing::debug!("recognition run ended");
}

async fn transcribe_segment(transcriber: &dyn Transcriber, segment: &[f32]) -> Result<String> {
    let wav = codec::samples_to_wav(segment, INPUT_SAMPLE_RATE)?;
    transcriber.transcribe(&wav).await
}
