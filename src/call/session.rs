//! Live duplex audio/video session with the remote agent
//!
//! A session runs three loops while `Active`: microphone capture (every
//! `capture_interval`), camera frames (every `video_interval`) and the
//! receive loop that feeds the shared playback timeline. Closing the session
//! cancels every loop, stops every media track and flushes playback.
//!
//! The loops look up their track on every tick, so media can be swapped
//! (switching cameras) without reconnecting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::{InboundEvent, MediaChunk, OutboundMessage, SessionSetup};
use super::transport::AgentTransport;
use super::video::FrameEncoder;
use crate::devices::{AudioTrack, MediaStream, VideoTrack};
use crate::voice::{PlaybackScheduler, codec};
use crate::{Error, Result};

/// Lifecycle of a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    /// Connecting to the agent
    Connecting,
    /// Media flowing both ways
    Active,
    /// Ended; the session cannot be reused
    Closed,
    /// Connection failed or was lost; `retry` or `close`
    Error(String),
}

/// Who said a transcript line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The person at the device
    User,
    /// The remote agent
    Agent,
}

/// One completed turn of speech
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    /// Who spoke
    pub speaker: Speaker,
    /// What was said
    pub text: String,
    /// When the turn completed
    pub at: DateTime<Utc>,
}

/// Timing and encoding settings for a call
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Session configuration sent on connect
    pub setup: SessionSetup,
    /// Microphone send interval
    pub capture_interval: Duration,
    /// Camera send interval
    pub video_interval: Duration,
    /// Outbound frame width in pixels
    pub video_width: u32,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
}

#[derive(Default)]
struct TranscriptState {
    log: Vec<TranscriptEntry>,
    user: String,
    agent: String,
}

impl TranscriptState {
    /// Move aggregated fragments into the log, user first
    fn flush_turn(&mut self) {
        let at = Utc::now();
        for (speaker, buffer) in [(Speaker::User, &mut self.user), (Speaker::Agent, &mut self.agent)] {
            let text = std::mem::take(buffer);
            let text = text.trim();
            if !text.is_empty() {
                self.log.push(TranscriptEntry {
                    speaker,
                    text: text.to_string(),
                    at,
                });
            }
        }
    }
}

struct MediaState {
    stream: MediaStream,
    mic_degraded: bool,
}

/// State shared between the session handle and its loops
struct Shared {
    id: Uuid,
    scheduler: Arc<PlaybackScheduler>,
    media: Mutex<MediaState>,
    muted: AtomicBool,
    transcript: Mutex<TranscriptState>,
    outbound: Mutex<Option<mpsc::Sender<OutboundMessage>>>,
    state: watch::Sender<CallState>,
    cancel: CancellationToken,
}

impl Shared {
    fn transcript(&self) -> MutexGuard<'_, TranscriptState> {
        self.transcript.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::Sender<OutboundMessage>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn media(&self) -> MutexGuard<'_, MediaState> {
        self.media.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Microphone to send from; none when the stream is degraded
    fn audio_track(&self) -> Option<Arc<dyn AudioTrack>> {
        let media = self.media();
        if media.mic_degraded {
            return None;
        }
        media.stream.audio().cloned()
    }

    fn video_track(&self) -> Option<Arc<dyn VideoTrack>> {
        self.media().stream.video().cloned()
    }

    /// Push a media chunk if the session is active; failures drop the chunk
    fn send_media(&self, chunk: MediaChunk) -> bool {
        let outbound = self.outbound();
        let Some(sender) = outbound.as_ref() else {
            return false;
        };
        if *self.state.borrow() != CallState::Active {
            return false;
        }
        match sender.try_send(OutboundMessage::Media(chunk)) {
            Ok(()) => true,
            Err(e) => {
                tracing::trace!(error = %e, "outbound frame dropped");
                false
            }
        }
    }

    fn close(&self) {
        // Held until Closed is set so a concurrent media swap sees it
        let media = self.media();
        if *self.state.borrow() == CallState::Closed {
            return;
        }
        self.cancel.cancel();
        self.outbound().take();
        media.stream.stop();
        let flushed = self.scheduler.flush_all();
        self.state.send_replace(CallState::Closed);
        tracing::info!(session = %self.id, flushed, "call closed");
    }

    /// Drop the connection but keep the media for a retry
    fn fail(&self, reason: String) {
        if *self.state.borrow() == CallState::Closed {
            return;
        }
        self.outbound().take();
        let flushed = self.scheduler.flush_all();
        tracing::warn!(session = %self.id, reason, flushed, "call connection lost");
        self.state.send_replace(CallState::Error(reason));
    }
}

/// A single live call; created per call and never reused
pub struct DuplexCallSession {
    shared: Arc<Shared>,
    transport: Arc<dyn AgentTransport>,
    options: CallOptions,
    attempt: Mutex<Option<CancellationToken>>,
}

impl DuplexCallSession {
    /// Create a session that takes ownership of `media`
    ///
    /// `mic_degraded` suppresses the capture loop for streams acquired
    /// without a microphone.
    #[must_use]
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        scheduler: Arc<PlaybackScheduler>,
        media: MediaStream,
        mic_degraded: bool,
        options: CallOptions,
    ) -> Self {
        let (state, _) = watch::channel(CallState::Connecting);
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                scheduler,
                media: Mutex::new(MediaState {
                    stream: media,
                    mic_degraded,
                }),
                muted: AtomicBool::new(false),
                transcript: Mutex::new(TranscriptState::default()),
                outbound: Mutex::new(None),
                state,
                cancel: CancellationToken::new(),
            }),
            transport,
            options,
            attempt: Mutex::new(None),
        }
    }

    /// Session identifier
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CallState {
        self.shared.state.borrow().clone()
    }

    /// Watch state transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.shared.state.subscribe()
    }

    /// Wait until the session has closed
    pub async fn ended(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|s| *s == CallState::Closed).await;
    }

    /// Connect to the agent and start the media loops
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionConnection` if the agent cannot be reached; the
    /// session is then in `Error` and may be retried
    pub async fn connect(&self) -> Result<()> {
        match self.state() {
            CallState::Connecting | CallState::Error(_) => {}
            CallState::Active => return Ok(()),
            CallState::Closed => {
                return Err(Error::SessionConnection("session already closed".to_string()));
            }
        }
        self.shared.state.send_replace(CallState::Connecting);
        tracing::info!(session = %self.shared.id, "call connecting");

        let connection = match self.transport.connect(&self.options.setup).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!(session = %self.shared.id, error = %e, "call connection failed");
                if self.state() != CallState::Closed {
                    self.shared.state.send_replace(CallState::Error(e.to_string()));
                }
                return Err(match e {
                    Error::SessionConnection(_) => e,
                    other => Error::SessionConnection(other.to_string()),
                });
            }
        };

        // Closed while connecting: the connection is dropped here
        if self.shared.cancel.is_cancelled() {
            return Err(Error::SessionConnection("session closed while connecting".to_string()));
        }

        let attempt = self.shared.cancel.child_token();
        if let Some(previous) = self
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(attempt.clone())
        {
            previous.cancel();
        }

        *self.shared.outbound() = Some(connection.outbound);
        self.shared.state.send_replace(CallState::Active);
        let mic_degraded = self.mic_degraded();
        tracing::info!(session = %self.shared.id, mic_degraded, "call active");
        if mic_degraded {
            tracing::warn!(session = %self.shared.id, "no microphone, capture suppressed");
        }

        tokio::spawn(receive_loop(
            Arc::clone(&self.shared),
            connection.inbound,
            attempt.clone(),
        ));
        tokio::spawn(capture_loop(
            Arc::clone(&self.shared),
            self.options.capture_interval,
            attempt.clone(),
        ));
        tokio::spawn(video_loop(
            Arc::clone(&self.shared),
            FrameEncoder::new(self.options.video_width, self.options.jpeg_quality),
            self.options.video_interval,
            attempt,
        ));

        Ok(())
    }

    /// Reconnect after a connection error
    ///
    /// # Errors
    ///
    /// Returns error if the session is not in `Error` or reconnecting fails
    pub async fn retry(&self) -> Result<()> {
        if !matches!(self.state(), CallState::Error(_)) {
            return Err(Error::SessionConnection(
                "retry is only possible after a connection error".to_string(),
            ));
        }
        tracing::info!(session = %self.shared.id, "retrying call");
        self.connect().await
    }

    /// Stop every loop, release media and end the session; idempotent
    pub fn close(&self) {
        self.shared.close();
    }

    /// Swap in freshly acquired media, stopping the previous tracks
    ///
    /// A closed session stops `stream` instead of keeping it.
    pub fn replace_media(&self, stream: MediaStream, mic_degraded: bool) {
        let previous = {
            let mut media = self.shared.media();
            if *self.shared.state.borrow() == CallState::Closed {
                drop(media);
                stream.stop();
                return;
            }
            std::mem::replace(
                &mut *media,
                MediaState {
                    stream,
                    mic_degraded,
                },
            )
        };
        previous.stream.stop();
        tracing::info!(session = %self.shared.id, mic_degraded, "call media replaced");
    }

    /// Mute or unmute the outbound microphone
    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::SeqCst);
        tracing::debug!(session = %self.shared.id, muted, "call mute changed");
    }

    /// Whether the outbound microphone is muted
    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::SeqCst)
    }

    /// Whether the stream was acquired without a microphone
    #[must_use]
    pub fn mic_degraded(&self) -> bool {
        self.shared.media().mic_degraded
    }

    /// Label of the camera frames are taken from
    #[must_use]
    pub fn camera_label(&self) -> Option<String> {
        self.shared.video_track().map(|track| track.label())
    }

    /// Completed turns so far
    #[must_use]
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.shared.transcript().log.clone()
    }
}

impl Drop for DuplexCallSession {
    fn drop(&mut self) {
        self.shared.close();
    }
}

async fn capture_loop(shared: Arc<Shared>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut encoder = codec::WireEncoder::new();
    let mut current: Option<Arc<dyn AudioTrack>> = None;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let Some(track) = shared.audio_track() else {
            continue;
        };
        if !current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &track)) {
            encoder.reset();
            current = Some(Arc::clone(&track));
        }
        // Drain even while muted so unmuting does not send stale audio
        let frame = track.take_frame();
        if shared.muted.load(Ordering::SeqCst) || frame.is_empty() {
            continue;
        }
        match encoder.encode(&frame) {
            Ok(data) if !data.is_empty() => {
                shared.send_media(MediaChunk::audio(data));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::trace!(error = %e, "audio frame dropped");
                encoder.reset();
            }
        }
    }
    tracing::debug!(session = %shared.id, "capture loop stopped");
}

async fn video_loop(
    shared: Arc<Shared>,
    encoder: FrameEncoder,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(track) = shared.video_track().filter(|t| t.is_live()) else {
            continue;
        };

        let encoded = tokio::task::spawn_blocking(move || {
            let frame = track.grab_frame()?;
            encoder.encode(&frame)
        })
        .await;

        match encoded {
            Ok(Ok(data)) if !cancel.is_cancelled() => {
                shared.send_media(MediaChunk::jpeg(data));
            }
            Ok(Ok(_)) => break,
            Ok(Err(e)) => tracing::trace!(error = %e, "video frame dropped"),
            Err(e) => tracing::warn!(error = %e, "video frame task failed"),
        }
    }
    tracing::debug!(session = %shared.id, "video loop stopped");
}

async fn receive_loop(
    shared: Arc<Shared>,
    mut inbound: mpsc::Receiver<InboundEvent>,
    cancel: CancellationToken,
) {
    let failure = loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            event = inbound.recv() => event,
        };
        let Some(event) = event else {
            break Some("agent connection dropped".to_string());
        };

        match event {
            InboundEvent::SetupComplete => {
                tracing::debug!(session = %shared.id, "agent setup complete");
            }
            InboundEvent::Audio { data, sample_rate } => {
                let buffer = codec::decode(&data)
                    .and_then(|bytes| codec::decode_audio_data(&bytes, sample_rate, 1));
                match buffer {
                    Ok(buffer) => {
                        shared.scheduler.enqueue(&buffer);
                    }
                    Err(e) => tracing::warn!(error = %e, "undecodable agent audio dropped"),
                }
            }
            InboundEvent::InputTranscript(text) => shared.transcript().user.push_str(&text),
            InboundEvent::OutputTranscript(text) => shared.transcript().agent.push_str(&text),
            InboundEvent::TurnComplete => shared.transcript().flush_turn(),
            InboundEvent::Interrupted => {
                let flushed = shared.scheduler.flush_all();
                tracing::debug!(session = %shared.id, flushed, "agent interrupted, playback flushed");
            }
            InboundEvent::Closed(reason) => {
                tracing::info!(session = %shared.id, reason = ?reason, "agent closed the call");
                break None;
            }
            InboundEvent::Failed(reason) => break Some(reason),
        }
    };

    if cancel.is_cancelled() {
        return;
    }
    match failure {
        None => shared.close(),
        Some(reason) => {
            // Stops this attempt's capture and video loops
            cancel.cancel();
            shared.fail(reason);
        }
    }
}
