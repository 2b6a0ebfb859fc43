//! Shared test utilities
//!
//! In-memory stand-ins for every external collaborator. The fake output
//! clock follows tokio time, so tests run with `start_paused = true`.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;

use silvercare_voice::call::{
    AgentConnection, AgentTransport, InboundEvent, OutboundMessage, SessionSetup,
};
use silvercare_voice::devices::{
    AudioTrack, CameraDevice, MediaBackend, MediaRequest, MediaStream, VideoFrame, VideoTrack,
};
use silvercare_voice::services::{DialogueContext, IntentAction, IntentService, ReplyGenerator, TextStream};
use silvercare_voice::voice::{
    AudioFrame, AudioOutput, OUTPUT_SAMPLE_RATE, PlayableBuffer, PlaybackScheduler,
    RecognitionEvent, SentenceStreamingTts, SourceId, SpeechRecognizer, SpeechSynthesizer,
};
use silvercare_voice::{Error, Result};

/// Output device whose clock is tokio time since creation
pub struct FakeOutput {
    origin: Instant,
    next_id: AtomicU64,
    pub started: Mutex<Vec<(SourceId, f64)>>,
    pub stopped: Mutex<Vec<SourceId>>,
}

impl FakeOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            next_id: AtomicU64::new(1),
            started: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
        })
    }
}

impl AudioOutput for FakeOutput {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn start(&self, _buffer: &PlayableBuffer, at: f64) -> Result<SourceId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push((id, at));
        Ok(id)
    }

    fn stop(&self, id: SourceId) {
        self.stopped.lock().unwrap().push(id);
    }
}

/// Scheduler over a fresh fake output
pub fn scheduler() -> (Arc<PlaybackScheduler>, Arc<FakeOutput>) {
    let output = FakeOutput::new();
    (Arc::new(PlaybackScheduler::new(output.clone())), output)
}

/// Silent buffer at the output rate
pub fn silence(duration: Duration) -> PlayableBuffer {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let frames = (duration.as_secs_f64() * f64::from(OUTPUT_SAMPLE_RATE)) as usize;
    PlayableBuffer::new(vec![0.0; frames], OUTPUT_SAMPLE_RATE, 1).unwrap()
}

/// Synthesizer that returns half a second of silence per clause
pub struct FakeSynth {
    pub spoken: Mutex<Vec<String>>,
    pub fail_on: Option<String>,
}

impl FakeSynth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            spoken: Mutex::new(Vec::new()),
            fail_on: None,
        })
    }

    pub fn failing_on(text: &str) -> Arc<Self> {
        Arc::new(Self {
            spoken: Mutex::new(Vec::new()),
            fail_on: Some(text.to_string()),
        })
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynth {
    async fn synthesize(&self, text: &str) -> Result<PlayableBuffer> {
        if self.fail_on.as_deref().is_some_and(|f| text.contains(f)) {
            return Err(Error::Tts("synthesis failed".to_string()));
        }
        self.spoken.lock().unwrap().push(text.to_string());
        Ok(silence(Duration::from_millis(500)))
    }
}

/// Streaming speaker over a fake output and synthesizer
pub fn speaker() -> (Arc<SentenceStreamingTts>, Arc<FakeOutput>, Arc<FakeSynth>) {
    let (scheduler, output) = scheduler();
    let synth = FakeSynth::new();
    (
        Arc::new(SentenceStreamingTts::new(scheduler, synth.clone())),
        output,
        synth,
    )
}

/// Track that stands in for both a microphone and a camera
pub struct FakeTrack {
    live: AtomicBool,
}

impl FakeTrack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            live: AtomicBool::new(true),
        })
    }
}

impl AudioTrack for FakeTrack {
    fn take_frame(&self) -> AudioFrame {
        AudioFrame::new(vec![0.1; 1600], 16_000, 1)
    }
    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
    fn label(&self) -> String {
        "fake".to_string()
    }
}

impl VideoTrack for FakeTrack {
    fn grab_frame(&self) -> Result<VideoFrame> {
        Ok(VideoFrame {
            width: 4,
            height: 4,
            rgb: vec![128; 4 * 4 * 3],
        })
    }
    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
    fn label(&self) -> String {
        "fake".to_string()
    }
}

/// Media backend with a configurable number of cameras and mic permission
pub struct FakeMedia {
    pub cameras: usize,
    pub mic_ok: bool,
    pub requests: Mutex<Vec<MediaRequest>>,
    pub opened: Mutex<Vec<MediaStream>>,
}

impl FakeMedia {
    pub fn new(cameras: usize, mic_ok: bool) -> Arc<Self> {
        Arc::new(Self {
            cameras,
            mic_ok,
            requests: Mutex::new(Vec::new()),
            opened: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl MediaBackend for FakeMedia {
    async fn enumerate_cameras(&self) -> Result<Vec<CameraDevice>> {
        Ok((0..self.cameras)
            .map(|i| CameraDevice {
                index: u32::try_from(i).unwrap(),
                label: format!("camera {i}"),
            })
            .collect())
    }

    async fn open(&self, request: &MediaRequest) -> Result<MediaStream> {
        self.requests.lock().unwrap().push(request.clone());
        if request.audio && !self.mic_ok {
            return Err(Error::DeviceUnavailable("microphone denied".to_string()));
        }
        let audio: Option<Arc<dyn AudioTrack>> = request.audio.then(|| {
            let track: Arc<dyn AudioTrack> = FakeTrack::new();
            track
        });
        let video: Option<Arc<dyn VideoTrack>> = request.camera.as_ref().map(|_| {
            let track: Arc<dyn VideoTrack> = FakeTrack::new();
            track
        });
        let stream = MediaStream::new(audio, video);
        self.opened.lock().unwrap().push(stream.clone());
        Ok(stream)
    }
}

/// The test's side of one agent connection
pub struct FakeConnection {
    pub setup: SessionSetup,
    pub outbound: mpsc::Receiver<OutboundMessage>,
    pub inbound: mpsc::Sender<InboundEvent>,
}

/// Agent transport that hands connections to the test
pub struct FakeTransport {
    pub fail: AtomicBool,
    pub attempts: AtomicUsize,
    connections: Mutex<VecDeque<FakeConnection>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            connections: Mutex::new(VecDeque::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        let transport = Self::new();
        transport.fail.store(true, Ordering::SeqCst);
        transport
    }

    /// Oldest connection not yet taken by the test
    pub fn take_connection(&self) -> Option<FakeConnection> {
        self.connections.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl AgentTransport for FakeTransport {
    async fn connect(&self, setup: &SessionSetup) -> Result<AgentConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::SessionConnection("agent unreachable".to_string()));
        }
        let (connection, outbound, inbound) = AgentConnection::pair();
        self.connections.lock().unwrap().push_back(FakeConnection {
            setup: setup.clone(),
            outbound,
            inbound,
        });
        Ok(connection)
    }
}

/// Intent service that records calls and replays scripted answers
pub struct FakeIntent {
    pub calls: Mutex<Vec<(String, DialogueContext)>>,
    answers: Mutex<VecDeque<Result<IntentAction>>>,
}

impl FakeIntent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            answers: Mutex::new(VecDeque::new()),
        })
    }

    pub fn answer(&self, answer: Result<IntentAction>) {
        self.answers.lock().unwrap().push_back(answer);
    }

    pub fn calls(&self) -> Vec<(String, DialogueContext)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl IntentService for FakeIntent {
    async fn classify(&self, text: &str, context: &DialogueContext) -> Result<IntentAction> {
        self.calls
            .lock()
            .unwrap()
            .push((text.to_string(), context.clone()));
        self.answers.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(IntentAction::Reply {
                spoken_reply: Some("好的。".to_string()),
            })
        })
    }
}

/// Reply generator that streams fixed chunks
pub struct FakeReplies {
    pub chunks: Vec<String>,
    pub prompts: Mutex<Vec<String>>,
    /// Delay before every chunk after the first
    pub pause: Option<Duration>,
}

impl FakeReplies {
    pub fn new(chunks: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            chunks: chunks.iter().map(ToString::to_string).collect(),
            prompts: Mutex::new(Vec::new()),
            pause: None,
        })
    }

    pub fn slow(chunks: &[&str], pause: Duration) -> Arc<Self> {
        Arc::new(Self {
            chunks: chunks.iter().map(ToString::to_string).collect(),
            prompts: Mutex::new(Vec::new()),
            pause: Some(pause),
        })
    }
}

#[async_trait]
impl ReplyGenerator for FakeReplies {
    async fn generate(&self, prompt: &str) -> Result<TextStream> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let pause = self.pause;
        let chunks: Vec<String> = self.chunks.clone();
        let stream = futures::stream::iter(chunks.into_iter().enumerate()).then(
            move |(i, chunk)| async move {
                if let Some(pause) = pause.filter(|_| i > 0) {
                    tokio::time::sleep(pause).await;
                }
                Ok(chunk)
            },
        );
        Ok(Box::pin(stream))
    }
}

/// Recognizer driven by the test
///
/// Every `stop` ends the current run with `Ended`, like a real engine.
pub struct FakeRecognizer {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub utterances: AtomicUsize,
    sender: Mutex<Option<mpsc::Sender<RecognitionEvent>>>,
}

impl FakeRecognizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            utterances: AtomicUsize::new(0),
            sender: Mutex::new(None),
        })
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().unwrap().is_some()
    }

    /// Deliver an event to the current run; false if nothing is running
    pub async fn emit(&self, event: RecognitionEvent) -> bool {
        let sender = self.sender.lock().unwrap().clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl SpeechRecognizer for FakeRecognizer {
    fn is_available(&self) -> bool {
        true
    }

    async fn start(&self, events: mpsc::Sender<RecognitionEvent>) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.sender.lock().unwrap() = Some(events);
        Ok(())
    }

    fn stop(&self) {
        if let Some(sender) = self.sender.lock().unwrap().take() {
            self.stops.fetch_add(1, Ordering::SeqCst);
            let _ = sender.try_send(RecognitionEvent::Ended);
        }
    }

    fn utterance_complete(&self) {
        self.utterances.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `condition` on tokio time until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
