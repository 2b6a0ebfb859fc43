//! Companion - the voice-first assistant loop
//!
//! Wires speech recognition through segmentation and the wake word dialogue
//! to the intent service, performs the resulting actions, and owns the single
//! live call slot. The wake word listener and a call never hold the
//! microphone at the same time.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::call::{AgentTransport, CallState, DuplexCallSession};
use crate::config::{CallConfig, Config, DialogueConfig};
use crate::devices::{AcquireOutcome, DeviceResourceManager, MediaBackend};
use crate::events::{AssistantStatus, CompanionEvent, EventBus, ExternalSignal};
use crate::services::{DialogueContext, IntentAction, IntentService, ReplyGenerator, Route};
use crate::voice::{
    DialogueDecision, DialogueState, RecognitionEvent, SentenceStreamingTts, SpeechRecognizer,
    SpeechSegmenter, SubmitMode, WakeWordDialogue,
};
use crate::{Error, Result};

/// Reply spoken after a reminder is handed off without a spoken reply
const REMINDER_CONFIRMATION: &str = "好的，已经帮您记下了。";

/// Commands from the user interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompanionCommand {
    /// Start a live call, ending any current one
    StartCall,
    /// Reconnect a call that failed to connect
    RetryCall,
    /// End the live call
    EndCall,
    /// Move the live call to the next camera
    SwitchCamera,
    /// Mute or unmute the microphone
    SetMuted(bool),
    /// A typed message; skips the wake word
    SendText(String),
    /// Stop the companion
    Shutdown,
}

/// Session-scoped flags
///
/// Created with the companion and dropped with it, so nothing leaks between
/// sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionContext {
    /// Microphone muted by the user or a collaborator
    pub muted: bool,
    /// The current call was acquired without a microphone
    pub mic_degraded: bool,
    /// The last remote call hit a quota or outage
    pub assistant_busy: bool,
}

/// Decides when speech recognition may (re)start
///
/// Recognition restarts on every natural end unless it was suppressed (a
/// prompt is playing, a call owns the microphone) or closed for good. A run
/// that is still winding down blocks a new start; its `Ended` event performs
/// the restart instead, so a stop/start race cannot double-start.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecognitionGuard {
    running: bool,
    suppressed: bool,
    closed: bool,
}

impl RecognitionGuard {
    /// Whether a new run may start now
    #[must_use]
    pub const fn may_start(&self) -> bool {
        !self.running && !self.suppressed && !self.closed
    }

    /// Claim the right to start; false if a start is not allowed
    pub const fn begin(&mut self) -> bool {
        if self.may_start() {
            self.running = true;
            true
        } else {
            false
        }
    }

    /// A start attempt failed without producing a run
    pub const fn start_failed(&mut self) {
        self.running = false;
    }

    /// A run ended; returns whether to restart
    pub const fn ended(&mut self) -> bool {
        self.running = false;
        self.may_start()
    }

    /// Block restarts until `resume`
    pub const fn suppress(&mut self) {
        self.suppressed = true;
    }

    /// Allow restarts again
    pub const fn resume(&mut self) {
        self.suppressed = false;
    }

    /// Never start again
    pub const fn close(&mut self) {
        self.closed = true;
    }

    /// Whether a run is in progress
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Whether restarts are blocked
    #[must_use]
    pub const fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Whether the guard is closed for good
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }
}

/// What a turn in flight is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnKind {
    /// Playing the wake word prompt with capture suspended
    Acknowledge,
    /// Waiting on the intent service
    Classify,
    /// Generating or speaking a reply
    Speak,
}

/// Result a turn hands back to the loop
#[derive(Debug)]
enum TurnEvent {
    Classified {
        text: String,
        result: Result<IntentAction>,
    },
    Failed(Error),
    Acknowledged,
    /// The reply before a call has played out
    CallRequested,
    Finished,
}

/// Slow work running off the loop; one at a time
struct Turn {
    id: u64,
    kind: TurnKind,
    cancel: CancellationToken,
}

/// External collaborators the companion drives
pub struct CompanionDeps {
    /// Continuous speech recognition
    pub recognizer: Arc<dyn SpeechRecognizer>,
    /// Intent classification
    pub intent: Arc<dyn IntentService>,
    /// Streamed reply generation
    pub replies: Arc<dyn ReplyGenerator>,
    /// Clause-streaming speech output
    pub speech: Arc<SentenceStreamingTts>,
    /// Camera and microphone access for calls
    pub media: Arc<dyn MediaBackend>,
    /// Realtime agent connections
    pub transport: Arc<dyn AgentTransport>,
}

/// The voice companion
pub struct Companion {
    deps: CompanionDeps,
    dialogue_config: DialogueConfig,
    call_config: CallConfig,
    language: String,
    listen_enabled: bool,
    bus: EventBus,
    context: SessionContext,
    dialogue: WakeWordDialogue,
    segmenter: SpeechSegmenter,
    guard: RecognitionGuard,
    unavailable_reported: bool,
    devices: DeviceResourceManager,
    call: Option<Arc<DuplexCallSession>>,
    route: Route,
    recognition_tx: mpsc::Sender<RecognitionEvent>,
    recognition_rx: mpsc::Receiver<RecognitionEvent>,
    call_state_tx: mpsc::UnboundedSender<(Uuid, CallState)>,
    call_state_rx: mpsc::UnboundedReceiver<(Uuid, CallState)>,
    turn: Option<Turn>,
    next_turn: u64,
    turn_tx: mpsc::UnboundedSender<(u64, TurnEvent)>,
    turn_rx: mpsc::UnboundedReceiver<(u64, TurnEvent)>,
}

impl Companion {
    /// Create a companion
    ///
    /// # Errors
    ///
    /// Returns error if the dialogue configuration is invalid
    pub fn new(config: &Config, deps: CompanionDeps, bus: EventBus) -> Result<Self> {
        let dialogue = WakeWordDialogue::new(
            config.dialogue.wake_words.clone(),
            config.dialogue.action_keywords.clone(),
            config.dialogue.awaiting_timeout,
        )?;
        let (recognition_tx, recognition_rx) = mpsc::channel(32);
        let (call_state_tx, call_state_rx) = mpsc::unbounded_channel();
        let (turn_tx, turn_rx) = mpsc::unbounded_channel();
        let devices = DeviceResourceManager::new(Arc::clone(&deps.media));

        Ok(Self {
            deps,
            dialogue_config: config.dialogue.clone(),
            call_config: config.call.clone(),
            language: config.locale.tag().to_string(),
            listen_enabled: config.voice.enabled,
            bus,
            context: SessionContext::default(),
            dialogue,
            segmenter: SpeechSegmenter::new(config.dialogue.timeouts),
            guard: RecognitionGuard::default(),
            unavailable_reported: false,
            devices,
            call: None,
            route: Route::Home,
            recognition_tx,
            recognition_rx,
            call_state_tx,
            call_state_rx,
            turn: None,
            next_turn: 0,
            turn_tx,
            turn_rx,
        })
    }

    /// Run until `Shutdown` or the command channel closes
    ///
    /// # Errors
    ///
    /// Currently infallible; failures degrade to status events
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<CompanionCommand>,
        mut signals: mpsc::Receiver<ExternalSignal>,
    ) -> Result<()> {
        tracing::info!(wake_words = ?self.dialogue.wake_words(), "companion starting");
        self.start_listening().await;

        loop {
            let segment_deadline = self.segmenter.deadline();
            let command_deadline = self.dialogue.command_deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(CompanionCommand::Shutdown) => {
                        tracing::info!("shutdown requested");
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                },
                Some(signal) = signals.recv() => self.on_signal(signal).await,
                Some(event) = self.recognition_rx.recv() => self.on_recognition(event).await,
                Some((id, state)) = self.call_state_rx.recv() => self.on_call_state(id, state).await,
                Some((id, event)) = self.turn_rx.recv() => self.on_turn_event(id, event).await,
                () = sleep_until(segment_deadline) => {
                    if let Some(text) = self.segmenter.poll(Instant::now()) {
                        self.on_utterance(&text).await;
                    }
                }
                () = sleep_until(command_deadline) => {
                    if self.dialogue.expire(Instant::now()) {
                        self.publish_status(AssistantStatus::Listening);
                    }
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Current session flags
    #[must_use]
    pub const fn context(&self) -> SessionContext {
        self.context
    }

    /// Current recognition guard flags
    #[must_use]
    pub const fn guard(&self) -> RecognitionGuard {
        self.guard
    }

    fn shutdown(&mut self) {
        self.guard.close();
        self.deps.recognizer.stop();
        self.cancel_turn();
        self.deps.speech.interrupt();
        if let Some(call) = self.call.take() {
            call.close();
        }
        self.devices.release();
        tracing::info!("companion stopped");
    }

    fn listening_allowed(&self) -> bool {
        self.listen_enabled && self.call.is_none() && !self.context.muted
    }

    fn publish_status(&self, status: AssistantStatus) {
        self.bus.publish(CompanionEvent::Status { status });
    }

    async fn start_listening(&mut self) {
        if !self.listening_allowed() {
            return;
        }
        if !self.deps.recognizer.is_available() {
            self.report_unavailable("no speech recognition engine");
            return;
        }
        if !self.guard.begin() {
            tracing::trace!(guard = ?self.guard, "recognition start skipped");
            return;
        }

        match self.deps.recognizer.start(self.recognition_tx.clone()).await {
            Ok(()) => {
                tracing::debug!("listening");
                self.publish_status(AssistantStatus::Listening);
            }
            Err(Error::RecognitionUnavailable(reason)) => {
                self.guard.start_failed();
                self.report_unavailable(&reason);
            }
            Err(e) => {
                // Retried on the next unmute or call end, not in a loop
                self.guard.start_failed();
                tracing::warn!(error = %e, "speech recognition failed to start");
                self.publish_status(AssistantStatus::Unavailable);
            }
        }
    }

    fn report_unavailable(&mut self, reason: &str) {
        self.guard.close();
        if !self.unavailable_reported {
            self.unavailable_reported = true;
            tracing::warn!(reason, "speech recognition unavailable, listener disabled");
            self.publish_status(AssistantStatus::Unavailable);
        }
    }

    fn suspend_listening(&mut self) {
        self.guard.suppress();
        self.deps.recognizer.stop();
        self.segmenter.reset();
    }

    async fn resume_listening(&mut self) {
        self.guard.resume();
        self.start_listening().await;
    }

    async fn on_recognition(&mut self, event: RecognitionEvent) {
        let now = Instant::now();
        match event {
            RecognitionEvent::Interim(text) => {
                if !self.listening_allowed() || self.guard.is_suppressed() {
                    return;
                }
                if self.dialogue.state() == DialogueState::AwaitingCommand {
                    self.dialogue.note_activity(now);
                }
                self.segmenter
                    .on_interim(&text, self.dialogue.segmenter_mode(), now);
            }
            RecognitionEvent::Final(text) => {
                if !self.listening_allowed() || self.guard.is_suppressed() {
                    return;
                }
                if let Some(utterance) = self.segmenter.on_final(&text) {
                    self.on_utterance(&utterance).await;
                }
            }
            RecognitionEvent::Ended => {
                // Flush what the run heard before it ended
                let pending = self.segmenter.on_final("");
                if let Some(utterance) =
                    pending.filter(|_| self.listening_allowed() && !self.guard.is_suppressed())
                {
                    self.on_utterance(&utterance).await;
                }
                if self.guard.ended() {
                    tracing::debug!("recognition ended, restarting");
                    self.start_listening().await;
                } else {
                    tracing::debug!(guard = ?self.guard, "recognition ended, not restarting");
                }
            }
        }
    }

    async fn on_utterance(&mut self, text: &str) {
        self.deps.recognizer.utterance_complete();
        if !self.listening_allowed() {
            return;
        }
        let state = self.dialogue.state();
        match self.dialogue.handle_utterance(text, Instant::now()) {
            DialogueDecision::Ignore => {}
            DialogueDecision::Acknowledge => self.acknowledge(),
            DialogueDecision::Classify(command) => self.dispatch(command, state, true),
        }
    }

    /// Run a turn's slow work off the loop, replacing any turn in flight
    fn spawn_turn<F>(&mut self, kind: TurnKind, work: F)
    where
        F: Future<Output = TurnEvent> + Send + 'static,
    {
        self.cancel_turn();
        self.next_turn += 1;
        let id = self.next_turn;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tx = self.turn_tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => tracing::debug!(turn = id, "turn cancelled"),
                event = work => {
                    let _ = tx.send((id, event));
                }
            }
        });
        self.turn = Some(Turn { id, kind, cancel });
    }

    /// Cancel the turn in flight, returning what it was doing
    fn cancel_turn(&mut self) -> Option<TurnKind> {
        let turn = self.turn.take()?;
        turn.cancel.cancel();
        Some(turn.kind)
    }

    /// Cut off the current turn and its speech
    async fn interrupt_turn(&mut self) {
        let cancelled = self.cancel_turn();
        self.deps.speech.interrupt();
        if cancelled == Some(TurnKind::Acknowledge) {
            self.resume_listening().await;
        }
    }

    async fn on_turn_event(&mut self, id: u64, event: TurnEvent) {
        if self.turn.as_ref().is_none_or(|turn| turn.id != id) {
            tracing::trace!(turn = id, "stale turn event dropped");
            return;
        }
        self.turn = None;

        match event {
            TurnEvent::Classified { text, result } => match result {
                Ok(action) => {
                    self.context.assistant_busy = false;
                    self.perform(action, text).await;
                }
                Err(e) => self.on_service_error(&e),
            },
            TurnEvent::Failed(e) => self.on_service_error(&e),
            TurnEvent::Acknowledged => {
                if self.dialogue.acknowledged(Instant::now()) {
                    self.publish_status(AssistantStatus::AwaitingCommand);
                }
                self.resume_listening().await;
            }
            TurnEvent::CallRequested => self.start_call().await,
            TurnEvent::Finished => {
                if self.listening_allowed() {
                    self.publish_status(AssistantStatus::Listening);
                }
            }
        }
    }

    /// Play the prompt with capture suspended, then wait for the command
    fn acknowledge(&mut self) {
        self.suspend_listening();
        self.publish_status(AssistantStatus::Speaking);

        let speech = Arc::clone(&self.deps.speech);
        let prompt = self.dialogue_config.acknowledgement.clone();
        self.spawn_turn(TurnKind::Acknowledge, async move {
            if let Err(e) = speech.speak(&prompt, SubmitMode::Interrupt).await {
                tracing::warn!(error = %e, "acknowledgement prompt failed");
            }
            speech.scheduler().wait_idle().await;
            TurnEvent::Acknowledged
        });
    }

    fn dispatch(&mut self, text: String, state: DialogueState, addressed: bool) {
        self.publish_status(AssistantStatus::Thinking);
        let context = DialogueContext {
            state: state.as_str().to_string(),
            route: self.route,
            language: self.language.clone(),
            addressed,
        };

        let intent = Arc::clone(&self.deps.intent);
        self.spawn_turn(TurnKind::Classify, async move {
            let result = intent.classify(&text, &context).await;
            TurnEvent::Classified { text, result }
        });
    }

    async fn perform(&mut self, action: IntentAction, text: String) {
        tracing::debug!(action = ?action, "performing action");
        match action {
            IntentAction::Navigate {
                route: Route::LiveCall,
                spoken_reply: Some(reply),
            } => self.say_then(reply, TurnEvent::CallRequested),
            IntentAction::Navigate {
                route: Route::LiveCall,
                spoken_reply: None,
            } => self.start_call().await,
            IntentAction::Navigate {
                route,
                spoken_reply,
            } => {
                self.navigate(route);
                match spoken_reply {
                    Some(reply) => self.say(reply),
                    None => self.finish_turn(),
                }
            }
            IntentAction::Reply {
                spoken_reply: Some(reply),
            } => self.say(reply),
            IntentAction::Reply { spoken_reply: None } => self.generate_reply(text),
            IntentAction::CreateReminder {
                kind,
                params,
                spoken_reply,
            } => {
                self.bus
                    .publish(CompanionEvent::ReminderRequested { kind, params });
                let reply = spoken_reply.unwrap_or_else(|| REMINDER_CONFIRMATION.to_string());
                self.say(reply);
            }
        }
    }

    fn finish_turn(&self) {
        if self.listening_allowed() {
            self.publish_status(AssistantStatus::Listening);
        }
    }

    fn navigate(&mut self, route: Route) {
        if self.route != route {
            tracing::info!(from = %self.route, to = %route, "navigating");
            self.route = route;
            self.bus.publish(CompanionEvent::RouteChanged { route });
        }
    }

    /// Speak a complete reply, cutting off anything still playing
    fn say(&mut self, text: String) {
        self.say_then(text, TurnEvent::Finished);
    }

    /// Speak a reply and hand `then` back once it has finished playing
    fn say_then(&mut self, text: String, then: TurnEvent) {
        self.publish_status(AssistantStatus::Speaking);
        self.bus.publish(CompanionEvent::Reply { text: text.clone() });

        let speech = Arc::clone(&self.deps.speech);
        let wait = !matches!(then, TurnEvent::Finished);
        self.spawn_turn(TurnKind::Speak, async move {
            if let Err(e) = speech.speak(&text, SubmitMode::Interrupt).await {
                tracing::warn!(error = %e, "reply playback failed");
            }
            if wait {
                speech.scheduler().wait_idle().await;
            }
            then
        });
    }

    fn generate_reply(&mut self, prompt: String) {
        let replies = Arc::clone(&self.deps.replies);
        let speech = Arc::clone(&self.deps.speech);
        let bus = self.bus.clone();
        let fallback = self.dialogue_config.fallback_reply.clone();

        self.spawn_turn(TurnKind::Speak, async move {
            let stream = match replies.generate(&prompt).await {
                Ok(stream) => stream,
                Err(e) => return TurnEvent::Failed(e),
            };

            bus.publish(CompanionEvent::Status {
                status: AssistantStatus::Speaking,
            });
            let text = match speech.speak_stream(stream, SubmitMode::Interrupt).await {
                Ok(spoken) if !spoken.text.trim().is_empty() => spoken.text,
                Ok(_) => {
                    if let Err(e) = speech.speak(&fallback, SubmitMode::Interrupt).await {
                        tracing::warn!(error = %e, "fallback playback failed");
                    }
                    fallback
                }
                Err(e) => return TurnEvent::Failed(e),
            };
            bus.publish(CompanionEvent::Reply { text });
            TurnEvent::Finished
        });
    }

    fn on_service_error(&mut self, error: &Error) {
        // Shown, not spoken: speech may need the very key that is missing
        if let Error::MissingApiKey(name) = error {
            tracing::error!(key = %name, "service key not configured");
            self.bus.publish(CompanionEvent::Reply {
                text: self.dialogue_config.no_key_reply.clone(),
            });
            self.finish_turn();
            return;
        }
        let reply = if error.is_transient() {
            tracing::warn!(error = %error, "assistant busy");
            self.context.assistant_busy = true;
            self.publish_status(AssistantStatus::Busy);
            self.dialogue_config.busy_reply.clone()
        } else {
            tracing::error!(error = %error, "request failed");
            self.dialogue_config.fallback_reply.clone()
        };
        self.say(reply);
    }

    async fn on_command(&mut self, command: CompanionCommand) {
        tracing::debug!(command = ?command, "command");
        match command {
            CompanionCommand::StartCall => self.start_call().await,
            CompanionCommand::RetryCall => self.retry_call().await,
            CompanionCommand::EndCall => {
                if let Some(call) = &self.call {
                    call.close();
                }
            }
            CompanionCommand::SwitchCamera => self.switch_camera().await,
            CompanionCommand::SetMuted(muted) => self.set_muted(muted).await,
            CompanionCommand::SendText(text) => {
                if self.cancel_turn() == Some(TurnKind::Acknowledge) {
                    self.resume_listening().await;
                }
                let state = self.dialogue.state();
                self.dialogue.cancel(Instant::now());
                self.dispatch(text, state, true);
            }
            CompanionCommand::Shutdown => {}
        }
    }

    async fn on_signal(&mut self, signal: ExternalSignal) {
        tracing::info!(signal = ?signal, "external signal");
        match signal {
            ExternalSignal::ForceInterrupt => self.interrupt_turn().await,
            ExternalSignal::ForceMute(muted) => self.set_muted(muted).await,
        }
    }

    async fn set_muted(&mut self, muted: bool) {
        if self.context.muted == muted {
            return;
        }
        self.context.muted = muted;
        self.bus.publish(CompanionEvent::MuteToggled { muted });

        if let Some(call) = &self.call {
            call.set_muted(muted);
            return;
        }
        if muted {
            self.suspend_listening();
            self.dialogue.cancel(Instant::now());
            self.publish_status(AssistantStatus::Muted);
        } else {
            self.resume_listening().await;
        }
    }

    async fn start_call(&mut self) {
        // At most one call: tear down the previous one first
        if let Some(previous) = self.call.take() {
            tracing::info!(session = %previous.id(), "replacing active call");
            previous.close();
            self.bus.publish(CompanionEvent::SessionEnded {
                session: previous.id(),
            });
        }

        self.suspend_listening();
        self.dialogue.cancel(Instant::now());
        self.cancel_turn();
        self.deps.speech.interrupt();
        self.navigate(Route::LiveCall);
        self.publish_status(AssistantStatus::InCall);

        let outcome = self.devices.acquire(self.call_config.camera_index).await;
        let mic_degraded = outcome.is_degraded();
        let stream = match outcome {
            AcquireOutcome::Success(stream) | AcquireOutcome::Degraded(stream) => stream,
            AcquireOutcome::Failed(reason) => {
                tracing::error!(reason, "call cannot start without media");
                self.publish_status(AssistantStatus::Unavailable);
                self.navigate(Route::Home);
                self.resume_listening().await;
                return;
            }
        };
        self.context.mic_degraded = mic_degraded;

        let session = Arc::new(DuplexCallSession::new(
            Arc::clone(&self.deps.transport),
            Arc::clone(self.deps.speech.scheduler()),
            stream,
            mic_degraded,
            self.call_config.options(),
        ));
        session.set_muted(self.context.muted);
        self.call = Some(Arc::clone(&session));

        // Report errors and the end of the call back to the loop
        let state_tx = self.call_state_tx.clone();
        let id = session.id();
        let mut states = session.subscribe();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = states.borrow_and_update().clone();
                let closed = state == CallState::Closed;
                if matches!(state, CallState::Error(_) | CallState::Closed)
                    && state_tx.send((id, state)).is_err()
                {
                    break;
                }
                if closed {
                    break;
                }
            }
        });

        if let Err(e) = session.connect().await {
            tracing::warn!(session = %session.id(), error = %e, "call failed to connect, awaiting retry or exit");
        }
    }

    async fn retry_call(&mut self) {
        let Some(call) = self.call.clone() else {
            return;
        };
        if !matches!(call.state(), CallState::Error(_)) {
            return;
        }
        match call.retry().await {
            Ok(()) => self.publish_status(AssistantStatus::InCall),
            Err(e) => tracing::warn!(session = %call.id(), error = %e, "call retry failed"),
        }
    }

    async fn switch_camera(&mut self) {
        let Some(call) = self.call.clone() else {
            tracing::debug!("no call, camera switch ignored");
            return;
        };
        match self.devices.cycle().await {
            AcquireOutcome::Success(stream) => {
                self.context.mic_degraded = false;
                call.replace_media(stream, false);
            }
            AcquireOutcome::Degraded(stream) => {
                self.context.mic_degraded = true;
                call.replace_media(stream, true);
            }
            AcquireOutcome::Failed(reason) => {
                // The old tracks are gone with nothing to replace them
                tracing::error!(session = %call.id(), reason, "camera switch failed, ending call");
                self.publish_status(AssistantStatus::Unavailable);
                call.close();
            }
        }
        tracing::info!(camera = self.devices.inventory().current_index, "camera switched");
    }

    async fn on_call_state(&mut self, id: Uuid, state: CallState) {
        if !self.call.as_ref().is_some_and(|call| call.id() == id) {
            return;
        }
        match state {
            CallState::Error(reason) => {
                tracing::warn!(session = %id, reason, "call interrupted, awaiting retry or exit");
                self.publish_status(AssistantStatus::Busy);
            }
            CallState::Closed => self.on_call_ended(id).await,
            CallState::Connecting | CallState::Active => {}
        }
    }

    async fn on_call_ended(&mut self, id: Uuid) {
        if let Some(call) = self.call.take() {
            call.close();
            tracing::info!(session = %id, turns = call.transcript().len(), "call ended");
        }
        self.devices.release();
        self.context.mic_degraded = false;
        self.bus.publish(CompanionEvent::SessionEnded { session: id });
        self.navigate(Route::Home);
        self.resume_listening().await;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
