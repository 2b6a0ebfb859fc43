//! Event bus between the companion and the rest of the application
//!
//! Signals flow in from collaborators (fall detection, navigation) over an
//! mpsc channel; companion events flow out over a broadcast channel so any
//! number of observers can follow along. Publishing is best-effort: a bus
//! without subscribers drops events silently.

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::services::{ReminderKind, ReminderParams, Route};

/// Capacity of the outbound broadcast channel
const EVENT_CAPACITY: usize = 64;

/// Signals from external collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalSignal {
    /// Stop speaking now (e.g. a fall alert takes over the screen)
    ForceInterrupt,
    /// Force the microphone on or off
    ForceMute(bool),
}

/// Coarse assistant status shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistantStatus {
    /// Waiting for the wake word
    Listening,
    /// Wake word heard, waiting for the command
    AwaitingCommand,
    /// Classifying or generating
    Thinking,
    /// Playing speech
    Speaking,
    /// In a live call
    InCall,
    /// Muted by the user or a collaborator
    Muted,
    /// A remote service is rate limited or down; try again
    Busy,
    /// Speech recognition is not available on this device
    Unavailable,
}

/// Events published by the companion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompanionEvent {
    /// Navigate to a screen
    RouteChanged { route: Route },
    /// Microphone mute changed
    MuteToggled { muted: bool },
    /// A live call ended
    SessionEnded { session: Uuid },
    /// The user asked for a reminder or alarm
    ReminderRequested {
        kind: ReminderKind,
        params: ReminderParams,
    },
    /// Assistant status changed
    Status { status: AssistantStatus },
    /// The assistant answered the user
    Reply { text: String },
}

/// Fan-out publisher for companion events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CompanionEvent>,
}

impl EventBus {
    /// Create a bus
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Publish an event; best-effort
    pub fn publish(&self, event: CompanionEvent) {
        tracing::debug!(event = ?event, "companion event");
        let _ = self.sender.send(event);
    }

    /// Follow published events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CompanionEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Create the inbound signal channel
#[must_use]
pub fn signal_channel() -> (mpsc::Sender<ExternalSignal>, mpsc::Receiver<ExternalSignal>) {
    mpsc::channel(16)
}
