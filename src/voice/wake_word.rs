//! Wake-word-gated dialogue state
//!
//! Decides whether a complete utterance is ambient talk, a wake trigger or a
//! directed command. The machine performs no language understanding; commands
//! are handed to the intent service verbatim.

use std::time::Duration;

use tokio::time::Instant;

use super::segmenter::SegmenterMode;
use crate::{Error, Result};

/// Characters stripped between the wake word and the command
const SEPARATORS: &[char] = &[',', '，', '.', '。', '!', '！', '?', '？', '、', '~', '～', ':', '：'];

/// Dialogue state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogueState {
    /// Waiting for the wake word
    Idle,
    /// Wake word acknowledged, next utterance is a command
    AwaitingCommand,
}

impl DialogueState {
    /// Wire name sent with intent requests
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingCommand => "awaiting_command",
        }
    }
}

/// What the owner should do with an utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogueDecision {
    /// Ambient speech; drop it
    Ignore,
    /// Send this text to the intent service
    Classify(String),
    /// Wake word alone; play the acknowledgement prompt
    Acknowledge,
}

/// Wake word dialogue state machine
#[derive(Debug)]
pub struct WakeWordDialogue {
    wake_words: Vec<String>,
    action_keywords: Vec<String>,
    command_timeout: Duration,
    state: DialogueState,
    since: Instant,
    last_activity: Instant,
    ack_pending: bool,
}

impl WakeWordDialogue {
    /// Create a dialogue machine
    ///
    /// # Arguments
    ///
    /// * `wake_words` - Trigger phrases, matched case-insensitively
    /// * `action_keywords` - Phrases that make a wake utterance a command
    /// * `command_timeout` - Silence after which `AwaitingCommand` lapses
    ///
    /// # Errors
    ///
    /// Returns error if no usable wake word is given
    pub fn new(
        wake_words: Vec<String>,
        action_keywords: Vec<String>,
        command_timeout: Duration,
    ) -> Result<Self> {
        let wake_words = normalize(wake_words);
        if wake_words.is_empty() {
            return Err(Error::Config("at least one wake word is required".to_string()));
        }
        let action_keywords = normalize(action_keywords);

        tracing::debug!(wake_words = ?wake_words, "wake word dialogue initialized");

        let now = Instant::now();
        Ok(Self {
            wake_words,
            action_keywords,
            command_timeout,
            state: DialogueState::Idle,
            since: now,
            last_activity: now,
            ack_pending: false,
        })
    }

    /// Feed a complete utterance
    pub fn handle_utterance(&mut self, text: &str, now: Instant) -> DialogueDecision {
        let text = text.trim();
        if text.is_empty() {
            return DialogueDecision::Ignore;
        }

        match self.state {
            DialogueState::AwaitingCommand => {
                let command = self
                    .find_wake_word(text)
                    .map(|(_, end)| strip_separators(&text[end..]))
                    .filter(|rest| !rest.is_empty())
                    .unwrap_or(text);
                tracing::info!(command, "command received");
                self.transition(DialogueState::Idle, now);
                DialogueDecision::Classify(command.to_string())
            }
            DialogueState::Idle => {
                let Some((_, end)) = self.find_wake_word(text) else {
                    tracing::trace!(text, "ambient speech ignored");
                    return DialogueDecision::Ignore;
                };
                let remainder = strip_separators(&text[end..]);
                if self.is_actionable(remainder) {
                    tracing::info!(command = remainder, "wake word with embedded command");
                    DialogueDecision::Classify(remainder.to_string())
                } else {
                    tracing::info!(text, "wake word detected");
                    self.ack_pending = true;
                    DialogueDecision::Acknowledge
                }
            }
        }
    }

    /// The acknowledgement prompt finished; start waiting for the command
    ///
    /// Returns false if no acknowledgement was pending.
    pub fn acknowledged(&mut self, now: Instant) -> bool {
        if !self.ack_pending {
            return false;
        }
        self.ack_pending = false;
        self.transition(DialogueState::AwaitingCommand, now);
        true
    }

    /// Speech is arriving; keep a pending command window open
    pub fn note_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// When `AwaitingCommand` lapses back to `Idle`
    #[must_use]
    pub fn command_deadline(&self) -> Option<Instant> {
        (self.state == DialogueState::AwaitingCommand)
            .then(|| self.last_activity + self.command_timeout)
    }

    /// Revert silently to `Idle` if the command window has lapsed
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.command_deadline() {
            Some(deadline) if now >= deadline => {
                tracing::debug!("no command before timeout, back to idle");
                self.transition(DialogueState::Idle, now);
                true
            }
            _ => false,
        }
    }

    /// Abandon any pending acknowledgement or command window
    pub fn cancel(&mut self, now: Instant) {
        self.ack_pending = false;
        if self.state != DialogueState::Idle {
            self.transition(DialogueState::Idle, now);
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> DialogueState {
        self.state
    }

    /// When the current state was entered
    #[must_use]
    pub const fn since(&self) -> Instant {
        self.since
    }

    /// Segmentation mode matching the current state
    #[must_use]
    pub const fn segmenter_mode(&self) -> SegmenterMode {
        match self.state {
            DialogueState::Idle => SegmenterMode::Ambient,
            DialogueState::AwaitingCommand => SegmenterMode::Command,
        }
    }

    /// Get the configured wake words
    #[must_use]
    pub fn wake_words(&self) -> &[String] {
        &self.wake_words
    }

    /// Check if text contains a wake word
    #[must_use]
    pub fn contains_wake_word(&self, text: &str) -> bool {
        self.find_wake_word(text).is_some()
    }

    fn transition(&mut self, state: DialogueState, now: Instant) {
        tracing::debug!(from = ?self.state, to = ?state, "dialogue transition");
        self.state = state;
        self.since = now;
        self.last_activity = now;
    }

    /// Earliest wake word occurrence, as a byte range into `text`
    fn find_wake_word(&self, text: &str) -> Option<(usize, usize)> {
        self.wake_words
            .iter()
            .filter_map(|word| find_ignore_case(text, word))
            .min_by_key(|&(start, end)| (start, std::cmp::Reverse(end)))
    }

    fn is_actionable(&self, remainder: &str) -> bool {
        if remainder.is_empty() {
            return false;
        }
        let lower = remainder.to_lowercase();
        self.action_keywords.iter().any(|k| lower.contains(k.as_str()))
    }
}

fn normalize(words: Vec<String>) -> Vec<String> {
    words
        .into_iter()
        .map(|w| w.trim().to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

fn strip_separators(text: &str) -> &str {
    text.trim_start_matches(|c: char| c.is_whitespace() || SEPARATORS.contains(&c))
        .trim_end()
}

/// Case-insensitive substring search returning a byte range in `haystack`
///
/// `needle` must already be lowercase.
fn find_ignore_case(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    if needle.is_empty() {
        return None;
    }
    for (start, _) in haystack.char_indices() {
        let mut rest = haystack[start..].char_indices();
        let mut end = start;
        let mut matched = true;
        for expected in needle.chars() {
            match rest.next() {
                Some((offset, c)) if c.to_lowercase().eq(expected.to_lowercase()) => {
                    end = start + offset + c.len_utf8();
                }
                _ => {
                    matched = false;
                    break;
                }
            }
        }
        if matched {
            return Some((start, end));
        }
    }
    None
}
