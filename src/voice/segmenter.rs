//! Utterance segmentation over recognizer transcripts
//!
//! Interim hypotheses reset a silence deadline; the owner polls the deadline
//! and collects the utterance once it passes. A final hypothesis completes
//! the utterance immediately.

use std::time::Duration;

use tokio::time::Instant;

/// How long a pause ends an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterMode {
    /// Ambient listening; tolerate long pauses
    Ambient,
    /// A command is expected; answer quickly
    Command,
}

/// Silence timeouts per mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmenterTimeouts {
    /// Pause that ends an ambient utterance
    pub ambient: Duration,
    /// Pause that ends a command utterance
    pub command: Duration,
}

impl Default for SegmenterTimeouts {
    fn default() -> Self {
        Self {
            ambient: Duration::from_millis(1900),
            command: Duration::from_millis(900),
        }
    }
}

impl SegmenterTimeouts {
    /// Timeout for a mode
    #[must_use]
    pub const fn for_mode(&self, mode: SegmenterMode) -> Duration {
        match mode {
            SegmenterMode::Ambient => self.ambient,
            SegmenterMode::Command => self.command,
        }
    }
}

/// Text recognized so far in the current utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtteranceBuffer {
    /// Latest hypothesis
    pub text: String,
    /// When it last changed
    pub updated_at: Instant,
}

/// Turns transcript updates into complete utterances
#[derive(Debug)]
pub struct SpeechSegmenter {
    timeouts: SegmenterTimeouts,
    buffer: Option<UtteranceBuffer>,
    deadline: Option<Instant>,
}

impl SpeechSegmenter {
    /// Create a segmenter
    #[must_use]
    pub const fn new(timeouts: SegmenterTimeouts) -> Self {
        Self {
            timeouts,
            buffer: None,
            deadline: None,
        }
    }

    /// Record an interim hypothesis and restart the silence timer
    ///
    /// The hypothesis replaces the buffered text; recognizers report the
    /// whole utterance so far on every update.
    pub fn on_interim(&mut self, text: &str, mode: SegmenterMode, now: Instant) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        self.buffer = Some(UtteranceBuffer {
            text: text.to_string(),
            updated_at: now,
        });
        self.deadline = Some(now + self.timeouts.for_mode(mode));
        tracing::trace!(text, ?mode, "interim transcript");
    }

    /// Complete the utterance on an engine-confirmed transcript
    ///
    /// An empty final flushes whatever interim text is buffered.
    pub fn on_final(&mut self, text: &str) -> Option<String> {
        let buffered = self.take();
        let text = text.trim();
        let utterance = if text.is_empty() {
            buffered?
        } else {
            text.to_string()
        };
        tracing::debug!(utterance = %utterance, "utterance complete (final)");
        Some(utterance)
    }

    /// Complete the utterance if the silence deadline has passed
    pub fn poll(&mut self, now: Instant) -> Option<String> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        let utterance = self.take()?;
        tracing::debug!(utterance = %utterance, "utterance complete (silence)");
        Some(utterance)
    }

    /// When the current utterance will time out
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Text buffered for the current utterance
    #[must_use]
    pub fn buffered_text(&self) -> Option<&str> {
        self.buffer.as_ref().map(|b| b.text.as_str())
    }

    /// Drop any partial utterance
    pub fn reset(&mut self) {
        self.buffer = None;
        self.deadline = None;
    }

    fn take(&mut self) -> Option<String> {
        self.deadline = None;
        self.buffer.take().map(|b| b.text).filter(|t| !t.is_empty())
    }
}

impl Default for SpeechSegmenter {
    fn default() -> Self {
        Self::new(SegmenterTimeouts::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn silence_completes_utterance_once() {
        let start = Instant::now();
        let mut segmenter = SpeechSegmenter::default();

        segmenter.on_interim("今天", SegmenterMode::Ambient, start);
        segmenter.on_interim("今天天气", SegmenterMode::Ambient, start + ms(500));

        // Still inside the pause window of the latest update
        assert_eq!(segmenter.poll(start + ms(2000)), None);

        let utterance = segmenter.poll(start + ms(2400));
        assert_eq!(utterance.as_deref(), Some("今天天气"));

        // Nothing left for the same idle period
        assert_eq!(segmenter.poll(start + ms(5000)), None);
        assert!(segmenter.deadline().is_none());
    }

    #[test]
    fn command_mode_uses_short_timeout() {
        let start = Instant::now();
        let mut segmenter = SpeechSegmenter::default();

        segmenter.on_interim("吃药", SegmenterMode::Command, start);
        assert_eq!(segmenter.deadline(), Some(start + ms(900)));
        assert_eq!(segmenter.poll(start + ms(900)).as_deref(), Some("吃药"));
    }

    #[test]
    fn final_completes_immediately() {
        let start = Instant::now();
        let mut segmenter = SpeechSegmenter::default();

        segmenter.on_interim("hello", SegmenterMode::Ambient, start);
        assert_eq!(segmenter.on_final("hello there").as_deref(), Some("hello there"));
        assert_eq!(segmenter.poll(start + ms(10_000)), None);
    }

    #[test]
    fn empty_final_flushes_interim() {
        let mut segmenter = SpeechSegmenter::default();
        segmenter.on_interim("partial", SegmenterMode::Ambient, Instant::now());
        assert_eq!(segmenter.on_final("").as_deref(), Some("partial"));
        assert_eq!(segmenter.on_final(""), None);
    }

    #[test]
    fn blank_interim_is_ignored() {
        let mut segmenter = SpeechSegmenter::default();
        segmenter.on_interim("   ", SegmenterMode::Ambient, Instant::now());
        assert!(segmenter.deadline().is_none());
        assert!(segmenter.buffered_text().is_none());
    }
}
