//! Clause-by-clause speech for streamed text
//!
//! Text is spoken as it arrives: each complete clause is synthesized and
//! appended to the playback timeline while the rest of the response is still
//! streaming in.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::playback::PlaybackScheduler;
use super::tts::SpeechSynthesizer;
use crate::Result;

/// Characters that end a clause
const TERMINALS: &[char] = &['。', '！', '？', '；', '…', '!', '?', ';', '\n', '.'];

/// Closing marks that belong to the clause they follow
const CLOSERS: &[char] = &['"', '\'', '”', '’', '」', '』', '）', ')'];

/// Code fence marker
const FENCE: &str = "```";

/// Splits incrementally arriving text into speakable clauses
#[derive(Debug, Default)]
pub struct ClauseSplitter {
    buffer: String,
    in_fence: bool,
}

impl ClauseSplitter {
    /// Create an empty splitter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk and return every clause it completed
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut clauses = Vec::new();

        while let Some(end) = next_clause_end(&self.buffer) {
            let clause: String = self.buffer.drain(..end).collect();
            if let Some(clause) = self.speakable(&clause) {
                clauses.push(clause);
            }
        }

        clauses
    }

    /// Flush the trailing partial clause at stream end
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let clause = self.speakable(&rest);
        self.in_fence = false;
        clause
    }

    /// Drop buffered text
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_fence = false;
    }

    fn speakable(&mut self, clause: &str) -> Option<String> {
        let clause = clause.trim();
        if clause.contains(FENCE) {
            // Odd number of fences flips in/out of a code block
            if clause.matches(FENCE).count() % 2 == 1 {
                self.in_fence = !self.in_fence;
            }
            tracing::trace!(clause, "skipping fenced clause");
            return None;
        }
        if self.in_fence || clause.contains(['{', '}']) {
            tracing::trace!(clause, "skipping structured clause");
            return None;
        }
        if !clause.chars().any(char::is_alphanumeric) {
            return None;
        }
        Some(clause.to_string())
    }
}

/// Byte offset just past the first complete clause, if any
fn next_clause_end(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    let mut prev: Option<char> = None;

    while let Some((i, c)) = chars.next() {
        if TERMINALS.contains(&c) {
            if c == '.' {
                match chars.peek() {
                    // Undecided until the next character arrives
                    None => return None,
                    Some(&(_, next)) if next.is_ascii_digit() && prev.is_some_and(|p| p.is_ascii_digit()) => {
                        prev = Some(c);
                        continue;
                    }
                    Some(_) => {}
                }
            }

            let mut end = i + c.len_utf8();
            while let Some(&(j, next)) = chars.peek() {
                if next != '\n' && (TERMINALS.contains(&next) || CLOSERS.contains(&next)) {
                    end = j + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            return Some(end);
        }
        prev = Some(c);
    }

    None
}

/// Whether a submission cuts off current speech
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Queue behind whatever is playing
    Append,
    /// Flush playback first (a new user-initiated message)
    Interrupt,
}

/// What a streamed response produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpokenResponse {
    /// Full text received from the stream
    pub text: String,
    /// Clauses that reached the playback timeline
    pub clauses_played: usize,
    /// Clauses that failed to synthesize and were dropped
    pub clauses_failed: usize,
}

/// Streams text into clause-sized synthesis requests
pub struct SentenceStreamingTts {
    scheduler: Arc<PlaybackScheduler>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    generation: AtomicU64,
}

impl SentenceStreamingTts {
    /// Create a streaming speaker over a scheduler and a synthesizer
    #[must_use]
    pub fn new(scheduler: Arc<PlaybackScheduler>, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        Self {
            scheduler,
            synthesizer,
            generation: AtomicU64::new(0),
        }
    }

    /// The scheduler clauses are submitted to
    #[must_use]
    pub const fn scheduler(&self) -> &Arc<PlaybackScheduler> {
        &self.scheduler
    }

    /// Cut off current speech and discard clauses still being synthesized
    pub fn interrupt(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.scheduler.flush_all();
    }

    /// Speak a single piece of text
    ///
    /// # Errors
    ///
    /// Never fails for synthesis errors (those are dropped per clause)
    pub async fn speak(&self, text: &str, mode: SubmitMode) -> Result<SpokenResponse> {
        let stream = futures::stream::iter([Ok(text.to_string())]);
        self.speak_stream(stream, mode).await
    }

    /// Speak a text stream clause by clause as it arrives
    ///
    /// Returns once every clause has been submitted to the timeline (not
    /// once it has finished playing).
    ///
    /// # Errors
    ///
    /// Returns the stream's error; clauses completed before it are still
    /// spoken
    pub async fn speak_stream<S>(&self, stream: S, mode: SubmitMode) -> Result<SpokenResponse>
    where
        S: Stream<Item = Result<String>> + Send,
    {
        if mode == SubmitMode::Interrupt {
            self.interrupt();
        }
        let generation = self.generation.load(Ordering::SeqCst);
        let (clause_tx, mut clause_rx) = mpsc::unbounded_channel::<String>();

        let reader = async move {
            let mut stream = std::pin::pin!(stream);
            let mut splitter = ClauseSplitter::new();
            let mut text = String::new();
            let mut failure = None;

            while let Some(chunk) = stream.next().await {
                if self.generation.load(Ordering::SeqCst) != generation {
                    tracing::debug!("response superseded, stop reading");
                    break;
                }
                match chunk {
                    Ok(chunk) => {
                        text.push_str(&chunk);
                        for clause in splitter.push(&chunk) {
                            let _ = clause_tx.send(clause);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "text stream failed");
                        failure = Some(e);
                        break;
                    }
                }
            }

            if let Some(clause) = splitter.finish() {
                let _ = clause_tx.send(clause);
            }
            (text, failure)
        };

        let worker = async {
            let mut played = 0;
            let mut failed = 0;
            while let Some(clause) = clause_rx.recv().await {
                if self.generation.load(Ordering::SeqCst) != generation {
                    continue;
                }
                match self.synthesizer.synthesize(&clause).await {
                    Ok(buffer) => {
                        // A flush during synthesis makes this clause stale
                        if self.generation.load(Ordering::SeqCst) == generation
                            && self.scheduler.enqueue(&buffer).is_some()
                        {
                            played += 1;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, clause, "clause synthesis failed, skipping");
                        failed += 1;
                    }
                }
            }
            (played, failed)
        };

        let ((text, failure), (clauses_played, clauses_failed)) = tokio::join!(reader, worker);

        match failure {
            Some(e) => Err(e),
            None => Ok(SpokenResponse {
                text,
                clauses_played,
                clauses_failed,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_all(chunks: &[&str]) -> Vec<String> {
        let mut splitter = ClauseSplitter::new();
        let mut out: Vec<String> = chunks.iter().flat_map(|c| splitter.push(c)).collect();
        out.extend(splitter.finish());
        out
    }

    #[test]
    fn cjk_sentences_split_regardless_of_chunking() {
        let expected = vec!["你好。".to_string(), "今天天气不错！".to_string()];
        assert_eq!(split_all(&["你好。今天天气不错！"]), expected);
        assert_eq!(split_all(&["你", "好。今", "天天气不错", "！"]), expected);
        assert_eq!(split_all(&["你好", "。", "今天天气不错！"]), expected);
    }

    #[test]
    fn trailing_partial_is_flushed_at_end() {
        assert_eq!(
            split_all(&["Good morning. Time for", " your pills"]),
            vec!["Good morning.", "Time for your pills"]
        );
    }

    #[test]
    fn decimals_do_not_split() {
        assert_eq!(
            split_all(&["The dose is 2", ".5 mg. Take it now"]),
            vec!["The dose is 2.5 mg.", "Take it now"]
        );
    }

    #[test]
    fn trailing_dot_waits_for_next_chunk() {
        let mut splitter = ClauseSplitter::new();
        assert!(splitter.push("Version 3.").is_empty());
        assert_eq!(splitter.push("1 is out. ok"), vec!["Version 3.1 is out."]);
    }

    #[test]
    fn newline_ends_a_clause() {
        assert_eq!(split_all(&["first line\nsecond"]), vec!["first line", "second"]);
    }

    #[test]
    fn repeated_punctuation_stays_with_clause() {
        assert_eq!(split_all(&["真的吗？！好的"]), vec!["真的吗？！", "好的"]);
    }

    #[test]
    fn structured_payloads_are_not_spoken() {
        assert_eq!(
            split_all(&["好的。\n```json\n\"route\": \"home\"\n```\n{\"a\": 1}\n再见。"]),
            vec!["好的。", "再见。"]
        );
    }
}
