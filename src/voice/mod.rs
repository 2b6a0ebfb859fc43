//! Voice processing module
//!
//! Handles audio capture, the playback timeline, utterance segmentation,
//! wake-word dialogue, and speech recognition and synthesis.

mod capture;
pub mod codec;
mod playback;
mod recognizer;
mod segmenter;
mod streaming;
mod stt;
mod tts;
mod wake_word;

pub use capture::AudioCapture;
pub use codec::{
    AudioFrame, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE, PlayableBuffer, StreamResampler, WireEncoder,
    samples_to_wav,
};
pub use playback::{AudioOutput, CpalOutput, PlaybackScheduler, ScheduledPlayback, SourceId};
pub use recognizer::{
    CloudRecognizer, RecognitionEvent, SpeechActivityDetector, SpeechRecognizer,
    UnavailableRecognizer,
};
pub use segmenter::{SegmenterMode, SegmenterTimeouts, SpeechSegmenter, UtteranceBuffer};
pub use streaming::{ClauseSplitter, SentenceStreamingTts, SpokenResponse, SubmitMode};
pub use stt::{SpeechToText, SttProvider, Transcriber};
pub use tts::{SpeechSynthesizer, TextToSpeech, TtsProvider};
pub use wake_word::{DialogueDecision, DialogueState, WakeWordDialogue};
