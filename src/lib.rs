//! `SilverCare` Voice - voice-first companion pipeline for elder care
//!
//! This library provides the real-time voice core of the companion:
//! - Wake word dialogue over segmented speech recognition
//! - Sentence-streamed speech output on a gapless playback clock
//! - Duplex audio/video calls with a realtime agent
//! - Camera and microphone acquisition with degraded fallback
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   User interface                     │
//! │   Commands  │  Signals  │  CompanionEvent stream     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                    Companion                         │
//! │  Recognizer │ Segmenter │ Wake word │ Streaming TTS  │
//! │            DuplexCallSession (one at a time)         │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                Remote services                       │
//! │   Intent  │  Replies  │  STT/TTS  │  Realtime agent  │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod call;
pub mod companion;
pub mod config;
pub mod devices;
pub mod error;
pub mod events;
pub mod services;
pub mod voice;

pub use companion::{Companion, CompanionCommand, CompanionDeps, RecognitionGuard, SessionContext};
pub use config::Config;
pub use error::{Error, Result};
