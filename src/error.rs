//! Error types for the SilverCare voice pipeline

use thiserror::Error;

/// Result type alias for voice pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device or stream error
    #[error("audio error: {0}")]
    Audio(String),

    /// PCM payload could not be decoded
    #[error("format error: {0}")]
    Format(String),

    /// A service key is not configured
    #[error("{0} is not configured (see `silvercare status`)")]
    MissingApiKey(String),

    /// Camera or microphone missing or denied
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Platform has no speech recognition capability
    #[error("speech recognition unavailable: {0}")]
    RecognitionUnavailable(String),

    /// Remote service failing or rate-limited
    #[error("assistant busy: {0}")]
    Busy(String),

    /// Playback could not be scheduled
    #[error("playback error: {0}")]
    Playback(String),

    /// Live agent session could not be established or broke
    #[error("session connection error: {0}")]
    SessionConnection(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Intent classification error
    #[error("intent error: {0}")]
    Intent(String),

    /// Video frame processing error
    #[error("video error: {0}")]
    Video(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Image encoding error
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl Error {
    /// Whether this error should surface as a transient "assistant busy" state
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Http(_))
    }
}
