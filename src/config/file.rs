//! TOML configuration file loading
//!
//! Supports `~/.config/silvercare/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct SilvercareConfigFile {
    /// Recognition and reply locale (e.g. "zh-CN")
    #[serde(default)]
    pub language: Option<String>,

    /// Voice/audio configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Wake word and segmentation configuration
    #[serde(default)]
    pub dialogue: DialogueFileConfig,

    /// Live call configuration
    #[serde(default)]
    pub call: CallFileConfig,

    /// External service endpoints
    #[serde(default)]
    pub services: ServicesFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Voice processing configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Enable the wake-word listener
    pub enabled: Option<bool>,

    /// STT provider ("whisper" or "deepgram")
    pub stt_provider: Option<String>,

    /// STT model (e.g. "whisper-1")
    pub stt_model: Option<String>,

    /// TTS provider ("openai" or "elevenlabs")
    pub tts_provider: Option<String>,

    /// TTS model (e.g. "tts-1")
    pub tts_model: Option<String>,

    /// TTS voice identifier (e.g. "nova")
    pub tts_voice: Option<String>,

    /// TTS speed multiplier
    pub tts_speed: Option<f32>,
}

/// Wake word dialogue configuration
#[derive(Debug, Default, Deserialize)]
pub struct DialogueFileConfig {
    /// Wake word variants
    pub wake_words: Option<Vec<String>>,

    /// Keywords that make text after a wake word a command
    pub action_keywords: Option<Vec<String>>,

    /// Silence before an ambient utterance completes, in milliseconds
    pub ambient_timeout_ms: Option<u64>,

    /// Silence before a command utterance completes, in milliseconds
    pub command_timeout_ms: Option<u64>,

    /// How long to wait for a command after the wake word, in milliseconds
    pub awaiting_timeout_ms: Option<u64>,

    /// Prompt spoken after a bare wake word
    pub acknowledgement: Option<String>,
}

/// Live call configuration
#[derive(Debug, Default, Deserialize)]
pub struct CallFileConfig {
    /// Realtime agent WebSocket URL
    pub agent_url: Option<String>,

    /// Realtime model identifier
    pub model: Option<String>,

    /// Agent voice name
    pub voice: Option<String>,

    /// Persona instruction for calls
    pub system_instruction: Option<String>,

    /// Microphone send interval in milliseconds
    pub capture_interval_ms: Option<u64>,

    /// Camera send interval in milliseconds
    pub video_interval_ms: Option<u64>,

    /// Outbound frame width in pixels
    pub video_width: Option<u32>,

    /// JPEG quality (1-100)
    pub jpeg_quality: Option<u8>,

    /// Preferred camera index
    pub camera_index: Option<usize>,
}

/// External service endpoints
#[derive(Debug, Default, Deserialize)]
pub struct ServicesFileConfig {
    /// Intent classification endpoint
    pub intent_url: Option<String>,

    /// Streaming chat-completion endpoint
    pub chat_url: Option<String>,

    /// Chat model identifier
    pub chat_model: Option<String>,

    /// Persona instruction for replies
    pub system_instruction: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub silvercare: Option<String>,
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
    pub deepgram: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `SilvercareConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> SilvercareConfigFile {
    config_file_path().map_or_else(SilvercareConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn load_config_file_from(path: &Path) -> SilvercareConfigFile {
    if !path.exists() {
        return SilvercareConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                SilvercareConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            SilvercareConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/silvercare/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("silvercare").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let fc = load_config_file_from(&dir.path().join("absent.toml"));
        assert!(fc.language.is_none());
        assert!(fc.dialogue.wake_words.is_none());
    }

    #[test]
    fn partial_file_overlays() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
language = "zh-TW"

[dialogue]
wake_words = ["小玲"]
command_timeout_ms = 700

[api_keys]
openai = "sk-file"
"#
        )
        .unwrap();

        let fc = load_config_file_from(file.path());
        assert_eq!(fc.language.as_deref(), Some("zh-TW"));
        assert_eq!(fc.dialogue.wake_words, Some(vec!["小玲".to_string()]));
        assert_eq!(fc.dialogue.command_timeout_ms, Some(700));
        assert_eq!(fc.api_keys.openai.as_deref(), Some("sk-file"));
        assert!(fc.call.agent_url.is_none());
    }

    #[test]
    fn malformed_file_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "language = [").unwrap();
        assert!(load_config_file_from(file.path()).language.is_none());
    }
}
