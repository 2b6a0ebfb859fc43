//! Configuration management for the companion
//!
//! Every setting resolves as env > TOML file > default.

pub mod file;

use std::fmt;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::call::{CallOptions, SessionSetup};
use crate::voice::SegmenterTimeouts;
use crate::{Error, Result};

/// Phonetic variants of the companion's name
pub const DEFAULT_WAKE_WORDS: &[&str] = &[
    "小玲", "小灵", "肖玲", "晓铃", "小领", "晓玲", "晓灵", "小林", "小琳", "晓琳", "晓临", "筱玲",
];

/// Keywords that mark text after the wake word as a command
pub const DEFAULT_ACTION_KEYWORDS: &[&str] = &[
    // medicine
    "吃药", "用药", "药片", "药瓶", "核对", "喝药", "扫药",
    // vision
    "打开摄像头", "开启摄像头", "扫描", "看东西", "帮我看看", "这是什么", "识别", "拍照", "识物",
    // weather
    "天气", "穿什么", "冷不冷", "气温", "几度",
    // news
    "新闻", "头条", "发生什么", "新鲜事", "播报",
    // call
    "视频", "通话", "儿子", "女儿", "视频通话", "打电话", "连线",
    // family
    "留言", "亲情", "孩子们", "写信", "看孩子",
    // alarm
    "闹钟", "时间", "几点",
    // chat
    "聊天", "说话", "解闷",
    // switch camera
    "切换", "换个镜头", "换一个", "看不清", "反过来", "前后切换",
];

/// Romanized wake words accepted when the companion speaks English
pub const ENGLISH_WAKE_WORDS: &[&str] = &["xiao ling", "xiaoling", "shao ling", "siao ling"];

/// Command keywords for English utterances
pub const ENGLISH_ACTION_KEYWORDS: &[&str] = &[
    "medicine", "pill", "camera", "scan", "look at", "what is this", "weather", "wear", "news",
    "call", "video", "son", "daughter", "family", "message", "alarm", "time", "chat", "talk",
    "switch", "flip",
];

/// Persona for spoken replies
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "你是一个温柔、耐心的老年人关怀助手，名叫'小玲'。你的任务是陪伴老人，回答他们的问题，语气要像家人一样亲切。请使用简单易懂的词汇，遇到药品说明时要特别提醒遵医嘱。";

/// Persona for live calls
pub const DEFAULT_CALL_INSTRUCTION: &str = "你正在與一位老人進行即時視訊通話。你可以看到他提供的攝像頭畫面。請表現得像一個親切的孫女，關注他的情緒，詢問他今天的心情，如果他展示東西給你，請熱情地回應。";

const TRADITIONAL_SYSTEM_INSTRUCTION: &str = "你是一個溫柔、耐心的老年人關懷助手，名叫'小玲'。你的任務是陪伴老人，回答他們的問題，語氣要像家人一樣親切。請使用簡單易懂的詞彙，遇到藥品說明時要特別提醒遵醫囑。";
const ENGLISH_SYSTEM_INSTRUCTION: &str = "You are Xiao Ling, a gentle and patient companion for an elderly person. Keep them company and answer their questions warmly, like family. Use simple everyday words, and when medicine comes up always remind them to follow their doctor's advice.";
const ENGLISH_CALL_INSTRUCTION: &str = "You are on a live video call with an elderly person and can see their camera. Be a warm grandchild: notice their mood, ask how their day is going, and respond with enthusiasm when they show you something.";

const DEFAULT_AGENT_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
const DEFAULT_CALL_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-12-2025";
const DEFAULT_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Language the companion listens and speaks in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Locale {
    /// Simplified Chinese
    #[default]
    ZhCn,
    /// Traditional Chinese
    ZhTw,
    /// English
    En,
}

/// Spoken texts that depend on the locale
#[derive(Debug, Clone, Copy)]
pub struct LocaleTexts {
    /// Prompt after a bare wake word
    pub acknowledgement: &'static str,
    /// Reply when nothing useful came back
    pub fallback_reply: &'static str,
    /// Reply when a remote service is busy
    pub busy_reply: &'static str,
    /// Reply when a service key is not configured
    pub no_key_reply: &'static str,
    /// Persona for spoken replies
    pub system_instruction: &'static str,
    /// Persona for live calls
    pub call_instruction: &'static str,
}

impl Locale {
    /// Parse a language tag such as `zh-CN`, `zh-HK` or `en-US`
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for languages the companion cannot speak
    pub fn parse(tag: &str) -> Result<Self> {
        let tag = tag.trim().replace('_', "-").to_lowercase();
        match tag.as_str() {
            "zh" | "zh-cn" | "zh-sg" | "zh-hans" => Ok(Self::ZhCn),
            "zh-tw" | "zh-hk" | "zh-mo" | "zh-hant" => Ok(Self::ZhTw),
            t if t == "en" || t.starts_with("en-") => Ok(Self::En),
            _ => Err(Error::Config(format!(
                "unsupported language {tag:?} (use zh-CN, zh-TW or en)"
            ))),
        }
    }

    /// Canonical tag passed to recognizers and services
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::ZhCn => "zh-CN",
            Self::ZhTw => "zh-TW",
            Self::En => "en",
        }
    }

    /// Default spoken texts
    #[must_use]
    pub const fn texts(self) -> LocaleTexts {
        match self {
            Self::ZhCn => LocaleTexts {
                acknowledgement: "我在，您请说。",
                fallback_reply: "对不起，我没听清楚，请再说一遍。",
                busy_reply: "小玲连接不到大脑了，请稍后再试。",
                no_key_reply: "小玲连接不上大脑（API密钥未配置），请联系管理员协助解决。",
                system_instruction: DEFAULT_SYSTEM_INSTRUCTION,
                call_instruction: DEFAULT_CALL_INSTRUCTION,
            },
            Self::ZhTw => LocaleTexts {
                acknowledgement: "我在，您請說。",
                fallback_reply: "對不起，我沒聽清楚，請再說一遍。",
                busy_reply: "小玲連接不到大腦了，請稍後再試。",
                no_key_reply: "小玲連接不上大腦（API金鑰未配置），請聯繫管理員協助解決。",
                system_instruction: TRADITIONAL_SYSTEM_INSTRUCTION,
                call_instruction: DEFAULT_CALL_INSTRUCTION,
            },
            Self::En => LocaleTexts {
                acknowledgement: "I'm here, go ahead.",
                fallback_reply: "Sorry, I didn't catch that. Could you say it again?",
                busy_reply: "Xiao Ling can't reach her brain right now, please try again later.",
                no_key_reply: "API key missing. Please ask for help.",
                system_instruction: ENGLISH_SYSTEM_INSTRUCTION,
                call_instruction: ENGLISH_CALL_INSTRUCTION,
            },
        }
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Companion configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Recognition and reply locale
    pub locale: Locale,

    /// Voice configuration
    pub voice: VoiceConfig,

    /// Wake word dialogue configuration
    pub dialogue: DialogueConfig,

    /// Live call configuration
    pub call: CallConfig,

    /// External service configuration
    pub services: ServiceConfig,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Voice processing configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Run the wake-word listener
    pub enabled: bool,

    /// STT provider ("whisper" or "deepgram")
    pub stt_provider: String,

    /// STT model (e.g. "whisper-1", "nova-2")
    pub stt_model: String,

    /// TTS provider ("openai" or "elevenlabs")
    pub tts_provider: String,

    /// TTS model (e.g. "tts-1")
    pub tts_model: String,

    /// TTS voice identifier
    pub tts_voice: String,

    /// TTS speed multiplier (0.25 to 4.0)
    pub tts_speed: f32,
}

/// Wake word and segmentation configuration
#[derive(Debug, Clone)]
pub struct DialogueConfig {
    /// Wake word variants
    pub wake_words: Vec<String>,

    /// Keywords that make text after a wake word a command
    pub action_keywords: Vec<String>,

    /// Segmenter silence timeouts
    pub timeouts: SegmenterTimeouts,

    /// How long `AwaitingCommand` lasts without speech
    pub awaiting_timeout: Duration,

    /// Prompt spoken after a bare wake word
    pub acknowledgement: String,

    /// Reply when the intent service gives nothing to say
    pub fallback_reply: String,

    /// Reply when a remote service is busy
    pub busy_reply: String,

    /// Reply when a service key is not configured
    pub no_key_reply: String,
}

/// Live call configuration
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Realtime agent WebSocket URL
    pub agent_url: String,

    /// Realtime model identifier
    pub model: String,

    /// Agent voice name
    pub voice: String,

    /// Persona instruction
    pub system_instruction: String,

    /// Microphone send interval
    pub capture_interval: Duration,

    /// Camera send interval
    pub video_interval: Duration,

    /// Outbound frame width in pixels
    pub video_width: u32,

    /// JPEG quality (1-100)
    pub jpeg_quality: u8,

    /// Preferred camera index
    pub camera_index: usize,
}

impl CallConfig {
    /// Options for a new call session
    #[must_use]
    pub fn options(&self) -> CallOptions {
        CallOptions {
            setup: SessionSetup {
                model: self.model.clone(),
                voice: self.voice.clone(),
                system_instruction: self.system_instruction.clone(),
            },
            capture_interval: self.capture_interval,
            video_interval: self.video_interval,
            video_width: self.video_width,
            jpeg_quality: self.jpeg_quality,
        }
    }
}

/// External service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Intent classification endpoint; without it every utterance is a reply
    pub intent_url: Option<String>,

    /// Streaming chat-completion endpoint
    pub chat_url: String,

    /// Chat model identifier
    pub chat_model: String,

    /// Persona instruction for replies
    pub system_instruction: String,
}

/// Where a key came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Environment variable
    Env,
    /// Config file
    File,
    /// Not configured
    Missing,
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Env => "environment",
            Self::File => "config file",
            Self::Missing => "not configured",
        })
    }
}

/// A key and its origin
#[derive(Debug, Clone)]
pub struct ApiKey {
    /// The secret
    pub value: SecretString,
    /// Where it was found
    pub source: KeySource,
}

impl ApiKey {
    /// Masked form for display: first 6 and last 4 characters
    #[must_use]
    pub fn masked(&self) -> String {
        mask(self.value.expose_secret())
    }
}

/// Reportable state of a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStatus {
    /// Service the key is for
    pub name: &'static str,
    /// Where it came from
    pub source: KeySource,
    /// Masked key, if configured
    pub display: Option<String>,
}

impl KeyStatus {
    /// Whether a key is configured
    #[must_use]
    pub fn configured(&self) -> bool {
        self.source != KeySource::Missing
    }
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// Realtime agent key (also used by the intent service)
    pub silvercare: Option<ApiKey>,

    /// `OpenAI` API key (Whisper, TTS, replies)
    pub openai: Option<ApiKey>,

    /// `ElevenLabs` API key (optional TTS)
    pub elevenlabs: Option<ApiKey>,

    /// `Deepgram` API key (optional STT)
    pub deepgram: Option<ApiKey>,
}

impl ApiKeys {
    /// Source and masked display of every key
    #[must_use]
    pub fn status(&self) -> Vec<KeyStatus> {
        [
            ("silvercare", &self.silvercare),
            ("openai", &self.openai),
            ("elevenlabs", &self.elevenlabs),
            ("deepgram", &self.deepgram),
        ]
        .into_iter()
        .map(|(name, key)| KeyStatus {
            name,
            source: key.as_ref().map_or(KeySource::Missing, |k| k.source),
            display: key.as_ref().map(ApiKey::masked),
        })
        .collect()
    }
}

/// The secret of a configured key
///
/// # Errors
///
/// Returns `Error::MissingApiKey` naming `env_name` when the key is absent
pub fn require_key(key: Option<&ApiKey>, env_name: &str) -> Result<SecretString> {
    key.map(|k| k.value.clone())
        .ok_or_else(|| Error::MissingApiKey(env_name.to_string()))
}

/// Mask a secret as `abcdef...wxyz`; short secrets are fully hidden
fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 10 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn load() -> Result<Self> {
        // Load optional TOML config file (env > toml > default)
        let fc = file::load_config_file();
        Self::from_sources(fc, |name| std::env::var(name).ok())
    }

    /// Resolve configuration from a parsed file and an env lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn from_sources(
        fc: file::SilvercareConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let env = |name: &str| env(name).filter(|v| !v.trim().is_empty());
        let key = |name: &str, from_file: Option<String>| {
            env(name)
                .map(|v| ApiKey {
                    value: SecretString::from(v),
                    source: KeySource::Env,
                })
                .or_else(|| {
                    from_file.filter(|v| !v.trim().is_empty()).map(|v| ApiKey {
                        value: SecretString::from(v),
                        source: KeySource::File,
                    })
                })
        };

        // Load API keys (env > toml > None)
        let api_keys = ApiKeys {
            silvercare: key("SILVERCARE_API_KEY", fc.api_keys.silvercare),
            openai: key("OPENAI_API_KEY", fc.api_keys.openai),
            elevenlabs: key("ELEVENLABS_API_KEY", fc.api_keys.elevenlabs),
            deepgram: key("DEEPGRAM_API_KEY", fc.api_keys.deepgram),
        };

        let locale = env("SILVERCARE_LANGUAGE")
            .or(fc.language)
            .map_or(Ok(Locale::default()), |tag| Locale::parse(&tag))?;
        let texts = locale.texts();

        // Voice config (env > toml > default)
        let voice = VoiceConfig {
            enabled: fc.voice.enabled.unwrap_or(true),
            stt_provider: env("SILVERCARE_STT_PROVIDER")
                .or(fc.voice.stt_provider)
                .unwrap_or_else(|| "whisper".to_string()),
            stt_model: env("SILVERCARE_STT_MODEL")
                .or(fc.voice.stt_model)
                .unwrap_or_else(|| "whisper-1".to_string()),
            tts_provider: env("SILVERCARE_TTS_PROVIDER")
                .or(fc.voice.tts_provider)
                .unwrap_or_else(|| "openai".to_string()),
            tts_model: env("SILVERCARE_TTS_MODEL")
                .or(fc.voice.tts_model)
                .unwrap_or_else(|| "tts-1".to_string()),
            tts_voice: fc.voice.tts_voice.unwrap_or_else(|| "nova".to_string()),
            tts_speed: fc.voice.tts_speed.unwrap_or(0.9).clamp(0.25, 4.0),
        };

        let defaults = SegmenterTimeouts::default();
        let dialogue = DialogueConfig {
            wake_words: fc.dialogue.wake_words.unwrap_or_else(|| {
                let english: &[&str] = if locale == Locale::En { ENGLISH_WAKE_WORDS } else { &[] };
                DEFAULT_WAKE_WORDS
                    .iter()
                    .chain(english)
                    .map(ToString::to_string)
                    .collect()
            }),
            action_keywords: fc.dialogue.action_keywords.unwrap_or_else(|| {
                let keywords = if locale == Locale::En {
                    ENGLISH_ACTION_KEYWORDS
                } else {
                    DEFAULT_ACTION_KEYWORDS
                };
                keywords.iter().map(ToString::to_string).collect()
            }),
            timeouts: SegmenterTimeouts {
                ambient: fc
                    .dialogue
                    .ambient_timeout_ms
                    .map_or(defaults.ambient, Duration::from_millis),
                command: fc
                    .dialogue
                    .command_timeout_ms
                    .map_or(defaults.command, Duration::from_millis),
            },
            awaiting_timeout: Duration::from_millis(fc.dialogue.awaiting_timeout_ms.unwrap_or(8_000)),
            acknowledgement: fc
                .dialogue
                .acknowledgement
                .unwrap_or_else(|| texts.acknowledgement.to_string()),
            fallback_reply: texts.fallback_reply.to_string(),
            busy_reply: texts.busy_reply.to_string(),
            no_key_reply: texts.no_key_reply.to_string(),
        };
        if dialogue.wake_words.is_empty() {
            return Err(Error::Config("at least one wake word is required".to_string()));
        }

        // Call config (env > toml > default)
        let call = CallConfig {
            agent_url: env("SILVERCARE_AGENT_URL")
                .or(fc.call.agent_url)
                .unwrap_or_else(|| DEFAULT_AGENT_URL.to_string()),
            model: fc.call.model.unwrap_or_else(|| DEFAULT_CALL_MODEL.to_string()),
            voice: fc.call.voice.unwrap_or_else(|| "Kore".to_string()),
            system_instruction: fc
                .call
                .system_instruction
                .unwrap_or_else(|| texts.call_instruction.to_string()),
            capture_interval: Duration::from_millis(fc.call.capture_interval_ms.unwrap_or(250).max(20)),
            video_interval: Duration::from_millis(fc.call.video_interval_ms.unwrap_or(1_000).max(100)),
            video_width: fc.call.video_width.unwrap_or(320),
            jpeg_quality: fc.call.jpeg_quality.unwrap_or(50).clamp(1, 100),
            camera_index: fc.call.camera_index.unwrap_or(0),
        };

        // Service config (env > toml > default)
        let services = ServiceConfig {
            intent_url: env("SILVERCARE_INTENT_URL").or(fc.services.intent_url),
            chat_url: env("SILVERCARE_CHAT_URL")
                .or(fc.services.chat_url)
                .unwrap_or_else(|| DEFAULT_CHAT_URL.to_string()),
            chat_model: fc
                .services
                .chat_model
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            system_instruction: fc
                .services
                .system_instruction
                .unwrap_or_else(|| texts.system_instruction.to_string()),
        };

        Ok(Self {
            locale,
            voice,
            dialogue,
            call,
            services,
            api_keys,
        })
    }
}
