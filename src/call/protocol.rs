//! Wire messages for the realtime agent socket
//!
//! Outbound frames are JSON objects keyed by message kind (`setup`,
//! `realtimeInput`); inbound frames carry `setupComplete`, `serverContent` or
//! `goAway`. One inbound frame may carry several events; an interrupt is always
//! reported before any audio in the same frame.

use serde::{Deserialize, Serialize};

use crate::voice::OUTPUT_SAMPLE_RATE;
use crate::voice::codec::INPUT_PCM_MIME;
use crate::{Error, Result};

/// MIME type of outbound camera frames
pub const JPEG_MIME: &str = "image/jpeg";

/// Everything the agent needs before the first media chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    /// Model identifier
    pub model: String,
    /// Prebuilt voice name
    pub voice: String,
    /// Persona instruction
    pub system_instruction: String,
}

/// A base64 media payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    /// MIME type, e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
    /// Base64 payload
    pub data: String,
}

impl MediaChunk {
    /// Microphone audio at the outbound wire rate
    #[must_use]
    pub fn audio(data: String) -> Self {
        Self {
            mime_type: INPUT_PCM_MIME.to_string(),
            data,
        }
    }

    /// A compressed camera frame
    #[must_use]
    pub fn jpeg(data: String) -> Self {
        Self {
            mime_type: JPEG_MIME.to_string(),
            data,
        }
    }

    /// Whether this chunk carries audio
    #[must_use]
    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }
}

/// Messages sent to the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Session configuration, sent once right after connecting
    Setup(SessionSetup),
    /// A realtime media chunk
    Media(MediaChunk),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum OutboundEnvelope<'a> {
    Setup(SetupPayload<'a>),
    RealtimeInput(RealtimeInput<'a>),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupPayload<'a> {
    model: &'a str,
    generation_config: GenerationConfig<'a>,
    system_instruction: Content<'a>,
    input_audio_transcription: Empty,
    output_audio_transcription: Empty,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [&'a str; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoice<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice<'a> {
    voice_name: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct Empty {}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: [&'a MediaChunk; 1],
}

impl OutboundMessage {
    /// Serialize to a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        let envelope = match self {
            Self::Setup(setup) => OutboundEnvelope::Setup(SetupPayload {
                model: &setup.model,
                generation_config: GenerationConfig {
                    response_modalities: ["AUDIO"],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoice {
                                voice_name: &setup.voice,
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: [TextPart {
                        text: &setup.system_instruction,
                    }],
                },
                input_audio_transcription: Empty {},
                output_audio_transcription: Empty {},
            }),
            Self::Media(chunk) => OutboundEnvelope::RealtimeInput(RealtimeInput {
                media_chunks: [chunk],
            }),
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

/// Events received from the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// The agent accepted the setup message
    SetupComplete,
    /// A base64 PCM16 audio fragment
    Audio {
        /// Base64 payload
        data: String,
        /// Sample rate from the MIME type
        sample_rate: u32,
    },
    /// Transcript fragment of the user's speech
    InputTranscript(String),
    /// Transcript fragment of the agent's speech
    OutputTranscript(String),
    /// The agent cut off its own speech (barge-in)
    Interrupted,
    /// The agent finished its turn
    TurnComplete,
    /// The agent ended the call
    Closed(Option<String>),
    /// The connection broke mid-call
    Failed(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}

/// Parse one inbound text frame into events
///
/// # Errors
///
/// Returns `Error::Format` if the frame is not valid JSON of the expected shape
pub fn parse_server_message(text: &str) -> Result<Vec<InboundEvent>> {
    let message: ServerMessage =
        serde_json::from_str(text).map_err(|e| Error::Format(format!("bad server frame: {e}")))?;
    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(InboundEvent::SetupComplete);
    }

    if let Some(content) = message.server_content {
        if content.interrupted {
            events.push(InboundEvent::Interrupted);
        }
        for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
            if let Some(inline) = part.inline_data {
                if !inline.mime_type.starts_with("audio/") {
                    tracing::trace!(mime = %inline.mime_type, "skipping non-audio part");
                    continue;
                }
                events.push(InboundEvent::Audio {
                    sample_rate: sample_rate_from_mime(&inline.mime_type),
                    data: inline.data,
                });
            }
        }
        if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
            events.push(InboundEvent::InputTranscript(t.text));
        }
        if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
            events.push(InboundEvent::OutputTranscript(t.text));
        }
        if content.turn_complete {
            events.push(InboundEvent::TurnComplete);
        }
    }

    if message.go_away.is_some() {
        events.push(InboundEvent::Closed(Some("server requested disconnect".to_string())));
    }

    Ok(events)
}

/// Read `rate=` from an audio MIME type, defaulting to the inbound wire rate
fn sample_rate_from_mime(mime: &str) -> u32 {
    mime.split(';')
        .filter_map(|p| p.trim().strip_prefix("rate="))
        .find_map(|r| r.parse().ok())
        .unwrap_or(OUTPUT_SAMPLE_RATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_message_shape() {
        let setup = OutboundMessage::Setup(SessionSetup {
            model: "models/live".to_string(),
            voice: "Kore".to_string(),
            system_instruction: "be kind".to_string(),
        });
        let json: serde_json::Value = serde_json::from_str(&setup.to_json().unwrap()).unwrap();

        assert_eq!(json["setup"]["model"], "models/live");
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(json["setup"]["systemInstruction"]["parts"][0]["text"], "be kind");
        assert!(json["setup"]["inputAudioTranscription"].is_object());
    }

    #[test]
    fn media_message_shape() {
        let msg = OutboundMessage::Media(MediaChunk::audio("AAAA".to_string()));
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], "AAAA");
    }

    #[test]
    fn server_content_events_in_order() {
        let frame = r#"{"serverContent":{
            "modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AQI="}}]},
            "outputTranscription":{"text":"您好"},
            "turnComplete":true}}"#;
        assert_eq!(
            parse_server_message(frame).unwrap(),
            vec![
                InboundEvent::Audio {
                    data: "AQI=".to_string(),
                    sample_rate: 24_000
                },
                InboundEvent::OutputTranscript("您好".to_string()),
                InboundEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn non_audio_parts_are_skipped() {
        let frame = r#"{"serverContent":{"modelTurn":{"parts":[
            {"inlineData":{"mimeType":"image/png","data":"iVBO"}},
            {"text":"thinking"},
            {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AQI="}}]}}}"#;
        assert_eq!(
            parse_server_message(frame).unwrap(),
            vec![InboundEvent::Audio {
                data: "AQI=".to_string(),
                sample_rate: 24_000
            }]
        );
    }

    #[test]
    fn interrupt_precedes_other_content() {
        let frame = r#"{"serverContent":{"interrupted":true,"inputTranscription":{"text":"等一下"}}}"#;
        assert_eq!(
            parse_server_message(frame).unwrap(),
            vec![
                InboundEvent::Interrupted,
                InboundEvent::InputTranscript("等一下".to_string())
            ]
        );
    }

    #[test]
    fn setup_complete_and_go_away() {
        assert_eq!(
            parse_server_message(r#"{"setupComplete":{}}"#).unwrap(),
            vec![InboundEvent::SetupComplete]
        );
        assert!(matches!(
            parse_server_message(r#"{"goAway":{"timeLeft":"1s"}}"#).unwrap()[..],
            [InboundEvent::Closed(Some(_))]
        ));
    }

    #[test]
    fn unknown_fields_are_ignored_and_garbage_rejected() {
        assert!(parse_server_message(r#"{"usageMetadata":{}}"#).unwrap().is_empty());
        assert!(matches!(parse_server_message("not json"), Err(Error::Format(_))));
    }

    #[test]
    fn mime_rate_defaults() {
        assert_eq!(sample_rate_from_mime("audio/pcm;rate=16000"), 16_000);
        assert_eq!(sample_rate_from_mime("audio/pcm"), OUTPUT_SAMPLE_RATE);
    }
}
