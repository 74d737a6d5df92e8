//! # Realtime Protocol Messages
//!
//! JSON events exchanged with the remote conversational-audio service. Every
//! event is an object with a `type` discriminator, so both directions map onto
//! internally tagged serde enums.
//!
//! ## Outbound (client → service):
//! - `session.update`: model, voice, instructions and audio formats
//! - `input_audio_buffer.append`: base64 PCM16 mono 24kHz
//! - `conversation.item.create` + `response.create`: inject a user text turn
//!
//! ## Inbound (service → client):
//! Only the events the bridge reacts to have variants; everything else lands in
//! [`ServerEvent::Other`] and is ignored.

use serde::{Deserialize, Serialize};

/// Sample rate advertised for both input and output audio.
pub const PCM_RATE: u32 = 24_000;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl ClientEvent {
    /// The `session.update` body for an audio-only conversation.
    pub fn session_update(model: &str, voice: &str, instructions: &str) -> Self {
        ClientEvent::SessionUpdate {
            session: SessionSettings {
                kind: "realtime".to_string(),
                model: model.to_string(),
                output_modalities: vec!["audio".to_string()],
                audio: AudioSettings {
                    input: AudioInputSettings {
                        format: PcmFormat::default(),
                        turn_detection: TurnDetection {
                            kind: "server_vad".to_string(),
                        },
                    },
                    output: AudioOutputSettings {
                        format: PcmFormat::default(),
                        voice: voice.to_string(),
                    },
                },
                instructions: instructions.to_string(),
            },
        }
    }

    /// A user message carrying plain text.
    pub fn user_text(text: &str) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem {
                kind: "message".to_string(),
                role: "user".to_string(),
                content: vec![ContentPart {
                    kind: "input_text".to_string(),
                    text: text.to_string(),
                }],
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionSettings {
    #[serde(rename = "type")]
    pub kind: String,
    pub model: String,
    pub output_modalities: Vec<String>,
    pub audio: AudioSettings,
    pub instructions: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AudioSettings {
    pub input: AudioInputSettings,
    pub output: AudioOutputSettings,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AudioInputSettings {
    pub format: PcmFormat,
    pub turn_detection: TurnDetection,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AudioOutputSettings {
    pub format: PcmFormat,
    pub voice: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PcmFormat {
    #[serde(rename = "type")]
    pub kind: String,
    pub rate: u32,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            kind: "audio/pcm".to_string(),
            rate: PCM_RATE,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// Events received from the service.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,

    #[serde(rename = "session.updated")]
    SessionUpdated,

    #[serde(rename = "response.output_audio.delta")]
    AudioDelta {
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.output_audio.done")]
    AudioDone,

    #[serde(rename = "response.output_audio_transcript.delta")]
    TranscriptDelta {
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.output_audio_transcript.done")]
    TranscriptDone,

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: serde_json::Value,
    },

    #[serde(other)]
    Other,
}

/// Just the discriminator, for logging events that failed to match.
#[derive(Debug, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

impl ServerEvent {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// The `type` field of a raw frame, or `"<unknown>"`.
pub fn event_type(text: &str) -> String {
    serde_json::from_str::<EventEnvelope>(text)
        .ok()
        .and_then(|envelope| envelope.kind)
        .unwrap_or_else(|| "<unknown>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_update_shape() {
        let event = ClientEvent::session_update("gpt-realtime", "alloy", "Be brief.");
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "session.update",
                "session": {
                    "type": "realtime",
                    "model": "gpt-realtime",
                    "output_modalities": ["audio"],
                    "audio": {
                        "input": {
                            "format": {"type": "audio/pcm", "rate": 24000},
                            "turn_detection": {"type": "server_vad"}
                        },
                        "output": {
                            "format": {"type": "audio/pcm", "rate": 24000},
                            "voice": "alloy"
                        }
                    },
                    "instructions": "Be brief."
                }
            })
        );
    }

    #[test]
    fn test_text_injection_shape() {
        let item = serde_json::to_value(ClientEvent::user_text("hello")).unwrap();
        assert_eq!(item["type"], "conversation.item.create");
        assert_eq!(item["item"]["role"], "user");
        assert_eq!(item["item"]["content"][0], json!({"type": "input_text", "text": "hello"}));

        let create = serde_json::to_value(ClientEvent::ResponseCreate).unwrap();
        assert_eq!(create, json!({"type": "response.create"}));
    }

    #[test]
    fn test_server_events_parse() {
        assert_eq!(
            ServerEvent::parse(r#"{"type":"session.created","session":{"id":"s1"}}"#).unwrap(),
            ServerEvent::SessionCreated
        );
        assert_eq!(
            ServerEvent::parse(r#"{"type":"response.output_audio.delta","delta":"AAA=","item_id":"x"}"#).unwrap(),
            ServerEvent::AudioDelta { delta: "AAA=".to_string() }
        );
        assert_eq!(
            ServerEvent::parse(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap(),
            ServerEvent::Other
        );

        let error = ServerEvent::parse(r#"{"type":"error","error":{"message":"bad"}}"#).unwrap();
        assert!(matches!(error, ServerEvent::Error { error } if error["message"] == "bad"));
    }

    #[test]
    fn test_event_type_of_raw_frame() {
        assert_eq!(event_type(r#"{"type":"error"}"#), "error");
        assert_eq!(event_type("not json"), "<unknown>");
    }
}
