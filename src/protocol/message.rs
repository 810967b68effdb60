//! JSON control messages exchanged with the speech service

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;
use crate::audio::CodecKind;
use crate::device::ListeningMode;

/// Message received from the server, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Hello(ServerHello),

    Tts {
        state: TtsState,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        emotion: Option<String>,
    },

    Stt {
        #[serde(default)]
        text: String,
    },

    Llm {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        emotion: Option<String>,
        #[serde(default)]
        is_final: bool,
    },

    Mcp {
        #[serde(default)]
        payload: Value,
    },

    System {
        #[serde(default)]
        command: String,
    },

    Alert {
        #[serde(default)]
        status: String,
        #[serde(default)]
        message: String,
        #[serde(default)]
        emotion: String,
    },

    Custom {
        #[serde(default)]
        payload: Value,
    },

    Error {
        #[serde(default)]
        message: String,
    },

    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Parse a text frame
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a JSON object with a `type` field
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Short label for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Tts { .. } => "tts",
            Self::Stt { .. } => "stt",
            Self::Llm { .. } => "llm",
            Self::Mcp { .. } => "mcp",
            Self::System { .. } => "system",
            Self::Alert { .. } => "alert",
            Self::Custom { .. } => "custom",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// `tts` message state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    Stop,
    SentenceStart,
    #[serde(other)]
    Other,
}

/// Server hello
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerHello {
    #[serde(default)]
    pub transport: String,

    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub audio_params: Option<ServerAudioParams>,
}

/// Downlink audio parameters announced by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ServerAudioParams {
    #[serde(default)]
    pub sample_rate: Option<u32>,

    #[serde(default)]
    pub frame_duration: Option<u32>,
}

/// Why the device is interrupting the server's speech
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    #[default]
    None,
    WakeWordDetected,
}

/// `listen` message state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

/// Message sent to the server, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Listen {
        session_id: String,
        state: ListenState,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<&'static str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    Abort {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<AbortReason>,
    },

    Mcp {
        session_id: String,
        payload: Value,
    },
}

impl ClientMessage {
    #[must_use]
    pub fn start_listening(session_id: &str, mode: ListeningMode) -> Self {
        Self::Listen {
            session_id: session_id.to_string(),
            state: ListenState::Start,
            mode: Some(mode.as_str()),
            text: None,
        }
    }

    #[must_use]
    pub fn stop_listening(session_id: &str) -> Self {
        Self::Listen {
            session_id: session_id.to_string(),
            state: ListenState::Stop,
            mode: None,
            text: None,
        }
    }

    #[must_use]
    pub fn wake_word_detected(session_id: &str, text: &str) -> Self {
        Self::Listen {
            session_id: session_id.to_string(),
            state: ListenState::Detect,
            mode: None,
            text: Some(text.to_string()),
        }
    }

    #[must_use]
    pub fn abort_speaking(session_id: &str, reason: AbortReason) -> Self {
        Self::Abort {
            session_id: session_id.to_string(),
            reason: (reason != AbortReason::None).then_some(reason),
        }
    }

    #[must_use]
    pub fn mcp(session_id: &str, payload: Value) -> Self {
        Self::Mcp {
            session_id: session_id.to_string(),
            payload,
        }
    }

    /// Serialize to a text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Client hello sent right after connecting
#[derive(Debug, Clone, Serialize)]
pub struct ClientHello {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub version: u8,
    pub features: HelloFeatures,
    pub transport: &'static str,
    pub audio_params: HelloAudioParams,
}

#[derive(Debug, Clone, Serialize)]
pub struct HelloFeatures {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub aec: bool,
    pub mcp: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HelloAudioParams {
    pub format: &'static str,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_duration: u32,
}

impl ClientHello {
    #[must_use]
    pub fn new(version: u8, codec: CodecKind, server_aec: bool, frame_duration: u32) -> Self {
        Self {
            kind: "hello",
            version,
            features: HelloFeatures {
                aec: server_aec,
                mcp: true,
            },
            transport: "websocket",
            audio_params: HelloAudioParams {
                format: codec.as_str(),
                sample_rate: crate::audio::CAPTURE_SAMPLE_RATE,
                channels: 1,
                frame_duration,
            },
        }
    }

    /// Serialize to a text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tts_messages() {
        let msg = ServerMessage::parse(r#"{"type":"tts","state":"start"}"#).unwrap();
        assert!(matches!(msg, ServerMessage::Tts { state: TtsState::Start, .. }));

        let msg = ServerMessage::parse(
            r#"{"type":"tts","state":"sentence_start","text":"hello","emotion":"happy"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::Tts {
                state: TtsState::SentenceStart,
                text: Some("hello".to_string()),
                emotion: Some("happy".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_unknown_type() {
        let msg = ServerMessage::parse(r#"{"type":"iot","commands":[]}"#).unwrap();
        assert_eq!(msg, ServerMessage::Unknown);
        assert!(ServerMessage::parse(r#"{"text":"no type"}"#).is_err());
    }

    #[test]
    fn test_parse_hello() {
        let msg = ServerMessage::parse(
            r#"{"type":"hello","transport":"websocket","session_id":"abc","audio_params":{"sample_rate":24000,"frame_duration":60}}"#,
        )
        .unwrap();
        let ServerMessage::Hello(hello) = msg else {
            panic!("expected hello");
        };
        assert_eq!(hello.session_id.as_deref(), Some("abc"));
        assert_eq!(hello.audio_params.unwrap().sample_rate, Some(24000));
    }

    #[test]
    fn test_start_listening_json() {
        let json = ClientMessage::start_listening("s1", ListeningMode::AutoStop)
            .to_json()
            .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "listen");
        assert_eq!(value["state"], "start");
        assert_eq!(value["mode"], "auto");
        assert_eq!(value["session_id"], "s1");
    }

    #[test]
    fn test_abort_reason_omitted_when_none() {
        let json = ClientMessage::abort_speaking("s1", AbortReason::None)
            .to_json()
            .unwrap();
        assert!(!json.contains("reason"));

        let json = ClientMessage::abort_speaking("s1", AbortReason::WakeWordDetected)
            .to_json()
            .unwrap();
        assert!(json.contains(r#""reason":"wake_word_detected""#));
    }

    #[test]
    fn test_client_hello_json() {
        let json = ClientHello::new(3, CodecKind::Pcm16, false, 60).to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "hello");
        assert_eq!(value["version"], 3);
        assert_eq!(value["features"]["mcp"], true);
        assert!(value["features"].get("aec").is_none());
        assert_eq!(value["audio_params"]["format"], "pcm16");
        assert_eq!(value["audio_params"]["frame_duration"], 60);
    }
}
