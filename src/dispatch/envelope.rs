use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::conversation::{ConversationState, StateChange};
use crate::error::MalformedMessageError;
use crate::pipeline::{CodecTag, FormatUpdate};

/// JSON event envelope exchanged with clients, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    /// Base64-encoded audio in the transport's codec.
    Audio {
        payload: String,
    },
    Text {
        text: String,
    },
    Config {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        codec: Option<CodecTag>,
        #[serde(
            default,
            rename = "sampleRate",
            skip_serializing_if = "Option::is_none"
        )]
        sample_rate: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channels: Option<u16>,
    },
    Interrupt,
    StateChange {
        from: ConversationState,
        to: ConversationState,
        sequence: u64,
    },
    SpeechStarted,
    SpeechEnded,
    ResponseStarted,
    ResponseEnded,
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Connected {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Disconnected {
        #[serde(rename = "sessionId")]
        session_id: String,
        reason: String,
    },
    #[serde(other)]
    Unknown,
}

impl Envelope {
    pub fn audio(raw: &[u8]) -> Self {
        Envelope::Audio {
            payload: STANDARD.encode(raw),
        }
    }

    pub fn error(message: impl Into<String>, code: Option<&str>) -> Self {
        Envelope::Error {
            message: message.into(),
            code: code.map(str::to_string),
        }
    }

    pub fn state_change(change: &StateChange) -> Self {
        Envelope::StateChange {
            from: change.from,
            to: change.to,
            sequence: change.sequence,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Audio { .. } => "audio",
            Envelope::Text { .. } => "text",
            Envelope::Config { .. } => "config",
            Envelope::Interrupt => "interrupt",
            Envelope::StateChange { .. } => "stateChange",
            Envelope::SpeechStarted => "speechStarted",
            Envelope::SpeechEnded => "speechEnded",
            Envelope::ResponseStarted => "responseStarted",
            Envelope::ResponseEnded => "responseEnded",
            Envelope::Error { .. } => "error",
            Envelope::Connected { .. } => "connected",
            Envelope::Disconnected { .. } => "disconnected",
            Envelope::Unknown => "unknown",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parses a client message. Unknown `type`s surface as `UnknownType`
    /// carrying the offending tag.
    pub fn parse(raw: &str) -> Result<Self, MalformedMessageError> {
        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|err| MalformedMessageError::invalid_json(err.to_string()))?;

        if envelope == Envelope::Unknown {
            return Err(MalformedMessageError::unknown_type(probe_type(raw)));
        }
        Ok(envelope)
    }

    pub(crate) fn decode_audio(payload: &str) -> Result<Vec<u8>, MalformedMessageError> {
        STANDARD
            .decode(payload)
            .map_err(|err| MalformedMessageError::InvalidAudioPayload {
                message: err.to_string(),
            })
    }

    pub(crate) fn format_update(&self) -> Option<FormatUpdate> {
        match self {
            Envelope::Config {
                codec,
                sample_rate,
                channels,
            } => Some(FormatUpdate {
                codec: *codec,
                sample_rate_hz: *sample_rate,
                channels: *channels,
            }),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct TypeProbe {
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

fn probe_type(raw: &str) -> String {
    serde_json::from_str::<TypeProbe>(raw)
        .ok()
        .and_then(|probe| probe.kind)
        .unwrap_or_else(|| "<missing>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_change_serializes_with_camel_case_tag() {
        let envelope = Envelope::StateChange {
            from: ConversationState::Responding,
            to: ConversationState::Interrupted,
            sequence: 4,
        };
        let value = serde_json::to_value(&envelope).expect("encode");
        assert_eq!(
            value,
            serde_json::json!({
                "type": "stateChange",
                "from": "responding",
                "to": "interrupted",
                "sequence": 4
            })
        );
    }

    #[test]
    fn config_parses_partial_fields() {
        let envelope =
            Envelope::parse(r#"{"type":"config","sampleRate":16000}"#).expect("parse config");
        assert_eq!(
            envelope.format_update(),
            Some(FormatUpdate {
                codec: None,
                sample_rate_hz: Some(16_000),
                channels: None,
            })
        );
    }

    #[test]
    fn unknown_type_reports_tag() {
        let err = Envelope::parse(r#"{"type":"dtmf","digit":"5"}"#).expect_err("unknown");
        assert_eq!(err, MalformedMessageError::unknown_type("dtmf"));
    }

    #[test]
    fn missing_discriminator_is_invalid_json() {
        let err = Envelope::parse(r#"{"text":"hi"}"#).expect_err("no type");
        assert!(matches!(err, MalformedMessageError::InvalidJson { .. }));
    }

    #[test]
    fn audio_payload_is_base64() {
        let envelope = Envelope::audio(&[0xff, 0x7f, 0x00]);
        let Envelope::Audio { payload } = &envelope else {
            panic!("unexpected envelope: {envelope:?}");
        };
        assert_eq!(Envelope::decode_audio(payload).expect("decode"), vec![0xff, 0x7f, 0x00]);
        assert!(Envelope::decode_audio("not base64!").is_err());
    }

    #[test]
    fn error_envelope_omits_missing_code() {
        let json = Envelope::error("engine unavailable", None)
            .to_json()
            .expect("encode");
        assert_eq!(json, r#"{"type":"error","message":"engine unavailable"}"#);
    }
}
