use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::VadConfig;
use crate::dispatch::Envelope;
use crate::error::ConfigurationError;

/// Normalized audio frame. The payload is opaque to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioFrame(Bytes);

impl AudioFrame {
    pub fn new(payload: Bytes) -> Self {
        Self(payload)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Bytes> for AudioFrame {
    fn from(payload: Bytes) -> Self {
        Self(payload)
    }
}

impl From<Vec<u8>> for AudioFrame {
    fn from(payload: Vec<u8>) -> Self {
        Self(Bytes::from(payload))
    }
}

impl From<&'static [u8]> for AudioFrame {
    fn from(payload: &'static [u8]) -> Self {
        Self(Bytes::from_static(payload))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecTag {
    Pcm16,
    #[serde(rename = "g711_ulaw")]
    G711Ulaw,
    #[serde(rename = "g711_alaw")]
    G711Alaw,
    Opus,
}

impl CodecTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecTag::Pcm16 => "pcm16",
            CodecTag::G711Ulaw => "g711_ulaw",
            CodecTag::G711Alaw => "g711_alaw",
            CodecTag::Opus => "opus",
        }
    }
}

impl fmt::Display for CodecTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codec tag, sample rate and channel count of a session's audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub codec: CodecTag,
    pub sample_rate_hz: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(codec: CodecTag, sample_rate_hz: u32, channels: u16) -> Self {
        Self {
            codec,
            sample_rate_hz,
            channels,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.sample_rate_hz == 0 {
            return Err(ConfigurationError::invalid_format(
                "sample rate must be greater than zero",
            ));
        }
        if self.channels == 0 {
            return Err(ConfigurationError::invalid_format(
                "channel count must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Applies a partial update, returning the merged format without touching `self`.
    pub fn merged(&self, update: &FormatUpdate) -> Result<Self, ConfigurationError> {
        let merged = Self {
            codec: update.codec.unwrap_or(self.codec),
            sample_rate_hz: update.sample_rate_hz.unwrap_or(self.sample_rate_hz),
            channels: update.channels.unwrap_or(self.channels),
        };
        merged.validate()?;
        Ok(merged)
    }
}

/// Fields carried by a client `config` message; absent fields keep their value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatUpdate {
    pub codec: Option<CodecTag>,
    pub sample_rate_hz: Option<u32>,
    pub channels: Option<u16>,
}

impl FormatUpdate {
    pub fn is_empty(&self) -> bool {
        self.codec.is_none() && self.sample_rate_hz.is_none() && self.channels.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Telephony,
    Browser,
    VoiceChat,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Telephony => "telephony",
            TransportKind::Browser => "browser",
            TransportKind::VoiceChat => "voice_chat",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a transport hands to the gateway on each read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// A JSON event envelope.
    Text(String),
    /// Raw encoded audio.
    Binary(Bytes),
    Closed,
}

/// What the gateway hands to a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Audio already encoded for the transport's codec.
    Audio(Bytes),
    Event(Envelope),
}

/// Lifecycle and media events emitted by the conversational engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    SpeechStarted,
    SpeechEnded,
    ResponseStarted,
    ResponseAudio(AudioFrame),
    ResponseText(String),
    ResponseEnded,
    Error(String),
}

impl EngineEvent {
    pub fn label(&self) -> &'static str {
        match self {
            EngineEvent::SpeechStarted => "speech_started",
            EngineEvent::SpeechEnded => "speech_ended",
            EngineEvent::ResponseStarted => "response_started",
            EngineEvent::ResponseAudio(_) => "response_audio",
            EngineEvent::ResponseText(_) => "response_text",
            EngineEvent::ResponseEnded => "response_ended",
            EngineEvent::Error(_) => "error",
        }
    }
}

/// Session parameters handed to the engine when it is subscribed.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub session_id: String,
    pub transport: TransportKind,
    pub format: AudioFormat,
    pub vad: VadConfig,
}
