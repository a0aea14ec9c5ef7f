//! Fault taxonomy shared by every component of the gateway.

use thiserror::Error;

use crate::audio::QueueKind;

/// Failures reported by a transport adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("failed to accept connection: {message}")]
    AcceptFailed { message: String },
    #[error("failed to send payload: {message}")]
    SendFailed { message: String },
    #[error("failed to receive frame: {message}")]
    ReceiveFailed { message: String },
    #[error("transport operation timed out")]
    Timeout,
}

impl TransportError {
    pub fn accept<S: Into<String>>(message: S) -> Self {
        Self::AcceptFailed {
            message: message.into(),
        }
    }

    pub fn send<S: Into<String>>(message: S) -> Self {
        Self::SendFailed {
            message: message.into(),
        }
    }

    pub fn receive<S: Into<String>>(message: S) -> Self {
        Self::ReceiveFailed {
            message: message.into(),
        }
    }
}

/// Setup-time faults. A session never becomes active after one of these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("missing credential `{name}`")]
    MissingCredential { name: String },
    #[error("invalid audio format: {message}")]
    InvalidFormat { message: String },
    #[error("invalid value for `{field}`: {message}")]
    InvalidValue { field: String, message: String },
    #[error("conversational engine setup failed: {message}")]
    EngineSetup { message: String },
    #[error("failed to load configuration: {message}")]
    Load { message: String },
}

impl ConfigurationError {
    pub fn missing_credential<S: Into<String>>(name: S) -> Self {
        Self::MissingCredential { name: name.into() }
    }

    pub fn invalid_format<S: Into<String>>(message: S) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    pub fn invalid_value<F: Into<String>, S: Into<String>>(field: F, message: S) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn engine_setup<S: Into<String>>(message: S) -> Self {
        Self::EngineSetup {
            message: message.into(),
        }
    }

    pub fn load<S: Into<String>>(message: S) -> Self {
        Self::Load {
            message: message.into(),
        }
    }
}

/// Why a frame did not make it into a queue. Never fatal for the session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameRejection {
    #[error("{queue} queue saturated at capacity {capacity}")]
    Saturated { queue: QueueKind, capacity: usize },
    #[error("{queue} queue is closed")]
    Closed { queue: QueueKind },
    #[error("{queue} queue is holding playback after an interruption")]
    Held { queue: QueueKind },
}

impl FrameRejection {
    pub fn queue(&self) -> QueueKind {
        match self {
            Self::Saturated { queue, .. } | Self::Closed { queue } | Self::Held { queue } => *queue,
        }
    }

    pub fn is_saturation(&self) -> bool {
        matches!(self, Self::Saturated { .. })
    }
}

/// An inbound message the dispatcher could not route.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedMessageError {
    #[error("message is not valid json: {message}")]
    InvalidJson { message: String },
    #[error("audio payload is not valid base64: {message}")]
    InvalidAudioPayload { message: String },
    #[error("audio payload could not be decoded: {message}")]
    UndecodableAudio { message: String },
    #[error("unknown message type `{kind}`")]
    UnknownType { kind: String },
    #[error("message type `{kind}` is not accepted from clients")]
    UnexpectedType { kind: String },
    #[error("invalid config message: {message}")]
    InvalidConfig { message: String },
}

impl MalformedMessageError {
    pub fn invalid_json<S: Into<String>>(message: S) -> Self {
        Self::InvalidJson {
            message: message.into(),
        }
    }

    pub fn unknown_type<S: Into<String>>(kind: S) -> Self {
        Self::UnknownType { kind: kind.into() }
    }

    pub fn unexpected_type<S: Into<String>>(kind: S) -> Self {
        Self::UnexpectedType { kind: kind.into() }
    }
}

/// A subscriber callback failed or panicked.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("observer {subscription} failed during {callback}: {message}")]
pub struct CallbackError {
    pub subscription: u64,
    pub callback: &'static str,
    pub message: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to decode frame: {message}")]
    Decode { message: String },
    #[error("failed to encode frame: {message}")]
    Encode { message: String },
}

impl CodecError {
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn encode<S: Into<String>>(message: S) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }
}

/// Errors surfaced by `ConnectionManager::connect`.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("session `{session_id}` is already registered")]
    DuplicateSession { session_id: String },
    #[error("connection manager is shutting down")]
    ShuttingDown,
    #[error("session limit of {limit} reached")]
    CapacityExceeded { limit: usize },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl GatewayError {
    /// Stable code carried by the client-facing `error` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateSession { .. } => "duplicate_session",
            Self::ShuttingDown => "shutting_down",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::Transport(_) => "transport_error",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_reports_queue_and_saturation() {
        let rejection = FrameRejection::Saturated {
            queue: QueueKind::Input,
            capacity: 2,
        };
        assert_eq!(rejection.queue(), QueueKind::Input);
        assert!(rejection.is_saturation());
        assert_eq!(rejection.to_string(), "input queue saturated at capacity 2");
        assert!(!FrameRejection::Closed {
            queue: QueueKind::Output
        }
        .is_saturation());
    }

    #[test]
    fn gateway_errors_map_to_client_codes() {
        let duplicate = GatewayError::DuplicateSession {
            session_id: "call-1".into(),
        };
        assert_eq!(duplicate.code(), "duplicate_session");

        let config: GatewayError = ConfigurationError::missing_credential("ENGINE_API_KEY").into();
        assert_eq!(config.code(), "configuration_error");
        assert_eq!(
            config.to_string(),
            "missing credential `ENGINE_API_KEY`"
        );
    }
}
