use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{CodecError, TransportError};

use super::types::{AudioFrame, EngineEvent, InboundFrame, Outbound, SessionContext, TransportKind};

/// A connected client, whatever platform it arrives from.
///
/// Methods take `&self`: the gateway reads and writes concurrently from
/// separate tasks, so adapters keep their read and write halves apart.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn accept(&self) -> Result<(), TransportError>;

    /// Next inbound frame, or `InboundFrame::Closed` once the peer hangs up.
    async fn receive(&self) -> Result<InboundFrame, TransportError>;

    async fn send(&self, payload: Outbound) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

pub trait Codec: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<AudioFrame, CodecError>;

    fn encode(&self, frame: &AudioFrame) -> Result<Bytes, CodecError>;
}

pub type EngineEvents = mpsc::Receiver<EngineEvent>;

#[async_trait]
pub trait ConversationalEngine: Send + Sync {
    /// Opens the engine side of a session and returns its event stream.
    async fn subscribe(&self, context: &SessionContext) -> Result<EngineEvents>;

    async fn submit(&self, session_id: &str, frame: AudioFrame) -> Result<()>;

    async fn submit_text(&self, session_id: &str, text: &str) -> Result<()>;

    /// Stops the response currently being generated, if any.
    async fn cancel_response(&self, session_id: &str) -> Result<()>;

    async fn release(&self, session_id: &str) -> Result<()>;
}
