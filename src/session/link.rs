use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::audio::AudioSink;
use crate::conversation::{ConversationObserver, StateChange};
use crate::dispatch::Envelope;
use crate::error::TransportError;
use crate::pipeline::{AudioFrame, Codec, Outbound, Transport};

use super::lifecycle::{DisconnectReason, SessionStatus};

/// A session that must be torn down, reported from inside one of its tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionFault {
    pub session_id: String,
    pub reason: DisconnectReason,
}

#[derive(Clone)]
pub(crate) struct FaultReporter {
    tx: mpsc::Sender<SessionFault>,
}

impl FaultReporter {
    pub(crate) fn new(tx: mpsc::Sender<SessionFault>) -> Self {
        Self { tx }
    }

    /// Queues a teardown request. A full queue defers the request to a
    /// task that waits for capacity; it is never dropped.
    pub(crate) fn report(&self, session_id: &str, reason: DisconnectReason) {
        let fault = SessionFault {
            session_id: session_id.to_string(),
            reason,
        };
        match self.tx.try_send(fault) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(fault)) => {
                debug!(
                    target: "connection_manager",
                    session_id = %fault.session_id,
                    reason = fault.reason.as_str(),
                    "fault queue full; deferring disconnect request"
                );
                let tx = self.tx.clone();
                match Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            if let Err(mpsc::error::SendError(fault)) = tx.send(fault).await {
                                debug!(
                                    target: "connection_manager",
                                    session_id = %fault.session_id,
                                    "connection manager gone; ignoring fault"
                                );
                            }
                        });
                    }
                    Err(err) => error!(
                        target: "connection_manager",
                        session_id = %fault.session_id,
                        %err,
                        "no runtime to deliver disconnect request"
                    ),
                }
            }
            Err(mpsc::error::TrySendError::Closed(fault)) => debug!(
                target: "connection_manager",
                session_id = %fault.session_id,
                "connection manager gone; ignoring fault"
            ),
        }
    }
}

/// Write side of one client connection. Any send failure schedules a
/// disconnect of the session.
#[derive(Clone)]
pub(crate) struct SessionLink {
    session_id: String,
    transport: Arc<dyn Transport>,
    faults: FaultReporter,
}

impl SessionLink {
    pub(crate) fn new(
        session_id: String,
        transport: Arc<dyn Transport>,
        faults: FaultReporter,
    ) -> Self {
        Self {
            session_id,
            transport,
            faults,
        }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn faults(&self) -> &FaultReporter {
        &self.faults
    }

    pub(crate) async fn send_event(&self, envelope: Envelope) -> Result<(), TransportError> {
        let kind = envelope.kind();
        self.send(Outbound::Event(envelope), kind).await
    }

    async fn send(&self, payload: Outbound, kind: &'static str) -> Result<(), TransportError> {
        match self.transport.send(payload).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(
                    target: "connection_manager",
                    session_id = %self.session_id,
                    kind,
                    %err,
                    "failed to send to client; scheduling disconnect"
                );
                self.faults
                    .report(&self.session_id, DisconnectReason::TransportFailed(err.clone()));
                Err(err)
            }
        }
    }
}

/// Encodes drained output audio and writes it to the client.
pub(crate) struct TransportAudioSink {
    link: SessionLink,
    codec: Arc<dyn Codec>,
}

impl TransportAudioSink {
    pub(crate) fn new(link: SessionLink, codec: Arc<dyn Codec>) -> Self {
        Self { link, codec }
    }
}

#[async_trait]
impl AudioSink for TransportAudioSink {
    async fn deliver(&self, frame: AudioFrame) -> Result<(), TransportError> {
        let raw = match self.codec.encode(&frame) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    target: "audio_handler",
                    session_id = %self.link.session_id,
                    %err,
                    "dropping output frame that failed to encode"
                );
                return Ok(());
            }
        };
        self.link.send(Outbound::Audio(raw), "audio").await
    }
}

/// Mirrors conversation updates of an active session to the client.
pub(crate) struct ClientEventForwarder {
    link: SessionLink,
    status: watch::Receiver<SessionStatus>,
}

impl ClientEventForwarder {
    pub(crate) fn new(link: SessionLink, status: watch::Receiver<SessionStatus>) -> Self {
        Self { link, status }
    }

    async fn forward(&self, envelope: Envelope) -> Result<()> {
        // teardown sends its own notices
        if *self.status.borrow() != SessionStatus::Active {
            return Ok(());
        }
        self.link.send_event(envelope).await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationObserver for ClientEventForwarder {
    async fn on_state_change(&self, change: &StateChange) -> Result<()> {
        self.forward(Envelope::state_change(change)).await
    }

    async fn on_speech_started(&self) -> Result<()> {
        self.forward(Envelope::SpeechStarted).await
    }

    async fn on_speech_ended(&self) -> Result<()> {
        self.forward(Envelope::SpeechEnded).await
    }

    async fn on_response_started(&self) -> Result<()> {
        self.forward(Envelope::ResponseStarted).await
    }

    async fn on_response_ended(&self) -> Result<()> {
        self.forward(Envelope::ResponseEnded).await
    }

    async fn on_error(&self, message: &str) -> Result<()> {
        self.forward(Envelope::error(message, Some("engine_error")))
            .await
    }
}
