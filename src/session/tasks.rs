//! 每个会话的两个后台任务：客户端读取循环与引擎桥接循环。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument, Span};

use crate::audio::{AudioHandler, Received};
use crate::conversation::{ConversationEvent, StateMachine};
use crate::dispatch::{Envelope, EventDispatcher};
use crate::pipeline::{ConversationalEngine, EngineEvent, EngineEvents, InboundFrame, Transport};

use super::lifecycle::{DisconnectReason, SessionStatus};
use super::link::{FaultReporter, SessionLink};

async fn terminating(status: &mut watch::Receiver<SessionStatus>) {
    // a dropped sender means the session itself is gone
    let _ = status.wait_for(SessionStatus::is_terminating).await;
}

/// Reads client frames and hands them to the dispatcher until the client
/// hangs up or the session starts disconnecting.
pub(crate) struct InboundReader {
    session_id: String,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<EventDispatcher>,
    faults: FaultReporter,
    status: watch::Receiver<SessionStatus>,
}

impl InboundReader {
    pub(crate) fn new(
        session_id: String,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<EventDispatcher>,
        faults: FaultReporter,
        status: watch::Receiver<SessionStatus>,
    ) -> Self {
        Self {
            session_id,
            transport,
            dispatcher,
            faults,
            status,
        }
    }

    pub(crate) fn spawn(self, span: Span) -> JoinHandle<()> {
        tokio::spawn(self.run().instrument(span))
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = terminating(&mut self.status) => break,
                frame = self.transport.receive() => match frame {
                    Ok(InboundFrame::Closed) => {
                        info!(
                            target: "connection_manager",
                            session_id = %self.session_id,
                            "client closed the connection"
                        );
                        self.faults
                            .report(&self.session_id, DisconnectReason::TransportClosed);
                        break;
                    }
                    Ok(frame) => {
                        self.dispatcher.dispatch(frame).await;
                    }
                    Err(err) => {
                        warn!(
                            target: "connection_manager",
                            session_id = %self.session_id,
                            %err,
                            "failed to read from client"
                        );
                        self.faults
                            .report(&self.session_id, DisconnectReason::TransportFailed(err));
                        break;
                    }
                },
            }
        }
        debug!(
            target: "connection_manager",
            session_id = %self.session_id,
            "inbound reader stopped"
        );
    }
}

/// Moves caller audio from the input queue into the engine and applies
/// engine events to the session.
pub(crate) struct EngineBridge {
    session_id: String,
    audio: Arc<AudioHandler>,
    machine: Arc<StateMachine>,
    engine: Arc<dyn ConversationalEngine>,
    events: EngineEvents,
    link: SessionLink,
    status: watch::Receiver<SessionStatus>,
    poll: Duration,
    max_errors: u32,
}

impl EngineBridge {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: String,
        audio: Arc<AudioHandler>,
        machine: Arc<StateMachine>,
        engine: Arc<dyn ConversationalEngine>,
        events: EngineEvents,
        link: SessionLink,
        status: watch::Receiver<SessionStatus>,
        poll: Duration,
        max_errors: u32,
    ) -> Self {
        Self {
            session_id,
            audio,
            machine,
            engine,
            events,
            link,
            status,
            poll,
            max_errors,
        }
    }

    pub(crate) fn spawn(self, span: Span) -> JoinHandle<()> {
        tokio::spawn(self.run().instrument(span))
    }

    async fn run(mut self) {
        let mut events_open = true;
        loop {
            tokio::select! {
                biased;
                _ = terminating(&mut self.status) => break,
                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        events_open = false;
                        info!(
                            target: "engine_bridge",
                            session_id = %self.session_id,
                            "engine event stream ended"
                        );
                    }
                },
                received = self.audio.receive_audio(self.poll) => match received {
                    Received::Frame(frame) => {
                        if let Err(err) = self.engine.submit(&self.session_id, frame).await {
                            self.engine_error(format!("failed to submit audio: {err:#}"));
                        }
                    }
                    Received::TimedOut => {}
                    Received::Closed => break,
                },
            }
        }
        debug!(
            target: "engine_bridge",
            session_id = %self.session_id,
            "engine bridge stopped"
        );
    }

    async fn handle_event(&self, event: EngineEvent) {
        debug!(
            target: "engine_bridge",
            session_id = %self.session_id,
            event = event.label(),
            "engine event"
        );
        match event {
            EngineEvent::SpeechStarted => {
                let transition = self.audio.handle_speech_started(&self.machine);
                let barged_in = transition
                    .change()
                    .map(|change| change.is_barge_in())
                    .unwrap_or(false);
                if barged_in {
                    if let Err(err) = self.engine.cancel_response(&self.session_id).await {
                        warn!(
                            target: "engine_bridge",
                            session_id = %self.session_id,
                            error = %format!("{err:#}"),
                            "failed to cancel engine response"
                        );
                    }
                }
            }
            EngineEvent::SpeechEnded => {
                self.machine.apply(ConversationEvent::SpeechEnded);
            }
            EngineEvent::ResponseStarted => {
                self.machine.apply(ConversationEvent::ResponseStarted);
            }
            EngineEvent::ResponseEnded => {
                self.machine.apply(ConversationEvent::ResponseEnded);
            }
            EngineEvent::ResponseAudio(frame) => {
                // rejections are logged by the handler
                let _ = self.audio.send_audio(frame);
            }
            EngineEvent::ResponseText(text) => {
                let _ = self.link.send_event(Envelope::Text { text }).await;
            }
            EngineEvent::Error(message) => self.engine_error(message),
        }
    }

    fn engine_error(&self, message: String) {
        warn!(
            target: "engine_bridge",
            session_id = %self.session_id,
            %message,
            "engine reported an error"
        );
        let count = self.machine.report_error(message);
        if self.max_errors > 0 && count >= self.max_errors {
            warn!(
                target: "engine_bridge",
                session_id = %self.session_id,
                count,
                "engine error budget exhausted"
            );
            self.link
                .faults()
                .report(&self.session_id, DisconnectReason::TooManyErrors { count });
        }
    }
}
