//! Inbound message classification and routing.

mod envelope;

pub use envelope::Envelope;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use crate::audio::AudioHandler;
use crate::conversation::{StateMachine, Transition};
use crate::error::{FrameRejection, MalformedMessageError};
use crate::pipeline::{AudioFormat, Codec, ConversationalEngine, FormatUpdate, InboundFrame};
use crate::telemetry::events::record_malformed_message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Audio,
    Text,
    Control,
}

/// A classified inbound message, before it is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Audio(Bytes),
    Text(String),
    Interrupt,
    Config(FormatUpdate),
}

impl Classified {
    pub fn lane(&self) -> Lane {
        match self {
            Classified::Audio(_) => Lane::Audio,
            Classified::Text(_) => Lane::Text,
            Classified::Interrupt | Classified::Config(_) => Lane::Control,
        }
    }
}

/// Sorts a transport frame into a lane. Binary frames are raw audio; text
/// frames must carry a client-side envelope.
pub fn classify(frame: &InboundFrame) -> Result<Classified, MalformedMessageError> {
    match frame {
        InboundFrame::Binary(raw) => Ok(Classified::Audio(raw.clone())),
        InboundFrame::Closed => Err(MalformedMessageError::unexpected_type("close")),
        InboundFrame::Text(raw) => {
            let envelope = Envelope::parse(raw)?;
            match envelope {
                Envelope::Audio { payload } => {
                    Envelope::decode_audio(&payload).map(|raw| Classified::Audio(Bytes::from(raw)))
                }
                Envelope::Text { text } => Ok(Classified::Text(text)),
                Envelope::Interrupt => Ok(Classified::Interrupt),
                config @ Envelope::Config { .. } => {
                    let update = config.format_update().unwrap_or_default();
                    if update.is_empty() {
                        return Err(MalformedMessageError::InvalidConfig {
                            message: "config message carries no format fields".into(),
                        });
                    }
                    Ok(Classified::Config(update))
                }
                other => Err(MalformedMessageError::unexpected_type(other.kind())),
            }
        }
    }
}

/// What happened to a dispatched message.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// Audio handed to the input queue; `Err` when the frame was dropped.
    Audio(Result<(), FrameRejection>),
    Text,
    Interrupt(Transition),
    Config(AudioFormat),
    Skipped(MalformedMessageError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
    pub audio: u64,
    pub text: u64,
    pub control: u64,
    pub skipped: u64,
}

#[derive(Default)]
struct DispatchCounters {
    audio: AtomicU64,
    text: AtomicU64,
    control: AtomicU64,
    skipped: AtomicU64,
}

pub struct EventDispatcher {
    session_id: String,
    audio: Arc<AudioHandler>,
    machine: Arc<StateMachine>,
    engine: Arc<dyn ConversationalEngine>,
    codec: Arc<dyn Codec>,
    counters: DispatchCounters,
}

impl EventDispatcher {
    pub fn new(
        session_id: impl Into<String>,
        audio: Arc<AudioHandler>,
        machine: Arc<StateMachine>,
        engine: Arc<dyn ConversationalEngine>,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            audio,
            machine,
            engine,
            codec,
            counters: DispatchCounters::default(),
        }
    }

    /// Routes one inbound frame. Never fails: malformed input is logged and
    /// reported as `Dispatched::Skipped`.
    pub async fn dispatch(&self, frame: InboundFrame) -> Dispatched {
        let classified = match classify(&frame) {
            Ok(classified) => classified,
            Err(err) => return self.skip(err),
        };

        match classified {
            Classified::Audio(raw) => {
                let decoded = match self.codec.decode(&raw) {
                    Ok(frame) => frame,
                    Err(err) => {
                        return self.skip(MalformedMessageError::UndecodableAudio {
                            message: err.to_string(),
                        })
                    }
                };
                self.counters.audio.fetch_add(1, Ordering::SeqCst);
                Dispatched::Audio(self.audio.add_input_audio(decoded))
            }
            Classified::Text(text) => {
                self.counters.text.fetch_add(1, Ordering::SeqCst);
                if let Err(err) = self.engine.submit_text(&self.session_id, &text).await {
                    warn!(
                        target: "event_dispatcher",
                        session_id = %self.session_id,
                        error = %format!("{err:#}"),
                        "failed to forward text to engine"
                    );
                    self.machine
                        .report_error(format!("failed to process text message: {err}"));
                }
                Dispatched::Text
            }
            Classified::Interrupt => {
                self.counters.control.fetch_add(1, Ordering::SeqCst);
                let transition = self.machine.barge_in();
                if transition.is_accepted() {
                    if let Err(err) = self.engine.cancel_response(&self.session_id).await {
                        warn!(
                            target: "event_dispatcher",
                            session_id = %self.session_id,
                            error = %format!("{err:#}"),
                            "failed to cancel engine response"
                        );
                    }
                }
                Dispatched::Interrupt(transition)
            }
            Classified::Config(update) => match self.audio.update_format(&update) {
                Ok(format) => {
                    self.counters.control.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        target: "event_dispatcher",
                        session_id = %self.session_id,
                        ?format,
                        "applied client format update"
                    );
                    Dispatched::Config(format)
                }
                Err(err) => self.skip(MalformedMessageError::InvalidConfig {
                    message: err.to_string(),
                }),
            },
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            audio: self.counters.audio.load(Ordering::SeqCst),
            text: self.counters.text.load(Ordering::SeqCst),
            control: self.counters.control.load(Ordering::SeqCst),
            skipped: self.counters.skipped.load(Ordering::SeqCst),
        }
    }

    fn skip(&self, err: MalformedMessageError) -> Dispatched {
        self.counters.skipped.fetch_add(1, Ordering::SeqCst);
        record_malformed_message(&self.session_id, &err);
        Dispatched::Skipped(err)
    }
}
