//! 会话级双向音频缓冲：有界输入/输出队列与输出排空任务。

mod drain;
mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Span};

use crate::config::{PlatformProfile, SessionConfig};
use crate::conversation::{ConversationEvent, PlaybackControl, StateMachine, Transition};
use crate::error::{ConfigurationError, FrameRejection, TransportError};
use crate::pipeline::{AudioFormat, AudioFrame, FormatUpdate};
use crate::telemetry::events::{record_frames_cleared, record_queue_saturation};

pub use drain::DrainExit;
pub use queue::{QueueKind, QueueStats, Received};

use drain::DrainWorker;
use queue::FrameQueue;

/// Where drained output audio goes.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn deliver(&self, frame: AudioFrame) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioHandlerSettings {
    pub input_capacity: usize,
    pub output_capacity: usize,
    pub drain_poll: Duration,
    pub shutdown_timeout: Duration,
}

impl AudioHandlerSettings {
    pub fn from_config(profile: &PlatformProfile, session: &SessionConfig) -> Self {
        Self {
            input_capacity: profile.input_queue_capacity,
            output_capacity: profile.output_queue_capacity,
            drain_poll: session.drain_poll(),
            shutdown_timeout: session.audio_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClearedFrames {
    pub input: usize,
    pub output: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Drained(DrainExit),
    /// The drain task was still busy at the deadline; pending output was discarded.
    TimedOut { discarded: usize },
    DrainFailed { message: String },
    AlreadyClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStats {
    pub format: AudioFormat,
    pub input: QueueStats,
    pub output: QueueStats,
    pub playback_held: bool,
    pub closed: bool,
}

/// Bounded input/output audio queues of one session plus the task draining
/// the output queue into an `AudioSink`.
pub struct AudioHandler {
    session_id: String,
    input: Arc<FrameQueue>,
    output: Arc<FrameQueue>,
    format: Mutex<AudioFormat>,
    shutdown_timeout: Duration,
    closed: AtomicBool,
    shutdown_gate: tokio::sync::Mutex<()>,
    drain: Mutex<Option<JoinHandle<DrainExit>>>,
}

impl AudioHandler {
    pub fn spawn(
        session_id: impl Into<String>,
        format: AudioFormat,
        settings: AudioHandlerSettings,
        sink: Arc<dyn AudioSink>,
        span: Span,
    ) -> Result<Arc<Self>, ConfigurationError> {
        if settings.input_capacity == 0 || settings.output_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "queue_capacity",
                "must be greater than zero",
            ));
        }
        format.validate()?;

        let session_id = session_id.into();
        let input = Arc::new(FrameQueue::new(QueueKind::Input, settings.input_capacity));
        let output = Arc::new(FrameQueue::new(QueueKind::Output, settings.output_capacity));
        let drain = DrainWorker::new(
            session_id.clone(),
            Arc::clone(&output),
            sink,
            settings.drain_poll,
        )
        .spawn(span);

        Ok(Arc::new(Self {
            session_id,
            input,
            output,
            format: Mutex::new(format),
            shutdown_timeout: settings.shutdown_timeout,
            closed: AtomicBool::new(false),
            shutdown_gate: tokio::sync::Mutex::new(()),
            drain: Mutex::new(Some(drain)),
        }))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queues response audio for playback. Drops the frame if the queue is full.
    pub fn send_audio(&self, frame: AudioFrame) -> Result<(), FrameRejection> {
        self.enqueue(&self.output, frame)
    }

    /// Queues caller audio for the engine. Drops the frame if the queue is full.
    pub fn add_input_audio(&self, frame: AudioFrame) -> Result<(), FrameRejection> {
        self.enqueue(&self.input, frame)
    }

    pub async fn receive_audio(&self, wait: Duration) -> Received {
        self.input.pop(wait).await
    }

    pub fn clear_audio_buffer(&self) -> ClearedFrames {
        let cleared = ClearedFrames {
            input: self.input.clear(),
            output: self.output.clear(),
        };
        record_frames_cleared(&self.session_id, "clear", cleared.input, cleared.output);
        cleared
    }

    /// Cancels in-flight playback and forwards the speech event to `machine`.
    pub fn handle_speech_started(&self, machine: &StateMachine) -> Transition {
        let output = self.output.clear();
        if output > 0 {
            record_frames_cleared(&self.session_id, "speech_started", 0, output);
        }
        machine.apply(ConversationEvent::SpeechStarted)
    }

    pub fn format(&self) -> AudioFormat {
        *self.format.lock()
    }

    pub fn update_format(&self, update: &FormatUpdate) -> Result<AudioFormat, ConfigurationError> {
        let mut format = self.format.lock();
        let merged = format.merged(update)?;
        if merged != *format {
            info!(
                target: "audio_handler",
                session_id = %self.session_id,
                codec = merged.codec.as_str(),
                sample_rate_hz = merged.sample_rate_hz,
                channels = merged.channels,
                "audio format updated"
            );
        }
        *format = merged;
        Ok(merged)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> AudioStats {
        AudioStats {
            format: self.format(),
            input: self.input.stats(),
            output: self.output.stats(),
            playback_held: self.output.is_held(),
            closed: self.is_closed(),
        }
    }

    /// Closes both queues and waits for the drain task to flush, bounded by
    /// the configured timeout. Later calls return `AlreadyClosed`.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        let _serial = self.shutdown_gate.lock().await;
        if self.is_closed() {
            return ShutdownOutcome::AlreadyClosed;
        }

        self.input.close();
        self.output.close();

        let handle = self.drain.lock().take();
        let outcome = match handle {
            None => ShutdownOutcome::Drained(DrainExit::Completed { delivered: 0 }),
            Some(handle) => match timeout(self.shutdown_timeout, handle).await {
                Ok(Ok(exit)) => ShutdownOutcome::Drained(exit),
                Ok(Err(err)) => {
                    error!(
                        target: "audio_handler",
                        session_id = %self.session_id,
                        %err,
                        "drain task failed"
                    );
                    ShutdownOutcome::DrainFailed {
                        message: err.to_string(),
                    }
                }
                Err(_) => {
                    let discarded = self.output.clear();
                    warn!(
                        target: "audio_handler",
                        session_id = %self.session_id,
                        discarded,
                        timeout_ms = self.shutdown_timeout.as_millis() as u64,
                        "drain did not finish before timeout; discarding pending output"
                    );
                    ShutdownOutcome::TimedOut { discarded }
                }
            },
        };

        self.closed.store(true, Ordering::SeqCst);
        debug!(
            target: "audio_handler",
            session_id = %self.session_id,
            ?outcome,
            "audio handler closed"
        );
        outcome
    }

    fn enqueue(&self, queue: &FrameQueue, frame: AudioFrame) -> Result<(), FrameRejection> {
        if queue.is_closed() {
            return Err(FrameRejection::Closed {
                queue: queue.kind(),
            });
        }
        if frame.is_empty() {
            warn!(
                target: "audio_handler",
                session_id = %self.session_id,
                queue = queue.kind().as_str(),
                "received empty audio frame"
            );
            return Ok(());
        }

        match queue.push(frame) {
            Ok(()) => Ok(()),
            Err(rejection) => {
                match &rejection {
                    FrameRejection::Saturated { .. } => record_queue_saturation(
                        &self.session_id,
                        queue.kind(),
                        queue.capacity(),
                        queue.stats().dropped,
                    ),
                    FrameRejection::Held { .. } => debug!(
                        target: "audio_handler",
                        session_id = %self.session_id,
                        "dropping output frame while playback is held"
                    ),
                    FrameRejection::Closed { .. } => debug!(
                        target: "audio_handler",
                        session_id = %self.session_id,
                        queue = queue.kind().as_str(),
                        "dropping frame for closed queue"
                    ),
                }
                Err(rejection)
            }
        }
    }
}

impl PlaybackControl for AudioHandler {
    fn cancel_playback(&self) -> usize {
        let output = self.output.hold_and_clear();
        let input = self.input.clear();
        record_frames_cleared(&self.session_id, "barge_in", input, output);
        input + output
    }

    fn resume_playback(&self) {
        if self.output.release() {
            debug!(
                target: "audio_handler",
                session_id = %self.session_id,
                "playback resumed"
            );
        }
    }
}

impl Drop for AudioHandler {
    fn drop(&mut self) {
        self.input.close();
        self.output.close();
    }
}
