use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument, Span};

use crate::error::TransportError;

use super::queue::{FrameQueue, Received};
use super::AudioSink;

/// How the drain task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainExit {
    /// Output queue closed and emptied.
    Completed { delivered: u64 },
    /// The sink refused a frame; the output queue was closed behind it.
    SinkFailed {
        delivered: u64,
        error: TransportError,
    },
}

/// Single consumer of a session's output queue.
pub(crate) struct DrainWorker {
    session_id: String,
    output: Arc<FrameQueue>,
    sink: Arc<dyn AudioSink>,
    poll_interval: Duration,
}

impl DrainWorker {
    pub(crate) fn new(
        session_id: String,
        output: Arc<FrameQueue>,
        sink: Arc<dyn AudioSink>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            session_id,
            output,
            sink,
            poll_interval,
        }
    }

    pub(crate) fn spawn(self, span: Span) -> JoinHandle<DrainExit> {
        tokio::spawn(self.run().instrument(span))
    }

    async fn run(self) -> DrainExit {
        let mut delivered: u64 = 0;

        loop {
            match self.output.pop(self.poll_interval).await {
                Received::Frame(frame) => {
                    if let Err(error) = self.sink.deliver(frame).await {
                        warn!(
                            target: "audio_handler",
                            session_id = %self.session_id,
                            %error,
                            delivered,
                            "failed to deliver output audio; stopping drain"
                        );
                        self.output.close();
                        return DrainExit::SinkFailed { delivered, error };
                    }
                    delivered += 1;
                }
                Received::TimedOut => continue,
                Received::Closed => {
                    debug!(
                        target: "audio_handler",
                        session_id = %self.session_id,
                        delivered,
                        "output queue closed; drain finished"
                    );
                    return DrainExit::Completed { delivered };
                }
            }
        }
    }
}
