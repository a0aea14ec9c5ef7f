//! Test doubles for the capability traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use crate::audio::AudioSink;
use crate::conversation::{ConversationObserver, ConversationState, PlaybackControl, StateChange};
use crate::dispatch::Envelope;
use crate::error::TransportError;
use crate::pipeline::{
    AudioFrame, ConversationalEngine, EngineEvent, EngineEvents, InboundFrame, Outbound,
    SessionContext, Transport, TransportKind,
};

/// Polls `condition` until it holds, failing the test after one second.
pub(crate) async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within 1s");
}

#[derive(Default)]
pub(crate) struct RecordingPlayback {
    cancelled: AtomicUsize,
    resumed: AtomicUsize,
}

impl RecordingPlayback {
    pub(crate) fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn resumed(&self) -> usize {
        self.resumed.load(Ordering::SeqCst)
    }
}

impl PlaybackControl for RecordingPlayback {
    fn cancel_playback(&self) -> usize {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        0
    }

    fn resume_playback(&self) {
        self.resumed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ObserverCall {
    StateChange(ConversationState, ConversationState),
    SpeechStarted,
    SpeechEnded,
    ResponseStarted,
    ResponseEnded,
    Error(String),
}

pub(crate) struct RecordingObserver {
    calls: mpsc::UnboundedSender<ObserverCall>,
}

impl RecordingObserver {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ObserverCall>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { calls }), rx)
    }

    fn record(&self, call: ObserverCall) -> Result<()> {
        self.calls
            .send(call)
            .map_err(|_| anyhow!("observer receiver dropped"))
    }
}

#[async_trait]
impl ConversationObserver for RecordingObserver {
    async fn on_state_change(&self, change: &StateChange) -> Result<()> {
        self.record(ObserverCall::StateChange(change.from, change.to))
    }

    async fn on_speech_started(&self) -> Result<()> {
        self.record(ObserverCall::SpeechStarted)
    }

    async fn on_speech_ended(&self) -> Result<()> {
        self.record(ObserverCall::SpeechEnded)
    }

    async fn on_response_started(&self) -> Result<()> {
        self.record(ObserverCall::ResponseStarted)
    }

    async fn on_response_ended(&self) -> Result<()> {
        self.record(ObserverCall::ResponseEnded)
    }

    async fn on_error(&self, message: &str) -> Result<()> {
        self.record(ObserverCall::Error(message.to_string()))
    }
}

pub(crate) struct PanickingObserver;

#[async_trait]
impl ConversationObserver for PanickingObserver {
    async fn on_state_change(&self, _change: &StateChange) -> Result<()> {
        panic!("observer bug");
    }

    async fn on_error(&self, _message: &str) -> Result<()> {
        panic!("observer bug");
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    frames: Mutex<Vec<AudioFrame>>,
    fail: bool,
}

impl RecordingSink {
    pub(crate) fn failing() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub(crate) fn frames(&self) -> Vec<AudioFrame> {
        self.frames.lock().expect("sink poisoned").clone()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn deliver(&self, frame: AudioFrame) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::send("socket reset"));
        }
        self.frames.lock().expect("sink poisoned").push(frame);
        Ok(())
    }
}

/// Holds every delivery until `open` is called.
#[derive(Default)]
pub(crate) struct GatedSink {
    open: AtomicBool,
    gate: Notify,
    pending: AtomicUsize,
}

impl GatedSink {
    pub(crate) async fn wait_for_pending(&self) {
        wait_until(|| self.pending.load(Ordering::SeqCst) > 0).await;
    }

    pub(crate) fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.gate.notify_waiters();
    }
}

#[async_trait]
impl AudioSink for GatedSink {
    async fn deliver(&self, _frame: AudioFrame) -> Result<(), TransportError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        loop {
            let opened = self.gate.notified();
            if self.open.load(Ordering::SeqCst) {
                return Ok(());
            }
            opened.await;
        }
    }
}

pub(crate) struct MockTransport {
    kind: TransportKind,
    inbound_tx: mpsc::UnboundedSender<InboundFrame>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundFrame>>,
    sent: Mutex<Vec<Outbound>>,
    fail_accept: AtomicBool,
    fail_send: AtomicBool,
    hang_send: AtomicBool,
    accepted: AtomicUsize,
    closed: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new(kind: TransportKind) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            kind,
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            sent: Mutex::new(Vec::new()),
            fail_accept: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            hang_send: AtomicBool::new(false),
            accepted: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        })
    }

    pub(crate) fn push(&self, frame: InboundFrame) {
        let _ = self.inbound_tx.send(frame);
    }

    pub(crate) fn push_text(&self, raw: &str) {
        self.push(InboundFrame::Text(raw.to_string()));
    }

    pub(crate) fn push_audio(&self, raw: &'static [u8]) {
        self.push(InboundFrame::Binary(Bytes::from_static(raw)));
    }

    pub(crate) fn hang_up(&self) {
        self.push(InboundFrame::Closed);
    }

    pub(crate) fn fail_accepts(&self) {
        self.fail_accept.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_sends(&self) {
        self.fail_send.store(true, Ordering::SeqCst);
    }

    /// Every later send blocks forever.
    pub(crate) fn hang_sends(&self) {
        self.hang_send.store(true, Ordering::SeqCst);
    }

    pub(crate) fn accept_count(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn events(&self) -> Vec<Envelope> {
        self.sent
            .lock()
            .expect("transport poisoned")
            .iter()
            .filter_map(|payload| match payload {
                Outbound::Event(envelope) => Some(envelope.clone()),
                Outbound::Audio(_) => None,
            })
            .collect()
    }

    pub(crate) fn audio(&self) -> Vec<Bytes> {
        self.sent
            .lock()
            .expect("transport poisoned")
            .iter()
            .filter_map(|payload| match payload {
                Outbound::Audio(raw) => Some(raw.clone()),
                Outbound::Event(_) => None,
            })
            .collect()
    }

    pub(crate) fn has_event(&self, predicate: impl Fn(&Envelope) -> bool) -> bool {
        self.events().iter().any(predicate)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn accept(&self) -> Result<(), TransportError> {
        if self.fail_accept.load(Ordering::SeqCst) {
            return Err(TransportError::accept("handshake rejected"));
        }
        self.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn receive(&self) -> Result<InboundFrame, TransportError> {
        let mut inbound = self.inbound_rx.lock().await;
        Ok(inbound.recv().await.unwrap_or(InboundFrame::Closed))
    }

    async fn send(&self, payload: Outbound) -> Result<(), TransportError> {
        if self.hang_send.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(TransportError::send("broken pipe"));
        }
        self.sent.lock().expect("transport poisoned").push(payload);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        let _ = self.inbound_tx.send(InboundFrame::Closed);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct ScriptedEngine {
    streams: Mutex<HashMap<String, mpsc::Sender<EngineEvent>>>,
    contexts: Mutex<Vec<SessionContext>>,
    submitted: Mutex<Vec<(String, AudioFrame)>>,
    texts: Mutex<Vec<(String, String)>>,
    cancelled: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
    fail_subscribe: AtomicBool,
    fail_text: AtomicBool,
}

impl ScriptedEngine {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_subscriptions(&self) {
        self.fail_subscribe.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_text(&self) {
        self.fail_text.store(true, Ordering::SeqCst);
    }

    pub(crate) async fn emit(&self, session_id: &str, event: EngineEvent) {
        let stream = self
            .streams
            .lock()
            .expect("engine poisoned")
            .get(session_id)
            .cloned()
            .expect("session subscribed");
        stream.send(event).await.expect("engine stream open");
    }

    pub(crate) fn contexts(&self) -> Vec<SessionContext> {
        self.contexts.lock().expect("engine poisoned").clone()
    }

    pub(crate) fn submitted(&self, session_id: &str) -> Vec<AudioFrame> {
        self.submitted
            .lock()
            .expect("engine poisoned")
            .iter()
            .filter(|(id, _)| id == session_id)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    pub(crate) fn texts(&self) -> Vec<(String, String)> {
        self.texts.lock().expect("engine poisoned").clone()
    }

    pub(crate) fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().expect("engine poisoned").clone()
    }

    pub(crate) fn released(&self) -> Vec<String> {
        self.released.lock().expect("engine poisoned").clone()
    }
}

#[async_trait]
impl ConversationalEngine for ScriptedEngine {
    async fn subscribe(&self, context: &SessionContext) -> Result<EngineEvents> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(anyhow!("missing credential ENGINE_API_KEY"));
        }
        let (tx, rx) = mpsc::channel(32);
        self.streams
            .lock()
            .expect("engine poisoned")
            .insert(context.session_id.clone(), tx);
        self.contexts
            .lock()
            .expect("engine poisoned")
            .push(context.clone());
        Ok(rx)
    }

    async fn submit(&self, session_id: &str, frame: AudioFrame) -> Result<()> {
        self.submitted
            .lock()
            .expect("engine poisoned")
            .push((session_id.to_string(), frame));
        Ok(())
    }

    async fn submit_text(&self, session_id: &str, text: &str) -> Result<()> {
        if self.fail_text.load(Ordering::SeqCst) {
            return Err(anyhow!("engine rejected text"));
        }
        self.texts
            .lock()
            .expect("engine poisoned")
            .push((session_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn cancel_response(&self, session_id: &str) -> Result<()> {
        self.cancelled
            .lock()
            .expect("engine poisoned")
            .push(session_id.to_string());
        Ok(())
    }

    async fn release(&self, session_id: &str) -> Result<()> {
        self.streams.lock().expect("engine poisoned").remove(session_id);
        self.released
            .lock()
            .expect("engine poisoned")
            .push(session_id.to_string());
        Ok(())
    }
}
