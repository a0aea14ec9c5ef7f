//! 会话生命周期：状态、断开原因与会话句柄。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{warn, Span};

use crate::audio::{AudioHandler, AudioStats};
use crate::conversation::{ConversationState, StateMachine};
use crate::dispatch::{DispatchStats, Envelope, EventDispatcher};
use crate::error::TransportError;
use crate::pipeline::TransportKind;
use crate::telemetry::events::{duration_to_ms, record_session_lifecycle};

use super::link::SessionLink;

/// 会话在注册表中的阶段。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Active,
    Disconnecting,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Active => "active",
            SessionStatus::Disconnecting => "disconnecting",
            SessionStatus::Closed => "closed",
        }
    }

    pub fn is_terminating(&self) -> bool {
        matches!(self, SessionStatus::Disconnecting | SessionStatus::Closed)
    }
}

/// 触发断开的原因。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    TransportClosed,
    TransportFailed(TransportError),
    TooManyErrors { count: u32 },
    Expired,
    ShuttingDown,
    SetupFailed {
        code: &'static str,
        message: String,
        notify: bool,
    },
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Requested => "requested",
            DisconnectReason::TransportClosed => "transport_closed",
            DisconnectReason::TransportFailed(_) => "transport_failed",
            DisconnectReason::TooManyErrors { .. } => "too_many_errors",
            DisconnectReason::Expired => "expired",
            DisconnectReason::ShuttingDown => "shutting_down",
            DisconnectReason::SetupFailed { .. } => "setup_failed",
        }
    }

    /// Whether the client can still be written to.
    pub(crate) fn transport_open(&self) -> bool {
        match self {
            DisconnectReason::TransportClosed | DisconnectReason::TransportFailed(_) => false,
            DisconnectReason::SetupFailed { notify, .. } => *notify,
            _ => true,
        }
    }

    /// Error event owed to the client before the connection goes away.
    pub(crate) fn client_error(&self) -> Option<Envelope> {
        match self {
            DisconnectReason::TooManyErrors { count } => Some(Envelope::error(
                format!("session closed after {count} engine errors"),
                Some("too_many_errors"),
            )),
            DisconnectReason::Expired => Some(Envelope::error(
                "session exceeded its maximum duration",
                Some("session_expired"),
            )),
            DisconnectReason::SetupFailed {
                code,
                message,
                notify: true,
            } => Some(Envelope::error(message.clone(), Some(code))),
            _ => None,
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            DisconnectReason::TransportFailed(err) => Some(err.to_string()),
            DisconnectReason::SetupFailed { message, .. } => Some(message.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub transport: TransportKind,
    pub status: SessionStatus,
    pub conversation_state: ConversationState,
    pub sequence: u64,
    pub errors: u32,
    pub dropped_notifications: u64,
    pub created_at_ms: u64,
    pub age_ms: u64,
    pub audio: AudioStats,
    pub dispatch: DispatchStats,
}

/// One client connection and the components serving it.
pub struct Session {
    id: String,
    transport_kind: TransportKind,
    created_at: SystemTime,
    started: Instant,
    status: watch::Sender<SessionStatus>,
    audio: Arc<AudioHandler>,
    machine: Arc<StateMachine>,
    dispatcher: Arc<EventDispatcher>,
    link: SessionLink,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    engine_released: AtomicBool,
    transport_closed: AtomicBool,
    span: Span,
}

impl Session {
    pub(crate) fn new(
        id: String,
        transport_kind: TransportKind,
        audio: Arc<AudioHandler>,
        machine: Arc<StateMachine>,
        dispatcher: Arc<EventDispatcher>,
        link: SessionLink,
        span: Span,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::Connecting);
        Self {
            id,
            transport_kind,
            created_at: SystemTime::now(),
            started: Instant::now(),
            status,
            audio,
            machine,
            dispatcher,
            link,
            tasks: Mutex::new(Vec::new()),
            engine_released: AtomicBool::new(false),
            transport_closed: AtomicBool::new(false),
            span,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport_kind
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn audio(&self) -> &Arc<AudioHandler> {
        &self.audio
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.machine
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn info(&self) -> SessionInfo {
        let machine = self.machine.snapshot();
        SessionInfo {
            session_id: self.id.clone(),
            transport: self.transport_kind,
            status: self.status(),
            conversation_state: machine.state,
            sequence: machine.sequence,
            errors: machine.errors,
            dropped_notifications: machine.dropped_notifications,
            created_at_ms: self
                .created_at
                .duration_since(UNIX_EPOCH)
                .map(duration_to_ms)
                .unwrap_or_default(),
            age_ms: duration_to_ms(self.age()),
            audio: self.audio.stats(),
            dispatch: self.dispatcher.stats(),
        }
    }

    /// Sends an event to this session's client. A failure schedules a disconnect.
    pub async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.link.send_event(envelope).await
    }

    pub(crate) fn link(&self) -> &SessionLink {
        &self.link
    }

    pub(crate) fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub(crate) fn attach_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    pub(crate) fn mark_active(&self) -> bool {
        let activated = self.status.send_if_modified(|status| {
            if *status == SessionStatus::Connecting {
                *status = SessionStatus::Active;
                true
            } else {
                false
            }
        });
        if activated {
            self.record(SessionStatus::Active, None);
        }
        activated
    }

    /// Returns `false` when another caller already started the teardown.
    pub(crate) fn begin_disconnect(&self, reason: &DisconnectReason) -> bool {
        let started = self.status.send_if_modified(|status| {
            if status.is_terminating() {
                false
            } else {
                *status = SessionStatus::Disconnecting;
                true
            }
        });
        if started {
            let detail = reason.detail();
            let detail = detail.as_deref().unwrap_or(reason.as_str());
            self.record(SessionStatus::Disconnecting, Some(detail));
        }
        started
    }

    pub(crate) fn mark_closed(&self, detail: Option<&str>) {
        let previous = self.status.send_replace(SessionStatus::Closed);
        if previous != SessionStatus::Closed {
            self.record(SessionStatus::Closed, detail);
        }
    }

    pub(crate) async fn wait_closed(&self, limit: Duration) -> bool {
        let mut status = self.status.subscribe();
        let closed = status.wait_for(|status| *status == SessionStatus::Closed);
        let closed = matches!(timeout(limit, closed).await, Ok(Ok(_)));
        closed
    }

    /// Waits for the session tasks to observe the status change, aborting
    /// any that outlive `limit`.
    pub(crate) async fn join_tasks(&self, limit: Duration) {
        let handles = std::mem::take(&mut *self.tasks.lock());
        for mut handle in handles {
            if timeout(limit, &mut handle).await.is_err() {
                handle.abort();
                warn!(
                    target: "connection_manager",
                    session_id = %self.id,
                    "session task did not stop in time; aborted"
                );
            }
        }
    }

    /// Engine release and transport close run at most once, whichever of
    /// the orderly teardown or a forced close reaches them first.
    pub(crate) fn claim_engine_release(&self) -> bool {
        !self.engine_released.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn claim_transport_close(&self) -> bool {
        !self.transport_closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn abort_tasks(&self) {
        for handle in std::mem::take(&mut *self.tasks.lock()) {
            handle.abort();
        }
    }

    fn record(&self, status: SessionStatus, detail: Option<&str>) {
        record_session_lifecycle(
            &self.id,
            self.transport_kind.as_str(),
            status.as_str(),
            self.age(),
            detail,
        );
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("transport_kind", &self.transport_kind)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
