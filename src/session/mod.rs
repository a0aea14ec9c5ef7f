//! 连接管理：会话注册表、建立与拆除流程、广播、健康检查与统一关停。

mod health;
mod lifecycle;
mod link;
mod tasks;

pub use health::{HealthReport, HealthStatus, ShutdownReport};
pub use lifecycle::{DisconnectReason, Session, SessionInfo, SessionStatus};

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn};

use crate::audio::{AudioHandler, AudioHandlerSettings};
use crate::config::GatewayConfig;
use crate::conversation::{PlaybackControl, StateMachine};
use crate::dispatch::{Envelope, EventDispatcher};
use crate::error::{ConfigurationError, GatewayError};
use crate::pipeline::{CodecRegistry, ConversationalEngine, Outbound, SessionContext, Transport};

use link::{ClientEventForwarder, FaultReporter, SessionFault, SessionLink, TransportAudioSink};
use tasks::{EngineBridge, InboundReader};

struct ManagerInner {
    config: GatewayConfig,
    engine: Arc<dyn ConversationalEngine>,
    codecs: CodecRegistry,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    shutting_down: AtomicBool,
    faults: FaultReporter,
}

/// Owns the session registry and drives every session through
/// connect, activity and teardown. Cheap to clone.
///
/// Must be created inside a Tokio runtime: construction spawns the fault
/// supervisor and, when configured, the expiry reaper.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        config: GatewayConfig,
        engine: Arc<dyn ConversationalEngine>,
    ) -> Result<Self, ConfigurationError> {
        Self::with_codecs(config, engine, CodecRegistry::default())
    }

    pub fn with_codecs(
        config: GatewayConfig,
        engine: Arc<dyn ConversationalEngine>,
        codecs: CodecRegistry,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;

        let (fault_tx, fault_rx) = mpsc::channel(config.session.fault_queue_capacity);
        let cleanup_interval = config.session.cleanup_interval();
        let inner = Arc::new(ManagerInner {
            config,
            engine,
            codecs,
            sessions: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            faults: FaultReporter::new(fault_tx),
        });

        tokio::spawn(supervise_faults(Arc::downgrade(&inner), fault_rx));
        if let Some(period) = cleanup_interval {
            tokio::spawn(reap_periodically(Arc::downgrade(&inner), period));
        }

        Ok(Self { inner })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Registers and activates a session for `transport`.
    ///
    /// Setup failures close the transport; configuration failures first
    /// deliver an `error` event to the client.
    pub async fn connect(
        &self,
        transport: Arc<dyn Transport>,
        session_id: impl Into<String>,
    ) -> Result<Arc<Session>, GatewayError> {
        let session_id = session_id.into();

        let session = match self.register(&session_id, &transport) {
            Ok(session) => session,
            Err(err @ GatewayError::Configuration(_)) => {
                return Err(self.reject(&session_id, transport, err).await)
            }
            Err(err) => {
                warn!(
                    target: "connection_manager",
                    session_id = %session_id,
                    %err,
                    "connection refused"
                );
                return Err(err);
            }
        };

        match self.activate(&session).await {
            Ok(()) => Ok(session),
            Err(err) => {
                warn!(
                    target: "connection_manager",
                    session_id = %session_id,
                    %err,
                    "session setup failed"
                );
                let reason = DisconnectReason::SetupFailed {
                    code: err.code(),
                    message: err.to_string(),
                    notify: matches!(err, GatewayError::Configuration(_)),
                };
                if !self.teardown(&session, reason).await {
                    session
                        .wait_closed(self.inner.config.session.shutdown_timeout())
                        .await;
                }
                Err(err)
            }
        }
    }

    /// Tears a session down. Unknown ids are ignored; a session that is
    /// already closing is waited on instead of being torn down twice.
    pub async fn disconnect(&self, session_id: &str) {
        let Some(session) = self.session(session_id) else {
            debug!(
                target: "connection_manager",
                session_id,
                "disconnect requested for unknown session"
            );
            return;
        };

        if !self.teardown(&session, DisconnectReason::Requested).await {
            let limit = self.inner.config.session.shutdown_timeout();
            if !session.wait_closed(limit).await {
                warn!(
                    target: "connection_manager",
                    session_id,
                    "timed out waiting for an in-flight disconnect"
                );
            }
        }
    }

    /// Sends `message` to one client. Returns `false` when the session is
    /// unknown, not active, or the send failed; a failed send schedules a
    /// disconnect.
    pub async fn send_message(&self, session_id: &str, message: Envelope) -> bool {
        let Some(session) = self.session(session_id) else {
            warn!(
                target: "connection_manager",
                session_id,
                kind = message.kind(),
                "cannot send to unknown session"
            );
            return false;
        };
        if session.status() != SessionStatus::Active {
            debug!(
                target: "connection_manager",
                session_id,
                status = session.status().as_str(),
                "skipping send to inactive session"
            );
            return false;
        }
        session.send(message).await.is_ok()
    }

    /// Sends `message` to every active session except `exclude`, returning
    /// how many deliveries succeeded.
    pub async fn broadcast(&self, message: Envelope, exclude: Option<&str>) -> usize {
        let targets: Vec<Arc<Session>> = self
            .inner
            .sessions
            .read()
            .values()
            .filter(|session| Some(session.id()) != exclude)
            .filter(|session| session.status() == SessionStatus::Active)
            .cloned()
            .collect();

        let mut sends = JoinSet::new();
        for session in targets {
            let message = message.clone();
            sends.spawn(async move { session.send(message).await.is_ok() });
        }

        let mut delivered = 0;
        while let Some(result) = sends.join_next().await {
            match result {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(err) => error!(
                    target: "connection_manager",
                    %err,
                    "broadcast send task failed"
                ),
            }
        }
        debug!(
            target: "connection_manager",
            kind = message.kind(),
            delivered,
            "broadcast finished"
        );
        delivered
    }

    pub fn health_status(&self) -> HealthReport {
        let sessions = self.inner.sessions.read();
        HealthReport {
            status: if self.is_shutting_down() {
                HealthStatus::ShuttingDown
            } else {
                HealthStatus::Healthy
            },
            active_connections: sessions
                .values()
                .filter(|session| session.status() == SessionStatus::Active)
                .count(),
            active_audio_handlers: sessions
                .values()
                .filter(|session| !session.audio().is_closed())
                .count(),
        }
    }

    /// Disconnects every session concurrently and refuses new ones from now
    /// on. Sessions that miss the shutdown timeout are force-closed.
    pub async fn shutdown_all(&self) -> ShutdownReport {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            debug!(target: "connection_manager", "shutdown already in progress");
        }

        let sessions: Vec<Arc<Session>> = self.inner.sessions.read().values().cloned().collect();
        info!(
            target: "connection_manager",
            sessions = sessions.len(),
            "shutting down all sessions"
        );

        let limit = self.inner.config.session.shutdown_timeout();
        let mut closing = JoinSet::new();
        for session in sessions {
            let manager = self.clone();
            closing.spawn(async move {
                let orderly = async {
                    if !manager
                        .teardown(&session, DisconnectReason::ShuttingDown)
                        .await
                    {
                        session.wait_closed(limit).await;
                    }
                };
                let _ = timeout(limit, orderly).await;
                if session.status() == SessionStatus::Closed {
                    (session.id().to_string(), true)
                } else {
                    manager.force_close(&session).await;
                    (session.id().to_string(), false)
                }
            });
        }

        let mut report = ShutdownReport::default();
        while let Some(result) = closing.join_next().await {
            match result {
                Ok((_, true)) => report.closed += 1,
                Ok((session_id, false)) => report.forced.push(session_id),
                Err(err) => error!(
                    target: "connection_manager",
                    %err,
                    "shutdown task failed"
                ),
            }
        }
        report.forced.sort();

        info!(
            target: "connection_manager",
            closed = report.closed,
            forced = report.forced.len(),
            "all sessions shut down"
        );
        report
    }

    /// Disconnects active sessions older than the configured maximum
    /// duration. Returns how many were torn down.
    pub async fn reap_expired(&self) -> usize {
        let max_age = self.inner.config.session.max_session_duration();
        let expired: Vec<Arc<Session>> = self
            .inner
            .sessions
            .read()
            .values()
            .filter(|session| session.status() == SessionStatus::Active)
            .filter(|session| session.age() >= max_age)
            .cloned()
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let mut reaping = JoinSet::new();
        for session in expired {
            let manager = self.clone();
            reaping.spawn(async move { manager.teardown(&session, DisconnectReason::Expired).await });
        }

        let mut reaped = 0;
        while let Some(result) = reaping.join_next().await {
            if matches!(result, Ok(true)) {
                reaped += 1;
            }
        }
        info!(target: "connection_manager", reaped, "expired sessions reaped");
        reaped
    }

    /// Ids of every registered session, sorted.
    pub fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(session_id).cloned()
    }

    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.session(session_id).map(|session| session.info())
    }

    pub fn sessions_info(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.read().values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|session| session.info()).collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    fn register(
        &self,
        session_id: &str,
        transport: &Arc<dyn Transport>,
    ) -> Result<Arc<Session>, GatewayError> {
        let mut sessions = self.inner.sessions.write();
        if self.is_shutting_down() {
            return Err(GatewayError::ShuttingDown);
        }
        if sessions.contains_key(session_id) {
            return Err(GatewayError::DuplicateSession {
                session_id: session_id.to_string(),
            });
        }
        let limit = self.inner.config.session.max_sessions;
        if limit > 0 && sessions.len() >= limit {
            return Err(GatewayError::CapacityExceeded { limit });
        }

        let session = self.build_session(session_id, Arc::clone(transport))?;
        sessions.insert(session_id.to_string(), Arc::clone(&session));
        debug!(
            target: "connection_manager",
            session_id,
            registered = sessions.len(),
            "session registered"
        );
        Ok(session)
    }

    fn build_session(
        &self,
        session_id: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Session>, ConfigurationError> {
        let config = &self.inner.config;
        let kind = transport.kind();
        let profile = config.platforms.for_kind(kind);
        profile.validate(kind)?;

        let codec = self.inner.codecs.for_kind(kind);
        let span = info_span!("session", session_id = %session_id, transport = kind.as_str());
        let link = SessionLink::new(session_id.to_string(), transport, self.inner.faults.clone());

        let audio = AudioHandler::spawn(
            session_id,
            profile.format(),
            AudioHandlerSettings::from_config(profile, &config.session),
            Arc::new(TransportAudioSink::new(link.clone(), Arc::clone(&codec))),
            span.clone(),
        )?;
        let machine = Arc::new(StateMachine::new(
            session_id,
            Arc::clone(&audio) as Arc<dyn PlaybackControl>,
            config.session.notification_capacity,
            span.clone(),
        ));
        let dispatcher = Arc::new(EventDispatcher::new(
            session_id,
            Arc::clone(&audio),
            Arc::clone(&machine),
            Arc::clone(&self.inner.engine),
            codec,
        ));

        let session = Arc::new(Session::new(
            session_id.to_string(),
            kind,
            audio,
            machine,
            dispatcher,
            link,
            span,
        ));
        let forwarder = ClientEventForwarder::new(session.link().clone(), session.watch_status());
        session.state_machine().subscribe(Arc::new(forwarder));
        Ok(session)
    }

    async fn activate(&self, session: &Arc<Session>) -> Result<(), GatewayError> {
        let config = &self.inner.config;
        let engine = &self.inner.engine;
        let transport = Arc::clone(session.link().transport());

        transport.accept().await?;

        let context = SessionContext {
            session_id: session.id().to_string(),
            transport: session.transport_kind(),
            format: session.audio().format(),
            vad: config.vad.clone(),
        };
        let events = engine
            .subscribe(&context)
            .await
            .map_err(|err| ConfigurationError::engine_setup(format!("{err:#}")))?;

        if !session.mark_active() {
            // a concurrent teardown may already have released the engine
            if let Err(err) = engine.release(session.id()).await {
                debug!(
                    target: "connection_manager",
                    session_id = %session.id(),
                    error = %format!("{err:#}"),
                    "failed to release engine for abandoned session"
                );
            }
            return Err(GatewayError::ShuttingDown);
        }
        info!(
            target: "connection_manager",
            session_id = %session.id(),
            transport = session.transport_kind().as_str(),
            "session active"
        );
        let _ = session
            .send(Envelope::Connected {
                session_id: session.id().to_string(),
            })
            .await;

        let span = session.span().clone();
        session.attach_task(
            InboundReader::new(
                session.id().to_string(),
                Arc::clone(&transport),
                Arc::clone(session.dispatcher()),
                self.inner.faults.clone(),
                session.watch_status(),
            )
            .spawn(span.clone()),
        );
        session.attach_task(
            EngineBridge::new(
                session.id().to_string(),
                Arc::clone(session.audio()),
                Arc::clone(session.state_machine()),
                Arc::clone(engine),
                events,
                session.link().clone(),
                session.watch_status(),
                config.session.receive_poll(),
                config.session.max_errors,
            )
            .spawn(span),
        );

        if let Some(greeting) = &config.session.initial_greeting {
            if let Err(err) = engine.submit_text(session.id(), greeting).await {
                warn!(
                    target: "connection_manager",
                    session_id = %session.id(),
                    error = %format!("{err:#}"),
                    "failed to submit initial greeting"
                );
                session
                    .state_machine()
                    .report_error(format!("failed to submit initial greeting: {err}"));
            }
        }
        Ok(())
    }

    /// Refuses a connection whose session could not be built.
    async fn reject(
        &self,
        session_id: &str,
        transport: Arc<dyn Transport>,
        err: GatewayError,
    ) -> GatewayError {
        warn!(
            target: "connection_manager",
            session_id,
            %err,
            "rejecting connection"
        );
        let limit = self.inner.config.session.cleanup_step_timeout();
        let notice = Envelope::error(err.to_string(), Some(err.code()));
        let notify = async {
            transport.accept().await?;
            transport.send(Outbound::Event(notice)).await
        };
        if let Ok(Err(notify_err)) = timeout(limit, notify).await {
            debug!(
                target: "connection_manager",
                session_id,
                err = %notify_err,
                "could not notify rejected client"
            );
        }
        let _ = timeout(limit, transport.close()).await;
        err
    }

    /// Runs the teardown sequence once per session. Returns `false` when
    /// another caller already started it.
    async fn teardown(&self, session: &Arc<Session>, reason: DisconnectReason) -> bool {
        if !session.begin_disconnect(&reason) {
            return false;
        }

        let session_id = session.id().to_string();
        let step_limit = self.inner.config.session.cleanup_step_timeout();
        let transport = Arc::clone(session.link().transport());

        if let Some(notice) = reason.client_error() {
            let transport = Arc::clone(&transport);
            run_step(&session_id, "notify_error", step_limit, async move {
                transport.send(Outbound::Event(notice)).await
            })
            .await;
        }

        let audio = Arc::clone(session.audio());
        match tokio::spawn(async move { audio.shutdown().await }).await {
            Ok(outcome) => debug!(
                target: "connection_manager",
                session_id = %session_id,
                ?outcome,
                "audio handler shut down"
            ),
            Err(err) => error!(
                target: "connection_manager",
                session_id = %session_id,
                %err,
                "audio shutdown panicked"
            ),
        }

        session.state_machine().shutdown();

        self.release_engine(session, step_limit).await;

        if reason.transport_open() {
            let transport = Arc::clone(&transport);
            let notice = Envelope::Disconnected {
                session_id: session_id.clone(),
                reason: reason.as_str().to_string(),
            };
            run_step(&session_id, "notify_disconnect", step_limit, async move {
                transport.send(Outbound::Event(notice)).await
            })
            .await;
        }
        self.close_transport(session, step_limit).await;

        session.join_tasks(step_limit).await;
        session.mark_closed(None);
        self.remove(session);
        info!(
            target: "connection_manager",
            session_id = %session_id,
            reason = reason.as_str(),
            "session disconnected"
        );
        true
    }

    /// Closes a session whose orderly teardown overran the shutdown timeout.
    /// Cleanup steps the teardown never reached still run, each bounded.
    async fn force_close(&self, session: &Arc<Session>) {
        warn!(
            target: "connection_manager",
            session_id = %session.id(),
            "session did not close before the shutdown timeout; forcing"
        );
        session.state_machine().shutdown();
        session.abort_tasks();

        let audio = Arc::clone(session.audio());
        tokio::spawn(async move {
            audio.shutdown().await;
        });

        let step_limit = self.inner.config.session.cleanup_step_timeout();
        self.release_engine(session, step_limit).await;
        self.close_transport(session, step_limit).await;

        session.mark_closed(Some("forced"));
        self.remove(session);
    }

    async fn release_engine(&self, session: &Session, limit: Duration) {
        if !session.claim_engine_release() {
            return;
        }
        let engine = Arc::clone(&self.inner.engine);
        let session_id = session.id().to_string();
        run_step(session.id(), "release_engine", limit, async move {
            engine.release(&session_id).await
        })
        .await;
    }

    async fn close_transport(&self, session: &Session, limit: Duration) {
        if !session.claim_transport_close() {
            return;
        }
        let transport = Arc::clone(session.link().transport());
        run_step(session.id(), "close_transport", limit, async move {
            transport.close().await
        })
        .await;
    }

    fn remove(&self, session: &Arc<Session>) {
        let mut sessions = self.inner.sessions.write();
        let current = sessions
            .get(session.id())
            .is_some_and(|registered| Arc::ptr_eq(registered, session));
        if current {
            sessions.remove(session.id());
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("sessions", &self.session_count())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

/// Runs one cleanup step on its own task so a failure, panic or hang in an
/// adapter cannot stop the rest of the teardown.
async fn run_step<F, E>(session_id: &str, step: &'static str, limit: Duration, work: F)
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let mut task = tokio::spawn(work);
    match timeout(limit, &mut task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => warn!(
            target: "connection_manager",
            session_id,
            step,
            %err,
            "cleanup step failed"
        ),
        Ok(Err(err)) => error!(
            target: "connection_manager",
            session_id,
            step,
            %err,
            "cleanup step panicked"
        ),
        Err(_) => {
            task.abort();
            warn!(
                target: "connection_manager",
                session_id,
                step,
                timeout_ms = limit.as_millis() as u64,
                "cleanup step timed out"
            );
        }
    }
}

async fn supervise_faults(inner: Weak<ManagerInner>, mut faults: mpsc::Receiver<SessionFault>) {
    while let Some(fault) = faults.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let manager = ConnectionManager { inner };
        let Some(session) = manager.session(&fault.session_id) else {
            continue;
        };
        tokio::spawn(async move {
            manager.teardown(&session, fault.reason).await;
        });
    }
}

async fn reap_periodically(inner: Weak<ManagerInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let manager = ConnectionManager { inner };
        if manager.is_shutting_down() {
            break;
        }
        manager.reap_expired().await;
    }
}
