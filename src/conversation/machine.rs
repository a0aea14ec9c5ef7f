use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn, Span};

use crate::telemetry::events::{record_transition, record_transition_rejected};

use super::observer::{
    spawn_notifier, ConversationObserver, Notification, ObserverRegistry, SubscriptionId,
};
use super::state::{
    is_barge_in, next_state, ConversationEvent, ConversationState, StateChange, Transition,
};

/// Playback side of a barge-in, implemented by the session's audio handler.
pub trait PlaybackControl: Send + Sync {
    /// Drops buffered audio and refuses new output until resumed.
    /// Returns the number of frames removed.
    fn cancel_playback(&self) -> usize;

    fn resume_playback(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineSnapshot {
    pub state: ConversationState,
    pub sequence: u64,
    pub errors: u32,
    /// Observer notifications lost to a full queue.
    pub dropped_notifications: u64,
}

struct MachineCore {
    state: ConversationState,
    sequence: u64,
    errors: u32,
}

/// Per-session conversational state.
///
/// Transitions are serialized under one lock and observers are notified from
/// a separate task after the commit.
pub struct StateMachine {
    session_id: String,
    core: Mutex<MachineCore>,
    playback: Arc<dyn PlaybackControl>,
    observers: Arc<ObserverRegistry>,
    notifications: mpsc::Sender<Notification>,
    dropped_notifications: AtomicU64,
}

impl StateMachine {
    pub fn new(
        session_id: impl Into<String>,
        playback: Arc<dyn PlaybackControl>,
        notification_capacity: usize,
        span: Span,
    ) -> Self {
        let session_id = session_id.into();
        let observers = Arc::new(ObserverRegistry::default());
        let (notifications, rx) = mpsc::channel(notification_capacity.max(1));
        spawn_notifier(session_id.clone(), rx, Arc::clone(&observers), span);

        Self {
            session_id,
            core: Mutex::new(MachineCore {
                state: ConversationState::Idle,
                sequence: 0,
                errors: 0,
            }),
            playback,
            observers,
            notifications,
            dropped_notifications: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ConversationState {
        self.core.lock().state
    }

    pub fn sequence(&self) -> u64 {
        self.core.lock().sequence
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        let core = self.core.lock();
        MachineSnapshot {
            state: core.state,
            sequence: core.sequence,
            errors: core.errors,
            dropped_notifications: self.dropped_notifications.load(Ordering::Relaxed),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn ConversationObserver>) -> SubscriptionId {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn apply(&self, event: ConversationEvent) -> Transition {
        self.commit(event, None)
    }

    /// Explicit interruption request. Only valid while a response is playing.
    pub fn barge_in(&self) -> Transition {
        let transition = self.commit(
            ConversationEvent::SpeechStarted,
            Some(ConversationState::Responding),
        );
        if let Transition::Rejected { state, .. } = transition {
            warn!(
                target: "state_machine",
                session_id = %self.session_id,
                state = state.as_str(),
                "no active response to interrupt"
            );
        }
        transition
    }

    pub fn shutdown(&self) -> Transition {
        self.commit(ConversationEvent::Shutdown, None)
    }

    /// Records an engine or pipeline error and notifies observers.
    /// Returns the session's running error count.
    pub fn report_error(&self, message: impl Into<String>) -> u32 {
        let errors = {
            let mut core = self.core.lock();
            core.errors = core.errors.saturating_add(1);
            core.errors
        };
        self.notify(Notification::Error(message.into()));
        errors
    }

    fn commit(
        &self,
        event: ConversationEvent,
        required: Option<ConversationState>,
    ) -> Transition {
        let transition = {
            let mut core = self.core.lock();
            let from = core.state;
            let target = match required {
                Some(required) if required != from => None,
                _ => next_state(from, event),
            };

            match target {
                None => Transition::Rejected { state: from, event },
                Some(to) => {
                    if is_barge_in(from, event) {
                        let cleared = self.playback.cancel_playback();
                        debug!(
                            target: "state_machine",
                            session_id = %self.session_id,
                            cleared,
                            "barge-in cancelled playback"
                        );
                    } else if from == ConversationState::Interrupted {
                        self.playback.resume_playback();
                    }

                    core.state = to;
                    core.sequence += 1;
                    Transition::Accepted(StateChange {
                        from,
                        to,
                        event,
                        sequence: core.sequence,
                    })
                }
            }
        };

        match transition {
            Transition::Accepted(change) => {
                record_transition(
                    &self.session_id,
                    change.from.as_str(),
                    change.to.as_str(),
                    change.event.as_str(),
                    change.sequence,
                );
                self.notify(Notification::Transition(change));
            }
            Transition::Rejected { state, event } => {
                record_transition_rejected(
                    &self.session_id,
                    state.as_str(),
                    event.as_str(),
                    self.sequence(),
                );
            }
        }

        transition
    }

    fn notify(&self, notification: Notification) {
        match self.notifications.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                let total = self.dropped_notifications.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    target: "state_machine",
                    session_id = %self.session_id,
                    ?dropped,
                    total,
                    "observer queue full; dropping notification"
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    target: "state_machine",
                    session_id = %self.session_id,
                    "observer task stopped; notification discarded"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::{RecordingObserver, RecordingPlayback, ObserverCall};
    use std::time::Duration;
    use tokio::time::timeout;

    fn machine() -> (StateMachine, Arc<RecordingPlayback>) {
        machine_with_capacity(16)
    }

    fn machine_with_capacity(capacity: usize) -> (StateMachine, Arc<RecordingPlayback>) {
        let playback = Arc::new(RecordingPlayback::default());
        let machine = StateMachine::new(
            "call-1",
            Arc::clone(&playback) as Arc<dyn PlaybackControl>,
            capacity,
            Span::none(),
        );
        (machine, playback)
    }

    #[tokio::test]
    async fn happy_path_increments_sequence_on_each_transition() {
        let (machine, _) = machine();
        assert_eq!(machine.state(), ConversationState::Idle);

        for event in [
            ConversationEvent::SpeechStarted,
            ConversationEvent::ResponseStarted,
            ConversationEvent::ResponseEnded,
        ] {
            assert!(machine.apply(event).is_accepted());
        }

        assert_eq!(machine.state(), ConversationState::Idle);
        assert_eq!(machine.sequence(), 3);
    }

    #[tokio::test]
    async fn invalid_event_leaves_state_and_sequence_untouched() {
        let (machine, _) = machine();
        machine.apply(ConversationEvent::SpeechStarted);

        let transition = machine.apply(ConversationEvent::ResponseEnded);
        assert_eq!(
            transition,
            Transition::Rejected {
                state: ConversationState::Listening,
                event: ConversationEvent::ResponseEnded,
            }
        );
        assert_eq!(machine.state(), ConversationState::Listening);
        assert_eq!(machine.sequence(), 1);
    }

    #[tokio::test]
    async fn barge_in_cancels_playback_before_commit() {
        let (machine, playback) = machine();
        machine.apply(ConversationEvent::SpeechStarted);
        machine.apply(ConversationEvent::ResponseStarted);

        let transition = machine.apply(ConversationEvent::SpeechStarted);
        let change = transition.change().copied().expect("barge-in accepted");
        assert!(change.is_barge_in());
        assert_eq!(change.to, ConversationState::Interrupted);
        assert_eq!(playback.cancelled(), 1);
        assert_eq!(playback.resumed(), 0);

        assert!(machine.apply(ConversationEvent::SpeechEnded).is_accepted());
        assert_eq!(machine.state(), ConversationState::Idle);
        assert_eq!(playback.resumed(), 1);
    }

    #[tokio::test]
    async fn explicit_barge_in_requires_active_response() {
        let (machine, playback) = machine();
        let transition = machine.barge_in();
        assert!(!transition.is_accepted());
        assert_eq!(machine.state(), ConversationState::Idle);
        assert_eq!(machine.sequence(), 0);
        assert_eq!(playback.cancelled(), 0);

        machine.apply(ConversationEvent::SpeechStarted);
        machine.apply(ConversationEvent::ResponseStarted);
        assert!(machine.barge_in().is_accepted());
        assert_eq!(machine.state(), ConversationState::Interrupted);
    }

    #[tokio::test]
    async fn closed_rejects_everything() {
        let (machine, _) = machine();
        assert!(machine.shutdown().is_accepted());
        assert!(!machine.shutdown().is_accepted());
        assert!(!machine.apply(ConversationEvent::SpeechStarted).is_accepted());
        assert_eq!(machine.state(), ConversationState::Closed);
        assert_eq!(machine.sequence(), 1);
    }

    #[tokio::test]
    async fn observers_receive_changes_in_order() {
        let (machine, _) = machine();
        let (observer, mut calls) = RecordingObserver::new();
        machine.subscribe(observer);

        machine.apply(ConversationEvent::SpeechStarted);
        machine.apply(ConversationEvent::ResponseStarted);

        let mut received = Vec::new();
        for _ in 0..4 {
            let call = timeout(Duration::from_millis(600), calls.recv())
                .await
                .expect("observer call")
                .expect("observer channel open");
            received.push(call);
        }

        assert_eq!(
            received,
            vec![
                ObserverCall::StateChange(ConversationState::Idle, ConversationState::Listening),
                ObserverCall::SpeechStarted,
                ObserverCall::StateChange(
                    ConversationState::Listening,
                    ConversationState::Responding
                ),
                ObserverCall::ResponseStarted,
            ]
        );
    }

    #[tokio::test]
    async fn failing_observer_does_not_block_others() {
        let (machine, _) = machine();
        machine.subscribe(Arc::new(crate::support::PanickingObserver));
        let (observer, mut calls) = RecordingObserver::new();
        let token = machine.subscribe(observer);

        machine.report_error("engine unavailable");

        let call = timeout(Duration::from_millis(600), calls.recv())
            .await
            .expect("observer call")
            .expect("observer channel open");
        assert_eq!(call, ObserverCall::Error("engine unavailable".into()));
        assert_eq!(machine.snapshot().errors, 1);

        assert!(machine.unsubscribe(token));
        assert!(!machine.unsubscribe(token));
        assert_eq!(machine.observer_count(), 1);
    }

    #[tokio::test]
    async fn full_observer_queue_counts_lost_notifications() {
        let (machine, _) = machine_with_capacity(1);

        // the notifier cannot run until this test yields
        machine.apply(ConversationEvent::SpeechStarted);
        machine.apply(ConversationEvent::ResponseStarted);
        machine.report_error("engine unavailable");

        let snapshot = machine.snapshot();
        assert_eq!(snapshot.sequence, 2);
        assert_eq!(snapshot.dropped_notifications, 2);
    }
}
