use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use crate::error::CallbackError;
use crate::telemetry::events::record_callback_failure;

use super::state::{ConversationEvent, StateChange};

/// Receives conversation updates after they are committed.
///
/// Every callback runs on its own task: an error or a panic is logged and
/// never reaches the state machine or other observers.
#[async_trait]
pub trait ConversationObserver: Send + Sync {
    async fn on_state_change(&self, _change: &StateChange) -> Result<()> {
        Ok(())
    }

    async fn on_speech_started(&self) -> Result<()> {
        Ok(())
    }

    async fn on_speech_ended(&self) -> Result<()> {
        Ok(())
    }

    async fn on_response_started(&self) -> Result<()> {
        Ok(())
    }

    async fn on_response_ended(&self) -> Result<()> {
        Ok(())
    }

    async fn on_error(&self, _message: &str) -> Result<()> {
        Ok(())
    }
}

/// Token returned by `StateMachine::subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Notification {
    Transition(StateChange),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Callback {
    StateChange,
    SpeechStarted,
    SpeechEnded,
    ResponseStarted,
    ResponseEnded,
    Error,
}

impl Callback {
    fn as_str(&self) -> &'static str {
        match self {
            Callback::StateChange => "on_state_change",
            Callback::SpeechStarted => "on_speech_started",
            Callback::SpeechEnded => "on_speech_ended",
            Callback::ResponseStarted => "on_response_started",
            Callback::ResponseEnded => "on_response_ended",
            Callback::Error => "on_error",
        }
    }

    fn for_notification(notification: &Notification) -> Vec<Callback> {
        match notification {
            Notification::Transition(change) => {
                let specific = match change.event {
                    ConversationEvent::SpeechStarted => Some(Callback::SpeechStarted),
                    ConversationEvent::SpeechEnded => Some(Callback::SpeechEnded),
                    ConversationEvent::ResponseStarted => Some(Callback::ResponseStarted),
                    ConversationEvent::ResponseEnded => Some(Callback::ResponseEnded),
                    ConversationEvent::Shutdown => None,
                };
                std::iter::once(Callback::StateChange)
                    .chain(specific)
                    .collect()
            }
            Notification::Error(_) => vec![Callback::Error],
        }
    }
}

#[derive(Default)]
pub(crate) struct ObserverRegistry {
    next_id: AtomicU64,
    entries: Mutex<Vec<(SubscriptionId, Arc<dyn ConversationObserver>)>>,
}

impl ObserverRegistry {
    pub(crate) fn subscribe(&self, observer: Arc<dyn ConversationObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.entries.lock().push((id, observer));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn snapshot(&self) -> Vec<(SubscriptionId, Arc<dyn ConversationObserver>)> {
        self.entries.lock().clone()
    }
}

/// Delivers notifications in commit order, one observer callback at a time.
pub(crate) fn spawn_notifier(
    session_id: String,
    mut notifications: mpsc::Receiver<Notification>,
    observers: Arc<ObserverRegistry>,
    span: Span,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            while let Some(notification) = notifications.recv().await {
                for (id, observer) in observers.snapshot() {
                    for callback in Callback::for_notification(&notification) {
                        invoke_isolated(&session_id, id, Arc::clone(&observer), callback, &notification)
                            .await;
                    }
                }
            }
        }
        .instrument(span),
    )
}

async fn invoke_isolated(
    session_id: &str,
    id: SubscriptionId,
    observer: Arc<dyn ConversationObserver>,
    callback: Callback,
    notification: &Notification,
) {
    let notification = notification.clone();
    let task = tokio::spawn(async move { invoke(observer.as_ref(), callback, &notification).await });

    let message = match task.await {
        Ok(Ok(())) => return,
        Ok(Err(err)) => format!("{err:#}"),
        Err(join) if join.is_panic() => "callback panicked".to_string(),
        Err(join) => join.to_string(),
    };

    record_callback_failure(
        session_id,
        &CallbackError {
            subscription: id.get(),
            callback: callback.as_str(),
            message,
        },
    );
}

async fn invoke(
    observer: &dyn ConversationObserver,
    callback: Callback,
    notification: &Notification,
) -> Result<()> {
    match (callback, notification) {
        (Callback::StateChange, Notification::Transition(change)) => {
            observer.on_state_change(change).await
        }
        (Callback::SpeechStarted, _) => observer.on_speech_started().await,
        (Callback::SpeechEnded, _) => observer.on_speech_ended().await,
        (Callback::ResponseStarted, _) => observer.on_response_started().await,
        (Callback::ResponseEnded, _) => observer.on_response_ended().await,
        (Callback::Error, Notification::Error(message)) => observer.on_error(message).await,
        _ => Ok(()),
    }
}
