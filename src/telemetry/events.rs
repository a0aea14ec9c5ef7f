use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::audio::QueueKind;
use crate::error::{CallbackError, MalformedMessageError};

pub(crate) const TARGET: &str = "telemetry::voice_gateway";
pub(crate) const EVENT_QUEUE_SATURATED: &str = "queue_saturated";
pub(crate) const EVENT_FRAMES_CLEARED: &str = "frames_cleared";
pub(crate) const EVENT_TRANSITION: &str = "state_transition";
pub(crate) const EVENT_TRANSITION_REJECTED: &str = "state_transition_rejected";
pub(crate) const EVENT_SESSION_LIFECYCLE: &str = "session_lifecycle";
pub(crate) const EVENT_CALLBACK_FAILED: &str = "callback_failed";
pub(crate) const EVENT_MALFORMED_MESSAGE: &str = "malformed_message";

#[derive(Debug, Serialize)]
pub struct QueueSaturationEvent<'a> {
    pub session_id: &'a str,
    pub queue: QueueKind,
    pub capacity: usize,
    pub dropped_total: u64,
}

#[derive(Debug, Serialize)]
pub struct FramesClearedEvent<'a> {
    pub session_id: &'a str,
    pub reason: &'static str,
    pub input_frames: usize,
    pub output_frames: usize,
}

#[derive(Debug, Serialize)]
pub struct TransitionEvent<'a> {
    pub session_id: &'a str,
    pub from: &'static str,
    pub to: &'static str,
    pub trigger: &'static str,
    pub sequence: u64,
}

#[derive(Debug, Serialize)]
pub struct TransitionRejectedEvent<'a> {
    pub session_id: &'a str,
    pub state: &'static str,
    pub trigger: &'static str,
    pub sequence: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionLifecycleEvent<'a> {
    pub session_id: &'a str,
    pub transport: &'static str,
    pub status: &'static str,
    pub age_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct CallbackFailureEvent<'a> {
    pub session_id: &'a str,
    pub subscription: u64,
    pub callback: &'static str,
    pub message: &'a str,
}

#[derive(Debug, Serialize)]
pub struct MalformedMessageEvent<'a> {
    pub session_id: &'a str,
    pub reason: String,
}

pub fn record_queue_saturation(
    session_id: &str,
    queue: QueueKind,
    capacity: usize,
    dropped_total: u64,
) {
    let event = QueueSaturationEvent {
        session_id,
        queue,
        capacity,
        dropped_total,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => warn!(
            target: TARGET,
            event = EVENT_QUEUE_SATURATED,
            session_id = event.session_id,
            queue = event.queue.as_str(),
            capacity = event.capacity,
            dropped_total = event.dropped_total,
            payload = %payload,
            "audio queue full; dropped newest frame"
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_QUEUE_SATURATED,
            %err,
            "failed to encode queue saturation event"
        ),
    }
}

pub fn record_frames_cleared(
    session_id: &str,
    reason: &'static str,
    input_frames: usize,
    output_frames: usize,
) {
    let event = FramesClearedEvent {
        session_id,
        reason,
        input_frames,
        output_frames,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET,
            event = EVENT_FRAMES_CLEARED,
            session_id = event.session_id,
            reason = event.reason,
            input_frames = event.input_frames,
            output_frames = event.output_frames,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_FRAMES_CLEARED,
            %err,
            "failed to encode frames cleared event"
        ),
    }
}

pub fn record_transition(
    session_id: &str,
    from: &'static str,
    to: &'static str,
    trigger: &'static str,
    sequence: u64,
) {
    let event = TransitionEvent {
        session_id,
        from,
        to,
        trigger,
        sequence,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET,
            event = EVENT_TRANSITION,
            session_id = event.session_id,
            from = event.from,
            to = event.to,
            trigger = event.trigger,
            sequence = event.sequence,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_TRANSITION,
            %err,
            "failed to encode state transition event"
        ),
    }
}

pub fn record_transition_rejected(
    session_id: &str,
    state: &'static str,
    trigger: &'static str,
    sequence: u64,
) {
    let event = TransitionRejectedEvent {
        session_id,
        state,
        trigger,
        sequence,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => warn!(
            target: TARGET,
            event = EVENT_TRANSITION_REJECTED,
            session_id = event.session_id,
            state = event.state,
            trigger = event.trigger,
            sequence = event.sequence,
            payload = %payload,
            "ignoring event not valid in current state"
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_TRANSITION_REJECTED,
            %err,
            "failed to encode rejected transition event"
        ),
    }
}

pub fn record_session_lifecycle(
    session_id: &str,
    transport: &'static str,
    status: &'static str,
    age: Duration,
    detail: Option<&str>,
) {
    let event = SessionLifecycleEvent {
        session_id,
        transport,
        status,
        age_ms: duration_to_ms(age),
        detail,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => info!(
            target: TARGET,
            event = EVENT_SESSION_LIFECYCLE,
            session_id = event.session_id,
            transport = event.transport,
            status = event.status,
            age_ms = event.age_ms,
            payload = %payload
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_SESSION_LIFECYCLE,
            %err,
            "failed to encode session lifecycle event"
        ),
    }
}

pub fn record_callback_failure(session_id: &str, failure: &CallbackError) {
    let event = CallbackFailureEvent {
        session_id,
        subscription: failure.subscription,
        callback: failure.callback,
        message: &failure.message,
    };

    match serde_json::to_string(&event) {
        Ok(payload) => warn!(
            target: TARGET,
            event = EVENT_CALLBACK_FAILED,
            session_id = event.session_id,
            subscription = event.subscription,
            callback = event.callback,
            payload = %payload,
            "state observer failed"
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_CALLBACK_FAILED,
            %err,
            "failed to encode callback failure event"
        ),
    }
}

pub fn record_malformed_message(session_id: &str, error: &MalformedMessageError) {
    let event = MalformedMessageEvent {
        session_id,
        reason: error.to_string(),
    };

    match serde_json::to_string(&event) {
        Ok(payload) => warn!(
            target: TARGET,
            event = EVENT_MALFORMED_MESSAGE,
            session_id = event.session_id,
            payload = %payload,
            "skipping malformed inbound message"
        ),
        Err(err) => warn!(
            target: TARGET,
            event = EVENT_MALFORMED_MESSAGE,
            %err,
            "failed to encode malformed message event"
        ),
    }
}

pub(crate) fn duration_to_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
