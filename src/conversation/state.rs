use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    Listening,
    Responding,
    Interrupted,
    Closed,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Idle => "idle",
            ConversationState::Listening => "listening",
            ConversationState::Responding => "responding",
            ConversationState::Interrupted => "interrupted",
            ConversationState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationEvent {
    SpeechStarted,
    SpeechEnded,
    ResponseStarted,
    ResponseEnded,
    Shutdown,
}

impl ConversationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationEvent::SpeechStarted => "speech_started",
            ConversationEvent::SpeechEnded => "speech_ended",
            ConversationEvent::ResponseStarted => "response_started",
            ConversationEvent::ResponseEnded => "response_ended",
            ConversationEvent::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ConversationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transition table. `None` means the event is not accepted in `from`.
pub fn next_state(from: ConversationState, event: ConversationEvent) -> Option<ConversationState> {
    use ConversationEvent as E;
    use ConversationState as S;

    match (from, event) {
        (S::Closed, _) => None,
        (_, E::Shutdown) => Some(S::Closed),
        (S::Idle, E::SpeechStarted) => Some(S::Listening),
        (S::Listening, E::ResponseStarted) => Some(S::Responding),
        (S::Responding, E::ResponseEnded) => Some(S::Idle),
        (S::Responding, E::SpeechStarted) => Some(S::Interrupted),
        (S::Interrupted, E::SpeechEnded) => Some(S::Idle),
        (S::Interrupted, E::SpeechStarted) => Some(S::Listening),
        _ => None,
    }
}

pub fn is_barge_in(from: ConversationState, event: ConversationEvent) -> bool {
    from == ConversationState::Responding && event == ConversationEvent::SpeechStarted
}

/// A committed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub from: ConversationState,
    pub to: ConversationState,
    pub event: ConversationEvent,
    pub sequence: u64,
}

impl StateChange {
    pub fn is_barge_in(&self) -> bool {
        is_barge_in(self.from, self.event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Accepted(StateChange),
    Rejected {
        state: ConversationState,
        event: ConversationEvent,
    },
}

impl Transition {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Transition::Accepted(_))
    }

    pub fn change(&self) -> Option<&StateChange> {
        match self {
            Transition::Accepted(change) => Some(change),
            Transition::Rejected { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATES: [ConversationState; 5] = [
        ConversationState::Idle,
        ConversationState::Listening,
        ConversationState::Responding,
        ConversationState::Interrupted,
        ConversationState::Closed,
    ];

    const EVENTS: [ConversationEvent; 5] = [
        ConversationEvent::SpeechStarted,
        ConversationEvent::SpeechEnded,
        ConversationEvent::ResponseStarted,
        ConversationEvent::ResponseEnded,
        ConversationEvent::Shutdown,
    ];

    #[test]
    fn table_accepts_exactly_the_listed_rows() {
        use ConversationEvent as E;
        use ConversationState as S;

        let mut accepted = Vec::new();
        for from in STATES {
            for event in EVENTS {
                if let Some(to) = next_state(from, event) {
                    accepted.push((from, event, to));
                }
            }
        }

        let expected = vec![
            (S::Idle, E::SpeechStarted, S::Listening),
            (S::Idle, E::Shutdown, S::Closed),
            (S::Listening, E::ResponseStarted, S::Responding),
            (S::Listening, E::Shutdown, S::Closed),
            (S::Responding, E::SpeechStarted, S::Interrupted),
            (S::Responding, E::ResponseEnded, S::Idle),
            (S::Responding, E::Shutdown, S::Closed),
            (S::Interrupted, E::SpeechStarted, S::Listening),
            (S::Interrupted, E::SpeechEnded, S::Idle),
            (S::Interrupted, E::Shutdown, S::Closed),
        ];
        assert_eq!(accepted, expected);
    }

    #[test]
    fn closed_is_terminal() {
        for event in EVENTS {
            assert_eq!(next_state(ConversationState::Closed, event), None);
        }
    }

    #[test]
    fn only_speech_during_response_is_barge_in() {
        assert!(is_barge_in(
            ConversationState::Responding,
            ConversationEvent::SpeechStarted
        ));
        assert!(!is_barge_in(
            ConversationState::Idle,
            ConversationEvent::SpeechStarted
        ));
        assert!(!is_barge_in(
            ConversationState::Interrupted,
            ConversationEvent::SpeechStarted
        ));
    }
}
