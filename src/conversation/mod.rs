//! Conversational state machine with barge-in handling.

mod machine;
mod observer;
mod state;

pub use machine::{MachineSnapshot, PlaybackControl, StateMachine};
pub use observer::{ConversationObserver, SubscriptionId};
pub use state::{
    is_barge_in, next_state, ConversationEvent, ConversationState, StateChange, Transition,
};
