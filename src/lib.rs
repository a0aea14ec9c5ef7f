//! Voxgate Core Library
//!
//! Transport-agnostic voice gateway: per-session audio buffering, turn-taking
//! state with barge-in, inbound message routing and the connection registry
//! that ties them to telephony, browser and voice-chat clients.

pub mod audio;
pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod telemetry;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use session::ConnectionManager;

#[cfg(test)]
mod support;
