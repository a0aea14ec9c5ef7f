use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    ShuttingDown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::ShuttingDown => "shutting_down",
        }
    }
}

/// Point-in-time view of the gateway, cheap enough to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub active_connections: usize,
    pub active_audio_handlers: usize,
}

/// Result of `ConnectionManager::shutdown_all`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    /// Sessions that completed an orderly disconnect.
    pub closed: usize,
    /// Sessions force-marked closed after the shutdown timeout.
    pub forced: Vec<String>,
}
