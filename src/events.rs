use serde::Serialize;

use crate::{
    backend::BackendError,
    models::ExecutionMode,
    registry::HealthStatus,
};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl StreamOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamOutcome::Completed => "completed",
            StreamOutcome::Failed => "failed",
            StreamOutcome::Cancelled => "cancelled",
        }
    }
}

/// Lifecycle notifications published on `Orchestrator::subscribe`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    Initialized {
        healthy_count: usize,
        total_count: usize,
    },
    RequestStarted {
        request_id: String,
        task: String,
        mode: ExecutionMode,
    },
    RequestRetrying {
        request_id: String,
        backend: String,
        attempt: u32,
        delay_ms: u64,
        error: BackendError,
    },
    RequestCompleted {
        request_id: String,
        backend: Option<String>,
        success: bool,
        latency_ms: u64,
    },
    RaceFinished {
        request_id: String,
        winner: Option<String>,
        contenders: usize,
        failures: usize,
    },
    HealthCheckCompleted {
        backend: String,
        previous: HealthStatus,
        status: HealthStatus,
        response_time_ms: u64,
    },
    ModelSwitched {
        backend: String,
        model: String,
    },
    StreamStarted {
        session_id: String,
        request_id: String,
        backend: String,
    },
    StreamFinished {
        session_id: String,
        backend: String,
        outcome: StreamOutcome,
        chunk_count: u64,
    },
}
