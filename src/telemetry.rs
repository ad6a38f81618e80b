use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    backend::BackendError,
    events::OrchestratorEvent,
    metrics::AppMetrics,
    models::{unix_millis, ExecutionMode, Usage},
    performance::{PerformanceLog, PerformanceRecord},
};

/// Where every finished backend call is reported: rolling performance log, prometheus, events.
pub struct Telemetry {
    pub performance: PerformanceLog,
    pub metrics: AppMetrics,
    events: broadcast::Sender<OrchestratorEvent>,
}

/// One finished adapter call.
pub struct CallRecord<'a> {
    pub backend: &'a str,
    pub model: &'a str,
    pub task: &'a str,
    pub mode: ExecutionMode,
    pub latency: Duration,
    pub usage: Option<&'a Usage>,
    pub error: Option<&'a BackendError>,
}

impl Telemetry {
    pub fn new(performance_window: usize, event_capacity: usize, metrics: AppMetrics) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            performance: PerformanceLog::new(performance_window),
            metrics,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Publishes to current subscribers; having none is not an error.
    pub fn emit(&self, event: OrchestratorEvent) {
        if self.events.send(event).is_err() {
            debug!("no event subscribers");
        }
    }

    pub async fn record_call(&self, call: CallRecord<'_>) {
        let outcome = call.error.map(BackendError::label).unwrap_or("ok");
        self.metrics
            .observe_backend_call(call.backend, call.mode, outcome, call.latency);
        if let Some(usage) = call.usage {
            self.metrics.observe_usage(call.backend, usage);
        }

        self.performance
            .record(PerformanceRecord {
                timestamp_ms: unix_millis(),
                backend: call.backend.to_owned(),
                model: call.model.to_owned(),
                task: call.task.to_owned(),
                latency_ms: call.latency.as_millis() as u64,
                cost: call.usage.map(|usage| usage.estimated_cost).unwrap_or_default(),
                success: call.error.is_none(),
            })
            .await;
    }
}
