use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::{
    task::JoinHandle,
    time::{interval, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    backend::{AiBackend, BackendError},
    config::HealthConfig,
    events::OrchestratorEvent,
    models::unix_millis,
    registry::{BackendEntry, BackendRegistry, HealthState, HealthStatus},
    telemetry::Telemetry,
};

/// Result of probing one backend.
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    pub backend: String,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub checked_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Folds one probe outcome into `state` and returns the new status.
pub fn apply_probe(
    state: &mut HealthState,
    outcome: Result<(), &BackendError>,
    latency: Duration,
    config: &HealthConfig,
) -> HealthStatus {
    let status = match outcome {
        Ok(()) => {
            state.consecutive_failures = 0;
            state.consecutive_successes = state.consecutive_successes.saturating_add(1);
            state.last_error = None;
            if state.status == HealthStatus::Down
                && state.consecutive_successes < config.recovery_threshold
            {
                HealthStatus::Down
            } else if latency > config.degraded_latency {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            }
        }
        Err(error) => {
            state.consecutive_successes = 0;
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.last_error = Some(error.to_string());
            if state.status == HealthStatus::Down
                || state.consecutive_failures >= config.failure_threshold
            {
                HealthStatus::Down
            } else {
                HealthStatus::Degraded
            }
        }
    };

    state.status = status;
    state.last_probe_at_ms = Some(unix_millis());
    state.last_latency_ms = Some(latency.as_millis() as u64);
    status
}

/// Periodically probes every registered backend. Dispatch reads whatever status is cached.
pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    telemetry: Arc<Telemetry>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<BackendRegistry>,
        telemetry: Arc<Telemetry>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            telemetry,
            config,
        }
    }

    /// Probes all backends concurrently; one slow probe does not hold back the others.
    pub async fn check_once(&self) -> Vec<HealthMetrics> {
        let entries = self.registry.entries().await;
        join_all(entries.iter().map(|entry| self.probe(entry))).await
    }

    async fn probe(&self, entry: &Arc<BackendEntry>) -> HealthMetrics {
        let state = entry.health().await;
        if !state.initialized {
            return HealthMetrics {
                backend: entry.id.clone(),
                status: state.status,
                response_time_ms: 0,
                checked_at_ms: unix_millis(),
                error: state.last_error,
            };
        }

        let started = Instant::now();
        let outcome = match timeout(self.config.probe_timeout, entry.adapter.check_health()).await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(format!(
                "health probe exceeded {}ms",
                self.config.probe_timeout.as_millis()
            ))),
        };
        let latency = started.elapsed();

        let (previous, status, error) = {
            let mut state = entry.health.lock().await;
            let previous = state.status;
            let status = apply_probe(&mut state, outcome.as_ref().map(|_| ()), latency, &self.config);
            (previous, status, state.last_error.clone())
        };

        let response_time_ms = latency.as_millis() as u64;
        if previous != status {
            match status {
                HealthStatus::Healthy => info!(
                    backend = %entry.id,
                    previous = previous.as_str(),
                    response_time_ms,
                    "backend healthy"
                ),
                HealthStatus::Degraded | HealthStatus::Down => warn!(
                    backend = %entry.id,
                    previous = previous.as_str(),
                    status = status.as_str(),
                    response_time_ms,
                    error = error.as_deref().unwrap_or("slow probe"),
                    "backend health changed"
                ),
            }
        } else {
            debug!(backend = %entry.id, status = status.as_str(), response_time_ms, "health probe");
        }

        self.telemetry.emit(OrchestratorEvent::HealthCheckCompleted {
            backend: entry.id.clone(),
            previous,
            status,
            response_time_ms,
        });

        HealthMetrics {
            backend: entry.id.clone(),
            status,
            response_time_ms,
            checked_at_ms: unix_millis(),
            error,
        }
    }

    /// Starts the periodic loop. The first round runs after one full interval.
    pub fn spawn(self: Arc<Self>) -> HealthMonitorHandle {
        let period = self.config.interval;
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.check_once().await;
            }
        });
        info!(interval_secs = period.as_secs(), "health monitor started");
        HealthMonitorHandle { task }
    }
}

/// Stops the background loop when stopped or dropped.
pub struct HealthMonitorHandle {
    task: JoinHandle<()>,
}

impl HealthMonitorHandle {
    pub fn stop(self) {
        drop(self);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for HealthMonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::mock::MockBackend, config::BackendConfig, metrics::AppMetrics};

    fn state() -> HealthState {
        HealthState {
            status: HealthStatus::Healthy,
            initialized: true,
            last_probe_at_ms: None,
            last_latency_ms: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_error: None,
        }
    }

    fn thresholds(failure_threshold: u32, recovery_threshold: u32) -> HealthConfig {
        HealthConfig {
            failure_threshold,
            recovery_threshold,
            ..HealthConfig::default()
        }
    }

    #[test]
    fn single_failure_downs_and_single_success_restores_by_default() {
        let config = HealthConfig::default();
        let mut state = state();
        let error = BackendError::Network("refused".to_owned());

        let down = apply_probe(&mut state, Err(&error), Duration::from_millis(3), &config);
        assert_eq!(down, HealthStatus::Down);
        let up = apply_probe(&mut state, Ok(()), Duration::from_millis(3), &config);
        assert_eq!(up, HealthStatus::Healthy);
    }

    #[test]
    fn failures_below_threshold_degrade() {
        let config = thresholds(3, 2);
        let mut state = state();
        let error = BackendError::Timeout("probe".to_owned());

        assert_eq!(
            apply_probe(&mut state, Err(&error), Duration::ZERO, &config),
            HealthStatus::Degraded
        );
        assert_eq!(
            apply_probe(&mut state, Err(&error), Duration::ZERO, &config),
            HealthStatus::Degraded
        );
        assert_eq!(
            apply_probe(&mut state, Err(&error), Duration::ZERO, &config),
            HealthStatus::Down
        );
        assert_eq!(
            apply_probe(&mut state, Ok(()), Duration::ZERO, &config),
            HealthStatus::Down
        );
        assert_eq!(
            apply_probe(&mut state, Ok(()), Duration::ZERO, &config),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn slow_probe_is_degraded() {
        let config = HealthConfig {
            degraded_latency: Duration::from_millis(100),
            ..HealthConfig::default()
        };
        let mut state = state();
        assert_eq!(
            apply_probe(&mut state, Ok(()), Duration::from_millis(250), &config),
            HealthStatus::Degraded
        );
    }

    #[tokio::test]
    async fn check_once_excludes_failed_backend_until_it_recovers() {
        let registry = Arc::new(BackendRegistry::new());
        let flaky = MockBackend::named("flaky");
        registry
            .register(flaky.clone().into(), &BackendConfig::mock("flaky"))
            .await
            .expect("registration should succeed");
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            Arc::new(Telemetry::new(8, 8, AppMetrics::new())),
            HealthConfig::default(),
        );
        let text = std::collections::BTreeSet::from([crate::models::Modality::Text]);

        flaky.push_probe(Err(BackendError::Network("down".to_owned())));
        let report = monitor.check_once().await;
        assert_eq!(report[0].status, HealthStatus::Down);
        assert!(registry.list_healthy_capable(&text).await.is_empty());

        let report = monitor.check_once().await;
        assert_eq!(report[0].status, HealthStatus::Healthy);
        assert_eq!(registry.list_healthy_capable(&text).await.len(), 1);
    }
}
