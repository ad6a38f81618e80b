use std::{sync::Arc, time::Duration};

use futures_util::{stream::FuturesUnordered, StreamExt};
use tokio::{task::AbortHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    backend::BackendError,
    dispatcher::{invoke, resolve_model},
    errors::{BackendFailure, OrchestratorError},
    events::OrchestratorEvent,
    models::{
        unix_millis, BackendOutput, ConcurrentProcess, GenerationRequest, GenerationResponse,
        SubProcessStatus, Timing,
    },
    registry::BackendEntry,
    telemetry::{CallRecord, Telemetry},
};

/// Races one request across several backends; the first success wins.
#[derive(Clone)]
pub struct Coordinator {
    telemetry: Arc<Telemetry>,
    detach_losers: bool,
}

struct ContenderGuard {
    aborts: Vec<(String, AbortHandle)>,
    detach: bool,
}

impl Drop for ContenderGuard {
    fn drop(&mut self) {
        if self.detach {
            return;
        }
        for (backend, abort) in &self.aborts {
            if !abort.is_finished() {
                abort.abort();
                debug!(backend = %backend, "race contender cancelled with its caller");
            }
        }
    }
}

struct Finished {
    backend: String,
    latency: Duration,
    outcome: Result<BackendOutput, BackendError>,
}

impl Coordinator {
    pub fn new(telemetry: Arc<Telemetry>, detach_losers: bool) -> Self {
        Self {
            telemetry,
            detach_losers,
        }
    }

    /// Returns the earliest success, or `AggregateFailure` with one reason per contender.
    /// Contenders are not retried.
    pub async fn race(
        &self,
        request: &GenerationRequest,
        contenders: Vec<Arc<BackendEntry>>,
        limit: Duration,
    ) -> Result<GenerationResponse, OrchestratorError> {
        let ids = contenders
            .iter()
            .map(|entry| entry.id.clone())
            .collect::<Vec<_>>();
        let mut process = ConcurrentProcess::new(&request.id, &ids);
        let started_at_ms = unix_millis();
        let started = Instant::now();
        let shared = Arc::new(request.clone());

        info!(
            request_id = %request.id,
            contenders = %ids.join(","),
            "race started"
        );

        // Dropping the race before it settles must not leave contenders running.
        let mut contenders_guard = ContenderGuard {
            aborts: Vec::with_capacity(contenders.len()),
            detach: self.detach_losers,
        };
        let mut pending = FuturesUnordered::new();
        for entry in contenders {
            if let Some(sub) = process.process_mut(&entry.id) {
                sub.status = SubProcessStatus::Running;
                sub.started_at_ms = Some(unix_millis());
            }

            let backend = entry.id.clone();
            let request = Arc::clone(&shared);
            let telemetry = Arc::clone(&self.telemetry);
            let handle = tokio::spawn(async move {
                let call_started = Instant::now();
                let outcome = match resolve_model(&entry, &request) {
                    Ok(model) => {
                        let outcome = invoke(&entry, &request, &model, limit).await;
                        telemetry
                            .record_call(CallRecord {
                                backend: &entry.id,
                                model: &model,
                                task: &request.task,
                                mode: request.mode,
                                latency: call_started.elapsed(),
                                usage: outcome.as_ref().ok().map(|output| &output.usage),
                                error: outcome.as_ref().err(),
                            })
                            .await;
                        outcome
                    }
                    Err(error) => Err(error),
                };
                (call_started.elapsed(), outcome)
            });

            contenders_guard
                .aborts
                .push((backend.clone(), handle.abort_handle()));
            pending.push(async move {
                match handle.await {
                    Ok((latency, outcome)) => Finished {
                        backend,
                        latency,
                        outcome,
                    },
                    Err(error) => Finished {
                        backend,
                        latency: Duration::ZERO,
                        outcome: Err(BackendError::InvalidResponse(format!(
                            "race task ended abnormally: {error}"
                        ))),
                    },
                }
            });
        }

        let mut failures = Vec::new();
        while let Some(finished) = pending.next().await {
            let completed_at_ms = unix_millis();
            match finished.outcome {
                Ok(output) => {
                    if let Some(sub) = process.process_mut(&finished.backend) {
                        sub.status = SubProcessStatus::Completed;
                        sub.completed_at_ms = Some(completed_at_ms);
                        sub.latency_ms = Some(finished.latency.as_millis() as u64);
                    }
                    process.winner = Some(finished.backend.clone());
                    self.settle_losers(&mut process, &contenders_guard.aborts, &finished.backend);

                    info!(
                        request_id = %request.id,
                        winner = %finished.backend,
                        failures = failures.len(),
                        latency_ms = finished.latency.as_millis() as u64,
                        "race won"
                    );
                    self.telemetry.metrics.observe_race(true);
                    self.telemetry.emit(OrchestratorEvent::RaceFinished {
                        request_id: request.id.clone(),
                        winner: Some(finished.backend.clone()),
                        contenders: ids.len(),
                        failures: failures.len(),
                    });

                    let timing =
                        Timing::measured(started_at_ms, started.elapsed(), finished.latency);
                    let response = GenerationResponse::succeeded(
                        &request.id,
                        &finished.backend,
                        output,
                        timing,
                        1,
                    );
                    return Ok(response.with_race(process));
                }
                Err(error) => {
                    debug!(
                        request_id = %request.id,
                        backend = %finished.backend,
                        %error,
                        "race contender failed"
                    );
                    if let Some(sub) = process.process_mut(&finished.backend) {
                        sub.status = SubProcessStatus::Failed;
                        sub.completed_at_ms = Some(completed_at_ms);
                        sub.latency_ms = Some(finished.latency.as_millis() as u64);
                        sub.error = Some(error.to_string());
                    }
                    failures.push(BackendFailure {
                        backend: finished.backend,
                        error,
                    });
                }
            }
        }

        warn!(
            request_id = %request.id,
            failures = failures.len(),
            "every race contender failed"
        );
        self.telemetry.metrics.observe_race(false);
        self.telemetry.emit(OrchestratorEvent::RaceFinished {
            request_id: request.id.clone(),
            winner: None,
            contenders: ids.len(),
            failures: failures.len(),
        });
        Err(OrchestratorError::AggregateFailure { failures })
    }

    /// Aborts or detaches the contenders still running once a winner exists.
    fn settle_losers(
        &self,
        process: &mut ConcurrentProcess,
        aborts: &[(String, AbortHandle)],
        winner: &str,
    ) {
        for (backend, abort) in aborts {
            if backend == winner || abort.is_finished() {
                continue;
            }
            if self.detach_losers {
                debug!(backend = %backend, "race loser left running");
                continue;
            }

            abort.abort();
            if let Some(sub) = process.process_mut(backend) {
                if sub.status == SubProcessStatus::Running {
                    sub.status = SubProcessStatus::Failed;
                    sub.completed_at_ms = Some(unix_millis());
                    sub.error = Some("cancelled after another backend won".to_owned());
                }
            }
            debug!(backend = %backend, "race loser cancelled");
        }
    }
}
