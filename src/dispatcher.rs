use std::{sync::Arc, time::Duration};

use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::{
    backend::{AiBackend, BackendError},
    config::{OrchestratorConfig, RetryPolicy},
    errors::OrchestratorError,
    events::OrchestratorEvent,
    models::{unix_millis, BackendOutput, GenerationRequest, GenerationResponse, Timing},
    registry::{BackendEntry, BackendRegistry},
    telemetry::{CallRecord, Telemetry},
};

/// Chooses backends for a request and runs the single-backend path.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<BackendRegistry>,
    telemetry: Arc<Telemetry>,
    load_balancing: bool,
    default_timeout: Duration,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<BackendRegistry>,
        telemetry: Arc<Telemetry>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            telemetry,
            load_balancing: config.load_balancing,
            default_timeout: config.default_timeout,
            retry: config.retry,
        }
    }

    pub fn call_timeout(&self, request: &GenerationRequest) -> Duration {
        request.options.timeout().unwrap_or(self.default_timeout)
    }

    /// Healthy, capable backends the request accepts. A non-empty allow-list also fixes the order.
    pub async fn eligible(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<Arc<BackendEntry>>, OrchestratorError> {
        let target = request.options.target_backend.as_deref();
        let mut eligible = self
            .registry
            .list_healthy_capable(&request.modalities)
            .await
            .into_iter()
            .filter(|entry| request.allows(&entry.id))
            .filter(|entry| target.map_or(true, |target| target == entry.id))
            .collect::<Vec<_>>();

        if eligible.is_empty() {
            return Err(OrchestratorError::NoCapableBackend {
                modalities: request.modalities.clone(),
            });
        }

        if !request.allowed_backends.is_empty() {
            eligible.sort_by_key(|entry| {
                request
                    .allowed_backends
                    .iter()
                    .position(|id| *id == entry.id)
                    .unwrap_or(usize::MAX)
            });
        }
        Ok(eligible)
    }

    /// Least active first, earliest registration on ties. Backends at their capacity hint
    /// lose to any backend with headroom.
    pub fn select(&self, eligible: &[Arc<BackendEntry>]) -> Option<Arc<BackendEntry>> {
        if !self.load_balancing || eligible.len() == 1 {
            return eligible.first().cloned();
        }
        eligible
            .iter()
            .min_by_key(|entry| (entry.at_capacity(), entry.active_requests(), entry.order))
            .cloned()
    }

    pub async fn execute(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, OrchestratorError> {
        let eligible = self.eligible(request).await?;
        let entry = self
            .select(&eligible)
            .ok_or_else(|| OrchestratorError::NoCapableBackend {
                modalities: request.modalities.clone(),
            })?;

        info!(
            request_id = %request.id,
            backend = %entry.id,
            candidates = eligible.len(),
            active = entry.active_requests(),
            "request dispatched"
        );
        Ok(self.execute_on(&entry, request).await)
    }

    /// Runs `request` on one backend, retrying retryable failures with exponential backoff.
    /// Adapter failures come back as an unsuccessful response.
    pub async fn execute_on(
        &self,
        entry: &Arc<BackendEntry>,
        request: &GenerationRequest,
    ) -> GenerationResponse {
        let started_at_ms = unix_millis();
        let started = Instant::now();
        let limit = self.call_timeout(request);

        let model = match resolve_model(entry, request) {
            Ok(model) => model,
            Err(error) => {
                warn!(request_id = %request.id, backend = %entry.id, %error, "model override rejected");
                let timing = Timing::measured(started_at_ms, started.elapsed(), Duration::ZERO);
                return GenerationResponse::failed(
                    &request.id,
                    &entry.id,
                    &entry.adapter.current_model(),
                    error,
                    timing,
                    0,
                );
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let call_started = Instant::now();
            let result = invoke(entry, request, &model, limit).await;
            let processing = call_started.elapsed();
            self.telemetry
                .record_call(CallRecord {
                    backend: &entry.id,
                    model: &model,
                    task: &request.task,
                    mode: request.mode,
                    latency: processing,
                    usage: result.as_ref().ok().map(|output| &output.usage),
                    error: result.as_ref().err(),
                })
                .await;

            match result {
                Ok(output) => {
                    debug!(
                        request_id = %request.id,
                        backend = %entry.id,
                        model = %output.model,
                        attempt,
                        latency_ms = processing.as_millis() as u64,
                        "backend call succeeded"
                    );
                    let timing = Timing::measured(started_at_ms, started.elapsed(), processing);
                    return GenerationResponse::succeeded(
                        &request.id,
                        &entry.id,
                        output,
                        timing,
                        attempt,
                    );
                }
                Err(error) if error.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        request_id = %request.id,
                        backend = %entry.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "retrying backend call"
                    );
                    self.telemetry.emit(OrchestratorEvent::RequestRetrying {
                        request_id: request.id.clone(),
                        backend: entry.id.clone(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error,
                    });
                    sleep(delay).await;
                }
                Err(error) => {
                    warn!(
                        request_id = %request.id,
                        backend = %entry.id,
                        attempt,
                        %error,
                        "backend call failed"
                    );
                    let timing = Timing::measured(started_at_ms, started.elapsed(), processing);
                    return GenerationResponse::failed(
                        &request.id,
                        &entry.id,
                        &model,
                        error,
                        timing,
                        attempt,
                    );
                }
            }
        }
    }
}

/// The request's model override when the backend offers it, otherwise the active model.
pub(crate) fn resolve_model(
    entry: &BackendEntry,
    request: &GenerationRequest,
) -> Result<String, BackendError> {
    match &request.options.model {
        Some(model) if entry.adapter.models().iter().any(|info| info.id == *model) => {
            Ok(model.clone())
        }
        Some(model) => Err(BackendError::Unsupported(format!(
            "model {model} is not offered by {}",
            entry.id
        ))),
        None => Ok(entry.adapter.current_model()),
    }
}

/// One adapter call bounded by `limit`, counted as active for its whole lifetime
/// (including when the surrounding task is aborted).
pub(crate) async fn invoke(
    entry: &Arc<BackendEntry>,
    request: &GenerationRequest,
    model: &str,
    limit: Duration,
) -> Result<BackendOutput, BackendError> {
    let _active = entry.begin();
    let result = match timeout(limit, entry.adapter.execute(request, model)).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(format!(
            "{} did not answer within {}ms",
            entry.id,
            limit.as_millis()
        ))),
    };
    if result.is_err() {
        entry.record_error();
    }
    result
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::{
        backend::mock::MockBackend,
        config::BackendConfig,
        metrics::AppMetrics,
        models::{ContentPart, Modality, RequestOptions},
    };

    async fn dispatcher_with(
        backends: Vec<(MockBackend, BackendConfig)>,
        config: OrchestratorConfig,
    ) -> Dispatcher {
        let registry = Arc::new(BackendRegistry::new());
        for (backend, backend_config) in backends {
            registry
                .register(backend.into(), &backend_config)
                .await
                .expect("registration should succeed");
        }
        let telemetry = Arc::new(Telemetry::new(16, 16, AppMetrics::new()));
        Dispatcher::new(registry, telemetry, &config)
    }

    fn fast_retry() -> OrchestratorConfig {
        OrchestratorConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            },
            ..OrchestratorConfig::default()
        }
    }

    #[tokio::test]
    async fn least_active_backend_wins() {
        let dispatcher = dispatcher_with(
            vec![
                (MockBackend::named("a"), BackendConfig::mock("a")),
                (MockBackend::named("b"), BackendConfig::mock("b")),
            ],
            OrchestratorConfig::default(),
        )
        .await;
        let request = GenerationRequest::text("general", "hi");

        let eligible = dispatcher.eligible(&request).await.expect("eligible");
        let _a = [eligible[0].begin(), eligible[0].begin(), eligible[0].begin()];
        let _b = eligible[1].begin();

        let selected = dispatcher.select(&eligible).expect("selection");
        assert_eq!(selected.id, "b");
    }

    #[tokio::test]
    async fn ties_resolve_to_registration_order() {
        let dispatcher = dispatcher_with(
            vec![
                (MockBackend::named("a"), BackendConfig::mock("a")),
                (MockBackend::named("b"), BackendConfig::mock("b")),
            ],
            OrchestratorConfig::default(),
        )
        .await;
        let request = GenerationRequest::text("general", "hi").with_backends(["b", "a"]);

        let eligible = dispatcher.eligible(&request).await.expect("eligible");
        assert_eq!(eligible[0].id, "b");
        let selected = dispatcher.select(&eligible).expect("selection");
        assert_eq!(selected.id, "a");
    }

    #[tokio::test]
    async fn disabled_balancing_follows_declared_order() {
        let config = OrchestratorConfig {
            load_balancing: false,
            ..OrchestratorConfig::default()
        };
        let dispatcher = dispatcher_with(
            vec![
                (MockBackend::named("a"), BackendConfig::mock("a")),
                (MockBackend::named("b"), BackendConfig::mock("b")),
            ],
            config,
        )
        .await;
        let request = GenerationRequest::text("general", "hi").with_backends(["b", "a"]);

        let eligible = dispatcher.eligible(&request).await.expect("eligible");
        let _busy = eligible[0].begin();
        let selected = dispatcher.select(&eligible).expect("selection");
        assert_eq!(selected.id, "b");
    }

    #[tokio::test]
    async fn saturated_backend_yields_to_one_with_headroom() {
        let dispatcher = dispatcher_with(
            vec![
                (MockBackend::named("a"), BackendConfig::mock("a").with_capacity(1)),
                (MockBackend::named("b"), BackendConfig::mock("b")),
            ],
            OrchestratorConfig::default(),
        )
        .await;
        let request = GenerationRequest::text("general", "hi");

        let eligible = dispatcher.eligible(&request).await.expect("eligible");
        let _a = eligible[0].begin();
        let _b = [eligible[1].begin(), eligible[1].begin()];
        let selected = dispatcher.select(&eligible).expect("selection");
        assert_eq!(selected.id, "b");
    }

    #[tokio::test]
    async fn image_request_without_image_backend_fails() {
        let dispatcher = dispatcher_with(
            vec![(MockBackend::named("text-only"), BackendConfig::mock("text-only"))],
            OrchestratorConfig::default(),
        )
        .await;
        let request = GenerationRequest::new(
            "portfolio_review",
            vec![ContentPart::image("image/png", "AAAA")],
        );

        let error = dispatcher
            .execute(&request)
            .await
            .expect_err("no backend handles images");
        assert!(matches!(
            error,
            OrchestratorError::NoCapableBackend { ref modalities }
                if *modalities == BTreeSet::from([Modality::Image])
        ));
    }

    #[tokio::test]
    async fn retryable_failures_back_off_then_succeed() {
        let backend = MockBackend::named("flaky").with_reply("done");
        backend.fail_next(BackendError::RateLimited("slow down".to_owned()));
        backend.fail_next(BackendError::Network("reset".to_owned()));
        let dispatcher = dispatcher_with(
            vec![(backend.clone(), BackendConfig::mock("flaky"))],
            fast_retry(),
        )
        .await;

        let response = dispatcher
            .execute(&GenerationRequest::text("general", "hi"))
            .await
            .expect("dispatch should succeed");

        assert!(response.success);
        assert_eq!(response.attempts, 3);
        assert_eq!(response.text(), Some("done"));
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn non_retryable_failure_returns_failed_response() {
        let backend = MockBackend::named("blocked")
            .failing(BackendError::SafetyBlocked("policy".to_owned()));
        let dispatcher = dispatcher_with(
            vec![(backend.clone(), BackendConfig::mock("blocked"))],
            fast_retry(),
        )
        .await;

        let response = dispatcher
            .execute(&GenerationRequest::text("general", "hi"))
            .await
            .expect("failures are captured as responses");

        assert!(!response.success);
        assert_eq!(response.attempts, 1);
        assert!(matches!(response.error, Some(BackendError::SafetyBlocked(_))));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let backend = MockBackend::named("slow").with_latency(Duration::from_millis(200));
        let config = OrchestratorConfig {
            retry: RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
            ..OrchestratorConfig::default()
        };
        let dispatcher =
            dispatcher_with(vec![(backend, BackendConfig::mock("slow"))], config).await;
        let request = GenerationRequest::text("general", "hi").with_options(RequestOptions {
            timeout_ms: Some(20),
            ..RequestOptions::default()
        });

        let response = dispatcher.execute(&request).await.expect("captured");
        assert!(matches!(response.error, Some(BackendError::Timeout(_))));
    }

    #[tokio::test]
    async fn unknown_model_override_is_unsupported() {
        let dispatcher = dispatcher_with(
            vec![(MockBackend::named("a"), BackendConfig::mock("a"))],
            OrchestratorConfig::default(),
        )
        .await;
        let request = GenerationRequest::text("general", "hi").with_options(RequestOptions {
            model: Some("gpt-17".to_owned()),
            ..RequestOptions::default()
        });

        let response = dispatcher.execute(&request).await.expect("captured");
        assert!(!response.success);
        assert!(matches!(response.error, Some(BackendError::Unsupported(_))));
    }

    #[tokio::test]
    async fn target_backend_narrows_eligibility() {
        let dispatcher = dispatcher_with(
            vec![
                (MockBackend::named("a"), BackendConfig::mock("a")),
                (MockBackend::named("b"), BackendConfig::mock("b")),
            ],
            OrchestratorConfig::default(),
        )
        .await;
        let request = GenerationRequest::text("general", "hi").with_options(RequestOptions {
            target_backend: Some("b".to_owned()),
            ..RequestOptions::default()
        });

        let response = dispatcher.execute(&request).await.expect("dispatch");
        assert_eq!(response.backend, "b");
    }
}
