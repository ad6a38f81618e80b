use std::time::Duration;

use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Registry,
    TextEncoder,
};

use crate::{
    models::{ExecutionMode, Usage},
    registry::{BackendStatus, HealthStatus},
};

#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    inflight_requests: IntGauge,
    backend_requests_total: IntCounterVec,
    backend_latency_seconds: HistogramVec,
    backend_active_requests: IntGaugeVec,
    backend_health: IntGaugeVec,
    tokens_total: IntCounterVec,
    races_total: IntCounterVec,
    streams_total: IntCounterVec,
}

pub struct InflightGuard<'a> {
    metrics: &'a AppMetrics,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            opts!(
                "orchestrator_http_requests_total",
                "Total HTTP requests processed by the orchestrator"
            ),
            &["path", "method", "status", "stream"],
        )
        .expect("valid http_requests_total metric");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "orchestrator_http_request_duration_seconds",
                "HTTP request latency in seconds",
            ),
            &["path", "method", "stream"],
        )
        .expect("valid http_request_duration_seconds metric");

        let inflight_requests = IntGauge::new(
            "orchestrator_inflight_requests",
            "Current in-flight HTTP requests",
        )
        .expect("valid inflight_requests metric");

        let backend_requests_total = IntCounterVec::new(
            opts!(
                "orchestrator_backend_requests_total",
                "Backend calls by outcome (ok or an error label)"
            ),
            &["backend", "outcome"],
        )
        .expect("valid backend_requests_total metric");

        let backend_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "orchestrator_backend_latency_seconds",
                "Backend call latency in seconds",
            ),
            &["backend", "mode"],
        )
        .expect("valid backend_latency_seconds metric");

        let backend_active_requests = IntGaugeVec::new(
            opts!(
                "orchestrator_backend_active_requests",
                "Requests currently in flight per backend"
            ),
            &["backend"],
        )
        .expect("valid backend_active_requests metric");

        let backend_health = IntGaugeVec::new(
            opts!(
                "orchestrator_backend_health",
                "Backend health: 2 healthy, 1 degraded, 0 down"
            ),
            &["backend"],
        )
        .expect("valid backend_health metric");

        let tokens_total = IntCounterVec::new(
            opts!(
                "orchestrator_tokens_total",
                "Token accounting aggregated by backend and type"
            ),
            &["backend", "kind"],
        )
        .expect("valid tokens_total metric");

        let races_total = IntCounterVec::new(
            opts!(
                "orchestrator_races_total",
                "Concurrent races by outcome"
            ),
            &["outcome"],
        )
        .expect("valid races_total metric");

        let streams_total = IntCounterVec::new(
            opts!(
                "orchestrator_streams_total",
                "Streaming sessions by outcome"
            ),
            &["backend", "outcome"],
        )
        .expect("valid streams_total metric");

        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("register http_requests_total");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("register http_request_duration_seconds");
        registry
            .register(Box::new(inflight_requests.clone()))
            .expect("register inflight_requests");
        registry
            .register(Box::new(backend_requests_total.clone()))
            .expect("register backend_requests_total");
        registry
            .register(Box::new(backend_latency_seconds.clone()))
            .expect("register backend_latency_seconds");
        registry
            .register(Box::new(backend_active_requests.clone()))
            .expect("register backend_active_requests");
        registry
            .register(Box::new(backend_health.clone()))
            .expect("register backend_health");
        registry
            .register(Box::new(tokens_total.clone()))
            .expect("register tokens_total");
        registry
            .register(Box::new(races_total.clone()))
            .expect("register races_total");
        registry
            .register(Box::new(streams_total.clone()))
            .expect("register streams_total");

        Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            inflight_requests,
            backend_requests_total,
            backend_latency_seconds,
            backend_active_requests,
            backend_health,
            tokens_total,
            races_total,
            streams_total,
        }
    }

    pub fn inflight_guard(&self) -> InflightGuard<'_> {
        self.inflight_requests.inc();
        InflightGuard { metrics: self }
    }

    pub fn observe_request(
        &self,
        path: &str,
        method: &str,
        stream: bool,
        status: u16,
        duration: Duration,
    ) {
        let stream_label = if stream { "true" } else { "false" };
        let status_label = status.to_string();
        self.http_requests_total
            .with_label_values(&[path, method, &status_label, stream_label])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[path, method, stream_label])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_backend_call(
        &self,
        backend: &str,
        mode: ExecutionMode,
        outcome: &str,
        latency: Duration,
    ) {
        self.backend_requests_total
            .with_label_values(&[backend, outcome])
            .inc();
        self.backend_latency_seconds
            .with_label_values(&[backend, mode.as_str()])
            .observe(latency.as_secs_f64());
    }

    pub fn observe_usage(&self, backend: &str, usage: &Usage) {
        self.tokens_total
            .with_label_values(&[backend, "input"])
            .inc_by(u64::from(usage.input_tokens));
        self.tokens_total
            .with_label_values(&[backend, "output"])
            .inc_by(u64::from(usage.output_tokens));
        self.tokens_total
            .with_label_values(&[backend, "total"])
            .inc_by(u64::from(usage.total_tokens));
    }

    pub fn observe_race(&self, won: bool) {
        let outcome = if won { "won" } else { "all_failed" };
        self.races_total.with_label_values(&[outcome]).inc();
    }

    pub fn observe_stream(&self, backend: &str, outcome: &str) {
        self.streams_total
            .with_label_values(&[backend, outcome])
            .inc();
    }

    /// Refreshes the per-backend gauges from a registry snapshot.
    pub fn observe_backends(&self, statuses: &[BackendStatus]) {
        for status in statuses {
            self.backend_active_requests
                .with_label_values(&[&status.id])
                .set(status.active_requests as i64);
            let health = match status.status {
                HealthStatus::Healthy => 2,
                HealthStatus::Degraded => 1,
                HealthStatus::Down => 0,
            };
            self.backend_health
                .with_label_values(&[&status.id])
                .set(health);
        }
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.inflight_requests.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_calls_show_up_in_exposition() {
        let metrics = AppMetrics::new();
        metrics.observe_backend_call(
            "mock-a",
            ExecutionMode::Sequential,
            "ok",
            Duration::from_millis(12),
        );
        metrics.observe_usage("mock-a", &Usage::new(3, 4));
        metrics.observe_race(true);

        let rendered = metrics.render().expect("metrics should render");
        assert!(rendered.contains("orchestrator_backend_requests_total{backend=\"mock-a\",outcome=\"ok\"} 1"));
        assert!(rendered.contains("orchestrator_tokens_total{backend=\"mock-a\",kind=\"total\"} 7"));
        assert!(rendered.contains("orchestrator_races_total{outcome=\"won\"} 1"));
    }
}
