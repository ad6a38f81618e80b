use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::{
    backend::{AiBackend, BackendAdapter, BackendKind},
    config::BackendConfig,
    credentials,
    errors::OrchestratorError,
    models::Modality,
};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
        }
    }

    /// Whether dispatch may route to a backend in this state.
    pub fn is_available(&self) -> bool {
        !matches!(self, HealthStatus::Down)
    }
}

#[derive(Debug, Clone)]
pub struct HealthState {
    pub status: HealthStatus,
    pub initialized: bool,
    pub last_probe_at_ms: Option<u64>,
    pub last_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_error: Option<String>,
}

impl HealthState {
    fn registered(initialized: bool) -> Self {
        Self {
            status: if initialized {
                HealthStatus::Healthy
            } else {
                HealthStatus::Down
            },
            initialized,
            last_probe_at_ms: None,
            last_latency_ms: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_error: None,
        }
    }
}

/// Point-in-time view of one registered backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub id: String,
    pub kind: BackendKind,
    pub capabilities: Vec<Modality>,
    pub model: String,
    pub status: HealthStatus,
    pub initialized: bool,
    pub last_probe_at_ms: Option<u64>,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
    pub active_requests: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct HealthOverview {
    pub healthy_count: usize,
    pub total_count: usize,
    pub percentage: f64,
}

pub struct BackendEntry {
    pub id: String,
    pub order: usize,
    pub adapter: BackendAdapter,
    pub capabilities: BTreeSet<Modality>,
    pub capacity: Option<usize>,
    active: AtomicUsize,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    pub(crate) health: Mutex<HealthState>,
}

impl BackendEntry {
    pub fn can_handle(&self, modalities: &BTreeSet<Modality>) -> bool {
        modalities.is_subset(&self.capabilities)
    }

    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::SeqCst)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::SeqCst)
    }

    pub fn at_capacity(&self) -> bool {
        self.capacity
            .is_some_and(|capacity| self.active_requests() >= capacity)
    }

    pub fn increment_active(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.total_requests.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the active counter, clamping at zero.
    pub fn decrement_active(&self) {
        let result = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(1)
            });
        if result.is_err() {
            warn!(backend = %self.id, "active request counter would underflow; clamped at zero");
        }
    }

    pub fn record_error(&self) {
        self.total_errors.fetch_add(1, Ordering::SeqCst);
    }

    /// Counts one in-flight request until the returned guard drops.
    pub fn begin(self: &Arc<Self>) -> ActiveGuard {
        self.increment_active();
        ActiveGuard {
            entry: Arc::clone(self),
        }
    }

    pub async fn health(&self) -> HealthState {
        self.health.lock().await.clone()
    }

    pub async fn is_available(&self) -> bool {
        let health = self.health.lock().await;
        health.initialized && health.status.is_available()
    }

    pub async fn status(&self) -> BackendStatus {
        let health = self.health().await;
        BackendStatus {
            id: self.id.clone(),
            kind: self.adapter.kind(),
            capabilities: self.capabilities.iter().copied().collect(),
            model: self.adapter.current_model(),
            status: health.status,
            initialized: health.initialized,
            last_probe_at_ms: health.last_probe_at_ms,
            last_latency_ms: health.last_latency_ms,
            last_error: health.last_error,
            active_requests: self.active_requests(),
            total_requests: self.total_requests(),
            total_errors: self.total_errors(),
            capacity: self.capacity,
        }
    }
}

/// Keeps a backend's active counter raised for the lifetime of one call, whatever its outcome.
pub struct ActiveGuard {
    entry: Arc<BackendEntry>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.entry.decrement_active();
    }
}

#[derive(Default)]
pub struct BackendRegistry {
    entries: RwLock<Vec<Arc<BackendEntry>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend. One without a usable credential is kept, marked down and uninitialized.
    pub async fn register(
        &self,
        adapter: BackendAdapter,
        config: &BackendConfig,
    ) -> Result<Arc<BackendEntry>, OrchestratorError> {
        let mut entries = self.entries.write().await;
        if entries.iter().any(|entry| entry.id == config.id) {
            return Err(OrchestratorError::DuplicateBackend(config.id.clone()));
        }

        let initialized = adapter.has_credential();
        let capabilities = config
            .capabilities
            .as_ref()
            .map(|declared| declared.iter().copied().collect())
            .unwrap_or_else(|| adapter.capabilities());
        let entry = Arc::new(BackendEntry {
            id: config.id.clone(),
            order: entries.len(),
            capabilities,
            capacity: config.capacity,
            active: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            health: Mutex::new(HealthState::registered(initialized)),
            adapter,
        });

        if initialized {
            info!(
                backend = %entry.id,
                kind = %entry.adapter.kind(),
                model = %entry.adapter.current_model(),
                credential = %config.credential().map(credentials::fingerprint).unwrap_or_else(|| "none".to_owned()),
                capacity = ?entry.capacity,
                "backend registered"
            );
        } else {
            warn!(
                backend = %entry.id,
                kind = %entry.adapter.kind(),
                "backend registered without credential; marked down"
            );
        }

        entries.push(Arc::clone(&entry));
        Ok(entry)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<BackendEntry>> {
        self.entries
            .read()
            .await
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }

    pub async fn status(&self, id: &str) -> Option<BackendStatus> {
        match self.get(id).await {
            Some(entry) => Some(entry.status().await),
            None => None,
        }
    }

    /// All entries in registration order.
    pub async fn entries(&self) -> Vec<Arc<BackendEntry>> {
        self.entries.read().await.clone()
    }

    /// Drops every entry. Used to roll back an initialization that left nothing usable.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn statuses(&self) -> Vec<BackendStatus> {
        let mut statuses = Vec::new();
        for entry in self.entries().await {
            statuses.push(entry.status().await);
        }
        statuses
    }

    /// Available backends whose capability set covers `modalities`, in registration order.
    pub async fn list_healthy_capable(
        &self,
        modalities: &BTreeSet<Modality>,
    ) -> Vec<Arc<BackendEntry>> {
        let mut capable = Vec::new();
        for entry in self.entries().await {
            if entry.can_handle(modalities) && entry.is_available().await {
                capable.push(entry);
            }
        }
        capable
    }

    pub async fn increment_active(&self, id: &str) -> Result<(), OrchestratorError> {
        let entry = self
            .get(id)
            .await
            .ok_or_else(|| OrchestratorError::UnknownBackend(id.to_owned()))?;
        entry.increment_active();
        Ok(())
    }

    pub async fn decrement_active(&self, id: &str) -> Result<(), OrchestratorError> {
        let entry = self
            .get(id)
            .await
            .ok_or_else(|| OrchestratorError::UnknownBackend(id.to_owned()))?;
        entry.decrement_active();
        Ok(())
    }

    pub async fn health_overview(&self) -> HealthOverview {
        let entries = self.entries().await;
        let total_count = entries.len();
        let mut healthy_count = 0;
        for entry in &entries {
            if entry.health.lock().await.status == HealthStatus::Healthy {
                healthy_count += 1;
            }
        }
        let percentage = if total_count == 0 {
            0.0
        } else {
            healthy_count as f64 * 100.0 / total_count as f64
        };

        HealthOverview {
            healthy_count,
            total_count,
            percentage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{mock::MockBackend, openai::OpenAiAdapter};

    async fn registry_with(ids: &[&str]) -> BackendRegistry {
        let registry = BackendRegistry::new();
        for id in ids {
            registry
                .register(
                    MockBackend::named(*id).into(),
                    &BackendConfig::mock(*id),
                )
                .await
                .expect("registration should succeed");
        }
        registry
    }

    #[tokio::test]
    async fn missing_credential_registers_as_down() {
        let registry = BackendRegistry::new();
        let config = BackendConfig::new("openai", BackendKind::OpenAi);
        let adapter = OpenAiAdapter::new(&config).expect("adapter should build");
        registry
            .register(BackendAdapter::OpenAi(adapter), &config)
            .await
            .expect("registration should succeed");

        let status = registry.status("openai").await.expect("status should exist");
        assert_eq!(status.status, HealthStatus::Down);
        assert!(!status.initialized);
        assert!(registry
            .list_healthy_capable(&BTreeSet::from([Modality::Text]))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let registry = registry_with(&["alpha"]).await;
        let error = registry
            .register(MockBackend::named("alpha").into(), &BackendConfig::mock("alpha"))
            .await
            .err()
            .expect("duplicate should fail");
        assert!(matches!(error, OrchestratorError::DuplicateBackend(_)));
    }

    #[tokio::test]
    async fn decrement_clamps_at_zero() {
        let registry = registry_with(&["alpha"]).await;
        registry
            .decrement_active("alpha")
            .await
            .expect("known backend");
        let entry = registry.get("alpha").await.expect("entry");
        assert_eq!(entry.active_requests(), 0);

        registry
            .increment_active("alpha")
            .await
            .expect("known backend");
        assert_eq!(entry.active_requests(), 1);
        assert_eq!(entry.total_requests(), 1);
    }

    #[tokio::test]
    async fn guard_restores_counter_on_drop() {
        let registry = registry_with(&["alpha"]).await;
        let entry = registry.get("alpha").await.expect("entry");
        {
            let _first = entry.begin();
            let _second = entry.begin();
            assert_eq!(entry.active_requests(), 2);
        }
        assert_eq!(entry.active_requests(), 0);
    }

    #[tokio::test]
    async fn configured_capabilities_override_adapter_defaults() {
        let registry = BackendRegistry::new();
        registry
            .register(
                MockBackend::named("vision").into(),
                &BackendConfig::mock("vision").with_capabilities(&[Modality::Text, Modality::Image]),
            )
            .await
            .expect("registration should succeed");

        let capable = registry
            .list_healthy_capable(&BTreeSet::from([Modality::Image]))
            .await;
        assert_eq!(capable.len(), 1);
        assert_eq!(capable[0].id, "vision");
    }

    #[tokio::test]
    async fn overview_counts_only_healthy_backends() {
        let registry = registry_with(&["alpha", "beta"]).await;
        registry
            .get("beta")
            .await
            .expect("entry")
            .health
            .lock()
            .await
            .status = HealthStatus::Down;

        let overview = registry.health_overview().await;
        assert_eq!(overview.healthy_count, 1);
        assert_eq!(overview.total_count, 2);
        assert!((overview.percentage - 50.0).abs() < f64::EPSILON);
    }
}
