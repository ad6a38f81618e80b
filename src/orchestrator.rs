use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use serde::Serialize;
use tokio::{sync::broadcast, time::Instant};
use tracing::{info, warn};

use crate::{
    backend::{AiBackend, BackendAdapter},
    config::{BackendConfig, OrchestratorConfig},
    coordinator::Coordinator,
    dispatcher::Dispatcher,
    errors::OrchestratorError,
    events::OrchestratorEvent,
    health::{HealthMetrics, HealthMonitor, HealthMonitorHandle},
    metrics::AppMetrics,
    models::{ExecutionMode, GenerationRequest, GenerationResponse, ModelInfo},
    performance::{PerformanceRecord, PerformanceReport},
    registry::{BackendRegistry, BackendStatus, HealthOverview},
    streaming::{StreamCallbacks, StreamHandle, StreamManager},
    telemetry::Telemetry,
};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct InitSummary {
    pub success: bool,
    pub healthy_count: usize,
    pub total_count: usize,
}

/// An explicitly constructed orchestrator. Independent instances share no state.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<BackendRegistry>,
    telemetry: Arc<Telemetry>,
    dispatcher: Dispatcher,
    coordinator: Coordinator,
    streams: StreamManager,
    monitor: Arc<HealthMonitor>,
    monitor_handle: Mutex<Option<HealthMonitorHandle>>,
    initialized: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_metrics(config, AppMetrics::new())
    }

    pub fn with_metrics(config: OrchestratorConfig, metrics: AppMetrics) -> Self {
        let registry = Arc::new(BackendRegistry::new());
        let telemetry = Arc::new(Telemetry::new(
            config.performance_window,
            config.event_capacity,
            metrics,
        ));
        let dispatcher = Dispatcher::new(Arc::clone(&registry), Arc::clone(&telemetry), &config);
        let coordinator = Coordinator::new(Arc::clone(&telemetry), config.detach_race_losers);
        let streams = StreamManager::new(dispatcher.clone(), Arc::clone(&telemetry));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&telemetry),
            config.health,
        ));

        Self {
            config,
            registry,
            telemetry,
            dispatcher,
            coordinator,
            streams,
            monitor,
            monitor_handle: Mutex::new(None),
            initialized: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Builds an adapter per config and registers it. Fails only when no backend is usable, in
    /// which case nothing stays registered and initialization may be retried.
    pub async fn initialize(
        &self,
        configs: Vec<BackendConfig>,
    ) -> Result<InitSummary, OrchestratorError> {
        let mut backends = Vec::with_capacity(configs.len());
        let mut unbuildable = 0;
        for config in configs {
            match BackendAdapter::from_config(&config) {
                Ok(adapter) => backends.push((config, adapter)),
                Err(error) => {
                    unbuildable += 1;
                    warn!(backend = %config.id, %error, "backend adapter could not be built");
                }
            }
        }
        self.register_all(backends, unbuildable).await
    }

    /// Registers pre-built adapters, e.g. scripted mocks.
    pub async fn initialize_with(
        &self,
        backends: Vec<(BackendConfig, BackendAdapter)>,
    ) -> Result<InitSummary, OrchestratorError> {
        self.register_all(backends, 0).await
    }

    async fn register_all(
        &self,
        backends: Vec<(BackendConfig, BackendAdapter)>,
        unbuildable: usize,
    ) -> Result<InitSummary, OrchestratorError> {
        let _init = self.init_lock.lock().await;
        if self.is_initialized() {
            return Err(OrchestratorError::AlreadyInitialized);
        }

        let mut seen = BTreeSet::new();
        for (config, _) in &backends {
            if !seen.insert(config.id.as_str()) {
                return Err(OrchestratorError::DuplicateBackend(config.id.clone()));
            }
        }

        for (config, adapter) in backends {
            if let Err(error) = self.registry.register(adapter, &config).await {
                self.registry.clear().await;
                return Err(error);
            }
        }

        let overview = self.registry.health_overview().await;
        let total_count = overview.total_count + unbuildable;
        if overview.healthy_count == 0 {
            warn!(total = total_count, "no backend became healthy; registrations rolled back");
            self.registry.clear().await;
            return Err(OrchestratorError::NoHealthyBackends { total: total_count });
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!(
            healthy = overview.healthy_count,
            total = total_count,
            "orchestrator initialized"
        );
        self.telemetry.emit(OrchestratorEvent::Initialized {
            healthy_count: overview.healthy_count,
            total_count,
        });

        Ok(InitSummary {
            success: true,
            healthy_count: overview.healthy_count,
            total_count,
        })
    }

    fn ensure_initialized(&self) -> Result<(), OrchestratorError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(OrchestratorError::NotInitialized)
        }
    }

    /// One logical call, sequential or raced per `request.mode`. Adapter failures come back as
    /// `success: false`; orchestrator-level problems and all-failed races as errors.
    pub async fn execute_request(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, OrchestratorError> {
        self.ensure_initialized()?;
        let started = Instant::now();
        info!(
            request_id = %request.id,
            task = %request.task,
            mode = request.mode.as_str(),
            modalities = %crate::models::format_modalities(&request.modalities),
            "request received"
        );
        self.telemetry.emit(OrchestratorEvent::RequestStarted {
            request_id: request.id.clone(),
            task: request.task.clone(),
            mode: request.mode,
        });

        let result = match request.mode {
            ExecutionMode::Sequential => self.dispatcher.execute(&request).await,
            ExecutionMode::Concurrent => self.execute_concurrent(&request).await,
        };

        self.telemetry.emit(OrchestratorEvent::RequestCompleted {
            request_id: request.id.clone(),
            backend: result.as_ref().ok().map(|response| response.backend.clone()),
            success: result.as_ref().is_ok_and(|response| response.success),
            latency_ms: started.elapsed().as_millis() as u64,
        });
        result
    }

    async fn execute_concurrent(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, OrchestratorError> {
        let eligible = self.dispatcher.eligible(request).await?;
        if let [single] = eligible.as_slice() {
            info!(
                request_id = %request.id,
                backend = %single.id,
                "one eligible backend; running sequentially"
            );
            return Ok(self.dispatcher.execute_on(single, request).await);
        }
        let limit = self.dispatcher.call_timeout(request);
        self.coordinator.race(request, eligible, limit).await
    }

    pub async fn stream_request(
        &self,
        request: GenerationRequest,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> Result<StreamHandle, OrchestratorError> {
        self.ensure_initialized()?;
        self.streams.start(request, callbacks).await
    }

    /// Every registered backend's catalog; the active model of each is flagged.
    pub async fn list_models(&self) -> Vec<ModelInfo> {
        self.registry
            .entries()
            .await
            .iter()
            .flat_map(|entry| entry.adapter.models())
            .collect()
    }

    pub async fn switch_model(&self, backend: &str, model: &str) -> bool {
        self.try_switch_model(backend, model).await.is_ok()
    }

    pub async fn try_switch_model(
        &self,
        backend: &str,
        model: &str,
    ) -> Result<(), OrchestratorError> {
        let entry = self
            .registry
            .get(backend)
            .await
            .ok_or_else(|| OrchestratorError::UnknownBackend(backend.to_owned()))?;
        if !entry.adapter.switch_model(model) {
            return Err(OrchestratorError::UnknownModel {
                backend: backend.to_owned(),
                model: model.to_owned(),
            });
        }

        info!(backend, model, "active model switched");
        self.telemetry.emit(OrchestratorEvent::ModelSwitched {
            backend: backend.to_owned(),
            model: model.to_owned(),
        });
        Ok(())
    }

    pub async fn health_overview(&self) -> HealthOverview {
        self.registry.health_overview().await
    }

    pub async fn performance_records(&self) -> Vec<PerformanceRecord> {
        self.telemetry.performance.records().await
    }

    pub async fn performance_report(&self) -> PerformanceReport {
        PerformanceReport {
            records: self.telemetry.performance.records().await,
            backends: self.telemetry.performance.summarize().await,
            health: self.registry.health_overview().await,
        }
    }

    pub async fn backend_status(&self, backend: &str) -> Option<BackendStatus> {
        self.registry.status(backend).await
    }

    pub async fn backend_statuses(&self) -> Vec<BackendStatus> {
        self.registry.statuses().await
    }

    /// Runs one probe round immediately.
    pub async fn check_health_now(&self) -> Vec<HealthMetrics> {
        self.monitor.check_once().await
    }

    /// Returns `false` when the monitor is already running.
    pub fn start_health_monitor(&self) -> bool {
        let mut handle = self.monitor_slot();
        if handle.as_ref().is_some_and(HealthMonitorHandle::is_running) {
            return false;
        }
        *handle = Some(Arc::clone(&self.monitor).spawn());
        true
    }

    pub fn stop_health_monitor(&self) -> bool {
        match self.monitor_slot().take() {
            Some(handle) => {
                handle.stop();
                info!("health monitor stopped");
                true
            }
            None => false,
        }
    }

    fn monitor_slot(&self) -> MutexGuard<'_, Option<HealthMonitorHandle>> {
        self.monitor_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.telemetry.subscribe()
    }

    pub fn metrics(&self) -> &AppMetrics {
        &self.telemetry.metrics
    }

    pub async fn render_metrics(&self) -> Result<String, String> {
        let statuses = self.registry.statuses().await;
        self.telemetry.metrics.observe_backends(&statuses);
        self.telemetry.metrics.render()
    }
}
