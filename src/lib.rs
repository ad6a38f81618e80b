pub mod backend;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod performance;
pub mod registry;
pub mod state;
pub mod streaming;
pub mod telemetry;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use config::{backend_configs_from_store, BackendConfig, OrchestratorConfig};
use credentials::CredentialStore;
use errors::OrchestratorError;
use orchestrator::Orchestrator;
use tracing::info;

/// Orchestrator configured from the environment, falling back to two mock backends when no
/// real backend is configured.
pub async fn build_orchestrator() -> Result<Arc<Orchestrator>, OrchestratorError> {
    let store = CredentialStore::from_env();
    let mut configs = backend_configs_from_store(&store).await;
    if configs.is_empty() {
        info!("no backend credentials found; using mock backends");
        configs = vec![BackendConfig::mock("mock-a"), BackendConfig::mock("mock-b")];
    }

    let backend_names = configs
        .iter()
        .map(|config| config.id.as_str())
        .collect::<Vec<_>>()
        .join(",");
    let orchestrator = Arc::new(Orchestrator::new(OrchestratorConfig::from_env()));
    let summary = orchestrator.initialize(configs).await?;
    orchestrator.start_health_monitor();
    info!(
        credentials = store.kind(),
        backends = %backend_names,
        healthy = summary.healthy_count,
        "orchestrator configured"
    );
    Ok(orchestrator)
}

pub async fn build_state() -> Result<state::AppState, OrchestratorError> {
    Ok(state::AppState::new(build_orchestrator().await?))
}

pub fn build_app(state: state::AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/v1/generate", post(handlers::generate))
        .route("/v1/generate/stream", post(handlers::generate_stream))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/models/switch", post(handlers::switch_model))
        .route("/v1/health", get(handlers::health))
        .route("/v1/performance", get(handlers::performance))
        .with_state(state)
}
