use std::sync::Arc;

use crate::{metrics::AppMetrics, orchestrator::Orchestrator};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub metrics: AppMetrics,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let metrics = orchestrator.metrics().clone();
        Self {
            orchestrator,
            metrics,
        }
    }
}
