use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::registry::HealthOverview;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PerformanceRecord {
    pub timestamp_ms: u64,
    pub backend: String,
    pub model: String,
    pub task: String,
    pub latency_ms: u64,
    pub cost: f64,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackendPerformance {
    pub backend: String,
    pub calls: usize,
    pub successes: usize,
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub average_cost: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub records: Vec<PerformanceRecord>,
    pub backends: Vec<BackendPerformance>,
    pub health: HealthOverview,
}

/// Rolling window of the most recent calls. The oldest entry is evicted once the window is full.
pub struct PerformanceLog {
    window: usize,
    records: Mutex<VecDeque<PerformanceRecord>>,
}

impl PerformanceLog {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            records: Mutex::new(VecDeque::with_capacity(window)),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub async fn record(&self, record: PerformanceRecord) {
        let mut records = self.records.lock().await;
        while records.len() >= self.window {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Oldest first.
    pub async fn records(&self) -> Vec<PerformanceRecord> {
        self.records.lock().await.iter().cloned().collect()
    }

    pub async fn summarize(&self) -> Vec<BackendPerformance> {
        let records = self.records.lock().await;
        let mut grouped: BTreeMap<&str, Vec<&PerformanceRecord>> = BTreeMap::new();
        for record in records.iter() {
            grouped.entry(record.backend.as_str()).or_default().push(record);
        }

        grouped
            .into_iter()
            .map(|(backend, entries)| {
                let calls = entries.len();
                let successes = entries.iter().filter(|record| record.success).count();
                let total_latency: u64 = entries.iter().map(|record| record.latency_ms).sum();
                let total_cost: f64 = entries.iter().map(|record| record.cost).sum();
                BackendPerformance {
                    backend: backend.to_owned(),
                    calls,
                    successes,
                    success_rate: successes as f64 / calls as f64,
                    average_latency_ms: total_latency as f64 / calls as f64,
                    average_cost: total_cost / calls as f64,
                }
            })
            .collect()
    }
}
