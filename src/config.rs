use std::{env, time::Duration};

use crate::{
    backend::BackendKind,
    credentials::CredentialStore,
    models::Modality,
};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub load_balancing: bool,
    pub default_timeout: Duration,
    pub retry: RetryPolicy,
    pub detach_race_losers: bool,
    pub performance_window: usize,
    pub event_capacity: usize,
    pub health: HealthConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            load_balancing: true,
            default_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            detach_race_losers: false,
            performance_window: 100,
            event_capacity: 256,
            health: HealthConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            load_balancing: read_bool("ORCH_LOAD_BALANCING", defaults.load_balancing),
            default_timeout: Duration::from_millis(read_u64(
                "ORCH_DEFAULT_TIMEOUT_MS",
                defaults.default_timeout.as_millis() as u64,
            )),
            retry: RetryPolicy::from_env(),
            detach_race_losers: read_bool("ORCH_DETACH_RACE_LOSERS", defaults.detach_race_losers),
            performance_window: read_u64(
                "ORCH_PERFORMANCE_WINDOW",
                defaults.performance_window as u64,
            )
            .max(1) as usize,
            event_capacity: read_u64("ORCH_EVENT_CAPACITY", defaults.event_capacity as u64)
                .max(1) as usize,
            health: HealthConfig::from_env(),
        }
    }
}

/// Bounded exponential backoff for the single-backend path.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: read_u32("ORCH_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            base_delay: Duration::from_millis(read_u64(
                "ORCH_BACKOFF_BASE_MS",
                defaults.base_delay.as_millis() as u64,
            )),
            max_delay: Duration::from_millis(read_u64(
                "ORCH_BACKOFF_MAX_MS",
                defaults.max_delay.as_millis() as u64,
            )),
        }
    }

    /// Delay before retry number `attempt` (1-based count of failed attempts so far).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub degraded_latency: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            failure_threshold: 1,
            recovery_threshold: 1,
            degraded_latency: Duration::from_secs(5),
        }
    }
}

impl HealthConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: Duration::from_secs(
                read_u64("ORCH_HEALTH_INTERVAL_SECS", defaults.interval.as_secs()).max(1),
            ),
            probe_timeout: Duration::from_millis(read_u64(
                "ORCH_HEALTH_PROBE_TIMEOUT_MS",
                defaults.probe_timeout.as_millis() as u64,
            )),
            failure_threshold: read_u32(
                "ORCH_HEALTH_FAILURE_THRESHOLD",
                defaults.failure_threshold,
            )
            .max(1),
            recovery_threshold: read_u32(
                "ORCH_HEALTH_RECOVERY_THRESHOLD",
                defaults.recovery_threshold,
            )
            .max(1),
            degraded_latency: Duration::from_millis(read_u64(
                "ORCH_HEALTH_DEGRADED_LATENCY_MS",
                defaults.degraded_latency.as_millis() as u64,
            )),
        }
    }
}

/// Settings for one backend as supplied to `initialize`.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub id: String,
    pub kind: BackendKind,
    pub credential: Option<String>,
    pub models: Vec<String>,
    pub base_url: Option<String>,
    pub capacity: Option<usize>,
    pub capabilities: Option<Vec<Modality>>,
    pub request_timeout: Duration,
}

impl BackendConfig {
    pub fn new(id: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            id: id.into(),
            kind,
            credential: None,
            models: Vec::new(),
            base_url: None,
            capacity: None,
            capabilities: None,
            request_timeout: Duration::from_secs(120),
        }
    }

    pub fn mock(id: impl Into<String>) -> Self {
        Self::new(id, BackendKind::Mock)
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[Modality]) -> Self {
        self.capabilities = Some(capabilities.to_vec());
        self
    }

    /// Credential with surrounding whitespace removed; blank values count as absent.
    pub fn credential(&self) -> Option<&str> {
        self.credential
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub async fn from_store(kind: BackendKind, store: &CredentialStore) -> Self {
        let prefix = env_prefix(kind);
        let mut config = Self::new(kind.as_str(), kind);
        config.credential = store.get(&format!("{prefix}_API_KEY")).await;
        config.models = store
            .get(&format!("{prefix}_MODELS"))
            .await
            .map(|value| split_list(&value))
            .unwrap_or_default();
        config.base_url = store
            .get(&format!("{prefix}_BASE_URL"))
            .await
            .map(|value| value.trim_end_matches('/').to_owned())
            .filter(|value| !value.is_empty());
        config.capacity = store
            .get(&format!("{prefix}_CAPACITY"))
            .await
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|value| *value > 0);
        if let Some(timeout_secs) = store
            .get(&format!("{prefix}_TIMEOUT_SECS"))
            .await
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|value| *value > 0)
        {
            config.request_timeout = Duration::from_secs(timeout_secs);
        }
        config
    }
}

/// Backends listed in `ORCH_BACKENDS`, or every HTTP kind with settings present in `store`.
pub async fn backend_configs_from_store(store: &CredentialStore) -> Vec<BackendConfig> {
    let listed = env::var("ORCH_BACKENDS")
        .ok()
        .map(|value| {
            split_list(&value)
                .iter()
                .filter_map(|name| BackendKind::parse(name))
                .collect::<Vec<_>>()
        })
        .filter(|kinds| !kinds.is_empty());

    let explicit = listed.is_some();
    let kinds = listed.unwrap_or_else(|| {
        vec![
            BackendKind::OpenAi,
            BackendKind::Anthropic,
            BackendKind::Gemini,
            BackendKind::Ollama,
        ]
    });

    let mut configs = Vec::new();
    for kind in kinds {
        let config = BackendConfig::from_store(kind, store).await;
        let present = match kind {
            BackendKind::Ollama => config.base_url.is_some(),
            _ => config.credential().is_some(),
        };
        if explicit || present {
            configs.push(config);
        }
    }
    configs
}

pub fn env_prefix(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::OpenAi => "OPENAI",
        BackendKind::Anthropic => "ANTHROPIC",
        BackendKind::Gemini => "GEMINI",
        BackendKind::Ollama => "OLLAMA",
        BackendKind::Mock => "MOCK",
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn read_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|value| value != "0" && !value.eq_ignore_ascii_case("false"))
        .unwrap_or(default)
}

fn read_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn read_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}
