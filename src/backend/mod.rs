pub mod anthropic;
pub mod gemini;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod sse;

use std::{
    collections::BTreeSet,
    fmt,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::BackendConfig,
    models::{BackendChunk, BackendOutput, GenerationRequest, Modality, ModelInfo, Pricing},
};

use self::{
    anthropic::AnthropicAdapter, gemini::GeminiAdapter, mock::MockBackend, ollama::OllamaAdapter,
    openai::OpenAiAdapter,
};

pub type BackendStream = BoxStream<'static, Result<BackendChunk, BackendError>>;

/// Shared capability interface every backend kind implements.
#[async_trait]
pub trait AiBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Modalities the backend accepts unless configuration narrows them.
    fn capabilities(&self) -> BTreeSet<Modality>;

    fn can_handle(&self, modalities: &BTreeSet<Modality>) -> bool {
        modalities.is_subset(&self.capabilities())
    }

    fn has_credential(&self) -> bool;

    fn models(&self) -> Vec<ModelInfo>;

    fn current_model(&self) -> String;

    fn switch_model(&self, model: &str) -> bool;

    fn pricing(&self, model: &str) -> Option<Pricing>;

    async fn execute(
        &self,
        request: &GenerationRequest,
        model: &str,
    ) -> Result<BackendOutput, BackendError>;

    async fn stream(
        &self,
        request: &GenerationRequest,
        model: &str,
    ) -> Result<BackendStream, BackendError>;

    async fn check_health(&self) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum BackendError {
    #[error("backend not configured: {0}")]
    NotConfigured(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("blocked by safety policy: {0}")]
    SafetyBlocked(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Network(_) | BackendError::Timeout(_) | BackendError::RateLimited(_)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            BackendError::NotConfigured(_) => "not_configured",
            BackendError::Network(_) => "network",
            BackendError::Timeout(_) => "timeout",
            BackendError::RateLimited(_) => "rate_limited",
            BackendError::Auth(_) => "auth",
            BackendError::SafetyBlocked(_) => "safety_blocked",
            BackendError::InvalidResponse(_) => "invalid_response",
            BackendError::Unsupported(_) => "unsupported",
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    OpenAi,
    Anthropic,
    Gemini,
    Ollama,
    Mock,
}

impl BackendKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(BackendKind::OpenAi),
            "anthropic" | "claude" => Some(BackendKind::Anthropic),
            "gemini" | "google" => Some(BackendKind::Gemini),
            "ollama" => Some(BackendKind::Ollama),
            "mock" => Some(BackendKind::Mock),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::OpenAi => "openai",
            BackendKind::Anthropic => "anthropic",
            BackendKind::Gemini => "gemini",
            BackendKind::Ollama => "ollama",
            BackendKind::Mock => "mock",
        }
    }

    pub fn requires_credential(&self) -> bool {
        matches!(
            self,
            BackendKind::OpenAi | BackendKind::Anthropic | BackendKind::Gemini
        )
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of backend kinds. Calls dispatch statically to the concrete adapter.
pub enum BackendAdapter {
    OpenAi(OpenAiAdapter),
    Anthropic(AnthropicAdapter),
    Gemini(GeminiAdapter),
    Ollama(OllamaAdapter),
    Mock(MockBackend),
}

macro_rules! dispatch {
    ($self:ident, $adapter:ident => $body:expr) => {
        match $self {
            BackendAdapter::OpenAi($adapter) => $body,
            BackendAdapter::Anthropic($adapter) => $body,
            BackendAdapter::Gemini($adapter) => $body,
            BackendAdapter::Ollama($adapter) => $body,
            BackendAdapter::Mock($adapter) => $body,
        }
    };
}

impl BackendAdapter {
    pub fn from_config(config: &BackendConfig) -> Result<Self, BackendError> {
        let adapter = match config.kind {
            BackendKind::OpenAi => BackendAdapter::OpenAi(OpenAiAdapter::new(config)?),
            BackendKind::Anthropic => BackendAdapter::Anthropic(AnthropicAdapter::new(config)?),
            BackendKind::Gemini => BackendAdapter::Gemini(GeminiAdapter::new(config)?),
            BackendKind::Ollama => BackendAdapter::Ollama(OllamaAdapter::new(config)?),
            BackendKind::Mock => BackendAdapter::Mock(
                MockBackend::named(config.id.clone()).with_models(&config.models),
            ),
        };
        Ok(adapter)
    }
}

impl From<MockBackend> for BackendAdapter {
    fn from(value: MockBackend) -> Self {
        BackendAdapter::Mock(value)
    }
}

#[async_trait]
impl AiBackend for BackendAdapter {
    fn kind(&self) -> BackendKind {
        dispatch!(self, adapter => adapter.kind())
    }

    fn capabilities(&self) -> BTreeSet<Modality> {
        dispatch!(self, adapter => adapter.capabilities())
    }

    fn has_credential(&self) -> bool {
        dispatch!(self, adapter => adapter.has_credential())
    }

    fn models(&self) -> Vec<ModelInfo> {
        dispatch!(self, adapter => adapter.models())
    }

    fn current_model(&self) -> String {
        dispatch!(self, adapter => adapter.current_model())
    }

    fn switch_model(&self, model: &str) -> bool {
        dispatch!(self, adapter => adapter.switch_model(model))
    }

    fn pricing(&self, model: &str) -> Option<Pricing> {
        dispatch!(self, adapter => adapter.pricing(model))
    }

    async fn execute(
        &self,
        request: &GenerationRequest,
        model: &str,
    ) -> Result<BackendOutput, BackendError> {
        dispatch!(self, adapter => adapter.execute(request, model).await)
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
        model: &str,
    ) -> Result<BackendStream, BackendError> {
        dispatch!(self, adapter => adapter.stream(request, model).await)
    }

    async fn check_health(&self) -> Result<(), BackendError> {
        dispatch!(self, adapter => adapter.check_health().await)
    }
}

/// Model catalog plus the currently active model of one adapter.
#[derive(Debug)]
pub struct ModelSlot {
    backend: String,
    catalog: Vec<ModelInfo>,
    current: RwLock<String>,
}

impl ModelSlot {
    /// Builds the catalog from `declared` ids, falling back to `builtin` when none are declared.
    /// Declared ids unknown to `builtin` get `default_modalities` and no pricing.
    pub fn new(
        backend: &str,
        builtin: Vec<ModelInfo>,
        declared: &[String],
        default_modalities: &[Modality],
    ) -> Self {
        let mut catalog = if declared.is_empty() {
            builtin
        } else {
            declared
                .iter()
                .map(|id| {
                    builtin
                        .iter()
                        .find(|model| &model.id == id)
                        .cloned()
                        .unwrap_or_else(|| ModelInfo::new(id, id, default_modalities, None))
                })
                .collect()
        };
        for model in &mut catalog {
            model.backend = backend.to_owned();
        }
        let current = catalog
            .first()
            .map(|model| model.id.clone())
            .unwrap_or_default();

        Self {
            backend: backend.to_owned(),
            catalog,
            current: RwLock::new(current),
        }
    }

    pub fn current(&self) -> String {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn contains(&self, model: &str) -> bool {
        self.catalog.iter().any(|entry| entry.id == model)
    }

    pub fn switch(&self, model: &str) -> bool {
        if !self.contains(model) {
            return false;
        }
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = model.to_owned();
        true
    }

    pub fn catalog(&self) -> Vec<ModelInfo> {
        let current = self.current();
        self.catalog
            .iter()
            .cloned()
            .map(|mut model| {
                model.active = model.id == current;
                model
            })
            .collect()
    }

    pub fn pricing(&self, model: &str) -> Option<Pricing> {
        self.catalog
            .iter()
            .find(|entry| entry.id == model)
            .and_then(|entry| entry.pricing)
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, BackendError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|error| BackendError::NotConfigured(format!("failed to build HTTP client: {error}")))
}

pub(crate) fn transport_error(error: reqwest::Error) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(error.to_string())
    } else {
        BackendError::Network(error.to_string())
    }
}

pub(crate) fn map_http_error(status: StatusCode, body: String) -> BackendError {
    let trimmed = body.chars().take(400).collect::<String>();
    let lowered = trimmed.to_ascii_lowercase();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::Auth(format!("status {}: {trimmed}", status.as_u16()))
        }
        StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited(trimmed),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            BackendError::Timeout(format!("upstream timeout: {trimmed}"))
        }
        _ if lowered.contains("safety") || lowered.contains("content_policy") => {
            BackendError::SafetyBlocked(trimmed)
        }
        _ if status.is_server_error() => {
            BackendError::Network(format!("status {}: {trimmed}", status.as_u16()))
        }
        _ => BackendError::InvalidResponse(format!("status {}: {trimmed}", status.as_u16())),
    }
}

pub(crate) async fn error_for_response(response: reqwest::Response) -> BackendError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown backend error".to_owned());
    map_http_error(status, body)
}

pub(crate) fn missing_credential(backend: &str) -> BackendError {
    BackendError::NotConfigured(format!("no credential configured for {backend}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_errors_map_to_taxonomy() {
        assert!(matches!(
            map_http_error(StatusCode::UNAUTHORIZED, "bad key".to_owned()),
            BackendError::Auth(_)
        ));
        assert!(matches!(
            map_http_error(StatusCode::TOO_MANY_REQUESTS, "slow down".to_owned()),
            BackendError::RateLimited(_)
        ));
        assert!(matches!(
            map_http_error(StatusCode::BAD_GATEWAY, "upstream".to_owned()),
            BackendError::Network(_)
        ));
        assert!(matches!(
            map_http_error(StatusCode::BAD_REQUEST, "blocked by SAFETY filter".to_owned()),
            BackendError::SafetyBlocked(_)
        ));
        assert!(matches!(
            map_http_error(StatusCode::BAD_REQUEST, "missing field".to_owned()),
            BackendError::InvalidResponse(_)
        ));
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(BackendError::Timeout("t".to_owned()).is_retryable());
        assert!(BackendError::RateLimited("r".to_owned()).is_retryable());
        assert!(BackendError::Network("n".to_owned()).is_retryable());
        assert!(!BackendError::Auth("a".to_owned()).is_retryable());
        assert!(!BackendError::SafetyBlocked("s".to_owned()).is_retryable());
    }

    #[test]
    fn model_slot_switches_only_to_catalog_members() {
        let slot = ModelSlot::new(
            "primary",
            vec![
                ModelInfo::new("small", "Small", &[Modality::Text], None),
                ModelInfo::new("large", "Large", &[Modality::Text], None),
            ],
            &[],
            &[Modality::Text],
        );

        assert_eq!(slot.current(), "small");
        assert!(slot.switch("large"));
        assert!(!slot.switch("unknown"));
        assert_eq!(slot.current(), "large");

        let catalog = slot.catalog();
        assert!(catalog.iter().all(|model| model.backend == "primary"));
        assert!(catalog.iter().any(|model| model.id == "large" && model.active));
    }

    #[test]
    fn declared_models_override_builtin_catalog() {
        let slot = ModelSlot::new(
            "primary",
            vec![ModelInfo::new("known", "Known", &[Modality::Text], None)],
            &["custom".to_owned(), "known".to_owned()],
            &[Modality::Text, Modality::Image],
        );

        assert_eq!(slot.current(), "custom");
        let catalog = slot.catalog();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].modalities, vec![Modality::Text, Modality::Image]);
    }
}
