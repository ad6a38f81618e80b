use std::{
    collections::BTreeSet,
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::BackendError;

/// A content kind a request or backend deals in.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
    Audio,
    Video,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
            Modality::Audio => "audio",
            Modality::Video => "video",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn format_modalities(modalities: &BTreeSet<Modality>) -> String {
    modalities
        .iter()
        .map(Modality::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// One ordered piece of request content. Binary payloads are base64 encoded.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "modality", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    Image { mime_type: String, data: String },
    Audio { mime_type: String, data: String },
    Video { mime_type: String, data: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        ContentPart::Image {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub fn modality(&self) -> Modality {
        match self {
            ContentPart::Text { .. } => Modality::Text,
            ContentPart::Image { .. } => Modality::Image,
            ContentPart::Audio { .. } => Modality::Audio,
            ContentPart::Video { .. } => Modality::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Concurrent,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Concurrent => "concurrent",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RequestOptions {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub target_backend: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl RequestOptions {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// A single logical generation call. Immutable once handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub id: String,
    pub task: String,
    pub modalities: BTreeSet<Modality>,
    pub parts: Vec<ContentPart>,
    pub system: Option<String>,
    pub allowed_backends: Vec<String>,
    pub mode: ExecutionMode,
    pub options: RequestOptions,
}

impl GenerationRequest {
    pub fn new(task: impl Into<String>, parts: Vec<ContentPart>) -> Self {
        let modalities = parts.iter().map(ContentPart::modality).collect();
        Self {
            id: format!("req_{}", Uuid::new_v4()),
            task: task.into(),
            modalities,
            parts,
            system: None,
            allowed_backends: Vec::new(),
            mode: ExecutionMode::Sequential,
            options: RequestOptions::default(),
        }
    }

    pub fn text(task: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(task, vec![ContentPart::text(prompt)])
    }

    pub fn with_backends<I, S>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_backends = backends.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Whether `backend` appears in the request's acceptable set. An empty set accepts any.
    pub fn allows(&self, backend: &str) -> bool {
        self.allowed_backends.is_empty() || self.allowed_backends.iter().any(|id| id == backend)
    }

    pub fn prompt_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Wire shape accepted by `POST /v1/generate`.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequestBody {
    #[serde(default = "default_task")]
    pub task: String,
    pub parts: Vec<ContentPart>,
    #[serde(default)]
    pub modalities: Vec<Modality>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub backends: Vec<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub options: RequestOptions,
}

fn default_task() -> String {
    "general".to_owned()
}

impl GenerateRequestBody {
    pub fn into_request(self) -> Result<GenerationRequest, String> {
        if self.parts.is_empty() {
            return Err("parts must not be empty".to_owned());
        }
        if self.task.trim().is_empty() {
            return Err("task must not be empty".to_owned());
        }

        let mut request = GenerationRequest::new(self.task, self.parts)
            .with_backends(self.backends)
            .with_mode(self.mode)
            .with_options(self.options);
        request.modalities.extend(self.modalities);
        request.system = self.system;
        Ok(request)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "modality", rename_all = "lowercase")]
pub enum ResponseContent {
    Text { text: String },
    Image { mime_type: String, data: String },
}

impl ResponseContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseContent::Text { text } => Some(text),
            ResponseContent::Image { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub generated_assets: u32,
    pub estimated_cost: f64,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
            generated_assets: 0,
            estimated_cost: 0.0,
        }
    }

    pub fn priced(mut self, pricing: Option<&Pricing>) -> Self {
        if let Some(pricing) = pricing {
            self.estimated_cost = pricing.cost_for(self.input_tokens, self.output_tokens);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
pub struct Pricing {
    pub input_per_1k_tokens: f64,
    pub output_per_1k_tokens: f64,
}

impl Pricing {
    pub const fn new(input_per_1k_tokens: f64, output_per_1k_tokens: f64) -> Self {
        Self {
            input_per_1k_tokens,
            output_per_1k_tokens,
        }
    }

    pub fn cost_for(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k_tokens
            + (output_tokens as f64 / 1000.0) * self.output_per_1k_tokens
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub backend: String,
    pub name: String,
    pub modalities: Vec<Modality>,
    pub pricing: Option<Pricing>,
    #[serde(default)]
    pub active: bool,
}

impl ModelInfo {
    pub fn new(id: &str, name: &str, modalities: &[Modality], pricing: Option<Pricing>) -> Self {
        Self {
            id: id.to_owned(),
            backend: String::new(),
            name: name.to_owned(),
            modalities: modalities.to_vec(),
            pricing,
            active: false,
        }
    }
}

/// Wall-clock bookkeeping for one call, in unix milliseconds / elapsed milliseconds.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Timing {
    pub started_at_ms: u64,
    pub completed_at_ms: u64,
    pub total_ms: u64,
    pub processing_ms: u64,
}

impl Timing {
    pub fn measured(started_at_ms: u64, total: Duration, processing: Duration) -> Self {
        Self {
            started_at_ms,
            completed_at_ms: unix_millis(),
            total_ms: total.as_millis() as u64,
            processing_ms: processing.as_millis() as u64,
        }
    }
}

/// Normalized result of one adapter call.
#[derive(Debug, Clone)]
pub struct BackendOutput {
    pub content: ResponseContent,
    pub model: String,
    pub finish_reason: String,
    pub usage: Usage,
}

#[derive(Debug, Clone)]
pub struct BackendChunk {
    pub delta: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub done: bool,
}

impl BackendChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: Some(text.into()),
            finish_reason: None,
            usage: None,
            done: false,
        }
    }

    pub fn finished(finish_reason: impl Into<String>, usage: Option<Usage>) -> Self {
        Self {
            delta: None,
            finish_reason: Some(finish_reason.into()),
            usage,
            done: true,
        }
    }
}

/// Terminal value for exactly one request.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResponse {
    pub id: String,
    pub request_id: String,
    pub backend: String,
    pub model: String,
    pub success: bool,
    pub content: Option<ResponseContent>,
    pub usage: Usage,
    pub timing: Timing,
    pub error: Option<BackendError>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub race: Option<ConcurrentProcess>,
}

impl GenerationResponse {
    pub fn succeeded(
        request_id: &str,
        backend: &str,
        output: BackendOutput,
        timing: Timing,
        attempts: u32,
    ) -> Self {
        Self {
            id: format!("resp_{}", Uuid::new_v4()),
            request_id: request_id.to_owned(),
            backend: backend.to_owned(),
            model: output.model,
            success: true,
            content: Some(output.content),
            usage: output.usage,
            timing,
            error: None,
            attempts,
            race: None,
        }
    }

    /// An adapter-level failure captured as a value.
    pub fn failed(
        request_id: &str,
        backend: &str,
        model: &str,
        error: BackendError,
        timing: Timing,
        attempts: u32,
    ) -> Self {
        Self {
            id: format!("resp_{}", Uuid::new_v4()),
            request_id: request_id.to_owned(),
            backend: backend.to_owned(),
            model: model.to_owned(),
            success: false,
            content: None,
            usage: Usage::default(),
            timing,
            error: Some(error),
            attempts,
            race: None,
        }
    }

    pub fn with_race(mut self, race: ConcurrentProcess) -> Self {
        self.race = Some(race);
        self
    }

    pub fn text(&self) -> Option<&str> {
        self.content.as_ref().and_then(ResponseContent::as_text)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubProcessStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubProcess {
    pub backend: String,
    pub status: SubProcessStatus,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Combiner {
    #[default]
    FirstSuccess,
}

/// One request raced against several backends.
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrentProcess {
    pub request_id: String,
    pub combiner: Combiner,
    pub processes: Vec<SubProcess>,
    pub winner: Option<String>,
}

impl ConcurrentProcess {
    pub fn new(request_id: &str, backends: &[String]) -> Self {
        Self {
            request_id: request_id.to_owned(),
            combiner: Combiner::FirstSuccess,
            processes: backends
                .iter()
                .map(|backend| SubProcess {
                    backend: backend.clone(),
                    status: SubProcessStatus::Pending,
                    started_at_ms: None,
                    completed_at_ms: None,
                    latency_ms: None,
                    error: None,
                })
                .collect(),
            winner: None,
        }
    }

    pub fn process_mut(&mut self, backend: &str) -> Option<&mut SubProcess> {
        self.processes
            .iter_mut()
            .find(|process| process.backend == backend)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStart {
    pub session_id: String,
    pub request_id: String,
    pub backend: String,
    pub model: String,
    pub started_at_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamChunk {
    pub session_id: String,
    pub index: u64,
    pub delta: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamCompletion {
    pub session_id: String,
    pub backend: String,
    pub model: String,
    pub content: String,
    pub chunk_count: u64,
    pub finish_reason: String,
    pub usage: Usage,
    pub timing: Timing,
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn rough_token_estimate(text: &str) -> u32 {
    if text.trim().is_empty() {
        return 0;
    }
    text.split_whitespace().count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_modalities_follow_content_parts() {
        let request = GenerationRequest::new(
            "resume_review",
            vec![
                ContentPart::text("review this"),
                ContentPart::image("image/png", "aGVsbG8="),
            ],
        );

        assert_eq!(
            request.modalities.iter().copied().collect::<Vec<_>>(),
            vec![Modality::Text, Modality::Image]
        );
        assert_eq!(request.prompt_text(), "review this");
    }

    #[test]
    fn body_conversion_rejects_empty_parts() {
        let body: GenerateRequestBody =
            serde_json::from_str(r#"{"parts":[]}"#).expect("body should deserialize");

        let error = body.into_request().expect_err("empty parts should fail");
        assert_eq!(error, "parts must not be empty");
    }

    #[test]
    fn body_conversion_merges_declared_modalities() {
        let body: GenerateRequestBody = serde_json::from_str(
            r#"{"task":"cover_letter","parts":[{"modality":"text","text":"hi"}],"modalities":["audio"],"mode":"concurrent","backends":["a","b"]}"#,
        )
        .expect("body should deserialize");

        let request = body.into_request().expect("body should convert");
        assert!(request.modalities.contains(&Modality::Audio));
        assert!(request.modalities.contains(&Modality::Text));
        assert_eq!(request.mode, ExecutionMode::Concurrent);
        assert!(request.allows("b"));
        assert!(!request.allows("c"));
    }

    #[test]
    fn usage_cost_uses_per_thousand_pricing() {
        let usage = Usage::new(2_000, 500).priced(Some(&Pricing::new(0.01, 0.03)));
        assert_eq!(usage.total_tokens, 2_500);
        assert!((usage.estimated_cost - 0.035).abs() < 1e-9);
    }
}
