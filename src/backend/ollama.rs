use std::collections::BTreeSet;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    backend::{
        error_for_response, http_client, sse, transport_error, AiBackend, BackendError,
        BackendKind, BackendStream, ModelSlot,
    },
    config::BackendConfig,
    models::{
        BackendChunk, BackendOutput, ContentPart, GenerationRequest, Modality, ModelInfo, Pricing,
        ResponseContent, Usage,
    },
};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const CAPABILITIES: &[Modality] = &[Modality::Text, Modality::Image];

/// Local Ollama server. Needs no credential; availability is decided by the health probe.
pub struct OllamaAdapter {
    id: String,
    client: reqwest::Client,
    base_url: String,
    models: ModelSlot,
}

impl OllamaAdapter {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        Ok(Self {
            id: config.id.clone(),
            client: http_client(config.request_timeout)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned()),
            models: ModelSlot::new(&config.id, builtin_models(), &config.models, CAPABILITIES),
        })
    }

    fn payload(
        request: &GenerationRequest,
        model: &str,
        stream: bool,
    ) -> Result<Value, BackendError> {
        let mut images = Vec::new();
        let mut text = Vec::new();
        for part in &request.parts {
            match part {
                ContentPart::Text { text: fragment } => text.push(fragment.as_str()),
                ContentPart::Image { data, .. } => images.push(data.as_str()),
                other => {
                    return Err(BackendError::Unsupported(format!(
                        "ollama does not accept {} content",
                        other.modality()
                    )))
                }
            }
        }

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        let mut user = json!({"role": "user", "content": text.join("\n")});
        if !images.is_empty() {
            user["images"] = json!(images);
        }
        messages.push(user);

        Ok(json!({
            "model": model,
            "messages": messages,
            "stream": stream,
            "options": {
                "temperature": request.options.temperature,
                "num_predict": request.options.max_output_tokens,
            },
        }))
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(payload)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl AiBackend for OllamaAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Ollama
    }

    fn capabilities(&self) -> BTreeSet<Modality> {
        CAPABILITIES.iter().copied().collect()
    }

    fn has_credential(&self) -> bool {
        true
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.models.catalog()
    }

    fn current_model(&self) -> String {
        self.models.current()
    }

    fn switch_model(&self, model: &str) -> bool {
        self.models.switch(model)
    }

    fn pricing(&self, model: &str) -> Option<Pricing> {
        self.models.pricing(model)
    }

    async fn execute(
        &self,
        request: &GenerationRequest,
        model: &str,
    ) -> Result<BackendOutput, BackendError> {
        let response = self.post(&Self::payload(request, model, false)?).await?;
        let parsed: OllamaChatResponse = response
            .json()
            .await
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;

        Ok(BackendOutput {
            content: ResponseContent::Text {
                text: parsed.message.map(|message| message.content).unwrap_or_default(),
            },
            model: parsed.model.unwrap_or_else(|| model.to_owned()),
            finish_reason: parsed.done_reason.unwrap_or_else(|| "stop".to_owned()),
            usage: Usage::new(parsed.prompt_eval_count, parsed.eval_count),
        })
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
        model: &str,
    ) -> Result<BackendStream, BackendError> {
        let response = self.post(&Self::payload(request, model, true)?).await?;
        let mut lines = sse::lines(response);

        let stream = async_stream::stream! {
            while let Some(next) = lines.next().await {
                let line = match next {
                    Ok(line) => line,
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                };

                let parsed: OllamaChatResponse = match serde_json::from_str(&line) {
                    Ok(parsed) => parsed,
                    Err(error) => {
                        yield Err(BackendError::InvalidResponse(error.to_string()));
                        return;
                    }
                };
                if let Some(error) = parsed.error {
                    yield Err(BackendError::InvalidResponse(error));
                    return;
                }

                if let Some(content) = parsed
                    .message
                    .map(|message| message.content)
                    .filter(|content| !content.is_empty())
                {
                    yield Ok(BackendChunk::delta(content));
                }

                if parsed.done {
                    yield Ok(BackendChunk::finished(
                        parsed.done_reason.unwrap_or_else(|| "stop".to_owned()),
                        Some(Usage::new(parsed.prompt_eval_count, parsed.eval_count)),
                    ));
                    return;
                }
            }

            yield Err(BackendError::Network("stream ended before completion".to_owned()));
        };

        debug!(backend = %self.id, model, "stream prepared");
        Ok(stream.boxed())
    }

    async fn check_health(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        Ok(())
    }
}

fn builtin_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo::new("llama3.1", "Llama 3.1", &[Modality::Text], None),
        ModelInfo::new("llava", "LLaVA", CAPABILITIES, None),
    ]
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn images_ride_on_the_user_message() {
        let request = GenerationRequest::new(
            "portfolio_review",
            vec![
                ContentPart::text("what is shown?"),
                ContentPart::image("image/jpeg", "BBBB"),
            ],
        );

        let payload = OllamaAdapter::payload(&request, "llava", false).expect("payload");
        assert_eq!(payload["messages"][0]["content"], "what is shown?");
        assert_eq!(payload["messages"][0]["images"][0], "BBBB");
        assert_eq!(payload["stream"], false);
    }

    #[test]
    fn final_stream_line_decodes_usage() {
        let parsed: OllamaChatResponse = serde_json::from_str(
            r#"{"model":"llama3.1","message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","prompt_eval_count":12,"eval_count":30}"#,
        )
        .expect("line should decode");
        assert!(parsed.done);
        assert_eq!(parsed.eval_count, 30);
    }
}
