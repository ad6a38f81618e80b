use std::collections::BTreeSet;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    backend::{
        error_for_response, http_client, missing_credential, sse, transport_error, AiBackend,
        BackendError, BackendKind, BackendStream, ModelSlot,
    },
    config::BackendConfig,
    models::{
        BackendChunk, BackendOutput, ContentPart, GenerationRequest, Modality, ModelInfo, Pricing,
        ResponseContent, Usage,
    },
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;
const CAPABILITIES: &[Modality] = &[Modality::Text, Modality::Image];

pub struct AnthropicAdapter {
    id: String,
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    models: ModelSlot,
}

impl AnthropicAdapter {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        Ok(Self {
            id: config.id.clone(),
            client: http_client(config.request_timeout)?,
            api_key: config.credential().map(ToOwned::to_owned),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned()),
            models: ModelSlot::new(&config.id, builtin_models(), &config.models, CAPABILITIES),
        })
    }

    fn request_builder(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, BackendError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| missing_credential(&self.id))?;
        Ok(self
            .client
            .request(method, format!("{}/{}", self.base_url, path))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION))
    }

    fn payload(
        request: &GenerationRequest,
        model: &str,
        stream: bool,
    ) -> Result<Value, BackendError> {
        let content = request
            .parts
            .iter()
            .map(content_block)
            .collect::<Result<Vec<_>, _>>()?;

        let mut payload = json!({
            "model": model,
            "max_tokens": request.options.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": [{"role": "user", "content": content}],
            "stream": stream,
        });
        if let Some(system) = &request.system {
            payload["system"] = json!(system);
        }
        if let Some(temperature) = request.options.temperature {
            payload["temperature"] = json!(temperature);
        }
        Ok(payload)
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response, BackendError> {
        let response = self
            .request_builder(reqwest::Method::POST, "messages")?
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
impl AiBackend for AnthropicAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Anthropic
    }

    fn capabilities(&self) -> BTreeSet<Modality> {
        CAPABILITIES.iter().copied().collect()
    }

    fn has_credential(&self) -> bool {
        self.api_key.is_some()
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
        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;

        let stop_reason = parsed.stop_reason.unwrap_or_else(|| "end_turn".to_owned());
        if stop_reason == "refusal" {
            return Err(BackendError::SafetyBlocked("model refused the request".to_owned()));
        }

        let text = parsed
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<String>();
        let usage = Usage::new(parsed.usage.input_tokens, parsed.usage.output_tokens)
            .priced(self.models.pricing(model).as_ref());

        Ok(BackendOutput {
            content: ResponseContent::Text { text },
            model: parsed.model.unwrap_or_else(|| model.to_owned()),
            finish_reason: stop_reason,
            usage,
        })
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
        model: &str,
    ) -> Result<BackendStream, BackendError> {
        let response = self.post(&Self::payload(request, model, true)?).await?;
        let mut lines = sse::lines(response);
        let pricing = self.models.pricing(model);

        let stream = async_stream::stream! {
            let mut input_tokens = 0u32;
            let mut output_tokens = 0u32;
            let mut stop_reason: Option<String> = None;
            let mut stopped = false;

            while let Some(next) = lines.next().await {
                let line = match next {
                    Ok(line) => line,
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                };
                let Some(payload) = sse::data_payload(&line) else {
                    continue;
                };

                let event: AnthropicStreamEvent = match serde_json::from_str(payload) {
                    Ok(event) => event,
                    Err(error) => {
                        yield Err(BackendError::InvalidResponse(error.to_string()));
                        return;
                    }
                };

                match event.event_type.as_str() {
                    "message_start" => {
                        if let Some(usage) = event.message.and_then(|message| message.usage) {
                            input_tokens = usage.input_tokens;
                        }
                    }
                    "content_block_delta" => {
                        if let Some(text) = event.delta.and_then(|delta| delta.text).filter(|text| !text.is_empty()) {
                            yield Ok(BackendChunk::delta(text));
                        }
                    }
                    "message_delta" => {
                        if let Some(reason) = event.delta.and_then(|delta| delta.stop_reason) {
                            if reason == "refusal" {
                                yield Err(BackendError::SafetyBlocked("model refused the request".to_owned()));
                                return;
                            }
                            stop_reason = Some(reason);
                        }
                        if let Some(usage) = event.usage {
                            output_tokens = usage.output_tokens;
                        }
                    }
                    "message_stop" => {
                        stopped = true;
                        break;
                    }
                    "error" => {
                        let message = event
                            .error
                            .map(|error| format!("{}: {}", error.error_type, error.message))
                            .unwrap_or_else(|| "stream error".to_owned());
                        yield Err(if message.starts_with("overloaded_error") {
                            BackendError::RateLimited(message)
                        } else {
                            BackendError::InvalidResponse(message)
                        });
                        return;
                    }
                    _ => {}
                }
            }

            if !stopped {
                yield Err(BackendError::Network("stream ended before completion".to_owned()));
                return;
            }
            yield Ok(BackendChunk::finished(
                stop_reason.unwrap_or_else(|| "end_turn".to_owned()),
                Some(Usage::new(input_tokens, output_tokens).priced(pricing.as_ref())),
            ));
        };

        debug!(backend = %self.id, model, "stream prepared");
        Ok(stream.boxed())
    }

    async fn check_health(&self) -> Result<(), BackendError> {
        let response = self
            .request_builder(reqwest::Method::GET, "models")?
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        Ok(())
    }
}

fn content_block(part: &ContentPart) -> Result<Value, BackendError> {
    match part {
        ContentPart::Text { text } => Ok(json!({"type": "text", "text": text})),
        ContentPart::Image { mime_type, data } => Ok(json!({
            "type": "image",
            "source": {"type": "base64", "media_type": mime_type, "data": data},
        })),
        other => Err(BackendError::Unsupported(format!(
            "anthropic does not accept {} content",
            other.modality()
        ))),
    }
}

fn builtin_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo::new(
            "claude-3-5-haiku-latest",
            "Claude 3.5 Haiku",
            CAPABILITIES,
            Some(Pricing::new(0.0008, 0.004)),
        ),
        ModelInfo::new(
            "claude-3-5-sonnet-latest",
            "Claude 3.5 Sonnet",
            CAPABILITIES,
            Some(Pricing::new(0.003, 0.015)),
        ),
    ]
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<AnthropicBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    message: Option<AnthropicStreamMessage>,
    #[serde(default)]
    delta: Option<AnthropicDelta>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
    #[serde(default)]
    error: Option<AnthropicStreamError>,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamMessage {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}
