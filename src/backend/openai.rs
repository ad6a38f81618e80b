use std::collections::BTreeSet;

use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
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
        rough_token_estimate, BackendChunk, BackendOutput, ContentPart, GenerationRequest,
        Modality, ModelInfo, Pricing, ResponseContent, Usage,
    },
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const CAPABILITIES: &[Modality] = &[Modality::Text, Modality::Image, Modality::Audio];

pub struct OpenAiAdapter {
    id: String,
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    models: ModelSlot,
}

impl OpenAiAdapter {
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

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn api_key(&self) -> Result<&str, BackendError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| missing_credential(&self.id))
    }

    fn payload(&self, request: &GenerationRequest, model: &str, stream: bool) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({
            "role": "user",
            "content": request.parts.iter().map(content_part).collect::<Vec<_>>(),
        }));

        let mut payload = json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.options.max_output_tokens,
            "temperature": request.options.temperature,
            "stream": stream,
        });
        if stream {
            payload["stream_options"] = json!({"include_usage": true});
        }
        payload
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(self.url("/chat/completions"))
            .bearer_auth(self.api_key()?)
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
impl AiBackend for OpenAiAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenAi
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
        let response = self.post(&self.payload(request, model, false)).await?;
        let parsed: OpenAiChatResponse = response
            .json()
            .await
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;

        let choice = parsed.choices.first().ok_or_else(|| {
            BackendError::InvalidResponse("missing choices in response".to_owned())
        })?;
        let finish_reason = choice
            .finish_reason
            .clone()
            .unwrap_or_else(|| "stop".to_owned());
        if finish_reason == "content_filter" {
            return Err(BackendError::SafetyBlocked(
                "response withheld by content filter".to_owned(),
            ));
        }

        let content = choice.message.content.clone().unwrap_or_default();
        let usage = parsed
            .usage
            .map(Usage::from)
            .unwrap_or_else(|| {
                Usage::new(
                    rough_token_estimate(&request.prompt_text()),
                    rough_token_estimate(&content),
                )
            })
            .priced(self.models.pricing(model).as_ref());

        Ok(BackendOutput {
            content: ResponseContent::Text { text: content },
            model: parsed.model.unwrap_or_else(|| model.to_owned()),
            finish_reason,
            usage,
        })
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
        model: &str,
    ) -> Result<BackendStream, BackendError> {
        let response = self.post(&self.payload(request, model, true)).await?;
        let stream = decode_stream(sse::lines(response), self.models.pricing(model));

        debug!(backend = %self.id, model, "stream prepared");
        Ok(stream)
    }

    async fn check_health(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .get(self.url("/models"))
            .bearer_auth(self.api_key()?)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        Ok(())
    }
}

/// Decodes chat-completion SSE lines. A body that stops before `[DONE]` or a finish reason
/// is reported as a network failure.
fn decode_stream(
    mut lines: BoxStream<'static, Result<String, BackendError>>,
    pricing: Option<Pricing>,
) -> BackendStream {
    let stream = async_stream::stream! {
        let mut final_usage: Option<Usage> = None;
        let mut finish_reason: Option<String> = None;
        let mut saw_done = false;

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
            if payload == "[DONE]" {
                saw_done = true;
                break;
            }

            let parsed: OpenAiStreamResponse = match serde_json::from_str(payload) {
                Ok(parsed) => parsed,
                Err(error) => {
                    yield Err(BackendError::InvalidResponse(error.to_string()));
                    return;
                }
            };

            if let Some(usage) = parsed.usage.map(Usage::from) {
                final_usage = Some(usage.priced(pricing.as_ref()));
            }

            if let Some(choice) = parsed.choices.first() {
                if let Some(content) = choice.delta.content.clone().filter(|value| !value.is_empty()) {
                    yield Ok(BackendChunk::delta(content));
                }
                if let Some(reason) = choice.finish_reason.clone() {
                    if reason == "content_filter" {
                        yield Err(BackendError::SafetyBlocked(
                            "response withheld by content filter".to_owned(),
                        ));
                        return;
                    }
                    finish_reason = Some(reason);
                }
            }
        }

        if !saw_done && finish_reason.is_none() {
            yield Err(BackendError::Network("stream ended before completion".to_owned()));
            return;
        }
        yield Ok(BackendChunk::finished(
            finish_reason.unwrap_or_else(|| "stop".to_owned()),
            final_usage,
        ));
    };

    stream.boxed()
}

fn content_part(part: &ContentPart) -> Value {
    match part {
        ContentPart::Text { text } => json!({"type": "text", "text": text}),
        ContentPart::Image { mime_type, data } => json!({
            "type": "image_url",
            "image_url": {"url": format!("data:{mime_type};base64,{data}")},
        }),
        ContentPart::Audio { mime_type, data } => json!({
            "type": "input_audio",
            "input_audio": {"data": data, "format": audio_format(mime_type)},
        }),
        ContentPart::Video { .. } => json!({
            "type": "text",
            "text": "[video content omitted]",
        }),
    }
}

fn audio_format(mime_type: &str) -> &str {
    match mime_type {
        "audio/mpeg" | "audio/mp3" => "mp3",
        _ => "wav",
    }
}

fn builtin_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo::new(
            "gpt-4o-mini",
            "GPT-4o mini",
            &[Modality::Text, Modality::Image],
            Some(Pricing::new(0.00015, 0.0006)),
        ),
        ModelInfo::new(
            "gpt-4o",
            "GPT-4o",
            &[Modality::Text, Modality::Image],
            Some(Pricing::new(0.0025, 0.01)),
        ),
        ModelInfo::new(
            "gpt-4o-audio-preview",
            "GPT-4o Audio",
            &[Modality::Text, Modality::Audio],
            Some(Pricing::new(0.0025, 0.01)),
        ),
    ]
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<OpenAiUsage> for Usage {
    fn from(value: OpenAiUsage) -> Self {
        Usage::new(value.prompt_tokens, value.completion_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines_of(lines: &[&str]) -> BoxStream<'static, Result<String, BackendError>> {
        futures_util::stream::iter(
            lines
                .iter()
                .map(|line| Ok(line.to_string()))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    #[tokio::test]
    async fn stream_concatenates_deltas_until_done() {
        let chunks = decode_stream(
            lines_of(&[
                r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
                r#"data: {"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
                r#"data: {"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#,
                "data: [DONE]",
            ]),
            None,
        )
        .collect::<Vec<_>>()
        .await;

        assert_eq!(chunks.len(), 3);
        let last = chunks[2].as_ref().expect("final chunk");
        assert!(last.done);
        assert_eq!(last.finish_reason.as_deref(), Some("stop"));
        assert_eq!(last.usage.expect("usage").total_tokens, 5);
    }

    #[tokio::test]
    async fn truncated_stream_is_a_network_failure() {
        let chunks = decode_stream(
            lines_of(&[r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#]),
            None,
        )
        .collect::<Vec<_>>()
        .await;

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_ok());
        assert!(matches!(chunks[1], Err(BackendError::Network(_))));
    }

    #[test]
    fn payload_carries_system_prompt_and_image_parts() {
        let adapter = OpenAiAdapter::new(
            &BackendConfig::new("openai", BackendKind::OpenAi).with_credential("sk-test"),
        )
        .expect("adapter should build");
        let request = GenerationRequest::new(
            "resume_review",
            vec![
                ContentPart::text("describe"),
                ContentPart::image("image/png", "AAAA"),
            ],
        )
        .with_system("be brief");

        let payload = adapter.payload(&request, "gpt-4o", true);
        assert_eq!(payload["model"], "gpt-4o");
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(
            payload["messages"][1]["content"][1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );
        assert_eq!(payload["stream_options"]["include_usage"], true);
    }

    #[tokio::test]
    async fn missing_credential_fails_before_network() {
        let adapter = OpenAiAdapter::new(&BackendConfig::new("openai", BackendKind::OpenAi))
            .expect("adapter should build");
        assert!(!adapter.has_credential());

        let error = adapter
            .execute(&GenerationRequest::text("general", "hi"), "gpt-4o")
            .await
            .expect_err("call without credential should fail");
        assert!(matches!(error, BackendError::NotConfigured(_)));
    }
}
