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
        BackendChunk, BackendOutput, ContentPart, GenerationRequest, Modality, ModelInfo, Pricing,
        ResponseContent, Usage,
    },
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const CAPABILITIES: &[Modality] = &[
    Modality::Text,
    Modality::Image,
    Modality::Audio,
    Modality::Video,
];

pub struct GeminiAdapter {
    id: String,
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    models: ModelSlot,
}

impl GeminiAdapter {
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

    fn api_key(&self) -> Result<&str, BackendError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| missing_credential(&self.id))
    }

    fn payload(request: &GenerationRequest) -> Value {
        let mut payload = json!({
            "contents": [{
                "role": "user",
                "parts": request.parts.iter().map(content_part).collect::<Vec<_>>(),
            }],
            "generationConfig": {
                "temperature": request.options.temperature,
                "maxOutputTokens": request.options.max_output_tokens,
            },
        });
        if let Some(system) = &request.system {
            payload["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        payload
    }

    async fn post(&self, url: String, payload: &Value) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", self.api_key()?)
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
impl AiBackend for GeminiAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Gemini
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
        let url = format!("{}/models/{model}:generateContent", self.base_url);
        let response = self.post(url, &Self::payload(request)).await?;
        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;

        let candidate = parsed.first_candidate()?;
        let mut text = String::new();
        let mut image = None;
        let mut generated_assets = 0u32;
        for part in candidate.content.iter().flat_map(|content| &content.parts) {
            if let Some(fragment) = &part.text {
                text.push_str(fragment);
            }
            if let Some(inline) = &part.inline_data {
                generated_assets += 1;
                image.get_or_insert_with(|| ResponseContent::Image {
                    mime_type: inline.mime_type.clone(),
                    data: inline.data.clone(),
                });
            }
        }

        let finish_reason = candidate
            .finish_reason
            .clone()
            .unwrap_or_else(|| "STOP".to_owned());
        let mut usage = parsed
            .usage_metadata
            .as_ref()
            .map(Usage::from)
            .unwrap_or_default()
            .priced(self.models.pricing(model).as_ref());
        usage.generated_assets = generated_assets;

        Ok(BackendOutput {
            content: image.unwrap_or(ResponseContent::Text { text }),
            model: model.to_owned(),
            finish_reason,
            usage,
        })
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
        model: &str,
    ) -> Result<BackendStream, BackendError> {
        let url = format!(
            "{}/models/{model}:streamGenerateContent?alt=sse",
            self.base_url
        );
        let response = self.post(url, &Self::payload(request)).await?;
        let stream = decode_stream(sse::lines(response), self.models.pricing(model));

        debug!(backend = %self.id, model, "stream prepared");
        Ok(stream)
    }

    async fn check_health(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("x-goog-api-key", self.api_key()?)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(error_for_response(response).await);
        }
        Ok(())
    }
}

fn content_part(part: &ContentPart) -> Value {
    match part {
        ContentPart::Text { text } => json!({"text": text}),
        ContentPart::Image { mime_type, data }
        | ContentPart::Audio { mime_type, data }
        | ContentPart::Video { mime_type, data } => json!({
            "inline_data": {"mime_type": mime_type, "data": data},
        }),
    }
}

fn builtin_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo::new(
            "gemini-1.5-flash",
            "Gemini 1.5 Flash",
            CAPABILITIES,
            Some(Pricing::new(0.000075, 0.0003)),
        ),
        ModelInfo::new(
            "gemini-1.5-pro",
            "Gemini 1.5 Pro",
            CAPABILITIES,
            Some(Pricing::new(0.00125, 0.005)),
        ),
    ]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<GeminiPromptFeedback>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

impl GeminiResponse {
    /// First candidate, with safety blocks surfaced as errors.
    fn first_candidate(&self) -> Result<&GeminiCandidate, BackendError> {
        if let Some(reason) = self
            .prompt_feedback
            .as_ref()
            .and_then(|feedback| feedback.block_reason.as_deref())
        {
            return Err(BackendError::SafetyBlocked(format!("prompt blocked: {reason}")));
        }
        let candidate = self
            .candidates
            .first()
            .ok_or_else(|| BackendError::InvalidResponse("missing candidates".to_owned()))?;
        if candidate.finish_reason.as_deref() == Some("SAFETY") {
            return Err(BackendError::SafetyBlocked(
                "candidate stopped for safety".to_owned(),
            ));
        }
        Ok(candidate)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    inline_data: Option<GeminiInlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

impl From<&GeminiUsage> for Usage {
    fn from(value: &GeminiUsage) -> Self {
        Usage::new(value.prompt_token_count, value.candidates_token_count)
    }
}

/// Decodes `streamGenerateContent` SSE lines. The last candidate carries the finish reason;
/// a body that stops without one is reported as a network failure.
fn decode_stream(
    mut lines: BoxStream<'static, Result<String, BackendError>>,
    pricing: Option<Pricing>,
) -> BackendStream {
    let stream = async_stream::stream! {
        let mut final_usage: Option<Usage> = None;
        let mut finish_reason: Option<String> = None;

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

            let parsed: GeminiResponse = match serde_json::from_str(payload) {
                Ok(parsed) => parsed,
                Err(error) => {
                    yield Err(BackendError::InvalidResponse(error.to_string()));
                    return;
                }
            };
            if let Some(usage) = &parsed.usage_metadata {
                final_usage = Some(Usage::from(usage).priced(pricing.as_ref()));
            }
            if parsed.candidates.is_empty() && parsed.prompt_feedback.is_none() {
                continue;
            }
            let candidate = match parsed.first_candidate() {
                Ok(candidate) => candidate,
                Err(error) => {
                    yield Err(error);
                    return;
                }
            };

            let text = candidate
                .content
                .iter()
                .flat_map(|content| &content.parts)
                .filter_map(|part| part.text.as_deref())
                .collect::<String>();
            if let Some(reason) = candidate.finish_reason.clone() {
                finish_reason = Some(reason);
            }
            if !text.is_empty() {
                yield Ok(BackendChunk::delta(text));
            }
        }

        let Some(finish_reason) = finish_reason else {
            yield Err(BackendError::Network("stream ended before completion".to_owned()));
            return;
        };
        yield Ok(BackendChunk::finished(finish_reason, final_usage));
    };

    stream.boxed()
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
    async fn stream_finishes_on_finish_reason() {
        let chunks = decode_stream(
            lines_of(&[
                r#"data: {"candidates":[{"content":{"parts":[{"text":"Hi"}]}}]}"#,
                r#"data: {"candidates":[{"content":{"parts":[{"text":" there"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":2,"candidatesTokenCount":2}}"#,
            ]),
            None,
        )
        .collect::<Vec<_>>()
        .await;

        assert_eq!(chunks.len(), 3);
        let last = chunks[2].as_ref().expect("final chunk");
        assert!(last.done);
        assert_eq!(last.finish_reason.as_deref(), Some("STOP"));
    }

    #[tokio::test]
    async fn stream_without_finish_reason_is_a_network_failure() {
        let chunks = decode_stream(
            lines_of(&[r#"data: {"candidates":[{"content":{"parts":[{"text":"Hi"}]}}]}"#]),
            None,
        )
        .collect::<Vec<_>>()
        .await;

        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[1], Err(BackendError::Network(_))));
    }

    #[test]
    fn blocked_prompt_maps_to_safety_error() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[],"promptFeedback":{"blockReason":"SAFETY"}}"#,
        )
        .expect("response should decode");

        let error = response
            .first_candidate()
            .expect_err("blocked prompt should fail");
        assert!(matches!(error, BackendError::SafetyBlocked(_)));
    }

    #[test]
    fn candidate_text_and_usage_decode() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hello"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":1}}"#,
        )
        .expect("response should decode");

        let candidate = response.first_candidate().expect("candidate should exist");
        let parts = &candidate.content.as_ref().expect("content").parts;
        assert_eq!(parts[0].text.as_deref(), Some("Hello"));
        let usage = Usage::from(response.usage_metadata.as_ref().expect("usage"));
        assert_eq!(usage.total_tokens, 4);
    }

    #[test]
    fn media_parts_become_inline_data() {
        let request = GenerationRequest::new(
            "interview_practice",
            vec![ContentPart::Video {
                mime_type: "video/mp4".to_owned(),
                data: "AAAA".to_owned(),
            }],
        );
        let payload = GeminiAdapter::payload(&request);
        assert_eq!(
            payload["contents"][0]["parts"][0]["inline_data"]["mime_type"],
            "video/mp4"
        );
    }
}
