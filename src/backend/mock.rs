use std::{
    collections::{BTreeSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{sync::mpsc, time::sleep};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::backend::{AiBackend, BackendError, BackendKind, BackendStream, ModelSlot};
use crate::models::{
    rough_token_estimate, BackendChunk, BackendOutput, GenerationRequest, Modality, ModelInfo,
    Pricing, ResponseContent, Usage,
};

/// In-process backend with scriptable latency, replies and failures.
#[derive(Clone)]
pub struct MockBackend {
    name: String,
    capabilities: BTreeSet<Modality>,
    latency: Duration,
    token_delay: Duration,
    reply: Option<String>,
    chunks: Option<Vec<String>>,
    models: Arc<ModelSlot>,
    script: Arc<Mutex<MockScript>>,
    calls: Arc<AtomicUsize>,
}

#[derive(Default)]
struct MockScript {
    always_fail: Option<BackendError>,
    queued_failures: VecDeque<BackendError>,
    probe_results: VecDeque<Result<(), BackendError>>,
    probe_failure: Option<BackendError>,
    stream_failure: Option<(usize, BackendError)>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::named("mock-backend")
    }
}

impl MockBackend {
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        let models = Arc::new(ModelSlot::new(&name, builtin_models(), &[], &[Modality::Text]));
        Self {
            name,
            capabilities: BTreeSet::from([Modality::Text]),
            latency: Duration::ZERO,
            token_delay: Duration::from_millis(5),
            reply: None,
            chunks: None,
            models,
            script: Arc::new(Mutex::new(MockScript::default())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[Modality]) -> Self {
        self.capabilities = capabilities.iter().copied().collect();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_token_delay(mut self, token_delay: Duration) -> Self {
        self.token_delay = token_delay;
        self
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Exact chunks emitted by `stream`; their concatenation is also the `execute` reply.
    pub fn with_chunks<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chunks = Some(chunks.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_models(mut self, declared: &[String]) -> Self {
        let defaults = self.capabilities.iter().copied().collect::<Vec<_>>();
        self.models = Arc::new(ModelSlot::new(
            &self.name,
            builtin_models(),
            declared,
            &defaults,
        ));
        self
    }

    /// Every call fails with `error`.
    pub fn failing(self, error: BackendError) -> Self {
        self.script().always_fail = Some(error);
        self
    }

    /// Streams fail with `error` after `after` chunks were sent.
    pub fn with_stream_failure(self, after: usize, error: BackendError) -> Self {
        self.script().stream_failure = Some((after, error));
        self
    }

    /// The next call fails with `error`; queued failures are consumed in order.
    pub fn fail_next(&self, error: BackendError) {
        self.script().queued_failures.push_back(error);
    }

    /// Queues the outcome of the next health probe.
    pub fn push_probe(&self, result: Result<(), BackendError>) {
        self.script().probe_results.push_back(result);
    }

    /// Probes fail with `error` until `recover_probes` is called.
    pub fn fail_probes(&self, error: BackendError) {
        self.script().probe_failure = Some(error);
    }

    pub fn recover_probes(&self) {
        self.script().probe_failure = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn script(&self) -> MutexGuard<'_, MockScript> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scripted_failure(&self) -> Option<BackendError> {
        let mut script = self.script();
        if let Some(error) = script.always_fail.clone() {
            return Some(error);
        }
        script.queued_failures.pop_front()
    }

    fn render_reply(&self, request: &GenerationRequest, model: &str) -> String {
        if let Some(chunks) = &self.chunks {
            return chunks.concat();
        }
        if let Some(reply) = &self.reply {
            return reply.clone();
        }
        let prompt = request.prompt_text();
        let prompt = if prompt.trim().is_empty() {
            "hello"
        } else {
            prompt.as_str()
        };
        format!("Mock response from {} ({model}): {prompt}", self.name)
    }

    fn estimate_usage(&self, request: &GenerationRequest, model: &str, completion: &str) -> Usage {
        Usage::new(
            rough_token_estimate(&request.prompt_text()),
            rough_token_estimate(completion),
        )
        .priced(self.models.pricing(model).as_ref())
    }
}

#[async_trait]
impl AiBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }

    fn capabilities(&self) -> BTreeSet<Modality> {
        self.capabilities.clone()
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
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        if let Some(error) = self.scripted_failure() {
            return Err(error);
        }

        let content = self.render_reply(request, model);
        let usage = self.estimate_usage(request, model, &content);
        Ok(BackendOutput {
            content: ResponseContent::Text { text: content },
            model: model.to_owned(),
            finish_reason: "stop".to_owned(),
            usage,
        })
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
        model: &str,
    ) -> Result<BackendStream, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        if let Some(error) = self.scripted_failure() {
            return Err(error);
        }

        let content = self.render_reply(request, model);
        let usage = self.estimate_usage(request, model, &content);
        let tokens = self
            .chunks
            .clone()
            .unwrap_or_else(|| split_for_stream(&content));
        let failure = self.script().stream_failure.clone();
        let delay = self.token_delay;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            for (index, token) in tokens.into_iter().enumerate() {
                if let Some((after, error)) = &failure {
                    if index == *after {
                        let _ = tx.send(Err(error.clone())).await;
                        return;
                    }
                }
                if tx.send(Ok(BackendChunk::delta(token))).await.is_err() {
                    return;
                }
                sleep(delay).await;
            }

            if let Some((_, error)) = failure {
                let _ = tx.send(Err(error)).await;
                return;
            }
            let _ = tx
                .send(Ok(BackendChunk::finished("stop", Some(usage))))
                .await;
        });

        debug!(backend = %self.name, "stream prepared");
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn check_health(&self) -> Result<(), BackendError> {
        let mut script = self.script();
        if let Some(result) = script.probe_results.pop_front() {
            return result;
        }
        match &script.probe_failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

fn builtin_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo::new(
            "mock-small",
            "Mock Small",
            &[Modality::Text],
            Some(Pricing::new(0.001, 0.002)),
        ),
        ModelInfo::new(
            "mock-large",
            "Mock Large",
            &[Modality::Text, Modality::Image, Modality::Audio, Modality::Video],
            Some(Pricing::new(0.01, 0.02)),
        ),
    ]
}

fn split_for_stream(text: &str) -> Vec<String> {
    let tokens: Vec<String> = text.split_whitespace().map(ToString::to_string).collect();
    let len = tokens.len();

    tokens
        .into_iter()
        .enumerate()
        .map(|(index, token)| {
            if index + 1 == len {
                token
            } else {
                format!("{token} ")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_failures_are_consumed_in_order() {
        let backend = MockBackend::named("scripted").with_reply("ok");
        backend.fail_next(BackendError::Timeout("first".to_owned()));
        let request = GenerationRequest::text("general", "hi");

        let first = backend.execute(&request, "mock-small").await;
        let second = backend.execute(&request, "mock-small").await;

        assert!(matches!(first, Err(BackendError::Timeout(_))));
        let output = second.expect("second call should succeed");
        assert_eq!(output.content.as_text(), Some("ok"));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn stream_emits_configured_chunks_then_done() {
        let backend = MockBackend::named("streamer").with_chunks(["a", "b"]);
        let mut stream = backend
            .stream(&GenerationRequest::text("general", "hi"), "mock-small")
            .await
            .expect("stream should start");

        let mut deltas = Vec::new();
        let mut done = false;
        while let Some(next) = stream.next().await {
            let chunk = next.expect("chunk should be ok");
            if let Some(delta) = chunk.delta {
                deltas.push(delta);
            }
            done = chunk.done;
        }

        assert_eq!(deltas, vec!["a", "b"]);
        assert!(done);
    }

    #[tokio::test]
    async fn probe_results_follow_script() {
        let backend = MockBackend::named("probed");
        backend.push_probe(Err(BackendError::Network("down".to_owned())));

        assert!(backend.check_health().await.is_err());
        assert!(backend.check_health().await.is_ok());

        backend.fail_probes(BackendError::Auth("revoked".to_owned()));
        assert!(backend.check_health().await.is_err());
        backend.recover_probes();
        assert!(backend.check_health().await.is_ok());
    }
}
