use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, ThreadId},
    time::Duration,
};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch, Notify},
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{AiBackend, BackendError},
    dispatcher::{resolve_model, Dispatcher},
    errors::OrchestratorError,
    events::{OrchestratorEvent, StreamOutcome},
    models::{
        unix_millis, GenerationRequest, StreamChunk, StreamCompletion, StreamStart, Timing, Usage,
    },
    registry::BackendEntry,
    telemetry::{CallRecord, Telemetry},
};

/// Receives the events of one streaming session, in order: `on_start`, any number of
/// `on_chunk`, then exactly one of `on_complete` / `on_error`.
pub trait StreamCallbacks: Send + Sync + 'static {
    fn on_start(&self, _start: &StreamStart) {}

    fn on_chunk(&self, chunk: &StreamChunk);

    fn on_complete(&self, completion: &StreamCompletion);

    fn on_error(&self, error: &BackendError);
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start(StreamStart),
    Chunk(StreamChunk),
    Complete(StreamCompletion),
    Error(BackendError),
}

/// Forwards session events into an unbounded channel.
pub struct ChannelCallbacks {
    sender: mpsc::UnboundedSender<StreamEvent>,
}

impl ChannelCallbacks {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }

    fn forward(&self, event: StreamEvent) {
        if self.sender.send(event).is_err() {
            debug!("stream event receiver dropped");
        }
    }
}

impl StreamCallbacks for ChannelCallbacks {
    fn on_start(&self, start: &StreamStart) {
        self.forward(StreamEvent::Start(start.clone()));
    }

    fn on_chunk(&self, chunk: &StreamChunk) {
        self.forward(StreamEvent::Chunk(chunk.clone()));
    }

    fn on_complete(&self, completion: &StreamCompletion) {
        self.forward(StreamEvent::Complete(completion.clone()));
    }

    fn on_error(&self, error: &BackendError) {
        self.forward(StreamEvent::Error(error.clone()));
    }
}

/// Serializes callback delivery against cancellation. Once `cancel` returns, no callback runs,
/// except that a callback calling `cancel` on its own session may finish its current body.
struct DeliveryGate {
    cancelled: AtomicBool,
    terminated: AtomicBool,
    delivering: Mutex<()>,
    owner: Mutex<Option<ThreadId>>,
}

impl DeliveryGate {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            delivering: Mutex::new(()),
            owner: Mutex::new(None),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn owner(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, callback: impl FnOnce()) -> bool {
        let _delivering = self
            .delivering
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() || self.terminated.load(Ordering::SeqCst) {
            return false;
        }
        *self.owner() = Some(thread::current().id());
        callback();
        *self.owner() = None;
        true
    }

    /// At most one terminal event passes the gate.
    fn deliver_terminal(&self, callback: impl FnOnce()) -> bool {
        let _delivering = self
            .delivering
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() || self.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.owner() = Some(thread::current().id());
        callback();
        *self.owner() = None;
        true
    }

    fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        let inside_callback = *self.owner() == Some(thread::current().id());
        if !inside_callback {
            // Wait out a callback that is running on another thread.
            drop(
                self.delivering
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
        }
        true
    }
}

struct SessionShared {
    session_id: String,
    request_id: String,
    backend: String,
    model: String,
    started_at_ms: u64,
    chunk_count: AtomicU64,
    gate: DeliveryGate,
    cancel_signal: Notify,
    outcome: watch::Sender<Option<StreamOutcome>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamSession {
    pub session_id: String,
    pub request_id: String,
    pub backend: String,
    pub model: String,
    pub started_at_ms: u64,
    pub chunk_count: u64,
    pub cancelled: bool,
    pub outcome: Option<StreamOutcome>,
}

/// Cancellation handle for one streaming session.
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<SessionShared>,
}

impl StreamHandle {
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn backend(&self) -> &str {
        &self.shared.backend
    }

    /// Stops further deliveries. Returns `false` when the session was already cancelled.
    pub fn cancel(&self) -> bool {
        if !self.shared.gate.cancel() {
            return false;
        }
        self.shared.cancel_signal.notify_one();
        info!(session_id = %self.shared.session_id, backend = %self.shared.backend, "stream cancelled");
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.gate.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.outcome.borrow().is_some()
    }

    pub fn snapshot(&self) -> StreamSession {
        StreamSession {
            session_id: self.shared.session_id.clone(),
            request_id: self.shared.request_id.clone(),
            backend: self.shared.backend.clone(),
            model: self.shared.model.clone(),
            started_at_ms: self.shared.started_at_ms,
            chunk_count: self.shared.chunk_count.load(Ordering::SeqCst),
            cancelled: self.is_cancelled(),
            outcome: *self.shared.outcome.borrow(),
        }
    }

    /// Resolves once the session has ended, whichever way it ended.
    pub async fn finished(&self) -> StreamOutcome {
        let mut outcome = self.shared.outcome.subscribe();
        let settled = match outcome.wait_for(Option::is_some).await {
            Ok(value) => (*value).unwrap_or(StreamOutcome::Cancelled),
            Err(_) => StreamOutcome::Cancelled,
        };
        settled
    }
}

enum PumpEnd {
    Completed(StreamCompletion),
    Failed(BackendError),
    Cancelled,
}

/// Opens single-backend streaming sessions.
#[derive(Clone)]
pub struct StreamManager {
    dispatcher: Dispatcher,
    telemetry: Arc<Telemetry>,
}

impl StreamManager {
    pub fn new(dispatcher: Dispatcher, telemetry: Arc<Telemetry>) -> Self {
        Self {
            dispatcher,
            telemetry,
        }
    }

    /// Picks a backend the way sequential dispatch does and starts pumping its stream.
    pub async fn start(
        &self,
        request: GenerationRequest,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> Result<StreamHandle, OrchestratorError> {
        let eligible = self.dispatcher.eligible(&request).await?;
        let entry = self
            .dispatcher
            .select(&eligible)
            .ok_or_else(|| OrchestratorError::NoCapableBackend {
                modalities: request.modalities.clone(),
            })?;
        let model = resolve_model(&entry, &request);
        let limit = self.dispatcher.call_timeout(&request);

        let (outcome, _) = watch::channel(None);
        let shared = Arc::new(SessionShared {
            session_id: format!("stream_{}", Uuid::new_v4()),
            request_id: request.id.clone(),
            backend: entry.id.clone(),
            model: model
                .as_ref()
                .cloned()
                .unwrap_or_else(|_| entry.adapter.current_model()),
            started_at_ms: unix_millis(),
            chunk_count: AtomicU64::new(0),
            gate: DeliveryGate::new(),
            cancel_signal: Notify::new(),
            outcome,
        });

        info!(
            session_id = %shared.session_id,
            request_id = %request.id,
            backend = %entry.id,
            model = %shared.model,
            "stream started"
        );
        self.telemetry.emit(OrchestratorEvent::StreamStarted {
            session_id: shared.session_id.clone(),
            request_id: request.id.clone(),
            backend: entry.id.clone(),
        });

        let pump = Pump {
            shared: Arc::clone(&shared),
            entry,
            request,
            callbacks,
            telemetry: Arc::clone(&self.telemetry),
            limit,
        };
        tokio::spawn(pump.run(model));

        Ok(StreamHandle { shared })
    }
}

struct Pump {
    shared: Arc<SessionShared>,
    entry: Arc<BackendEntry>,
    request: GenerationRequest,
    callbacks: Arc<dyn StreamCallbacks>,
    telemetry: Arc<Telemetry>,
    limit: Duration,
}

impl Pump {
    async fn run(self, model: Result<String, BackendError>) {
        let _active = self.entry.begin();
        let started = Instant::now();
        let start = StreamStart {
            session_id: self.shared.session_id.clone(),
            request_id: self.shared.request_id.clone(),
            backend: self.shared.backend.clone(),
            model: self.shared.model.clone(),
            started_at_ms: self.shared.started_at_ms,
        };
        self.shared
            .gate
            .deliver(|| self.callbacks.on_start(&start));

        let end = tokio::select! {
            _ = self.shared.cancel_signal.notified() => PumpEnd::Cancelled,
            end = self.drive(model, started) => end,
        };

        let outcome = match &end {
            PumpEnd::Completed(completion) => {
                if self
                    .shared
                    .gate
                    .deliver_terminal(|| self.callbacks.on_complete(completion))
                {
                    StreamOutcome::Completed
                } else {
                    StreamOutcome::Cancelled
                }
            }
            PumpEnd::Failed(error) => {
                self.entry.record_error();
                if self
                    .shared
                    .gate
                    .deliver_terminal(|| self.callbacks.on_error(error))
                {
                    StreamOutcome::Failed
                } else {
                    StreamOutcome::Cancelled
                }
            }
            PumpEnd::Cancelled => StreamOutcome::Cancelled,
        };

        let (usage, error) = match &end {
            PumpEnd::Completed(completion) => (Some(completion.usage), None),
            PumpEnd::Failed(error) => (None, Some(error.clone())),
            PumpEnd::Cancelled => (None, None),
        };
        self.telemetry
            .record_call(CallRecord {
                backend: &self.shared.backend,
                model: &self.shared.model,
                task: &self.request.task,
                mode: self.request.mode,
                latency: started.elapsed(),
                usage: usage.as_ref(),
                error: error.as_ref(),
            })
            .await;
        self.telemetry
            .metrics
            .observe_stream(&self.shared.backend, outcome.as_str());

        let chunk_count = self.shared.chunk_count.load(Ordering::SeqCst);
        match &error {
            Some(error) => warn!(
                session_id = %self.shared.session_id,
                backend = %self.shared.backend,
                chunk_count,
                %error,
                "stream failed"
            ),
            None => info!(
                session_id = %self.shared.session_id,
                backend = %self.shared.backend,
                outcome = outcome.as_str(),
                chunk_count,
                latency_ms = started.elapsed().as_millis() as u64,
                "stream finished"
            ),
        }
        self.telemetry.emit(OrchestratorEvent::StreamFinished {
            session_id: self.shared.session_id.clone(),
            backend: self.shared.backend.clone(),
            outcome,
            chunk_count,
        });
        self.shared.outcome.send_replace(Some(outcome));
    }

    async fn drive(&self, model: Result<String, BackendError>, started: Instant) -> PumpEnd {
        let model = match model {
            Ok(model) => model,
            Err(error) => return PumpEnd::Failed(error),
        };

        let opened = timeout(self.limit, self.entry.adapter.stream(&self.request, &model)).await;
        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => return PumpEnd::Failed(error),
            Err(_) => {
                return PumpEnd::Failed(BackendError::Timeout(format!(
                    "stream did not open within {}ms",
                    self.limit.as_millis()
                )))
            }
        };

        let mut content = String::new();
        let mut usage: Option<Usage> = None;
        let mut finish_reason: Option<String> = None;
        let mut first_chunk_at: Option<Duration> = None;
        loop {
            let next = match timeout(self.limit, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    return PumpEnd::Failed(BackendError::Timeout(format!(
                        "no chunk within {}ms",
                        self.limit.as_millis()
                    )))
                }
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(error)) => return PumpEnd::Failed(error),
                None => {
                    return PumpEnd::Failed(BackendError::Network(
                        "stream ended before completion".to_owned(),
                    ))
                }
            };

            if let Some(delta) = chunk.delta.filter(|delta| !delta.is_empty()) {
                first_chunk_at.get_or_insert_with(|| started.elapsed());
                content.push_str(&delta);
                let event = StreamChunk {
                    session_id: self.shared.session_id.clone(),
                    index: self.shared.chunk_count.fetch_add(1, Ordering::SeqCst),
                    delta,
                };
                if !self
                    .shared
                    .gate
                    .deliver(|| self.callbacks.on_chunk(&event))
                {
                    return PumpEnd::Cancelled;
                }
            }
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
            if chunk.finish_reason.is_some() {
                finish_reason = chunk.finish_reason;
            }

            if chunk.done {
                let total = started.elapsed();
                let processing = total.saturating_sub(first_chunk_at.unwrap_or_default());
                return PumpEnd::Completed(StreamCompletion {
                    session_id: self.shared.session_id.clone(),
                    backend: self.shared.backend.clone(),
                    model,
                    content,
                    chunk_count: self.shared.chunk_count.load(Ordering::SeqCst),
                    finish_reason: finish_reason.unwrap_or_else(|| "stop".to_owned()),
                    usage: usage.unwrap_or_default(),
                    timing: Timing::measured(self.shared.started_at_ms, total, processing),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::{
        backend::mock::MockBackend, config::{BackendConfig, OrchestratorConfig},
        metrics::AppMetrics, registry::BackendRegistry,
    };

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, event: String) {
            self.events.lock().expect("recorder lock").push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().expect("recorder lock").clone()
        }
    }

    impl StreamCallbacks for Recorder {
        fn on_start(&self, _start: &StreamStart) {
            self.push("start".to_owned());
        }

        fn on_chunk(&self, chunk: &StreamChunk) {
            self.push(format!("chunk:{}", chunk.delta));
        }

        fn on_complete(&self, completion: &StreamCompletion) {
            self.push(format!("complete:{}", completion.content));
        }

        fn on_error(&self, error: &BackendError) {
            self.push(format!("error:{}", error.label()));
        }
    }

    async fn manager_with(backend: MockBackend) -> StreamManager {
        let registry = Arc::new(BackendRegistry::new());
        registry
            .register(backend.into(), &BackendConfig::mock("streamer"))
            .await
            .expect("registration should succeed");
        let telemetry = Arc::new(Telemetry::new(8, 8, AppMetrics::new()));
        let dispatcher = Dispatcher::new(
            registry,
            Arc::clone(&telemetry),
            &OrchestratorConfig::default(),
        );
        StreamManager::new(dispatcher, telemetry)
    }

    #[tokio::test]
    async fn mid_stream_failure_delivers_single_error() {
        let backend = MockBackend::named("streamer")
            .with_chunks(["a", "b", "c"])
            .with_stream_failure(2, BackendError::Network("reset".to_owned()));
        let manager = manager_with(backend).await;
        let recorder = Arc::new(Recorder::default());

        let handle = manager
            .start(GenerationRequest::text("general", "hi"), recorder.clone())
            .await
            .expect("stream should start");
        assert_eq!(handle.finished().await, StreamOutcome::Failed);

        assert_eq!(
            recorder.events(),
            vec!["start", "chunk:a", "chunk:b", "error:network"]
        );
    }

    #[tokio::test]
    async fn second_cancel_is_a_no_op() {
        let backend = MockBackend::named("streamer")
            .with_chunks(["a", "b", "c"])
            .with_token_delay(Duration::from_millis(50));
        let manager = manager_with(backend).await;
        let recorder = Arc::new(Recorder::default());

        let handle = manager
            .start(GenerationRequest::text("general", "hi"), recorder.clone())
            .await
            .expect("stream should start");

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(handle.finished().await, StreamOutcome::Cancelled);
        assert!(handle.snapshot().cancelled);
    }

    struct CancelOnFirstChunk {
        handle: StdMutex<Option<StreamHandle>>,
        recorder: Recorder,
    }

    impl StreamCallbacks for CancelOnFirstChunk {
        fn on_chunk(&self, chunk: &StreamChunk) {
            self.recorder.on_chunk(chunk);
            if let Some(handle) = self.handle.lock().expect("handle lock").as_ref() {
                handle.cancel();
            }
        }

        fn on_complete(&self, completion: &StreamCompletion) {
            self.recorder.on_complete(completion);
        }

        fn on_error(&self, error: &BackendError) {
            self.recorder.on_error(error);
        }
    }

    #[tokio::test]
    async fn cancelling_from_inside_a_callback_does_not_deadlock() {
        let backend = MockBackend::named("streamer")
            .with_chunks(["a", "b", "c"])
            .with_token_delay(Duration::from_millis(30))
            .with_latency(Duration::from_millis(30));
        let manager = manager_with(backend).await;
        let callbacks = Arc::new(CancelOnFirstChunk {
            handle: StdMutex::new(None),
            recorder: Recorder::default(),
        });

        let handle = manager
            .start(GenerationRequest::text("general", "hi"), callbacks.clone())
            .await
            .expect("stream should start");
        *callbacks.handle.lock().expect("handle lock") = Some(handle.clone());

        assert_eq!(handle.finished().await, StreamOutcome::Cancelled);
        assert_eq!(callbacks.recorder.events(), vec!["chunk:a"]);
    }
}
