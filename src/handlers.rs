use std::{convert::Infallible, time::Instant};

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::{
    errors::AppError,
    models::GenerateRequestBody,
    state::AppState,
    streaming::{ChannelCallbacks, StreamEvent, StreamHandle},
};

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.orchestrator.render_metrics().await {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn generate(
    State(state): State<AppState>,
    Json(body): Json<GenerateRequestBody>,
) -> Response {
    let started = Instant::now();
    let _inflight = state.metrics.inflight_guard();

    let response = match process_generate(&state, body).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };

    state.metrics.observe_request(
        "/v1/generate",
        "POST",
        false,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

async fn process_generate(state: &AppState, body: GenerateRequestBody) -> Result<Response, AppError> {
    let request = body.into_request().map_err(AppError::BadRequest)?;
    let response = state.orchestrator.execute_request(request).await?;

    // Adapter failures arrive as values; surface them as a gateway error with the full record.
    let status = if response.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    Ok((status, Json(response)).into_response())
}

pub async fn generate_stream(
    State(state): State<AppState>,
    Json(body): Json<GenerateRequestBody>,
) -> Response {
    let started = Instant::now();
    let response = match process_generate_stream(&state, body).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };

    state.metrics.observe_request(
        "/v1/generate/stream",
        "POST",
        true,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

async fn process_generate_stream(
    state: &AppState,
    body: GenerateRequestBody,
) -> Result<Response, AppError> {
    let request = body.into_request().map_err(AppError::BadRequest)?;
    let (callbacks, mut events) = ChannelCallbacks::channel();
    let handle = state
        .orchestrator
        .stream_request(request, callbacks)
        .await?;
    info!(session_id = %handle.session_id(), backend = %handle.backend(), "sse stream opened");

    let outbound = async_stream::stream! {
        let _cancel = CancelOnDrop(handle);
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Start(start) => yield Ok::<Event, Infallible>(json_event("start", &start)),
                StreamEvent::Chunk(chunk) => yield Ok::<Event, Infallible>(json_event("chunk", &chunk)),
                StreamEvent::Complete(completion) => {
                    yield Ok::<Event, Infallible>(json_event("complete", &completion));
                    break;
                }
                StreamEvent::Error(error) => {
                    warn!(%error, "backend stream error");
                    yield Ok::<Event, Infallible>(json_event("error", &json!({
                        "error": {
                            "message": error.to_string(),
                            "type": error.label(),
                        }
                    })));
                    break;
                }
            }
        }
    };

    Ok(Sse::new(outbound)
        .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(10)))
        .into_response())
}

/// Cancels the session when the client goes away before it finished.
struct CancelOnDrop(StreamHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.0.is_finished() {
            self.0.cancel();
        }
    }
}

pub async fn list_models(State(state): State<AppState>) -> Response {
    let models = state.orchestrator.list_models().await;
    Json(json!({ "models": models })).into_response()
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SwitchModelBody {
    pub backend: String,
    pub model: String,
}

pub async fn switch_model(
    State(state): State<AppState>,
    Json(body): Json<SwitchModelBody>,
) -> Result<Json<SwitchModelBody>, AppError> {
    state
        .orchestrator
        .try_switch_model(&body.backend, &body.model)
        .await?;
    Ok(Json(body))
}

pub async fn health(State(state): State<AppState>) -> Response {
    let overview = state.orchestrator.health_overview().await;
    let backends = state.orchestrator.backend_statuses().await;
    Json(json!({ "overview": overview, "backends": backends })).into_response()
}

pub async fn performance(State(state): State<AppState>) -> Response {
    Json(state.orchestrator.performance_report().await).into_response()
}

fn json_event<T: Serialize>(name: &str, payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(serialized) => Event::default().event(name).data(serialized),
        Err(error) => {
            let fallback = json!({
                "error": {
                    "message": format!("serialization error: {error}"),
                    "type": "server_error"
                }
            });
            Event::default().event("error").data(fallback.to_string())
        }
    }
}
