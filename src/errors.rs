use std::collections::BTreeSet;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::{
    backend::BackendError,
    models::{format_modalities, Modality},
};

/// One backend's reason for losing a race.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BackendFailure {
    pub backend: String,
    pub error: BackendError,
}

#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    #[error("orchestrator has not been initialized")]
    NotInitialized,
    #[error("orchestrator is already initialized")]
    AlreadyInitialized,
    #[error("no backend became healthy during initialization ({total} configured)")]
    NoHealthyBackends { total: usize },
    #[error("backend {0} is already registered")]
    DuplicateBackend(String),
    #[error("no healthy backend supports [{}]", format_modalities(.modalities))]
    NoCapableBackend { modalities: BTreeSet<Modality> },
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
    #[error("backend {backend} does not offer model {model}")]
    UnknownModel { backend: String, model: String },
    #[error("all {} backends failed: {}", .failures.len(), format_failures(.failures))]
    AggregateFailure { failures: Vec<BackendFailure> },
}

fn format_failures(failures: &[BackendFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{}: {}", failure.backend, failure.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Orchestrator(#[from] OrchestratorError),
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failures: Vec<BackendFailure>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            AppError::BadRequest(_) => {
                make_error_response(StatusCode::BAD_REQUEST, "invalid_request_error", message)
            }
            AppError::NotFound(_) => make_error_response(StatusCode::NOT_FOUND, "not_found", message),
            AppError::Orchestrator(error) => match error {
                OrchestratorError::NotInitialized | OrchestratorError::NoHealthyBackends { .. } => {
                    make_error_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
                }
                OrchestratorError::NoCapableBackend { .. } => make_error_response(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "no_capable_backend",
                    message,
                ),
                OrchestratorError::UnknownBackend(_) | OrchestratorError::UnknownModel { .. } => {
                    make_error_response(StatusCode::NOT_FOUND, "not_found", message)
                }
                OrchestratorError::AggregateFailure { failures } => {
                    let payload = ErrorEnvelope {
                        error: ErrorBody {
                            message,
                            error_type: "aggregate_failure",
                            failures,
                        },
                    };
                    (StatusCode::BAD_GATEWAY, Json(payload)).into_response()
                }
                OrchestratorError::AlreadyInitialized | OrchestratorError::DuplicateBackend(_) => {
                    make_error_response(StatusCode::CONFLICT, "conflict", message)
                }
            },
            AppError::Internal(_) => {
                make_error_response(StatusCode::INTERNAL_SERVER_ERROR, "server_error", message)
            }
        }
    }
}

fn make_error_response(status: StatusCode, error_type: &'static str, message: String) -> Response {
    let payload = ErrorEnvelope {
        error: ErrorBody {
            message,
            error_type,
            failures: Vec::new(),
        },
    };

    (status, Json(payload)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_message_names_every_backend() {
        let error = OrchestratorError::AggregateFailure {
            failures: vec![
                BackendFailure {
                    backend: "alpha".to_owned(),
                    error: BackendError::Timeout("30s".to_owned()),
                },
                BackendFailure {
                    backend: "beta".to_owned(),
                    error: BackendError::Auth("rejected".to_owned()),
                },
            ],
        };

        let message = error.to_string();
        assert!(message.starts_with("all 2 backends failed"));
        assert!(message.contains("alpha: timeout: 30s"));
        assert!(message.contains("beta: authentication failed: rejected"));
    }

    #[test]
    fn no_capable_backend_lists_modalities() {
        let error = OrchestratorError::NoCapableBackend {
            modalities: BTreeSet::from([Modality::Image, Modality::Text]),
        };
        assert_eq!(error.to_string(), "no healthy backend supports [text,image]");
    }
}
