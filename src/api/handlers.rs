//! HTTP request handlers

use super::types::{ChatRequest, ChatResponse, ErrorResponse, RootResponse, ThreadResponse};
use super::AppState;
use crate::runtime::{RuntimeManager, TurnError, TurnOutcome};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        // Start a conversation
        .route("/api/demo-agent", post(start_thread))
        // Continue or read a conversation
        .route(
            "/api/demo-agent/:thread_id",
            get(get_thread).post(continue_thread),
        )
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Fairfax County construction research agent. POST /api/demo-agent to ask a question.",
    })
}

// ============================================================
// Turns
// ============================================================

async fn start_thread(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    if req.message.trim().is_empty() {
        return Err(AppError::BadRequest {
            message: "Message must not be empty".to_string(),
            thread_id: None,
        });
    }

    let thread_id = RuntimeManager::new_conversation_id();
    let outcome = state
        .runtime
        .start_conversation(&thread_id, req.message)
        .await
        .map_err(|e| AppError::turn(e, &thread_id))?;
    Ok(Json(outcome.into()))
}

async fn continue_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    if req.message.trim().is_empty() {
        return Err(AppError::BadRequest {
            message: "Message must not be empty".to_string(),
            thread_id: Some(thread_id),
        });
    }

    let outcome = state
        .runtime
        .continue_conversation(&thread_id, req.message)
        .await
        .map_err(|e| AppError::turn(e, &thread_id))?;
    Ok(Json(outcome.into()))
}

async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<ThreadResponse>, AppError> {
    let messages = state
        .runtime
        .get_transcript(&thread_id)
        .await
        .map_err(|e| AppError::turn(e, &thread_id))?;
    Ok(Json(ThreadResponse {
        thread_id,
        messages,
    }))
}

async fn get_version() -> &'static str {
    concat!("research-agent ", env!("CARGO_PKG_VERSION"))
}

impl From<TurnOutcome> for ChatResponse {
    fn from(outcome: TurnOutcome) -> Self {
        Self {
            answer: outcome.answer,
            thread_id: outcome.conversation_id,
            sources: outcome.sources,
            kind: outcome.kind,
        }
    }
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest {
        message: String,
        thread_id: Option<String>,
    },
    Turn {
        error: TurnError,
        thread_id: String,
    },
}

impl AppError {
    fn turn(error: TurnError, thread_id: &str) -> Self {
        AppError::Turn {
            error,
            thread_id: thread_id.to_string(),
        }
    }
}

fn turn_error_status(error: &TurnError) -> StatusCode {
    match error {
        TurnError::ModelProvider { .. } => StatusCode::BAD_GATEWAY,
        TurnError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
        TurnError::EmptyMessage => StatusCode::BAD_REQUEST,
        TurnError::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        TurnError::StoreUnavailable(_)
        | TurnError::Cancelled
        | TurnError::RuntimeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        TurnError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::BadRequest { message, thread_id } => {
                (StatusCode::BAD_REQUEST, ErrorResponse::new(message, thread_id))
            }
            AppError::Turn { error, thread_id } => {
                let status = turn_error_status(&error);
                if let TurnError::ModelProvider { kind, .. } = &error {
                    tracing::warn!(thread_id = %thread_id, kind = ?kind, error = %error, "Model provider failed");
                } else if status.is_server_error() {
                    tracing::error!(thread_id = %thread_id, error = %error, "Turn failed");
                }
                (status, ErrorResponse::new(error.to_string(), Some(thread_id)))
            }
        };

        (status, Json(body)).into_response()
    }
}
