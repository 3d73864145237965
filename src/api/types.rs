//! API request and response types

use crate::db::Message;
use crate::state_machine::{SourceMetadata, TurnKind};
use serde::{Deserialize, Serialize};

/// Request carrying one user message
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

/// Response for a completed turn
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub answer: String,
    pub thread_id: String,
    pub sources: Vec<SourceMetadata>,
    /// Whether `answer` is a clarifying question
    pub kind: TurnKind,
}

/// Response with a conversation's committed messages
#[derive(Debug, Serialize)]
pub struct ThreadResponse {
    pub thread_id: String,
    pub messages: Vec<Message>,
}

/// Banner served at the root path
#[derive(Debug, Serialize)]
pub struct RootResponse {
    pub message: &'static str,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// The conversation the request addressed, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, thread_id: Option<String>) -> Self {
        Self {
            error: error.into(),
            thread_id,
        }
    }
}
