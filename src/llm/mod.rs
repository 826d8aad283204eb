pub mod ollama;

use async_trait::async_trait;
use serde::{ Deserialize, Serialize };
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextRole {
    User,
    Assistant,
}

impl ContextRole {
    /// Anything other than `user` is treated as a model turn.
    pub fn from_record_role(role: &str) -> Self {
        if role == "user" { ContextRole::User } else { ContextRole::Assistant }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ContextTurn {
    pub role: ContextRole,
    pub content: String,
}

/// A single generation call. `context` holds earlier turns and is empty
/// unless multi-turn mode is enabled.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub context: Vec<ContextTurn>,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResponse {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("request timed out after {0:?}")] Timeout(Duration),
    #[error("connection error: {0}")] Connection(String),
    #[error("invalid request: {0}")] InvalidRequest(String),
    #[error("server error: {0}")] Server(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BackendError::InvalidRequest(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Timeout(_) => "Timeout",
            BackendError::Connection(_) => "ConnectionError",
            BackendError::InvalidRequest(_) => "InvalidRequest",
            BackendError::Server(_) => "ServerError",
        }
    }
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest
    ) -> Result<GenerationResponse, BackendError>;
}
