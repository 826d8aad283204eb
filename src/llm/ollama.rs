use reqwest::{ Client as HttpClient, StatusCode };
use serde::{ Deserialize, Serialize };
use async_trait::async_trait;
use std::time::Duration;
use log::{ debug, info };
use super::{ BackendError, ContextRole, ContextTurn, GenerationBackend, GenerationRequest, GenerationResponse };
use crate::config::Config;

pub const DEFAULT_HOST: &str = "http://localhost:11434";

#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
}

#[derive(Serialize)]
struct Options {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    num_predict: u32,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: Options,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ContextTurn>,
    stream: bool,
    options: Options,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ContextTurn,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Serialize)]
struct PullRequest<'a> {
    model: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct PullResponse {
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl OllamaClient {
    pub fn new(base_url: Option<String>) -> Self {
        let url = base_url.unwrap_or_else(|| DEFAULT_HOST.into());

        Self {
            http: HttpClient::new(),
            base_url: url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(Some(config.api_host.clone()))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self.http
            .get(&url)
            .send().await
            .map_err(|e| classify_transport(e, None))?;
        let resp = check_status(resp).await?;
        let tags = resp.json::<TagsResponse>().await.map_err(|e| classify_transport(e, None))?;
        Ok(
            tags.models
                .into_iter()
                .map(|m| m.name)
                .collect()
        )
    }

    /// Downloads `model` and waits for the server to report completion.
    pub async fn pull_model(&self, model: &str) -> Result<(), BackendError> {
        let url = format!("{}/api/pull", self.base_url);
        info!("Pulling model '{}' from {}", model, self.base_url);
        let req = PullRequest { model, stream: false };
        let resp = self.http
            .post(&url)
            .json(&req)
            .send().await
            .map_err(|e| classify_transport(e, None))?;
        let resp = check_status(resp).await?;
        let body = resp.json::<PullResponse>().await.map_err(|e| classify_transport(e, None))?;
        if body.status != "success" {
            return Err(BackendError::Server(format!("pull ended with status '{}'", body.status)));
        }
        Ok(())
    }

    async fn generate_single(&self, request: &GenerationRequest) -> Result<String, BackendError> {
        let url = format!("{}/api/generate", self.base_url);
        let req = GenerateRequest {
            model: &request.model,
            prompt: &request.prompt,
            stream: false,
            options: options_for(request),
        };
        let resp = self.http
            .post(&url)
            .timeout(request.timeout)
            .json(&req)
            .send().await
            .map_err(|e| classify_transport(e, Some(request.timeout)))?;
        let resp = check_status(resp).await?;
        let data = resp
            .json::<GenerateResponse>().await
            .map_err(|e| classify_transport(e, Some(request.timeout)))?;
        Ok(data.response)
    }

    async fn generate_chat(&self, request: &GenerationRequest) -> Result<String, BackendError> {
        let url = format!("{}/api/chat", self.base_url);
        let mut messages = request.context.clone();
        messages.push(ContextTurn {
            role: ContextRole::User,
            content: request.prompt.clone(),
        });
        let req = ChatRequest {
            model: &request.model,
            messages,
            stream: false,
            options: options_for(request),
        };
        let resp = self.http
            .post(&url)
            .timeout(request.timeout)
            .json(&req)
            .send().await
            .map_err(|e| classify_transport(e, Some(request.timeout)))?;
        let resp = check_status(resp).await?;
        let data = resp
            .json::<ChatResponse>().await
            .map_err(|e| classify_transport(e, Some(request.timeout)))?;
        Ok(data.message.content)
    }
}

#[async_trait]
impl GenerationBackend for OllamaClient {
    async fn generate(
        &self,
        request: &GenerationRequest
    ) -> Result<GenerationResponse, BackendError> {
        debug!(
            "Ollama request: model={}, context_turns={}, prompt_chars={}",
            request.model,
            request.context.len(),
            request.prompt.chars().count()
        );
        let text = if request.context.is_empty() {
            self.generate_single(request).await?
        } else {
            self.generate_chat(request).await?
        };
        Ok(GenerationResponse { text })
    }
}

/// True when `available` names the same model as `requested`, treating a
/// missing tag as `:latest`.
pub fn model_matches(available: &str, requested: &str) -> bool {
    fn with_tag(name: &str) -> String {
        if name.contains(':') { name.to_string() } else { format!("{}:latest", name) }
    }
    available == requested || with_tag(available) == with_tag(requested)
}

fn options_for(request: &GenerationRequest) -> Options {
    Options {
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: request.top_k,
        num_predict: request.max_tokens,
    }
}

fn classify_transport(err: reqwest::Error, timeout: Option<Duration>) -> BackendError {
    if err.is_timeout() {
        return BackendError::Timeout(timeout.unwrap_or_default());
    }
    if err.is_connect() {
        return BackendError::Connection(err.to_string());
    }
    if err.is_decode() {
        return BackendError::Server(format!("undecodable response: {}", err));
    }
    if err.is_builder() {
        return BackendError::InvalidRequest(err.to_string());
    }
    if err.is_request() || err.is_body() {
        return BackendError::Connection(err.to_string());
    }
    BackendError::Server(err.to_string())
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = serde_json
        ::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or(body);
    Err(classify_status(status, detail))
}

fn classify_status(status: StatusCode, detail: String) -> BackendError {
    let message = if detail.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, detail)
    };
    let retryable =
        status.is_server_error() ||
        status == StatusCode::REQUEST_TIMEOUT ||
        status == StatusCode::TOO_MANY_REQUESTS;
    if retryable {
        BackendError::Server(message)
    } else {
        BackendError::InvalidRequest(message)
    }
}
