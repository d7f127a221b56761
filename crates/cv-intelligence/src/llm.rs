//! LLM provider abstraction layer.
//!
//! Provides a unified async trait for the supported providers (Anthropic,
//! OpenAI, OpenAI-compatible local servers) along with a mock provider for
//! testing. Retries live one layer up in [`crate::client`].

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pricing;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur when interacting with an LLM provider.
#[derive(Debug, Error)]
pub enum LlmError {
    /// An HTTP-level error (connection failure, DNS, TLS, etc.).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// The API returned a non-success status with a message.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Failed to parse the API response body.
    #[error("parse error: {0}")]
    ParseError(String),

    /// The API indicated rate limiting (HTTP 429).
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The requested operation is not supported by this provider.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// No credential available for the provider.
    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    /// Unknown provider name or invalid model assignment.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse classification that drives retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LlmErrorKind {
    Auth,
    Transient,
    Permanent,
    Config,
}

impl LlmError {
    /// Only rate limits, timeouts and 5xx are transient. HTTP 408 is the
    /// server reporting a request timeout and is treated like
    /// [`LlmError::Timeout`]; every other 4xx is permanent.
    pub fn kind(&self) -> LlmErrorKind {
        match self {
            LlmError::HttpError(_) | LlmError::RateLimited { .. } | LlmError::Timeout => {
                LlmErrorKind::Transient
            }
            LlmError::ApiError { status, .. } => match *status {
                401 | 403 => LlmErrorKind::Auth,
                408 | 429 => LlmErrorKind::Transient,
                s if s >= 500 => LlmErrorKind::Transient,
                _ => LlmErrorKind::Permanent,
            },
            LlmError::ParseError(_) | LlmError::Unsupported(_) => LlmErrorKind::Permanent,
            LlmError::MissingCredentials(_) => LlmErrorKind::Auth,
            LlmError::Config(_) => LlmErrorKind::Config,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == LlmErrorKind::Transient
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::HttpError(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Core data types
// ---------------------------------------------------------------------------

/// Role of a message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for LlmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmRole::System => write!(f, "system"),
            LlmRole::User => write!(f, "user"),
            LlmRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

impl LlmMessage {
    pub fn new(role: LlmRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(LlmRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(LlmRole::User, content)
    }
}

/// Configuration for an LLM completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 4096,
            temperature: 0.2,
            system_prompt: None,
        }
    }
}

/// Response from an LLM completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: String,
}

/// Boxed stream of text chunks produced by [`LlmProvider::stream`].
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

/// Async trait for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Registry key of the provider (`"anthropic"`, `"openai"`, ...).
    fn name(&self) -> &str;

    /// Send a completion request and return the full response.
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError>;

    /// Stream a completion response chunk by chunk.
    ///
    /// Providers that do not support streaming should return
    /// `Err(LlmError::Unsupported(...))`.
    async fn stream(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<ChunkStream, LlmError>;

    /// Estimated USD cost of a request with the given token counts.
    fn estimate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        pricing::estimate_cost(model, input_tokens, output_tokens)
    }
}

/// Map a non-success HTTP response to an [`LlmError`].
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = resp.status().as_u16();

    if status == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        return Err(LlmError::RateLimited {
            retry_after_secs: retry_after,
        });
    }

    if !resp.status().is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::ApiError {
            status,
            message: text,
        });
    }

    Ok(resp)
}

// ---------------------------------------------------------------------------
// AnthropicProvider
// ---------------------------------------------------------------------------

/// LLM provider for the Anthropic Messages API.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    /// `api_key` is the Anthropic API key (x-api-key header).
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
        }
    }

    /// Override the base URL (useful for testing with a mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Build the JSON request body for the Anthropic Messages API.
    pub fn build_request_body(messages: &[LlmMessage], config: &LlmConfig) -> serde_json::Value {
        // System prompt goes in the top-level `system` field, not as a message.
        let mut system_text: Option<String> = config.system_prompt.clone();

        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .filter_map(|msg| {
                if msg.role == LlmRole::System {
                    if let Some(ref mut s) = system_text {
                        s.push('\n');
                        s.push_str(&msg.content);
                    } else {
                        system_text = Some(msg.content.clone());
                    }
                    None
                } else {
                    Some(serde_json::json!({
                        "role": msg.role.to_string(),
                        "content": msg.content,
                    }))
                }
            })
            .collect();

        let mut body = serde_json::json!({
            "model": config.model,
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
            "messages": api_messages,
        });

        if let Some(system) = system_text {
            body["system"] = serde_json::Value::String(system);
        }

        body
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        let body = Self::build_request_body(messages, config);
        let url = format!("{}/v1/messages", self.base_url);

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp).await?;

        let api_resp: AnthropicResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        let content = api_resp
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        Ok(LlmResponse {
            content,
            model: api_resp.model,
            input_tokens: api_resp.usage.input_tokens,
            output_tokens: api_resp.usage.output_tokens,
            finish_reason: api_resp.stop_reason.unwrap_or_else(|| "unknown".into()),
        })
    }

    async fn stream(
        &self,
        _messages: &[LlmMessage],
        _config: &LlmConfig,
    ) -> Result<ChunkStream, LlmError> {
        Err(LlmError::Unsupported(
            "streaming not implemented for AnthropicProvider".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat completions (shared by OpenAI and local servers)
// ---------------------------------------------------------------------------

/// Build the JSON request body for `/v1/chat/completions`.
pub fn build_chat_completions_body(
    messages: &[LlmMessage],
    config: &LlmConfig,
    stream: bool,
) -> serde_json::Value {
    let mut api_messages: Vec<serde_json::Value> = Vec::new();

    if let Some(ref system) = config.system_prompt {
        api_messages.push(serde_json::json!({
            "role": "system",
            "content": system,
        }));
    }

    for msg in messages {
        api_messages.push(serde_json::json!({
            "role": msg.role.to_string(),
            "content": msg.content,
        }));
    }

    let mut body = serde_json::json!({
        "model": config.model,
        "max_tokens": config.max_tokens,
        "temperature": config.temperature,
        "messages": api_messages,
    });
    if stream {
        body["stream"] = serde_json::Value::Bool(true);
    }
    body
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    model: Option<String>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResp,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessageResp {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct ChatStreamChunk {
    choices: Vec<ChatStreamChoice>,
}

#[derive(Deserialize)]
struct ChatStreamChoice {
    delta: ChatStreamDelta,
}

#[derive(Deserialize)]
struct ChatStreamDelta {
    content: Option<String>,
}

/// One decoded server-sent-events line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseLine {
    Text(String),
    Done,
    Skip,
}

pub(crate) fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<ChatStreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|t| !t.is_empty())
            .map(SseLine::Text)
            .unwrap_or(SseLine::Skip),
        Err(_) => SseLine::Skip,
    }
}

/// Turn a raw SSE byte stream into text chunks. Lines are reassembled across
/// network chunk boundaries before decoding.
fn sse_text_stream<S, B>(bytes: S) -> ChunkStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]>,
{
    struct SseState<S> {
        bytes: Pin<Box<S>>,
        buf: Vec<u8>,
        pending: VecDeque<String>,
        done: bool,
    }

    let state = SseState {
        bytes: Box::pin(bytes),
        buf: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                return Some((Ok(chunk), st));
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(b)) => {
                    st.buf.extend_from_slice(b.as_ref());
                    while let Some(pos) = st.buf.iter().position(|c| *c == b'\n') {
                        let line: Vec<u8> = st.buf.drain(..=pos).collect();
                        match parse_sse_line(String::from_utf8_lossy(&line).trim_end()) {
                            SseLine::Text(t) => st.pending.push_back(t),
                            SseLine::Done => st.done = true,
                            SseLine::Skip => {}
                        }
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(LlmError::from(e)), st));
                }
                None => st.done = true,
            }
        }
    }))
}

struct ChatCompletionsClient {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl ChatCompletionsClient {
    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        req
    }

    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        let body = build_chat_completions_body(messages, config, false);
        let resp = self.request(&body).send().await.map_err(|e| self.map_send_error(e))?;
        let resp = check_status(resp).await?;

        let api_resp: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        let choice = api_resp
            .choices
            .first()
            .ok_or_else(|| LlmError::ParseError("no choices in response".into()))?;
        let usage = api_resp.usage.as_ref();

        Ok(LlmResponse {
            content: choice.message.content.clone().unwrap_or_default(),
            model: api_resp.model.clone().unwrap_or_else(|| config.model.clone()),
            input_tokens: usage.and_then(|u| u.prompt_tokens).unwrap_or(0),
            output_tokens: usage.and_then(|u| u.completion_tokens).unwrap_or(0),
            finish_reason: choice
                .finish_reason
                .clone()
                .unwrap_or_else(|| "stop".into()),
        })
    }

    async fn stream(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<ChunkStream, LlmError> {
        let body = build_chat_completions_body(messages, config, true);
        let resp = self.request(&body).send().await.map_err(|e| self.map_send_error(e))?;
        let resp = check_status(resp).await?;
        Ok(sse_text_stream(resp.bytes_stream()))
    }

    fn map_send_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout
        } else if e.is_connect() {
            LlmError::HttpError(format!("cannot connect to {}: {e}", self.base_url))
        } else {
            LlmError::HttpError(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// OpenAiProvider
// ---------------------------------------------------------------------------

/// LLM provider for the OpenAI Chat Completions API.
pub struct OpenAiProvider {
    inner: ChatCompletionsClient,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            inner: ChatCompletionsClient {
                client: reqwest::Client::new(),
                api_key: Some(api_key.into()),
                base_url: "https://api.openai.com".to_string(),
            },
        }
    }

    /// Override the base URL (useful for testing or Azure OpenAI).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.inner.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        self.inner.complete(messages, config).await
    }

    async fn stream(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<ChunkStream, LlmError> {
        self.inner.stream(messages, config).await
    }
}

// ---------------------------------------------------------------------------
// LocalProvider: local inference via OpenAI-compatible API
// ---------------------------------------------------------------------------

/// LLM provider for local inference servers that expose an OpenAI-compatible
/// chat completions endpoint (vllm, llama.cpp, Ollama, TGI, ...).
///
/// Authentication is optional; pass `None`, an empty string or `"none"` for
/// servers without auth. Local models are priced at zero.
pub struct LocalProvider {
    inner: ChatCompletionsClient,
}

impl LocalProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let key = api_key.filter(|k| !k.is_empty() && k != "none");
        Self {
            inner: ChatCompletionsClient {
                client: reqwest::Client::new(),
                api_key: key,
                base_url: base_url.into(),
            },
        }
    }
}

#[async_trait]
impl LlmProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        self.inner.complete(messages, config).await
    }

    async fn stream(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<ChunkStream, LlmError> {
        self.inner.stream(messages, config).await
    }

    fn estimate_cost(&self, _model: &str, _input_tokens: u64, _output_tokens: u64) -> f64 {
        0.0
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// A mock LLM provider for testing.
///
/// Each call to `complete` pops the next queued result; an empty queue yields
/// a default response. Streaming replays the configured chunks.
pub struct MockProvider {
    name: String,
    responses: Arc<Mutex<VecDeque<Result<LlmResponse, LlmError>>>>,
    stream_chunks: Arc<Mutex<Option<Vec<String>>>>,
    /// Captured request bodies for test assertions.
    #[allow(clippy::type_complexity)]
    captured_requests: Arc<Mutex<Vec<(Vec<LlmMessage>, LlmConfig)>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::named("mock")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            stream_chunks: Arc::new(Mutex::new(None)),
            captured_requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a successful response.
    pub fn with_response(self, response: LlmResponse) -> Self {
        self.push_response(response);
        self
    }

    /// Queue a successful response with just `content`.
    pub fn with_text(self, content: impl Into<String>) -> Self {
        self.push_text(content);
        self
    }

    /// Queue an error response.
    pub fn with_error(self, error: LlmError) -> Self {
        self.push_error(error);
        self
    }

    pub fn with_stream_chunks(self, chunks: Vec<String>) -> Self {
        *self.stream_chunks.lock().unwrap() = Some(chunks);
        self
    }

    pub fn push_response(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_text(&self, content: impl Into<String>) {
        self.push_response(Self::text_response(content, "mock-model"));
    }

    pub fn push_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Get captured requests for assertions.
    pub fn captured_requests(&self) -> Vec<(Vec<LlmMessage>, LlmConfig)> {
        self.captured_requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.captured_requests.lock().unwrap().len()
    }

    pub fn text_response(content: impl Into<String>, model: &str) -> LlmResponse {
        LlmResponse {
            content: content.into(),
            model: model.to_string(),
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: "end_turn".to_string(),
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        self.captured_requests
            .lock()
            .unwrap()
            .push((messages.to_vec(), config.clone()));

        let mut queue = self.responses.lock().unwrap();
        match queue.pop_front() {
            Some(result) => result,
            None => Ok(Self::text_response("Mock response", &config.model)),
        }
    }

    async fn stream(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<ChunkStream, LlmError> {
        self.captured_requests
            .lock()
            .unwrap()
            .push((messages.to_vec(), config.clone()));

        let chunks = self.stream_chunks.lock().unwrap().clone();
        match chunks {
            Some(chunks) => Ok(Box::pin(futures_util::stream::iter(
                chunks.into_iter().map(Ok),
            ))),
            None => Err(LlmError::Unsupported(
                "no stream configured for MockProvider".into(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> LlmConfig {
        LlmConfig {
            model: "test-model".to_string(),
            max_tokens: 512,
            temperature: 0.5,
            system_prompt: None,
        }
    }

    #[test]
    fn error_classification() {
        assert_eq!(LlmError::Timeout.kind(), LlmErrorKind::Transient);
        assert_eq!(
            LlmError::RateLimited { retry_after_secs: None }.kind(),
            LlmErrorKind::Transient
        );
        let api = |status| LlmError::ApiError {
            status,
            message: String::new(),
        };
        assert_eq!(api(503).kind(), LlmErrorKind::Transient);
        assert_eq!(api(401).kind(), LlmErrorKind::Auth);
        assert_eq!(api(403).kind(), LlmErrorKind::Auth);
        assert_eq!(api(400).kind(), LlmErrorKind::Permanent);
        assert_eq!(api(404).kind(), LlmErrorKind::Permanent);
        assert_eq!(api(409).kind(), LlmErrorKind::Permanent);
        assert_eq!(api(425).kind(), LlmErrorKind::Permanent);
        assert_eq!(api(408).kind(), LlmErrorKind::Transient);
        assert_eq!(api(429).kind(), LlmErrorKind::Transient);
        assert_eq!(LlmError::ParseError("x".into()).kind(), LlmErrorKind::Permanent);
        assert_eq!(LlmError::Config("x".into()).kind(), LlmErrorKind::Config);
        assert_eq!(
            LlmError::MissingCredentials("x".into()).kind(),
            LlmErrorKind::Auth
        );
        assert!(!api(400).is_retryable());
    }

    #[tokio::test]
    async fn mock_provider_returns_queued_then_default() {
        let provider = MockProvider::new().with_text("Custom answer");
        let config = default_config();

        let resp = provider
            .complete(&[LlmMessage::user("Hi")], &config)
            .await
            .unwrap();
        assert_eq!(resp.content, "Custom answer");

        let resp2 = provider
            .complete(&[LlmMessage::user("Hi again")], &config)
            .await
            .unwrap();
        assert_eq!(resp2.content, "Mock response");
        assert_eq!(resp2.model, "test-model");
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn mock_provider_returns_queued_error() {
        let provider = MockProvider::new().with_error(LlmError::Timeout);
        let result = provider
            .complete(&[LlmMessage::user("Hi")], &default_config())
            .await;
        assert!(matches!(result.unwrap_err(), LlmError::Timeout));
    }

    #[tokio::test]
    async fn mock_provider_streams_configured_chunks() {
        let provider =
            MockProvider::new().with_stream_chunks(vec!["Hel".into(), "lo".into()]);
        let stream = provider
            .stream(&[LlmMessage::user("Hi")], &default_config())
            .await
            .unwrap();
        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks, vec!["Hel", "lo"]);
    }

    #[test]
    fn anthropic_body_lifts_system_messages() {
        let config = LlmConfig {
            system_prompt: Some("Base".into()),
            ..default_config()
        };
        let body = AnthropicProvider::build_request_body(
            &[LlmMessage::system("Extra"), LlmMessage::user("Hello")],
            &config,
        );
        assert_eq!(body["system"], "Base\nExtra");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn chat_completions_body_inlines_system_prompt() {
        let config = LlmConfig {
            system_prompt: Some("Be terse".into()),
            ..default_config()
        };
        let body = build_chat_completions_body(&[LlmMessage::user("Hello")], &config, true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Hello");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn sse_lines_decode() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#),
            SseLine::Text("Hi".into())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            SseLine::Skip
        );
    }

    #[tokio::test]
    async fn sse_stream_reassembles_split_lines() {
        let parts: Vec<Result<Vec<u8>, reqwest::Error>> = vec![
            Ok(br#"data: {"choices":[{"delta":{"con"#.to_vec()),
            Ok(b"tent\":\"Hel\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n".to_vec()),
            Ok(b"data: [DONE]\n".to_vec()),
        ];
        let stream = sse_text_stream(futures_util::stream::iter(parts));
        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks, vec!["Hel", "lo"]);
    }

    #[test]
    fn local_provider_is_free() {
        let local = LocalProvider::new("http://127.0.0.1:11434", Some("none".into()));
        assert_eq!(local.estimate_cost("llama3", 1_000_000, 1_000_000), 0.0);
        assert_eq!(local.name(), "local");
    }
}
