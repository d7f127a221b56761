//! Retrying LLM client bound to one provider and model.
//!
//! Transient failures (timeouts, rate limits, 5xx) are retried with
//! exponential backoff; auth, permanent and configuration errors surface on
//! the first attempt.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::llm::{LlmConfig, LlmError, LlmMessage, LlmProvider, LlmResponse};
use crate::stream::{TextStream, DEFAULT_BUFFER};

/// Backoff schedule and attempt budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Applied to each attempt separately.
    pub request_timeout: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// No retries and no waiting. Handy in tests.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            request_timeout: Duration::from_secs(300),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&cv_core::config::LlmConfig::default())
    }
}

impl From<&cv_core::config::LlmConfig> for RetryPolicy {
    fn from(cfg: &cv_core::config::LlmConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
        }
    }
}

/// Per-call overrides for [`LlmClient::invoke`].
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl InvokeOptions {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// A provider, a model and a retry policy.
#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    config: LlmConfig,
    policy: RetryPolicy,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn LlmProvider>, config: LlmConfig, policy: RetryPolicy) -> Self {
        Self {
            provider,
            config,
            policy,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn estimate_cost(&self, response: &LlmResponse) -> f64 {
        self.provider
            .estimate_cost(&response.model, response.input_tokens, response.output_tokens)
    }

    fn request_config(&self, options: &InvokeOptions) -> LlmConfig {
        let mut config = self.config.clone();
        if let Some(ref system) = options.system_prompt {
            config.system_prompt = Some(system.clone());
        }
        if let Some(max_tokens) = options.max_tokens {
            config.max_tokens = max_tokens;
        }
        if let Some(temperature) = options.temperature {
            config.temperature = temperature;
        }
        config
    }

    /// Send `prompt` as a single user message, retrying transient failures.
    pub async fn invoke(
        &self,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<LlmResponse, LlmError> {
        let messages = [LlmMessage::user(prompt)];
        let config = self.request_config(options);

        let mut attempt: u32 = 0;
        loop {
            let call = self.provider.complete(&messages, &config);
            let result = match tokio::time::timeout(self.policy.request_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout),
            };

            let err = match result {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= self.policy.max_retries {
                return Err(err);
            }
            attempt += 1;

            let mut backoff = self.policy.backoff_for(attempt);
            if let LlmError::RateLimited {
                retry_after_secs: Some(secs),
            } = &err
            {
                backoff = backoff
                    .max(Duration::from_secs(*secs))
                    .min(self.policy.max_backoff);
            }
            warn!(
                provider = self.provider.name(),
                model = %config.model,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "transient LLM failure, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// Stream the response to `prompt`. Only opening the stream is retried.
    pub async fn stream(
        &self,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<TextStream, LlmError> {
        let messages = [LlmMessage::user(prompt)];
        let config = self.request_config(options);

        let mut attempt: u32 = 0;
        loop {
            match self.provider.stream(&messages, &config).await {
                Ok(chunks) => return Ok(TextStream::spawn(chunks, DEFAULT_BUFFER)),
                Err(err) if err.is_retryable() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    let backoff = self.policy.backoff_for(attempt);
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "stream open failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockProvider;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            request_timeout: Duration::from_secs(5),
        }
    }

    fn client(provider: Arc<MockProvider>, max_retries: u32) -> LlmClient {
        LlmClient::new(provider, LlmConfig::default(), fast_policy(max_retries))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
            request_timeout: Duration::from_secs(300),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(4000));
        assert_eq!(policy.backoff_for(10), Duration::from_millis(30_000));
    }

    #[test]
    fn policy_follows_config_section() {
        let policy = RetryPolicy::from(&cv_core::config::LlmConfig::default());
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn transient_failures_then_success_take_n_plus_one_calls() {
        let provider = Arc::new(
            MockProvider::new()
                .with_error(LlmError::Timeout)
                .with_error(LlmError::ApiError {
                    status: 503,
                    message: "overloaded".into(),
                })
                .with_text("done"),
        );
        let client = client(provider.clone(), 3);
        let resp = client.invoke("go", &InvokeOptions::default()).await.unwrap();
        assert_eq!(resp.content, "done");
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        for err in [
            LlmError::ApiError {
                status: 401,
                message: "bad key".into(),
            },
            LlmError::ApiError {
                status: 400,
                message: "bad request".into(),
            },
            LlmError::ApiError {
                status: 409,
                message: "conflict".into(),
            },
            LlmError::ApiError {
                status: 425,
                message: "too early".into(),
            },
            LlmError::Config("unknown model".into()),
        ] {
            let provider = Arc::new(MockProvider::new().with_error(err).with_text("unused"));
            let client = client(provider.clone(), 3);
            assert!(client.invoke("go", &InvokeOptions::default()).await.is_err());
            assert_eq!(provider.call_count(), 1);
        }
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let provider = Arc::new(
            MockProvider::new()
                .with_error(LlmError::Timeout)
                .with_error(LlmError::Timeout)
                .with_error(LlmError::Timeout),
        );
        let client = client(provider.clone(), 2);
        let err = client.invoke("go", &InvokeOptions::default()).await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn options_override_request_config() {
        let provider = Arc::new(MockProvider::new());
        let client = client(provider.clone(), 0);
        let options = InvokeOptions {
            max_tokens: Some(64),
            ..InvokeOptions::default().with_system_prompt("You are Alex")
        };
        client.invoke("review", &options).await.unwrap();
        let (messages, config) = &provider.captured_requests()[0];
        assert_eq!(messages[0].content, "review");
        assert_eq!(config.system_prompt.as_deref(), Some("You are Alex"));
        assert_eq!(config.max_tokens, 64);
    }

    #[tokio::test]
    async fn stream_collects_provider_chunks() {
        let provider =
            Arc::new(MockProvider::new().with_stream_chunks(vec!["fn ".into(), "main".into()]));
        let client = client(provider, 0);
        let text = client
            .stream("go", &InvokeOptions::default())
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(text, "fn main");
    }
}
