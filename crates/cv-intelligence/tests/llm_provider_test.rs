//! Tests for the LLM layer as the agent pool consumes it:
//! factory resolution, retry classification, streaming and cost estimation.

use std::sync::Arc;
use std::time::Duration;

use cv_core::config::{AgentModelConfig, ProvidersConfig};
use cv_intelligence::llm::{LlmError, LlmErrorKind, LlmMessage, LlmProvider, LlmRole, MockProvider};
use cv_intelligence::{InvokeOptions, ProviderFactory, RetryPolicy};

fn quick_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        request_timeout: Duration::from_secs(5),
    }
}

fn agent(provider: &str, model: &str) -> AgentModelConfig {
    AgentModelConfig {
        provider: provider.into(),
        model: model.into(),
        max_tokens: 2048,
        temperature: 0.2,
    }
}

// ===========================================================================
// Messages
// ===========================================================================

#[test]
fn test_llm_message_roles() {
    assert_eq!(LlmMessage::system("s").role, LlmRole::System);
    assert_eq!(LlmMessage::user("u").role, LlmRole::User);
    assert_eq!(serde_json::to_string(&LlmRole::Assistant).unwrap(), "\"assistant\"");
}

// ===========================================================================
// Factory + client
// ===========================================================================

#[tokio::test]
async fn test_client_from_factory_retries_rate_limits() {
    let mock = Arc::new(
        MockProvider::named("openai")
            .with_error(LlmError::RateLimited {
                retry_after_secs: None,
            })
            .with_text("{\"decision\":\"APPROVED\"}"),
    );
    let factory = ProviderFactory::new(ProvidersConfig::default()).with_provider(mock.clone());
    let client = factory
        .client_for(&agent("openai", "gpt-4o"), quick_policy(3))
        .unwrap();

    let resp = client.invoke("review this", &InvokeOptions::default()).await.unwrap();
    assert!(resp.content.contains("APPROVED"));
    assert_eq!(mock.call_count(), 2);

    let (_, config) = &mock.captured_requests()[1];
    assert_eq!(config.model, "gpt-4o");
    assert_eq!(config.max_tokens, 2048);
}

#[tokio::test]
async fn test_auth_failure_is_single_attempt() {
    let mock = Arc::new(MockProvider::named("anthropic").with_error(LlmError::ApiError {
        status: 401,
        message: "invalid x-api-key".into(),
    }));
    let factory = ProviderFactory::new(ProvidersConfig::default()).with_provider(mock.clone());
    let client = factory
        .client_for(&agent("anthropic", "claude-sonnet-4-20250514"), quick_policy(5))
        .unwrap();

    let err = client.invoke("implement", &InvokeOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), LlmErrorKind::Auth);
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn test_streaming_through_client() {
    let mock = Arc::new(
        MockProvider::named("local").with_stream_chunks(vec!["a".into(), "b".into(), "c".into()]),
    );
    let factory = ProviderFactory::new(ProvidersConfig::default()).with_provider(mock);
    let client = factory
        .client_for(&agent("local", "llama3"), quick_policy(0))
        .unwrap();

    let mut stream = client.stream("go", &InvokeOptions::default()).await.unwrap();
    let mut seen = Vec::new();
    while let Some(chunk) = stream.recv().await {
        seen.push(chunk.unwrap());
    }
    assert_eq!(seen, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_streaming_unsupported_is_permanent() {
    let mock = Arc::new(MockProvider::named("anthropic"));
    let err = mock
        .stream(&[LlmMessage::user("x")], &Default::default())
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), LlmErrorKind::Permanent);
}

// ===========================================================================
// Cost
// ===========================================================================

#[tokio::test]
async fn test_cost_estimate_uses_response_model() {
    let mock = Arc::new(MockProvider::named("openai").with_response(
        cv_intelligence::llm::LlmResponse {
            content: "ok".into(),
            model: "gpt-4o".into(),
            input_tokens: 1_000_000,
            output_tokens: 0,
            finish_reason: "stop".into(),
        },
    ));
    let factory = ProviderFactory::new(ProvidersConfig::default()).with_provider(mock);
    let client = factory
        .client_for(&agent("openai", "gpt-4o"), quick_policy(0))
        .unwrap();
    let resp = client.invoke("x", &InvokeOptions::default()).await.unwrap();
    assert!((client.estimate_cost(&resp) - 2.5).abs() < 1e-9);
}
