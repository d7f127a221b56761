//! Provider selection by name.
//!
//! Built-in providers are constructed on demand from [`ProvidersConfig`];
//! registered providers shadow them, which is how tests inject mocks.

use std::collections::HashMap;
use std::sync::Arc;

use cv_core::config::{AgentModelConfig, CredentialProvider, ProvidersConfig};

use crate::client::{LlmClient, RetryPolicy};
use crate::llm::{
    AnthropicProvider, LlmConfig, LlmError, LlmProvider, LocalProvider, OpenAiProvider,
};

pub const BUILTIN_PROVIDERS: [&str; 3] = ["anthropic", "openai", "local"];

pub struct ProviderFactory {
    config: ProvidersConfig,
    registered: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderFactory {
    pub fn new(config: ProvidersConfig) -> Self {
        Self {
            config,
            registered: HashMap::new(),
        }
    }

    /// Register `provider` under its own name, replacing any built-in.
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.registered
            .insert(provider.name().to_string(), provider);
    }

    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Resolve a provider by key. Missing API keys are auth errors, unknown
    /// names are configuration errors.
    pub fn provider(&self, name: &str) -> Result<Arc<dyn LlmProvider>, LlmError> {
        if let Some(p) = self.registered.get(name) {
            return Ok(p.clone());
        }
        match name {
            "anthropic" => {
                let key = CredentialProvider::anthropic_api_key(&self.config).ok_or_else(|| {
                    LlmError::MissingCredentials(format!(
                        "set {} to use the anthropic provider",
                        self.config.anthropic_key_env
                    ))
                })?;
                Ok(Arc::new(AnthropicProvider::new(key)))
            }
            "openai" => {
                let key = CredentialProvider::openai_api_key(&self.config).ok_or_else(|| {
                    LlmError::MissingCredentials(format!(
                        "set {} to use the openai provider",
                        self.config.openai_key_env
                    ))
                })?;
                Ok(Arc::new(OpenAiProvider::new(key)))
            }
            "local" => Ok(Arc::new(LocalProvider::new(
                self.config.local_base_url.clone(),
                None,
            ))),
            other => Err(LlmError::Config(format!("unknown LLM provider '{other}'"))),
        }
    }

    /// Build a retrying client for one agent's provider/model assignment.
    pub fn client_for(
        &self,
        agent: &AgentModelConfig,
        policy: RetryPolicy,
    ) -> Result<LlmClient, LlmError> {
        if agent.model.trim().is_empty() {
            return Err(LlmError::Config(format!(
                "no model configured for provider '{}'",
                agent.provider
            )));
        }
        let provider = self.provider(&agent.provider)?;
        let config = LlmConfig {
            model: agent.model.clone(),
            max_tokens: agent.max_tokens,
            temperature: agent.temperature,
            system_prompt: None,
        };
        Ok(LlmClient::new(provider, config, policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmErrorKind, MockProvider};

    fn unset_keys() -> ProvidersConfig {
        ProvidersConfig {
            anthropic_key_env: "CONVEYOR_TEST_UNSET_ANTHROPIC_KEY".into(),
            openai_key_env: "CONVEYOR_TEST_UNSET_OPENAI_KEY".into(),
            ..ProvidersConfig::default()
        }
    }

    fn agent(provider: &str, model: &str) -> AgentModelConfig {
        AgentModelConfig {
            provider: provider.into(),
            model: model.into(),
            max_tokens: 1024,
            temperature: 0.1,
        }
    }

    #[test]
    fn unknown_provider_is_a_config_error() {
        let factory = ProviderFactory::new(unset_keys());
        let err = factory.provider("gemini").err().unwrap();
        assert_eq!(err.kind(), LlmErrorKind::Config);
    }

    #[test]
    fn missing_key_is_an_auth_error() {
        let factory = ProviderFactory::new(unset_keys());
        for name in ["anthropic", "openai"] {
            let err = factory.provider(name).err().unwrap();
            assert_eq!(err.kind(), LlmErrorKind::Auth, "{name}");
        }
    }

    #[test]
    fn local_needs_no_key() {
        let factory = ProviderFactory::new(unset_keys());
        assert_eq!(factory.provider("local").unwrap().name(), "local");
    }

    #[test]
    fn registered_provider_shadows_builtin() {
        let factory = ProviderFactory::new(unset_keys())
            .with_provider(Arc::new(MockProvider::named("anthropic")));
        let client = factory
            .client_for(&agent("anthropic", "claude-sonnet-4-20250514"), RetryPolicy::none())
            .unwrap();
        assert_eq!(client.provider_name(), "anthropic");
        assert_eq!(client.model(), "claude-sonnet-4-20250514");
    }

    #[test]
    fn empty_model_is_rejected() {
        let factory = ProviderFactory::new(unset_keys())
            .with_provider(Arc::new(MockProvider::named("openai")));
        let err = factory
            .client_for(&agent("openai", " "), RetryPolicy::none())
            .err()
            .unwrap();
        assert_eq!(err.kind(), LlmErrorKind::Config);
    }
}
