//! LLM access for the agent pipeline: providers, retrying client,
//! streaming and cost estimation.

pub mod client;
pub mod factory;
pub mod llm;
pub mod pricing;
pub mod stream;

pub use client::{InvokeOptions, LlmClient, RetryPolicy};
pub use factory::ProviderFactory;
pub use llm::{LlmError, LlmErrorKind, LlmProvider, MockProvider};
pub use stream::TextStream;
