use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use cv_core::config::{AgentModelConfig, AgentsConfig, ConfigError};
use cv_core::events::{ConveyorEvent, EventBus};
use cv_core::types::StoryId;
use cv_intelligence::{InvokeOptions, LlmClient, LlmError, ProviderFactory, RetryPolicy};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AgentPoolError {
    #[error("agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("invalid agent configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("could not build LLM client for {agent_type}: {source}")]
    Client {
        agent_type: AgentType,
        #[source]
        source: LlmError,
    },

    #[error("agent {agent_id} ({agent_type}) invocation failed: {source}")]
    Invocation {
        agent_id: Uuid,
        agent_type: AgentType,
        #[source]
        source: LlmError,
    },
}

pub type Result<T> = std::result::Result<T, AgentPoolError>;

// ---------------------------------------------------------------------------
// Agent types and handles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// Developer.
    Amelia,
    /// Reviewer.
    Alex,
}

impl AgentType {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentType::Amelia => "amelia",
            AgentType::Alex => "alex",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            AgentType::Amelia => "Amelia",
            AgentType::Alex => "Alex",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an agent is created for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    pub story_id: StoryId,
    pub step: String,
}

impl AgentContext {
    pub fn new(story_id: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            story_id: story_id.into(),
            step: step.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub agent_type: AgentType,
    pub provider: String,
    pub model: String,
    pub context: AgentContext,
    pub created_at: DateTime<Utc>,
}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

/// Cumulative usage per agent type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentUsage {
    pub created: u64,
    pub invocations: u64,
    pub failures: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub total_duration_ms: u64,
}

// ---------------------------------------------------------------------------
// AgentPool
// ---------------------------------------------------------------------------

/// Creates, invokes and destroys short-lived agents. Amelia and Alex are each
/// bound to their own LLM client; the pool refuses to run both on the same
/// provider and model.
pub struct AgentPool {
    clients: HashMap<AgentType, LlmClient>,
    agents: Mutex<HashMap<Uuid, Agent>>,
    usage: Mutex<BTreeMap<AgentType, AgentUsage>>,
    events: EventBus,
}

impl AgentPool {
    /// Resolve both agents' clients from config through `factory`.
    pub fn from_config(
        config: &AgentsConfig,
        factory: &ProviderFactory,
        policy: RetryPolicy,
        events: EventBus,
    ) -> Result<Self> {
        config.validate()?;
        let client = |agent_type: AgentType, cfg: &AgentModelConfig| {
            factory
                .client_for(cfg, policy.clone())
                .map_err(|source| AgentPoolError::Client { agent_type, source })
        };
        let amelia = client(AgentType::Amelia, &config.amelia)?;
        let alex = client(AgentType::Alex, &config.alex)?;
        Self::new(amelia, alex, events)
    }

    pub fn new(amelia: LlmClient, alex: LlmClient, events: EventBus) -> Result<Self> {
        if amelia.provider_name() == alex.provider_name() && amelia.model() == alex.model() {
            return Err(ConfigError::Validation(format!(
                "amelia and alex must use different models (both {}/{})",
                amelia.provider_name(),
                amelia.model()
            ))
            .into());
        }
        let clients = HashMap::from([(AgentType::Amelia, amelia), (AgentType::Alex, alex)]);
        Ok(Self {
            clients,
            agents: Mutex::new(HashMap::new()),
            usage: Mutex::new(BTreeMap::new()),
            events,
        })
    }

    fn client(&self, agent_type: AgentType) -> &LlmClient {
        // Both entries are inserted by `new`.
        &self.clients[&agent_type]
    }

    pub fn create_agent(&self, agent_type: AgentType, context: AgentContext) -> Agent {
        let client = self.client(agent_type);
        let agent = Agent {
            id: Uuid::new_v4(),
            agent_type,
            provider: client.provider_name().to_string(),
            model: client.model().to_string(),
            context,
            created_at: Utc::now(),
        };

        lock(&self.agents).insert(agent.id, agent.clone());
        lock(&self.usage).entry(agent_type).or_default().created += 1;

        info!(
            agent_id = %agent.id,
            agent_type = %agent_type,
            story_id = %agent.context.story_id,
            step = %agent.context.step,
            model = %agent.model,
            "agent created"
        );
        self.events.publish(ConveyorEvent::AgentCreated {
            agent_id: agent.id,
            agent_type: agent_type.to_string(),
            provider: agent.provider.clone(),
            model: agent.model.clone(),
        });
        agent
    }

    pub async fn invoke_agent(
        &self,
        agent_id: Uuid,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<AgentReply> {
        let agent_type = lock(&self.agents)
            .get(&agent_id)
            .map(|a| a.agent_type)
            .ok_or(AgentPoolError::AgentNotFound(agent_id))?;
        let client = self.client(agent_type);

        let started = Instant::now();
        let result = client.invoke(prompt, options).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                let cost_usd = client.estimate_cost(&response);
                {
                    let mut usage = lock(&self.usage);
                    let entry = usage.entry(agent_type).or_default();
                    entry.invocations += 1;
                    entry.input_tokens += response.input_tokens;
                    entry.output_tokens += response.output_tokens;
                    entry.cost_usd += cost_usd;
                    entry.total_duration_ms += duration_ms;
                }
                debug!(%agent_id, agent_type = %agent_type, duration_ms, cost_usd, "agent invoked");
                self.events.publish(ConveyorEvent::AgentInvoked {
                    agent_id,
                    agent_type: agent_type.to_string(),
                    duration_ms,
                    input_tokens: u32::try_from(response.input_tokens).unwrap_or(u32::MAX),
                    output_tokens: u32::try_from(response.output_tokens).unwrap_or(u32::MAX),
                    cost_usd,
                    success: true,
                });
                Ok(AgentReply {
                    content: response.content,
                    input_tokens: response.input_tokens,
                    output_tokens: response.output_tokens,
                    cost_usd,
                    duration_ms,
                })
            }
            Err(source) => {
                {
                    let mut usage = lock(&self.usage);
                    let entry = usage.entry(agent_type).or_default();
                    entry.invocations += 1;
                    entry.failures += 1;
                    entry.total_duration_ms += duration_ms;
                }
                warn!(%agent_id, agent_type = %agent_type, error = %source, "agent invocation failed");
                self.events.publish(ConveyorEvent::AgentInvoked {
                    agent_id,
                    agent_type: agent_type.to_string(),
                    duration_ms,
                    input_tokens: 0,
                    output_tokens: 0,
                    cost_usd: 0.0,
                    success: false,
                });
                Err(AgentPoolError::Invocation {
                    agent_id,
                    agent_type,
                    source,
                })
            }
        }
    }

    pub fn destroy_agent(&self, agent_id: Uuid) -> Result<()> {
        let agent = lock(&self.agents)
            .remove(&agent_id)
            .ok_or(AgentPoolError::AgentNotFound(agent_id))?;
        debug!(%agent_id, agent_type = %agent.agent_type, "agent destroyed");
        self.events.publish(ConveyorEvent::AgentDestroyed {
            agent_id,
            agent_type: agent.agent_type.to_string(),
        });
        Ok(())
    }

    /// Create an agent that is destroyed when the lease is dropped, on every
    /// exit path.
    pub fn lease(&self, agent_type: AgentType, context: AgentContext) -> AgentLease<'_> {
        let agent = self.create_agent(agent_type, context);
        AgentLease { pool: self, agent }
    }

    pub fn active_count(&self) -> usize {
        lock(&self.agents).len()
    }

    pub fn usage(&self) -> BTreeMap<AgentType, AgentUsage> {
        lock(&self.usage).clone()
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.usage().values().map(|u| u.cost_usd).sum()
    }

    /// `(provider, model)` the agent type is bound to.
    pub fn model_for(&self, agent_type: AgentType) -> (&str, &str) {
        let client = self.client(agent_type);
        (client.provider_name(), client.model())
    }
}

/// The maps hold plain bookkeeping, so a panic mid-update never leaves them
/// unusable. Keep going with whatever was written.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// AgentLease
// ---------------------------------------------------------------------------

pub struct AgentLease<'a> {
    pool: &'a AgentPool,
    agent: Agent,
}

impl AgentLease<'_> {
    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub async fn invoke(&self, prompt: &str, options: &InvokeOptions) -> Result<AgentReply> {
        self.pool.invoke_agent(self.agent.id, prompt, options).await
    }
}

impl Drop for AgentLease<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.pool.destroy_agent(self.agent.id) {
            warn!(agent_id = %self.agent.id, error = %e, "agent already released");
        }
    }
}
