pub mod agent_pool;
pub mod artifacts;
pub mod decision;
pub mod json_parse;
pub mod pipeline;
pub mod prompts;
pub mod state_machine;

pub use agent_pool::{AgentLease, AgentPool, AgentPoolError, AgentType};
pub use decision::{DecisionEngine, DecisionOutcome, DecisionPolicy, RunScope};
pub use pipeline::{DualAgentPipeline, PipelineError, PipelineOutcome, PipelineRun, StoryContext};
