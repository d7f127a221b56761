use std::path::Path;
use std::sync::Arc;

use cv_agents::agent_pool::{AgentPool, AgentPoolError};
use cv_agents::decision::DecisionEngine;
use cv_agents::pipeline::{DualAgentPipeline, PipelineError};
use cv_agents::prompts::PromptRegistry;
use cv_core::config::{Config, ConfigError};
use cv_core::escalation::{EscalationError, EscalationQueue};
use cv_core::events::{ConveyorEvent, EventBus};
use cv_core::git::GitRunner;
use cv_core::graph::{DependencyGraph, GraphError};
use cv_core::sprint_status::{SprintStatusError, SprintStatusStore};
use cv_core::state::{StateError, StateManager};
use cv_core::types::{Story, StoryId, StoryStatus};
use cv_core::worktree::{WorktreeError, WorktreeManager};
use cv_integrations::GitHost;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::pr_automator::PrAutomationError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("backlog error: {0}")]
    Backlog(String),
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("sprint status error: {0}")]
    SprintStatus(#[from] SprintStatusError),
    #[error("escalation error: {0}")]
    Escalation(#[from] EscalationError),
    #[error("agent pool error: {0}")]
    AgentPool(#[from] AgentPoolError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    PrAutomation(#[from] PrAutomationError),
    #[error("story {0} cannot start: hard dependencies are not merged")]
    NotReady(StoryId),
    #[error("story {story_id} still has {pending} pending escalation(s)")]
    EscalationPending { story_id: StoryId, pending: usize },
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// OrchestratorContext
// ---------------------------------------------------------------------------

/// Every long-lived service of one orchestrator, built once and shared by
/// each story run.
///
/// The dependency graph and the sprint-status store are the only state
/// shared between concurrently running stories. Graph mutations take
/// `graph` first and update the sprint status while still holding it.
pub struct OrchestratorContext {
    pub config: Config,
    pub events: EventBus,
    pub state: Arc<StateManager>,
    pub worktrees: Arc<WorktreeManager>,
    pub graph: Arc<Mutex<DependencyGraph>>,
    pub sprint: Arc<SprintStatusStore>,
    pub escalations: Arc<EscalationQueue>,
    pub decisions: Arc<DecisionEngine>,
    pub pool: Arc<AgentPool>,
    pub pipeline: Arc<DualAgentPipeline>,
    pub host: Arc<dyn GitHost>,
}

impl OrchestratorContext {
    /// Open the on-disk stores under `config.state_root()` and wire the
    /// services together. Persisted sprint statuses override the statuses
    /// declared in `stories`.
    pub async fn open(
        config: Config,
        stories: Vec<Story>,
        pool: AgentPool,
        host: Arc<dyn GitHost>,
        git: Arc<dyn GitRunner>,
        events: EventBus,
    ) -> Result<Self> {
        config.validate()?;
        let state_root = config.state_root();

        let state = Arc::new(StateManager::new(&state_root));
        let sprint = Arc::new(SprintStatusStore::open(&state_root).await?);
        let escalations =
            Arc::new(EscalationQueue::open(&state_root, config.pipeline.max_escalations).await?);

        sprint.seed(&stories).await?;
        let mut graph = DependencyGraph::build(stories)?;
        let snapshot = sprint.snapshot().await;
        graph.apply_statuses(&snapshot.stories);
        let circular: Vec<StoryId> = graph.circular().iter().cloned().collect();
        if !circular.is_empty() {
            warn!(stories = ?circular, "stories on a dependency cycle are blocked");
            for id in &circular {
                graph.set_status(id, StoryStatus::Blocked)?;
            }
            sprint
                .update(|doc| {
                    for id in &circular {
                        doc.set(id.clone(), StoryStatus::Blocked);
                    }
                })
                .await?;
        }

        let mut prompts = PromptRegistry::new();
        let overrides = prompts.load_overrides(&state_root.join("prompts"));
        if overrides > 0 {
            info!(overrides, "prompt overrides loaded");
        }

        let worktrees = Arc::new(WorktreeManager::with_git_runner(
            config.general.repo_root.clone(),
            git,
        ));
        let pool = Arc::new(pool);
        let decisions = Arc::new(DecisionEngine::new(escalations.clone(), events.clone()));
        let pipeline = Arc::new(DualAgentPipeline::new(
            pool.clone(),
            state.clone(),
            decisions.clone(),
            Arc::new(prompts),
        ));

        Ok(Self {
            config,
            events,
            state,
            worktrees,
            graph: Arc::new(Mutex::new(graph)),
            sprint,
            escalations,
            decisions,
            pool,
            pipeline,
            host,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.config.general.project_id
    }

    pub fn base_branch(&self) -> &str {
        &self.config.general.base_branch
    }

    /// Record `status` in the graph and the sprint status under one graph
    /// lock, then announce it.
    pub async fn set_story_status(
        &self,
        story_id: &str,
        status: StoryStatus,
    ) -> std::result::Result<(), SprintStatusError> {
        {
            let mut graph = self.graph.lock().await;
            if let Err(e) = graph.set_status(story_id, status) {
                warn!(story_id, error = %e, "status change for a story outside the graph");
            }
            self.sprint.set(story_id, status).await?;
        }
        self.events.publish(ConveyorEvent::StoryStatusChanged {
            story_id: story_id.to_string(),
            status,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Backlog file
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum BacklogFile {
    List(Vec<Story>),
    Wrapped { stories: Vec<Story> },
}

/// Parse a backlog document: either a JSON array of stories or an object
/// with a `stories` array.
pub fn parse_backlog(text: &str) -> Result<Vec<Story>> {
    let parsed: BacklogFile =
        serde_json::from_str(text).map_err(|e| OrchestratorError::Backlog(e.to_string()))?;
    Ok(match parsed {
        BacklogFile::List(stories) | BacklogFile::Wrapped { stories } => stories,
    })
}

pub async fn load_backlog(path: &Path) -> Result<Vec<Story>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| OrchestratorError::Backlog(format!("{}: {e}", path.display())))?;
    parse_backlog(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlog_accepts_both_shapes() {
        let list = r#"[{"id": "1-1", "epic": 1, "number": 1, "title": "Setup"}]"#;
        let wrapped = r#"{"stories": [{"id": "1-1", "epic": 1, "number": 1, "title": "Setup",
                          "hard_dependencies": [], "complexity": 3}]}"#;
        assert_eq!(parse_backlog(list).unwrap()[0].id, "1-1");
        assert_eq!(parse_backlog(wrapped).unwrap()[0].complexity, 3);
    }

    #[test]
    fn malformed_backlog_is_reported() {
        assert!(matches!(
            parse_backlog("{\"nope\": 1}"),
            Err(OrchestratorError::Backlog(_))
        ));
    }
}
