use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use cv_agents::decision::RunScope;
use cv_core::escalation::EscalationStatus;
use cv_core::types::{new_run_id, StoryId, StoryStatus, WorkflowStatus};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use crate::context::{OrchestratorContext, OrchestratorError, Result};
use crate::pr_automator::PrCreationAutomator;
use crate::story_runner::{StoryOutcome, StoryRunner};

/// Used when the configured parallelism is zero.
const DEFAULT_MAX_PARALLEL: usize = 4;

/// Workflow name recorded in the project's state document.
const WORKFLOW: &str = "sprint";

/// Why a run stopped starting new stories before the backlog ran dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    Paused,
    EscalationBudget,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub outcomes: BTreeMap<StoryId, StoryOutcome>,
    pub halted: Option<Halt>,
    /// Workflow status when the run returned.
    pub status: WorkflowStatus,
}

impl RunSummary {
    pub fn merged(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, StoryOutcome::Merged { .. }))
            .count()
    }
}

/// Starts ready stories as dependencies clear.
///
/// Enforces the parallelism limit via a [`Semaphore`]: a story task holds an
/// owned permit for its whole lifetime, so `available_slots` is always the
/// number of stories that could start right now.
pub struct StoryScheduler {
    ctx: Arc<OrchestratorContext>,
    runner: Arc<StoryRunner>,
    concurrency_gate: Arc<Semaphore>,
    max_parallel: usize,
}

impl StoryScheduler {
    pub fn new(ctx: Arc<OrchestratorContext>, prs: Arc<PrCreationAutomator>) -> Self {
        let configured = ctx.config.pipeline.max_parallel_stories;
        let limit = if configured == 0 {
            warn!("max_parallel_stories was 0, defaulting to {DEFAULT_MAX_PARALLEL}");
            DEFAULT_MAX_PARALLEL
        } else {
            configured
        };
        let runner = Arc::new(StoryRunner::new(ctx.clone(), prs));
        Self {
            ctx,
            runner,
            concurrency_gate: Arc::new(Semaphore::new(limit)),
            max_parallel: limit,
        }
    }

    pub fn available_slots(&self) -> usize {
        self.concurrency_gate.available_permits()
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// One scheduling run: keep starting ready stories until nothing is
    /// ready and nothing is in flight.
    ///
    /// A paused project is left untouched. Before each start the pause flag
    /// and the escalation budget are checked; an exhausted budget moves the
    /// workflow to `error`. In-flight stories always run to their outcome.
    pub async fn run(&self) -> Result<RunSummary> {
        let project_id = self.ctx.project_id().to_string();
        let run_id = new_run_id();

        if self.ctx.state.is_paused(&project_id).await? {
            info!(project_id = %project_id, "project is paused; nothing started");
            return Ok(RunSummary {
                run_id,
                outcomes: BTreeMap::new(),
                halted: Some(Halt::Paused),
                status: WorkflowStatus::Paused,
            });
        }

        let span = cv_telemetry::run_span(&project_id, &run_id);
        self.run_scheduled(project_id, run_id).instrument(span).await
    }

    async fn run_scheduled(&self, project_id: String, run_id: String) -> Result<RunSummary> {
        self.ctx
            .state
            .start_run(&project_id, &self.ctx.config.general.project_name, WORKFLOW)
            .await?;
        self.ctx
            .state
            .set_variable(&project_id, "run_id", json!(run_id))
            .await?;
        info!(project_id = %project_id, run_id = %run_id, max_parallel = self.max_parallel, "scheduling run started");

        let scope = RunScope::new(&project_id, &run_id);
        let mut tasks = JoinSet::new();
        let mut task_stories: HashMap<tokio::task::Id, StoryId> = HashMap::new();
        let mut in_flight: HashSet<StoryId> = HashSet::new();
        let mut outcomes = BTreeMap::new();
        let mut halted = None;

        loop {
            if halted.is_none() {
                halted = self.check_halt(&project_id, &run_id).await?;
            }

            if halted.is_none() {
                let ready: Vec<StoryId> = self
                    .ctx
                    .graph
                    .lock()
                    .await
                    .ready_stories()
                    .into_iter()
                    .filter(|id| !in_flight.contains(id))
                    .collect();
                for story_id in ready {
                    let Ok(permit) = self.concurrency_gate.clone().try_acquire_owned() else {
                        break;
                    };
                    debug!(story_id = %story_id, "starting story");
                    let runner = self.runner.clone();
                    let scope = scope.clone();
                    let id = story_id.clone();
                    let span = cv_telemetry::story_span(&run_id, &story_id);
                    let handle = tasks.spawn(
                        async move {
                            let _permit = permit;
                            runner.run_story(&id, &scope).await
                        }
                        .instrument(span),
                    );
                    task_stories.insert(handle.id(), story_id.clone());
                    in_flight.insert(story_id);
                    // Re-check before every further start.
                    halted = self.check_halt(&project_id, &run_id).await?;
                    if halted.is_some() {
                        break;
                    }
                }
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            let (task_id, result) = match joined {
                Ok((task_id, result)) => (task_id, Ok(result)),
                Err(join_err) => (join_err.id(), Err(join_err)),
            };
            let Some(story_id) = task_stories.remove(&task_id) else {
                continue;
            };
            in_flight.remove(&story_id);

            match result {
                Ok(Ok(outcome)) => {
                    outcomes.insert(story_id, outcome);
                }
                Ok(Err(OrchestratorError::NotReady(_))) => {
                    debug!(story_id = %story_id, "story no longer startable");
                }
                Ok(Err(e)) => {
                    warn!(story_id = %story_id, error = %e, "story could not be claimed");
                }
                Err(join_err) => {
                    error!(story_id = %story_id, error = %join_err, "story task panicked");
                    if let Err(e) = self
                        .ctx
                        .set_story_status(&story_id, StoryStatus::Blocked)
                        .await
                    {
                        warn!(story_id = %story_id, error = %e, "could not mark story blocked");
                    }
                    outcomes.insert(
                        story_id,
                        StoryOutcome::Failed {
                            reason: join_err.to_string(),
                        },
                    );
                }
            }
        }

        let status = self.finish(&project_id).await?;
        let summary = RunSummary {
            run_id,
            outcomes,
            halted,
            status,
        };
        info!(
            project_id = %project_id,
            run_id = %summary.run_id,
            stories = summary.outcomes.len(),
            merged = summary.merged(),
            halted = ?summary.halted,
            status = %summary.status,
            "scheduling run finished"
        );
        Ok(summary)
    }

    async fn check_halt(&self, project_id: &str, run_id: &str) -> Result<Option<Halt>> {
        if self.ctx.state.is_paused(project_id).await? {
            info!(project_id = %project_id, "project paused; no further stories will start");
            return Ok(Some(Halt::Paused));
        }
        if self.ctx.escalations.budget_exhausted(run_id).await {
            let pending = self.ctx.escalations.count_pending(run_id).await;
            error!(
                project_id,
                run_id,
                pending,
                max = self.ctx.escalations.max_escalations(),
                "escalation budget exhausted; halting run"
            );
            if let Err(e) = self.ctx.state.transition(project_id, WorkflowStatus::Error).await {
                warn!(project_id = %project_id, error = %e, "could not move workflow to error");
            }
            return Ok(Some(Halt::EscalationBudget));
        }
        Ok(None)
    }

    /// The workflow completes only when every story is merged or done.
    /// Anything still open (escalated, blocked, in review) keeps it running.
    async fn finish(&self, project_id: &str) -> Result<WorkflowStatus> {
        let all_complete = {
            let graph = self.ctx.graph.lock().await;
            let all_complete = graph.stories().all(|s| s.status.is_complete());
            all_complete
        };
        let current = self
            .ctx
            .state
            .load_state(project_id)
            .await?
            .map(|s| s.status)
            .unwrap_or(WorkflowStatus::Running);

        if all_complete && current == WorkflowStatus::Running {
            self.ctx
                .state
                .transition(project_id, WorkflowStatus::Completed)
                .await?;
            return Ok(WorkflowStatus::Completed);
        }
        Ok(current)
    }

    /// Operator action after an escalation was answered: drop the preserved
    /// worktree and put the story back to `ready` so the next run restarts
    /// its pipeline from scratch.
    ///
    /// Refused while any escalation for the story is still pending; answered
    /// ones are resolved here.
    pub async fn requeue_story(&self, story_id: &str) -> Result<()> {
        let open = self.ctx.escalations.open_for_story(story_id).await;
        let pending = open
            .iter()
            .filter(|e| e.status == EscalationStatus::Pending)
            .count();
        if pending > 0 {
            return Err(OrchestratorError::EscalationPending {
                story_id: story_id.to_string(),
                pending,
            });
        }
        for escalation in &open {
            self.ctx.escalations.resolve(escalation.id).await?;
        }

        self.ctx.worktrees.destroy_worktree(story_id).await?;
        self.ctx.set_story_status(story_id, StoryStatus::Ready).await?;
        info!(story_id = %story_id, resolved = open.len(), "story requeued");
        Ok(())
    }
}
