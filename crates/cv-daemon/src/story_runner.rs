use std::sync::Arc;
use std::time::Instant;

use cv_agents::decision::RunScope;
use cv_agents::pipeline::{PipelineOutcome, PipelineRun, StoryContext};
use cv_core::escalation::Escalation;
use cv_core::events::ConveyorEvent;
use cv_core::types::{ActivityStatus, AgentActivity, Story, StoryId, StoryStatus};
use tracing::{error, info, warn};

use crate::context::{OrchestratorContext, OrchestratorError, Result};
use crate::pr_automator::{MergeResult, PrCreationAutomator};

/// Where a story ended up after one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StoryOutcome {
    Merged {
        pr_number: u64,
        ready_stories: Vec<StoryId>,
    },
    /// Auto-merge is off; the PR waits for a human.
    AwaitingReview { pr_number: u64 },
    /// Suspended on a human decision. The worktree is kept for inspection.
    Escalated(Escalation),
    /// Story is `blocked`. The worktree is kept for inspection.
    Failed { reason: String },
    /// The project was paused before the story got going; it is `ready` again.
    Paused,
}

impl StoryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StoryOutcome::Merged { .. } => "merged",
            StoryOutcome::AwaitingReview { .. } => "awaiting_review",
            StoryOutcome::Escalated(_) => "escalated",
            StoryOutcome::Failed { .. } => "failed",
            StoryOutcome::Paused => "paused",
        }
    }
}

/// Drives a single story: claim, worktree, dual-agent pipeline, commit,
/// pull request, merge.
pub struct StoryRunner {
    ctx: Arc<OrchestratorContext>,
    prs: Arc<PrCreationAutomator>,
}

impl StoryRunner {
    pub fn new(ctx: Arc<OrchestratorContext>, prs: Arc<PrCreationAutomator>) -> Self {
        Self { ctx, prs }
    }

    /// Claim the story and run it to an outcome.
    ///
    /// Only claiming can fail: once the story is `in-progress`, every error
    /// is recorded against it and reported as [`StoryOutcome::Failed`].
    pub async fn run_story(&self, story_id: &str, scope: &RunScope) -> Result<StoryOutcome> {
        let story = self.claim(story_id).await?;
        let started = Instant::now();

        let outcome = match self.drive(&story, scope).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(story_id, error = %e, "story failed");
                let reason = e.to_string();
                self.record_failure(&story, &reason, started).await;
                StoryOutcome::Failed { reason }
            }
        };
        info!(
            story_id,
            outcome = outcome.label(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "story finished"
        );
        Ok(outcome)
    }

    /// Move a startable story to `in-progress`. The readiness check and the
    /// status change happen under one graph lock so two runners cannot both
    /// claim it.
    async fn claim(&self, story_id: &str) -> Result<Story> {
        let story = {
            let mut graph = self.ctx.graph.lock().await;
            if !graph.can_start(story_id) {
                return Err(OrchestratorError::NotReady(story_id.to_string()));
            }
            graph.set_status(story_id, StoryStatus::InProgress)?;
            self.ctx.sprint.set(story_id, StoryStatus::InProgress).await?;
            graph
                .story(story_id)
                .cloned()
                .ok_or_else(|| OrchestratorError::NotReady(story_id.to_string()))?
        };
        self.ctx.events.publish(ConveyorEvent::StoryStarted {
            story_id: story_id.to_string(),
        });
        self.ctx.events.publish(ConveyorEvent::StoryStatusChanged {
            story_id: story_id.to_string(),
            status: StoryStatus::InProgress,
        });
        Ok(story)
    }

    async fn drive(&self, story: &Story, scope: &RunScope) -> Result<StoryOutcome> {
        let story_id = story.id.as_str();
        let worktree = self
            .ctx
            .worktrees
            .create_worktree(story_id, self.ctx.base_branch())
            .await?;

        let story_ctx = StoryContext {
            story: story.clone(),
            worktree_path: worktree.path.clone(),
            scope: scope.clone(),
        };

        let outcome = match self.ctx.pipeline.run(&story_ctx).await? {
            PipelineRun::Paused { at } => {
                info!(story_id, stage = %at, "project paused; story returned to ready");
                self.ctx.worktrees.destroy_worktree(story_id).await?;
                self.ctx.set_story_status(story_id, StoryStatus::Ready).await?;
                return Ok(StoryOutcome::Paused);
            }
            PipelineRun::Completed(outcome) => outcome,
        };

        match outcome {
            PipelineOutcome::Passed(artifacts) => {
                let message = match artifacts.implementation.commit_message.trim() {
                    "" => format!("Story {}: {}", story.id, story.title),
                    m => m.to_string(),
                };
                if !self.ctx.worktrees.commit_all(story_id, &message).await? {
                    return self
                        .block(story_id, "implementation produced no changes to commit".into())
                        .await;
                }

                let pr = self.prs.create_pr(story, &artifacts).await?;
                if !self.prs.auto_merge_enabled() {
                    return Ok(StoryOutcome::AwaitingReview { pr_number: pr.number });
                }
                match self.prs.monitor_and_auto_merge(story, &pr, scope).await? {
                    MergeResult::Merged { ready_stories, .. } => Ok(StoryOutcome::Merged {
                        pr_number: pr.number,
                        ready_stories,
                    }),
                    MergeResult::Escalated(escalation) => Ok(StoryOutcome::Escalated(escalation)),
                }
            }
            PipelineOutcome::Failed { reason, .. } => self.block(story_id, reason).await,
            PipelineOutcome::Escalated { escalation, .. } => {
                warn!(story_id, escalation_id = %escalation.id, "story suspended on escalation");
                Ok(StoryOutcome::Escalated(escalation))
            }
        }
    }

    async fn block(&self, story_id: &str, reason: String) -> Result<StoryOutcome> {
        self.ctx.set_story_status(story_id, StoryStatus::Blocked).await?;
        self.ctx.events.publish(ConveyorEvent::StoryFailed {
            story_id: story_id.to_string(),
            reason: reason.clone(),
        });
        Ok(StoryOutcome::Failed { reason })
    }

    /// Best effort: the story is already failing, so bookkeeping errors are
    /// only logged.
    async fn record_failure(&self, story: &Story, reason: &str, started: Instant) {
        let story_id = story.id.as_str();
        if let Err(e) = self.block(story_id, reason.to_string()).await {
            warn!(story_id, error = %e, "could not mark story blocked");
        }
        let activity = AgentActivity::new(
            "orchestrator",
            "Conveyor",
            format!("story:{story_id}"),
            ActivityStatus::Failed,
        )
        .with_duration_ms(started.elapsed().as_millis() as u64)
        .with_output(reason);
        if let Err(e) = self
            .ctx
            .state
            .append_activity(self.ctx.project_id(), activity)
            .await
        {
            warn!(story_id, error = %e, "could not record story failure");
        }
    }
}
