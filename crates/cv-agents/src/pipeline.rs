//! Amelia -> Alex pipeline for a single story.
//!
//! Seven agent invocations, each on a freshly created agent:
//! implement, write tests, self-review (Amelia), then security review,
//! quality analysis, test validation and the aggregate report (Alex).
//! The [`DecisionEngine`] turns the report into pass / fail / escalate.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use cv_core::escalation::{Escalation, EscalationError};
use cv_core::state::{StateError, StateManager};
use cv_core::types::{ActivityStatus, AgentActivity, Story, StoryId};
use cv_intelligence::InvokeOptions;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::agent_pool::{AgentContext, AgentPool, AgentPoolError};
use crate::artifacts::{
    CodeImplementation, FileChange, FileOperation, IndependentReviewReport, ReportVerdict,
    ReviewSection, SelfReviewReport, TestSuite,
};
use crate::decision::{DecisionEngine, DecisionOutcome, RunScope};
use crate::json_parse::{parse_json, ParseOutcome};
use crate::prompts::{system_prompt, PromptRegistry};
use crate::state_machine::{
    PipelineEvent, PipelineStage, PipelineStateMachine, PipelineStep, StateMachineError,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Agent(#[from] AgentPoolError),
    #[error("unparseable agent output: {reason}")]
    Parse { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("story {story_id}: step {step} failed: {source}")]
    Step {
        story_id: StoryId,
        step: PipelineStep,
        #[source]
        source: StepError,
    },

    #[error("story {story_id}: cannot write {path}: {source}")]
    Workspace {
        story_id: StoryId,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("story {story_id}: agent proposed a path outside the worktree: {path}")]
    UnsafePath { story_id: StoryId, path: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Escalation(#[from] EscalationError),

    #[error(transparent)]
    Transition(#[from] StateMachineError),
}

impl PipelineError {
    /// The step that failed, when the failure came from an agent call.
    pub fn step(&self) -> Option<PipelineStep> {
        match self {
            PipelineError::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Everything one pipeline run needs to know about its story.
#[derive(Debug, Clone)]
pub struct StoryContext {
    pub story: Story,
    pub worktree_path: PathBuf,
    pub scope: RunScope,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineArtifacts {
    pub implementation: CodeImplementation,
    pub tests: TestSuite,
    pub self_review: SelfReviewReport,
    pub report: IndependentReviewReport,
}

#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Passed(Box<PipelineArtifacts>),
    Failed {
        reason: String,
        artifacts: Box<PipelineArtifacts>,
    },
    Escalated {
        escalation: Escalation,
        artifacts: Box<PipelineArtifacts>,
    },
}

impl PipelineOutcome {
    pub fn stage(&self) -> PipelineStage {
        match self {
            PipelineOutcome::Passed(_) => PipelineStage::Passed,
            PipelineOutcome::Failed { .. } => PipelineStage::Failed,
            PipelineOutcome::Escalated { .. } => PipelineStage::Escalated,
        }
    }

    pub fn artifacts(&self) -> &PipelineArtifacts {
        match self {
            PipelineOutcome::Passed(a) => a,
            PipelineOutcome::Failed { artifacts, .. } => artifacts,
            PipelineOutcome::Escalated { artifacts, .. } => artifacts,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PipelineRun {
    Completed(PipelineOutcome),
    /// The project was paused before `at` began.
    Paused { at: PipelineStage },
}

// ---------------------------------------------------------------------------
// DualAgentPipeline
// ---------------------------------------------------------------------------

pub struct DualAgentPipeline {
    pool: Arc<AgentPool>,
    state: Arc<StateManager>,
    decisions: Arc<DecisionEngine>,
    prompts: Arc<PromptRegistry>,
}

impl DualAgentPipeline {
    pub fn new(
        pool: Arc<AgentPool>,
        state: Arc<StateManager>,
        decisions: Arc<DecisionEngine>,
        prompts: Arc<PromptRegistry>,
    ) -> Self {
        Self {
            pool,
            state,
            decisions,
            prompts,
        }
    }

    pub async fn run(&self, ctx: &StoryContext) -> Result<PipelineRun> {
        let mut machine = PipelineStateMachine::new();
        let result = self.drive(ctx, &mut machine).await;
        if result.is_err() && !machine.stage().is_terminal() {
            machine.transition(PipelineEvent::Fail)?;
        }
        if let Ok(PipelineRun::Completed(outcome)) = &result {
            info!(story_id = %ctx.story.id, stage = %outcome.stage(), "pipeline finished");
        }
        result
    }

    async fn drive(&self, ctx: &StoryContext, machine: &mut PipelineStateMachine) -> Result<PipelineRun> {
        let story_id = ctx.story.id.as_str();
        let mut vars = base_vars(ctx);

        // Amelia
        if self.paused(ctx).await? {
            return Ok(PipelineRun::Paused { at: machine.stage() });
        }
        let implementation: CodeImplementation =
            self.run_step(ctx, PipelineStep::Implement, &vars).await?;
        let written = apply_file_changes(story_id, &ctx.worktree_path, &implementation.files).await?;
        info!(story_id, files = written, "implementation written");
        vars.insert("implementation", to_context(&implementation));
        machine.transition(PipelineEvent::CodeWritten)?;

        if self.paused(ctx).await? {
            return Ok(PipelineRun::Paused { at: machine.stage() });
        }
        let tests: TestSuite = self.run_step(ctx, PipelineStep::WriteTests, &vars).await?;
        apply_file_changes(story_id, &ctx.worktree_path, &tests.files).await?;
        vars.insert("tests", to_context(&tests));
        machine.transition(PipelineEvent::TestsWritten)?;

        if self.paused(ctx).await? {
            return Ok(PipelineRun::Paused { at: machine.stage() });
        }
        let self_review: SelfReviewReport =
            self.run_step(ctx, PipelineStep::SelfReview, &vars).await?;
        if !self_review.critical_issues.is_empty() {
            warn!(
                story_id,
                issues = self_review.critical_issues.len(),
                "developer self-review reported critical issues"
            );
        }
        vars.insert("self_review", to_context(&self_review));
        machine.transition(PipelineEvent::SelfReviewed)?;

        // Alex
        if self.paused(ctx).await? {
            return Ok(PipelineRun::Paused { at: machine.stage() });
        }
        let security: ReviewSection = self.run_step(ctx, PipelineStep::ReviewSecurity, &vars).await?;
        let quality: ReviewSection = self.run_step(ctx, PipelineStep::AnalyzeQuality, &vars).await?;
        let validation: ReviewSection = self.run_step(ctx, PipelineStep::ValidateTests, &vars).await?;
        vars.insert("security_review", to_context(&security));
        vars.insert("quality_analysis", to_context(&quality));
        vars.insert("test_validation", to_context(&validation));
        let verdict: ReportVerdict = self.run_step(ctx, PipelineStep::GenerateReport, &vars).await?;
        let report = IndependentReviewReport::assemble(security, quality, validation, verdict);

        let decision = self.decisions.apply(&ctx.scope, story_id, &report).await?;
        let artifacts = Box::new(PipelineArtifacts {
            implementation,
            tests,
            self_review,
            report,
        });
        let outcome = match decision {
            DecisionOutcome::Proceed => {
                machine.transition(PipelineEvent::Approved)?;
                PipelineOutcome::Passed(artifacts)
            }
            DecisionOutcome::Halt { reason } => {
                machine.transition(PipelineEvent::Rejected)?;
                PipelineOutcome::Failed { reason, artifacts }
            }
            DecisionOutcome::Suspended { escalation } => {
                machine.transition(PipelineEvent::Escalate)?;
                PipelineOutcome::Escalated {
                    escalation,
                    artifacts,
                }
            }
        };
        Ok(PipelineRun::Completed(outcome))
    }

    async fn paused(&self, ctx: &StoryContext) -> Result<bool> {
        let paused = self.state.is_paused(&ctx.scope.project_id).await?;
        if paused {
            info!(story_id = %ctx.story.id, "project paused; pipeline halting");
        }
        Ok(paused)
    }

    /// One agent invocation: fresh agent, call, activity record, parse.
    async fn run_step<T: DeserializeOwned>(
        &self,
        ctx: &StoryContext,
        step: PipelineStep,
        vars: &HashMap<&'static str, String>,
    ) -> Result<T> {
        let story_id = ctx.story.id.clone();
        let project_id = ctx.scope.project_id.as_str();
        let agent_type = step.agent_type();
        self.state
            .set_current_step(project_id, &format!("{story_id}:{step}"))
            .await?;

        let prompt = self.prompts.render(step, vars);
        let options = InvokeOptions::default().with_system_prompt(system_prompt(agent_type));

        let started = Instant::now();
        let (agent_id, reply) = {
            let lease = self
                .pool
                .lease(agent_type, AgentContext::new(&story_id, step.as_str()));
            let reply = lease.invoke(&prompt, &options).await;
            (lease.agent().id, reply)
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let activity = |status, output: String| {
            AgentActivity::new(
                agent_id.to_string(),
                agent_type.display_name(),
                format!("{story_id}:{step}"),
                status,
            )
            .with_duration_ms(duration_ms)
            .with_output(output)
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                self.state
                    .append_activity(project_id, activity(ActivityStatus::Failed, e.to_string()))
                    .await?;
                return Err(PipelineError::Step {
                    story_id,
                    step,
                    source: e.into(),
                });
            }
        };

        match parse_json::<T>(&reply.content) {
            ParseOutcome::Parsed(value) => {
                let summary = format!(
                    "{} in / {} out tokens, ${:.4}",
                    reply.input_tokens, reply.output_tokens, reply.cost_usd
                );
                self.state
                    .append_activity(project_id, activity(ActivityStatus::Completed, summary))
                    .await?;
                Ok(value)
            }
            ParseOutcome::Failed(reason) => {
                warn!(%story_id, step = %step, %reason, "agent output did not parse");
                self.state
                    .append_activity(project_id, activity(ActivityStatus::Failed, reason.clone()))
                    .await?;
                Err(PipelineError::Step {
                    story_id,
                    step,
                    source: StepError::Parse { reason },
                })
            }
        }
    }
}

fn base_vars(ctx: &StoryContext) -> HashMap<&'static str, String> {
    let story = &ctx.story;
    let criteria = if story.acceptance_criteria.is_empty() {
        "(none listed)".to_string()
    } else {
        story
            .acceptance_criteria
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    HashMap::from([
        ("story_id", story.id.clone()),
        ("title", story.title.clone()),
        ("description", story.description.clone().unwrap_or_default()),
        ("acceptance_criteria", criteria),
        ("worktree_path", ctx.worktree_path.display().to_string()),
    ])
}

fn to_context<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Worktree writes
// ---------------------------------------------------------------------------

/// Write the agent's file changes under `root`. Paths must be relative and
/// stay inside `root`. Returns the number of files touched.
pub async fn apply_file_changes(story_id: &str, root: &Path, changes: &[FileChange]) -> Result<usize> {
    for change in changes {
        let rel = Path::new(&change.path);
        let contained = !change.path.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !contained {
            return Err(PipelineError::UnsafePath {
                story_id: story_id.to_string(),
                path: change.path.clone(),
            });
        }
    }

    let io_err = |path: &Path, source| PipelineError::Workspace {
        story_id: story_id.to_string(),
        path: path.to_path_buf(),
        source,
    };

    for change in changes {
        let path = root.join(&change.path);
        match change.operation {
            FileOperation::Create | FileOperation::Modify => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| io_err(parent, e))?;
                }
                tokio::fs::write(&path, &change.content)
                    .await
                    .map_err(|e| io_err(&path, e))?;
            }
            FileOperation::Delete => match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(&path, e)),
            },
        }
    }
    Ok(changes.len())
}
