//! Push, open (or reuse) the pull request, watch CI, merge, cascade.

use std::sync::Arc;
use std::time::Duration;

use cv_agents::artifacts::FileOperation;
use cv_agents::decision::RunScope;
use cv_agents::pipeline::PipelineArtifacts;
use cv_core::config::PipelineConfig;
use cv_core::escalation::{
    Escalation, EscalationError, EscalationSeverity, EscalationType, NewEscalation,
};
use cv_core::events::ConveyorEvent;
use cv_core::graph::GraphError;
use cv_core::sprint_status::SprintStatusError;
use cv_core::types::{Story, StoryId, StoryStatus};
use cv_core::worktree::WorktreeError;
use cv_integrations::types::{CiSnapshot, CiStatus, MergeMethod, NewPullRequest, PullRequest};
use cv_integrations::GitHostError;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::OrchestratorContext;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PrAutomationError {
    /// The branch could not be pushed. Operator action; never escalated.
    #[error("story {story_id}: branch push failed: {source}")]
    BranchPush {
        story_id: StoryId,
        #[source]
        source: WorktreeError,
    },
    #[error("story {story_id}: git host request failed: {source}")]
    Host {
        story_id: StoryId,
        #[source]
        source: GitHostError,
    },
    #[error("unknown merge method: {0}")]
    MergeMethod(String),
    #[error("escalation error: {0}")]
    Escalation(#[from] EscalationError),
    #[error("sprint status error: {0}")]
    SprintStatus(#[from] SprintStatusError),
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
}

pub type Result<T> = std::result::Result<T, PrAutomationError>;

// ---------------------------------------------------------------------------
// CiPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CiPolicy {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    /// Rounds of re-requesting failed checks before giving up.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// How long an empty check list is waited out before CI counts as absent.
    pub no_checks_grace: Duration,
}

impl From<&PipelineConfig> for CiPolicy {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(cfg.ci_polling_interval_secs),
            max_wait: Duration::from_secs(cfg.max_ci_wait_time_secs),
            max_retries: cfg.max_ci_retries,
            retry_delay: Duration::from_secs(cfg.ci_retry_delay_secs),
            no_checks_grace: Duration::from_secs(cfg.ci_no_checks_grace_secs),
        }
    }
}

/// How a monitored pull request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeResult {
    Merged {
        number: u64,
        sha: Option<String>,
        /// Dependents that became ready because of this merge.
        ready_stories: Vec<StoryId>,
    },
    /// A human has to look at it; the worktree is left in place.
    Escalated(Escalation),
}

// ---------------------------------------------------------------------------
// PrCreationAutomator
// ---------------------------------------------------------------------------

pub struct PrCreationAutomator {
    ctx: Arc<OrchestratorContext>,
    ci: CiPolicy,
    merge_method: MergeMethod,
}

impl PrCreationAutomator {
    pub fn new(ctx: Arc<OrchestratorContext>) -> Result<Self> {
        let method = &ctx.config.github.merge_method;
        let merge_method =
            MergeMethod::parse(method).ok_or_else(|| PrAutomationError::MergeMethod(method.clone()))?;
        let ci = CiPolicy::from(&ctx.config.pipeline);
        Ok(Self {
            ctx,
            ci,
            merge_method,
        })
    }

    pub fn with_ci_policy(mut self, ci: CiPolicy) -> Self {
        self.ci = ci;
        self
    }

    pub fn auto_merge_enabled(&self) -> bool {
        self.ctx.config.pipeline.auto_merge_enabled
    }

    /// Push the story branch and open its pull request, reusing an open one
    /// for the same branch. In manual-review mode the story is parked in
    /// `review` here.
    pub async fn create_pr(&self, story: &Story, artifacts: &PipelineArtifacts) -> Result<PullRequest> {
        let story_id = story.id.as_str();
        let host_err = |source| PrAutomationError::Host {
            story_id: story_id.to_string(),
            source,
        };

        self.ctx
            .worktrees
            .push_branch(story_id)
            .await
            .map_err(|source| PrAutomationError::BranchPush {
                story_id: story_id.to_string(),
                source,
            })?;

        let branch = story.branch_name();
        let request = NewPullRequest {
            title: pr_title(story),
            body: pr_body(story, artifacts),
            head: branch.clone(),
            base: self.ctx.base_branch().to_string(),
            draft: false,
        };

        let (pr, created) = match self.ctx.host.create_pull_request(&request).await {
            Ok(pr) => (pr, true),
            Err(GitHostError::AlreadyExists { head }) => {
                let existing = self
                    .ctx
                    .host
                    .list_open_pull_requests(&branch)
                    .await
                    .map_err(host_err)?
                    .into_iter()
                    .find(|pr| pr.head_branch == branch)
                    .ok_or_else(|| host_err(GitHostError::AlreadyExists { head }))?;
                info!(story_id, pr_number = existing.number, "reusing open pull request");
                (existing, false)
            }
            Err(e) => return Err(host_err(e)),
        };

        self.ctx
            .host
            .add_labels(pr.number, &self.labels_for(story))
            .await
            .map_err(host_err)?;

        let github = &self.ctx.config.github;
        if !github.reviewers.is_empty() || !github.team_reviewers.is_empty() {
            self.ctx
                .host
                .request_reviewers(pr.number, &github.reviewers, &github.team_reviewers)
                .await
                .map_err(host_err)?;
        }

        if created {
            self.ctx.events.publish(ConveyorEvent::PrCreated {
                story_id: story_id.to_string(),
                number: pr.number,
                url: pr.html_url.clone(),
            });
        }

        if !self.auto_merge_enabled() {
            self.ctx.set_story_status(story_id, StoryStatus::Review).await?;
            info!(story_id, pr_number = pr.number, "auto-merge disabled; awaiting manual review");
        }
        Ok(pr)
    }

    fn labels_for(&self, story: &Story) -> Vec<String> {
        let mut labels = vec![
            "ai-generated".to_string(),
            "reviewed".to_string(),
            format!("epic-{}", story.epic),
        ];
        for label in &self.ctx.config.github.labels {
            if !labels.contains(label) {
                labels.push(label.clone());
            }
        }
        labels
    }

    /// Poll CI until it passes, fails past the retry budget or runs out of
    /// time, then merge. Only a successful merge releases the worktree and
    /// cascades readiness.
    pub async fn monitor_and_auto_merge(
        &self,
        story: &Story,
        pr: &PullRequest,
        scope: &RunScope,
    ) -> Result<MergeResult> {
        let story_id = story.id.as_str();
        let host_err = |source| PrAutomationError::Host {
            story_id: story_id.to_string(),
            source,
        };
        let git_ref = pr.head_sha.clone().unwrap_or_else(|| pr.head_branch.clone());
        let started = Instant::now();
        let mut retries = 0u32;

        loop {
            let elapsed = started.elapsed();
            if elapsed >= self.ci.max_wait {
                return self.ci_timed_out(scope, story_id, pr.number, elapsed).await;
            }

            let checks = match self.ctx.host.list_check_runs(&git_ref).await {
                Ok(checks) => checks,
                Err(GitHostError::Status { status, message }) if status >= 500 => {
                    warn!(story_id, pr_number = pr.number, status, %message, "check-run listing failed; polling again");
                    self.sleep_within(self.ci.poll_interval, started).await;
                    continue;
                }
                Err(e) => return Err(host_err(e)),
            };
            let snapshot = CiSnapshot::new(checks, started.elapsed(), self.ci.max_wait);

            match &snapshot.status {
                CiStatus::Passed => break,
                CiStatus::NoChecks if snapshot.duration >= self.ci.no_checks_grace => {
                    info!(
                        story_id,
                        pr_number = pr.number,
                        waited_secs = snapshot.duration.as_secs(),
                        "no check runs registered; treating CI as absent"
                    );
                    break;
                }
                CiStatus::NoChecks | CiStatus::Pending => {
                    if snapshot.timed_out {
                        return self
                            .ci_timed_out(scope, story_id, pr.number, snapshot.duration)
                            .await;
                    }
                    debug!(story_id, pr_number = pr.number, checks = snapshot.all_checks.len(), "CI pending");
                    self.sleep_within(self.ci.poll_interval, started).await;
                }
                CiStatus::Failed(_) => {
                    let failed = snapshot.failed_checks();
                    let names: Vec<&str> = failed.iter().map(|c| c.name.as_str()).collect();
                    if retries >= self.ci.max_retries {
                        let escalation = self
                            .escalate(
                                scope,
                                story_id,
                                EscalationType::CiFailure,
                                EscalationSeverity::High,
                                format!(
                                    "CI checks still failing on PR #{} after {retries} retries: {}",
                                    pr.number,
                                    names.join(", ")
                                ),
                            )
                            .await?;
                        return Ok(MergeResult::Escalated(escalation));
                    }
                    retries += 1;
                    warn!(story_id, pr_number = pr.number, retry = retries, failed = ?names, "re-running failed checks");
                    for check in failed {
                        self.ctx
                            .host
                            .rerequest_check_run(check.id)
                            .await
                            .map_err(host_err)?;
                    }
                    self.sleep_within(self.ci.retry_delay, started).await;
                }
            }
        }

        info!(story_id, pr_number = pr.number, "CI passed; merging");
        let outcome = self
            .ctx
            .host
            .merge_pull_request(pr.number, self.merge_method, &format!("{} (#{})", pr.title, pr.number))
            .await
            .map_err(host_err)?;

        if !outcome.merged {
            let headline = if outcome.has_conflict {
                "Merge conflict detected"
            } else {
                "Merge rejected"
            };
            let escalation = self
                .escalate(
                    scope,
                    story_id,
                    EscalationType::MergeConflict,
                    EscalationSeverity::High,
                    format!("{headline} for PR #{}: {}", pr.number, outcome.message),
                )
                .await?;
            return Ok(MergeResult::Escalated(escalation));
        }

        self.ctx.events.publish(ConveyorEvent::PrMerged {
            story_id: story_id.to_string(),
            number: pr.number,
        });
        let ready_stories = self.complete_story(story_id).await?;
        Ok(MergeResult::Merged {
            number: pr.number,
            sha: outcome.sha,
            ready_stories,
        })
    }

    async fn ci_timed_out(
        &self,
        scope: &RunScope,
        story_id: &str,
        pr_number: u64,
        waited: Duration,
    ) -> Result<MergeResult> {
        let escalation = self
            .escalate(
                scope,
                story_id,
                EscalationType::CiTimeout,
                EscalationSeverity::Medium,
                format!(
                    "CI monitoring timed out for PR #{pr_number} after {}s",
                    waited.as_secs()
                ),
            )
            .await?;
        Ok(MergeResult::Escalated(escalation))
    }

    /// Sprint status `done`, worktree released, dependents re-evaluated.
    async fn complete_story(&self, story_id: &str) -> Result<Vec<StoryId>> {
        self.ctx.set_story_status(story_id, StoryStatus::Done).await?;

        if let Err(e) = self.ctx.worktrees.destroy_worktree(story_id).await {
            warn!(story_id, error = %e, "worktree cleanup after merge failed");
        }

        let triggered = {
            let mut graph = self.ctx.graph.lock().await;
            let result = graph.trigger_dependent_stories(story_id)?;
            self.ctx
                .sprint
                .update(|doc| {
                    for id in &result.ready_stories {
                        doc.set(id.clone(), StoryStatus::Ready);
                    }
                })
                .await?;
            result
        };

        if !triggered.circular_dependencies.is_empty() {
            warn!(story_id, circular = ?triggered.circular_dependencies, "dependents on a cycle stay blocked");
        }
        if !triggered.ready_stories.is_empty() {
            info!(story_id, ready = ?triggered.ready_stories, "dependent stories ready");
            self.ctx.events.publish(ConveyorEvent::StoriesReady {
                story_ids: triggered.ready_stories.clone(),
            });
        }
        Ok(triggered.ready_stories)
    }

    async fn escalate(
        &self,
        scope: &RunScope,
        story_id: &str,
        kind: EscalationType,
        severity: EscalationSeverity,
        description: String,
    ) -> Result<Escalation> {
        let request = NewEscalation::new(&scope.project_id, &scope.run_id, kind, severity, description)
            .for_story(story_id);
        Ok(self.ctx.decisions.escalate(request).await?)
    }

    async fn sleep_within(&self, wanted: Duration, started: Instant) {
        let remaining = self.ci.max_wait.saturating_sub(started.elapsed());
        tokio::time::sleep(wanted.min(remaining)).await;
    }
}

// ---------------------------------------------------------------------------
// PR text
// ---------------------------------------------------------------------------

pub fn pr_title(story: &Story) -> String {
    format!("Story {}: {}", story.id, story.title)
}

pub fn pr_body(story: &Story, artifacts: &PipelineArtifacts) -> String {
    let code = &artifacts.implementation;
    let tests = &artifacts.tests;
    let report = &artifacts.report;

    let mut body = format!("## Story {}: {}\n\n", story.id, story.title);
    if let Some(description) = story.description.as_deref().filter(|d| !d.is_empty()) {
        body.push_str(description);
        body.push_str("\n\n");
    }

    body.push_str("### Implementation\n\n");
    if !code.implementation_notes.is_empty() {
        body.push_str(&code.implementation_notes);
        body.push_str("\n\n");
    }
    for file in &code.files {
        let op = match file.operation {
            FileOperation::Create => "added",
            FileOperation::Modify => "modified",
            FileOperation::Delete => "deleted",
        };
        body.push_str(&format!("- `{}` ({op})\n", file.path));
    }

    if !code.acceptance_criteria_mapping.is_empty() {
        body.push_str("\n### Acceptance criteria\n\n");
        for (criterion, evidence) in &code.acceptance_criteria_mapping {
            body.push_str(&format!("- [x] {criterion}: {evidence}\n"));
        }
    }

    body.push_str(&format!(
        "\n### Tests\n\n{} tests ({}): {} passed, {} failed, {} skipped. Line coverage {:.1}%.\n",
        tests.test_count,
        tests.framework,
        tests.results.passed,
        tests.results.failed,
        tests.results.skipped,
        tests.coverage.lines,
    ));

    body.push_str(&format!(
        "\n### Independent review\n\nDecision **{}**, score {:.0}/100, confidence {:.2}.\n\
         Security {:.0}, quality {:.0}, tests {:.0}.\n",
        report.decision,
        report.overall_score,
        report.confidence,
        report.security_review.score,
        report.quality_analysis.score,
        report.test_validation.score,
    ));
    if !report.recommendations.is_empty() {
        body.push_str("\nRecommendations:\n");
        for rec in &report.recommendations {
            body.push_str(&format!("- {rec}\n"));
        }
    }

    body.push_str("\n---\nGenerated by conveyor.\n");
    body
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use cv_agents::artifacts::{
        CodeImplementation, Coverage, Decision, FileChange, IndependentReviewReport,
        ReportVerdict, ReviewSection, SelfReviewReport, TestResults, TestSuite,
    };

    use super::*;

    fn artifacts() -> PipelineArtifacts {
        let section = |score| ReviewSection {
            score,
            passed: true,
            findings: vec![],
            summary: String::new(),
        };
        PipelineArtifacts {
            implementation: CodeImplementation {
                files: vec![FileChange {
                    path: "src/login.rs".into(),
                    content: String::new(),
                    operation: FileOperation::Create,
                }],
                commit_message: "feat: login".into(),
                implementation_notes: "Adds a login handler.".into(),
                acceptance_criteria_mapping: BTreeMap::from([(
                    "user can log in".to_string(),
                    "src/login.rs".to_string(),
                )]),
            },
            tests: TestSuite {
                files: vec![],
                framework: "cargo test".into(),
                test_count: 4,
                coverage: Coverage {
                    lines: 81.25,
                    ..Coverage::default()
                },
                results: TestResults {
                    passed: 4,
                    ..TestResults::default()
                },
            },
            self_review: SelfReviewReport {
                confidence: 0.9,
                critical_issues: vec![],
                summary: String::new(),
            },
            report: IndependentReviewReport::assemble(
                section(92.0),
                section(85.0),
                section(88.0),
                ReportVerdict {
                    architecture_compliance: None,
                    overall_score: 88.0,
                    confidence: 0.9,
                    decision: Decision::Pass,
                    findings: vec![],
                    recommendations: vec!["add rate limiting".into()],
                },
            ),
        }
    }

    #[test]
    fn title_and_body_summarise_the_story() {
        let story = Story::new("2-3", 2, 3, "User login");
        assert_eq!(pr_title(&story), "Story 2-3: User login");

        let body = pr_body(&story, &artifacts());
        assert!(body.contains("`src/login.rs` (added)"));
        assert!(body.contains("- [x] user can log in: src/login.rs"));
        assert!(body.contains("4 tests (cargo test): 4 passed"));
        assert!(body.contains("Line coverage 81.2%") || body.contains("Line coverage 81.3%"));
        assert!(body.contains("Decision **pass**, score 88/100"));
        assert!(body.contains("- add rate limiting"));
    }

    #[test]
    fn ci_policy_from_config() {
        let policy = CiPolicy::from(&PipelineConfig::default());
        assert_eq!(policy.poll_interval, Duration::from_secs(30));
        assert_eq!(policy.max_wait, Duration::from_secs(1800));
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.retry_delay, Duration::from_secs(60));
        assert_eq!(policy.no_checks_grace, Duration::from_secs(120));
    }
}
