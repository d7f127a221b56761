//! Turns Alex's report into a pipeline branch and owns escalation creation.

use std::sync::Arc;

use cv_core::escalation::{
    Escalation, EscalationError, EscalationQueue, EscalationSeverity, EscalationType,
    NewEscalation,
};
use cv_core::events::{ConveyorEvent, EventBus};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::artifacts::{Decision, FindingSeverity, IndependentReviewReport};

/// Identifies the run an escalation is charged to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunScope {
    pub project_id: String,
    pub run_id: String,
}

impl RunScope {
    pub fn new(project_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            run_id: run_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionPolicy {
    /// A `pass` below this confidence goes to a human instead.
    pub min_pass_confidence: f64,
    /// A `pass` carrying a critical finding goes to a human instead.
    pub escalate_critical_findings: bool,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            min_pass_confidence: 0.5,
            escalate_critical_findings: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionOutcome {
    Proceed,
    Halt { reason: String },
    Suspended { escalation: Escalation },
}

pub struct DecisionEngine {
    queue: Arc<EscalationQueue>,
    events: EventBus,
    policy: DecisionPolicy,
}

impl DecisionEngine {
    pub fn new(queue: Arc<EscalationQueue>, events: EventBus) -> Self {
        Self {
            queue,
            events,
            policy: DecisionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DecisionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn queue(&self) -> &Arc<EscalationQueue> {
        &self.queue
    }

    /// The effective decision and, when it differs from Alex's, why.
    pub fn decide(&self, report: &IndependentReviewReport) -> (Decision, Option<String>) {
        if report.decision != Decision::Pass {
            return (report.decision, None);
        }
        if report.confidence < self.policy.min_pass_confidence {
            return (
                Decision::Escalate,
                Some(format!(
                    "reviewer passed with confidence {:.2} below {:.2}",
                    report.confidence, self.policy.min_pass_confidence
                )),
            );
        }
        if self.policy.escalate_critical_findings
            && report.max_severity() == Some(FindingSeverity::Critical)
        {
            return (
                Decision::Escalate,
                Some("reviewer passed despite a critical finding".into()),
            );
        }
        (Decision::Pass, None)
    }

    /// Apply the decision for `story_id`. Escalations are persisted before
    /// this returns.
    pub async fn apply(
        &self,
        scope: &RunScope,
        story_id: &str,
        report: &IndependentReviewReport,
    ) -> Result<DecisionOutcome, EscalationError> {
        let (decision, override_reason) = self.decide(report);
        info!(story_id, decision = %decision, reviewer_decision = %report.decision, "review decision");

        match decision {
            Decision::Pass => Ok(DecisionOutcome::Proceed),
            Decision::Fail => Ok(DecisionOutcome::Halt {
                reason: summarize(report, "review failed"),
            }),
            Decision::Escalate => {
                let headline = override_reason.unwrap_or_else(|| "reviewer requested a human decision".into());
                let request = NewEscalation::new(
                    &scope.project_id,
                    &scope.run_id,
                    EscalationType::ReviewDecision,
                    severity_for(report),
                    summarize(report, &format!("Story {story_id}: {headline}")),
                )
                .for_story(story_id);
                let escalation = self.escalate(request).await?;
                Ok(DecisionOutcome::Suspended { escalation })
            }
        }
    }

    /// Persist an escalation and announce it. Every escalation in the
    /// system goes through here.
    pub async fn escalate(&self, request: NewEscalation) -> Result<Escalation, EscalationError> {
        let escalation = self.queue.escalate(request).await?;
        self.events.publish(ConveyorEvent::EscalationCreated {
            escalation_id: escalation.id,
            story_id: escalation.story_id.clone(),
            description: escalation.description.clone(),
        });
        Ok(escalation)
    }
}

fn severity_for(report: &IndependentReviewReport) -> EscalationSeverity {
    match report.max_severity() {
        Some(FindingSeverity::Critical) => EscalationSeverity::Critical,
        Some(FindingSeverity::High) => EscalationSeverity::High,
        _ => EscalationSeverity::Medium,
    }
}

fn summarize(report: &IndependentReviewReport, headline: &str) -> String {
    let mut out = format!(
        "{headline} (score {:.0}, confidence {:.2})",
        report.overall_score, report.confidence
    );
    for finding in report.all_findings().filter(|f| f.severity >= FindingSeverity::High) {
        out.push_str(&format!("\n- [{:?}] {}", finding.severity, finding.description));
    }
    for rec in &report.recommendations {
        out.push_str(&format!("\n* {rec}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{Finding, ReportVerdict, ReviewSection};

    fn section() -> ReviewSection {
        ReviewSection {
            score: 90.0,
            passed: true,
            findings: vec![],
            summary: String::new(),
        }
    }

    fn report(decision: Decision, confidence: f64, findings: Vec<Finding>) -> IndependentReviewReport {
        IndependentReviewReport::assemble(
            section(),
            section(),
            section(),
            ReportVerdict {
                architecture_compliance: None,
                overall_score: 88.0,
                confidence,
                decision,
                findings,
                recommendations: vec!["add docs".into()],
            },
        )
    }

    async fn engine(tmp: &tempfile::TempDir) -> DecisionEngine {
        let queue = Arc::new(EscalationQueue::open(tmp.path(), 3).await.unwrap());
        DecisionEngine::new(queue, EventBus::new())
    }

    fn critical() -> Finding {
        Finding {
            severity: FindingSeverity::Critical,
            category: "security".into(),
            description: "hard-coded credential".into(),
            file: Some("src/auth.rs".into()),
        }
    }

    #[tokio::test]
    async fn confident_pass_proceeds() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(&tmp).await;
        let scope = RunScope::new("p", "run-1");
        let outcome = engine
            .apply(&scope, "1-1", &report(Decision::Pass, 0.9, vec![]))
            .await
            .unwrap();
        assert_eq!(outcome, DecisionOutcome::Proceed);
        assert_eq!(engine.queue().count_pending("run-1").await, 0);
    }

    #[tokio::test]
    async fn fail_halts_without_escalating() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(&tmp).await;
        let outcome = engine
            .apply(&RunScope::new("p", "r"), "1-1", &report(Decision::Fail, 0.9, vec![]))
            .await
            .unwrap();
        assert!(matches!(outcome, DecisionOutcome::Halt { .. }));
        assert_eq!(engine.queue().count_pending("r").await, 0);
    }

    #[tokio::test]
    async fn escalate_records_one_pending_escalation() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(&tmp).await;
        let outcome = engine
            .apply(&RunScope::new("p", "r"), "2-1", &report(Decision::Escalate, 0.4, vec![]))
            .await
            .unwrap();
        let DecisionOutcome::Suspended { escalation } = outcome else {
            panic!("expected suspension");
        };
        assert_eq!(escalation.story_id.as_deref(), Some("2-1"));
        assert_eq!(escalation.escalation_type, EscalationType::ReviewDecision);
        assert_eq!(engine.queue().count_pending("r").await, 1);
    }

    #[test]
    fn guarded_pass_is_escalated() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Arc::new(
            tokio::runtime::Runtime::new()
                .unwrap()
                .block_on(EscalationQueue::open(tmp.path(), 3))
                .unwrap(),
        );
        let engine = DecisionEngine::new(queue, EventBus::new());

        let (d, why) = engine.decide(&report(Decision::Pass, 0.2, vec![]));
        assert_eq!(d, Decision::Escalate);
        assert!(why.unwrap().contains("confidence"));

        let (d, _) = engine.decide(&report(Decision::Pass, 0.95, vec![critical()]));
        assert_eq!(d, Decision::Escalate);
        assert_eq!(severity_for(&report(Decision::Pass, 0.95, vec![critical()])), EscalationSeverity::Critical);

        let lenient = engine.with_policy(DecisionPolicy {
            min_pass_confidence: 0.0,
            escalate_critical_findings: false,
        });
        let (d, _) = lenient.decide(&report(Decision::Pass, 0.2, vec![critical()]));
        assert_eq!(d, Decision::Pass);
    }
}
