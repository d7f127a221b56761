use serde::{Deserialize, Serialize};
use std::fmt;

use crate::agent_pool::AgentType;

// ---------------------------------------------------------------------------
// PipelineStage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Implementing,
    Testing,
    SelfReviewing,
    IndependentReviewing,
    Passed,
    Failed,
    Escalated,
}

impl PipelineStage {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineStage::Passed | PipelineStage::Failed | PipelineStage::Escalated
        )
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PipelineStage::Implementing => "Implementing",
            PipelineStage::Testing => "Testing",
            PipelineStage::SelfReviewing => "SelfReviewing",
            PipelineStage::IndependentReviewing => "IndependentReviewing",
            PipelineStage::Passed => "Passed",
            PipelineStage::Failed => "Failed",
            PipelineStage::Escalated => "Escalated",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// PipelineEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEvent {
    CodeWritten,
    TestsWritten,
    SelfReviewed,
    Approved,
    Rejected,
    Escalate,
    Fail,
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PipelineEvent::CodeWritten => "CodeWritten",
            PipelineEvent::TestsWritten => "TestsWritten",
            PipelineEvent::SelfReviewed => "SelfReviewed",
            PipelineEvent::Approved => "Approved",
            PipelineEvent::Rejected => "Rejected",
            PipelineEvent::Escalate => "Escalate",
            PipelineEvent::Fail => "Fail",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// PipelineStep: one agent invocation
// ---------------------------------------------------------------------------

/// A single agent invocation inside the pipeline. Each step gets its own
/// agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Implement,
    WriteTests,
    SelfReview,
    ReviewSecurity,
    AnalyzeQuality,
    ValidateTests,
    GenerateReport,
}

impl PipelineStep {
    pub const ALL: [PipelineStep; 7] = [
        PipelineStep::Implement,
        PipelineStep::WriteTests,
        PipelineStep::SelfReview,
        PipelineStep::ReviewSecurity,
        PipelineStep::AnalyzeQuality,
        PipelineStep::ValidateTests,
        PipelineStep::GenerateReport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStep::Implement => "implement",
            PipelineStep::WriteTests => "write_tests",
            PipelineStep::SelfReview => "self_review",
            PipelineStep::ReviewSecurity => "review_security",
            PipelineStep::AnalyzeQuality => "analyze_quality",
            PipelineStep::ValidateTests => "validate_tests",
            PipelineStep::GenerateReport => "generate_report",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }

    pub fn agent_type(self) -> AgentType {
        match self {
            PipelineStep::Implement | PipelineStep::WriteTests | PipelineStep::SelfReview => {
                AgentType::Amelia
            }
            _ => AgentType::Alex,
        }
    }

    /// The stage this step runs in.
    pub fn stage(self) -> PipelineStage {
        match self {
            PipelineStep::Implement => PipelineStage::Implementing,
            PipelineStep::WriteTests => PipelineStage::Testing,
            PipelineStep::SelfReview => PipelineStage::SelfReviewing,
            _ => PipelineStage::IndependentReviewing,
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in stage {stage}")]
    InvalidTransition {
        stage: PipelineStage,
        event: PipelineEvent,
    },
}

// ---------------------------------------------------------------------------
// PipelineStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineStateMachine {
    current: PipelineStage,
    history: Vec<(PipelineStage, PipelineEvent, PipelineStage)>,
}

impl PipelineStateMachine {
    /// Create a new state machine starting in `Implementing`.
    pub fn new() -> Self {
        Self {
            current: PipelineStage::Implementing,
            history: Vec::new(),
        }
    }

    pub fn stage(&self) -> PipelineStage {
        self.current
    }

    pub fn history(&self) -> &[(PipelineStage, PipelineEvent, PipelineStage)] {
        &self.history
    }

    /// Valid transitions:
    /// - Implementing         + CodeWritten  -> Testing
    /// - Testing              + TestsWritten -> SelfReviewing
    /// - SelfReviewing        + SelfReviewed -> IndependentReviewing
    /// - IndependentReviewing + Approved     -> Passed
    /// - IndependentReviewing + Rejected     -> Failed
    /// - IndependentReviewing + Escalate     -> Escalated
    /// - any non-terminal     + Fail         -> Failed
    pub fn transition(&mut self, event: PipelineEvent) -> Result<PipelineStage, StateMachineError> {
        use PipelineEvent as E;
        use PipelineStage as S;

        let next = match (self.current, event) {
            (S::Implementing, E::CodeWritten) => S::Testing,
            (S::Testing, E::TestsWritten) => S::SelfReviewing,
            (S::SelfReviewing, E::SelfReviewed) => S::IndependentReviewing,
            (S::IndependentReviewing, E::Approved) => S::Passed,
            (S::IndependentReviewing, E::Rejected) => S::Failed,
            (S::IndependentReviewing, E::Escalate) => S::Escalated,
            (stage, E::Fail) if !stage.is_terminal() => S::Failed,
            _ => {
                return Err(StateMachineError::InvalidTransition {
                    stage: self.current,
                    event,
                });
            }
        };

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "pipeline stage transition");
        Ok(next)
    }
}

impl Default for PipelineStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
