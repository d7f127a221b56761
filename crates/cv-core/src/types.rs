use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Story identifiers are the backlog keys (e.g. `"2-3-user-login"`).
pub type StoryId = String;

// ---------------------------------------------------------------------------
// StoryStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoryStatus {
    Backlog,
    Ready,
    InProgress,
    Review,
    Merged,
    Done,
    Blocked,
}

impl StoryStatus {
    /// `true` once the story's code is on the base branch. Only complete
    /// stories satisfy a hard dependency.
    pub fn is_complete(&self) -> bool {
        matches!(self, StoryStatus::Merged | StoryStatus::Done)
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StoryStatus::Backlog => "backlog",
            StoryStatus::Ready => "ready",
            StoryStatus::InProgress => "in-progress",
            StoryStatus::Review => "review",
            StoryStatus::Merged => "merged",
            StoryStatus::Done => "done",
            StoryStatus::Blocked => "blocked",
        };
        write!(f, "{label}")
    }
}

// ---------------------------------------------------------------------------
// Story
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub id: StoryId,
    pub epic: u32,
    pub number: u32,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default = "default_story_status")]
    pub status: StoryStatus,
    /// Stories that must be merged before this one may start.
    #[serde(default)]
    pub hard_dependencies: Vec<StoryId>,
    /// Advisory ordering only; never gates readiness.
    #[serde(default)]
    pub soft_dependencies: Vec<StoryId>,
    /// Relative size used as the critical-path weight.
    #[serde(default = "default_complexity")]
    pub complexity: u32,
}

fn default_story_status() -> StoryStatus {
    StoryStatus::Backlog
}

fn default_complexity() -> u32 {
    1
}

impl Story {
    pub fn new(id: impl Into<String>, epic: u32, number: u32, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            epic,
            number,
            title: title.into(),
            description: None,
            acceptance_criteria: Vec::new(),
            status: StoryStatus::Backlog,
            hard_dependencies: Vec::new(),
            soft_dependencies: Vec::new(),
            complexity: 1,
        }
    }

    pub fn with_hard_dependency(mut self, id: impl Into<String>) -> Self {
        self.hard_dependencies.push(id.into());
        self
    }

    pub fn with_soft_dependency(mut self, id: impl Into<String>) -> Self {
        self.soft_dependencies.push(id.into());
        self
    }

    pub fn with_complexity(mut self, complexity: u32) -> Self {
        self.complexity = complexity;
        self
    }

    /// Branch name used for the story's worktree and pull request.
    pub fn branch_name(&self) -> String {
        story_branch(&self.id)
    }
}

/// `story/{id}`, the branch every story pipeline works on.
pub fn story_branch(story_id: &str) -> String {
    format!("story/{story_id}")
}

// ---------------------------------------------------------------------------
// DependencyEdge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Hard,
    Soft,
}

/// `source` must land before `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub source: StoryId,
    pub target: StoryId,
    pub dependency_type: DependencyType,
    pub is_blocking: bool,
}

impl DependencyEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>, kind: DependencyType) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            dependency_type: kind,
            is_blocking: kind == DependencyType::Hard,
        }
    }
}

// ---------------------------------------------------------------------------
// Worktree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Active,
    Pushed,
    Destroyed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub story_id: StoryId,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub created_at: DateTime<Utc>,
    pub status: WorktreeStatus,
}

// ---------------------------------------------------------------------------
// WorkflowStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Paused,
    Completed,
    Error,
}

impl WorkflowStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `Paused -> Completed` is deliberately absent: a paused run has to be
    /// resumed before it can finish.
    pub fn can_transition_to(&self, target: &WorkflowStatus) -> bool {
        matches!(
            (self, target),
            (WorkflowStatus::Running, WorkflowStatus::Paused)
                | (WorkflowStatus::Paused, WorkflowStatus::Running)
                | (WorkflowStatus::Running, WorkflowStatus::Completed)
                | (WorkflowStatus::Running, WorkflowStatus::Error)
        )
    }

    /// Whether a new scheduling run may take over a workflow in this state.
    /// Finished and failed workflows are reopened; a paused one has to be
    /// resumed first.
    pub fn can_start_run(&self) -> bool {
        !matches!(self, WorkflowStatus::Paused)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Error => "error",
        };
        write!(f, "{label}")
    }
}

// ---------------------------------------------------------------------------
// AgentActivity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Running,
    Completed,
    Failed,
}

/// One entry of the append-only activity log kept in [`WorkflowState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentActivity {
    pub agent_id: String,
    pub agent_name: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub status: ActivityStatus,
    pub output: Option<String>,
}

impl AgentActivity {
    pub fn new(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        action: impl Into<String>,
        status: ActivityStatus,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            action: action.into(),
            timestamp: Utc::now(),
            duration_ms: None,
            status,
            output: None,
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub project_id: String,
    pub project_name: String,
    pub current_workflow: String,
    pub current_step: Option<String>,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub agent_activity: Vec<AgentActivity>,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(
        project_id: impl Into<String>,
        project_name: impl Into<String>,
        workflow: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            project_id: project_id.into(),
            project_name: project_name.into(),
            current_workflow: workflow.into(),
            current_step: None,
            status: WorkflowStatus::Running,
            variables: BTreeMap::new(),
            agent_activity: Vec::new(),
            start_time: now,
            last_update: now,
        }
    }
}

/// Identifier of one scheduling run; escalation budgets are counted per run.
pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn story_status_uses_kebab_case_on_the_wire() {
        let json = serde_json::to_string(&StoryStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
        let back: StoryStatus = serde_json::from_str("\"done\"").unwrap();
        assert_eq!(back, StoryStatus::Done);
        assert_eq!(StoryStatus::InProgress.to_string(), "in-progress");
    }

    #[test]
    fn only_merged_and_done_are_complete() {
        assert!(StoryStatus::Merged.is_complete());
        assert!(StoryStatus::Done.is_complete());
        assert!(!StoryStatus::Review.is_complete());
        assert!(!StoryStatus::InProgress.is_complete());
    }

    #[test]
    fn story_defaults_fill_in_missing_fields() {
        let story: Story =
            serde_json::from_str(r#"{"id":"1-1","epic":1,"number":1,"title":"Login"}"#).unwrap();
        assert_eq!(story.status, StoryStatus::Backlog);
        assert_eq!(story.complexity, 1);
        assert!(story.hard_dependencies.is_empty());
        assert_eq!(story.branch_name(), "story/1-1");
    }

    #[test]
    fn workflow_transitions_forbid_paused_to_completed() {
        assert!(WorkflowStatus::Running.can_transition_to(&WorkflowStatus::Paused));
        assert!(WorkflowStatus::Paused.can_transition_to(&WorkflowStatus::Running));
        assert!(WorkflowStatus::Running.can_transition_to(&WorkflowStatus::Completed));
        assert!(WorkflowStatus::Running.can_transition_to(&WorkflowStatus::Error));
        assert!(!WorkflowStatus::Paused.can_transition_to(&WorkflowStatus::Completed));
        assert!(!WorkflowStatus::Completed.can_transition_to(&WorkflowStatus::Running));
    }

    #[test]
    fn new_runs_reopen_everything_but_paused() {
        assert!(WorkflowStatus::Running.can_start_run());
        assert!(WorkflowStatus::Completed.can_start_run());
        assert!(WorkflowStatus::Error.can_start_run());
        assert!(!WorkflowStatus::Paused.can_start_run());
    }

    #[test]
    fn hard_edges_are_blocking() {
        let hard = DependencyEdge::new("1-1", "1-2", DependencyType::Hard);
        let soft = DependencyEdge::new("1-1", "1-3", DependencyType::Soft);
        assert!(hard.is_blocking);
        assert!(!soft.is_blocking);
    }
}
