use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

/// The parts of a pull request the release pipeline cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub html_url: String,
    pub head_branch: String,
    pub head_sha: Option<String>,
    pub base_branch: String,
    pub state: PrState,
    pub mergeable: Option<bool>,
}

/// Input for `pulls.create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    #[serde(default)]
    pub draft: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Queued,
    InProgress,
    Completed,
    #[serde(other)]
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Success,
    Neutral,
    Skipped,
    Failure,
    Cancelled,
    TimedOut,
    ActionRequired,
    Stale,
    #[serde(other)]
    Unknown,
}

impl CheckConclusion {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            CheckConclusion::Failure
                | CheckConclusion::Cancelled
                | CheckConclusion::TimedOut
                | CheckConclusion::ActionRequired
                | CheckConclusion::Stale
                | CheckConclusion::Unknown
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRun {
    pub id: u64,
    pub name: String,
    pub status: CheckStatus,
    pub conclusion: Option<CheckConclusion>,
}

impl CheckRun {
    pub fn passed(id: u64, name: impl Into<String>) -> Self {
        Self::completed(id, name, CheckConclusion::Success)
    }

    pub fn failed(id: u64, name: impl Into<String>) -> Self {
        Self::completed(id, name, CheckConclusion::Failure)
    }

    pub fn in_progress(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: CheckStatus::InProgress,
            conclusion: None,
        }
    }

    pub fn completed(id: u64, name: impl Into<String>, conclusion: CheckConclusion) -> Self {
        Self {
            id,
            name: name.into(),
            status: CheckStatus::Completed,
            conclusion: Some(conclusion),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == CheckStatus::Completed && self.conclusion.is_some_and(|c| c.is_failure())
    }
}

/// Aggregate CI state for one ref.
#[derive(Debug, Clone, PartialEq)]
pub enum CiStatus {
    /// No check run has been registered for the ref yet.
    NoChecks,
    Pending,
    Passed,
    Failed(Vec<CheckRun>),
}

impl CiStatus {
    /// Failures win over pending runs.
    pub fn from_checks(checks: &[CheckRun]) -> Self {
        if checks.is_empty() {
            return CiStatus::NoChecks;
        }
        let failed: Vec<CheckRun> = checks.iter().filter(|c| c.is_failed()).cloned().collect();
        if !failed.is_empty() {
            return CiStatus::Failed(failed);
        }
        if checks.iter().any(|c| c.status != CheckStatus::Completed) {
            return CiStatus::Pending;
        }
        CiStatus::Passed
    }
}

/// One CI poll of a pull request head.
#[derive(Debug, Clone, PartialEq)]
pub struct CiSnapshot {
    pub status: CiStatus,
    pub all_checks: Vec<CheckRun>,
    /// Time since monitoring started.
    pub duration: Duration,
    pub timed_out: bool,
}

impl CiSnapshot {
    pub fn new(all_checks: Vec<CheckRun>, duration: Duration, max_wait: Duration) -> Self {
        Self {
            status: CiStatus::from_checks(&all_checks),
            all_checks,
            duration,
            timed_out: duration >= max_wait,
        }
    }

    pub fn failed_checks(&self) -> &[CheckRun] {
        match &self.status {
            CiStatus::Failed(failed) => failed,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    Merge,
    Squash,
    Rebase,
}

impl MergeMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "merge" => Some(MergeMethod::Merge),
            "squash" => Some(MergeMethod::Squash),
            "rebase" => Some(MergeMethod::Rebase),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MergeMethod::Merge => "merge",
            MergeMethod::Squash => "squash",
            MergeMethod::Rebase => "rebase",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub merged: bool,
    pub has_conflict: bool,
    pub sha: Option<String>,
    pub message: String,
}

impl MergeOutcome {
    pub fn merged(sha: impl Into<String>) -> Self {
        Self {
            merged: true,
            has_conflict: false,
            sha: Some(sha.into()),
            message: "Pull Request successfully merged".into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            merged: false,
            has_conflict: true,
            sha: None,
            message: message.into(),
        }
    }
}
