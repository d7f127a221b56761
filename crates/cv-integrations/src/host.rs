use async_trait::async_trait;
use thiserror::Error;

use crate::types::{CheckRun, MergeMethod, MergeOutcome, NewPullRequest, PullRequest};

#[derive(Debug, Error)]
pub enum GitHostError {
    #[error("git host returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("a pull request for {head} already exists")]
    AlreadyExists { head: String },

    #[error("missing GitHub token: set {0}")]
    MissingToken(String),

    #[error("git host not configured: {0}")]
    Config(String),

    #[error("GitHub API error: {0}")]
    Api(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GitHostError>;

/// The git-hosting operations the release pipeline needs.
#[async_trait]
pub trait GitHost: Send + Sync {
    /// Fails with [`GitHostError::AlreadyExists`] when an open PR for the
    /// same head branch exists.
    async fn create_pull_request(&self, pr: &NewPullRequest) -> Result<PullRequest>;

    /// Open PRs whose head is `branch`.
    async fn list_open_pull_requests(&self, branch: &str) -> Result<Vec<PullRequest>>;

    async fn get_pull_request(&self, number: u64) -> Result<PullRequest>;

    async fn merge_pull_request(
        &self,
        number: u64,
        method: MergeMethod,
        commit_title: &str,
    ) -> Result<MergeOutcome>;

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<()>;

    async fn request_reviewers(
        &self,
        number: u64,
        reviewers: &[String],
        team_reviewers: &[String],
    ) -> Result<()>;

    /// Check runs for a commit sha or branch name.
    async fn list_check_runs(&self, git_ref: &str) -> Result<Vec<CheckRun>>;

    async fn rerequest_check_run(&self, check_run_id: u64) -> Result<()>;
}
