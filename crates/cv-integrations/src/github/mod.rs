pub mod checks;
pub mod client;
pub mod pull_requests;

use async_trait::async_trait;

use crate::host::{GitHost, Result};
use crate::types::{CheckRun, MergeMethod, MergeOutcome, NewPullRequest, PullRequest};

pub use client::GitHubClient;

#[async_trait]
impl GitHost for GitHubClient {
    async fn create_pull_request(&self, pr: &NewPullRequest) -> Result<PullRequest> {
        pull_requests::create_pull_request(self, pr).await
    }

    async fn list_open_pull_requests(&self, branch: &str) -> Result<Vec<PullRequest>> {
        pull_requests::list_open_pull_requests(self, branch).await
    }

    async fn get_pull_request(&self, number: u64) -> Result<PullRequest> {
        pull_requests::get_pull_request(self, number).await
    }

    async fn merge_pull_request(
        &self,
        number: u64,
        method: MergeMethod,
        commit_title: &str,
    ) -> Result<MergeOutcome> {
        pull_requests::merge_pull_request(self, number, method, commit_title).await
    }

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<()> {
        pull_requests::add_labels(self, number, labels).await
    }

    async fn request_reviewers(
        &self,
        number: u64,
        reviewers: &[String],
        team_reviewers: &[String],
    ) -> Result<()> {
        pull_requests::request_reviewers(self, number, reviewers, team_reviewers).await
    }

    async fn list_check_runs(&self, git_ref: &str) -> Result<Vec<CheckRun>> {
        checks::list_check_runs(self, git_ref).await
    }

    async fn rerequest_check_run(&self, check_run_id: u64) -> Result<()> {
        checks::rerequest_check_run(self, check_run_id).await
    }
}
