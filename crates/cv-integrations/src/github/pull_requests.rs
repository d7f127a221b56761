use serde::Deserialize;

use crate::host::{GitHostError, Result};
use crate::types::{MergeMethod, MergeOutcome, NewPullRequest, PrState, PullRequest};

use super::client::GitHubClient;

/// Create a new pull request. GitHub answers 422 when one already exists
/// for the head branch.
pub async fn create_pull_request(client: &GitHubClient, new: &NewPullRequest) -> Result<PullRequest> {
    let result = client
        .octocrab
        .pulls(&client.owner, &client.repo)
        .create(&new.title, &new.head, &new.base)
        .body(&new.body)
        .draft(new.draft)
        .send()
        .await;

    match result {
        Ok(pr) => {
            let pr = octocrab_pr_to_pull_request(pr);
            tracing::info!(number = pr.number, head = %new.head, "pull request created");
            Ok(pr)
        }
        Err(err) => match GitHostError::from(err) {
            GitHostError::Status { status: 422, message }
                if message.to_ascii_lowercase().contains("already exists") =>
            {
                Err(GitHostError::AlreadyExists {
                    head: new.head.clone(),
                })
            }
            other => Err(other),
        },
    }
}

/// List open pull requests whose head is `branch` in the configured repo.
pub async fn list_open_pull_requests(client: &GitHubClient, branch: &str) -> Result<Vec<PullRequest>> {
    let page = client
        .octocrab
        .pulls(&client.owner, &client.repo)
        .list()
        .state(octocrab::params::State::Open)
        .head(format!("{}:{}", client.owner, branch))
        .per_page(100)
        .send()
        .await?;

    Ok(page
        .items
        .into_iter()
        .map(octocrab_pr_to_pull_request)
        .filter(|pr| pr.head_branch == branch)
        .collect())
}

/// Get a single pull request by number.
pub async fn get_pull_request(client: &GitHubClient, number: u64) -> Result<PullRequest> {
    let pr = client
        .octocrab
        .pulls(&client.owner, &client.repo)
        .get(number)
        .await?;

    Ok(octocrab_pr_to_pull_request(pr))
}

#[derive(Deserialize)]
struct MergeResponse {
    sha: Option<String>,
    merged: bool,
    message: Option<String>,
}

/// Merge a pull request by number. A 405 (not mergeable) or 409 (head
/// moved since the checks ran) is reported as a conflict rather than an
/// error.
pub async fn merge_pull_request(
    client: &GitHubClient,
    number: u64,
    method: MergeMethod,
    commit_title: &str,
) -> Result<MergeOutcome> {
    let route = client.route(&format!("pulls/{number}/merge"));
    let body = serde_json::json!({
        "commit_title": commit_title,
        "merge_method": method.as_str(),
    });

    let result: std::result::Result<MergeResponse, octocrab::Error> =
        client.octocrab.put(route, Some(&body)).await;

    match result {
        Ok(resp) => Ok(MergeOutcome {
            merged: resp.merged,
            has_conflict: false,
            sha: resp.sha,
            message: resp.message.unwrap_or_default(),
        }),
        Err(err) => merge_error_outcome(number, GitHostError::from(err)),
    }
}

fn merge_error_outcome(number: u64, err: GitHostError) -> Result<MergeOutcome> {
    match err {
        GitHostError::Status {
            status: status @ (405 | 409),
            message,
        } => {
            tracing::warn!(number, status, %message, "pull request not mergeable");
            Ok(MergeOutcome::conflict(message))
        }
        other => Err(other),
    }
}

/// Add labels to the pull request's issue.
pub async fn add_labels(client: &GitHubClient, number: u64, labels: &[String]) -> Result<()> {
    if labels.is_empty() {
        return Ok(());
    }
    client
        .octocrab
        .issues(&client.owner, &client.repo)
        .add_labels(number, labels)
        .await?;
    Ok(())
}

pub async fn request_reviewers(
    client: &GitHubClient,
    number: u64,
    reviewers: &[String],
    team_reviewers: &[String],
) -> Result<()> {
    if reviewers.is_empty() && team_reviewers.is_empty() {
        return Ok(());
    }
    let route = client.route(&format!("pulls/{number}/requested_reviewers"));
    let body = serde_json::json!({
        "reviewers": reviewers,
        "team_reviewers": team_reviewers,
    });
    let _: serde_json::Value = client.octocrab.post(route, Some(&body)).await?;
    Ok(())
}

// ---- internal helpers -------------------------------------------------------

pub(crate) fn octocrab_pr_to_pull_request(pr: octocrab::models::pulls::PullRequest) -> PullRequest {
    let state = if pr.merged_at.is_some() {
        PrState::Merged
    } else {
        match pr.state {
            Some(octocrab::models::IssueState::Closed) => PrState::Closed,
            _ => PrState::Open,
        }
    };

    PullRequest {
        number: pr.number,
        title: pr.title.unwrap_or_default(),
        html_url: pr.html_url.map(|u| u.to_string()).unwrap_or_default(),
        head_branch: pr.head.ref_field.clone(),
        head_sha: Some(pr.head.sha.clone()),
        base_branch: pr.base.ref_field.clone(),
        state,
        mergeable: pr.mergeable,
    }
}
