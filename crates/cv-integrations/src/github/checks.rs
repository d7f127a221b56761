use serde::Deserialize;

use crate::host::Result;
use crate::types::{CheckConclusion, CheckRun, CheckStatus};

use super::client::GitHubClient;

#[derive(Deserialize)]
struct CheckRunList {
    check_runs: Vec<RawCheckRun>,
}

#[derive(Deserialize)]
struct RawCheckRun {
    id: u64,
    name: String,
    status: CheckStatus,
    conclusion: Option<CheckConclusion>,
}

/// `checks.listForRef`: check runs for a commit sha or branch.
pub async fn list_check_runs(client: &GitHubClient, git_ref: &str) -> Result<Vec<CheckRun>> {
    let route = client.route(&format!(
        "commits/{}/check-runs?per_page=100",
        urlencoding::encode(git_ref)
    ));
    let list: CheckRunList = client.octocrab.get(route, None::<&()>).await?;

    Ok(list
        .check_runs
        .into_iter()
        .map(|r| CheckRun {
            id: r.id,
            name: r.name,
            status: r.status,
            conclusion: r.conclusion,
        })
        .collect())
}

/// `checks.rerequestRun`. GitHub answers 201 with an empty body.
pub async fn rerequest_check_run(client: &GitHubClient, check_run_id: u64) -> Result<()> {
    let route = client.route(&format!("check-runs/{check_run_id}/rerequest"));
    let response = client.octocrab._post(route, None::<&()>).await?;
    octocrab::map_github_error(response).await?;
    Ok(())
}
