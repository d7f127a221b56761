//! In-memory [`GitHost`] for tests and dry runs.
//!
//! Check-run responses and merge outcomes are scripted per call; when a
//! script runs out the last check list repeats and merges succeed.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::host::{GitHost, GitHostError, Result};
use crate::types::{
    CheckRun, MergeMethod, MergeOutcome, NewPullRequest, PrState, PullRequest,
};

#[derive(Default)]
struct MockState {
    next_number: u64,
    prs: BTreeMap<u64, PullRequest>,
    check_script: VecDeque<Vec<CheckRun>>,
    last_checks: Vec<CheckRun>,
    merge_script: VecDeque<MergeOutcome>,
    create_calls: usize,
    list_check_calls: usize,
    rerequested: Vec<u64>,
    labels: BTreeMap<u64, Vec<String>>,
    reviewers: BTreeMap<u64, (Vec<String>, Vec<String>)>,
}

pub struct MockGitHost {
    state: Mutex<MockState>,
}

impl MockGitHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_number: 1,
                ..MockState::default()
            }),
        }
    }

    /// Queue the check runs returned by the next `list_check_runs` call.
    pub fn push_checks(&self, checks: Vec<CheckRun>) {
        self.state.lock().unwrap().check_script.push_back(checks);
    }

    pub fn push_merge(&self, outcome: MergeOutcome) {
        self.state.lock().unwrap().merge_script.push_back(outcome);
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().unwrap().create_calls
    }

    pub fn list_check_runs_calls(&self) -> usize {
        self.state.lock().unwrap().list_check_calls
    }

    pub fn rerequested(&self) -> Vec<u64> {
        self.state.lock().unwrap().rerequested.clone()
    }

    pub fn labels_for(&self, number: u64) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .labels
            .get(&number)
            .cloned()
            .unwrap_or_default()
    }

    pub fn reviewers_for(&self, number: u64) -> (Vec<String>, Vec<String>) {
        self.state
            .lock()
            .unwrap()
            .reviewers
            .get(&number)
            .cloned()
            .unwrap_or_default()
    }

    pub fn pull_requests(&self) -> Vec<PullRequest> {
        self.state.lock().unwrap().prs.values().cloned().collect()
    }
}

impl Default for MockGitHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitHost for MockGitHost {
    async fn create_pull_request(&self, new: &NewPullRequest) -> Result<PullRequest> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        if state
            .prs
            .values()
            .any(|pr| pr.state == PrState::Open && pr.head_branch == new.head)
        {
            return Err(GitHostError::AlreadyExists {
                head: new.head.clone(),
            });
        }
        let number = state.next_number;
        state.next_number += 1;
        let pr = PullRequest {
            number,
            title: new.title.clone(),
            html_url: format!("https://github.example/mock/pull/{number}"),
            head_branch: new.head.clone(),
            head_sha: Some(format!("{number:040x}")),
            base_branch: new.base.clone(),
            state: PrState::Open,
            mergeable: Some(true),
        };
        state.prs.insert(number, pr.clone());
        Ok(pr)
    }

    async fn list_open_pull_requests(&self, branch: &str) -> Result<Vec<PullRequest>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .prs
            .values()
            .filter(|pr| pr.state == PrState::Open && pr.head_branch == branch)
            .cloned()
            .collect())
    }

    async fn get_pull_request(&self, number: u64) -> Result<PullRequest> {
        self.state
            .lock()
            .unwrap()
            .prs
            .get(&number)
            .cloned()
            .ok_or_else(|| GitHostError::Status {
                status: 404,
                message: format!("pull request #{number} not found"),
            })
    }

    async fn merge_pull_request(
        &self,
        number: u64,
        _method: MergeMethod,
        _commit_title: &str,
    ) -> Result<MergeOutcome> {
        let mut state = self.state.lock().unwrap();
        let outcome = state
            .merge_script
            .pop_front()
            .unwrap_or_else(|| MergeOutcome::merged(format!("{number:040x}")));
        if outcome.merged {
            if let Some(pr) = state.prs.get_mut(&number) {
                pr.state = PrState::Merged;
            }
        }
        Ok(outcome)
    }

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.labels.entry(number).or_default();
        for label in labels {
            if !entry.contains(label) {
                entry.push(label.clone());
            }
        }
        Ok(())
    }

    async fn request_reviewers(
        &self,
        number: u64,
        reviewers: &[String],
        team_reviewers: &[String],
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .reviewers
            .insert(number, (reviewers.to_vec(), team_reviewers.to_vec()));
        Ok(())
    }

    async fn list_check_runs(&self, _git_ref: &str) -> Result<Vec<CheckRun>> {
        let mut state = self.state.lock().unwrap();
        state.list_check_calls += 1;
        if let Some(next) = state.check_script.pop_front() {
            state.last_checks = next;
        }
        Ok(state.last_checks.clone())
    }

    async fn rerequest_check_run(&self, check_run_id: u64) -> Result<()> {
        self.state.lock().unwrap().rerequested.push(check_run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CiStatus;

    fn new_pr(head: &str) -> NewPullRequest {
        NewPullRequest {
            title: "Story 1-1: Schema".into(),
            body: String::new(),
            head: head.into(),
            base: "main".into(),
            draft: false,
        }
    }

    #[tokio::test]
    async fn duplicate_head_is_rejected_like_github() {
        let host = MockGitHost::new();
        let first = host.create_pull_request(&new_pr("story/1-1")).await.unwrap();
        let err = host.create_pull_request(&new_pr("story/1-1")).await.unwrap_err();
        assert!(matches!(err, GitHostError::AlreadyExists { .. }));
        let open = host.list_open_pull_requests("story/1-1").await.unwrap();
        assert_eq!(open, vec![first]);
    }

    #[tokio::test]
    async fn scripted_checks_then_repeat_last() {
        let host = MockGitHost::new();
        host.push_checks(vec![CheckRun::failed(1, "ci")]);
        host.push_checks(vec![CheckRun::passed(1, "ci")]);

        let first = host.list_check_runs("sha").await.unwrap();
        assert!(matches!(CiStatus::from_checks(&first), CiStatus::Failed(_)));
        for _ in 0..2 {
            let checks = host.list_check_runs("sha").await.unwrap();
            assert_eq!(CiStatus::from_checks(&checks), CiStatus::Passed);
        }
        assert_eq!(host.list_check_runs_calls(), 3);
    }
}
