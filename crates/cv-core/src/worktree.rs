use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::git::{parse_worktree_porcelain, DiscoveredWorktree, GitOutput, GitRunner, RealGitRunner};
use crate::types::{story_branch, StoryId, Worktree, WorktreeStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorktreeError {
    /// An active worktree is already registered for this story, or a stale
    /// checkout occupies its directory.
    #[error("worktree already exists for story {story_id}")]
    AlreadyExists { story_id: StoryId },
    #[error("no active worktree for story {0}")]
    NotFound(StoryId),
    #[error("git command failed: {0}")]
    GitCommand(String),
    /// The remote refused the push (non-fast-forward, auth, ...).
    #[error("push of {branch} rejected: {reason}")]
    PushRejected { branch: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

// ---------------------------------------------------------------------------
// WorktreeManager
// ---------------------------------------------------------------------------

const REMOTE: &str = "origin";

/// Owns the per-story git checkouts under `{repo_root}/.worktrees/`.
///
/// The registry doubles as a per-key lock: creation reserves the story id
/// before touching git, so a second concurrent `create_worktree` for the same
/// story fails fast while unrelated stories proceed untouched.
pub struct WorktreeManager {
    repo_root: PathBuf,
    git: Arc<dyn GitRunner>,
    active: DashMap<StoryId, Worktree>,
}

impl WorktreeManager {
    /// Create a new WorktreeManager with the real git runner.
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self::with_git_runner(repo_root, Arc::new(RealGitRunner))
    }

    /// Create a new WorktreeManager with a custom git runner (for testing).
    pub fn with_git_runner(repo_root: impl Into<PathBuf>, git: Arc<dyn GitRunner>) -> Self {
        Self {
            repo_root: repo_root.into(),
            git,
            active: DashMap::new(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.repo_root.join(".worktrees")
    }

    /// Filesystem location of a story's checkout.
    pub fn worktree_path(&self, story_id: &str) -> PathBuf {
        self.worktrees_dir()
            .join(format!("story-{}", sanitize_name(story_id)))
    }

    /// Create an isolated checkout on a fresh `story/{id}` branch cut from
    /// `base_branch`.
    pub async fn create_worktree(&self, story_id: &str, base_branch: &str) -> Result<Worktree> {
        let worktree = Worktree {
            story_id: story_id.to_string(),
            path: self.worktree_path(story_id),
            branch: story_branch(story_id),
            base_branch: base_branch.to_string(),
            created_at: Utc::now(),
            status: WorktreeStatus::Active,
        };

        match self.active.entry(story_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(WorktreeError::AlreadyExists {
                    story_id: story_id.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(worktree.clone());
            }
        }

        match self.add_checkout(&worktree).await {
            Ok(()) => {
                info!(
                    story_id,
                    worktree = %worktree.path.display(),
                    branch = %worktree.branch,
                    "created worktree"
                );
                Ok(worktree)
            }
            Err(e) => {
                self.active.remove(story_id);
                Err(e)
            }
        }
    }

    async fn add_checkout(&self, worktree: &Worktree) -> Result<()> {
        if tokio::fs::try_exists(&worktree.path).await? {
            return Err(WorktreeError::AlreadyExists {
                story_id: worktree.story_id.clone(),
            });
        }
        tokio::fs::create_dir_all(self.worktrees_dir()).await?;

        let path = worktree.path.display().to_string();
        let output = self
            .run(
                &self.repo_root,
                &[
                    "worktree",
                    "add",
                    "-b",
                    &worktree.branch,
                    &path,
                    &worktree.base_branch,
                ],
            )
            .await?;
        if !output.success {
            return Err(WorktreeError::GitCommand(output.stderr));
        }
        Ok(())
    }

    /// Stage everything in the story's checkout and commit it.
    ///
    /// Returns `false` when there was nothing to commit.
    pub async fn commit_all(&self, story_id: &str, message: &str) -> Result<bool> {
        let worktree = self.require(story_id)?;

        let add = self.run(&worktree.path, &["add", "-A"]).await?;
        if !add.success {
            return Err(WorktreeError::GitCommand(add.stderr));
        }
        let status = self.run(&worktree.path, &["status", "--porcelain"]).await?;
        if status.success && status.stdout.trim().is_empty() {
            debug!(story_id, "nothing to commit");
            return Ok(false);
        }
        let commit = self.run(&worktree.path, &["commit", "-m", message]).await?;
        if !commit.success {
            return Err(WorktreeError::GitCommand(commit.stderr));
        }
        Ok(true)
    }

    /// Push `story/{id}` to the remote and mark the worktree pushed.
    pub async fn push_branch(&self, story_id: &str) -> Result<()> {
        let worktree = self.require(story_id)?;
        let output = self
            .run(&worktree.path, &["push", "-u", REMOTE, &worktree.branch])
            .await?;
        if !output.success {
            warn!(story_id, branch = %worktree.branch, stderr = %output.stderr, "push rejected");
            return Err(WorktreeError::PushRejected {
                branch: worktree.branch,
                reason: output.stderr.trim().to_string(),
            });
        }
        self.mark_pushed(story_id)?;
        info!(story_id, branch = %worktree.branch, "pushed story branch");
        Ok(())
    }

    pub fn mark_pushed(&self, story_id: &str) -> Result<()> {
        let mut entry = self
            .active
            .get_mut(story_id)
            .ok_or_else(|| WorktreeError::NotFound(story_id.to_string()))?;
        entry.status = WorktreeStatus::Pushed;
        Ok(())
    }

    /// Remove the checkout, prune git's worktree metadata and release the
    /// story id. Safe to call when the directory is already (partially) gone
    /// or when no worktree was ever registered.
    pub async fn destroy_worktree(&self, story_id: &str) -> Result<()> {
        let path = self
            .active
            .get(story_id)
            .map(|wt| wt.path.clone())
            .unwrap_or_else(|| self.worktree_path(story_id));

        if tokio::fs::try_exists(&path).await? {
            let path_str = path.display().to_string();
            let output = self
                .run(&self.repo_root, &["worktree", "remove", "--force", &path_str])
                .await?;
            if !output.success {
                warn!(story_id, stderr = %output.stderr, "git worktree remove failed, deleting directory");
                match tokio::fs::remove_dir_all(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        self.prune().await?;

        // The local branch is disposable once the checkout is gone; keeping
        // it would make a later re-creation of the same story fail.
        let branch = story_branch(story_id);
        let deleted = self.run(&self.repo_root, &["branch", "-D", &branch]).await?;
        if !deleted.success {
            debug!(story_id, stderr = %deleted.stderr, "story branch not deleted");
        }

        if let Some((_, mut worktree)) = self.active.remove(story_id) {
            worktree.status = WorktreeStatus::Destroyed;
            info!(story_id, worktree = %worktree.path.display(), "destroyed worktree");
        }
        Ok(())
    }

    /// Run `git worktree prune`.
    pub async fn prune(&self) -> Result<()> {
        let output = self.run(&self.repo_root, &["worktree", "prune"]).await?;
        if !output.success {
            return Err(WorktreeError::GitCommand(output.stderr));
        }
        Ok(())
    }

    /// Re-register checkouts left on disk by a previous process so that
    /// exclusivity survives restarts. Returns the newly registered worktrees.
    pub async fn reconcile(&self, base_branch: &str) -> Result<Vec<Worktree>> {
        let discovered = self.discover().await?;
        let mut registered = Vec::new();

        for found in discovered {
            let Some(dir_name) = found.path.file_name().map(|n| n.to_string_lossy().to_string())
            else {
                continue;
            };
            let Some(story_id) = found
                .branch
                .as_deref()
                .and_then(|b| b.strip_prefix("story/"))
                .map(str::to_string)
                .or_else(|| dir_name.strip_prefix("story-").map(str::to_string))
            else {
                continue;
            };

            if let Entry::Vacant(slot) = self.active.entry(story_id.clone()) {
                let worktree = Worktree {
                    branch: found.branch.clone().unwrap_or_else(|| story_branch(&story_id)),
                    story_id,
                    path: found.path,
                    base_branch: base_branch.to_string(),
                    created_at: Utc::now(),
                    status: WorktreeStatus::Active,
                };
                slot.insert(worktree.clone());
                registered.push(worktree);
            }
        }

        if !registered.is_empty() {
            info!(count = registered.len(), "reconciled existing worktrees");
        }
        Ok(registered)
    }

    async fn discover(&self) -> Result<Vec<DiscoveredWorktree>> {
        #[cfg(feature = "libgit2")]
        {
            let root = self.repo_root.clone();
            let dir = self.worktrees_dir();
            let listed = tokio::task::spawn_blocking(move || {
                crate::git::list_worktrees_git2(&root, &dir)
            })
            .await
            .map_err(|e| WorktreeError::GitCommand(e.to_string()))?;
            if let Some(found) = listed {
                return Ok(found);
            }
        }

        let output = self
            .run(&self.repo_root, &["worktree", "list", "--porcelain"])
            .await?;
        if !output.success {
            return Err(WorktreeError::GitCommand(output.stderr));
        }
        Ok(parse_worktree_porcelain(&output.stdout, &self.worktrees_dir()))
    }

    pub fn get(&self, story_id: &str) -> Option<Worktree> {
        self.active.get(story_id).map(|wt| wt.clone())
    }

    pub fn is_active(&self, story_id: &str) -> bool {
        self.active.contains_key(story_id)
    }

    pub fn active_worktrees(&self) -> Vec<Worktree> {
        let mut all: Vec<Worktree> = self.active.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.story_id.cmp(&b.story_id));
        all
    }

    fn require(&self, story_id: &str) -> Result<Worktree> {
        self.get(story_id)
            .ok_or_else(|| WorktreeError::NotFound(story_id.to_string()))
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> Result<GitOutput> {
        let git = Arc::clone(&self.git);
        let dir = dir.to_path_buf();
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        tokio::task::spawn_blocking(move || {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            git.run_git(&dir, &args)
        })
        .await
        .map_err(|e| WorktreeError::GitCommand(e.to_string()))?
        .map_err(WorktreeError::GitCommand)
    }
}

/// Sanitize a story id for use as a directory name.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records commands; creates the target directory on `worktree add` so
    /// filesystem checks behave like real git.
    #[derive(Default)]
    struct MockGitRunner {
        commands: Mutex<Vec<Vec<String>>>,
        fail_on: Mutex<Option<(String, String)>>,
    }

    impl MockGitRunner {
        fn failing(subcommand: &str, stderr: &str) -> Self {
            let mock = Self::default();
            *mock.fail_on.lock().unwrap() = Some((subcommand.to_string(), stderr.to_string()));
            mock
        }

        fn commands(&self) -> Vec<Vec<String>> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl GitRunner for MockGitRunner {
        fn run_git(&self, _dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String> {
            self.commands
                .lock()
                .unwrap()
                .push(args.iter().map(|s| s.to_string()).collect());

            if let Some((sub, stderr)) = self.fail_on.lock().unwrap().as_ref() {
                if args.first() == Some(&sub.as_str()) {
                    return Ok(GitOutput::failed(stderr.clone()));
                }
            }
            if args.starts_with(&["worktree", "add"]) {
                std::fs::create_dir_all(args[4]).map_err(|e| e.to_string())?;
            }
            if args.starts_with(&["worktree", "remove"]) {
                let _ = std::fs::remove_dir_all(args[3]);
            }
            Ok(GitOutput::ok(""))
        }
    }

    fn manager(tmp: &tempfile::TempDir, git: Arc<MockGitRunner>) -> WorktreeManager {
        WorktreeManager::with_git_runner(tmp.path(), git)
    }

    #[tokio::test]
    async fn create_worktree_uses_story_branch_and_path() {
        let tmp = tempfile::tempdir().unwrap();
        let git = Arc::new(MockGitRunner::default());
        let mgr = manager(&tmp, git.clone());

        let wt = mgr.create_worktree("1-2", "main").await.unwrap();
        assert_eq!(wt.branch, "story/1-2");
        assert_eq!(wt.base_branch, "main");
        assert_eq!(wt.status, WorktreeStatus::Active);
        assert_eq!(wt.path, tmp.path().join(".worktrees/story-1-2"));
        assert_eq!(git.commands()[0][..3], ["worktree", "add", "-b"]);
        assert_eq!(git.commands()[0][5], "main");
    }

    #[tokio::test]
    async fn second_create_for_same_story_fails_fast() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp, Arc::new(MockGitRunner::default()));

        mgr.create_worktree("1-1", "main").await.unwrap();
        let err = mgr.create_worktree("1-1", "main").await.unwrap_err();
        assert!(matches!(err, WorktreeError::AlreadyExists { .. }));

        // Unrelated stories are unaffected.
        mgr.create_worktree("1-2", "main").await.unwrap();
        assert_eq!(mgr.active_worktrees().len(), 2);
    }

    #[tokio::test]
    async fn failed_git_add_releases_the_reservation() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp, Arc::new(MockGitRunner::failing("worktree", "fatal: bad ref")));

        let err = mgr.create_worktree("1-1", "nope").await.unwrap_err();
        assert!(matches!(err, WorktreeError::GitCommand(ref s) if s.contains("bad ref")));
        assert!(!mgr.is_active("1-1"));
    }

    #[tokio::test]
    async fn push_rejection_maps_to_push_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp, Arc::new(MockGitRunner::failing("push", "! [rejected] non-fast-forward")));

        mgr.create_worktree("2-1", "main").await.unwrap();
        let err = mgr.push_branch("2-1").await.unwrap_err();
        assert!(matches!(err, WorktreeError::PushRejected { ref branch, .. } if branch == "story/2-1"));
        assert_eq!(mgr.get("2-1").unwrap().status, WorktreeStatus::Active);
    }

    #[tokio::test]
    async fn push_marks_worktree_pushed() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp, Arc::new(MockGitRunner::default()));

        mgr.create_worktree("2-1", "main").await.unwrap();
        mgr.push_branch("2-1").await.unwrap();
        assert_eq!(mgr.get("2-1").unwrap().status, WorktreeStatus::Pushed);
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_releases_key() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp, Arc::new(MockGitRunner::default()));

        let wt = mgr.create_worktree("3-1", "main").await.unwrap();
        // Simulate a partially removed checkout.
        std::fs::remove_dir_all(&wt.path).unwrap();

        mgr.destroy_worktree("3-1").await.unwrap();
        mgr.destroy_worktree("3-1").await.unwrap();
        assert!(!mgr.is_active("3-1"));

        // The id can be reused after teardown.
        mgr.create_worktree("3-1", "main").await.unwrap();
    }

    #[tokio::test]
    async fn destroy_prunes_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let git = Arc::new(MockGitRunner::default());
        let mgr = manager(&tmp, git.clone());

        mgr.create_worktree("3-2", "main").await.unwrap();
        mgr.destroy_worktree("3-2").await.unwrap();

        let cmds = git.commands();
        assert!(cmds.iter().any(|c| c[..2] == ["worktree", "remove"]));
        assert!(cmds.iter().any(|c| c[..] == ["worktree", "prune"]));
    }

    #[test]
    fn sanitize_name_replaces_special_chars() {
        assert_eq!(sanitize_name("Epic 2/Story 3"), "epic-2-story-3");
        assert_eq!(sanitize_name("1-1_login"), "1-1_login");
    }
}
