//! Thin seam over the `git` binary plus worktree discovery.
//!
//! Mutating operations (worktree add/remove, commit, push) always shell out
//! through [`GitRunner`] so tests can swap in a recording mock. Listing
//! existing worktrees prefers libgit2 when the `libgit2` feature is enabled.

use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI operations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    /// Run a git command in `dir` and capture its exit status and output.
    fn run_git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, String>;
}

#[derive(Debug, Clone, Default)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Real git runner that shells out to the `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// A checkout found on disk, as reported by git.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredWorktree {
    pub path: PathBuf,
    pub branch: Option<String>,
}

/// Parse `git worktree list --porcelain` output, keeping only checkouts
/// under `worktrees_dir`.
pub fn parse_worktree_porcelain(stdout: &str, worktrees_dir: &Path) -> Vec<DiscoveredWorktree> {
    let prefix = worktrees_dir.display().to_string();
    let mut results = Vec::new();
    let mut current_path: Option<String> = None;
    let mut current_branch: Option<String> = None;

    // Porcelain blocks are blank-line separated; the last one may not be.
    for line in stdout.lines().chain(std::iter::once("")) {
        if let Some(path) = line.strip_prefix("worktree ") {
            current_path = Some(path.to_string());
            current_branch = None;
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current_branch = Some(branch.to_string());
        } else if line.is_empty() {
            if let Some(path) = current_path.take() {
                if path.starts_with(&prefix) || path.contains("/.worktrees/") {
                    results.push(DiscoveredWorktree {
                        path: PathBuf::from(path),
                        branch: current_branch.take(),
                    });
                }
            }
            current_branch = None;
        }
    }

    results
}

/// List worktrees through libgit2. Returns `None` when the repository can't
/// be opened so callers fall back to the porcelain listing.
#[cfg(feature = "libgit2")]
pub fn list_worktrees_git2(repo_root: &Path, worktrees_dir: &Path) -> Option<Vec<DiscoveredWorktree>> {
    let repo = git2::Repository::discover(repo_root).ok()?;
    let names = repo.worktrees().ok()?;
    let prefix = worktrees_dir.display().to_string();

    let mut results = Vec::new();
    for name in names.iter().flatten() {
        let Ok(wt) = repo.find_worktree(name) else {
            continue;
        };
        let path = wt.path().to_path_buf();
        if !path.display().to_string().starts_with(&prefix) {
            continue;
        }
        let branch = git2::Repository::open(&path).ok().and_then(|r| {
            r.head()
                .ok()
                .filter(|h| h.is_branch())
                .and_then(|h| h.shorthand().map(str::to_string))
        });
        results.push(DiscoveredWorktree { path, branch });
    }

    results.sort_by(|a, b| a.path.cmp(&b.path));
    Some(results)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn porcelain_keeps_only_managed_checkouts() {
        let stdout = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\n\
                      worktree /repo/.worktrees/story-1-1\nHEAD def\nbranch refs/heads/story/1-1\n\n\
                      worktree /repo/.worktrees/story-1-2\nHEAD 123\ndetached\n";
        let found = parse_worktree_porcelain(stdout, Path::new("/repo/.worktrees"));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].path, PathBuf::from("/repo/.worktrees/story-1-1"));
        assert_eq!(found[0].branch.as_deref(), Some("story/1-1"));
        assert_eq!(found[1].branch, None);
    }

    #[test]
    fn porcelain_empty_output_yields_nothing() {
        assert!(parse_worktree_porcelain("", Path::new("/repo/.worktrees")).is_empty());
    }
}
