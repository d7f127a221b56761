//! End-to-end scheduling properties across the graph, sprint-status store and
//! worktree manager, driven the way a scheduler drives them.

use std::path::Path;
use std::sync::{Arc, Mutex};

use cv_core::git::{GitOutput, GitRunner};
use cv_core::graph::DependencyGraph;
use cv_core::sprint_status::SprintStatusStore;
use cv_core::types::{Story, StoryStatus};
use cv_core::worktree::{WorktreeError, WorktreeManager};

#[derive(Default)]
struct RecordingGit {
    commands: Mutex<Vec<Vec<String>>>,
    porcelain: Mutex<String>,
}

impl GitRunner for RecordingGit {
    fn run_git(&self, _dir: &Path, args: &[&str]) -> Result<GitOutput, String> {
        self.commands
            .lock()
            .unwrap()
            .push(args.iter().map(|s| s.to_string()).collect());
        if args.starts_with(&["worktree", "add"]) {
            std::fs::create_dir_all(args[4]).map_err(|e| e.to_string())?;
        }
        if args.starts_with(&["worktree", "list"]) {
            return Ok(GitOutput::ok(self.porcelain.lock().unwrap().clone()));
        }
        Ok(GitOutput::ok(""))
    }
}

fn backlog() -> Vec<Story> {
    vec![
        Story::new("1-1", 1, 1, "Schema").with_complexity(3),
        Story::new("1-2", 1, 2, "API").with_hard_dependency("1-1"),
        Story::new("1-3", 1, 3, "UI")
            .with_hard_dependency("1-2")
            .with_soft_dependency("2-1"),
        Story::new("2-1", 2, 1, "Docs"),
        Story::new("2-2", 2, 2, "Search")
            .with_hard_dependency("1-1")
            .with_hard_dependency("2-1"),
    ]
}

#[tokio::test]
async fn no_worktree_is_created_before_hard_dependencies_land() {
    let tmp = tempfile::tempdir().unwrap();
    let git = Arc::new(RecordingGit::default());
    let worktrees = WorktreeManager::with_git_runner(tmp.path(), git.clone());
    let sprint = SprintStatusStore::open(tmp.path().join(".conveyor")).await.unwrap();
    let mut graph = DependencyGraph::build(backlog()).unwrap();
    sprint.seed(&backlog()).await.unwrap();

    let mut queue = graph.ready_stories();
    assert_eq!(queue, vec!["1-1", "2-1"]);

    let mut finished = Vec::new();
    while let Some(id) = queue.first().cloned() {
        queue.remove(0);

        let story = graph.story(&id).unwrap().clone();
        for dep in &story.hard_dependencies {
            assert!(
                graph.status(dep).unwrap().is_complete(),
                "{id} started before {dep} landed"
            );
        }
        worktrees.create_worktree(&id, "main").await.unwrap();
        graph.set_status(&id, StoryStatus::InProgress).unwrap();

        // Merge, tear down, cascade.
        worktrees.destroy_worktree(&id).await.unwrap();
        let result = graph.trigger_dependent_stories(&id).unwrap();
        sprint
            .update(|doc| {
                doc.set(id.clone(), StoryStatus::Done);
                for ready in &result.ready_stories {
                    doc.set(ready.clone(), StoryStatus::Ready);
                }
            })
            .await
            .unwrap();
        queue.extend(result.ready_stories);
        finished.push(id);
    }

    assert_eq!(finished.len(), 5);
    let snapshot = sprint.snapshot().await;
    assert!(snapshot.stories.values().all(|s| *s == StoryStatus::Done));
    let adds = git
        .commands
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.starts_with(&["worktree".to_string(), "add".to_string()]))
        .count();
    assert_eq!(adds, 5);
}

#[tokio::test]
async fn cyclic_stories_never_reach_ready() {
    let mut graph = DependencyGraph::build(vec![
        Story::new("a", 1, 1, "A"),
        Story::new("b", 1, 2, "B")
            .with_hard_dependency("a")
            .with_hard_dependency("c"),
        Story::new("c", 1, 3, "C").with_hard_dependency("b"),
    ])
    .unwrap();

    assert_eq!(graph.ready_stories(), vec!["a"]);
    let result = graph.trigger_dependent_stories("a").unwrap();
    assert!(result.ready_stories.is_empty());
    assert_eq!(result.circular_dependencies, vec!["b"]);
    assert!(graph.ready_stories().is_empty());
}

#[tokio::test]
async fn reconcile_restores_exclusivity_after_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let git = Arc::new(RecordingGit::default());
    let leftover = tmp.path().join(".worktrees").join("story-1-1");
    std::fs::create_dir_all(&leftover).unwrap();
    *git.porcelain.lock().unwrap() = format!(
        "worktree {}\nHEAD abc\nbranch refs/heads/main\n\nworktree {}\nHEAD def\nbranch refs/heads/story/1-1\n",
        tmp.path().display(),
        leftover.display()
    );

    let worktrees = WorktreeManager::with_git_runner(tmp.path(), git);
    let restored = worktrees.reconcile("main").await.unwrap();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].story_id, "1-1");

    let err = worktrees.create_worktree("1-1", "main").await.unwrap_err();
    assert!(matches!(err, WorktreeError::AlreadyExists { .. }));
}
