pub mod config;
pub mod escalation;
pub mod events;
pub mod git;
pub mod graph;
pub mod persist;
pub mod sprint_status;
pub mod state;
pub mod types;
pub mod worktree;
