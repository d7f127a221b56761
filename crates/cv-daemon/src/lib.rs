//! Story orchestration for conveyor.
//!
//! - [`context`]: the shared services of one orchestrator and backlog loading
//! - [`story_runner`]: one story from claim to merge
//! - [`pr_automator`]: pull request creation, CI monitoring, merge and cascade
//! - [`scheduler`]: parallel scheduling of ready stories

pub mod context;
pub mod pr_automator;
pub mod scheduler;
pub mod story_runner;

pub use context::{OrchestratorContext, OrchestratorError};
pub use pr_automator::{CiPolicy, MergeResult, PrAutomationError, PrCreationAutomator};
pub use scheduler::{Halt, RunSummary, StoryScheduler};
pub use story_runner::{StoryOutcome, StoryRunner};
