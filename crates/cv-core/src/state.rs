use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::persist::{read_json_opt, write_json_atomic};
use crate::types::{AgentActivity, WorkflowState, WorkflowStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StateError {
    #[error("no workflow state for project {0}")]
    NotFound(String),
    #[error("project {0} is paused; resume it before starting a run")]
    Paused(String),
    #[error("invalid workflow transition: {from} -> {to}")]
    InvalidTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StateError>;

// ---------------------------------------------------------------------------
// StateManager
// ---------------------------------------------------------------------------

/// Durable workflow state, one JSON document per project.
///
/// Every mutation refreshes `last_update`, and status changes are checked
/// against [`WorkflowStatus::can_transition_to`] no matter which method
/// performs them, including a raw [`StateManager::save_state`].
pub struct StateManager {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl StateManager {
    /// `state_root` is `{repo_root}/{state_dir}`; documents live in its
    /// `state/` subdirectory.
    pub fn new(state_root: impl AsRef<Path>) -> Self {
        Self {
            dir: state_root.as_ref().join("state"),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, project_id: &str) -> PathBuf {
        self.dir.join(format!("{project_id}.json"))
    }

    pub async fn load_state(&self, project_id: &str) -> Result<Option<WorkflowState>> {
        read_json_opt::<WorkflowState, StateError>(&self.path_for(project_id)).await
    }

    /// Persist `state`, refreshing `last_update`. Rejects a status change
    /// that the stored document cannot legally make.
    pub async fn save_state(&self, state: &mut WorkflowState) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.save_locked(state).await
    }

    async fn save_locked(&self, state: &mut WorkflowState) -> Result<()> {
        if let Some(stored) = self.load_state(&state.project_id).await? {
            if stored.status != state.status && !stored.status.can_transition_to(&state.status) {
                return Err(StateError::InvalidTransition {
                    from: stored.status,
                    to: state.status,
                });
            }
        }
        self.write_locked(state).await
    }

    async fn write_locked(&self, state: &mut WorkflowState) -> Result<()> {
        state.last_update = Utc::now();
        write_json_atomic::<_, StateError>(&self.path_for(&state.project_id), state).await
    }

    /// Begin a scheduling run.
    ///
    /// A project without state gets a fresh document. An existing one keeps
    /// its activity log, variables and start time; only the workflow name,
    /// current step and status change. Completed and errored workflows are
    /// reopened as `running`, a paused one is refused.
    pub async fn start_run(
        &self,
        project_id: &str,
        project_name: &str,
        workflow: &str,
    ) -> Result<WorkflowState> {
        let _guard = self.write_lock.lock().await;
        let mut state = match self.load_state(project_id).await? {
            Some(stored) if !stored.status.can_start_run() => {
                return Err(StateError::Paused(project_id.to_string()));
            }
            Some(mut stored) => {
                if stored.status != WorkflowStatus::Running {
                    info!(project_id, from = %stored.status, "reopening workflow");
                }
                stored.project_name = project_name.to_string();
                stored.current_workflow = workflow.to_string();
                stored.current_step = None;
                stored.status = WorkflowStatus::Running;
                stored
            }
            None => WorkflowState::new(project_id, project_name, workflow),
        };
        self.write_locked(&mut state).await?;
        info!(
            project_id,
            workflow,
            activities = state.agent_activity.len(),
            "workflow run started"
        );
        Ok(state)
    }

    async fn mutate<F>(&self, project_id: &str, f: F) -> Result<WorkflowState>
    where
        F: FnOnce(&mut WorkflowState) -> Result<()>,
    {
        let _guard = self.write_lock.lock().await;
        let mut state = self
            .load_state(project_id)
            .await?
            .ok_or_else(|| StateError::NotFound(project_id.to_string()))?;
        f(&mut state)?;
        self.save_locked(&mut state).await?;
        Ok(state)
    }

    pub async fn set_current_step(&self, project_id: &str, step: &str) -> Result<WorkflowState> {
        self.mutate(project_id, |state| {
            state.current_step = Some(step.to_string());
            Ok(())
        })
        .await
    }

    pub async fn set_variable(
        &self,
        project_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<WorkflowState> {
        self.mutate(project_id, |state| {
            state.variables.insert(key.to_string(), value);
            Ok(())
        })
        .await
    }

    /// Append to the activity log. Existing entries are never touched.
    pub async fn append_activity(
        &self,
        project_id: &str,
        activity: AgentActivity,
    ) -> Result<WorkflowState> {
        self.mutate(project_id, |state| {
            state.agent_activity.push(activity);
            Ok(())
        })
        .await
    }

    pub async fn transition(&self, project_id: &str, to: WorkflowStatus) -> Result<WorkflowState> {
        let state = self
            .mutate(project_id, |state| {
                if !state.status.can_transition_to(&to) {
                    return Err(StateError::InvalidTransition {
                        from: state.status,
                        to,
                    });
                }
                state.status = to;
                Ok(())
            })
            .await?;
        debug!(project_id, status = %to, "workflow status changed");
        Ok(state)
    }

    pub async fn pause(&self, project_id: &str) -> Result<WorkflowState> {
        self.transition(project_id, WorkflowStatus::Paused).await
    }

    pub async fn resume(&self, project_id: &str) -> Result<WorkflowState> {
        self.transition(project_id, WorkflowStatus::Running).await
    }

    /// Advisory pause check performed before each new top-level step.
    /// A project without state is not paused.
    pub async fn is_paused(&self, project_id: &str) -> Result<bool> {
        Ok(self
            .load_state(project_id)
            .await?
            .map(|s| s.status == WorkflowStatus::Paused)
            .unwrap_or(false))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
