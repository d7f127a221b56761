//! Durable queue of decisions the pipeline could not make on its own.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::persist::{read_json_opt, write_json_atomic};
use crate::types::StoryId;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EscalationError {
    #[error("escalation not found: {0}")]
    NotFound(Uuid),
    #[error("escalation {id} is {status}, expected {expected}")]
    InvalidStatus {
        id: Uuid,
        status: EscalationStatus,
        expected: EscalationStatus,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EscalationError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationType {
    /// The reviewer asked for a human decision.
    ReviewDecision,
    CiTimeout,
    CiFailure,
    MergeConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Pending,
    Responded,
    Resolved,
}

impl fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationStatus::Pending => write!(f, "pending"),
            EscalationStatus::Responded => write!(f, "responded"),
            EscalationStatus::Resolved => write!(f, "resolved"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: Uuid,
    pub project_id: String,
    pub run_id: String,
    pub story_id: Option<StoryId>,
    #[serde(rename = "type")]
    pub escalation_type: EscalationType,
    pub severity: EscalationSeverity,
    pub description: String,
    pub status: EscalationStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub response: Option<String>,
}

/// Input for [`EscalationQueue::escalate`].
#[derive(Debug, Clone)]
pub struct NewEscalation {
    pub project_id: String,
    pub run_id: String,
    pub story_id: Option<StoryId>,
    pub escalation_type: EscalationType,
    pub severity: EscalationSeverity,
    pub description: String,
}

impl NewEscalation {
    pub fn new(
        project_id: impl Into<String>,
        run_id: impl Into<String>,
        escalation_type: EscalationType,
        severity: EscalationSeverity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            run_id: run_id.into(),
            story_id: None,
            escalation_type,
            severity,
            description: description.into(),
        }
    }

    pub fn for_story(mut self, story_id: impl Into<String>) -> Self {
        self.story_id = Some(story_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// EscalationQueue
// ---------------------------------------------------------------------------

/// One JSON file per escalation under `{state_root}/escalations/`, mirrored
/// in memory. Only escalations created through this queue count toward a
/// run's budget.
pub struct EscalationQueue {
    dir: PathBuf,
    max_escalations: usize,
    records: Mutex<BTreeMap<Uuid, Escalation>>,
}

impl EscalationQueue {
    pub async fn open(state_root: impl AsRef<Path>, max_escalations: usize) -> Result<Self> {
        let dir = state_root.as_ref().join("escalations");
        let mut records = BTreeMap::new();

        match tokio::fs::read_dir(&dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    match read_json_opt::<Escalation, EscalationError>(&path).await {
                        Ok(Some(record)) => {
                            records.insert(record.id, record);
                        }
                        Ok(None) => {}
                        Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable escalation"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            dir,
            max_escalations,
            records: Mutex::new(records),
        })
    }

    pub fn max_escalations(&self) -> usize {
        self.max_escalations
    }

    /// Persist a new pending escalation.
    pub async fn escalate(&self, request: NewEscalation) -> Result<Escalation> {
        let record = Escalation {
            id: Uuid::new_v4(),
            project_id: request.project_id,
            run_id: request.run_id,
            story_id: request.story_id,
            escalation_type: request.escalation_type,
            severity: request.severity,
            description: request.description,
            status: EscalationStatus::Pending,
            created_at: Utc::now(),
            responded_at: None,
            response: None,
        };

        let mut records = self.records.lock().await;
        self.persist(&record).await?;
        records.insert(record.id, record.clone());
        let pending = count_pending_in(&records, &record.run_id);

        warn!(
            escalation_id = %record.id,
            story_id = ?record.story_id,
            kind = ?record.escalation_type,
            severity = ?record.severity,
            pending,
            max = self.max_escalations,
            "escalation created: {}",
            record.description
        );
        Ok(record)
    }

    pub async fn count_pending(&self, run_id: &str) -> usize {
        count_pending_in(&*self.records.lock().await, run_id)
    }

    /// `true` once pending escalations in `run_id` reach the budget.
    pub async fn budget_exhausted(&self, run_id: &str) -> bool {
        self.count_pending(run_id).await >= self.max_escalations
    }

    pub async fn get(&self, id: Uuid) -> Option<Escalation> {
        self.records.lock().await.get(&id).cloned()
    }

    /// Pending escalations, oldest first, optionally for one project.
    pub async fn list_pending(&self, project_id: Option<&str>) -> Vec<Escalation> {
        let records = self.records.lock().await;
        let mut pending: Vec<Escalation> = records
            .values()
            .filter(|e| e.status == EscalationStatus::Pending)
            .filter(|e| project_id.map_or(true, |p| e.project_id == p))
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created_at);
        pending
    }

    /// Pending or responded escalations raised for `story_id`, oldest first.
    pub async fn open_for_story(&self, story_id: &str) -> Vec<Escalation> {
        let records = self.records.lock().await;
        let mut open: Vec<Escalation> = records
            .values()
            .filter(|e| e.status != EscalationStatus::Resolved)
            .filter(|e| e.story_id.as_deref() == Some(story_id))
            .cloned()
            .collect();
        open.sort_by_key(|e| e.created_at);
        open
    }

    /// Record a human (or operator override) response.
    pub async fn respond(&self, id: Uuid, decision: impl Into<String>) -> Result<Escalation> {
        self.advance(id, EscalationStatus::Pending, EscalationStatus::Responded, Some(decision.into()))
            .await
    }

    /// Close a responded escalation once its follow-up has been acted on.
    pub async fn resolve(&self, id: Uuid) -> Result<Escalation> {
        self.advance(id, EscalationStatus::Responded, EscalationStatus::Resolved, None)
            .await
    }

    async fn advance(
        &self,
        id: Uuid,
        expected: EscalationStatus,
        next: EscalationStatus,
        response: Option<String>,
    ) -> Result<Escalation> {
        let mut records = self.records.lock().await;
        let current = records.get(&id).ok_or(EscalationError::NotFound(id))?;
        if current.status != expected {
            return Err(EscalationError::InvalidStatus {
                id,
                status: current.status,
                expected,
            });
        }

        let mut updated = current.clone();
        updated.status = next;
        if let Some(response) = response {
            updated.responded_at = Some(Utc::now());
            updated.response = Some(response);
        }
        self.persist(&updated).await?;
        records.insert(id, updated.clone());
        info!(escalation_id = %id, status = %next, "escalation updated");
        Ok(updated)
    }

    async fn persist(&self, record: &Escalation) -> Result<()> {
        let path = self.dir.join(format!("{}.json", record.id));
        write_json_atomic::<_, EscalationError>(&path, record).await
    }
}

fn count_pending_in(records: &BTreeMap<Uuid, Escalation>, run_id: &str) -> usize {
    records
        .values()
        .filter(|e| e.run_id == run_id && e.status == EscalationStatus::Pending)
        .count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
