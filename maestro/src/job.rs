use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Display;
use std::hash::Hash;
use uuid::Uuid;

/// Marker trait for work-type enums (e.g. Analysis, Generation, Training).
///
/// Implementors identify which kind of long-running work a job represents.
/// `as_str` and `parse` must round-trip; the string form is what the
/// persistent store and the idempotency key carry.
pub trait WorkType:
    Copy
    + Eq
    + Hash
    + Display
    + std::fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    fn as_str(&self) -> &'static str;
    fn parse(s: &str) -> Option<Self>;
}

/// Unique identifier for a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle states.
///
/// The non-terminal set (`is_active`) is what blocks a second job from
/// being created under the same idempotency key. `Stale` and `Failed`
/// are deliberately outside it: both leave the key free for a retry
/// attempt. A `Failed` job is only permanently terminal when its retry
/// budget is exhausted, which is a property of the record, not the
/// status value.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Stale,
    Cancelled,
    Suspended,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Stale => "stale",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "retrying" => Some(JobStatus::Retrying),
            "stale" => Some(JobStatus::Stale),
            "cancelled" => Some(JobStatus::Cancelled),
            "suspended" => Some(JobStatus::Suspended),
            _ => None,
        }
    }

    /// Whether this status holds the idempotency key.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending
                | JobStatus::Running
                | JobStatus::Retrying
                | JobStatus::Suspended
        )
    }

    /// Whether this status accepts no further transitions at all.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Derives the idempotency key for a (work type, target entity) pair.
///
/// Two creation calls producing the same key collapse onto one active
/// job; the store enforces this with a uniqueness constraint over
/// active statuses.
pub fn idempotency_key<W: WorkType>(work_type: W, target_entity_id: Uuid) -> String {
    format!("{}:{}", work_type.as_str(), target_entity_id)
}

/// The unit of trackable asynchronous work.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct JobRecord<W: WorkType> {
    pub id: JobId,
    pub work_type: W,
    pub target_entity_id: Uuid,
    pub idempotency_key: String,
    pub status: JobStatus,
    /// Free-form sub-phase label for progress reporting. Not consulted
    /// by the state machine.
    pub current_step: Option<String>,
    /// Worker-owned resumable progress notes, merged key-wise on each
    /// heartbeat. Opaque to the orchestrator.
    pub checkpoint_data: Map<String, Value>,
    /// Observability context set at creation and augmentable on
    /// completion/failure. Opaque to the orchestrator.
    pub metadata: Map<String, Value>,
    /// Identity of the worker currently owning the job; `None` when
    /// not claimed.
    pub worker_instance_id: Option<String>,
    pub retry_count: u16,
    pub max_retries: u16,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Sole liveness signal consulted by the staleness sweeper.
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl<W: WorkType> JobRecord<W> {
    /// Create a fresh Pending job for the given target.
    pub fn new(
        work_type: W,
        target_entity_id: Uuid,
        metadata: Map<String, Value>,
        max_retries: u16,
    ) -> Self {
        Self {
            id: JobId::new(),
            work_type,
            target_entity_id,
            idempotency_key: idempotency_key(work_type, target_entity_id),
            status: JobStatus::Pending,
            current_step: None,
            checkpoint_data: Map::new(),
            metadata,
            worker_instance_id: None,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            started_at: None,
            last_heartbeat: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Whether the retry budget has been spent.
    pub fn budget_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// A job is permanently failed once it is Failed with no retry
    /// budget left; no further transitions are offered.
    pub fn is_permanently_failed(&self) -> bool {
        self.status == JobStatus::Failed && self.budget_exhausted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(
        Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
    )]
    enum Kind {
        Analysis,
    }

    impl WorkType for Kind {
        fn as_str(&self) -> &'static str {
            "analysis"
        }

        fn parse(s: &str) -> Option<Self> {
            (s == "analysis").then_some(Kind::Analysis)
        }
    }

    impl Display for Kind {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.as_str())
        }
    }

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let entity = Uuid::new_v4();
        let a = idempotency_key(Kind::Analysis, entity);
        let b = idempotency_key(Kind::Analysis, entity);
        assert_eq!(a, b);
        assert_eq!(a, format!("analysis:{entity}"));
    }

    #[test]
    fn test_active_statuses_hold_the_key() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Retrying,
            JobStatus::Suspended,
        ] {
            assert!(status.is_active(), "{status} should be active");
        }
        for status in [
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Stale,
            JobStatus::Cancelled,
        ] {
            assert!(!status.is_active(), "{status} should not be active");
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Retrying,
            JobStatus::Stale,
            JobStatus::Cancelled,
            JobStatus::Suspended,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("leased"), None);
    }

    #[test]
    fn test_permanent_failure_requires_spent_budget() {
        let mut job =
            JobRecord::new(Kind::Analysis, Uuid::new_v4(), Map::new(), 2);
        job.status = JobStatus::Failed;
        assert!(!job.is_permanently_failed());

        job.retry_count = 2;
        assert!(job.is_permanently_failed());
    }
}
