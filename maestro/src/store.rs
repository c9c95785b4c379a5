use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Result;
use crate::job::{JobId, JobRecord, JobStatus, WorkType};

/// Declarative description of a single atomic status transition.
///
/// A mutation is data, not a closure, so both the in-memory store and
/// the SQL store can apply it inside their own atomic write. Merge
/// fields overwrite colliding keys and preserve the rest; `None`
/// fields leave the record untouched.
#[derive(Clone, Debug)]
pub struct JobMutation {
    pub status: JobStatus,
    pub current_step: Option<String>,
    pub checkpoint_merge: Option<Map<String, Value>>,
    pub metadata_merge: Option<Map<String, Value>>,
    pub worker_instance_id: Option<String>,
    pub clear_worker: bool,
    pub touch_heartbeat: bool,
    pub set_started_at: bool,
    pub set_completed_at: bool,
    pub error_message: Option<String>,
    pub clear_error: bool,
}

impl JobMutation {
    /// Start a mutation targeting the given status.
    pub fn to(status: JobStatus) -> Self {
        Self {
            status,
            current_step: None,
            checkpoint_merge: None,
            metadata_merge: None,
            worker_instance_id: None,
            clear_worker: false,
            touch_heartbeat: false,
            set_started_at: false,
            set_completed_at: false,
            error_message: None,
            clear_error: false,
        }
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn merge_checkpoint(mut self, delta: Map<String, Value>) -> Self {
        self.checkpoint_merge = Some(delta);
        self
    }

    pub fn merge_metadata(mut self, delta: Map<String, Value>) -> Self {
        self.metadata_merge = Some(delta);
        self
    }

    pub fn claimed_by(mut self, worker_instance_id: impl Into<String>) -> Self {
        self.worker_instance_id = Some(worker_instance_id.into());
        self
    }

    pub fn release_worker(mut self) -> Self {
        self.clear_worker = true;
        self
    }

    pub fn touch_heartbeat(mut self) -> Self {
        self.touch_heartbeat = true;
        self
    }

    pub fn mark_started(mut self) -> Self {
        self.set_started_at = true;
        self
    }

    pub fn mark_completed(mut self) -> Self {
        self.set_completed_at = true;
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.clear_error = true;
        self
    }

    /// Apply this mutation to an owned record. Stores that hold records
    /// in memory call this inside their atomic section; the SQL store
    /// mirrors the same semantics in one UPDATE statement.
    pub fn apply<W: WorkType>(&self, job: &mut JobRecord<W>, now: DateTime<Utc>) {
        job.status = self.status;

        if let Some(step) = &self.current_step {
            job.current_step = Some(step.clone());
        }
        if let Some(delta) = &self.checkpoint_merge {
            for (key, value) in delta {
                job.checkpoint_data.insert(key.clone(), value.clone());
            }
        }
        if let Some(delta) = &self.metadata_merge {
            for (key, value) in delta {
                job.metadata.insert(key.clone(), value.clone());
            }
        }
        if self.clear_worker {
            job.worker_instance_id = None;
        } else if let Some(worker) = &self.worker_instance_id {
            job.worker_instance_id = Some(worker.clone());
        }
        if self.set_started_at && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if self.touch_heartbeat {
            // Monotonically non-decreasing while Running.
            job.last_heartbeat = Some(match job.last_heartbeat {
                Some(previous) if previous > now => previous,
                _ => now,
            });
        }
        if self.set_completed_at {
            job.completed_at = Some(now);
        }
        if self.clear_error {
            job.error_message = None;
        } else if let Some(message) = &self.error_message {
            job.error_message = Some(message.clone());
        }
    }
}

/// Durable keyed storage for job records.
///
/// `compare_and_transition` is the only way any status field is ever
/// written. It must be a single atomic read-modify-write against the
/// backing store: verify the stored status is in `expected`, apply the
/// mutation, or return `Ok(false)` with no side effects. That guarantee
/// is what makes claiming and every terminal transition race-free
/// across orchestrator instances without any in-process lock.
#[async_trait]
pub trait JobStore<W: WorkType>: Send + Sync {
    /// Insert a new Pending job. Fails with `DuplicateKey` if an
    /// active job for the same idempotency key already exists; this is
    /// the backstop for the race between a missed lookup and insert.
    async fn insert(&self, job: JobRecord<W>) -> Result<JobRecord<W>>;

    async fn find_by_id(&self, id: JobId) -> Result<Option<JobRecord<W>>>;

    /// The single non-terminal job for a key, if any.
    async fn find_active_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<JobRecord<W>>>;

    /// Atomically transition a job whose current status is in
    /// `expected`. Returns `Ok(false)` if the status no longer matches
    /// (lost the race), `Err(NotFound)` if the id is unknown.
    async fn compare_and_transition(
        &self,
        id: JobId,
        expected: &[JobStatus],
        mutation: JobMutation,
    ) -> Result<bool>;

    async fn list_by_entity(
        &self,
        target_entity_id: Uuid,
    ) -> Result<Vec<JobRecord<W>>>;

    /// Running jobs whose last heartbeat is older than `ttl`. Consumed
    /// only by the staleness sweeper.
    async fn list_running_with_stale_heartbeat(
        &self,
        ttl: Duration,
    ) -> Result<Vec<JobRecord<W>>>;
}
