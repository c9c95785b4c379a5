use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use maestro::{
    JobId, JobMutation, JobRecord, JobStatus, JobStore, OrchestratorError,
    Result, WorkType,
};

/// In-memory job store with the same atomicity guarantees as a durable
/// backend: every compare-and-transition happens under one mutex hold,
/// so concurrent claims and terminal transitions race exactly as they
/// would against a conditional database update.
#[derive(Clone)]
pub struct InMemoryJobStore<W: WorkType> {
    jobs: Arc<Mutex<HashMap<JobId, JobRecord<W>>>>,
}

impl<W: WorkType> InMemoryJobStore<W> {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of stored jobs, across all statuses.
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Rewrite a job's last heartbeat so staleness tests don't have to
    /// wait out the TTL in real time.
    pub fn backdate_heartbeat(&self, id: JobId, to: DateTime<Utc>) {
        if let Some(job) = self.jobs.lock().get_mut(&id) {
            job.last_heartbeat = Some(to);
        }
    }

    /// Synchronous snapshot of a job, for assertions.
    pub fn snapshot(&self, id: JobId) -> Option<JobRecord<W>> {
        self.jobs.lock().get(&id).cloned()
    }
}

impl<W: WorkType> Default for InMemoryJobStore<W> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<W: WorkType> JobStore<W> for InMemoryJobStore<W> {
    async fn insert(&self, job: JobRecord<W>) -> Result<JobRecord<W>> {
        let mut jobs = self.jobs.lock();

        let conflict = jobs.values().any(|existing| {
            existing.idempotency_key == job.idempotency_key
                && existing.status.is_active()
        });
        if conflict {
            return Err(OrchestratorError::DuplicateKey(
                job.idempotency_key.clone(),
            ));
        }

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<JobRecord<W>>> {
        Ok(self.jobs.lock().get(&id).cloned())
    }

    async fn find_active_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<JobRecord<W>>> {
        let jobs = self.jobs.lock();
        Ok(jobs
            .values()
            .filter(|job| {
                job.idempotency_key == idempotency_key
                    && job.status.is_active()
            })
            .min_by_key(|job| job.created_at)
            .cloned())
    }

    async fn compare_and_transition(
        &self,
        id: JobId,
        expected: &[JobStatus],
        mutation: JobMutation,
    ) -> Result<bool> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(&id)
            .ok_or(OrchestratorError::NotFound(id))?;

        if !expected.contains(&job.status) {
            return Ok(false);
        }

        mutation.apply(job, Utc::now());
        Ok(true)
    }

    async fn list_by_entity(
        &self,
        target_entity_id: Uuid,
    ) -> Result<Vec<JobRecord<W>>> {
        let jobs = self.jobs.lock();
        let mut out: Vec<JobRecord<W>> = jobs
            .values()
            .filter(|job| job.target_entity_id == target_entity_id)
            .cloned()
            .collect();
        out.sort_by_key(|job| job.created_at);
        Ok(out)
    }

    async fn list_running_with_stale_heartbeat(
        &self,
        ttl: Duration,
    ) -> Result<Vec<JobRecord<W>>> {
        let cutoff = Utc::now() - ttl;
        let jobs = self.jobs.lock();
        Ok(jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Running
                    && job
                        .last_heartbeat
                        .map(|hb| hb < cutoff)
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}
