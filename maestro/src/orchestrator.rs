use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::dispatch::{DispatchRequest, DispatchSender};
use crate::error::{OrchestratorError, Result};
use crate::events::{InProcEventBus, JobEvent, JobEventPayload};
use crate::job::{idempotency_key, JobId, JobRecord, JobStatus, WorkType};
use crate::store::{JobMutation, JobStore};

/// Result of an idempotent creation call.
///
/// `accepted` is true only for the call that actually inserted the
/// job; duplicate submissions get the existing record and must not
/// dispatch work again.
#[derive(Clone, Debug)]
pub struct JobHandle<W: WorkType> {
    pub job: JobRecord<W>,
    pub accepted: bool,
}

/// The idempotent job orchestration state machine.
///
/// Every mutation goes through the store's `compare_and_transition`,
/// so any number of API requests and worker callbacks may call in
/// concurrently, across any number of orchestrator instances, with no
/// in-process lock. Losing a race is a normal outcome: claim attempts
/// report it as `Ok(false)`, everything else as `InvalidTransition`
/// after a re-read.
///
/// The orchestrator never invokes workers and never retries on its
/// own; dispatch goes through an optional bounded queue drained by the
/// caller, and every retry is caller-initiated via [`request_retry`].
///
/// [`request_retry`]: JobOrchestrator::request_retry
pub struct JobOrchestrator<W: WorkType, S: JobStore<W>> {
    store: Arc<S>,
    config: OrchestratorConfig,
    events: Arc<InProcEventBus<W>>,
    dispatch: Option<DispatchSender<W>>,
}

impl<W: WorkType, S: JobStore<W>> JobOrchestrator<W, S> {
    pub fn new(store: Arc<S>, config: OrchestratorConfig) -> Self {
        Self {
            store,
            config,
            events: Arc::new(InProcEventBus::new(256)),
            dispatch: None,
        }
    }

    /// Attach the dispatch queue newly admitted jobs are offered to.
    pub fn with_dispatch(mut self, sender: DispatchSender<W>) -> Self {
        self.dispatch = Some(sender);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    /// The lifecycle event bus; share it with the staleness sweeper
    /// and the notification layer.
    pub fn event_bus(&self) -> Arc<InProcEventBus<W>> {
        Arc::clone(&self.events)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<JobEvent<W>> {
        self.events.subscribe()
    }

    /// Idempotently create a job for (work type, target entity).
    ///
    /// If an active job already holds the idempotency key, it is
    /// returned unchanged with `accepted: false` — duplicate
    /// submissions of the same logical work never cause a second
    /// dispatch. Uses the config's default retry budget.
    pub async fn create_or_get(
        &self,
        work_type: W,
        target_entity_id: Uuid,
        metadata: Map<String, Value>,
    ) -> Result<JobHandle<W>> {
        self.create_or_get_with_budget(
            work_type,
            target_entity_id,
            metadata,
            self.config.default_max_retries,
        )
        .await
    }

    /// Same as [`create_or_get`] with an explicit retry budget.
    ///
    /// [`create_or_get`]: JobOrchestrator::create_or_get
    pub async fn create_or_get_with_budget(
        &self,
        work_type: W,
        target_entity_id: Uuid,
        metadata: Map<String, Value>,
        max_retries: u16,
    ) -> Result<JobHandle<W>> {
        let key = idempotency_key(work_type, target_entity_id);

        if let Some(existing) = self.store.find_active_by_key(&key).await? {
            debug!(
                job_id = %existing.id,
                idempotency_key = %key,
                "duplicate submission collapsed onto active job"
            );
            return Ok(JobHandle {
                job: existing,
                accepted: false,
            });
        }

        let job =
            JobRecord::new(work_type, target_entity_id, metadata, max_retries);

        match self.store.insert(job).await {
            Ok(job) => {
                debug!(job_id = %job.id, work_type = %work_type, "job created");
                self.emit(&job, JobEventPayload::Created);
                #[cfg(feature = "metrics")]
                crate::metrics::record_job_created(work_type.as_str());
                self.offer_dispatch(&job)?;
                Ok(JobHandle {
                    job,
                    accepted: true,
                })
            }
            // Lost the lookup/insert race; whoever won holds the key.
            Err(OrchestratorError::DuplicateKey(_)) => {
                match self.store.find_active_by_key(&key).await? {
                    Some(existing) => Ok(JobHandle {
                        job: existing,
                        accepted: false,
                    }),
                    None => Err(OrchestratorError::DuplicateKey(key)),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Claim a Pending or Retrying job for a worker.
    ///
    /// Returns `Ok(false)` when another caller claimed it first or the
    /// job is in any other state — only one worker ever owns a job.
    pub async fn start_processing(
        &self,
        job_id: JobId,
        worker_instance_id: &str,
    ) -> Result<bool> {
        let mutation = JobMutation::to(JobStatus::Running)
            .claimed_by(worker_instance_id)
            .mark_started()
            .touch_heartbeat()
            .clear_error();

        let won = self
            .store
            .compare_and_transition(
                job_id,
                &[JobStatus::Pending, JobStatus::Retrying],
                mutation,
            )
            .await?;

        if won {
            debug!(%job_id, worker = worker_instance_id, "job claimed");
            if let Some(job) = self.store.find_by_id(job_id).await? {
                self.emit(
                    &job,
                    JobEventPayload::Claimed {
                        worker_instance_id: worker_instance_id.to_string(),
                    },
                );
            }
        }
        Ok(won)
    }

    /// Record a liveness signal from the owning worker.
    ///
    /// Merges `checkpoint_delta` key-wise into the checkpoint map and
    /// refreshes `last_heartbeat`, resetting the staleness clock. A
    /// heartbeat that arrives after the job has left Running (e.g.
    /// raced against a complete) is rejected without writing anything;
    /// callers may treat that as best-effort noise.
    pub async fn heartbeat(
        &self,
        job_id: JobId,
        step: Option<&str>,
        checkpoint_delta: Option<Map<String, Value>>,
    ) -> Result<()> {
        let mut mutation =
            JobMutation::to(JobStatus::Running).touch_heartbeat();
        if let Some(step) = step {
            mutation = mutation.step(step);
        }
        if let Some(delta) = checkpoint_delta {
            mutation = mutation.merge_checkpoint(delta);
        }

        let ok = self
            .store
            .compare_and_transition(job_id, &[JobStatus::Running], mutation)
            .await?;
        if !ok {
            return Err(self.transition_rejected(job_id, "heartbeat").await);
        }
        Ok(())
    }

    /// Resolve a Running job as successfully finished.
    pub async fn complete(
        &self,
        job_id: JobId,
        result_metadata: Option<Map<String, Value>>,
    ) -> Result<()> {
        let mut mutation = JobMutation::to(JobStatus::Completed)
            .mark_completed()
            .release_worker();
        if let Some(metadata) = result_metadata {
            mutation = mutation.merge_metadata(metadata);
        }

        let ok = self
            .store
            .compare_and_transition(job_id, &[JobStatus::Running], mutation)
            .await?;
        if !ok {
            return Err(self.transition_rejected(job_id, "complete").await);
        }

        debug!(%job_id, "job completed");
        if let Some(job) = self.store.find_by_id(job_id).await? {
            #[cfg(feature = "metrics")]
            crate::metrics::record_job_completed(job.work_type.as_str());
            self.emit(&job, JobEventPayload::Completed);
        }
        Ok(())
    }

    /// Record a worker-reported failure.
    ///
    /// Transitions Running → Retrying while retry budget remains,
    /// reserving a recovery slot; Running → Failed once the budget is
    /// spent, making the failure permanent. `retry_count` is not
    /// incremented here — it increments only when the follow-up
    /// attempt is actually created, so an attempt that never restarts
    /// is not double-counted.
    pub async fn fail(
        &self,
        job_id: JobId,
        error: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<()> {
        let job = self.require(job_id).await?;

        // retry_count and max_retries cannot change while the job is
        // Running, so deciding the target status before the CAS is
        // sound: the CAS still guards the status itself.
        let retryable = !job.budget_exhausted();
        let target = if retryable {
            JobStatus::Retrying
        } else {
            JobStatus::Failed
        };

        let mut mutation =
            JobMutation::to(target).error(error).release_worker();
        if let Some(extra) = metadata {
            mutation = mutation.merge_metadata(extra);
        }

        let ok = self
            .store
            .compare_and_transition(job_id, &[JobStatus::Running], mutation)
            .await?;
        if !ok {
            return Err(self.transition_rejected(job_id, "fail").await);
        }

        warn!(
            %job_id,
            retryable,
            retry_count = job.retry_count,
            max_retries = job.max_retries,
            error,
            "job failed"
        );
        #[cfg(feature = "metrics")]
        crate::metrics::record_job_failed(job.work_type.as_str(), retryable);
        self.emit(
            &job,
            JobEventPayload::Failed {
                retryable,
                error: Some(error.to_string()),
            },
        );
        Ok(())
    }

    /// Create a follow-up attempt for a failed or stale job.
    ///
    /// Valid when the original is Retrying, Stale, or Failed with
    /// budget remaining. The new attempt shares the idempotency key,
    /// carries `retry_count = original + 1`, a clean error slot, and a
    /// `retried_from` back-reference in its metadata. A Retrying or
    /// Stale original is first resolved to Failed so the key frees
    /// before the new Pending attempt is inserted; if another caller
    /// retried concurrently, both calls converge on the same new
    /// attempt.
    pub async fn request_retry(
        &self,
        original_job_id: JobId,
    ) -> Result<JobRecord<W>> {
        let original = self.require(original_job_id).await?;

        match original.status {
            JobStatus::Retrying | JobStatus::Stale | JobStatus::Failed => {}
            from => {
                return Err(OrchestratorError::InvalidTransition {
                    id: original_job_id,
                    from,
                    event: "request_retry",
                });
            }
        }

        if original.budget_exhausted() {
            return Err(OrchestratorError::RetryBudgetExhausted {
                id: original_job_id,
                retry_count: original.retry_count,
                max_retries: original.max_retries,
            });
        }

        if matches!(original.status, JobStatus::Retrying | JobStatus::Stale) {
            let mut resolve =
                JobMutation::to(JobStatus::Failed).release_worker();
            if original.error_message.is_none() {
                // Stale jobs reached here without a worker report.
                resolve = resolve.error("worker heartbeat expired");
            }
            let resolved = self
                .store
                .compare_and_transition(
                    original_job_id,
                    &[original.status],
                    resolve,
                )
                .await?;
            if !resolved {
                // Another retry request got there first; hand back
                // whatever attempt now owns the key.
                if let Some(active) = self
                    .store
                    .find_active_by_key(&original.idempotency_key)
                    .await?
                {
                    return Ok(active);
                }
                return Err(
                    self.transition_rejected(original_job_id, "request_retry")
                        .await,
                );
            }
        }

        let mut attempt = JobRecord::new(
            original.work_type,
            original.target_entity_id,
            original.metadata.clone(),
            original.max_retries,
        );
        attempt.retry_count = original.retry_count + 1;
        attempt
            .metadata
            .insert("retried_from".to_string(), json!(original.id));

        match self.store.insert(attempt).await {
            Ok(job) => {
                debug!(
                    original = %original_job_id,
                    attempt = %job.id,
                    retry_count = job.retry_count,
                    "retry attempt created"
                );
                self.emit(
                    &original,
                    JobEventPayload::RetryRequested {
                        attempt_job_id: job.id,
                        retry_count: job.retry_count,
                    },
                );
                self.offer_dispatch(&job)?;
                Ok(job)
            }
            Err(OrchestratorError::DuplicateKey(key)) => {
                match self.store.find_active_by_key(&key).await? {
                    Some(active) => Ok(active),
                    None => Err(OrchestratorError::DuplicateKey(key)),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Cancel a Pending or Running job.
    ///
    /// Advisory only: an already-dispatched worker is not reached or
    /// stopped; the job merely stops being active, which frees the
    /// idempotency key for a fresh submission.
    pub async fn cancel(
        &self,
        job_id: JobId,
        reason: Option<String>,
    ) -> Result<()> {
        let mut mutation =
            JobMutation::to(JobStatus::Cancelled).release_worker();
        if let Some(reason) = reason {
            let mut note = Map::new();
            note.insert("cancel_reason".to_string(), json!(reason));
            mutation = mutation.merge_metadata(note);
        }

        let ok = self
            .store
            .compare_and_transition(
                job_id,
                &[JobStatus::Pending, JobStatus::Running],
                mutation,
            )
            .await?;
        if !ok {
            return Err(self.transition_rejected(job_id, "cancel").await);
        }

        debug!(%job_id, "job cancelled");
        if let Some(job) = self.store.find_by_id(job_id).await? {
            self.emit(&job, JobEventPayload::Cancelled);
        }
        Ok(())
    }

    /// Administratively pause an unclaimed job. Suspended jobs keep
    /// holding the idempotency key.
    pub async fn suspend(&self, job_id: JobId) -> Result<()> {
        let ok = self
            .store
            .compare_and_transition(
                job_id,
                &[JobStatus::Pending],
                JobMutation::to(JobStatus::Suspended),
            )
            .await?;
        if !ok {
            return Err(self.transition_rejected(job_id, "suspend").await);
        }
        if let Some(job) = self.store.find_by_id(job_id).await? {
            self.emit(&job, JobEventPayload::Suspended);
        }
        Ok(())
    }

    /// Return a suspended job to Pending, making it claimable again.
    pub async fn resume(&self, job_id: JobId) -> Result<()> {
        let ok = self
            .store
            .compare_and_transition(
                job_id,
                &[JobStatus::Suspended],
                JobMutation::to(JobStatus::Pending),
            )
            .await?;
        if !ok {
            return Err(self.transition_rejected(job_id, "resume").await);
        }
        if let Some(job) = self.store.find_by_id(job_id).await? {
            self.emit(&job, JobEventPayload::Resumed);
        }
        Ok(())
    }

    pub async fn get(&self, job_id: JobId) -> Result<JobRecord<W>> {
        self.require(job_id).await
    }

    pub async fn list_by_entity(
        &self,
        target_entity_id: Uuid,
    ) -> Result<Vec<JobRecord<W>>> {
        self.store.list_by_entity(target_entity_id).await
    }

    async fn require(&self, job_id: JobId) -> Result<JobRecord<W>> {
        self.store
            .find_by_id(job_id)
            .await?
            .ok_or(OrchestratorError::NotFound(job_id))
    }

    /// Build the error for a CAS that found the wrong status: re-read
    /// once so the caller learns the actual current state.
    async fn transition_rejected(
        &self,
        job_id: JobId,
        event: &'static str,
    ) -> OrchestratorError {
        match self.store.find_by_id(job_id).await {
            Ok(Some(job)) => OrchestratorError::InvalidTransition {
                id: job_id,
                from: job.status,
                event,
            },
            Ok(None) => OrchestratorError::NotFound(job_id),
            Err(err) => err,
        }
    }

    fn offer_dispatch(&self, job: &JobRecord<W>) -> Result<()> {
        if let Some(dispatch) = &self.dispatch {
            dispatch.offer(DispatchRequest::for_job(job))?;
        }
        Ok(())
    }

    fn emit(&self, job: &JobRecord<W>, payload: JobEventPayload) {
        self.events.publish(JobEvent::new(
            job.id,
            job.work_type,
            job.target_entity_id,
            payload,
        ));
    }
}
