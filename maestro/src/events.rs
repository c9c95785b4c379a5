use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{JobId, WorkType};

/// A job lifecycle event as observed by the orchestrator.
///
/// Events mirror state transitions; they are a read-only feed for the
/// notification layer (the layer that pushes progress to clients) and
/// carry no authority over the state machine itself.
#[derive(Clone, Debug)]
pub struct JobEvent<W: WorkType> {
    pub job_id: JobId,
    pub work_type: W,
    pub target_entity_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub payload: JobEventPayload,
}

impl<W: WorkType> JobEvent<W> {
    pub fn new(
        job_id: JobId,
        work_type: W,
        target_entity_id: Uuid,
        payload: JobEventPayload,
    ) -> Self {
        Self {
            job_id,
            work_type,
            target_entity_id,
            occurred_at: Utc::now(),
            payload,
        }
    }
}

/// Payload emitted per transition.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum JobEventPayload {
    /// A new Pending job was inserted.
    Created,
    /// A worker won the claim race.
    Claimed { worker_instance_id: String },
    /// The job finished successfully.
    Completed,
    /// The job failed; `retryable` is false once the budget is spent.
    Failed {
        retryable: bool,
        error: Option<String>,
    },
    /// A follow-up attempt was created for a failed or stale job.
    RetryRequested {
        attempt_job_id: JobId,
        retry_count: u16,
    },
    /// Caller-initiated cancellation.
    Cancelled,
    /// The sweeper reclassified a silent Running job.
    MarkedStale,
    /// An unclaimed job was administratively paused.
    Suspended,
    /// A suspended job returned to Pending.
    Resumed,
}

/// In-process fan-out bus for job lifecycle events.
///
/// Non-blocking publish over a tokio broadcast channel: publishers
/// never wait for slow subscribers, and a subscriber that lags gets
/// `RecvError::Lagged` rather than blocking anyone. With no
/// subscribers, events are silently dropped — publishing is
/// best-effort and never fails an orchestrator operation.
pub struct InProcEventBus<W: WorkType> {
    sender: broadcast::Sender<JobEvent<W>>,
    capacity: usize,
}

impl<W: WorkType> std::fmt::Debug for InProcEventBus<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl<W: WorkType> InProcEventBus<W> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: JobEvent<W>) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to job lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent<W>> {
        self.sender.subscribe()
    }
}
