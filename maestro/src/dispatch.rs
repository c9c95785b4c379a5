use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::job::{JobId, JobRecord, WorkType};

/// A request for the caller to dispatch actual work to a worker.
///
/// The orchestrator never invokes workers itself. When a job is newly
/// admitted (created or retried), it offers a `DispatchRequest` onto a
/// bounded channel the caller drains; a full or closed channel is a
/// visible error, not a silently dropped task.
#[derive(Clone, Debug)]
pub struct DispatchRequest<W: WorkType> {
    pub job_id: JobId,
    pub work_type: W,
    pub target_entity_id: Uuid,
}

impl<W: WorkType> DispatchRequest<W> {
    pub fn for_job(job: &JobRecord<W>) -> Self {
        Self {
            job_id: job.id,
            work_type: job.work_type,
            target_entity_id: job.target_entity_id,
        }
    }
}

/// Create a bounded dispatch channel.
pub fn dispatch_channel<W: WorkType>(
    capacity: usize,
) -> (DispatchSender<W>, DispatchReceiver<W>) {
    let (tx, rx) = mpsc::channel(capacity);
    (DispatchSender { tx }, DispatchReceiver { rx })
}

/// Producer half, held by the orchestrator.
#[derive(Clone, Debug)]
pub struct DispatchSender<W: WorkType> {
    tx: mpsc::Sender<DispatchRequest<W>>,
}

impl<W: WorkType> DispatchSender<W> {
    /// Offer a request without blocking. Backpressure surfaces to the
    /// caller of the orchestrator operation instead of being absorbed.
    pub fn offer(&self, request: DispatchRequest<W>) -> Result<()> {
        self.tx.try_send(request).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                OrchestratorError::Dispatch("queue full")
            }
            mpsc::error::TrySendError::Closed(_) => {
                OrchestratorError::Dispatch("queue closed")
            }
        })
    }
}

/// Consumer half, held by the caller that talks to workers.
#[derive(Debug)]
pub struct DispatchReceiver<W: WorkType> {
    rx: mpsc::Receiver<DispatchRequest<W>>,
}

impl<W: WorkType> DispatchReceiver<W> {
    /// Receive the next dispatch request; `None` once all senders are
    /// dropped.
    pub async fn recv(&mut self) -> Option<DispatchRequest<W>> {
        self.rx.recv().await
    }

    /// Non-blocking variant for drain loops.
    pub fn try_recv(&mut self) -> Option<DispatchRequest<W>> {
        self.rx.try_recv().ok()
    }
}
