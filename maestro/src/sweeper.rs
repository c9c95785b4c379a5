use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::events::{InProcEventBus, JobEvent, JobEventPayload};
use crate::job::{JobStatus, WorkType};
use crate::store::{JobMutation, JobStore};

/// Token for signaling graceful shutdown to background tasks.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic liveness watchdog for Running jobs.
///
/// On each tick the sweeper lists Running jobs whose last heartbeat is
/// older than the staleness TTL and attempts `Running → Stale` on each
/// via the store's CAS. A sweep never acts on a job it cannot win the
/// CAS for — a concurrent heartbeat or completion got there first —
/// which makes it safe to run from multiple orchestrator instances
/// with no coordination beyond the store itself.
pub struct StalenessSweeper<W: WorkType, S: JobStore<W>> {
    store: Arc<S>,
    config: OrchestratorConfig,
    events: Option<Arc<InProcEventBus<W>>>,
}

impl<W: WorkType, S: JobStore<W> + 'static> StalenessSweeper<W, S> {
    pub fn new(store: Arc<S>, config: OrchestratorConfig) -> Self {
        Self {
            store,
            config,
            events: None,
        }
    }

    /// Publish `MarkedStale` events onto the given bus.
    pub fn with_events(mut self, events: Arc<InProcEventBus<W>>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run one sweep, returning how many jobs were reclassified.
    pub async fn scan_once(&self) -> Result<u64> {
        let ttl = self.config.staleness_ttl();
        let candidates =
            self.store.list_running_with_stale_heartbeat(ttl).await?;

        let mut marked = 0u64;
        for job in candidates {
            let won = self
                .store
                .compare_and_transition(
                    job.id,
                    &[JobStatus::Running],
                    JobMutation::to(JobStatus::Stale).release_worker(),
                )
                .await?;

            if won {
                warn!(
                    job_id = %job.id,
                    work_type = %job.work_type,
                    last_heartbeat = ?job.last_heartbeat,
                    "running job marked stale; worker presumed dead"
                );
                #[cfg(feature = "metrics")]
                crate::metrics::record_job_stale(job.work_type.as_str());
                if let Some(events) = &self.events {
                    events.publish(JobEvent::new(
                        job.id,
                        job.work_type,
                        job.target_entity_id,
                        JobEventPayload::MarkedStale,
                    ));
                }
                marked += 1;
            }
        }

        Ok(marked)
    }

    /// Spawn the periodic sweep loop; it runs until the token is
    /// cancelled. Scan failures are logged and the loop continues.
    pub fn spawn(self, shutdown: ShutdownToken) -> tokio::task::JoinHandle<()> {
        let interval = self.config.sweep_interval();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("staleness sweeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match self.scan_once().await {
                            Ok(0) => {}
                            Ok(marked) => {
                                info!(marked, "staleness sweep reclassified jobs");
                            }
                            Err(err) => {
                                warn!("staleness sweep error: {err}");
                            }
                        }
                    }
                }
            }
        })
    }
}
