use serde::{Deserialize, Serialize};

/// Configuration for orchestration behavior and liveness detection.
///
/// The staleness TTL and sweep interval are policy, not constants: the
/// sweep interval should be shorter than the TTL so a dead worker is
/// noticed within one TTL window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Retry budget assigned to jobs created without an explicit one.
    pub default_max_retries: u16,
    /// Age of a Running job's last heartbeat beyond which the sweeper
    /// reclassifies it as Stale, in seconds.
    pub staleness_ttl_secs: i64,
    /// Interval between sweeper runs in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            staleness_ttl_secs: 300,
            sweep_interval_ms: 60_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn staleness_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_ttl_secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sweep_interval_ms)
    }
}
