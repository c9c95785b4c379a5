//! Maestro - Idempotent job orchestration for the media platform backend.
//!
//! A foundational crate providing the state-machine core that every
//! long-running operation (analysis, generation, training) routes
//! through: at-most-one active unit of work per logical target,
//! duplicate-safe creation, heartbeat-based liveness detection, and a
//! bounded, caller-driven retry policy.
//!
//! # Core Concepts
//!
//! - **Job**: The unit of trackable asynchronous work, a [`JobRecord`]
//!   keyed by an idempotency key derived from its work type and target
//!   entity.
//!
//! - **Store**: The [`JobStore`] trait abstracts the durable backend.
//!   Its `compare_and_transition` primitive is the only way any status
//!   is ever written, which makes the whole design shared-nothing and
//!   horizontally scalable across orchestrator instances.
//!
//! - **Orchestrator**: [`JobOrchestrator`] implements the lifecycle:
//!   idempotent creation, exclusive claiming, heartbeats/checkpoints,
//!   completion, bounded retries, and advisory cancellation.
//!
//! - **Sweeper**: [`StalenessSweeper`] periodically reclassifies
//!   Running jobs with an expired heartbeat as Stale, making dead
//!   workers' jobs eligible for recovery.
//!
//! - **Events**: [`InProcEventBus`] broadcasts lifecycle transitions
//!   to the notification layer without giving it any authority over
//!   the state machine.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL persistence support via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use maestro::*;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
//! enum MediaWork {
//!     Analysis,
//!     Generation,
//!     Training,
//! }
//!
//! impl WorkType for MediaWork {
//!     // ... as_str / parse
//! }
//!
//! let orchestrator = JobOrchestrator::new(store, OrchestratorConfig::default());
//! let handle = orchestrator.create_or_get(MediaWork::Analysis, entity_id, metadata).await?;
//! if handle.accepted {
//!     // dispatch to a worker
//! }
//! ```

/// Configuration for retry budgets and staleness policy.
///
/// The `config` module defines [`OrchestratorConfig`] for tuning the
/// default retry budget, staleness TTL, and sweep interval.
pub mod config;

/// Dispatch queue between orchestrator and caller.
///
/// The `dispatch` module provides the bounded channel
/// ([`DispatchSender`]/[`DispatchReceiver`]) over which newly admitted
/// jobs are offered to whatever layer actually invokes workers.
pub mod dispatch;

/// Error types for orchestration operations.
///
/// The `error` module defines [`OrchestratorError`] and the crate-wide
/// [`Result`] alias.
pub mod error;

/// Lifecycle event publishing.
///
/// The `events` module provides [`JobEvent`], [`JobEventPayload`], and
/// the broadcast-backed [`InProcEventBus`].
pub mod events;

/// Core job definitions.
///
/// The `job` module defines [`JobRecord`], [`JobStatus`], [`JobId`],
/// the [`WorkType`] trait, and idempotency-key derivation.
pub mod job;

/// The orchestration state machine.
///
/// The `orchestrator` module provides [`JobOrchestrator`] and
/// [`JobHandle`].
pub mod orchestrator;

/// Durable job storage contract.
///
/// The `store` module defines the [`JobStore`] trait and the
/// declarative [`JobMutation`] applied by `compare_and_transition`.
pub mod store;

/// Heartbeat-expiry detection.
///
/// The `sweeper` module provides [`StalenessSweeper`] and
/// [`ShutdownToken`].
pub mod sweeper;

#[cfg(feature = "metrics")]
/// Prometheus metrics for job lifecycle monitoring.
pub mod metrics;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides [`PostgresJobStore`] when the
/// `postgres` feature is enabled.
pub mod persistence;

pub use config::*;
pub use dispatch::*;
pub use error::*;
pub use events::*;
pub use job::*;
pub use orchestrator::*;
pub use store::*;
pub use sweeper::*;

#[cfg(feature = "postgres")]
pub use persistence::PostgresJobStore;
