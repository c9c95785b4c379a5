//! Integration tests for the PostgreSQL job store: the partial unique
//! index guarding one-active-job-per-key, and compare-and-transition as
//! a single conditional UPDATE.
//!
//! Requires a running Postgres instance.
//! Run with: `cargo test --test postgres_store --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use serde_json::Map;
use sqlx::PgPool;
use uuid::Uuid;

use maestro::persistence::PostgresJobStore;
use maestro::{
    JobMutation, JobRecord, JobStatus, JobStore, OrchestratorError,
};
use maestro_testkit::TestWorkType;

async fn connect_and_migrate() -> (PgPool, PostgresJobStore<TestWorkType>) {
    let pool = PgPool::connect(
        &std::env::var("DATABASE_URL").expect("DATABASE_URL required"),
    )
    .await
    .expect("connect");

    let store = PostgresJobStore::new(pool.clone());
    store.migrate().await.expect("migrate");
    (pool, store)
}

async fn backdate_heartbeat(pool: &PgPool, job_id: Uuid, seconds: i64) {
    sqlx::query(
        r#"
        UPDATE maestro_jobs
        SET last_heartbeat = NOW() - ($2::bigint) * INTERVAL '1 second'
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(seconds)
    .execute(pool)
    .await
    .expect("backdate_heartbeat");
}

async fn cleanup(pool: &PgPool, target_entity_id: Uuid) {
    sqlx::query("DELETE FROM maestro_jobs WHERE target_entity_id = $1")
        .bind(target_entity_id)
        .execute(pool)
        .await
        .ok();
}

/// The partial unique index rejects a second active job for a key, but
/// admits one again once the first leaves the active set.
#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn unique_index_guards_one_active_job_per_key() {
    let (pool, store) = connect_and_migrate().await;
    let entity = Uuid::new_v4();

    let first =
        JobRecord::new(TestWorkType::Analysis, entity, Map::new(), 3);
    let first = store.insert(first).await.expect("first insert");

    let second =
        JobRecord::new(TestWorkType::Analysis, entity, Map::new(), 3);
    let err = store.insert(second).await.expect_err("duplicate insert");
    assert!(matches!(err, OrchestratorError::DuplicateKey(_)));

    // Resolve the first job; the key frees and a new insert succeeds.
    let resolved = store
        .compare_and_transition(
            first.id,
            &[JobStatus::Pending],
            JobMutation::to(JobStatus::Cancelled),
        )
        .await
        .expect("cancel");
    assert!(resolved);

    let third =
        JobRecord::new(TestWorkType::Analysis, entity, Map::new(), 3);
    store.insert(third).await.expect("insert after cancel");

    cleanup(&pool, entity).await;
}

/// Exactly one of two competing claims wins the conditional UPDATE.
#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn compare_and_transition_is_first_writer_wins() {
    let (pool, store) = connect_and_migrate().await;
    let entity = Uuid::new_v4();

    let job = store
        .insert(JobRecord::new(
            TestWorkType::Generation,
            entity,
            Map::new(),
            3,
        ))
        .await
        .expect("insert");

    let claim = |worker: &str| {
        JobMutation::to(JobStatus::Running)
            .claimed_by(worker)
            .mark_started()
            .touch_heartbeat()
    };

    let won_a = store
        .compare_and_transition(
            job.id,
            &[JobStatus::Pending, JobStatus::Retrying],
            claim("worker-a"),
        )
        .await
        .expect("claim a");
    let won_b = store
        .compare_and_transition(
            job.id,
            &[JobStatus::Pending, JobStatus::Retrying],
            claim("worker-b"),
        )
        .await
        .expect("claim b");

    assert!(won_a);
    assert!(!won_b, "second claim must lose without side effects");

    let stored = store
        .find_by_id(job.id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.worker_instance_id.as_deref(), Some("worker-a"));
    assert!(stored.started_at.is_some());
    assert!(stored.last_heartbeat.is_some());

    cleanup(&pool, entity).await;
}

/// A CAS against an id that does not exist reports NotFound, not a
/// lost race.
#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn compare_and_transition_distinguishes_missing_jobs() {
    let (_pool, store) = connect_and_migrate().await;

    let err = store
        .compare_and_transition(
            maestro::JobId::new(),
            &[JobStatus::Pending],
            JobMutation::to(JobStatus::Running),
        )
        .await
        .expect_err("unknown id");
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

/// Checkpoint deltas merge key-wise into the JSONB column instead of
/// replacing it.
#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn checkpoint_merge_preserves_untouched_keys() {
    let (pool, store) = connect_and_migrate().await;
    let entity = Uuid::new_v4();

    let job = store
        .insert(JobRecord::new(
            TestWorkType::Analysis,
            entity,
            Map::new(),
            3,
        ))
        .await
        .expect("insert");
    store
        .compare_and_transition(
            job.id,
            &[JobStatus::Pending],
            JobMutation::to(JobStatus::Running)
                .claimed_by("w1")
                .touch_heartbeat(),
        )
        .await
        .expect("claim");

    let mut first = Map::new();
    first.insert("stage".into(), serde_json::json!("separating"));
    first.insert("stems_done".into(), serde_json::json!(2));
    store
        .compare_and_transition(
            job.id,
            &[JobStatus::Running],
            JobMutation::to(JobStatus::Running)
                .merge_checkpoint(first)
                .touch_heartbeat(),
        )
        .await
        .expect("first heartbeat");

    let mut second = Map::new();
    second.insert("stems_done".into(), serde_json::json!(4));
    store
        .compare_and_transition(
            job.id,
            &[JobStatus::Running],
            JobMutation::to(JobStatus::Running)
                .merge_checkpoint(second)
                .touch_heartbeat(),
        )
        .await
        .expect("second heartbeat");

    let stored = store
        .find_by_id(job.id)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(stored.checkpoint_data["stems_done"], serde_json::json!(4));
    assert_eq!(
        stored.checkpoint_data["stage"],
        serde_json::json!("separating")
    );

    cleanup(&pool, entity).await;
}

/// Only Running jobs with an expired heartbeat show up as staleness
/// candidates.
#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn stale_heartbeat_listing_honors_the_ttl() {
    let (pool, store) = connect_and_migrate().await;
    let dead_entity = Uuid::new_v4();
    let live_entity = Uuid::new_v4();

    let dead = store
        .insert(JobRecord::new(
            TestWorkType::Training,
            dead_entity,
            Map::new(),
            3,
        ))
        .await
        .expect("insert dead");
    let live = store
        .insert(JobRecord::new(
            TestWorkType::Training,
            live_entity,
            Map::new(),
            3,
        ))
        .await
        .expect("insert live");

    for job in [&dead, &live] {
        store
            .compare_and_transition(
                job.id,
                &[JobStatus::Pending],
                JobMutation::to(JobStatus::Running)
                    .claimed_by("w1")
                    .touch_heartbeat(),
            )
            .await
            .expect("claim");
    }
    backdate_heartbeat(&pool, dead.id.0, 600).await;

    let candidates = store
        .list_running_with_stale_heartbeat(chrono::Duration::seconds(300))
        .await
        .expect("list stale");
    let ids: Vec<_> = candidates.iter().map(|j| j.id).collect();
    assert!(ids.contains(&dead.id));
    assert!(!ids.contains(&live.id));

    cleanup(&pool, dead_entity).await;
    cleanup(&pool, live_entity).await;
}

/// `find_active_by_key` ignores resolved attempts and returns the one
/// active holder of the key.
#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn find_active_by_key_skips_resolved_jobs() {
    let (pool, store) = connect_and_migrate().await;
    let entity = Uuid::new_v4();

    let first = store
        .insert(JobRecord::new(
            TestWorkType::Generation,
            entity,
            Map::new(),
            3,
        ))
        .await
        .expect("insert first");
    store
        .compare_and_transition(
            first.id,
            &[JobStatus::Pending],
            JobMutation::to(JobStatus::Failed).error("boom"),
        )
        .await
        .expect("fail first");

    let mut second =
        JobRecord::new(TestWorkType::Generation, entity, Map::new(), 3);
    second.retry_count = 1;
    let second = store.insert(second).await.expect("insert second");

    let active = store
        .find_active_by_key(&second.idempotency_key)
        .await
        .expect("lookup")
        .expect("one active job");
    assert_eq!(active.id, second.id);
    assert_eq!(active.retry_count, 1);

    cleanup(&pool, entity).await;
}
