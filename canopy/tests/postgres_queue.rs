//! PostgreSQL store checks: claim exclusivity per field, lease ownership,
//! cancellation and the observation timeline.
//!
//! Requires a running Postgres instance; the schema is created on connect.
//! Run with: `cargo test --test postgres_queue --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use canopy::persistence::PostgresStore;
use canopy::*;
use canopy_testkit::{date, job_for, june_request, ndvi_observation, test_field};
use sqlx::PgPool;
use uuid::Uuid;

async fn connect() -> PostgresStore {
    let pool = PgPool::connect(
        &std::env::var("DATABASE_URL").expect("DATABASE_URL required"),
    )
    .await
    .expect("connect");
    let store = PostgresStore::new(pool);
    store.migrate().await.expect("migrate");
    store
}

async fn cleanup(store: &PostgresStore, fields: &[FieldId]) {
    let ids: Vec<Uuid> = fields.iter().map(|f| f.0).collect();
    for table in ["canopy_analysis_jobs", "canopy_observations", "canopy_alerts"] {
        sqlx::query(&format!("DELETE FROM {table} WHERE field_id = ANY($1)"))
            .bind(&ids)
            .execute(store.pool())
            .await
            .ok();
    }
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn second_job_for_a_running_field_waits() {
    let store = connect().await;
    let field = test_field("pg-serial");
    cleanup(&store, &[field.id]).await;

    let first = job_for(&field, june_request(field.id), false, QueueName::SrGpu);
    let second = job_for(&field, june_request(field.id), false, QueueName::SrGpu);
    let (first_id, second_id) = (first.id, second.id);
    store.enqueue(first).await.unwrap();
    store.enqueue(second).await.unwrap();

    let claim = || ClaimRequest::new(QueueName::SrGpu, "pg-test-w0");
    let lease = store.claim(claim()).await.unwrap().expect("first claim");
    assert_eq!(lease.job_id, first_id);
    assert!(store.claim(claim()).await.unwrap().is_none());

    let done = store
        .complete(
            &lease,
            JobCompletion {
                status: JobStatus::Skipped,
                result: Some(JobResult::with_reason("test")),
                error_message: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Skipped);

    // A second completion of the same lease is rejected.
    let again = store
        .complete(
            &lease,
            JobCompletion {
                status: JobStatus::Failed,
                result: None,
                error_message: Some("late".into()),
            },
        )
        .await;
    assert!(again.is_err());

    let next = store.claim(claim()).await.unwrap().expect("second claim");
    assert_eq!(next.job_id, second_id);
    assert_eq!(next.job.status, JobStatus::Running);

    cleanup(&store, &[field.id]).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn cancelling_queued_job_fails_it() {
    let store = connect().await;
    let field = test_field("pg-cancel");
    cleanup(&store, &[field.id]).await;

    let job = job_for(&field, june_request(field.id), false, QueueName::AnalysisCpu);
    let job_id = job.id;
    store.enqueue(job).await.unwrap();

    assert!(store.cancel(job_id).await.unwrap());
    let stored = store.get(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some("cancelled"));
    assert!(!store.cancel(job_id).await.unwrap());

    cleanup(&store, &[field.id]).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn observation_timeline_is_newest_first() {
    let store = connect().await;
    let field_id = FieldId::new();
    cleanup(&store, &[field_id]).await;

    for (day, mean) in [(3, 0.70), (9, 0.74), (6, 0.72)] {
        let observation = ndvi_observation(field_id, date(2026, 6, day), mean);
        ObservationStore::insert(&store, &observation).await.unwrap();
    }
    let recent = store.recent_for_field(field_id, 2).await.unwrap();
    let days: Vec<_> = recent.iter().map(|o| o.observed_on).collect();
    assert_eq!(days, vec![date(2026, 6, 9), date(2026, 6, 6)]);
    assert_eq!(recent[0].native_mean(IndexName::Ndvi), Some(0.74));

    assert_eq!(store.clear_field(field_id).await.unwrap(), 3);
}
