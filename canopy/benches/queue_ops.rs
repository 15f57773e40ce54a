//! Benchmarks for queue operations using criterion.
//!
//! These benchmarks measure the in-memory job queue:
//! - Single job enqueue
//! - Claim with many fields already RUNNING
//! - Full lifecycle (enqueue -> claim -> complete)

#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use canopy::*;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn job(field_id: FieldId) -> AnalysisJob {
    AnalysisJob::new(
        AnalysisRequest::for_field(field_id),
        JobContext {
            organization_id: OrganizationId::new(),
            sr_analytics_enabled: false,
        },
        QueueName::AnalysisCpu,
    )
}

fn skipped() -> JobCompletion {
    JobCompletion {
        status: JobStatus::Skipped,
        result: Some(JobResult::with_reason("bench")),
        error_message: None,
    }
}

fn bench_enqueue_single(c: &mut Criterion) {
    let rt = create_runtime();
    let queue = Arc::new(InMemoryJobQueue::new());

    c.bench_function("enqueue_single", |b| {
        b.to_async(&rt).iter(|| async {
            queue
                .enqueue(job(FieldId::new()))
                .await
                .expect("enqueue should succeed");
        });
    });
}

/// Claims scan past jobs whose field is busy; this measures that scan.
fn bench_claim_with_busy_fields(c: &mut Criterion) {
    let rt = create_runtime();
    let mut group = c.benchmark_group("claim_busy_fields");
    group.sample_size(50);

    for busy in [10usize, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("blocked", busy), &busy, |b, &busy| {
            let queue = Arc::new(InMemoryJobQueue::new());
            rt.block_on(async {
                for _ in 0..busy {
                    let field_id = FieldId::new();
                    queue.enqueue(job(field_id)).await.expect("enqueue");
                    queue
                        .claim(ClaimRequest::new(QueueName::AnalysisCpu, "holder"))
                        .await
                        .expect("claim")
                        .expect("job available");
                    queue.enqueue(job(field_id)).await.expect("enqueue");
                }
            });

            b.to_async(&rt).iter(|| async {
                let free = FieldId::new();
                queue.enqueue(job(free)).await.expect("enqueue");
                let lease = queue
                    .claim(ClaimRequest::new(QueueName::AnalysisCpu, "bench"))
                    .await
                    .expect("claim")
                    .expect("free field claimable");
                queue.complete(&lease, skipped()).await.expect("complete");
            });
        });
    }

    group.finish();
}

fn bench_full_lifecycle(c: &mut Criterion) {
    let rt = create_runtime();
    let queue = Arc::new(InMemoryJobQueue::new());

    c.bench_function("full_lifecycle", |b| {
        b.to_async(&rt).iter(|| async {
            let handle = queue
                .enqueue(job(FieldId::new()))
                .await
                .expect("enqueue should succeed");
            let lease = queue
                .claim(ClaimRequest::new(QueueName::AnalysisCpu, "bench-worker"))
                .await
                .expect("claim should succeed")
                .expect("job should be available");
            debug_assert_eq!(lease.job_id, handle.id);
            queue
                .complete(&lease, skipped())
                .await
                .expect("complete should succeed");
        });
    });
}

criterion_group!(
    benches,
    bench_enqueue_single,
    bench_claim_with_busy_fields,
    bench_full_lifecycle
);
criterion_main!(benches);
