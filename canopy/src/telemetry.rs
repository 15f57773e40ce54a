//! Tracing spans and metric hooks for the analysis pipeline.
//!
//! Every helper logs through `tracing`; with the `metrics` feature enabled
//! it also updates the Prometheus collectors in [`crate::metrics`].
//!
//! ```ignore
//! use canopy::telemetry::{dispatch_span, record_job_finished};
//!
//! let outcome = orchestrator
//!     .run(&job, &ctx)
//!     .instrument(dispatch_span(job.id, job.field_id(), job.queue, "w0"))
//!     .await;
//! record_job_finished(job.queue, outcome.status, started.elapsed());
//! ```

use std::time::Duration;
use tracing::{Span, info_span};

use crate::job::{FieldId, JobId, JobStatus};
use crate::quality::SkipReason;
use crate::queue::QueueName;
use crate::sr::SrProviderKind;

/// Span around one job's pipeline run.
#[must_use]
pub fn dispatch_span(
    job_id: JobId,
    field_id: FieldId,
    queue: QueueName,
    worker_id: &str,
) -> Span {
    info_span!(
        "analysis.dispatch",
        %job_id,
        %field_id,
        queue = queue.as_str(),
        worker_id,
    )
}

#[must_use]
pub fn claim_span(queue: QueueName, worker_id: &str) -> Span {
    info_span!("analysis.claim", queue = queue.as_str(), worker_id)
}

#[must_use]
pub fn enqueue_span(field_id: FieldId, queue: QueueName) -> Span {
    info_span!("analysis.enqueue", %field_id, queue = queue.as_str())
}

/// Span around a super-resolution provider call.
#[must_use]
pub fn sr_span(job_id: JobId, provider: SrProviderKind) -> Span {
    info_span!("analysis.sr", %job_id, provider = provider.as_str())
}

/// Span around one scheduler tick.
#[must_use]
pub fn schedule_span(tracked_fields: usize) -> Span {
    info_span!("analysis.schedule", tracked_fields)
}

pub fn record_job_enqueued(queue: QueueName, field_id: FieldId) {
    tracing::info!(queue = queue.as_str(), %field_id, "job enqueued");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_enqueued(queue.as_str());
}

/// Terminal status plus wall time from claim to completion.
pub fn record_job_finished(queue: QueueName, status: JobStatus, elapsed: Duration) {
    tracing::info!(
        queue = queue.as_str(),
        status = status.as_str(),
        duration_secs = elapsed.as_secs_f64(),
        "job finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(
        queue.as_str(),
        status.as_str(),
        elapsed.as_secs_f64(),
    );
}

pub fn record_quality_skip(queue: QueueName, reason: SkipReason) {
    tracing::debug!(queue = queue.as_str(), reason = reason.as_str(), "quality skip");

    #[cfg(feature = "metrics")]
    crate::metrics::record_quality_skip(reason.as_str());
}

/// `kind` is a short failure label such as `"timeout"` or `"exit"`.
pub fn record_sr_failure(provider: SrProviderKind, kind: &str) {
    tracing::warn!(provider = provider.as_str(), kind, "super-resolution failed");

    #[cfg(feature = "metrics")]
    crate::metrics::record_sr_failure(provider.as_str(), kind);
}

pub fn set_queue_depth(queue: QueueName, depth: usize) {
    tracing::debug!(queue = queue.as_str(), depth, "queue depth sampled");

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(queue.as_str(), depth as f64);
}

pub fn record_scheduled_submissions(count: usize) {
    if count > 0 {
        tracing::info!(count, "scheduled analyses submitted");
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_scheduled_submissions(count as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_names() {
        let job = JobId::new();
        let field = FieldId::new();
        let cases = [
            (dispatch_span(job, field, QueueName::AnalysisCpu, "w0"), "analysis.dispatch"),
            (claim_span(QueueName::SrGpu, "w1"), "analysis.claim"),
            (enqueue_span(field, QueueName::AnalysisCpu), "analysis.enqueue"),
            (sr_span(job, SrProviderKind::ExternalCommand), "analysis.sr"),
            (schedule_span(3), "analysis.schedule"),
        ];
        for (span, name) in cases {
            if let Some(metadata) = span.metadata() {
                assert_eq!(metadata.name(), name);
            }
        }
    }

    #[test]
    fn recorders_do_not_panic() {
        record_job_enqueued(QueueName::AnalysisCpu, FieldId::new());
        record_job_finished(
            QueueName::SrGpu,
            JobStatus::Succeeded,
            Duration::from_millis(250),
        );
        record_quality_skip(QueueName::AnalysisCpu, SkipReason::CloudCover);
        record_sr_failure(SrProviderKind::LocalModel, "timeout");
        set_queue_depth(QueueName::Exports, 0);
        record_scheduled_submissions(2);
    }
}
