//! On-demand and scheduled job creation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Instrument, info};

use crate::error::SubmitError;
use crate::events::{EventMeta, JobEvent, JobEventPayload, JobEventPublisher};
use crate::field::FieldDirectory;
use crate::job::{AnalysisJob, AnalysisRequest, JobContext, JobHandle, JobId, JobStatusView, OrganizationId};
use crate::queue::JobQueue;
use crate::router::JobRouter;
use crate::telemetry;

/// Organisation flag gating SR-derived analytics.
pub const SR_ANALYTICS_FLAG: &str = "sr_analytics_enabled";

/// Per-organisation feature flags.
#[async_trait]
pub trait FeatureFlags: Send + Sync {
    async fn is_enabled(
        &self,
        organization_id: OrganizationId,
        flag: &str,
    ) -> anyhow::Result<bool>;
}

/// Flags from configuration: one default plus per-organisation overrides.
#[derive(Clone, Debug, Default)]
pub struct StaticFeatureFlags {
    default: bool,
    overrides: HashMap<(OrganizationId, String), bool>,
}

impl StaticFeatureFlags {
    pub fn new(default: bool) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(
        mut self,
        organization_id: OrganizationId,
        flag: impl Into<String>,
        enabled: bool,
    ) -> Self {
        self.overrides.insert((organization_id, flag.into()), enabled);
        self
    }
}

#[async_trait]
impl FeatureFlags for StaticFeatureFlags {
    async fn is_enabled(
        &self,
        organization_id: OrganizationId,
        flag: &str,
    ) -> anyhow::Result<bool> {
        Ok(self
            .overrides
            .get(&(organization_id, flag.to_string()))
            .copied()
            .unwrap_or(self.default))
    }
}

/// Creates jobs: validates the request, freezes the organisation's flags
/// into the job context, routes and enqueues.
pub struct JobSubmitter {
    fields: Arc<dyn FieldDirectory>,
    flags: Arc<dyn FeatureFlags>,
    router: JobRouter,
    queue: Arc<dyn JobQueue>,
    events: Arc<dyn JobEventPublisher>,
}

impl JobSubmitter {
    pub fn new(
        fields: Arc<dyn FieldDirectory>,
        flags: Arc<dyn FeatureFlags>,
        router: JobRouter,
        queue: Arc<dyn JobQueue>,
        events: Arc<dyn JobEventPublisher>,
    ) -> Self {
        Self {
            fields,
            flags,
            router,
            queue,
            events,
        }
    }

    pub async fn submit(
        &self,
        request: AnalysisRequest,
    ) -> Result<JobHandle, SubmitError> {
        validate(&request)?;
        let field = self
            .fields
            .get(request.field_id)
            .await?
            .ok_or(SubmitError::UnknownField(request.field_id))?;

        let sr_analytics_enabled = self
            .flags
            .is_enabled(field.organization_id, SR_ANALYTICS_FLAG)
            .await?;
        let context = JobContext {
            organization_id: field.organization_id,
            sr_analytics_enabled,
        };
        let queue = self.router.route(&request);
        let job = AnalysisJob::new(request, context, queue);
        let (job_id, field_id) = (job.id, job.field_id());

        let handle = self
            .queue
            .enqueue(job)
            .instrument(telemetry::enqueue_span(field_id, queue))
            .await?;

        let event = JobEvent::new(
            EventMeta::new(job_id, field_id, queue),
            JobEventPayload::Enqueued,
        );
        if let Err(err) = self.events.publish(event).await {
            tracing::error!("publish enqueue event failed: {err}");
        }
        telemetry::record_job_enqueued(queue, field_id);
        Ok(handle)
    }

    pub async fn status(&self, job_id: JobId) -> anyhow::Result<Option<JobStatusView>> {
        Ok(self.queue.get(job_id).await?.map(|job| job.view()))
    }

    /// Requests cancellation. Returns false when the job already finished.
    pub async fn cancel(&self, job_id: JobId) -> anyhow::Result<bool> {
        let Some(job) = self.queue.get(job_id).await? else {
            return Ok(false);
        };
        let accepted = self.queue.cancel(job_id).await?;
        if accepted {
            info!(%job_id, status = %job.status, "cancellation requested");
            let event = JobEvent::new(
                EventMeta::new(job_id, job.field_id(), job.queue),
                JobEventPayload::CancelRequested,
            );
            if let Err(err) = self.events.publish(event).await {
                tracing::error!("publish cancel event failed: {err}");
            }
        }
        Ok(accepted)
    }
}

fn validate(request: &AnalysisRequest) -> Result<(), SubmitError> {
    if let (Some(from), Some(to)) = (request.date_from, request.date_to)
        && from > to
    {
        return Err(SubmitError::InvalidRequest(format!(
            "date_from {from} is after date_to {to}"
        )));
    }
    if let Some(max_cloud) = request.max_cloud
        && !max_cloud.is_finite()
    {
        return Err(SubmitError::InvalidRequest(
            "max_cloud must be a finite number".into(),
        ));
    }
    if request.indices.as_ref().is_some_and(Vec::is_empty) {
        return Err(SubmitError::InvalidRequest(
            "indices, when given, must name at least one index".into(),
        ));
    }
    if request.scene_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
        return Err(SubmitError::InvalidRequest("scene_id is empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FieldId;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn static_flags_prefer_overrides() {
        let org = OrganizationId::new();
        let other = OrganizationId::new();
        let flags = StaticFeatureFlags::new(false).with_override(org, SR_ANALYTICS_FLAG, true);

        assert!(flags.is_enabled(org, SR_ANALYTICS_FLAG).await.unwrap());
        assert!(!flags.is_enabled(other, SR_ANALYTICS_FLAG).await.unwrap());
        assert!(!flags.is_enabled(org, "exports").await.unwrap());
    }

    #[test]
    fn inverted_date_range_is_rejected() {
        let request = AnalysisRequest {
            date_from: NaiveDate::from_ymd_opt(2026, 6, 10),
            date_to: NaiveDate::from_ymd_opt(2026, 6, 1),
            ..AnalysisRequest::for_field(FieldId::new())
        };
        assert!(matches!(
            validate(&request),
            Err(SubmitError::InvalidRequest(_))
        ));
    }

    #[test]
    fn empty_index_list_is_rejected() {
        let request = AnalysisRequest {
            indices: Some(Vec::new()),
            ..AnalysisRequest::for_field(FieldId::new())
        };
        assert!(validate(&request).is_err());
        assert!(validate(&AnalysisRequest::for_field(FieldId::new())).is_ok());
    }
}
