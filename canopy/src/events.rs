use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::alerts::{AlertCategory, AlertId, Severity};
use crate::job::{FieldId, JobId, JobStatus};
use crate::lease::LeaseId;
use crate::observation::ObservationId;
use crate::queue::QueueName;

/// Metadata envelope attached to every job event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub job_id: JobId,
    pub field_id: FieldId,
    pub queue: QueueName,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(job_id: JobId, field_id: FieldId, queue: QueueName) -> Self {
        Self {
            version: 1,
            job_id,
            field_id,
            queue,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    pub fn new(meta: EventMeta, payload: JobEventPayload) -> Self {
        Self { meta, payload }
    }

    /// Status implied by the event, if it marks a transition.
    pub fn status(&self) -> Option<JobStatus> {
        match &self.payload {
            JobEventPayload::Enqueued => Some(JobStatus::Queued),
            JobEventPayload::Started { .. } => Some(JobStatus::Running),
            JobEventPayload::Succeeded { .. } => Some(JobStatus::Succeeded),
            JobEventPayload::Skipped { .. } => Some(JobStatus::Skipped),
            JobEventPayload::Failed { .. } => Some(JobStatus::Failed),
            JobEventPayload::CancelRequested => None,
        }
    }
}

/// Lifecycle transitions of an analysis job.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum JobEventPayload {
    Enqueued,
    Started {
        lease_id: LeaseId,
        worker_id: String,
        device: Option<u32>,
    },
    Succeeded {
        observation_id: Option<ObservationId>,
        sr_degraded: bool,
    },
    Skipped {
        reason: String,
    },
    Failed {
        error: String,
    },
    CancelRequested,
}

/// Events about what a job produced.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum PipelineEvent {
    ObservationRecorded {
        observation_id: ObservationId,
        field_id: FieldId,
        job_id: JobId,
    },
    AlertRaised {
        alert_id: AlertId,
        field_id: Option<FieldId>,
        severity: Severity,
        category: AlertCategory,
    },
}

/// Publisher seam used by the runtime and the job submitter.
#[async_trait]
pub trait JobEventPublisher: Send + Sync {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()>;

    async fn publish_pipeline(&self, event: PipelineEvent)
    -> anyhow::Result<()>;

    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent>;
}

/// In-process fan-out over tokio broadcast channels.
///
/// Publishing never blocks; slow subscribers observe
/// `RecvError::Lagged` instead of holding up workers.
pub struct InProcEventBus {
    job_sender: broadcast::Sender<JobEvent>,
    pipeline_sender: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("job_subscribers", &self.job_sender.receiver_count())
            .field(
                "pipeline_subscribers",
                &self.pipeline_sender.receiver_count(),
            )
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (job_sender, _) = broadcast::channel(capacity);
        let (pipeline_sender, _) = broadcast::channel(capacity);
        Self {
            job_sender,
            pipeline_sender,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn job_subscriber_count(&self) -> usize {
        self.job_sender.receiver_count()
    }

    /// Events with no subscriber are dropped.
    pub fn publish_job(&self, event: JobEvent) {
        let _ = self.job_sender.send(event);
    }

    pub fn publish_pipeline_event(&self, event: PipelineEvent) {
        let _ = self.pipeline_sender.send(event);
    }

    pub fn subscribe_pipeline(&self) -> broadcast::Receiver<PipelineEvent> {
        self.pipeline_sender.subscribe()
    }
}

#[async_trait]
impl JobEventPublisher for InProcEventBus {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()> {
        self.publish_job(event);
        Ok(())
    }

    async fn publish_pipeline(
        &self,
        event: PipelineEvent,
    ) -> anyhow::Result<()> {
        self.publish_pipeline_event(event);
        Ok(())
    }

    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.job_sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn enqueued() -> JobEvent {
        JobEvent::new(
            EventMeta::new(JobId::new(), FieldId::new(), QueueName::AnalysisCpu),
            JobEventPayload::Enqueued,
        )
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let bus = InProcEventBus::new(16);
        let mut rx1 = bus.subscribe_jobs();
        let mut rx2 = bus.subscribe_jobs();

        for _ in 0..3 {
            bus.publish(enqueued()).await.unwrap();
        }

        for _ in 0..3 {
            let a = timeout(Duration::from_millis(100), rx1.recv()).await;
            let b = timeout(Duration::from_millis(100), rx2.recv()).await;
            assert!(matches!(a, Ok(Ok(_))));
            assert!(matches!(b, Ok(Ok(_))));
        }
    }

    #[tokio::test]
    async fn lagged_subscriber_does_not_block_publisher() {
        let bus = InProcEventBus::new(2);
        let mut rx = bus.subscribe_jobs();

        for _ in 0..5 {
            bus.publish_job(enqueued());
        }

        let result = timeout(Duration::from_millis(100), rx.recv()).await;
        match result.expect("receiver responds") {
            Err(broadcast::error::RecvError::Lagged(_)) | Ok(_) => {}
            Err(broadcast::error::RecvError::Closed) => {
                panic!("channel should not be closed")
            }
        }
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_ok() {
        let bus = InProcEventBus::new(4);
        assert_eq!(bus.job_subscriber_count(), 0);
        bus.publish(enqueued()).await.unwrap();
        bus.publish_pipeline(PipelineEvent::ObservationRecorded {
            observation_id: ObservationId::new(),
            field_id: FieldId::new(),
            job_id: JobId::new(),
        })
        .await
        .unwrap();
    }

    #[test]
    fn event_status_mapping() {
        let mut event = enqueued();
        assert_eq!(event.status(), Some(JobStatus::Queued));
        event.payload = JobEventPayload::Skipped {
            reason: "cloud".into(),
        };
        assert_eq!(event.status(), Some(JobStatus::Skipped));
        event.payload = JobEventPayload::CancelRequested;
        assert_eq!(event.status(), None);

        let json = serde_json::to_value(&enqueued()).unwrap();
        assert_eq!(json["payload"]["type"], "enqueued");
    }
}
