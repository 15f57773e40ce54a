use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::alerts::{Alert, AlertId, AlertStore};
use crate::error::{AlertError, TransitionError};
use crate::job::{AnalysisJob, FieldId, JobHandle, JobId, JobResult, JobStatus, OrganizationId};
use crate::lease::{ClaimRequest, JobLease, LeaseId};
use crate::observation::{Observation, ObservationStore};
use crate::orchestrator::reason;
use crate::queue::{JobCompletion, JobQueue, QueueName, QueueSnapshot};

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, AnalysisJob>,
    /// QUEUED job ids in enqueue order.
    pending: VecDeque<JobId>,
    leases: HashMap<JobId, (LeaseId, String)>,
    running_fields: HashSet<FieldId>,
}

/// Process-local job queue. One mutex guards the whole state, so a claim
/// checks and flips status in a single critical section.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: AnalysisJob) -> anyhow::Result<JobHandle> {
        if job.status != JobStatus::Queued {
            anyhow::bail!("job {} enqueued with status {}", job.id, job.status);
        }
        let handle = JobHandle {
            id: job.id,
            queue: job.queue,
        };
        let mut state = self.state.lock();
        if state.jobs.contains_key(&job.id) {
            anyhow::bail!("job {} already enqueued", job.id);
        }
        state.pending.push_back(job.id);
        state.jobs.insert(job.id, job);
        Ok(handle)
    }

    async fn claim(
        &self,
        request: ClaimRequest,
    ) -> anyhow::Result<Option<JobLease>> {
        let mut state = self.state.lock();
        let QueueState {
            jobs,
            pending,
            leases,
            running_fields,
        } = &mut *state;

        let position = pending.iter().position(|id| {
            jobs.get(id).is_some_and(|job| {
                job.queue == request.queue
                    && job.status == JobStatus::Queued
                    && !job.cancel_requested
                    && !running_fields.contains(&job.field_id())
            })
        });
        let Some(job_id) = position.and_then(|index| pending.remove(index))
        else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        job.status = JobStatus::Running;
        job.updated_at = Utc::now();
        running_fields.insert(job.field_id());
        let lease = JobLease::new(job.clone(), request.worker_id);
        leases.insert(job_id, (lease.lease_id, lease.worker_id.clone()));
        Ok(Some(lease))
    }

    async fn complete(
        &self,
        lease: &JobLease,
        completion: JobCompletion,
    ) -> anyhow::Result<AnalysisJob> {
        let mut state = self.state.lock();
        let owned = state
            .leases
            .get(&lease.job_id)
            .is_some_and(|(lease_id, _)| *lease_id == lease.lease_id);

        let job = state
            .jobs
            .get(&lease.job_id)
            .ok_or(TransitionError::UnknownJob(lease.job_id))?;
        if !owned {
            if job.status.is_terminal() {
                return Err(TransitionError::Illegal {
                    job_id: job.id,
                    from: job.status,
                    to: completion.status,
                }
                .into());
            }
            return Err(TransitionError::NotLeaseOwner {
                job_id: job.id,
                worker_id: lease.worker_id.clone(),
            }
            .into());
        }
        if !completion.status.is_terminal()
            || !job.status.can_transition_to(completion.status)
        {
            return Err(TransitionError::Illegal {
                job_id: job.id,
                from: job.status,
                to: completion.status,
            }
            .into());
        }

        let field_id = job.field_id();
        state.leases.remove(&lease.job_id);
        state.running_fields.remove(&field_id);
        let job = state
            .jobs
            .get_mut(&lease.job_id)
            .ok_or(TransitionError::UnknownJob(lease.job_id))?;
        job.status = completion.status;
        job.result = completion.result;
        job.error_message = completion.error_message;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn cancel(&self, job_id: JobId) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        match job.status {
            JobStatus::Queued => {
                job.cancel_requested = true;
                job.status = JobStatus::Failed;
                job.error_message = Some(reason::CANCELLED.to_string());
                job.result = Some(JobResult::with_reason(reason::CANCELLED));
                job.updated_at = Utc::now();
                state.pending.retain(|id| *id != job_id);
                Ok(true)
            }
            JobStatus::Running => {
                job.cancel_requested = true;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, job_id: JobId) -> anyhow::Result<Option<AnalysisJob>> {
        Ok(self.state.lock().jobs.get(&job_id).cloned())
    }

    async fn jobs_for_field(
        &self,
        field_id: FieldId,
    ) -> anyhow::Result<Vec<AnalysisJob>> {
        let state = self.state.lock();
        let mut jobs: Vec<AnalysisJob> = state
            .jobs
            .values()
            .filter(|job| job.field_id() == field_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        Ok(jobs)
    }

    async fn queue_depth(&self, queue: QueueName) -> anyhow::Result<usize> {
        let state = self.state.lock();
        Ok(state
            .pending
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| job.queue == queue)
            .count())
    }

    async fn snapshot(&self) -> anyhow::Result<QueueSnapshot> {
        let state = self.state.lock();
        let mut snapshot = QueueSnapshot::new(Utc::now());
        for queue in QueueName::ALL {
            snapshot.entry_mut(queue);
        }
        for job in state.jobs.values() {
            snapshot.entry_mut(job.queue).record(job.status);
        }
        Ok(snapshot)
    }
}

/// Observation timeline held in memory.
#[derive(Debug, Default)]
pub struct InMemoryObservationStore {
    observations: Mutex<Vec<Observation>>,
}

impl InMemoryObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_job(&self, job_id: JobId) -> Vec<Observation> {
        self.observations
            .lock()
            .iter()
            .filter(|o| o.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.observations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObservationStore for InMemoryObservationStore {
    async fn insert(&self, observation: &Observation) -> anyhow::Result<()> {
        let mut observations = self.observations.lock();
        if observations.iter().any(|o| o.job_id == observation.job_id) {
            anyhow::bail!("job {} already has an observation", observation.job_id);
        }
        observations.push(observation.clone());
        Ok(())
    }

    async fn recent_for_field(
        &self,
        field_id: FieldId,
        limit: usize,
    ) -> anyhow::Result<Vec<Observation>> {
        let mut found: Vec<Observation> = self
            .observations
            .lock()
            .iter()
            .filter(|o| o.field_id == field_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            b.observed_on
                .cmp(&a.observed_on)
                .then(b.created_at.cmp(&a.created_at))
        });
        found.truncate(limit);
        Ok(found)
    }

    async fn clear_field(&self, field_id: FieldId) -> anyhow::Result<u64> {
        let mut observations = self.observations.lock();
        let before = observations.len();
        observations.retain(|o| o.field_id != field_id);
        Ok((before - observations.len()) as u64)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAlertStore {
    alerts: Mutex<Vec<Alert>>,
}

impl InMemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

#[async_trait]
impl AlertStore for InMemoryAlertStore {
    async fn insert(&self, alert: &Alert) -> anyhow::Result<()> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }

    async fn acknowledge(
        &self,
        alert_id: AlertId,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Alert> {
        let mut alerts = self.alerts.lock();
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| AlertError::NotFound(alert_id.to_string()))?;
        alert.acknowledge(at)?;
        Ok(alert.clone())
    }

    async fn list(
        &self,
        organization_id: OrganizationId,
        unacknowledged_only: bool,
    ) -> anyhow::Result<Vec<Alert>> {
        let mut found: Vec<Alert> = self
            .alerts
            .lock()
            .iter()
            .filter(|a| a.organization_id == organization_id)
            .filter(|a| !unacknowledged_only || !a.is_acknowledged())
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertCategory, Severity};
    use crate::job::{AnalysisRequest, JobContext};

    fn job_for(field_id: FieldId, queue: QueueName) -> AnalysisJob {
        AnalysisJob::new(
            AnalysisRequest::for_field(field_id),
            JobContext {
                organization_id: OrganizationId::new(),
                sr_analytics_enabled: false,
            },
            queue,
        )
    }

    fn done(status: JobStatus) -> JobCompletion {
        JobCompletion {
            status,
            result: Some(JobResult::default()),
            error_message: None,
        }
    }

    #[tokio::test]
    async fn claims_follow_enqueue_order_per_queue() {
        let queue = InMemoryJobQueue::new();
        let first = job_for(FieldId::new(), QueueName::AnalysisCpu);
        let gpu = job_for(FieldId::new(), QueueName::SrGpu);
        let second = job_for(FieldId::new(), QueueName::AnalysisCpu);
        let (first_id, second_id, gpu_id) = (first.id, second.id, gpu.id);
        for job in [first, gpu, second] {
            queue.enqueue(job).await.unwrap();
        }

        let claim = |q| ClaimRequest::new(q, "w0");
        let a = queue.claim(claim(QueueName::AnalysisCpu)).await.unwrap().unwrap();
        let b = queue.claim(claim(QueueName::AnalysisCpu)).await.unwrap().unwrap();
        let c = queue.claim(claim(QueueName::SrGpu)).await.unwrap().unwrap();
        assert_eq!((a.job_id, b.job_id, c.job_id), (first_id, second_id, gpu_id));
        assert_eq!(a.job.status, JobStatus::Running);
        assert!(queue.claim(claim(QueueName::AnalysisCpu)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn one_running_job_per_field() {
        let queue = InMemoryJobQueue::new();
        let field = FieldId::new();
        queue.enqueue(job_for(field, QueueName::AnalysisCpu)).await.unwrap();
        queue.enqueue(job_for(field, QueueName::SrGpu)).await.unwrap();

        let lease = queue
            .claim(ClaimRequest::new(QueueName::AnalysisCpu, "cpu-w0"))
            .await
            .unwrap()
            .unwrap();
        assert!(queue
            .claim(ClaimRequest::new(QueueName::SrGpu, "gpu-w0"))
            .await
            .unwrap()
            .is_none());

        queue.complete(&lease, done(JobStatus::Succeeded)).await.unwrap();
        assert!(queue
            .claim(ClaimRequest::new(QueueName::SrGpu, "gpu-w0"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn terminal_status_is_written_once_by_the_owner() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(job_for(FieldId::new(), QueueName::AnalysisCpu)).await.unwrap();
        let lease = queue
            .claim(ClaimRequest::new(QueueName::AnalysisCpu, "w0"))
            .await
            .unwrap()
            .unwrap();

        let mut forged = lease.clone();
        forged.lease_id = LeaseId::new();
        forged.worker_id = "intruder".into();
        let err = queue.complete(&forged, done(JobStatus::Failed)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransitionError>(),
            Some(TransitionError::NotLeaseOwner { .. })
        ));

        let err = queue.complete(&lease, done(JobStatus::Running)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransitionError>(),
            Some(TransitionError::Illegal { .. })
        ));

        let job = queue.complete(&lease, done(JobStatus::Skipped)).await.unwrap();
        assert_eq!(job.status, JobStatus::Skipped);

        let err = queue.complete(&lease, done(JobStatus::Succeeded)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransitionError>(),
            Some(TransitionError::Illegal {
                from: JobStatus::Skipped,
                ..
            })
        ));
        let stored = queue.get(lease.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Skipped);
    }

    #[tokio::test]
    async fn cancelled_queued_job_is_never_claimed() {
        let queue = InMemoryJobQueue::new();
        let job = job_for(FieldId::new(), QueueName::AnalysisCpu);
        let job_id = job.id;
        queue.enqueue(job).await.unwrap();

        assert!(queue.cancel(job_id).await.unwrap());
        assert!(queue
            .claim(ClaimRequest::new(QueueName::AnalysisCpu, "w0"))
            .await
            .unwrap()
            .is_none());

        let job = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("cancelled"));
        assert!(!queue.cancel(job_id).await.unwrap());
        assert_eq!(queue.queue_depth(QueueName::AnalysisCpu).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn snapshot_counts_statuses() {
        let queue = InMemoryJobQueue::new();
        for _ in 0..3 {
            queue.enqueue(job_for(FieldId::new(), QueueName::AnalysisCpu)).await.unwrap();
        }
        let lease = queue
            .claim(ClaimRequest::new(QueueName::AnalysisCpu, "w0"))
            .await
            .unwrap()
            .unwrap();
        queue.complete(&lease, done(JobStatus::Failed)).await.unwrap();

        let snapshot = queue.snapshot().await.unwrap();
        let cpu = &snapshot.queues["analysis_cpu"];
        assert_eq!((cpu.queued, cpu.failed), (2, 1));
        assert!(snapshot.queues.contains_key("exports"));
    }

    #[tokio::test]
    async fn alerts_acknowledge_once() {
        let store = InMemoryAlertStore::new();
        let org = OrganizationId::new();
        let alert = Alert::new(
            org,
            None,
            Severity::Warn,
            AlertCategory::LowQualitySkipped,
            "skipped",
            serde_json::json!({}),
        );
        store.insert(&alert).await.unwrap();

        let acked = store.acknowledge(alert.id, Utc::now()).await.unwrap();
        assert!(acked.is_acknowledged());
        let err = store.acknowledge(alert.id, Utc::now()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AlertError>(),
            Some(AlertError::AlreadyAcknowledged(_))
        ));
        assert!(store.list(org, true).await.unwrap().is_empty());
        assert_eq!(store.list(org, false).await.unwrap().len(), 1);
    }
}
