use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display};

use crate::job::{AnalysisJob, FieldId, JobHandle, JobId, JobResult, JobStatus};
use crate::lease::{ClaimRequest, JobLease};

/// Named queues. Each has its own worker pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    AnalysisCpu,
    SrGpu,
    /// Reserved for export rendering; no pool consumes it here.
    Exports,
}

impl QueueName {
    pub const ALL: [QueueName; 3] =
        [QueueName::AnalysisCpu, QueueName::SrGpu, QueueName::Exports];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnalysisCpu => "analysis_cpu",
            Self::SrGpu => "sr_gpu",
            Self::Exports => "exports",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|queue| queue.as_str() == value)
    }
}

impl Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal write issued by the lease owner.
#[derive(Clone, Debug, PartialEq)]
pub struct JobCompletion {
    pub status: JobStatus,
    pub result: Option<JobResult>,
    pub error_message: Option<String>,
}

/// Queue backends: visibility, atomic claims and terminal writes.
///
/// A claim moves QUEUED -> RUNNING in one step and never hands out a job
/// whose field already has a RUNNING job. Only the lease holder may
/// complete a job, and only once.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Makes a QUEUED job visible to its queue's workers.
    async fn enqueue(&self, job: AnalysisJob) -> anyhow::Result<JobHandle>;

    /// Claims the oldest eligible job of `request.queue`.
    async fn claim(
        &self,
        request: ClaimRequest,
    ) -> anyhow::Result<Option<JobLease>>;

    /// Writes the terminal status. Fails with
    /// [`TransitionError`](crate::error::TransitionError) when the caller
    /// does not own the lease or the move is illegal.
    async fn complete(
        &self,
        lease: &JobLease,
        completion: JobCompletion,
    ) -> anyhow::Result<AnalysisJob>;

    /// Cancels a job. QUEUED jobs end FAILED with `"cancelled"` at once;
    /// RUNNING jobs only get the flag. Returns false for terminal jobs.
    async fn cancel(&self, job_id: JobId) -> anyhow::Result<bool>;

    async fn get(&self, job_id: JobId) -> anyhow::Result<Option<AnalysisJob>>;

    async fn jobs_for_field(
        &self,
        field_id: FieldId,
    ) -> anyhow::Result<Vec<AnalysisJob>>;

    /// Number of QUEUED jobs on `queue`.
    async fn queue_depth(&self, queue: QueueName) -> anyhow::Result<usize>;

    async fn snapshot(&self) -> anyhow::Result<QueueSnapshot>;
}

/// Snapshot of queue state at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub queues: HashMap<String, QueueSnapshotEntry>,
}

impl QueueSnapshot {
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            queues: HashMap::new(),
        }
    }

    pub fn entry_mut(&mut self, queue: QueueName) -> &mut QueueSnapshotEntry {
        self.queues.entry(queue.as_str().to_string()).or_default()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueSnapshotEntry {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl QueueSnapshotEntry {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Skipped => self.skipped += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}
