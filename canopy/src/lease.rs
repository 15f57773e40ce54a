use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{AnalysisJob, JobId};
use crate::queue::QueueName;

crate::job::uuid_id!(
    /// Unique identifier for a claim on a job.
    LeaseId
);

/// Proof of ownership of a RUNNING job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobLease {
    pub job_id: JobId,
    pub lease_id: LeaseId,
    /// The job as it was at claim time (status RUNNING).
    pub job: AnalysisJob,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
}

impl JobLease {
    pub fn new(job: AnalysisJob, worker_id: impl Into<String>) -> Self {
        Self {
            job_id: job.id,
            lease_id: LeaseId::new(),
            job,
            worker_id: worker_id.into(),
            claimed_at: Utc::now(),
        }
    }

    pub fn queue(&self) -> QueueName {
        self.job.queue
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub queue: QueueName,
    pub worker_id: String,
}

impl ClaimRequest {
    pub fn new(queue: QueueName, worker_id: impl Into<String>) -> Self {
        Self {
            queue,
            worker_id: worker_id.into(),
        }
    }
}
