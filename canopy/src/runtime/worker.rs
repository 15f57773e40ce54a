use serde::{Deserialize, Serialize};

use crate::budget::Workload;
use crate::queue::QueueName;

/// Configuration for one worker task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// `"{queue}-{pid}-w{index}"`.
    pub worker_id: String,
    pub queue: QueueName,
    /// Accelerator ordinal for `sr_gpu` workers.
    pub device: Option<u32>,
    /// Sleep when the queue is empty or the budget is exhausted, in
    /// milliseconds.
    pub poll_interval_ms: u64,
    /// Sleep after a queue error, in milliseconds.
    pub backoff_ms: u64,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>, queue: QueueName) -> Self {
        Self {
            worker_id: worker_id.into(),
            queue,
            device: None,
            poll_interval_ms: 200,
            backoff_ms: 1000,
        }
    }

    pub fn with_device(mut self, device: Option<u32>) -> Self {
        self.device = device;
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_backoff(mut self, ms: u64) -> Self {
        self.backoff_ms = ms;
        self
    }

    /// Budget this worker draws from before each claim.
    pub fn workload(&self) -> Workload {
        match self.device {
            Some(device) => Workload::Accelerator(device),
            None => Workload::Cpu,
        }
    }
}
