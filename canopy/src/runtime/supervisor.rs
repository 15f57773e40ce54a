use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::Instrument;

use super::worker::WorkerConfig;
use crate::budget::{Budget, Workload};
use crate::error::ConfigError;
use crate::events::{EventMeta, JobEvent, JobEventPayload, JobEventPublisher, PipelineEvent};
use crate::job::JobStatus;
use crate::lease::{ClaimRequest, JobLease};
use crate::orchestrator::JobOutcome;
use crate::queue::{JobQueue, QueueName};
use crate::telemetry;

/// Attempts at writing a job's terminal status before it is failed outright.
const COMPLETION_ATTEMPTS: u32 = 5;
const COMPLETION_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Worker pool sizing and polling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub analysis_cpu_workers: usize,
    /// Accelerators available to the `sr_gpu` pool. Zero disables it.
    pub accelerator_devices: u32,
    /// Concurrent SR jobs allowed per device.
    pub per_device_concurrency: usize,
    pub poll_interval_ms: u64,
    pub backoff_ms: u64,
    /// Interval of the queue depth sampler.
    pub monitor_interval_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            analysis_cpu_workers: 4,
            accelerator_devices: 0,
            per_device_concurrency: 1,
            poll_interval_ms: 200,
            backoff_ms: 1000,
            monitor_interval_ms: 5000,
            shutdown_timeout_secs: 30,
            event_capacity: 1024,
        }
    }
}

impl RuntimeConfig {
    pub fn sr_gpu_workers(&self) -> usize {
        self.accelerator_devices as usize * self.per_device_concurrency
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("runtime.analysis_cpu_workers", self.analysis_cpu_workers as u64),
            (
                "runtime.per_device_concurrency",
                self.per_device_concurrency as u64,
            ),
            ("runtime.poll_interval_ms", self.poll_interval_ms),
            ("runtime.monitor_interval_ms", self.monitor_interval_ms),
            ("runtime.event_capacity", self.event_capacity as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be positive".into(),
                });
            }
        }
        Ok(())
    }
}

/// Where a job is running.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchContext {
    pub worker_id: String,
    pub device: Option<u32>,
}

/// Runs a claimed job to a terminal outcome.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, lease: &JobLease, ctx: &DispatchContext) -> JobOutcome;
}

/// Token for signaling graceful shutdown to workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Sleeps for `duration`; returns false if shutdown interrupted it.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker pools over the analysis queues.
///
/// Each worker takes its budget token first, then claims, dispatches,
/// writes the terminal status and publishes events, and releases the
/// token last. An `sr_gpu` worker is pinned to one device, so a device
/// never runs more than `per_device_concurrency` jobs.
pub struct AnalysisRuntime {
    config: RuntimeConfig,
    queue: Arc<dyn JobQueue>,
    budget: Arc<dyn Budget<Workload>>,
    dispatcher: Arc<dyn JobDispatcher>,
    events: Arc<dyn JobEventPublisher>,
    shutdown_token: ShutdownToken,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl fmt::Debug for AnalysisRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("AnalysisRuntime")
            .field("config", &self.config)
            .field("worker_count", &worker_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl AnalysisRuntime {
    pub fn new(
        config: RuntimeConfig,
        queue: Arc<dyn JobQueue>,
        budget: Arc<dyn Budget<Workload>>,
        dispatcher: Arc<dyn JobDispatcher>,
        events: Arc<dyn JobEventPublisher>,
    ) -> Self {
        Self {
            config,
            queue,
            budget,
            dispatcher,
            events,
            shutdown_token: ShutdownToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn queue(&self) -> Arc<dyn JobQueue> {
        Arc::clone(&self.queue)
    }

    pub fn budget(&self) -> Arc<dyn Budget<Workload>> {
        Arc::clone(&self.budget)
    }

    pub fn events(&self) -> Arc<dyn JobEventPublisher> {
        Arc::clone(&self.events)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Spawns the configured pools and the queue depth sampler.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.spawn_worker_pool(
            QueueName::AnalysisCpu,
            self.config.analysis_cpu_workers,
        )
        .await;
        if self.config.accelerator_devices > 0 {
            self.spawn_worker_pool(QueueName::SrGpu, self.config.sr_gpu_workers())
                .await;
        }
        self.spawn_queue_monitor().await;
        tracing::info!(
            analysis_cpu = self.config.analysis_cpu_workers,
            sr_gpu = self.config.sr_gpu_workers(),
            "analysis runtime started"
        );
        Ok(())
    }

    /// Signals shutdown and waits for in-flight jobs to finish.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of analysis runtime");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let limit = Duration::from_secs(self.config.shutdown_timeout_secs);
        for handle in handles {
            match tokio::time::timeout(limit, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Worker task failed: {:?}", e),
                Err(_) => {
                    tracing::warn!("Worker task timed out during shutdown")
                }
            }
        }

        tracing::info!("Analysis runtime shutdown complete");
        Ok(())
    }

    /// Spawns `parallelism` workers on `queue`. `sr_gpu` workers are
    /// assigned devices round-robin.
    pub async fn spawn_worker_pool(&self, queue: QueueName, parallelism: usize) {
        let worker_group = format!("{}-{}", queue, std::process::id());
        let devices = self.config.accelerator_devices;

        for i in 0..parallelism {
            let device = match queue {
                QueueName::SrGpu if devices > 0 => Some(i as u32 % devices),
                _ => None,
            };
            let worker = WorkerConfig::new(format!("{}-w{}", worker_group, i), queue)
                .with_device(device)
                .with_poll_interval(self.config.poll_interval_ms)
                .with_backoff(self.config.backoff_ms);

            let q = Arc::clone(&self.queue);
            let b = Arc::clone(&self.budget);
            let d = Arc::clone(&self.dispatcher);
            let e = Arc::clone(&self.events);
            let shutdown = self.shutdown_token.clone();

            let handle = tokio::spawn(async move {
                Self::worker_loop(worker, q, b, d, e, shutdown).await;
            });

            let mut handles = self.worker_handles.lock().await;
            handles.push(handle);
        }
    }

    async fn spawn_queue_monitor(&self) {
        let q = Arc::clone(&self.queue);
        let interval = Duration::from_millis(self.config.monitor_interval_ms);
        let shutdown = self.shutdown_token.clone();

        let handle = tokio::spawn(async move {
            loop {
                for queue in QueueName::ALL {
                    match q.queue_depth(queue).await {
                        Ok(depth) => telemetry::set_queue_depth(queue, depth),
                        Err(err) => {
                            tracing::warn!(%queue, "queue depth sample failed: {err}")
                        }
                    }
                }
                if !shutdown.sleep(interval).await {
                    tracing::debug!("Queue monitor shutting down");
                    break;
                }
            }
        });
        self.worker_handles.lock().await.push(handle);
    }

    async fn worker_loop(
        worker: WorkerConfig,
        queue: Arc<dyn JobQueue>,
        budget: Arc<dyn Budget<Workload>>,
        dispatcher: Arc<dyn JobDispatcher>,
        events: Arc<dyn JobEventPublisher>,
        shutdown: ShutdownToken,
    ) {
        let idle = Duration::from_millis(worker.poll_interval_ms);
        let backoff = Duration::from_millis(worker.backoff_ms);
        let workload = worker.workload();

        loop {
            if shutdown.is_cancelled() {
                tracing::info!("Worker {} shutting down", worker.worker_id);
                break;
            }

            let token = match budget.try_acquire(workload, &worker.worker_id).await {
                Ok(Some(token)) => token,
                Ok(None) => {
                    shutdown.sleep(idle).await;
                    continue;
                }
                Err(err) => {
                    tracing::error!(worker_id = %worker.worker_id, "budget acquire error: {err}");
                    shutdown.sleep(backoff).await;
                    continue;
                }
            };

            let claimed = queue
                .claim(ClaimRequest::new(worker.queue, worker.worker_id.clone()))
                .instrument(telemetry::claim_span(worker.queue, &worker.worker_id))
                .await;

            let pause = match claimed {
                Ok(Some(lease)) => {
                    Self::process(&worker, lease, &queue, &dispatcher, &events)
                        .await;
                    None
                }
                Ok(None) => Some(idle),
                Err(err) => {
                    tracing::warn!(worker_id = %worker.worker_id, "claim error: {err}");
                    Some(backoff)
                }
            };

            if let Err(err) = budget.release(token).await {
                tracing::error!("budget release error: {err}");
            }
            if let Some(pause) = pause {
                shutdown.sleep(pause).await;
            }
        }
    }

    async fn process(
        worker: &WorkerConfig,
        lease: JobLease,
        queue: &Arc<dyn JobQueue>,
        dispatcher: &Arc<dyn JobDispatcher>,
        events: &Arc<dyn JobEventPublisher>,
    ) {
        let job_id = lease.job_id;
        let field_id = lease.job.field_id();
        let started = Instant::now();
        let span = telemetry::dispatch_span(job_id, field_id, worker.queue, &worker.worker_id);

        let started_event = JobEvent::new(
            EventMeta::new(job_id, field_id, worker.queue),
            JobEventPayload::Started {
                lease_id: lease.lease_id,
                worker_id: worker.worker_id.clone(),
                device: worker.device,
            },
        );
        if let Err(err) = events.publish(started_event).await {
            tracing::error!("publish start event failed: {err}");
        }

        let ctx = DispatchContext {
            worker_id: worker.worker_id.clone(),
            device: worker.device,
        };
        let task = {
            let dispatcher = Arc::clone(dispatcher);
            let lease = lease.clone();
            tokio::spawn(
                async move { dispatcher.dispatch(&lease, &ctx).await }.instrument(span),
            )
        };
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(%job_id, "dispatch task aborted: {err}");
                JobOutcome::aborted(format!("dispatch task aborted: {err}"))
            }
        };

        let Some(outcome) = Self::commit(worker, &lease, outcome, queue).await else {
            return;
        };
        telemetry::record_job_finished(worker.queue, outcome.status, started.elapsed());

        let payload = match outcome.status {
            JobStatus::Succeeded => JobEventPayload::Succeeded {
                observation_id: outcome.observation.as_ref().map(|o| o.id),
                sr_degraded: outcome.result.sr_error.is_some(),
            },
            JobStatus::Skipped => JobEventPayload::Skipped {
                reason: outcome.result.reason.clone().unwrap_or_default(),
            },
            _ => JobEventPayload::Failed {
                error: outcome.error_message.clone().unwrap_or_default(),
            },
        };
        let event = JobEvent::new(EventMeta::new(job_id, field_id, worker.queue), payload);
        if let Err(err) = events.publish(event).await {
            tracing::error!("publish terminal event failed: {err}");
        }

        if let Some(observation) = &outcome.observation {
            let event = PipelineEvent::ObservationRecorded {
                observation_id: observation.id,
                field_id,
                job_id,
            };
            if let Err(err) = events.publish_pipeline(event).await {
                tracing::error!("publish observation event failed: {err}");
            }
        }
        for alert in &outcome.alerts {
            let event = PipelineEvent::AlertRaised {
                alert_id: alert.id,
                field_id: alert.field_id,
                severity: alert.severity,
                category: alert.category,
            };
            if let Err(err) = events.publish_pipeline(event).await {
                tracing::error!("publish alert event failed: {err}");
            }
        }
    }

    /// Writes the terminal status, retrying with doubling backoff. When the
    /// outcome itself keeps being refused, the job is failed with a minimal
    /// result instead so the field is released. Returns the outcome that
    /// was stored, or `None` when nothing could be written.
    async fn commit(
        worker: &WorkerConfig,
        lease: &JobLease,
        outcome: JobOutcome,
        queue: &Arc<dyn JobQueue>,
    ) -> Option<JobOutcome> {
        let job_id = lease.job_id;
        let mut delay = Duration::from_millis(worker.backoff_ms.max(1));
        let mut last_error = String::new();

        for attempt in 1..=COMPLETION_ATTEMPTS {
            match queue.complete(lease, outcome.completion()).await {
                Ok(_) => return Some(outcome),
                Err(err) => {
                    tracing::warn!(%job_id, attempt, "queue complete error: {err}");
                    last_error = err.to_string();
                }
            }
            if attempt < COMPLETION_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(COMPLETION_BACKOFF_CAP);
            }
        }

        let fallback = outcome.write_failed(format!("terminal write failed: {last_error}"));
        match queue.complete(lease, fallback.completion()).await {
            Ok(_) => Some(fallback),
            Err(err) => {
                tracing::error!(
                    %job_id,
                    worker_id = %worker.worker_id,
                    "job left RUNNING, terminal write failed: {err}"
                );
                None
            }
        }
    }
}
