use std::fmt;
use std::sync::Arc;

use super::supervisor::{AnalysisRuntime, JobDispatcher, RuntimeConfig};
use crate::budget::{Budget, BudgetConfig, InMemoryBudget, Workload};
use crate::events::JobEventPublisher;
use crate::queue::JobQueue;

/// Builder for an [`AnalysisRuntime`] with explicit dependencies.
///
/// The budget is optional; without one the builder sizes an
/// [`InMemoryBudget`] from the runtime config (one CPU slot per
/// analysis worker, `per_device_concurrency` slots per accelerator).
///
/// ```ignore
/// let runtime = AnalysisRuntimeBuilder::new(config)
///     .with_queue(queue)
///     .with_dispatcher(orchestrator)
///     .with_events(bus)
///     .build()?;
/// ```
pub struct AnalysisRuntimeBuilder {
    config: RuntimeConfig,
    queue: Option<Arc<dyn JobQueue>>,
    budget: Option<Arc<dyn Budget<Workload>>>,
    dispatcher: Option<Arc<dyn JobDispatcher>>,
    events: Option<Arc<dyn JobEventPublisher>>,
}

impl fmt::Debug for AnalysisRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisRuntimeBuilder")
            .field("config", &self.config)
            .field("queue_set", &self.queue.is_some())
            .field("budget_set", &self.budget.is_some())
            .field("dispatcher_set", &self.dispatcher.is_some())
            .field("events_set", &self.events.is_some())
            .finish()
    }
}

impl AnalysisRuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            queue: None,
            budget: None,
            dispatcher: None,
            events: None,
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_budget(mut self, budget: Arc<dyn Budget<Workload>>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn JobDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn JobEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// # Errors
    ///
    /// Returns an error if the config is invalid or a required dependency
    /// is missing.
    pub fn build(self) -> anyhow::Result<AnalysisRuntime> {
        self.config.validate()?;
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue dependency missing"))?;
        let dispatcher = self
            .dispatcher
            .ok_or_else(|| anyhow::anyhow!("dispatcher dependency missing"))?;
        let events = self
            .events
            .ok_or_else(|| anyhow::anyhow!("events dependency missing"))?;
        let budget = self.budget.unwrap_or_else(|| {
            Arc::new(InMemoryBudget::new(BudgetConfig::for_devices(
                self.config.accelerator_devices,
                self.config.per_device_concurrency,
                self.config.analysis_cpu_workers,
            )))
        });

        Ok(AnalysisRuntime::new(
            self.config,
            queue,
            budget,
            dispatcher,
            events,
        ))
    }
}
