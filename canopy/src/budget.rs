use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::hash::Hash;
use std::sync::Arc;

pub trait WorkloadKind:
    Copy + Eq + Hash + Send + Sync + std::fmt::Debug + 'static
{
}

/// Compute classes that workers draw capacity from.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Workload {
    Cpu,
    /// One accelerator device, addressed by its ordinal.
    Accelerator(u32),
}

impl WorkloadKind for Workload {}

impl Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Accelerator(device) => write!(f, "accelerator:{device}"),
        }
    }
}

/// Capacity held by one worker for one dispatch. Hand it back through
/// [`Budget::release`] once the job reaches a terminal state.
#[derive(Debug)]
pub struct BudgetToken<W> {
    pub workload: W,
    /// Worker that holds the token.
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

impl<W> BudgetToken<W> {
    pub fn new(workload: W, holder: impl Into<String>) -> Self {
        Self {
            workload,
            holder: holder.into(),
            acquired_at: Utc::now(),
        }
    }
}

/// Per-workload slot counts. Workloads without an explicit entry get the
/// default.
#[derive(Debug, Clone)]
pub struct BudgetConfig<W> {
    slots: HashMap<W, usize>,
    fallback: usize,
}

impl<W: Eq + Hash + Clone> BudgetConfig<W> {
    pub fn with_default(fallback: usize) -> Self {
        Self {
            slots: HashMap::new(),
            fallback,
        }
    }

    pub fn with_limit(mut self, workload: W, slots: usize) -> Self {
        self.slots.insert(workload, slots);
        self
    }

    pub fn limit(&self, workload: &W) -> usize {
        self.slots.get(workload).copied().unwrap_or(self.fallback)
    }
}

impl BudgetConfig<Workload> {
    /// One slot set per accelerator device, `per_device` jobs at a time.
    pub fn for_devices(
        devices: u32,
        per_device: usize,
        cpu_limit: usize,
    ) -> Self {
        (0..devices).fold(
            Self::with_default(per_device).with_limit(Workload::Cpu, cpu_limit),
            |config, device| {
                config.with_limit(Workload::Accelerator(device), per_device)
            },
        )
    }
}

impl<W: Eq + Hash> Default for BudgetConfig<W> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            fallback: 1,
        }
    }
}

/// Admission control in front of the queue claim. Workers take a token
/// before claiming so a device never runs more jobs than it has slots.
#[async_trait]
pub trait Budget<W>: Send + Sync
where
    W: WorkloadKind,
{
    /// Returns `None` when the workload is at capacity.
    async fn try_acquire(
        &self,
        workload: W,
        holder: &str,
    ) -> anyhow::Result<Option<Arc<BudgetToken<W>>>>;

    async fn release(&self, token: Arc<BudgetToken<W>>) -> anyhow::Result<()>;

    /// Returns (in use, limit).
    async fn utilization(&self, workload: W) -> anyhow::Result<(usize, usize)>;
}

/// Process-local budget. The check and the increment happen under one lock.
#[derive(Debug)]
pub struct InMemoryBudget<W> {
    config: BudgetConfig<W>,
    in_use: Mutex<HashMap<W, usize>>,
}

impl<W: WorkloadKind> InMemoryBudget<W> {
    pub fn new(config: BudgetConfig<W>) -> Self {
        Self {
            config,
            in_use: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<W> Budget<W> for InMemoryBudget<W>
where
    W: WorkloadKind,
{
    async fn try_acquire(
        &self,
        workload: W,
        holder: &str,
    ) -> anyhow::Result<Option<Arc<BudgetToken<W>>>> {
        let limit = self.config.limit(&workload);
        let mut in_use = self.in_use.lock();
        let taken = in_use.entry(workload).or_default();
        if *taken >= limit {
            return Ok(None);
        }
        *taken += 1;
        Ok(Some(Arc::new(BudgetToken::new(workload, holder))))
    }

    async fn release(&self, token: Arc<BudgetToken<W>>) -> anyhow::Result<()> {
        if let Some(taken) = self.in_use.lock().get_mut(&token.workload) {
            *taken = taken.saturating_sub(1);
        }
        Ok(())
    }

    async fn utilization(&self, workload: W) -> anyhow::Result<(usize, usize)> {
        let taken = self.in_use.lock().get(&workload).copied().unwrap_or(0);
        Ok((taken, self.config.limit(&workload)))
    }
}
