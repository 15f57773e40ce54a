/// Builder for assembling an [`AnalysisRuntime`].
pub mod builder;
/// Worker pools, dispatch seam and shutdown.
pub mod supervisor;
/// Per-worker configuration.
pub mod worker;

pub use builder::AnalysisRuntimeBuilder;
pub use supervisor::{
    AnalysisRuntime, DispatchContext, JobDispatcher, RuntimeConfig,
    ShutdownToken,
};
pub use worker::WorkerConfig;
