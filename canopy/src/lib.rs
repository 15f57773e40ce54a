//! Canopy - field imagery analysis for agricultural monitoring.
//!
//! Canopy turns a request to "analyse this field" into a dated
//! [`Observation`]: it picks a satellite scene that covers the field,
//! rejects cloudy or sparse scenes, computes spectral indices (NDVI, NDRE,
//! EVI, SAVI, NDMI) on native-resolution bands and, when asked, runs a
//! super-resolution pass whose outputs are tagged as model-derived.
//!
//! # Core Concepts
//!
//! - **Job**: an [`AnalysisJob`] carries the caller's [`AnalysisRequest`]
//!   plus a [`JobContext`] frozen at creation. Jobs move
//!   QUEUED -> RUNNING -> SUCCEEDED | SKIPPED | FAILED and never go back.
//!
//! - **Queue**: the [`JobQueue`] trait abstracts storage. Claims are atomic
//!   and never hand out a second RUNNING job for the same field.
//!
//! - **Budget**: [`Budget`] caps concurrent work per accelerator device so
//!   two SR jobs never share a device.
//!
//! - **Pipeline**: [`AnalysisOrchestrator`] resolves a scene, applies the
//!   [`QualityGate`], computes indices and invokes the configured
//!   [`SrProvider`](sr::SrProvider).
//!
//! - **Runtime**: [`AnalysisRuntime`](runtime::AnalysisRuntime) runs one
//!   worker pool per queue; [`CadenceScheduler`] submits recurring analyses
//!   in each field's local time zone.
//!
//! - **Events**: lifecycle and pipeline events fan out through
//!   [`InProcEventBus`].
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL-backed job queue, observations and alerts via sqlx
//! - `metrics` - Prometheus metrics
//!
//! # Example
//!
//! ```ignore
//! use canopy::*;
//!
//! let handle = submitter
//!     .submit(AnalysisRequest {
//!         include_sr: true,
//!         ..AnalysisRequest::for_field(field_id)
//!     })
//!     .await?;
//! assert_eq!(handle.queue, QueueName::SrGpu);
//! ```

/// Alert records, the alert store trait and the rules that raise alerts.
pub mod alerts;

/// Spectral band identifiers, index formulas and their band requirements.
pub mod bands;

/// Per-workload concurrency limits.
///
/// [`InMemoryBudget`] counts tokens per [`Workload`]; accelerator devices
/// get their own slot counts so SR jobs never overlap on one device.
pub mod budget;

/// Scene catalog access.
pub mod catalog;

/// Application configuration loaded from TOML.
pub mod config;

/// Domain error types.
pub mod error;

/// Job lifecycle and pipeline events, plus the in-process event bus.
pub mod events;

/// Field records and the field directory trait.
pub mod field;

/// Polygons, bounding boxes and raster geo-transforms.
pub mod geometry;

/// Native index computation and per-index statistics.
pub mod indices;

/// Job, request and status types.
pub mod job;

/// Claim ownership of RUNNING jobs.
pub mod lease;

#[cfg(feature = "metrics")]
/// Prometheus collectors.
pub mod metrics;

/// Dated per-field observations and their store.
pub mod observation;

/// The analysis pipeline run for each claimed job.
pub mod orchestrator;

/// In-memory and PostgreSQL storage backends.
pub mod persistence;

/// Scene quality gate.
pub mod quality;

/// Job queues and snapshots.
pub mod queue;

/// Raster reading, band patches and derived layer storage.
pub mod raster;

/// Queue routing for new jobs.
pub mod router;

/// Worker pools, dispatch and graceful shutdown.
///
/// The `runtime` module provides [`AnalysisRuntime`](runtime::AnalysisRuntime)
/// and its builder. Includes:
/// - [`RuntimeConfig`](runtime::RuntimeConfig) - pool sizes and timings
/// - [`ShutdownToken`](runtime::ShutdownToken) - graceful shutdown signaling
/// - [`JobDispatcher`](runtime::JobDispatcher) - trait for job execution
/// - [`WorkerConfig`](runtime::WorkerConfig) - individual worker configuration
pub mod runtime;

/// Per-field recurring analysis in local time.
pub mod scheduler;

/// Super-resolution providers.
pub mod sr;

/// Job creation, status lookup and cancellation.
pub mod submission;

/// Tracing spans and metric hooks.
pub mod telemetry;

pub use alerts::*;
pub use bands::*;
pub use budget::*;
pub use catalog::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use field::*;
pub use geometry::*;
pub use indices::*;
pub use job::*;
pub use lease::*;
pub use observation::*;
pub use orchestrator::{AnalysisOrchestrator, Collaborators, JobOutcome};
pub use persistence::{InMemoryAlertStore, InMemoryJobQueue, InMemoryObservationStore};
pub use quality::*;
pub use queue::*;
pub use raster::*;
pub use router::*;
pub use scheduler::*;
pub use submission::*;
