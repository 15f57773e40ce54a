use std::time::Duration;

use thiserror::Error;

use crate::bands::{BandId, IndexName};
use crate::job::{FieldId, JobId, JobStatus};

/// Failures that end an analysis job in `FAILED`.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("no imagery available for field {field_id}")]
    ImageryUnavailable { field_id: String },

    #[error("requested scene {scene_id} was not found")]
    RequestedSceneNotFound { scene_id: String },

    #[error("field {field_id} is not registered")]
    UnknownField { field_id: String },

    #[error("band {band} required by {index} is missing from the scene data")]
    BandMissingAtComputeTime { index: IndexName, band: BandId },

    #[error("band {band} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        band: BandId,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("scene catalog query failed: {0}")]
    Catalog(#[source] anyhow::Error),

    #[error("raster read failed: {0}")]
    Raster(#[source] anyhow::Error),

    #[error("persistence failed: {0}")]
    Store(#[source] anyhow::Error),
}

impl AnalysisError {
    /// Stable machine-readable reason stored on the job result.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ImageryUnavailable { .. } => "NO_SCENE_AVAILABLE",
            Self::RequestedSceneNotFound { .. } => "REQUESTED_SCENE_NOT_FOUND",
            Self::UnknownField { .. } => "UNKNOWN_FIELD",
            Self::BandMissingAtComputeTime { .. } => "BAND_MISSING",
            Self::ShapeMismatch { .. } => "BAND_SHAPE_MISMATCH",
            Self::Catalog(_) => "CATALOG_UNAVAILABLE",
            Self::Raster(_) => "RASTER_READ_FAILED",
            Self::Store(_) => "PERSISTENCE_FAILED",
        }
    }
}

/// Failures of a super-resolution provider. Never fatal for the job.
#[derive(Debug, Error)]
pub enum SrProviderError {
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provider process exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("provider i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("provider produced no output at {0}")]
    MissingOutput(String),

    #[error("unsupported provider response: {0}")]
    UnsupportedResponse(String),

    #[error("provider input is missing bands: {0:?}")]
    MissingBands(Vec<BandId>),

    #[error("provider is misconfigured: {0}")]
    Misconfigured(String),

    #[error("provider raster handling failed: {0}")]
    Raster(#[source] anyhow::Error),
}

impl SrProviderError {
    /// Short label used for logs and the failure counter.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Http(_) => "http",
            Self::Status { .. } => "status",
            Self::Exit { .. } => "exit",
            Self::Io(_) => "io",
            Self::MissingOutput(_) => "missing_output",
            Self::UnsupportedResponse(_) => "unsupported_response",
            Self::MissingBands(_) => "missing_bands",
            Self::Misconfigured(_) => "misconfigured",
            Self::Raster(_) => "raster",
        }
    }
}

/// Rejected writes against the job state machine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("job {job_id}: illegal transition {from} -> {to}")]
    Illegal {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {job_id} is not leased by {worker_id}")]
    NotLeaseOwner { job_id: JobId, worker_id: String },

    #[error("job {0} not found")]
    UnknownJob(JobId),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid local time {0:?}, expected HH:MM")]
    InvalidLocalTime(String),

    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AlertError {
    #[error("alert {0} was already acknowledged")]
    AlreadyAcknowledged(String),

    #[error("alert {0} not found")]
    NotFound(String),
}

/// Rejected job submissions.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("field {0} is not registered")]
    UnknownField(FieldId),

    #[error("invalid analysis request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}
