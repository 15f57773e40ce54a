//! Alerts derived from job outcomes and observation history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt::{self, Display};

use crate::bands::IndexName;
use crate::error::AlertError;
use crate::job::{AnalysisJob, FieldId, JobStatus, OrganizationId};
use crate::observation::Observation;
use crate::orchestrator::JobOutcome;

crate::job::uuid_id!(AlertId);

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertCategory {
    LowQualitySkipped,
    LowSceneCoverage,
    AnalysisFailed,
    SrProviderDegraded,
    NdviDrop,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowQualitySkipped => "LOW_QUALITY_SKIPPED",
            Self::LowSceneCoverage => "LOW_SCENE_COVERAGE",
            Self::AnalysisFailed => "ANALYSIS_FAILED",
            Self::SrProviderDegraded => "SR_PROVIDER_DEGRADED",
            Self::NdviDrop => "NDVI_DROP",
        }
    }
}

impl Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub organization_id: OrganizationId,
    pub field_id: Option<FieldId>,
    pub severity: Severity,
    pub category: AlertCategory,
    pub message: String,
    pub metadata: Value,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        organization_id: OrganizationId,
        field_id: Option<FieldId>,
        severity: Severity,
        category: AlertCategory,
        message: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self {
            id: AlertId::new(),
            organization_id,
            field_id,
            severity,
            category,
            message: message.into(),
            metadata,
            acknowledged_at: None,
            created_at: Utc::now(),
        }
    }

    /// Acknowledges the alert. A second call fails.
    pub fn acknowledge(&mut self, at: DateTime<Utc>) -> Result<(), AlertError> {
        if self.acknowledged_at.is_some() {
            return Err(AlertError::AlreadyAcknowledged(self.id.to_string()));
        }
        self.acknowledged_at = Some(at);
        Ok(())
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn insert(&self, alert: &Alert) -> anyhow::Result<()>;

    /// Fails with [`AlertError`] when the alert is unknown or was already
    /// acknowledged.
    async fn acknowledge(
        &self,
        alert_id: AlertId,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Alert>;

    async fn list(
        &self,
        organization_id: OrganizationId,
        unacknowledged_only: bool,
    ) -> anyhow::Result<Vec<Alert>>;
}

/// Rule set turning outcomes into alerts.
#[derive(Clone, Copy, Debug)]
pub struct AlertGenerator {
    /// Absolute NDVI mean decrease that raises `NDVI_DROP`.
    pub ndvi_drop_threshold: f64,
    /// Prior observations averaged into the baseline.
    pub baseline_window: usize,
    /// Prior observations searched for NDVI means; those without one are
    /// skipped.
    pub history_depth: usize,
}

impl Default for AlertGenerator {
    fn default() -> Self {
        Self {
            ndvi_drop_threshold: 0.20,
            baseline_window: 3,
            history_depth: 5,
        }
    }
}

impl AlertGenerator {
    /// `history` holds the field's prior observations, most recent first,
    /// excluding the one produced by `outcome`.
    pub fn for_outcome(
        &self,
        job: &AnalysisJob,
        outcome: &JobOutcome,
        history: &[Observation],
    ) -> Vec<Alert> {
        let org = job.organization_id();
        let field = Some(job.field_id());
        let result = &outcome.result;
        let mut alerts = Vec::new();

        match outcome.status {
            JobStatus::Skipped => {
                let low_coverage = result.reason.as_deref()
                    == Some(crate::orchestrator::reason::LOW_SCENE_COVERAGE);
                let (category, message) = if low_coverage {
                    (
                        AlertCategory::LowSceneCoverage,
                        "Scene does not cover the field; analysis skipped",
                    )
                } else {
                    (
                        AlertCategory::LowQualitySkipped,
                        "Imagery quality too low; analysis skipped",
                    )
                };
                alerts.push(Alert::new(
                    org,
                    field,
                    Severity::Warn,
                    category,
                    message,
                    json!({
                        "job_id": job.id,
                        "scene_id": result.scene_id,
                        "cloud_cover": result.cloud_cover,
                        "valid_pixel_ratio": result.valid_pixel_ratio,
                        "field_coverage_ratio": result.field_coverage_ratio,
                        "reason": result.reason,
                    }),
                ));
            }
            JobStatus::Failed => {
                let error = outcome
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                alerts.push(Alert::new(
                    org,
                    field,
                    Severity::Critical,
                    AlertCategory::AnalysisFailed,
                    format!("Analysis failed: {error}"),
                    json!({
                        "job_id": job.id,
                        "error": error,
                        "reason": result.reason,
                    }),
                ));
            }
            JobStatus::Succeeded => {
                if let Some(sr_error) = &result.sr_error {
                    alerts.push(Alert::new(
                        org,
                        field,
                        Severity::Warn,
                        AlertCategory::SrProviderDegraded,
                        "Super-resolution failed; native results only",
                        json!({
                            "job_id": job.id,
                            "sr_provider": result.sr_provider,
                            "error": sr_error,
                        }),
                    ));
                }
                if let Some(observation) = &outcome.observation
                    && let Some(alert) =
                        self.ndvi_drop(org, observation, history)
                {
                    alerts.push(alert);
                }
            }
            JobStatus::Queued | JobStatus::Running => {}
        }

        alerts
    }

    /// Compares the observation's NDVI mean against the average of the
    /// `baseline_window` most recent prior means.
    fn ndvi_drop(
        &self,
        organization_id: OrganizationId,
        current: &Observation,
        history: &[Observation],
    ) -> Option<Alert> {
        let current_mean = current.native_mean(IndexName::Ndvi)?;
        let prior: Vec<f64> = history
            .iter()
            .filter(|obs| obs.id != current.id)
            .take(self.history_depth)
            .filter_map(|obs| obs.native_mean(IndexName::Ndvi))
            .take(self.baseline_window)
            .collect();
        if prior.is_empty() || prior.len() < self.baseline_window {
            return None;
        }
        let baseline = prior.iter().sum::<f64>() / prior.len() as f64;
        let delta = baseline - current_mean;
        if delta < self.ndvi_drop_threshold {
            return None;
        }

        Some(Alert::new(
            organization_id,
            Some(current.field_id),
            Severity::Warn,
            AlertCategory::NdviDrop,
            format!(
                "NDVI dropped by {delta:.2} against the recent baseline"
            ),
            json!({
                "observation_id": current.id,
                "scene_id": current.scene_id,
                "baseline": baseline,
                "current": current_mean,
                "delta": delta,
            }),
        ))
    }
}
