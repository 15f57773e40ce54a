use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::bands::IndexName;
use crate::queue::QueueName;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd,
            ::serde::Serialize, ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub ::uuid::Uuid);

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $name {
            pub fn new() -> Self {
                Self(::uuid::Uuid::now_v7())
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(
                &self,
                f: &mut ::std::fmt::Formatter<'_>,
            ) -> ::std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<::uuid::Uuid> for $name {
            fn from(value: ::uuid::Uuid) -> Self {
                Self(value)
            }
        }
    };
}

pub(crate) use uuid_id;

uuid_id!(JobId);
uuid_id!(FieldId);
uuid_id!(OrganizationId);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Skipped,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Skipped => "SKIPPED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped | Self::Failed)
    }

    /// Legal moves: QUEUED -> RUNNING, RUNNING -> terminal, and
    /// QUEUED -> FAILED for cancellation. Nothing leaves a terminal state.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (Self::Queued, Self::Running) => true,
            (Self::Queued, Self::Failed) => true,
            (Self::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "SKIPPED" => Some(Self::Skipped),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

/// Caller-supplied analysis parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub field_id: FieldId,
    #[serde(default)]
    pub scene_id: Option<String>,
    #[serde(default)]
    pub date_from: Option<NaiveDate>,
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
    #[serde(default)]
    pub max_cloud: Option<f64>,
    #[serde(default)]
    pub include_sr: bool,
    /// Accepted and echoed; no radar processing happens here.
    #[serde(default = "default_true")]
    pub include_radar_overlay: bool,
    #[serde(default)]
    pub indices: Option<Vec<IndexName>>,
}

impl AnalysisRequest {
    pub fn for_field(field_id: FieldId) -> Self {
        Self {
            field_id,
            scene_id: None,
            date_from: None,
            date_to: None,
            max_cloud: None,
            include_sr: false,
            include_radar_overlay: true,
            indices: None,
        }
    }
}

/// Values resolved when the job is created and frozen for its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    pub organization_id: OrganizationId,
    pub sr_analytics_enabled: bool,
}

/// Payload written with a terminal status.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_cover: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_pixel_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_coverage_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_indices: Option<Vec<IndexName>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sr_indices: Option<Vec<IndexName>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sr_requested: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sr_analytics_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sr_visualization_generated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sr_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sr_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_radar_overlay: Option<bool>,
}

impl JobResult {
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: JobId,
    pub request: AnalysisRequest,
    pub context: JobContext,
    pub queue: QueueName,
    pub status: JobStatus,
    pub result: Option<JobResult>,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisJob {
    pub fn new(
        request: AnalysisRequest,
        context: JobContext,
        queue: QueueName,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            request,
            context,
            queue,
            status: JobStatus::Queued,
            result: None,
            error_message: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn field_id(&self) -> FieldId {
        self.request.field_id
    }

    pub fn organization_id(&self) -> OrganizationId {
        self.context.organization_id
    }

    pub fn view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id,
            status: self.status,
            queue: self.queue,
            result_json: self
                .result
                .as_ref()
                .and_then(|result| serde_json::to_value(result).ok()),
            error_message: self.error_message.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    pub queue: QueueName,
}

/// Read model returned to API callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub status: JobStatus,
    pub queue: QueueName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_json: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Skipped,
        JobStatus::Failed,
    ];

    #[test]
    fn nothing_returns_to_queued() {
        for from in ALL {
            assert!(!from.can_transition_to(JobStatus::Queued), "{from}");
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for from in ALL.into_iter().filter(JobStatus::is_terminal) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn running_reaches_every_terminal_state() {
        for to in ALL.into_iter().filter(JobStatus::is_terminal) {
            assert!(JobStatus::Running.can_transition_to(to));
        }
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Succeeded));
    }

    #[test]
    fn status_wire_names() {
        for status in ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn request_defaults_from_json() {
        let field = FieldId::new();
        let request: AnalysisRequest = serde_json::from_value(
            serde_json::json!({ "field_id": field }),
        )
        .unwrap();
        assert_eq!(request, AnalysisRequest::for_field(field));
    }

    #[test]
    fn view_omits_absent_payloads() {
        let job = AnalysisJob::new(
            AnalysisRequest::for_field(FieldId::new()),
            JobContext {
                organization_id: OrganizationId::new(),
                sr_analytics_enabled: false,
            },
            QueueName::AnalysisCpu,
        );
        let json = serde_json::to_value(job.view()).unwrap();
        assert_eq!(json["status"], "QUEUED");
        assert_eq!(json["queue"], "analysis_cpu");
        assert!(json.get("result_json").is_none());
        assert!(json.get("error_message").is_none());
    }
}
