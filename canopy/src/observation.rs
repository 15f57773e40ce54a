use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bands::IndexName;
use crate::indices::IndexResult;
use crate::job::{FieldId, JobId};
use crate::sr::SrCapabilities;

crate::job::uuid_id!(ObservationId);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObservationStatus {
    Succeeded,
    LowQualitySkipped,
    Failed,
}

/// Dated summary of one accepted scene for one field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: ObservationId,
    pub field_id: FieldId,
    pub job_id: JobId,
    pub scene_id: String,
    pub observed_on: NaiveDate,
    pub status: ObservationStatus,
    pub cloud_cover: f64,
    pub valid_pixel_ratio: f64,
    pub indices_native: BTreeMap<IndexName, IndexResult>,
    pub indices_sr: BTreeMap<IndexName, IndexResult>,
    pub sr_model: Option<SrCapabilities>,
    pub created_at: DateTime<Utc>,
}

impl Observation {
    pub fn native_mean(&self, index: IndexName) -> Option<f64> {
        self.indices_native
            .get(&index)
            .and_then(|result| result.stats.as_ref())
            .map(|stats| stats.mean)
    }
}

#[async_trait]
pub trait ObservationStore: Send + Sync {
    async fn insert(&self, observation: &Observation) -> anyhow::Result<()>;

    /// Most recent first, by `observed_on` then `created_at`.
    async fn recent_for_field(
        &self,
        field_id: FieldId,
        limit: usize,
    ) -> anyhow::Result<Vec<Observation>>;

    /// Removes a field's timeline. Returns the number of rows removed.
    async fn clear_field(&self, field_id: FieldId) -> anyhow::Result<u64>;
}
