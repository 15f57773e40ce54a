use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::geometry::Polygon;
use crate::job::{FieldId, OrganizationId};
use crate::scheduler::ScheduleConfig;

/// What the pipeline needs to know about a registered field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldRecord {
    pub id: FieldId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub geometry: Polygon,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// Field registry collaborator. Also the source of schedules.
#[async_trait]
pub trait FieldDirectory: Send + Sync {
    async fn get(&self, field_id: FieldId) -> anyhow::Result<Option<FieldRecord>>;

    async fn list(&self) -> anyhow::Result<Vec<FieldRecord>>;
}
