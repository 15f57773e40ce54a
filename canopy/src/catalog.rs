use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::bands::BandId;
use crate::geometry::{BoundingBox, Polygon};

/// One catalog hit. Immutable once produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SceneCandidate {
    pub scene_id: String,
    pub collection: String,
    pub acquired_at: DateTime<Utc>,
    /// Percent, 0-100. Some collections do not report it.
    pub cloud_cover: Option<f64>,
    pub footprint: Option<Polygon>,
    pub bbox: Option<BoundingBox>,
    pub bands: BTreeSet<BandId>,
    /// Asset key -> href.
    pub assets: BTreeMap<String, String>,
    /// Share of the field covered by the scene, when the catalog knows it.
    #[serde(default)]
    pub field_coverage_ratio: Option<f64>,
}

impl SceneCandidate {
    /// Coverage of `field`: the catalog's figure, then the footprint,
    /// then the bbox. A scene with no geometry at all is assumed to cover
    /// the field.
    pub fn coverage_of(&self, field: &Polygon) -> f64 {
        if let Some(ratio) = self.field_coverage_ratio {
            return ratio.clamp(0.0, 1.0);
        }
        match (&self.footprint, &self.bbox) {
            (Some(footprint), _) => field.coverage_by(footprint),
            (None, Some(bbox)) => field.coverage_by(&bbox.to_polygon()),
            (None, None) => 1.0,
        }
    }

    pub fn acquired_on(&self) -> NaiveDate {
        self.acquired_at.date_naive()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SceneQuery {
    pub aoi: Polygon,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub max_cloud: f64,
}

/// Imagery search collaborator.
#[async_trait]
pub trait SceneCatalog: Send + Sync {
    /// Scenes intersecting the query, in any order.
    async fn search(
        &self,
        query: &SceneQuery,
    ) -> anyhow::Result<Vec<SceneCandidate>>;

    async fn get_scene(
        &self,
        scene_id: &str,
    ) -> anyhow::Result<Option<SceneCandidate>>;
}
