//! Raster collaborators: band reads, GeoTIFF stacks for SR providers and
//! layer persistence. Decoding and tile serving live outside this crate.

use async_trait::async_trait;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use uuid::Uuid;

use crate::bands::{BandId, IndexName};
use crate::catalog::SceneCandidate;
use crate::geometry::{GeoTransform, Polygon};
use crate::job::FieldId;
use crate::observation::ObservationId;

pub type BandRasters = BTreeMap<BandId, Array2<f32>>;

/// Co-registered band rasters clipped to a field, plus the pixel mask
/// (inside the field, finite, not flagged as cloud or shadow).
#[derive(Clone, Debug)]
pub struct BandPatch {
    pub bands: BandRasters,
    pub valid_mask: Array2<bool>,
    pub transform: GeoTransform,
}

impl BandPatch {
    pub fn new(
        bands: BandRasters,
        valid_mask: Array2<bool>,
        transform: GeoTransform,
    ) -> Self {
        Self {
            bands,
            valid_mask,
            transform,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.valid_mask.dim()
    }

    pub fn band_ids(&self) -> BTreeSet<BandId> {
        self.bands.keys().copied().collect()
    }

    pub fn band(&self, band: BandId) -> Option<&Array2<f32>> {
        self.bands.get(&band)
    }
}

#[async_trait]
pub trait RasterIo: Send + Sync {
    /// Reads `bands` of `scene` clipped to `aoi` with the validity mask.
    async fn read_scene(
        &self,
        scene: &SceneCandidate,
        aoi: &Polygon,
        bands: &[BandId],
    ) -> anyhow::Result<BandPatch>;

    /// Writes a multi-band stack in `order`.
    async fn write_stack(
        &self,
        path: &Path,
        bands: &BandRasters,
        order: &[BandId],
    ) -> anyhow::Result<()>;

    /// Reads a multi-band stack whose bands are laid out in `order`.
    async fn read_stack(
        &self,
        path: &Path,
        order: &[BandId],
    ) -> anyhow::Result<BandRasters>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Provenance {
    Native,
    ModelDerived,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "NATIVE",
            Self::ModelDerived => "MODEL_DERIVED",
        }
    }
}

/// Reference to a persisted raster layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRef {
    pub layer_id: Uuid,
    pub source_uri: String,
    pub tilejson: String,
}

impl LayerRef {
    pub fn new(layer_id: Uuid, source_uri: impl Into<String>) -> Self {
        Self {
            layer_id,
            source_uri: source_uri.into(),
            tilejson: format!("/api/v1/tiles/{layer_id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "index")]
pub enum LayerKind {
    Index(IndexName),
    Rgb,
}

pub enum LayerData<'a> {
    Single(&'a Array2<f32>),
    Rgb([&'a Array2<f32>; 3]),
}

pub struct LayerUpload<'a> {
    pub field_id: FieldId,
    pub observation_id: ObservationId,
    pub scene_id: &'a str,
    pub kind: LayerKind,
    pub provenance: Provenance,
    pub transform: GeoTransform,
    pub data: LayerData<'a>,
}

#[async_trait]
pub trait LayerStore: Send + Sync {
    async fn put_layer(
        &self,
        upload: LayerUpload<'_>,
    ) -> anyhow::Result<LayerRef>;
}
