use async_trait::async_trait;
use canopy::*;
use ndarray::Array2;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Surface reflectance of a healthy crop canopy, per band.
pub fn default_reflectance(band: BandId) -> f32 {
    match band {
        BandId::B02 => 0.04,
        BandId::B03 => 0.07,
        BandId::B04 => 0.05,
        BandId::B05 => 0.12,
        BandId::B08 => 0.45,
        BandId::B11 => 0.20,
    }
}

/// Raster reads generated from scene metadata.
///
/// Every band is a constant field of its reflectance, so index values are
/// known in advance. The validity mask keeps the field's pixel centres
/// and then drops the leading pixels of a scene configured with
/// [`with_valid_ratio`](Self::with_valid_ratio). Stacks are kept in a
/// shared map keyed by path; a placeholder file is written so providers
/// that scan the filesystem find it.
#[derive(Clone)]
pub struct SyntheticRasterIo {
    shape: (usize, usize),
    reflectance: Arc<Mutex<HashMap<BandId, f32>>>,
    valid_ratios: Arc<Mutex<HashMap<String, f64>>>,
    failing_scenes: Arc<Mutex<HashSet<String>>>,
    withheld: Arc<Mutex<HashSet<BandId>>>,
    stacks: Arc<Mutex<HashMap<PathBuf, BandRasters>>>,
    reads: Arc<Mutex<Vec<String>>>,
}

impl SyntheticRasterIo {
    pub fn new() -> Self {
        Self::with_shape((10, 10))
    }

    pub fn with_shape(shape: (usize, usize)) -> Self {
        Self {
            shape,
            reflectance: Arc::new(Mutex::new(HashMap::new())),
            valid_ratios: Arc::new(Mutex::new(HashMap::new())),
            failing_scenes: Arc::new(Mutex::new(HashSet::new())),
            withheld: Arc::new(Mutex::new(HashSet::new())),
            stacks: Arc::new(Mutex::new(HashMap::new())),
            reads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_reflectance(&self, band: BandId, value: f32) {
        self.reflectance.lock().insert(band, value);
    }

    /// Share of field pixels reported valid for `scene_id`.
    pub fn with_valid_ratio(self, scene_id: &str, ratio: f64) -> Self {
        self.valid_ratios.lock().insert(scene_id.to_string(), ratio);
        self
    }

    pub fn fail_reads_for(&self, scene_id: &str) {
        self.failing_scenes.lock().insert(scene_id.to_string());
    }

    /// Leaves `band` out of every read even when the scene lists it.
    pub fn withhold_band(&self, band: BandId) {
        self.withheld.lock().insert(band);
    }

    /// Scene ids read so far, in order.
    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().clone()
    }

    pub fn stack_at(&self, path: &Path) -> Option<BandRasters> {
        self.stacks.lock().get(path).cloned()
    }

    fn reflectance(&self, band: BandId) -> f32 {
        self.reflectance
            .lock()
            .get(&band)
            .copied()
            .unwrap_or_else(|| default_reflectance(band))
    }
}

impl Default for SyntheticRasterIo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RasterIo for SyntheticRasterIo {
    async fn read_scene(
        &self,
        scene: &SceneCandidate,
        aoi: &Polygon,
        bands: &[BandId],
    ) -> anyhow::Result<BandPatch> {
        self.reads.lock().push(scene.scene_id.clone());
        if self.failing_scenes.lock().contains(&scene.scene_id) {
            anyhow::bail!("synthetic read failure for {}", scene.scene_id);
        }

        let transform = GeoTransform::covering(&aoi.bbox(), self.shape);
        let mut mask = aoi.rasterize(&transform, self.shape);
        if let Some(ratio) = self.valid_ratios.lock().get(&scene.scene_id) {
            let total = mask.len();
            let invalid = ((1.0 - ratio.clamp(0.0, 1.0)) * total as f64).round() as usize;
            for cell in mask.iter_mut().take(invalid) {
                *cell = false;
            }
        }

        let withheld = self.withheld.lock().clone();
        let rasters: BandRasters = bands
            .iter()
            .filter(|band| scene.bands.contains(band) && !withheld.contains(band))
            .map(|band| (*band, Array2::from_elem(self.shape, self.reflectance(*band))))
            .collect();
        Ok(BandPatch::new(rasters, mask, transform))
    }

    async fn write_stack(
        &self,
        path: &Path,
        bands: &BandRasters,
        order: &[BandId],
    ) -> anyhow::Result<()> {
        let stack: BandRasters = order
            .iter()
            .map(|band| {
                bands
                    .get(band)
                    .cloned()
                    .map(|raster| (*band, raster))
                    .ok_or_else(|| anyhow::anyhow!("band {band} missing from stack"))
            })
            .collect::<anyhow::Result<_>>()?;
        tokio::fs::write(path, b"synthetic-stack").await?;
        self.stacks.lock().insert(path.to_path_buf(), stack);
        Ok(())
    }

    async fn read_stack(
        &self,
        path: &Path,
        order: &[BandId],
    ) -> anyhow::Result<BandRasters> {
        let stacks = self.stacks.lock();
        let stack = stacks
            .get(path)
            .ok_or_else(|| anyhow::anyhow!("no stack written at {}", path.display()))?;
        let mut out = BTreeMap::new();
        for band in order {
            if let Some(raster) = stack.get(band) {
                out.insert(*band, raster.clone());
            }
        }
        Ok(out)
    }
}
