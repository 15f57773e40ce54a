//! Spectral index computation over a [`BandPatch`].

use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::error;

use crate::bands::{BandId, IndexName};
use crate::error::AnalysisError;
use crate::raster::{BandPatch, LayerRef, Provenance};

/// Reflectance values above this are treated as scaled integers.
const REFLECTANCE_SCALE_THRESHOLD: f32 = 2.0;
const REFLECTANCE_SCALE: f32 = 10_000.0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub p10: f64,
    pub p90: f64,
    pub pixel_count: usize,
}

impl IndexStats {
    /// Returns `None` when no finite values are present.
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a f32>) -> Option<Self> {
        let mut finite: Vec<f64> = values
            .into_iter()
            .filter(|v| v.is_finite())
            .map(|v| *v as f64)
            .collect();
        if finite.is_empty() {
            return None;
        }
        finite.sort_by(f64::total_cmp);

        let count = finite.len();
        let mean = finite.iter().sum::<f64>() / count as f64;
        Some(Self {
            mean,
            min: finite[0],
            max: finite[count - 1],
            p10: percentile(&finite, 10.0),
            p90: percentile(&finite, 90.0),
            pixel_count: count,
        })
    }
}

/// Linear interpolation between closest ranks on sorted input.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Stored summary of one index on an observation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexResult {
    pub stats: Option<IndexStats>,
    pub layer: Option<LayerRef>,
    pub provenance: Provenance,
}

#[derive(Clone, Debug)]
pub struct ComputedIndex {
    pub raster: Array2<f32>,
    pub stats: Option<IndexStats>,
    pub provenance: Provenance,
}

impl ComputedIndex {
    pub fn into_result(self, layer: Option<LayerRef>) -> IndexResult {
        IndexResult {
            stats: self.stats,
            layer,
            provenance: self.provenance,
        }
    }
}

/// Stateless index calculator shared by native and SR passes.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeIndexEngine;

impl NativeIndexEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn compute(
        &self,
        patch: &BandPatch,
        indices: &[IndexName],
        provenance: Provenance,
    ) -> Result<BTreeMap<IndexName, ComputedIndex>, AnalysisError> {
        let shape = patch.shape();
        let mut normalized: BTreeMap<BandId, Array2<f32>> = BTreeMap::new();
        let mut results = BTreeMap::new();

        for &index in indices {
            for &band in index.required_bands() {
                if normalized.contains_key(&band) {
                    continue;
                }
                let Some(raw) = patch.band(band) else {
                    error!(
                        index = %index,
                        band = %band,
                        "required band missing at compute time"
                    );
                    return Err(AnalysisError::BandMissingAtComputeTime {
                        index,
                        band,
                    });
                };
                if raw.dim() != shape {
                    return Err(AnalysisError::ShapeMismatch {
                        band,
                        expected: shape,
                        found: raw.dim(),
                    });
                }
                normalized.insert(band, normalize_reflectance(raw));
            }

            let band = |id: BandId| &normalized[&id];
            let raster = match index {
                IndexName::Ndvi => normalized_difference(
                    band(BandId::B08),
                    band(BandId::B04),
                    &patch.valid_mask,
                ),
                IndexName::Ndmi => normalized_difference(
                    band(BandId::B08),
                    band(BandId::B11),
                    &patch.valid_mask,
                ),
                IndexName::Ndwi => normalized_difference(
                    band(BandId::B03),
                    band(BandId::B08),
                    &patch.valid_mask,
                ),
                IndexName::Ndre => normalized_difference(
                    band(BandId::B08),
                    band(BandId::B05),
                    &patch.valid_mask,
                ),
                IndexName::Savi => savi(
                    band(BandId::B08),
                    band(BandId::B04),
                    &patch.valid_mask,
                ),
                IndexName::Evi => evi(
                    band(BandId::B08),
                    band(BandId::B04),
                    band(BandId::B02),
                    &patch.valid_mask,
                ),
            };

            let stats = IndexStats::from_values(raster.iter());
            results.insert(
                index,
                ComputedIndex {
                    raster,
                    stats,
                    provenance,
                },
            );
        }

        Ok(results)
    }
}

fn normalize_reflectance(raw: &Array2<f32>) -> Array2<f32> {
    let max = raw
        .iter()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, |acc, v| acc.max(*v));
    if max > REFLECTANCE_SCALE_THRESHOLD {
        raw.mapv(|v| v / REFLECTANCE_SCALE)
    } else {
        raw.clone()
    }
}

fn ratio(numerator: f32, denominator: f32) -> f32 {
    if !numerator.is_finite() || !denominator.is_finite() || denominator == 0.0
    {
        return f32::NAN;
    }
    numerator / denominator
}

fn normalized_difference(
    a: &Array2<f32>,
    b: &Array2<f32>,
    mask: &Array2<bool>,
) -> Array2<f32> {
    let mut out = Array2::from_elem(mask.dim(), f32::NAN);
    Zip::from(&mut out)
        .and(a)
        .and(b)
        .and(mask)
        .for_each(|o, &a, &b, &valid| {
            if valid {
                *o = ratio(a - b, a + b);
            }
        });
    out
}

fn savi(
    nir: &Array2<f32>,
    red: &Array2<f32>,
    mask: &Array2<bool>,
) -> Array2<f32> {
    const L: f32 = 0.5;
    let mut out = Array2::from_elem(mask.dim(), f32::NAN);
    Zip::from(&mut out)
        .and(nir)
        .and(red)
        .and(mask)
        .for_each(|o, &nir, &red, &valid| {
            if valid {
                *o = (1.0 + L) * ratio(nir - red, nir + red + L);
            }
        });
    out
}

fn evi(
    nir: &Array2<f32>,
    red: &Array2<f32>,
    blue: &Array2<f32>,
    mask: &Array2<bool>,
) -> Array2<f32> {
    let mut out = Array2::from_elem(mask.dim(), f32::NAN);
    Zip::from(&mut out)
        .and(nir)
        .and(red)
        .and(blue)
        .and(mask)
        .for_each(|o, &nir, &red, &blue, &valid| {
            if valid {
                *o = 2.5 * ratio(nir - red, nir + 6.0 * red - 7.5 * blue + 1.0);
            }
        });
    out
}

/// Share of `true` pixels; 0.0 for an empty mask.
pub fn valid_pixel_ratio(mask: &Array2<bool>) -> f64 {
    if mask.is_empty() {
        return 0.0;
    }
    mask.iter().filter(|v| **v).count() as f64 / mask.len() as f64
}

/// Nearest-neighbour expansion of `mask` to `shape`.
pub fn upscale_mask(mask: &Array2<bool>, shape: (usize, usize)) -> Array2<bool> {
    let (src_rows, src_cols) = mask.dim();
    if src_rows == 0 || src_cols == 0 {
        return Array2::from_elem(shape, false);
    }
    let (rows, cols) = shape;
    Array2::from_shape_fn(shape, |(r, c)| {
        let sr = (r * src_rows / rows.max(1)).min(src_rows - 1);
        let sc = (c * src_cols / cols.max(1)).min(src_cols - 1);
        mask[[sr, sc]]
    })
}
