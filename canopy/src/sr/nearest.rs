use async_trait::async_trait;
use ndarray::Array2;

use super::{
    RuntimeClass, SrCapabilities, SrOutput, SrProvider, SrProviderKind,
    SrRequest,
};
use crate::bands::BandId;
use crate::error::SrProviderError;
use crate::raster::BandRasters;

const SUPPORTED: [BandId; 4] =
    [BandId::B02, BandId::B03, BandId::B04, BandId::B08];

/// Debug provider: nearest-neighbour upsampling of the native bands,
/// labelled as model output. Not allowed in production.
pub struct NearestProvider {
    scale_factor: u32,
}

impl NearestProvider {
    pub fn new(scale_factor: u32) -> Self {
        Self {
            scale_factor: scale_factor.max(1),
        }
    }

    pub(crate) fn default_scale() -> u32 {
        2
    }
}

pub(crate) fn upsample(raster: &Array2<f32>, factor: usize) -> Array2<f32> {
    let (rows, cols) = raster.dim();
    Array2::from_shape_fn((rows * factor, cols * factor), |(r, c)| {
        raster[[r / factor, c / factor]]
    })
}

#[async_trait]
impl SrProvider for NearestProvider {
    fn kind(&self) -> SrProviderKind {
        SrProviderKind::Nearest
    }

    fn capabilities(&self) -> SrCapabilities {
        SrCapabilities {
            provider: SrProviderKind::Nearest,
            model_name: "nearest".to_string(),
            model_version: None,
            supported_bands: SUPPORTED.to_vec(),
            scale_factor: self.scale_factor,
            runtime: RuntimeClass::Cpu,
        }
    }

    async fn infer(
        &self,
        request: &SrRequest<'_>,
    ) -> Result<SrOutput, SrProviderError> {
        let factor = self.scale_factor as usize;
        let bands: BandRasters = SUPPORTED
            .iter()
            .filter_map(|band| {
                request
                    .native
                    .bands
                    .get(band)
                    .map(|raster| (*band, upsample(raster, factor)))
            })
            .collect();
        if bands.is_empty() {
            return Err(SrProviderError::MissingBands(SUPPORTED.to_vec()));
        }
        Ok(SrOutput {
            bands,
            raster_path: None,
        })
    }
}
