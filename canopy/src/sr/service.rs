use async_trait::async_trait;
use ndarray::Array2;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    RuntimeClass, ServiceConfig, SrCapabilities, SrOutput, SrProvider,
    SrProviderKind, SrRequest,
};
use crate::bands::BandId;
use crate::error::SrProviderError;
use crate::raster::{BandRasters, RasterIo};

const DOWNLOAD_FILE: &str = "sr_download.tif";

/// Shapes a provider service may answer with.
#[derive(Debug)]
enum ServiceResponse {
    Inline(BandRasters),
    Path(PathBuf),
    Url(String),
}

/// Posts the AOI and scene references to an HTTP inference service.
pub struct ServiceProvider {
    config: ServiceConfig,
    client: reqwest::Client,
    raster: Arc<dyn RasterIo>,
}

impl ServiceProvider {
    pub fn new(
        config: ServiceConfig,
        raster: Arc<dyn RasterIo>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            client,
            raster,
        })
    }

    fn payload(&self, request: &SrRequest<'_>) -> Value {
        json!({
            "date": request.acquired_on.format("%Y-%m-%d").to_string(),
            "scene_id": request.scene_id,
            "aoi_geojson": request.aoi.to_geojson(),
            "requested_bands": self.config.requested_bands,
            "source_assets": request.source_assets,
            "output": request.output_path(),
        })
    }

    async fn download(
        &self,
        url: &str,
        request: &SrRequest<'_>,
    ) -> Result<PathBuf, SrProviderError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SrProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = response.bytes().await?;
        let path = request.work_dir.join(DOWNLOAD_FILE);
        tokio::fs::write(&path, &bytes).await?;
        Ok(path)
    }
}

fn parse_band_grid(band: BandId, value: &Value) -> Result<Array2<f32>, SrProviderError> {
    let rows: Vec<Vec<f32>> = serde_json::from_value(value.clone()).map_err(|e| {
        SrProviderError::UnsupportedResponse(format!("band {band}: {e}"))
    })?;
    let height = rows.len();
    let width = rows.first().map(Vec::len).unwrap_or(0);
    if height == 0 || width == 0 || rows.iter().any(|row| row.len() != width) {
        return Err(SrProviderError::UnsupportedResponse(format!(
            "band {band} is not a rectangular grid"
        )));
    }
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((height, width), flat).map_err(|e| {
        SrProviderError::UnsupportedResponse(format!("band {band}: {e}"))
    })
}

/// Inline grids are kept only for `requested` bands; other keys are ignored.
fn parse_response(
    body: &Value,
    requested: &[BandId],
) -> Result<ServiceResponse, SrProviderError> {
    if let Some(bands) = body.get("bands").and_then(Value::as_object) {
        let mut parsed = BandRasters::new();
        for (name, grid) in bands {
            let Ok(band) = name.parse::<BandId>() else {
                debug!(band = %name, "ignoring unknown band in SR response");
                continue;
            };
            if !requested.contains(&band) {
                continue;
            }
            parsed.insert(band, parse_band_grid(band, grid)?);
        }
        if parsed.is_empty() {
            return Err(SrProviderError::UnsupportedResponse(
                "no requested band in bands object".into(),
            ));
        }
        let shape = parsed.values().next().map(Array2::dim);
        if parsed.values().any(|grid| Some(grid.dim()) != shape) {
            return Err(SrProviderError::UnsupportedResponse(
                "bands differ in shape".into(),
            ));
        }
        return Ok(ServiceResponse::Inline(parsed));
    }
    if let Some(path) = body.get("geotiff_path").and_then(Value::as_str) {
        return Ok(ServiceResponse::Path(PathBuf::from(path)));
    }
    if let Some(url) = body.get("geotiff_url").and_then(Value::as_str) {
        return Ok(ServiceResponse::Url(url.to_string()));
    }
    Err(SrProviderError::UnsupportedResponse(
        "expected one of bands, geotiff_path, geotiff_url".into(),
    ))
}

#[async_trait]
impl SrProvider for ServiceProvider {
    fn kind(&self) -> SrProviderKind {
        SrProviderKind::ExternalService
    }

    fn capabilities(&self) -> SrCapabilities {
        SrCapabilities {
            provider: SrProviderKind::ExternalService,
            model_name: self.config.model_name.clone(),
            model_version: self.config.model_version.clone(),
            supported_bands: self.config.requested_bands.clone(),
            scale_factor: self.config.scale_factor,
            runtime: RuntimeClass::External,
        }
    }

    async fn infer(
        &self,
        request: &SrRequest<'_>,
    ) -> Result<SrOutput, SrProviderError> {
        let limit = Duration::from_secs(self.config.timeout_secs);
        let mut call = self.client.post(&self.config.url).json(&self.payload(request));
        if let Some(key) = &self.config.api_key {
            call = call.bearer_auth(key);
        }

        let response = tokio::time::timeout(limit, call.send())
            .await
            .map_err(|_| SrProviderError::Timeout(limit))?
            .map_err(|e| {
                if e.is_timeout() {
                    SrProviderError::Timeout(limit)
                } else {
                    SrProviderError::Http(e)
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SrProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let body: Value = response.json().await?;
        debug!(job_id = %request.job_id, "SR service responded");

        let (bands, raster_path) = match parse_response(&body, &self.config.requested_bands)? {
            ServiceResponse::Inline(bands) => (bands, None),
            ServiceResponse::Path(path) => {
                let bands = self
                    .raster
                    .read_stack(&path, &self.config.requested_bands)
                    .await
                    .map_err(SrProviderError::Raster)?;
                (bands, Some(path))
            }
            ServiceResponse::Url(url) => {
                let path = self.download(&url, request).await?;
                let bands = self
                    .raster
                    .read_stack(&path, &self.config.requested_bands)
                    .await
                    .map_err(SrProviderError::Raster)?;
                (bands, Some(path))
            }
        };
        info!(
            job_id = %request.job_id,
            bands = bands.len(),
            "SR service inference finished"
        );

        Ok(SrOutput { bands, raster_path })
    }
}
