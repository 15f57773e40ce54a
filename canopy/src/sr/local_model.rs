use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::{
    LocalModelConfig, RuntimeClass, STACK_ORDER, SrCapabilities, SrOutput,
    SrProvider, SrProviderKind, SrRequest, missing_bands, run_process,
};
use crate::error::SrProviderError;
use crate::raster::{BandRasters, RasterIo};

const INPUT_FILE: &str = "sr_input.tif";

/// Runs a saved model through a local worker script on one accelerator.
///
/// The script is invoked as
/// `<python> <script> --savedmodel <dir> --input <tif> --output <tif>`
/// with `CUDA_VISIBLE_DEVICES` pinned to the device the worker holds.
pub struct LocalModelProvider {
    config: LocalModelConfig,
    raster: Arc<dyn RasterIo>,
}

impl LocalModelProvider {
    pub fn new(config: LocalModelConfig, raster: Arc<dyn RasterIo>) -> Self {
        Self { config, raster }
    }

    fn command(&self, request: &SrRequest<'_>) -> Command {
        let mut command = Command::new(&self.config.python);
        command
            .arg(&self.config.script)
            .arg("--savedmodel")
            .arg(&self.config.model_dir)
            .arg("--input")
            .arg(request.work_dir.join(INPUT_FILE))
            .arg("--output")
            .arg(request.output_path())
            .current_dir(request.work_dir);
        if let Some(device) = request.device {
            command.env("CUDA_VISIBLE_DEVICES", device.to_string());
        }
        command
    }
}

#[async_trait]
impl SrProvider for LocalModelProvider {
    fn kind(&self) -> SrProviderKind {
        SrProviderKind::LocalModel
    }

    fn capabilities(&self) -> SrCapabilities {
        SrCapabilities {
            provider: SrProviderKind::LocalModel,
            model_name: self.config.model_name.clone(),
            model_version: self.config.model_version.clone(),
            supported_bands: STACK_ORDER.to_vec(),
            scale_factor: self.config.scale_factor,
            runtime: RuntimeClass::Gpu,
        }
    }

    async fn infer(
        &self,
        request: &SrRequest<'_>,
    ) -> Result<SrOutput, SrProviderError> {
        let missing = missing_bands(&request.native.bands, &STACK_ORDER);
        if !missing.is_empty() {
            return Err(SrProviderError::MissingBands(missing));
        }

        let input: BandRasters = STACK_ORDER
            .iter()
            .filter_map(|band| {
                request.native.bands.get(band).map(|r| (*band, r.clone()))
            })
            .collect();
        let input_path = request.work_dir.join(INPUT_FILE);
        self.raster
            .write_stack(&input_path, &input, &STACK_ORDER)
            .await
            .map_err(SrProviderError::Raster)?;
        debug!(
            job_id = %request.job_id,
            input = %input_path.display(),
            "wrote model input stack"
        );

        let limit = Duration::from_secs(self.config.timeout_secs);
        run_process(self.command(request), limit).await?;

        let output = request.output_path();
        if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return Err(SrProviderError::MissingOutput(
                output.display().to_string(),
            ));
        }
        let bands = self
            .raster
            .read_stack(&output, &STACK_ORDER)
            .await
            .map_err(SrProviderError::Raster)?;
        info!(
            job_id = %request.job_id,
            device = ?request.device,
            model = %self.config.model_name,
            "local model inference finished"
        );

        Ok(SrOutput {
            bands,
            raster_path: Some(output),
        })
    }
}
