use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{
    CommandConfig, RuntimeClass, SrCapabilities, SrOutput, SrProvider,
    SrProviderKind, SrRequest, run_process,
};
use crate::error::SrProviderError;
use crate::geometry::Polygon;
use crate::raster::RasterIo;

const AOI_FILE: &str = "aoi.geojson";

/// Substitutes the supported placeholders in `template`.
///
/// `{date}` is the ISO date, `{geojson}` the path of the AOI feature file,
/// `{output}` the output path and `{bbox_w}`, `{bbox_s}`, `{bbox_e}`,
/// `{bbox_n}` the AOI bounds in degrees, always with a fraction or exponent.
/// The template is scanned once, so substituted text is never expanded
/// again. Anything else is left as is.
pub fn render_template(
    template: &str,
    date: chrono::NaiveDate,
    geojson_path: &Path,
    output_path: &Path,
    aoi: &Polygon,
) -> String {
    let bbox = aoi.bbox();
    let values = [
        ("date", date.format("%Y-%m-%d").to_string()),
        ("geojson", geojson_path.display().to_string()),
        ("output", output_path.display().to_string()),
        ("bbox_w", float_repr(bbox.west)),
        ("bbox_s", float_repr(bbox.south)),
        ("bbox_e", float_repr(bbox.east)),
        ("bbox_n", float_repr(bbox.north)),
    ];

    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let tail = &rest[open + 1..];
        let hit = values.iter().find(|(name, _)| {
            tail.strip_prefix(name).is_some_and(|after| after.starts_with('}'))
        });
        match hit {
            Some((name, value)) => {
                rendered.push_str(value);
                rest = &tail[name.len() + 1..];
            }
            None => {
                rendered.push('{');
                rest = tail;
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

/// Shortest round-trip decimal that always carries a fraction or an
/// exponent: `49.0`, `2.75`, `1e-05`, `1e+16`.
fn float_repr(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    // Debug already switches to exponent form outside [1e-4, 1e16).
    let debug = format!("{value:?}");
    match debug.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => debug,
    }
}

/// Runs an operator-supplied shell command that writes a GeoTIFF stack.
pub struct CommandProvider {
    config: CommandConfig,
    raster: Arc<dyn RasterIo>,
}

impl CommandProvider {
    pub fn new(config: CommandConfig, raster: Arc<dyn RasterIo>) -> Self {
        Self { config, raster }
    }
}

/// First `*.tif` / `*.tiff` in `dir`, by name.
async fn first_tiff(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_tiff = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                ext.eq_ignore_ascii_case("tif") || ext.eq_ignore_ascii_case("tiff")
            });
        if is_tiff {
            found.push(path);
        }
    }
    found.sort();
    Ok(found.into_iter().next())
}

#[async_trait]
impl SrProvider for CommandProvider {
    fn kind(&self) -> SrProviderKind {
        SrProviderKind::ExternalCommand
    }

    fn capabilities(&self) -> SrCapabilities {
        SrCapabilities {
            provider: SrProviderKind::ExternalCommand,
            model_name: self.config.model_name.clone(),
            model_version: None,
            supported_bands: self.config.output_bands.clone(),
            scale_factor: self.config.scale_factor,
            runtime: RuntimeClass::External,
        }
    }

    async fn infer(
        &self,
        request: &SrRequest<'_>,
    ) -> Result<SrOutput, SrProviderError> {
        let geojson_path = request.work_dir.join(AOI_FILE);
        let feature = serde_json::to_vec(&request.aoi.to_feature())
            .map_err(|e| SrProviderError::Io(e.into()))?;
        tokio::fs::write(&geojson_path, feature).await?;

        let output = request.output_path();
        let rendered = render_template(
            &self.config.template,
            request.acquired_on,
            &geojson_path,
            &output,
            request.aoi,
        );
        debug!(job_id = %request.job_id, command = %rendered, "running SR command");

        let mut command = Command::new("sh");
        command.arg("-c").arg(&rendered).current_dir(request.work_dir);
        let limit = Duration::from_secs(self.config.timeout_secs);
        run_process(command, limit).await?;

        let produced = if tokio::fs::try_exists(&output).await.unwrap_or(false) {
            output
        } else {
            match first_tiff(request.work_dir).await? {
                Some(path) => {
                    warn!(
                        job_id = %request.job_id,
                        path = %path.display(),
                        "SR command did not write {{output}}; using first GeoTIFF"
                    );
                    path
                }
                None => {
                    return Err(SrProviderError::MissingOutput(
                        output.display().to_string(),
                    ));
                }
            }
        };

        let bands = self
            .raster
            .read_stack(&produced, &self.config.output_bands)
            .await
            .map_err(SrProviderError::Raster)?;
        Ok(SrOutput {
            bands,
            raster_path: Some(produced),
        })
    }
}
