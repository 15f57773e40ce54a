//! Super-resolution providers.
//!
//! A provider turns the native bands of a scene into a higher-resolution
//! band set. The model behind it is a black box: a local worker process,
//! an HTTP service, an arbitrary shell command, or the nearest-neighbour
//! debug provider. One provider is chosen at start-up with
//! [`build_provider`] and shared behind `Arc<dyn SrProvider>`.

mod command;
mod local_model;
mod nearest;
mod service;

pub use command::{CommandProvider, render_template};
pub use local_model::LocalModelProvider;
pub use nearest::NearestProvider;
pub use service::ServiceProvider;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use crate::bands::BandId;
use crate::error::{ConfigError, SrProviderError};
use crate::geometry::Polygon;
use crate::job::JobId;
use crate::raster::{BandPatch, BandRasters, RasterIo};

/// File name of the provider output inside the job work directory.
pub const OUTPUT_FILE: &str = "sr_output.tif";

/// Band order of stacks handed to and read back from model processes.
pub const STACK_ORDER: [BandId; 4] =
    [BandId::B04, BandId::B03, BandId::B02, BandId::B08];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SrProviderKind {
    LocalModel,
    ExternalService,
    ExternalCommand,
    Nearest,
}

impl SrProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalModel => "local_model",
            Self::ExternalService => "external_service",
            Self::ExternalCommand => "external_command",
            Self::Nearest => "nearest",
        }
    }
}

impl Display for SrProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeClass {
    Gpu,
    External,
    Cpu,
}

/// Model metadata recorded on observations that carry SR indices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrCapabilities {
    pub provider: SrProviderKind,
    pub model_name: String,
    pub model_version: Option<String>,
    pub supported_bands: Vec<BandId>,
    pub scale_factor: u32,
    pub runtime: RuntimeClass,
}

pub struct SrRequest<'a> {
    pub job_id: JobId,
    pub scene_id: &'a str,
    pub acquired_on: NaiveDate,
    pub aoi: &'a Polygon,
    pub native: &'a BandPatch,
    pub source_assets: &'a BTreeMap<String, String>,
    /// Scratch directory owned by the caller for the request's lifetime.
    pub work_dir: &'a Path,
    /// Accelerator the calling worker holds, if any.
    pub device: Option<u32>,
}

impl SrRequest<'_> {
    pub fn output_path(&self) -> PathBuf {
        self.work_dir.join(OUTPUT_FILE)
    }
}

#[derive(Clone, Debug)]
pub struct SrOutput {
    pub bands: BandRasters,
    pub raster_path: Option<PathBuf>,
}

#[async_trait]
pub trait SrProvider: Send + Sync {
    fn kind(&self) -> SrProviderKind;

    fn capabilities(&self) -> SrCapabilities;

    async fn infer(
        &self,
        request: &SrRequest<'_>,
    ) -> Result<SrOutput, SrProviderError>;
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_timeout_secs() -> u64 {
    1800
}

fn default_stack_order() -> Vec<BandId> {
    STACK_ORDER.to_vec()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalModelConfig {
    #[serde(default = "default_python")]
    pub python: String,
    pub script: PathBuf,
    pub model_dir: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "LocalModelConfig::default_scale")]
    pub scale_factor: u32,
    #[serde(default = "LocalModelConfig::default_model_name")]
    pub model_name: String,
    #[serde(default)]
    pub model_version: Option<String>,
}

impl LocalModelConfig {
    fn default_scale() -> u32 {
        4
    }

    fn default_model_name() -> String {
        "sr4rs".to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "ServiceConfig::default_scale")]
    pub scale_factor: u32,
    #[serde(default = "ServiceConfig::default_model_name")]
    pub model_name: String,
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default = "default_stack_order")]
    pub requested_bands: Vec<BandId>,
}

impl ServiceConfig {
    fn default_scale() -> u32 {
        10
    }

    fn default_model_name() -> String {
        "external-service".to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub template: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "CommandConfig::default_scale")]
    pub scale_factor: u32,
    #[serde(default = "CommandConfig::default_model_name")]
    pub model_name: String,
    /// Band layout of the stack the command writes.
    #[serde(default = "default_stack_order")]
    pub output_bands: Vec<BandId>,
}

impl CommandConfig {
    fn default_scale() -> u32 {
        10
    }

    fn default_model_name() -> String {
        "external-command".to_string()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum SrProviderConfig {
    #[default]
    Disabled,
    LocalModel(LocalModelConfig),
    ExternalService(ServiceConfig),
    ExternalCommand(CommandConfig),
    Nearest {
        #[serde(default = "NearestProvider::default_scale")]
        scale_factor: u32,
    },
}

impl SrProviderConfig {
    pub fn kind(&self) -> Option<SrProviderKind> {
        match self {
            Self::Disabled => None,
            Self::LocalModel(_) => Some(SrProviderKind::LocalModel),
            Self::ExternalService(_) => Some(SrProviderKind::ExternalService),
            Self::ExternalCommand(_) => Some(SrProviderKind::ExternalCommand),
            Self::Nearest { .. } => Some(SrProviderKind::Nearest),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (timeout_secs, scale_factor) = match self {
            Self::Disabled => return Ok(()),
            Self::LocalModel(c) => (c.timeout_secs, c.scale_factor),
            Self::ExternalService(c) => {
                if c.url.trim().is_empty() {
                    return Err(ConfigError::Invalid {
                        field: "sr.url",
                        reason: "must not be empty".into(),
                    });
                }
                (c.timeout_secs, c.scale_factor)
            }
            Self::ExternalCommand(c) => {
                if c.template.trim().is_empty() {
                    return Err(ConfigError::Invalid {
                        field: "sr.template",
                        reason: "must not be empty".into(),
                    });
                }
                (c.timeout_secs, c.scale_factor)
            }
            Self::Nearest { scale_factor } => (1, *scale_factor),
        };
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "sr.timeout_secs",
                reason: "must be positive".into(),
            });
        }
        if scale_factor == 0 {
            return Err(ConfigError::Invalid {
                field: "sr.scale_factor",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Builds the configured provider. `Disabled` yields `None`.
pub fn build_provider(
    config: &SrProviderConfig,
    raster: Arc<dyn RasterIo>,
) -> Result<Option<Arc<dyn SrProvider>>, ConfigError> {
    config.validate()?;
    let provider: Arc<dyn SrProvider> = match config {
        SrProviderConfig::Disabled => return Ok(None),
        SrProviderConfig::LocalModel(c) => {
            Arc::new(LocalModelProvider::new(c.clone(), raster))
        }
        SrProviderConfig::ExternalService(c) => {
            Arc::new(ServiceProvider::new(c.clone(), raster).map_err(|e| {
                ConfigError::Invalid {
                    field: "sr.url",
                    reason: e.to_string(),
                }
            })?)
        }
        SrProviderConfig::ExternalCommand(c) => {
            Arc::new(CommandProvider::new(c.clone(), raster))
        }
        SrProviderConfig::Nearest { scale_factor } => {
            Arc::new(NearestProvider::new(*scale_factor))
        }
    };
    Ok(Some(provider))
}

/// Runs a prepared process under a wall-clock limit. On unix the process
/// leads its own process group and the whole group is killed when the
/// limit expires, so helpers forked by a shell do not outlive the job.
pub(crate) async fn run_process(
    mut command: Command,
    limit: Duration,
) -> Result<Output, SrProviderError> {
    command
        .kill_on_drop(true)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    #[cfg(unix)]
    command.process_group(0);

    let child = command.spawn()?;
    let group = child.id();
    let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => {
            if let Some(group) = group {
                kill_process_group(group).await;
            }
            return Err(SrProviderError::Timeout(limit));
        }
    };

    if !output.status.success() {
        return Err(SrProviderError::Exit {
            code: output.status.code(),
            stderr: stderr_tail(&output.stderr),
        });
    }
    Ok(output)
}

#[cfg(unix)]
async fn kill_process_group(group: u32) {
    let killed = Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{group}"))
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await;
    match killed {
        Ok(status) if status.success() => {}
        // The group is already gone when the leader had no children left.
        Ok(status) => tracing::debug!(group, %status, "process group kill found nothing"),
        Err(err) => tracing::warn!(group, "process group kill failed: {err}"),
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_group: u32) {}

fn stderr_tail(stderr: &[u8]) -> String {
    const MAX: usize = 2000;
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut start = text.len() - MAX;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Bands from `order` missing in `bands`.
pub(crate) fn missing_bands(bands: &BandRasters, order: &[BandId]) -> Vec<BandId> {
    order
        .iter()
        .filter(|band| !bands.contains_key(band))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_config_from_toml() {
        let config: SrProviderConfig = toml::from_str(
            r#"
            provider = "external_command"
            template = "run-sr --date {date} --out {output}"
            timeout_secs = 60
            "#,
        )
        .unwrap();
        match &config {
            SrProviderConfig::ExternalCommand(c) => {
                assert_eq!(c.timeout_secs, 60);
                assert_eq!(c.scale_factor, 10);
                assert_eq!(c.output_bands, STACK_ORDER.to_vec());
            }
            other => panic!("unexpected config {other:?}"),
        }
        assert_eq!(config.kind(), Some(SrProviderKind::ExternalCommand));
    }

    #[test]
    fn local_model_defaults() {
        let config: SrProviderConfig = toml::from_str(
            r#"
            provider = "local_model"
            script = "/opt/sr4rs/sr.py"
            model_dir = "/opt/sr4rs/model"
            "#,
        )
        .unwrap();
        let SrProviderConfig::LocalModel(c) = config else {
            panic!("expected local model");
        };
        assert_eq!(c.python, "python3");
        assert_eq!(c.timeout_secs, 1800);
        assert_eq!(c.scale_factor, 4);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = SrProviderConfig::ExternalCommand(CommandConfig {
            template: "true".into(),
            timeout_secs: 0,
            scale_factor: 2,
            model_name: "x".into(),
            output_bands: STACK_ORDER.to_vec(),
        });
        assert!(config.validate().is_err());
        assert!(SrProviderConfig::Disabled.validate().is_ok());
    }

    /// True while `pid` exists and is not a zombie.
    #[cfg(target_os = "linux")]
    fn is_running(pid: &str) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| {
                let state = stat.rsplit_once(')')?.1.trim_start().chars().next()?;
                Some(state != 'Z' && state != 'X')
            })
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_forked_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("helper.pid");
        let mut command = Command::new("sh");
        command.arg("-c").arg(format!(
            "sleep 30 & echo $! > {}; wait",
            pid_file.display()
        ));

        let err = run_process(command, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, SrProviderError::Timeout(_)), "{err}");

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while is_running(&pid) {
            assert!(
                std::time::Instant::now() < deadline,
                "helper {pid} outlived the timeout"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn non_zero_exit_keeps_stderr() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("echo broken >&2; exit 4");
        match run_process(command, Duration::from_secs(5)).await {
            Err(SrProviderError::Exit { code, stderr }) => {
                assert_eq!(code, Some(4));
                assert_eq!(stderr, "broken");
            }
            other => panic!("expected exit error, got {other:?}"),
        }
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let long = "x".repeat(5000) + "boom";
        let tail = stderr_tail(long.as_bytes());
        assert_eq!(tail.len(), 2000);
        assert!(tail.ends_with("boom"));
    }
}
