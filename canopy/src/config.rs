use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::runtime::RuntimeConfig;
use crate::sr::{SrProviderConfig, SrProviderKind};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    #[default]
    Development,
    Production,
}

/// Thresholds applied by the orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// Default cloud cap in percent when a request does not set one.
    pub cloud_cap_percent: f64,
    pub min_valid_pixel_ratio: f64,
    pub min_scene_coverage_ratio: f64,
    /// Days searched back from `date_to` when `date_from` is unset.
    pub search_window_days: u32,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            cloud_cap_percent: 20.0,
            min_valid_pixel_ratio: 0.60,
            min_scene_coverage_ratio: 0.98,
            search_window_days: 30,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SrSettings {
    pub provider: SrProviderConfig,
    /// Organisation flag value when no override exists.
    pub analytics_default: bool,
    /// Parent of per-job scratch directories; the system temp dir if unset.
    pub work_dir: Option<PathBuf>,
    /// Outer wall-clock limit around any provider call.
    pub wall_clock_secs: u64,
}

impl Default for SrSettings {
    fn default() -> Self {
        Self {
            provider: SrProviderConfig::Disabled,
            analytics_default: false,
            work_dir: None,
            wall_clock_secs: 1800,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub tick_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: 60,
        }
    }
}

/// Top-level configuration, usually loaded from a TOML file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub profile: Profile,
    pub analysis: AnalysisSettings,
    pub sr: SrSettings,
    pub runtime: RuntimeConfig,
    pub scheduler: SchedulerSettings,
}

impl AppConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw =
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let analysis = &self.analysis;
        if !(0.0..=100.0).contains(&analysis.cloud_cap_percent) {
            return Err(ConfigError::Invalid {
                field: "analysis.cloud_cap_percent",
                reason: format!("{} is outside 0..=100", analysis.cloud_cap_percent),
            });
        }
        for (field, value) in [
            ("analysis.min_valid_pixel_ratio", analysis.min_valid_pixel_ratio),
            (
                "analysis.min_scene_coverage_ratio",
                analysis.min_scene_coverage_ratio,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value} is outside 0..=1"),
                });
            }
        }
        if analysis.search_window_days == 0 {
            return Err(ConfigError::Invalid {
                field: "analysis.search_window_days",
                reason: "must be positive".into(),
            });
        }

        self.sr.provider.validate()?;
        if self.sr.wall_clock_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "sr.wall_clock_secs",
                reason: "must be positive".into(),
            });
        }
        if self.profile == Profile::Production
            && self.sr.provider.kind() == Some(SrProviderKind::Nearest)
        {
            return Err(ConfigError::Invalid {
                field: "sr.provider",
                reason: "the nearest debug provider is not allowed in production"
                    .into(),
            });
        }

        if self.scheduler.tick_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.tick_secs",
                reason: "must be positive".into(),
            });
        }
        self.runtime.validate()
    }
}
