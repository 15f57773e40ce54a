use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Accept,
    LowQualitySkip,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    CloudCover,
    ValidPixels,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CloudCover => "cloud_cover",
            Self::ValidPixels => "valid_pixels",
        }
    }
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CloudCover => f.write_str("cloud cover above threshold"),
            Self::ValidPixels => f.write_str("valid pixel ratio below threshold"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualityDecision {
    pub cloud_cover: f64,
    pub valid_pixel_ratio: f64,
    pub max_cloud: f64,
    pub min_valid_pixel_ratio: f64,
    pub verdict: Verdict,
    pub reason: Option<SkipReason>,
}

impl QualityDecision {
    pub fn accepted(&self) -> bool {
        self.verdict == Verdict::Accept
    }
}

/// Scene usability gate. Pure; never fails.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QualityGate {
    pub default_max_cloud: f64,
    pub min_valid_pixel_ratio: f64,
}

impl QualityGate {
    pub fn new(default_max_cloud: f64, min_valid_pixel_ratio: f64) -> Self {
        Self {
            default_max_cloud,
            min_valid_pixel_ratio,
        }
    }

    /// Clamps a requested cloud cap to `[0, 100]`; unset or NaN falls back
    /// to the configured default.
    pub fn clamp_max_cloud(&self, requested: Option<f64>) -> f64 {
        match requested {
            Some(value) if !value.is_nan() => value.clamp(0.0, 100.0),
            _ => self.default_max_cloud,
        }
    }

    /// Evaluates a scene. Missing catalog cloud cover counts as clear sky.
    pub fn decide(
        &self,
        cloud_cover: Option<f64>,
        valid_pixel_ratio: f64,
        requested_max_cloud: Option<f64>,
    ) -> QualityDecision {
        Self::evaluate(
            cloud_cover.unwrap_or(0.0),
            valid_pixel_ratio,
            self.clamp_max_cloud(requested_max_cloud),
            self.min_valid_pixel_ratio,
        )
    }

    #[allow(clippy::neg_cmp_op_on_partial_ord)]
    pub fn evaluate(
        cloud_cover: f64,
        valid_pixel_ratio: f64,
        max_cloud: f64,
        min_valid_pixel_ratio: f64,
    ) -> QualityDecision {
        // Comparisons are written so NaN inputs reject.
        let reason = if !(cloud_cover <= max_cloud) {
            Some(SkipReason::CloudCover)
        } else if !(valid_pixel_ratio >= min_valid_pixel_ratio) {
            Some(SkipReason::ValidPixels)
        } else {
            None
        };

        QualityDecision {
            cloud_cover,
            valid_pixel_ratio,
            max_cloud,
            min_valid_pixel_ratio,
            verdict: if reason.is_some() {
                Verdict::LowQualitySkip
            } else {
                Verdict::Accept
            },
            reason,
        }
    }
}
