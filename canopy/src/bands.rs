//! Band identifiers, index names and the table that links them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::str::FromStr;

/// Sentinel-2 band identifiers used by the index table.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum BandId {
    /// Blue
    B02,
    /// Green
    B03,
    /// Red
    B04,
    /// Red edge
    B05,
    /// Near infrared
    B08,
    /// Short-wave infrared
    B11,
}

impl BandId {
    pub const ALL: [BandId; 6] = [
        BandId::B02,
        BandId::B03,
        BandId::B04,
        BandId::B05,
        BandId::B08,
        BandId::B11,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::B02 => "B02",
            Self::B03 => "B03",
            Self::B04 => "B04",
            Self::B05 => "B05",
            Self::B08 => "B08",
            Self::B11 => "B11",
        }
    }
}

impl Display for BandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BandId {
    type Err = String;

    /// Accepts band codes and the common colour aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "B02" | "BLUE" => Ok(Self::B02),
            "B03" | "GREEN" => Ok(Self::B03),
            "B04" | "RED" => Ok(Self::B04),
            "B05" | "REDEDGE" | "RED_EDGE" => Ok(Self::B05),
            "B08" | "NIR" => Ok(Self::B08),
            "B11" | "SWIR" | "SWIR16" => Ok(Self::B11),
            other => Err(format!("unknown band {other:?}")),
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndexName {
    Ndvi,
    Ndmi,
    Ndwi,
    Evi,
    Ndre,
    Savi,
}

impl IndexName {
    pub const ALL: [IndexName; 6] = [
        IndexName::Ndvi,
        IndexName::Ndmi,
        IndexName::Ndwi,
        IndexName::Evi,
        IndexName::Ndre,
        IndexName::Savi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ndvi => "NDVI",
            Self::Ndmi => "NDMI",
            Self::Ndwi => "NDWI",
            Self::Evi => "EVI",
            Self::Ndre => "NDRE",
            Self::Savi => "SAVI",
        }
    }

    pub fn required_bands(&self) -> &'static [BandId] {
        use BandId::*;
        match self {
            Self::Ndvi => &[B08, B04],
            Self::Ndmi => &[B08, B11],
            Self::Ndwi => &[B03, B08],
            Self::Evi => &[B08, B04, B02],
            Self::Ndre => &[B08, B05],
            // L = 0.5 is a constant, no soil-brightness band is read.
            Self::Savi => &[B08, B04],
        }
    }

    pub fn is_computable_from(&self, bands: &BTreeSet<BandId>) -> bool {
        self.required_bands().iter().all(|b| bands.contains(b))
    }
}

impl Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IndexName::ALL
            .into_iter()
            .find(|index| index.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown index {s:?}"))
    }
}

/// Indices whose required bands are all present in `bands`.
pub fn computable(bands: &BTreeSet<BandId>) -> BTreeSet<IndexName> {
    IndexName::ALL
        .into_iter()
        .filter(|index| index.is_computable_from(bands))
        .collect()
}

/// `requested` defaults to every index when the job did not narrow it.
pub fn requested_set(requested: Option<&[IndexName]>) -> BTreeSet<IndexName> {
    match requested {
        Some(list) => list.iter().copied().collect(),
        None => IndexName::ALL.into_iter().collect(),
    }
}

/// Indices that may be recomputed from SR output: computed natively,
/// computable from the SR bands and requested. Empty when the
/// organisation has SR analytics disabled.
pub fn sr_eligible(
    native: &BTreeSet<IndexName>,
    sr_bands: &BTreeSet<BandId>,
    sr_analytics_enabled: bool,
    requested: &BTreeSet<IndexName>,
) -> BTreeSet<IndexName> {
    if !sr_analytics_enabled {
        return BTreeSet::new();
    }
    let from_sr = computable(sr_bands);
    native
        .iter()
        .filter(|index| from_sr.contains(index) && requested.contains(index))
        .copied()
        .collect()
}
