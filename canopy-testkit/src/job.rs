use canopy::*;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Default test field: a ~1 km square in southern France.
pub fn field_bbox() -> BoundingBox {
    BoundingBox::new(4.80, 43.90, 4.81, 43.91)
}

pub fn test_field(name: &str) -> FieldRecord {
    FieldRecord {
        id: FieldId::new(),
        organization_id: OrganizationId::new(),
        name: name.to_string(),
        geometry: field_bbox().to_polygon(),
        schedule: ScheduleConfig::default(),
    }
}

/// Field owned by `organization_id` with the given schedule.
pub fn scheduled_field(
    organization_id: OrganizationId,
    schedule: ScheduleConfig,
) -> FieldRecord {
    FieldRecord {
        organization_id,
        schedule,
        ..test_field("scheduled")
    }
}

pub fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0)
        .single()
        .unwrap_or_else(|| panic!("invalid test instant {y}-{m}-{d} {h}:{min}"))
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap_or_else(|| panic!("invalid test date {y}-{m}-{d}"))
}

/// Builder for catalog hits. Defaults to a clear Sentinel-2 scene
/// carrying every band, acquired on 2026-06-10 and covering the field.
#[derive(Clone, Debug)]
pub struct SceneBuilder {
    scene: SceneCandidate,
}

impl SceneBuilder {
    pub fn new(scene_id: &str) -> Self {
        Self {
            scene: SceneCandidate {
                scene_id: scene_id.to_string(),
                collection: "sentinel-2-l2a".to_string(),
                acquired_at: utc(2026, 6, 10, 10, 30),
                cloud_cover: Some(5.0),
                footprint: None,
                bbox: Some(BoundingBox::new(4.0, 43.0, 5.5, 44.5)),
                bands: BandId::ALL.into_iter().collect(),
                assets: BTreeMap::from([(
                    "visual".to_string(),
                    format!("https://imagery.test/{scene_id}/TCI.tif"),
                )]),
                field_coverage_ratio: None,
            },
        }
    }

    pub fn acquired(mut self, at: DateTime<Utc>) -> Self {
        self.scene.acquired_at = at;
        self
    }

    pub fn cloud(mut self, percent: f64) -> Self {
        self.scene.cloud_cover = Some(percent);
        self
    }

    pub fn unknown_cloud(mut self) -> Self {
        self.scene.cloud_cover = None;
        self
    }

    pub fn bands(mut self, bands: &[BandId]) -> Self {
        self.scene.bands = bands.iter().copied().collect::<BTreeSet<_>>();
        self
    }

    pub fn coverage(mut self, ratio: f64) -> Self {
        self.scene.field_coverage_ratio = Some(ratio);
        self
    }

    pub fn bbox(mut self, bbox: BoundingBox) -> Self {
        self.scene.bbox = Some(bbox);
        self
    }

    pub fn build(self) -> SceneCandidate {
        self.scene
    }
}

/// Request scoped to the 2026-06-01..2026-06-30 search window.
pub fn june_request(field_id: FieldId) -> AnalysisRequest {
    AnalysisRequest {
        date_from: Some(date(2026, 6, 1)),
        date_to: Some(date(2026, 6, 30)),
        ..AnalysisRequest::for_field(field_id)
    }
}

pub fn job_for(
    field: &FieldRecord,
    request: AnalysisRequest,
    sr_analytics_enabled: bool,
    queue: QueueName,
) -> AnalysisJob {
    AnalysisJob::new(
        request,
        JobContext {
            organization_id: field.organization_id,
            sr_analytics_enabled,
        },
        queue,
    )
}

/// Observation with a single native NDVI mean, for history and alert tests.
pub fn ndvi_observation(
    field_id: FieldId,
    observed_on: NaiveDate,
    mean: f64,
) -> Observation {
    let stats = IndexStats {
        mean,
        min: mean,
        max: mean,
        p10: mean,
        p90: mean,
        pixel_count: 100,
    };
    Observation {
        id: ObservationId::new(),
        field_id,
        job_id: JobId::new(),
        scene_id: format!("S2_{observed_on}"),
        observed_on,
        status: ObservationStatus::Succeeded,
        cloud_cover: 2.0,
        valid_pixel_ratio: 0.95,
        indices_native: BTreeMap::from([(
            IndexName::Ndvi,
            IndexResult {
                stats: Some(stats),
                layer: None,
                provenance: Provenance::Native,
            },
        )]),
        indices_sr: BTreeMap::new(),
        sr_model: None,
        created_at: Utc::now(),
    }
}
