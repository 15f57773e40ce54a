//! Per-job analysis pipeline.
//!
//! [`AnalysisOrchestrator::run`] takes a claimed job from scene selection
//! to a terminal [`JobOutcome`]: quality gate, native indices, optional
//! super-resolution, layer and observation persistence, and alerts. It
//! never returns an error; every failure is folded into the outcome so
//! the worker can write exactly one terminal status.

use async_trait::async_trait;
use chrono::{Days, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, error, info, warn};

use crate::alerts::{Alert, AlertGenerator, AlertStore};
use crate::bands::{self, BandId, IndexName};
use crate::catalog::{SceneCandidate, SceneCatalog, SceneQuery};
use crate::config::AnalysisSettings;
use crate::error::AnalysisError;
use crate::field::{FieldDirectory, FieldRecord};
use crate::indices::{ComputedIndex, IndexResult, NativeIndexEngine, upscale_mask, valid_pixel_ratio};
use crate::job::{AnalysisJob, JobResult, JobStatus};
use crate::lease::JobLease;
use crate::observation::{Observation, ObservationId, ObservationStatus, ObservationStore};
use crate::quality::{QualityDecision, QualityGate, SkipReason};
use crate::queue::JobCompletion;
use crate::raster::{BandPatch, LayerData, LayerKind, LayerRef, LayerStore, LayerUpload, Provenance, RasterIo};
use crate::runtime::{DispatchContext, JobDispatcher};
use crate::sr::{SrCapabilities, SrProvider, SrRequest};
use crate::telemetry;

/// Machine-readable reasons stored on job results.
pub mod reason {
    pub const REQUESTED_SCENE_NOT_FOUND: &str = "REQUESTED_SCENE_NOT_FOUND";
    pub const NO_SCENE_AVAILABLE: &str = "NO_SCENE_AVAILABLE";
    pub const NO_SCENE_MEETS_COVERAGE: &str = "NO_SCENE_MEETS_COVERAGE";
    pub const LOW_SCENE_COVERAGE: &str = "LOW_SCENE_COVERAGE";
    pub const DISPATCH_ABORTED: &str = "DISPATCH_ABORTED";
    pub const COMPLETION_WRITE_FAILED: &str = "COMPLETION_WRITE_FAILED";
    pub const CANCELLED: &str = "cancelled";
}

const RGB: [BandId; 3] = [BandId::B04, BandId::B03, BandId::B02];

/// Terminal result of one job.
#[derive(Clone, Debug)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub result: JobResult,
    pub error_message: Option<String>,
    pub observation: Option<Observation>,
    pub alerts: Vec<Alert>,
}

impl JobOutcome {
    pub fn succeeded(result: JobResult, observation: Observation) -> Self {
        Self {
            status: JobStatus::Succeeded,
            result,
            error_message: None,
            observation: Some(observation),
            alerts: Vec::new(),
        }
    }

    pub fn skipped(result: JobResult) -> Self {
        Self {
            status: JobStatus::Skipped,
            result,
            error_message: None,
            observation: None,
            alerts: Vec::new(),
        }
    }

    pub fn failed(error: &AnalysisError, mut result: JobResult) -> Self {
        if result.reason.is_none() {
            result.reason = Some(error.reason_code().to_string());
        }
        Self {
            status: JobStatus::Failed,
            result,
            error_message: Some(error.to_string()),
            observation: None,
            alerts: Vec::new(),
        }
    }

    /// The dispatcher never produced an outcome.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            result: JobResult::with_reason(reason::DISPATCH_ABORTED),
            error_message: Some(message.into()),
            observation: None,
            alerts: Vec::new(),
        }
    }

    /// Replaces a result the queue would not accept. Whatever was already
    /// persisted (observation, alerts) is kept so its events still go out.
    pub fn write_failed(self, message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            result: JobResult::with_reason(reason::COMPLETION_WRITE_FAILED),
            error_message: Some(message.into()),
            ..self
        }
    }

    pub fn completion(&self) -> JobCompletion {
        JobCompletion {
            status: self.status,
            result: Some(self.result.clone()),
            error_message: self.error_message.clone(),
        }
    }
}

/// An [`AnalysisError`] with whatever result fields were known when it
/// happened.
struct Failure {
    error: AnalysisError,
    result: JobResult,
}

impl Failure {
    fn new(error: AnalysisError, result: JobResult) -> Self {
        Self { error, result }
    }
}

impl From<AnalysisError> for Failure {
    fn from(error: AnalysisError) -> Self {
        Self::new(error, JobResult::default())
    }
}

enum SceneChoice {
    Use { scene: SceneCandidate, coverage: f64 },
    Skip(JobResult),
}

/// What the SR pass contributed.
#[derive(Default)]
struct SrPass {
    indices: BTreeMap<IndexName, IndexResult>,
    visualization_generated: bool,
    error: Option<String>,
    capabilities: Option<SrCapabilities>,
}

impl SrPass {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Everything the orchestrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub fields: Arc<dyn FieldDirectory>,
    pub catalog: Arc<dyn SceneCatalog>,
    pub raster: Arc<dyn RasterIo>,
    pub layers: Arc<dyn LayerStore>,
    pub observations: Arc<dyn ObservationStore>,
    pub alerts: Arc<dyn AlertStore>,
}

pub struct AnalysisOrchestrator {
    settings: AnalysisSettings,
    gate: QualityGate,
    engine: NativeIndexEngine,
    alert_rules: AlertGenerator,
    deps: Collaborators,
    sr: Option<Arc<dyn SrProvider>>,
    sr_work_root: Option<PathBuf>,
    sr_wall_clock: Duration,
}

impl AnalysisOrchestrator {
    pub fn new(settings: AnalysisSettings, deps: Collaborators) -> Self {
        let gate = QualityGate::new(
            settings.cloud_cap_percent,
            settings.min_valid_pixel_ratio,
        );
        Self {
            settings,
            gate,
            engine: NativeIndexEngine::new(),
            alert_rules: AlertGenerator::default(),
            deps,
            sr: None,
            sr_work_root: None,
            sr_wall_clock: Duration::from_secs(1800),
        }
    }

    pub fn with_sr_provider(mut self, provider: Option<Arc<dyn SrProvider>>) -> Self {
        self.sr = provider;
        self
    }

    pub fn with_sr_work_root(mut self, root: Option<PathBuf>) -> Self {
        self.sr_work_root = root;
        self
    }

    pub fn with_sr_wall_clock(mut self, limit: Duration) -> Self {
        self.sr_wall_clock = limit;
        self
    }

    pub fn sr_provider(&self) -> Option<&Arc<dyn SrProvider>> {
        self.sr.as_ref()
    }

    /// Runs the pipeline for a RUNNING job and derives its alerts.
    pub async fn run(&self, job: &AnalysisJob, ctx: &DispatchContext) -> JobOutcome {
        let mut outcome = match self.analyse(job, ctx).await {
            Ok(outcome) => outcome,
            Err(Failure { error, result }) => {
                warn!(
                    job_id = %job.id,
                    field_id = %job.field_id(),
                    reason = error.reason_code(),
                    error = %error,
                    "analysis failed"
                );
                JobOutcome::failed(&error, result)
            }
        };

        let history = if outcome.observation.is_some() {
            // The store already holds this job's observation.
            let window = self.alert_rules.history_depth + 1;
            match self
                .deps
                .observations
                .recent_for_field(job.field_id(), window)
                .await
            {
                Ok(history) => history,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "could not load observation history");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let alerts = self.alert_rules.for_outcome(job, &outcome, &history);
        for alert in &alerts {
            if let Err(e) = self.deps.alerts.insert(alert).await {
                warn!(
                    job_id = %job.id,
                    category = %alert.category,
                    error = %e,
                    "failed to store alert"
                );
            }
        }
        outcome.alerts = alerts;
        outcome
    }

    async fn analyse(
        &self,
        job: &AnalysisJob,
        ctx: &DispatchContext,
    ) -> Result<JobOutcome, Failure> {
        let request = &job.request;
        let field = self
            .deps
            .fields
            .get(job.field_id())
            .await
            .map_err(AnalysisError::Store)?
            .ok_or_else(|| AnalysisError::UnknownField {
                field_id: job.field_id().to_string(),
            })?;

        let (scene, coverage) = match self.resolve_scene(job, &field).await? {
            SceneChoice::Use { scene, coverage } => (scene, coverage),
            SceneChoice::Skip(result) => {
                info!(
                    job_id = %job.id,
                    reason = ?result.reason,
                    "no usable scene, skipping"
                );
                return Ok(JobOutcome::skipped(result));
            }
        };

        let mut result = JobResult {
            scene_id: Some(scene.scene_id.clone()),
            field_coverage_ratio: Some(coverage),
            include_radar_overlay: Some(request.include_radar_overlay),
            ..JobResult::default()
        };

        let read_bands: Vec<BandId> = scene.bands.iter().copied().collect();
        let patch = match self
            .deps
            .raster
            .read_scene(&scene, &field.geometry, &read_bands)
            .await
        {
            Ok(patch) => patch,
            Err(e) => {
                return Err(Failure::new(AnalysisError::Raster(e), result));
            }
        };

        let decision = self.gate.decide(
            scene.cloud_cover,
            valid_pixel_ratio(&patch.valid_mask),
            request.max_cloud,
        );
        result.cloud_cover = Some(decision.cloud_cover);
        result.valid_pixel_ratio = Some(decision.valid_pixel_ratio);

        if let Some(skip) = decision.reason {
            telemetry::record_quality_skip(job.queue, skip);
            result.reason = Some(describe_skip(&decision, skip));
            info!(
                job_id = %job.id,
                scene_id = %scene.scene_id,
                cloud_cover = decision.cloud_cover,
                valid_pixel_ratio = decision.valid_pixel_ratio,
                reason = ?skip,
                "scene rejected by quality gate"
            );
            return Ok(JobOutcome::skipped(result));
        }

        let requested = bands::requested_set(request.indices.as_deref());
        let targets: Vec<IndexName> = bands::computable(&scene.bands)
            .intersection(&requested)
            .copied()
            .collect();
        let native = match self.engine.compute(&patch, &targets, Provenance::Native) {
            Ok(native) => native,
            Err(e) => return Err(Failure::new(e, result)),
        };
        debug!(job_id = %job.id, indices = ?targets, "native indices computed");

        let observation_id = ObservationId::new();
        let native_keys: BTreeSet<IndexName> = native.keys().copied().collect();

        let sr = if request.include_sr {
            self.super_resolve(job, ctx, &scene, &field, &patch, observation_id, &native_keys, &requested)
                .await
        } else {
            SrPass::default()
        };

        let mut indices_native = BTreeMap::new();
        for (index, computed) in native {
            let layer = match self
                .store_index_layer(job, &scene, observation_id, index, &computed, &patch)
                .await
            {
                Ok(layer) => layer,
                Err(e) => return Err(Failure::new(AnalysisError::Store(e), result)),
            };
            indices_native.insert(index, computed.into_result(Some(layer)));
        }
        self.store_rgb_layer(job, &scene, observation_id, &patch, Provenance::Native)
            .await;

        result.native_indices = Some(indices_native.keys().copied().collect());
        result.sr_requested = Some(request.include_sr);
        result.sr_analytics_enabled = Some(job.context.sr_analytics_enabled);
        result.sr_indices = Some(sr.indices.keys().copied().collect());
        result.sr_visualization_generated = Some(sr.visualization_generated);
        result.sr_error = sr.error.clone();
        if request.include_sr {
            result.sr_provider = self.sr.as_ref().map(|p| p.kind().to_string());
        }

        let observation = Observation {
            id: observation_id,
            field_id: job.field_id(),
            job_id: job.id,
            scene_id: scene.scene_id.clone(),
            observed_on: scene.acquired_on(),
            status: ObservationStatus::Succeeded,
            cloud_cover: decision.cloud_cover,
            valid_pixel_ratio: decision.valid_pixel_ratio,
            indices_native,
            indices_sr: sr.indices,
            sr_model: sr.capabilities,
            created_at: Utc::now(),
        };
        if let Err(e) = self.deps.observations.insert(&observation).await {
            return Err(Failure::new(AnalysisError::Store(e), result));
        }

        info!(
            job_id = %job.id,
            field_id = %job.field_id(),
            scene_id = %scene.scene_id,
            native = observation.indices_native.len(),
            sr = observation.indices_sr.len(),
            sr_error = ?result.sr_error,
            "analysis succeeded"
        );
        Ok(JobOutcome::succeeded(result, observation))
    }

    async fn resolve_scene(
        &self,
        job: &AnalysisJob,
        field: &FieldRecord,
    ) -> Result<SceneChoice, Failure> {
        let request = &job.request;
        let date_to = request.date_to.unwrap_or_else(|| Utc::now().date_naive());
        let date_from = request.date_from.unwrap_or_else(|| {
            date_to
                .checked_sub_days(Days::new(self.settings.search_window_days.into()))
                .unwrap_or(date_to)
        });
        let max_cloud = self.gate.clamp_max_cloud(request.max_cloud);
        let query = SceneQuery {
            aoi: field.geometry.clone(),
            date_from,
            date_to,
            max_cloud,
        };
        let min_coverage = self.settings.min_scene_coverage_ratio;

        if let Some(scene_id) = &request.scene_id {
            let searched = self
                .deps
                .catalog
                .search(&query)
                .await
                .map_err(AnalysisError::Catalog)?
                .into_iter()
                .find(|scene| &scene.scene_id == scene_id);
            let scene = match searched {
                Some(scene) => Some(scene),
                None => self
                    .deps
                    .catalog
                    .get_scene(scene_id)
                    .await
                    .map_err(AnalysisError::Catalog)?,
            };
            let Some(scene) = scene else {
                return Err(Failure::new(
                    AnalysisError::RequestedSceneNotFound {
                        scene_id: scene_id.clone(),
                    },
                    JobResult {
                        scene_id: Some(scene_id.clone()),
                        reason: Some(reason::REQUESTED_SCENE_NOT_FOUND.into()),
                        ..JobResult::default()
                    },
                ));
            };

            let coverage = scene.coverage_of(&field.geometry);
            if coverage < min_coverage {
                return Ok(SceneChoice::Skip(JobResult {
                    scene_id: Some(scene.scene_id.clone()),
                    cloud_cover: scene.cloud_cover,
                    field_coverage_ratio: Some(coverage),
                    reason: Some(reason::LOW_SCENE_COVERAGE.into()),
                    ..JobResult::default()
                }));
            }
            return Ok(SceneChoice::Use { scene, coverage });
        }

        let mut scenes = self
            .deps
            .catalog
            .search(&query)
            .await
            .map_err(AnalysisError::Catalog)?;
        if scenes.is_empty() {
            return Err(Failure::new(
                AnalysisError::ImageryUnavailable {
                    field_id: field.id.to_string(),
                },
                JobResult::with_reason(reason::NO_SCENE_AVAILABLE),
            ));
        }
        scenes.sort_by(|a, b| b.acquired_at.cmp(&a.acquired_at));

        let covering: Vec<(SceneCandidate, f64)> = scenes
            .into_iter()
            .map(|scene| {
                let coverage = scene.coverage_of(&field.geometry);
                (scene, coverage)
            })
            .collect();
        let best_coverage = covering
            .iter()
            .map(|(_, coverage)| *coverage)
            .fold(0.0_f64, f64::max);
        let mut covering: Vec<(SceneCandidate, f64)> = covering
            .into_iter()
            .filter(|(_, coverage)| *coverage >= min_coverage)
            .collect();

        if covering.is_empty() {
            return Ok(SceneChoice::Skip(JobResult {
                field_coverage_ratio: Some(best_coverage),
                reason: Some(reason::NO_SCENE_MEETS_COVERAGE.into()),
                ..JobResult::default()
            }));
        }

        // Newest clear scene, else the newest covering one for the gate
        // to judge.
        let pick = covering
            .iter()
            .position(|(scene, _)| scene.cloud_cover.unwrap_or(0.0) <= max_cloud)
            .unwrap_or(0);
        let (scene, coverage) = covering.swap_remove(pick);
        debug!(
            job_id = %job.id,
            scene_id = %scene.scene_id,
            coverage,
            "scene selected"
        );
        Ok(SceneChoice::Use { scene, coverage })
    }

    #[allow(clippy::too_many_arguments)]
    async fn super_resolve(
        &self,
        job: &AnalysisJob,
        ctx: &DispatchContext,
        scene: &SceneCandidate,
        field: &FieldRecord,
        patch: &BandPatch,
        observation_id: ObservationId,
        native: &BTreeSet<IndexName>,
        requested: &BTreeSet<IndexName>,
    ) -> SrPass {
        let Some(provider) = &self.sr else {
            return SrPass::failed("super-resolution provider is disabled");
        };
        let kind = provider.kind();

        let work_dir = match &self.sr_work_root {
            Some(root) => tempfile::Builder::new().prefix("canopy-sr-").tempdir_in(root),
            None => tempfile::Builder::new().prefix("canopy-sr-").tempdir(),
        };
        let work_dir = match work_dir {
            Ok(dir) => dir,
            Err(e) => {
                telemetry::record_sr_failure(kind, "io");
                return SrPass::failed(format!("could not create SR work dir: {e}"));
            }
        };

        let request = SrRequest {
            job_id: job.id,
            scene_id: &scene.scene_id,
            acquired_on: scene.acquired_on(),
            aoi: &field.geometry,
            native: patch,
            source_assets: &scene.assets,
            work_dir: work_dir.path(),
            device: ctx.device,
        };

        let inferred = tokio::time::timeout(self.sr_wall_clock, provider.infer(&request))
            .instrument(telemetry::sr_span(job.id, kind))
            .await;
        let output = match inferred {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                telemetry::record_sr_failure(kind, e.kind());
                warn!(job_id = %job.id, provider = %kind, error = %e, "SR inference failed");
                return SrPass::failed(e.to_string());
            }
            Err(_) => {
                telemetry::record_sr_failure(kind, "timeout");
                warn!(job_id = %job.id, provider = %kind, "SR inference exceeded wall clock");
                return SrPass::failed(format!(
                    "provider timed out after {:?}",
                    self.sr_wall_clock
                ));
            }
        };

        let mut pass = SrPass {
            visualization_generated: !output.bands.is_empty(),
            capabilities: Some(provider.capabilities()),
            ..SrPass::default()
        };
        let sr_bands: BTreeSet<BandId> = output.bands.keys().copied().collect();
        let eligible = bands::sr_eligible(
            native,
            &sr_bands,
            job.context.sr_analytics_enabled,
            requested,
        );
        let Some(shape) = output.bands.values().next().map(|b| b.dim()) else {
            return pass;
        };

        let factor = (shape.0 / patch.shape().0.max(1)).max(1);
        let sr_patch = BandPatch::new(
            output.bands,
            upscale_mask(&patch.valid_mask, shape),
            patch.transform.refined(factor),
        );
        if pass.visualization_generated {
            self.store_rgb_layer(job, scene, observation_id, &sr_patch, Provenance::ModelDerived)
                .await;
        }
        if eligible.is_empty() {
            return pass;
        }

        let targets: Vec<IndexName> = eligible.into_iter().collect();
        let computed = match self.engine.compute(&sr_patch, &targets, Provenance::ModelDerived) {
            Ok(computed) => computed,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "SR index computation failed");
                pass.error = Some(e.to_string());
                return pass;
            }
        };
        for (index, computed) in computed {
            let layer = match self
                .store_index_layer(job, scene, observation_id, index, &computed, &sr_patch)
                .await
            {
                Ok(layer) => Some(layer),
                Err(e) => {
                    warn!(job_id = %job.id, index = %index, error = %e, "failed to store SR layer");
                    None
                }
            };
            pass.indices.insert(index, computed.into_result(layer));
        }
        pass
    }

    async fn store_index_layer(
        &self,
        job: &AnalysisJob,
        scene: &SceneCandidate,
        observation_id: ObservationId,
        index: IndexName,
        computed: &ComputedIndex,
        patch: &BandPatch,
    ) -> anyhow::Result<LayerRef> {
        self.deps
            .layers
            .put_layer(LayerUpload {
                field_id: job.field_id(),
                observation_id,
                scene_id: &scene.scene_id,
                kind: LayerKind::Index(index),
                provenance: computed.provenance,
                transform: patch.transform,
                data: LayerData::Single(&computed.raster),
            })
            .await
    }

    /// True-colour layer; failures only cost the visualisation.
    async fn store_rgb_layer(
        &self,
        job: &AnalysisJob,
        scene: &SceneCandidate,
        observation_id: ObservationId,
        patch: &BandPatch,
        provenance: Provenance,
    ) -> Option<LayerRef> {
        let [red, green, blue] = RGB.map(|band| patch.band(band));
        let (Some(red), Some(green), Some(blue)) = (red, green, blue) else {
            return None;
        };
        let stored = self
            .deps
            .layers
            .put_layer(LayerUpload {
                field_id: job.field_id(),
                observation_id,
                scene_id: &scene.scene_id,
                kind: LayerKind::Rgb,
                provenance,
                transform: patch.transform,
                data: LayerData::Rgb([red, green, blue]),
            })
            .await;
        match stored {
            Ok(layer) => Some(layer),
            Err(e) => {
                warn!(job_id = %job.id, provenance = provenance.as_str(), error = %e, "failed to store RGB layer");
                None
            }
        }
    }
}

fn describe_skip(decision: &QualityDecision, reason: SkipReason) -> String {
    match reason {
        SkipReason::CloudCover => format!(
            "cloud cover {:.1}% exceeds maximum {:.1}%",
            decision.cloud_cover, decision.max_cloud
        ),
        SkipReason::ValidPixels => format!(
            "valid pixel ratio {:.2} below minimum {:.2}",
            decision.valid_pixel_ratio, decision.min_valid_pixel_ratio
        ),
    }
}

#[async_trait]
impl JobDispatcher for AnalysisOrchestrator {
    async fn dispatch(&self, lease: &JobLease, ctx: &DispatchContext) -> JobOutcome {
        let outcome = self.run(&lease.job, ctx).await;
        if outcome.status == JobStatus::Failed {
            error!(
                job_id = %lease.job_id,
                worker_id = %ctx.worker_id,
                error = ?outcome.error_message,
                "job failed"
            );
        }
        outcome
    }
}
