use async_trait::async_trait;
use canopy::runtime::{DispatchContext, JobDispatcher};
use canopy::sr::{NearestProvider, RuntimeClass, SrCapabilities, SrOutput, SrProvider, SrProviderKind, SrRequest};
use canopy::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::SyntheticRasterIo;

/// Catalog over a fixed scene list. Searches filter by acquisition date
/// only; coverage is left to the caller.
#[derive(Clone, Default)]
pub struct InMemorySceneCatalog {
    scenes: Arc<Mutex<Vec<SceneCandidate>>>,
    searches: Arc<Mutex<Vec<SceneQuery>>>,
}

impl InMemorySceneCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scene(self, scene: SceneCandidate) -> Self {
        self.add_scene(scene);
        self
    }

    pub fn add_scene(&self, scene: SceneCandidate) {
        self.scenes.lock().push(scene);
    }

    pub fn searches(&self) -> Vec<SceneQuery> {
        self.searches.lock().clone()
    }
}

#[async_trait]
impl SceneCatalog for InMemorySceneCatalog {
    async fn search(
        &self,
        query: &SceneQuery,
    ) -> anyhow::Result<Vec<SceneCandidate>> {
        self.searches.lock().push(query.clone());
        Ok(self
            .scenes
            .lock()
            .iter()
            .filter(|scene| {
                let day = scene.acquired_on();
                day >= query.date_from && day <= query.date_to
            })
            .cloned()
            .collect())
    }

    async fn get_scene(
        &self,
        scene_id: &str,
    ) -> anyhow::Result<Option<SceneCandidate>> {
        Ok(self
            .scenes
            .lock()
            .iter()
            .find(|scene| scene.scene_id == scene_id)
            .cloned())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryFieldDirectory {
    fields: Arc<Mutex<HashMap<FieldId, FieldRecord>>>,
}

impl InMemoryFieldDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(self, field: FieldRecord) -> Self {
        self.upsert(field);
        self
    }

    pub fn upsert(&self, field: FieldRecord) {
        self.fields.lock().insert(field.id, field);
    }

    pub fn remove(&self, field_id: FieldId) -> Option<FieldRecord> {
        self.fields.lock().remove(&field_id)
    }
}

#[async_trait]
impl FieldDirectory for InMemoryFieldDirectory {
    async fn get(&self, field_id: FieldId) -> anyhow::Result<Option<FieldRecord>> {
        Ok(self.fields.lock().get(&field_id).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<FieldRecord>> {
        let mut fields: Vec<FieldRecord> = self.fields.lock().values().cloned().collect();
        fields.sort_by_key(|field| field.id);
        Ok(fields)
    }
}

/// What [`InMemoryLayerStore`] kept of an upload.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredLayer {
    pub layer: LayerRef,
    pub field_id: FieldId,
    pub observation_id: ObservationId,
    pub scene_id: String,
    pub kind: LayerKind,
    pub provenance: Provenance,
    pub shape: (usize, usize),
}

#[derive(Clone, Default)]
pub struct InMemoryLayerStore {
    layers: Arc<Mutex<Vec<StoredLayer>>>,
    fail_rgb: Arc<Mutex<bool>>,
}

impl InMemoryLayerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes true-colour uploads fail.
    pub fn fail_rgb(&self) {
        *self.fail_rgb.lock() = true;
    }

    pub fn layers(&self) -> Vec<StoredLayer> {
        self.layers.lock().clone()
    }

    pub fn with_provenance(&self, provenance: Provenance) -> Vec<StoredLayer> {
        self.layers
            .lock()
            .iter()
            .filter(|layer| layer.provenance == provenance)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LayerStore for InMemoryLayerStore {
    async fn put_layer(
        &self,
        upload: LayerUpload<'_>,
    ) -> anyhow::Result<LayerRef> {
        let shape = match upload.data {
            LayerData::Single(raster) => raster.dim(),
            LayerData::Rgb([red, _, _]) => {
                if *self.fail_rgb.lock() {
                    anyhow::bail!("rgb uploads disabled");
                }
                red.dim()
            }
        };
        let suffix = match upload.kind {
            LayerKind::Index(index) => index.as_str().to_ascii_lowercase(),
            LayerKind::Rgb => "rgb".to_string(),
        };
        let layer = LayerRef::new(
            Uuid::new_v4(),
            format!(
                "memory://{}/{}/{}_{}.tif",
                upload.field_id,
                upload.scene_id,
                suffix,
                upload.provenance.as_str().to_ascii_lowercase()
            ),
        );
        self.layers.lock().push(StoredLayer {
            layer: layer.clone(),
            field_id: upload.field_id,
            observation_id: upload.observation_id,
            scene_id: upload.scene_id.to_string(),
            kind: upload.kind,
            provenance: upload.provenance,
            shape,
        });
        Ok(layer)
    }
}

/// One provider call as seen by [`ScriptedSrProvider`].
#[derive(Clone, Debug)]
pub struct SrCall {
    pub job_id: JobId,
    pub device: Option<u32>,
    pub started: Instant,
    pub finished: Instant,
}

/// Scripted SR provider: nearest-neighbour output after a fixed delay, or
/// a scripted failure. Records every call so tests can check device
/// exclusivity.
#[derive(Clone)]
pub struct ScriptedSrProvider {
    kind: SrProviderKind,
    scale_factor: u32,
    delay: Duration,
    failure: Option<String>,
    calls: Arc<Mutex<Vec<SrCall>>>,
    active: Arc<Mutex<HashMap<Option<u32>, usize>>>,
    max_active: Arc<Mutex<HashMap<Option<u32>, usize>>>,
}

impl ScriptedSrProvider {
    pub fn new(kind: SrProviderKind) -> Self {
        Self {
            kind,
            scale_factor: 2,
            delay: Duration::ZERO,
            failure: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(Mutex::new(HashMap::new())),
            max_active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_scale(mut self, scale_factor: u32) -> Self {
        self.scale_factor = scale_factor;
        self
    }

    /// Every call fails as a process exiting with status 3.
    pub fn failing(mut self, stderr: impl Into<String>) -> Self {
        self.failure = Some(stderr.into());
        self
    }

    pub fn calls(&self) -> Vec<SrCall> {
        self.calls.lock().clone()
    }

    /// Highest number of simultaneous calls seen on `device`.
    pub fn max_concurrency(&self, device: Option<u32>) -> usize {
        self.max_active.lock().get(&device).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SrProvider for ScriptedSrProvider {
    fn kind(&self) -> SrProviderKind {
        self.kind
    }

    fn capabilities(&self) -> SrCapabilities {
        SrCapabilities {
            provider: self.kind,
            model_name: "scripted".to_string(),
            model_version: Some("test".to_string()),
            supported_bands: sr::STACK_ORDER.to_vec(),
            scale_factor: self.scale_factor,
            runtime: RuntimeClass::Cpu,
        }
    }

    async fn infer(
        &self,
        request: &SrRequest<'_>,
    ) -> Result<SrOutput, SrProviderError> {
        let started = Instant::now();
        {
            let mut active = self.active.lock();
            let now = active.entry(request.device).or_default();
            *now += 1;
            let mut max = self.max_active.lock();
            let peak = max.entry(request.device).or_default();
            *peak = (*peak).max(*now);
        }

        tokio::time::sleep(self.delay).await;
        let result = match &self.failure {
            Some(stderr) => Err(SrProviderError::Exit {
                code: Some(3),
                stderr: stderr.clone(),
            }),
            None => NearestProvider::new(self.scale_factor).infer(request).await,
        };

        if let Some(now) = self.active.lock().get_mut(&request.device) {
            *now = now.saturating_sub(1);
        }
        self.calls.lock().push(SrCall {
            job_id: request.job_id,
            device: request.device,
            started,
            finished: Instant::now(),
        });
        result
    }
}

/// A dispatch seen by [`MockDispatcher`].
#[derive(Clone, Debug)]
pub struct DispatchRecord {
    pub lease_id: LeaseId,
    pub job_id: JobId,
    pub field_id: FieldId,
    pub worker_id: String,
    pub device: Option<u32>,
    pub started: Instant,
    pub finished: Instant,
}

/// Dispatcher that sleeps, records the dispatch and ends the job SKIPPED
/// (or FAILED when configured).
#[derive(Clone)]
pub struct MockDispatcher {
    dispatches: Arc<Mutex<Vec<DispatchRecord>>>,
    delay: Duration,
    fail: bool,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self {
            dispatches: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
            fail: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn record(&self) -> Vec<DispatchRecord> {
        self.dispatches.lock().clone()
    }

    pub fn assert_dispatch_count_eq(&self, expected: usize) {
        let actual = self.dispatches.lock().len();
        assert_eq!(actual, expected, "Expected {expected} dispatches, got {actual}");
    }
}

impl Default for MockDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobDispatcher for MockDispatcher {
    async fn dispatch(&self, lease: &JobLease, ctx: &DispatchContext) -> JobOutcome {
        let started = Instant::now();
        tokio::time::sleep(self.delay).await;
        self.dispatches.lock().push(DispatchRecord {
            lease_id: lease.lease_id,
            job_id: lease.job_id,
            field_id: lease.job.field_id(),
            worker_id: ctx.worker_id.clone(),
            device: ctx.device,
            started,
            finished: Instant::now(),
        });
        if self.fail {
            JobOutcome::aborted("mock dispatcher failure")
        } else {
            JobOutcome::skipped(JobResult::with_reason("mock"))
        }
    }
}

/// Orchestrator wired to in-memory collaborators, with handles kept for
/// assertions.
pub struct Harness {
    pub fields: InMemoryFieldDirectory,
    pub catalog: InMemorySceneCatalog,
    pub raster: SyntheticRasterIo,
    pub layers: InMemoryLayerStore,
    pub observations: Arc<InMemoryObservationStore>,
    pub alerts: Arc<InMemoryAlertStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_raster(SyntheticRasterIo::new())
    }

    pub fn with_raster(raster: SyntheticRasterIo) -> Self {
        Self {
            fields: InMemoryFieldDirectory::new(),
            catalog: InMemorySceneCatalog::new(),
            raster,
            layers: InMemoryLayerStore::new(),
            observations: Arc::new(InMemoryObservationStore::new()),
            alerts: Arc::new(InMemoryAlertStore::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            fields: Arc::new(self.fields.clone()),
            catalog: Arc::new(self.catalog.clone()),
            raster: Arc::new(self.raster.clone()),
            layers: Arc::new(self.layers.clone()),
            observations: self.observations.clone(),
            alerts: self.alerts.clone(),
        }
    }

    pub fn orchestrator(&self, settings: AnalysisSettings) -> AnalysisOrchestrator {
        AnalysisOrchestrator::new(settings, self.collaborators())
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
