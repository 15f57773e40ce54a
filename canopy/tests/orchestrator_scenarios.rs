//! End-to-end pipeline runs against in-memory collaborators.
//!
//! Covers scene selection, the quality gate, native and SR index passes,
//! provider failures, observation persistence and alert derivation.

use std::sync::Arc;
use std::time::Duration;

use canopy::orchestrator::reason;
use canopy::runtime::DispatchContext;
use canopy::sr::{CommandConfig, CommandProvider, SrProvider, SrProviderKind};
use canopy::*;
use canopy_testkit::{
    Harness, SceneBuilder, ScriptedSrProvider, SyntheticRasterIo, june_request, job_for,
    ndvi_observation, test_field, utc,
};

fn ctx() -> DispatchContext {
    DispatchContext {
        worker_id: "analysis_cpu-test-w0".to_string(),
        device: None,
    }
}

fn harness_with_field(raster: SyntheticRasterIo) -> (Harness, FieldRecord) {
    let harness = Harness::with_raster(raster);
    let field = test_field("North paddock");
    harness.fields.upsert(field.clone());
    (harness, field)
}

#[tokio::test]
async fn cloudy_scene_is_skipped_with_cloud_reason() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    harness.catalog.add_scene(SceneBuilder::new("S2_CLOUDY").cloud(45.0).build());

    let request = AnalysisRequest {
        max_cloud: Some(20.0),
        ..june_request(field.id)
    };
    let job = job_for(&field, request, false, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Skipped);
    let reason = outcome.result.reason.as_deref().unwrap_or_default();
    assert!(reason.contains("cloud"), "unexpected reason: {reason}");
    assert_eq!(outcome.result.cloud_cover, Some(45.0));
    assert!(outcome.observation.is_none());
    assert!(harness.observations.is_empty());
    assert!(harness.layers.layers().is_empty());

    let alerts = harness.alerts.all();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].category, AlertCategory::LowQualitySkipped);
}

#[tokio::test]
async fn red_and_nir_only_yield_ndvi_and_savi() {
    let raster = SyntheticRasterIo::new().with_valid_ratio("S2_RN", 0.97);
    let (harness, field) = harness_with_field(raster);
    harness.catalog.add_scene(
        SceneBuilder::new("S2_RN")
            .cloud(10.0)
            .bands(&[BandId::B04, BandId::B08])
            .build(),
    );

    let job = job_for(&field, june_request(field.id), false, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Succeeded, "{:?}", outcome.error_message);
    assert_eq!(
        outcome.result.native_indices,
        Some(vec![IndexName::Ndvi, IndexName::Savi])
    );
    assert_eq!(outcome.result.valid_pixel_ratio, Some(0.97));
    assert_eq!(outcome.result.sr_requested, Some(false));
    assert_eq!(outcome.result.sr_provider, None);

    let observation = outcome.observation.expect("observation recorded");
    let ndvi = observation.native_mean(IndexName::Ndvi).expect("ndvi stats");
    assert!((ndvi - 0.8).abs() < 1e-4, "ndvi mean {ndvi}");
    assert!(
        observation
            .indices_native
            .values()
            .all(|r| r.provenance == Provenance::Native && r.layer.is_some())
    );
    assert!(observation.indices_sr.is_empty());
    assert_eq!(observation.observed_on, canopy_testkit::date(2026, 6, 10));
    assert_eq!(harness.observations.for_job(job.id).len(), 1);

    // No blue or green band, so no true-colour layer.
    let layers = harness.layers.layers();
    assert_eq!(layers.len(), 2);
    assert!(layers.iter().all(|l| matches!(l.kind, LayerKind::Index(_))));
    assert!(harness.alerts.all().is_empty());
}

#[tokio::test]
async fn requested_indices_narrow_the_native_pass() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    harness.catalog.add_scene(SceneBuilder::new("S2_ALL").build());

    let request = AnalysisRequest {
        indices: Some(vec![IndexName::Ndre, IndexName::Ndmi]),
        ..june_request(field.id)
    };
    let job = job_for(&field, request, false, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(
        outcome.result.native_indices,
        Some(vec![IndexName::Ndmi, IndexName::Ndre])
    );
    let rgb = harness
        .layers
        .layers()
        .into_iter()
        .filter(|l| l.kind == LayerKind::Rgb)
        .count();
    assert_eq!(rgb, 1);
}

#[tokio::test]
async fn failing_sr_command_keeps_native_results() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    harness.catalog.add_scene(SceneBuilder::new("S2_CMD").cloud(3.0).build());

    let provider: Arc<dyn SrProvider> = Arc::new(CommandProvider::new(
        CommandConfig {
            template: "exit 3".to_string(),
            timeout_secs: 30,
            scale_factor: 10,
            model_name: "external-command".to_string(),
            output_bands: canopy::sr::STACK_ORDER.to_vec(),
        },
        Arc::new(harness.raster.clone()),
    ));
    let orchestrator = harness
        .orchestrator(AnalysisSettings::default())
        .with_sr_provider(Some(provider));

    let request = AnalysisRequest {
        include_sr: true,
        ..june_request(field.id)
    };
    let job = job_for(&field, request, true, QueueName::AnalysisCpu);
    let outcome = orchestrator.run(&job, &ctx()).await;

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert!(outcome.result.sr_error.is_some());
    assert_eq!(outcome.result.sr_indices, Some(Vec::new()));
    assert_eq!(outcome.result.sr_visualization_generated, Some(false));
    assert_eq!(outcome.result.sr_provider.as_deref(), Some("external_command"));
    assert!(!outcome.result.native_indices.unwrap_or_default().is_empty());

    let observation = outcome.observation.expect("observation recorded");
    assert!(observation.indices_sr.is_empty());
    assert!(observation.sr_model.is_none());

    let categories: Vec<AlertCategory> =
        harness.alerts.all().iter().map(|a| a.category).collect();
    assert_eq!(categories, vec![AlertCategory::SrProviderDegraded]);
}

#[tokio::test]
async fn sr_pass_adds_model_derived_indices() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    harness.catalog.add_scene(SceneBuilder::new("S2_SR").build());

    let provider = ScriptedSrProvider::new(SrProviderKind::LocalModel).with_scale(2);
    let orchestrator = harness
        .orchestrator(AnalysisSettings::default())
        .with_sr_provider(Some(Arc::new(provider.clone())));

    let request = AnalysisRequest {
        include_sr: true,
        ..june_request(field.id)
    };
    let job = job_for(&field, request, true, QueueName::SrGpu);
    let outcome = orchestrator
        .run(
            &job,
            &DispatchContext {
                worker_id: "sr_gpu-test-w0".into(),
                device: Some(0),
            },
        )
        .await;

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.result.sr_error, None);
    assert_eq!(
        outcome.result.sr_indices,
        Some(vec![
            IndexName::Ndvi,
            IndexName::Ndwi,
            IndexName::Evi,
            IndexName::Savi
        ])
    );
    assert_eq!(outcome.result.sr_visualization_generated, Some(true));
    assert_eq!(outcome.result.sr_provider.as_deref(), Some("local_model"));

    let observation = outcome.observation.expect("observation recorded");
    assert!(
        observation
            .indices_sr
            .values()
            .all(|r| r.provenance == Provenance::ModelDerived)
    );
    let model = observation.sr_model.expect("sr model recorded");
    assert_eq!(model.scale_factor, 2);

    let derived = harness.layers.with_provenance(Provenance::ModelDerived);
    assert_eq!(derived.len(), 5);
    assert!(derived.iter().all(|l| l.shape == (20, 20)));
    assert_eq!(provider.calls()[0].device, Some(0));
}

#[tokio::test]
async fn sr_analytics_disabled_keeps_visualisation_only() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    harness.catalog.add_scene(SceneBuilder::new("S2_VIS").build());
    let orchestrator = harness
        .orchestrator(AnalysisSettings::default())
        .with_sr_provider(Some(Arc::new(ScriptedSrProvider::new(
            SrProviderKind::Nearest,
        ))));

    let request = AnalysisRequest {
        include_sr: true,
        ..june_request(field.id)
    };
    let job = job_for(&field, request, false, QueueName::AnalysisCpu);
    let outcome = orchestrator.run(&job, &ctx()).await;

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.result.sr_analytics_enabled, Some(false));
    assert_eq!(outcome.result.sr_indices, Some(Vec::new()));
    assert_eq!(outcome.result.sr_visualization_generated, Some(true));
    assert_eq!(outcome.result.sr_error, None);
}

#[tokio::test]
async fn sr_without_provider_records_error() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    harness.catalog.add_scene(SceneBuilder::new("S2_NOSR").build());

    let request = AnalysisRequest {
        include_sr: true,
        ..june_request(field.id)
    };
    let job = job_for(&field, request, true, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(
        outcome.result.sr_error.as_deref(),
        Some("super-resolution provider is disabled")
    );
    assert_eq!(outcome.result.sr_provider, None);
}

#[tokio::test]
async fn newest_clear_scene_wins() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    harness.catalog.add_scene(
        SceneBuilder::new("S2_OLD_CLEAR")
            .acquired(utc(2026, 6, 5, 10, 30))
            .cloud(4.0)
            .build(),
    );
    harness.catalog.add_scene(
        SceneBuilder::new("S2_NEW_CLOUDY")
            .acquired(utc(2026, 6, 20, 10, 30))
            .cloud(70.0)
            .build(),
    );
    harness.catalog.add_scene(
        SceneBuilder::new("S2_NEWEST_PARTIAL")
            .acquired(utc(2026, 6, 25, 10, 30))
            .cloud(1.0)
            .coverage(0.4)
            .build(),
    );

    let job = job_for(&field, june_request(field.id), false, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.result.scene_id.as_deref(), Some("S2_OLD_CLEAR"));
    assert_eq!(harness.raster.reads(), vec!["S2_OLD_CLEAR".to_string()]);
}

#[tokio::test]
async fn unknown_cloud_cover_counts_as_clear() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    harness
        .catalog
        .add_scene(SceneBuilder::new("S2_NOCC").unknown_cloud().build());

    let job = job_for(&field, june_request(field.id), false, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.result.cloud_cover, Some(0.0));
}

#[tokio::test]
async fn sparse_valid_pixels_are_skipped() {
    let raster = SyntheticRasterIo::new().with_valid_ratio("S2_SPARSE", 0.5);
    let (harness, field) = harness_with_field(raster);
    harness.catalog.add_scene(SceneBuilder::new("S2_SPARSE").build());

    let job = job_for(&field, june_request(field.id), false, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Skipped);
    let reason = outcome.result.reason.unwrap_or_default();
    assert!(reason.contains("valid pixel ratio"), "unexpected reason: {reason}");
    assert_eq!(outcome.result.valid_pixel_ratio, Some(0.5));
}

#[tokio::test]
async fn partial_coverage_is_skipped() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    harness
        .catalog
        .add_scene(SceneBuilder::new("S2_EDGE").coverage(0.6).build());

    let job = job_for(&field, june_request(field.id), false, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Skipped);
    assert_eq!(
        outcome.result.reason.as_deref(),
        Some(reason::NO_SCENE_MEETS_COVERAGE)
    );
    assert_eq!(outcome.result.field_coverage_ratio, Some(0.6));
    assert!(harness.raster.reads().is_empty());
}

#[tokio::test]
async fn requested_scene_with_low_coverage_is_skipped() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    harness
        .catalog
        .add_scene(SceneBuilder::new("S2_PICKED").coverage(0.9).build());

    let request = AnalysisRequest {
        scene_id: Some("S2_PICKED".to_string()),
        ..june_request(field.id)
    };
    let job = job_for(&field, request, false, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Skipped);
    assert_eq!(outcome.result.reason.as_deref(), Some(reason::LOW_SCENE_COVERAGE));
    let alerts = harness.alerts.all();
    assert_eq!(alerts[0].category, AlertCategory::LowSceneCoverage);
}

#[tokio::test]
async fn requested_scene_outside_window_is_fetched_directly() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    harness.catalog.add_scene(
        SceneBuilder::new("S2_MAY")
            .acquired(utc(2026, 5, 2, 10, 30))
            .build(),
    );

    let request = AnalysisRequest {
        scene_id: Some("S2_MAY".to_string()),
        ..june_request(field.id)
    };
    let job = job_for(&field, request, false, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert_eq!(outcome.result.scene_id.as_deref(), Some("S2_MAY"));
}

#[tokio::test]
async fn missing_requested_scene_fails() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    harness.catalog.add_scene(SceneBuilder::new("S2_OTHER").build());

    let request = AnalysisRequest {
        scene_id: Some("S2_GONE".to_string()),
        ..june_request(field.id)
    };
    let job = job_for(&field, request, false, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(
        outcome.result.reason.as_deref(),
        Some(reason::REQUESTED_SCENE_NOT_FOUND)
    );
    assert_eq!(outcome.result.scene_id.as_deref(), Some("S2_GONE"));
    let alerts = harness.alerts.all();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].category, AlertCategory::AnalysisFailed);
    assert_eq!(alerts[0].severity, Severity::Critical);
}

#[tokio::test]
async fn empty_catalog_fails_with_no_scene_available() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());

    let job = job_for(&field, june_request(field.id), false, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.result.reason.as_deref(), Some(reason::NO_SCENE_AVAILABLE));
    assert!(outcome.error_message.is_some());
}

#[tokio::test]
async fn unknown_field_fails() {
    let harness = Harness::new();
    let field = test_field("unregistered");

    let job = job_for(&field, june_request(field.id), false, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.result.reason.as_deref(), Some("UNKNOWN_FIELD"));
}

#[tokio::test]
async fn raster_read_failure_fails_the_job() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    harness.catalog.add_scene(SceneBuilder::new("S2_BROKEN").build());
    harness.raster.fail_reads_for("S2_BROKEN");

    let job = job_for(&field, june_request(field.id), false, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.result.reason.as_deref(), Some("RASTER_READ_FAILED"));
    assert_eq!(outcome.result.scene_id.as_deref(), Some("S2_BROKEN"));
}

#[tokio::test]
async fn rgb_upload_failure_is_not_fatal() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    harness.catalog.add_scene(SceneBuilder::new("S2_RGB").build());
    harness.layers.fail_rgb();

    let job = job_for(&field, june_request(field.id), false, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert!(
        harness
            .layers
            .layers()
            .iter()
            .all(|l| l.kind != LayerKind::Rgb)
    );
}

#[tokio::test]
async fn ndvi_drop_against_baseline_raises_alert() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    for day in [1, 3, 5] {
        harness
            .observations
            .insert(&ndvi_observation(
                field.id,
                canopy_testkit::date(2026, 6, day),
                0.82,
            ))
            .await
            .unwrap();
    }
    harness.raster.set_reflectance(BandId::B08, 0.20);
    harness.raster.set_reflectance(BandId::B04, 0.10);
    harness.catalog.add_scene(SceneBuilder::new("S2_STRESSED").build());

    let job = job_for(&field, june_request(field.id), false, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Succeeded);
    let drops: Vec<&Alert> = outcome
        .alerts
        .iter()
        .filter(|a| a.category == AlertCategory::NdviDrop)
        .collect();
    assert_eq!(drops.len(), 1);
    assert_eq!(drops[0].field_id, Some(field.id));
    assert_eq!(harness.alerts.all().len(), outcome.alerts.len());
}

#[tokio::test]
async fn ndvi_baseline_reaches_past_observations_without_ndvi() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    for day in [1, 3, 5] {
        harness
            .observations
            .insert(&ndvi_observation(
                field.id,
                canopy_testkit::date(2026, 6, day),
                0.82,
            ))
            .await
            .unwrap();
    }
    let mut no_ndvi = ndvi_observation(field.id, canopy_testkit::date(2026, 6, 7), 0.0);
    no_ndvi.indices_native.clear();
    harness.observations.insert(&no_ndvi).await.unwrap();

    harness.raster.set_reflectance(BandId::B08, 0.20);
    harness.raster.set_reflectance(BandId::B04, 0.10);
    harness.catalog.add_scene(SceneBuilder::new("S2_AFTER_GAP").build());

    let job = job_for(&field, june_request(field.id), false, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Succeeded);
    assert!(
        outcome
            .alerts
            .iter()
            .any(|a| a.category == AlertCategory::NdviDrop),
        "alerts: {:?}",
        outcome.alerts
    );
}

#[tokio::test]
async fn band_missing_from_raster_fails_the_job() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    harness.catalog.add_scene(SceneBuilder::new("S2_NO_SWIR").build());
    // The catalog advertises B11 but the read does not return it.
    harness.raster.withhold_band(BandId::B11);

    let job = job_for(&field, june_request(field.id), false, QueueName::AnalysisCpu);
    let outcome = harness
        .orchestrator(AnalysisSettings::default())
        .run(&job, &ctx())
        .await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.result.reason.as_deref(), Some("BAND_MISSING"));
    let message = outcome.error_message.unwrap_or_default();
    assert!(message.contains("B11"), "unexpected message: {message}");
    assert!(outcome.observation.is_none());
    assert!(harness.observations.is_empty());
}

#[tokio::test]
async fn sr_command_timeout_keeps_native_results() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    harness.catalog.add_scene(SceneBuilder::new("S2_SLOW").build());

    let provider: Arc<dyn SrProvider> = Arc::new(CommandProvider::new(
        CommandConfig {
            template: "sleep 30".to_string(),
            timeout_secs: 1,
            scale_factor: 10,
            model_name: "external-command".to_string(),
            output_bands: canopy::sr::STACK_ORDER.to_vec(),
        },
        Arc::new(harness.raster.clone()),
    ));
    let orchestrator = harness
        .orchestrator(AnalysisSettings::default())
        .with_sr_provider(Some(provider));

    let request = AnalysisRequest {
        include_sr: true,
        ..june_request(field.id)
    };
    let job = job_for(&field, request, true, QueueName::AnalysisCpu);
    let started = std::time::Instant::now();
    let outcome = orchestrator.run(&job, &ctx()).await;

    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(outcome.status, JobStatus::Succeeded);
    let sr_error = outcome.result.sr_error.unwrap_or_default();
    assert!(sr_error.contains("timed out"), "unexpected sr_error {sr_error}");
    assert!(!outcome.result.native_indices.unwrap_or_default().is_empty());
    assert!(
        harness
            .alerts
            .all()
            .iter()
            .any(|a| a.category == AlertCategory::SrProviderDegraded)
    );
}

#[tokio::test]
async fn sr_wall_clock_expiry_keeps_native_results() {
    let (harness, field) = harness_with_field(SyntheticRasterIo::new());
    harness.catalog.add_scene(SceneBuilder::new("S2_STALLED").build());

    let provider = ScriptedSrProvider::new(SrProviderKind::ExternalService)
        .with_delay(Duration::from_secs(5));
    let orchestrator = harness
        .orchestrator(AnalysisSettings::default())
        .with_sr_provider(Some(Arc::new(provider)))
        .with_sr_wall_clock(Duration::from_millis(100));

    let request = AnalysisRequest {
        include_sr: true,
        ..june_request(field.id)
    };
    let job = job_for(&field, request, true, QueueName::AnalysisCpu);
    let started = std::time::Instant::now();
    let outcome = orchestrator.run(&job, &ctx()).await;

    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(outcome.status, JobStatus::Succeeded);
    let sr_error = outcome.result.sr_error.unwrap_or_default();
    assert!(sr_error.contains("timed out"), "unexpected sr_error {sr_error}");
    assert_eq!(outcome.result.sr_indices, Some(Vec::new()));
    assert!(outcome.observation.expect("observation recorded").indices_sr.is_empty());
}
