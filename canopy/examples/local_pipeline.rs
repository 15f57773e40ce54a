//! Local pipeline example with in-memory collaborators.
//!
//! This example demonstrates:
//! - Loading an `AppConfig` from TOML
//! - Building the configured SR provider (the nearest debug provider)
//! - Wiring the orchestrator into the analysis runtime
//! - Submitting on-demand jobs and reading back observations and alerts
//!
//! Run with: `cargo run --example local_pipeline`

use std::sync::Arc;
use std::time::Duration;

use canopy::runtime::{AnalysisRuntimeBuilder, ShutdownToken};
use canopy::sr::build_provider;
use canopy::*;
use canopy_testkit::{Harness, SceneBuilder, june_request, test_field, utc};

const CONFIG: &str = r#"
profile = "development"

[analysis]
cloud_cap_percent = 25.0

[sr]
analytics_default = true
wall_clock_secs = 60

[sr.provider]
provider = "nearest"
scale_factor = 4

[runtime]
analysis_cpu_workers = 2
poll_interval_ms = 20

[scheduler]
tick_secs = 1
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "canopy=info".into()),
        )
        .init();

    println!("=== Canopy Local Pipeline Example ===\n");
    let config = AppConfig::from_toml_str(CONFIG)?;

    let harness = Harness::new();
    let field = test_field("Parcel 12");
    harness.fields.upsert(field.clone());
    harness.catalog.add_scene(
        SceneBuilder::new("S2B_20260604")
            .acquired(utc(2026, 6, 4, 10, 40))
            .cloud(62.0)
            .build(),
    );
    harness.catalog.add_scene(
        SceneBuilder::new("S2A_20260612")
            .acquired(utc(2026, 6, 12, 10, 30))
            .cloud(8.0)
            .build(),
    );

    let provider = build_provider(&config.sr.provider, Arc::new(harness.raster.clone()))?;
    let orchestrator = harness
        .orchestrator(config.analysis.clone())
        .with_sr_provider(provider.clone())
        .with_sr_work_root(config.sr.work_dir.clone())
        .with_sr_wall_clock(Duration::from_secs(config.sr.wall_clock_secs));

    let queue = Arc::new(InMemoryJobQueue::new());
    let bus = Arc::new(InProcEventBus::new(config.runtime.event_capacity));
    let submitter = Arc::new(JobSubmitter::new(
        Arc::new(harness.fields.clone()),
        Arc::new(StaticFeatureFlags::new(config.sr.analytics_default)),
        JobRouter::new(config.sr.provider.kind()),
        queue.clone(),
        bus.clone(),
    ));

    let runtime = AnalysisRuntimeBuilder::new(config.runtime.clone())
        .with_queue(queue.clone())
        .with_dispatcher(Arc::new(orchestrator))
        .with_events(bus.clone())
        .build()?;
    runtime.start().await?;

    let scheduler = Arc::new(CadenceScheduler::new(
        Arc::new(harness.fields.clone()),
        submitter.clone(),
        Duration::from_secs(config.scheduler.tick_secs),
    ));
    let scheduler_token = ShutdownToken::new();
    let scheduler_task = {
        let scheduler = scheduler.clone();
        let token = scheduler_token.clone();
        tokio::spawn(async move { scheduler.run(token).await })
    };

    let mut events = bus.subscribe_jobs();
    let native = submitter.submit(june_request(field.id)).await?;
    let with_sr = submitter
        .submit(AnalysisRequest {
            include_sr: true,
            ..june_request(field.id)
        })
        .await?;
    println!("Submitted {} (native) and {} (with SR)", native.id, with_sr.id);

    let mut finished = 0;
    while finished < 2 {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv()).await??;
        println!(
            "[EVENT] job {} on {}: {:?}",
            event.meta.job_id, event.meta.queue, event.payload
        );
        if event.status().is_some_and(|s| s.is_terminal()) {
            finished += 1;
        }
    }

    for job_id in [native.id, with_sr.id] {
        if let Some(view) = submitter.status(job_id).await? {
            println!("\nJob {} -> {}", view.id, view.status);
            if let Some(result) = view.result_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
        }
    }

    let timeline = harness.observations.recent_for_field(field.id, 10).await?;
    println!("\nObservations for {}: {}", field.name, timeline.len());
    for observation in &timeline {
        println!(
            "  {} scene={} ndvi={:?} sr_indices={:?}",
            observation.observed_on,
            observation.scene_id,
            observation.native_mean(IndexName::Ndvi),
            observation.indices_sr.keys().collect::<Vec<_>>(),
        );
    }
    println!("Alerts raised: {}", harness.alerts.all().len());
    println!("Layers stored: {}", harness.layers.layers().len());

    scheduler_token.cancel();
    scheduler_task.await?;
    runtime.shutdown().await?;
    println!("\n=== Example complete ===");
    Ok(())
}
