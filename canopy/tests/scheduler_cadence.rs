//! Cadence scheduler driven end to end through the job submitter.

use std::sync::Arc;
use std::time::Duration;

use canopy::runtime::ShutdownToken;
use canopy::sr::SrProviderKind;
use canopy::*;
use canopy_testkit::{InMemoryFieldDirectory, scheduled_field, utc};
use tokio::time::timeout;

struct Setup {
    fields: InMemoryFieldDirectory,
    queue: Arc<InMemoryJobQueue>,
    scheduler: CadenceScheduler,
}

fn setup() -> Setup {
    let fields = InMemoryFieldDirectory::new();
    let queue = Arc::new(InMemoryJobQueue::new());
    let submitter = Arc::new(JobSubmitter::new(
        Arc::new(fields.clone()),
        Arc::new(StaticFeatureFlags::new(true)),
        JobRouter::new(Some(SrProviderKind::LocalModel)),
        queue.clone(),
        Arc::new(InProcEventBus::new(32)),
    ));
    let scheduler = CadenceScheduler::new(
        Arc::new(fields.clone()),
        submitter,
        Duration::from_millis(10),
    );
    Setup {
        fields,
        queue,
        scheduler,
    }
}

fn paris_weekly() -> ScheduleConfig {
    ScheduleConfig::new("Europe/Paris", "06:00", Frequency::Weekly).unwrap()
}

#[tokio::test]
async fn weekly_paris_field_fires_on_monday_local_morning() {
    let Setup {
        fields,
        queue,
        scheduler,
    } = setup();
    let field = scheduled_field(OrganizationId::new(), paris_weekly().with_include_sr(true));
    fields.upsert(field.clone());

    // First sighting only arms the schedule.
    assert_eq!(scheduler.tick(utc(2026, 3, 25, 10, 0)).await.unwrap(), 0);
    assert_eq!(scheduler.next_due(field.id), Some(utc(2026, 3, 30, 4, 0)));
    assert_eq!(scheduler.tracked_fields(), 1);

    assert_eq!(scheduler.tick(utc(2026, 3, 30, 3, 59)).await.unwrap(), 0);
    assert_eq!(scheduler.tick(utc(2026, 3, 30, 4, 0)).await.unwrap(), 1);
    assert_eq!(scheduler.next_due(field.id), Some(utc(2026, 4, 6, 4, 0)));

    let jobs = queue.jobs_for_field(field.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].request.include_sr);
    assert_eq!(jobs[0].queue, QueueName::SrGpu);
    assert!(jobs[0].context.sr_analytics_enabled);
    assert_eq!(jobs[0].status, JobStatus::Queued);
}

#[tokio::test]
async fn missed_ticks_are_not_replayed() {
    let Setup {
        fields,
        queue,
        scheduler,
    } = setup();
    let field = scheduled_field(OrganizationId::new(), paris_weekly());
    fields.upsert(field.clone());

    scheduler.tick(utc(2026, 3, 25, 10, 0)).await.unwrap();
    // Several Mondays pass without a tick; the next pass lands on a Wednesday.
    assert_eq!(scheduler.tick(utc(2026, 4, 15, 12, 0)).await.unwrap(), 0);
    assert_eq!(scheduler.next_due(field.id), Some(utc(2026, 4, 20, 4, 0)));
    assert!(queue.jobs_for_field(field.id).await.unwrap().is_empty());

    // Same day, hours after the slot: still too late.
    assert_eq!(scheduler.tick(utc(2026, 4, 20, 12, 0)).await.unwrap(), 0);
    assert_eq!(scheduler.next_due(field.id), Some(utc(2026, 4, 27, 4, 0)));
    assert!(queue.is_empty());
}

#[tokio::test]
async fn slightly_late_tick_still_fires() {
    let Setup {
        fields,
        queue,
        scheduler,
    } = setup();
    let field = scheduled_field(OrganizationId::new(), paris_weekly());
    fields.upsert(field.clone());

    scheduler.tick(utc(2026, 3, 25, 10, 0)).await.unwrap();
    assert_eq!(scheduler.tick(utc(2026, 3, 30, 4, 4)).await.unwrap(), 1);
    assert_eq!(scheduler.next_due(field.id), Some(utc(2026, 4, 6, 4, 0)));
    assert_eq!(queue.jobs_for_field(field.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn schedule_changes_rearm_without_firing() {
    let Setup {
        fields,
        queue,
        scheduler,
    } = setup();
    let mut field = scheduled_field(OrganizationId::new(), paris_weekly());
    fields.upsert(field.clone());
    scheduler.tick(utc(2026, 6, 10, 8, 0)).await.unwrap();
    assert_eq!(scheduler.next_due(field.id), Some(utc(2026, 6, 15, 4, 0)));

    field.schedule = ScheduleConfig::new("UTC", "09:00", Frequency::Daily).unwrap();
    fields.upsert(field.clone());
    assert_eq!(scheduler.tick(utc(2026, 6, 15, 5, 0)).await.unwrap(), 0);
    assert_eq!(scheduler.next_due(field.id), Some(utc(2026, 6, 15, 9, 0)));

    field.schedule.enabled = false;
    fields.upsert(field.clone());
    assert_eq!(scheduler.tick(utc(2026, 6, 15, 9, 30)).await.unwrap(), 0);
    assert_eq!(scheduler.next_due(field.id), None);
    assert_eq!(scheduler.tracked_fields(), 0);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn removed_fields_stop_being_tracked() {
    let Setup {
        fields, scheduler, ..
    } = setup();
    let kept = scheduled_field(OrganizationId::new(), ScheduleConfig::default());
    let dropped = scheduled_field(OrganizationId::new(), ScheduleConfig::default());
    fields.upsert(kept.clone());
    fields.upsert(dropped.clone());

    scheduler.tick(utc(2026, 6, 10, 8, 0)).await.unwrap();
    assert_eq!(scheduler.tracked_fields(), 2);

    fields.remove(dropped.id);
    assert_eq!(scheduler.tick(utc(2026, 6, 11, 6, 0)).await.unwrap(), 1);
    assert_eq!(scheduler.tracked_fields(), 1);
    assert!(scheduler.next_due(dropped.id).is_none());
    assert!(scheduler.next_due(kept.id).is_some());
}

#[tokio::test]
async fn run_loop_stops_on_shutdown() {
    let Setup {
        fields, scheduler, ..
    } = setup();
    fields.upsert(scheduled_field(OrganizationId::new(), paris_weekly()));
    let scheduler = Arc::new(scheduler);

    let token = ShutdownToken::new();
    let handle = {
        let scheduler = scheduler.clone();
        let token = token.clone();
        tokio::spawn(async move { scheduler.run(token).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while scheduler.tracked_fields() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "scheduler never ticked");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    token.cancel();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler stopped")
        .unwrap();
}
