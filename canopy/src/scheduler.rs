//! Cadence scheduling.
//!
//! A single polling loop keeps the next due instant per field. When a
//! field comes due it gets one analysis job and its next instant is
//! recomputed from the current time. A due instant is only honoured
//! within a short grace window; ticks missed while the process was down
//! are dropped rather than replayed.

use chrono::offset::LocalResult;
use chrono::{DateTime, Datelike, Days, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, warn};

use crate::error::ScheduleError;
use crate::field::{FieldDirectory, FieldRecord};
use crate::job::{AnalysisRequest, FieldId};
use crate::runtime::ShutdownToken;
use crate::submission::JobSubmitter;
use crate::telemetry;

/// Longest DST gap searched when a local time does not exist.
const MAX_GAP_MINUTES: i64 = 180;

/// How late a due instant may be observed and still fire. Widened to the
/// polling interval when that is longer.
const LATE_GRACE_MINUTES: i64 = 5;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    #[default]
    Daily,
    /// Mondays only.
    Weekly,
}

/// Per-field cadence, owned by field management.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub timezone: Tz,
    #[serde(with = "hhmm")]
    pub local_time: NaiveTime,
    pub frequency: Frequency,
    /// The field's standing SR preference, copied onto scheduled jobs.
    pub include_sr: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timezone: Tz::UTC,
            local_time: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default(),
            frequency: Frequency::Daily,
            include_sr: false,
        }
    }
}

impl ScheduleConfig {
    pub fn new(
        timezone: &str,
        local_time: &str,
        frequency: Frequency,
    ) -> Result<Self, ScheduleError> {
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| ScheduleError::UnknownTimezone(timezone.to_string()))?;
        Ok(Self {
            enabled: true,
            timezone,
            local_time: parse_local_time(local_time)?,
            frequency,
            include_sr: false,
        })
    }

    pub fn with_include_sr(mut self, include_sr: bool) -> Self {
        self.include_sr = include_sr;
        self
    }
}

/// Parses `"HH:MM"`.
pub fn parse_local_time(raw: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| ScheduleError::InvalidLocalTime(raw.to_string()))
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_local_time(&raw).map_err(serde::de::Error::custom)
    }
}

/// First trigger instant strictly after `now`, or `None` when the
/// schedule is disabled.
pub fn next_trigger(config: &ScheduleConfig, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !config.enabled {
        return None;
    }
    let today = now.with_timezone(&config.timezone).date_naive();
    // A weekly schedule whose Monday slot already passed today fires in
    // seven days; one extra day absorbs a gap pushing past midnight.
    for offset in 0..=8 {
        let day = today.checked_add_days(Days::new(offset))?;
        if config.frequency == Frequency::Weekly && day.weekday() != Weekday::Mon {
            continue;
        }
        let Some(instant) = resolve_local(config.timezone, day.and_time(config.local_time))
        else {
            continue;
        };
        if instant > now {
            return Some(instant);
        }
    }
    None
}

/// Maps a wall-clock time to UTC. Ambiguous times take the earlier
/// mapping; times inside a gap move to the first instant after it.
fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(instant) => Some(instant.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => (1..=MAX_GAP_MINUTES).find_map(|minutes| {
            let shifted = local.checked_add_signed(TimeDelta::minutes(minutes))?;
            tz.from_local_datetime(&shifted)
                .earliest()
                .map(|instant| instant.with_timezone(&Utc))
        }),
    }
}

#[derive(Clone, Debug)]
struct Tracked {
    config: ScheduleConfig,
    next_due: DateTime<Utc>,
}

/// Polls the field directory and submits due analyses.
pub struct CadenceScheduler {
    fields: Arc<dyn FieldDirectory>,
    submitter: Arc<JobSubmitter>,
    tick: Duration,
    state: Mutex<HashMap<FieldId, Tracked>>,
}

impl CadenceScheduler {
    pub fn new(
        fields: Arc<dyn FieldDirectory>,
        submitter: Arc<JobSubmitter>,
        tick: Duration,
    ) -> Self {
        Self {
            fields,
            submitter,
            tick,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Next due instant currently tracked for a field.
    pub fn next_due(&self, field_id: FieldId) -> Option<DateTime<Utc>> {
        self.state.lock().get(&field_id).map(|t| t.next_due)
    }

    pub fn tracked_fields(&self) -> usize {
        self.state.lock().len()
    }

    fn grace(&self) -> TimeDelta {
        let floor = TimeDelta::minutes(LATE_GRACE_MINUTES);
        TimeDelta::from_std(self.tick)
            .map(|tick| tick.max(floor))
            .unwrap_or(floor)
    }

    /// One scheduling pass at `now`. Returns the number of jobs submitted.
    ///
    /// A field seen for the first time, or whose schedule changed, only
    /// gets its next due instant; it fires on a later pass.
    pub async fn tick(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let fields = self.fields.list().await?;
        let due = self.collect_due(&fields, now);

        let mut submitted = 0;
        for (field_id, include_sr) in due {
            let request = AnalysisRequest {
                include_sr,
                ..AnalysisRequest::for_field(field_id)
            };
            match self.submitter.submit(request).await {
                Ok(handle) => {
                    debug!(%field_id, job_id = %handle.id, "scheduled analysis submitted");
                    submitted += 1;
                }
                Err(err) => warn!(%field_id, "scheduled submission failed: {err}"),
            }
        }
        Ok(submitted)
    }

    fn collect_due(&self, fields: &[FieldRecord], now: DateTime<Utc>) -> Vec<(FieldId, bool)> {
        let mut state = self.state.lock();
        let enabled: HashSet<FieldId> = fields
            .iter()
            .filter(|f| f.schedule.enabled)
            .map(|f| f.id)
            .collect();
        state.retain(|id, _| enabled.contains(id));

        let grace = self.grace();
        let mut due = Vec::new();
        for field in fields.iter().filter(|f| f.schedule.enabled) {
            let config = &field.schedule;
            let fire = match state.get(&field.id) {
                Some(tracked) if tracked.config == *config && now >= tracked.next_due => {
                    let late = now - tracked.next_due;
                    if late > grace {
                        debug!(
                            field_id = %field.id,
                            missed = %tracked.next_due,
                            "missed scheduled tick dropped"
                        );
                    }
                    late <= grace
                }
                _ => false,
            };
            if fire {
                due.push((field.id, config.include_sr));
            }
            let unchanged = state
                .get(&field.id)
                .is_some_and(|t| t.config == *config && now < t.next_due);
            if unchanged {
                continue;
            }
            match next_trigger(config, now) {
                Some(next_due) => {
                    state.insert(
                        field.id,
                        Tracked {
                            config: config.clone(),
                            next_due,
                        },
                    );
                }
                None => {
                    state.remove(&field.id);
                }
            }
        }
        due
    }

    /// Drives [`tick`](Self::tick) until shutdown.
    pub async fn run(&self, shutdown: ShutdownToken) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Cadence scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let span = telemetry::schedule_span(self.tracked_fields());
                    match self.tick(Utc::now()).instrument(span).await {
                        Ok(count) => telemetry::record_scheduled_submissions(count),
                        Err(err) => warn!("scheduler tick failed: {err}"),
                    }
                }
            }
        }
    }
}
