//! Time-of-day scheduler for the sync pipeline.
//!
//! Runs a job at fixed local times every day (by default 08:00, 13:00 and
//! 18:00). Runs never overlap: the next slot is computed only after the
//! previous run has finished.

use crate::error::TrackerError;
use chrono::{DateTime, Days, Local, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::future::Future;
use std::time::Duration;

/// Parse "HH:MM" entries into sorted, de-duplicated times.
pub fn parse_schedule(entries: &[String]) -> Result<Vec<NaiveTime>, TrackerError> {
    if entries.is_empty() {
        return Err(TrackerError::config(
            "settings.sync_schedule must contain at least one time",
        ));
    }

    let mut slots = entries
        .iter()
        .map(|entry| {
            NaiveTime::parse_from_str(entry.trim(), "%H:%M").map_err(|_| {
                TrackerError::config(format!(
                    "invalid sync time '{}': expected 24-hour HH:MM",
                    entry
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    slots.sort();
    slots.dedup();
    Ok(slots)
}

/// First slot strictly after `now`, in `now`'s timezone.
///
/// Slots that fall into a DST gap on a given day are skipped for that day.
pub fn next_run_after<Z: TimeZone>(now: &DateTime<Z>, slots: &[NaiveTime]) -> Option<DateTime<Z>> {
    let tz = now.timezone();
    let today = now.date_naive();

    for offset in 0..=2 {
        let date = today.checked_add_days(Days::new(offset))?;
        for slot in slots {
            if let Some(candidate) = tz.from_local_datetime(&date.and_time(*slot)).earliest() {
                if candidate > *now {
                    return Some(candidate);
                }
            }
        }
    }

    None
}

/// Timezone the schedule is interpreted in
#[derive(Debug, Clone, Copy)]
pub enum ScheduleZone {
    Local,
    Named(Tz),
}

impl ScheduleZone {
    pub fn from_setting(timezone: Option<&str>) -> Result<Self, TrackerError> {
        match timezone {
            None => Ok(ScheduleZone::Local),
            Some(name) => name
                .parse::<Tz>()
                .map(ScheduleZone::Named)
                .map_err(|_| TrackerError::config(format!("unknown timezone '{}'", name))),
        }
    }

    pub fn next_run(&self, now: DateTime<Utc>, slots: &[NaiveTime]) -> Option<DateTime<Utc>> {
        match self {
            ScheduleZone::Local => {
                next_run_after(&now.with_timezone(&Local), slots).map(|dt| dt.with_timezone(&Utc))
            }
            ScheduleZone::Named(tz) => {
                next_run_after(&now.with_timezone(tz), slots).map(|dt| dt.with_timezone(&Utc))
            }
        }
    }
}

pub struct DailyScheduler {
    slots: Vec<NaiveTime>,
    zone: ScheduleZone,
}

impl DailyScheduler {
    pub fn new(slots: Vec<NaiveTime>, zone: ScheduleZone) -> Self {
        Self { slots, zone }
    }

    /// Run `job` at every slot, forever. Errors from a run are logged and the
    /// scheduler moves on to the next slot.
    pub async fn run<F, Fut>(&self, mut job: F) -> anyhow::Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let times: Vec<String> = self
            .slots
            .iter()
            .map(|t| t.format("%H:%M").to_string())
            .collect();
        tracing::info!("Scheduler started (daily at {})", times.join(", "));

        loop {
            let now = Utc::now();
            let next = self
                .zone
                .next_run(now, &self.slots)
                .ok_or_else(|| anyhow::anyhow!("Could not compute next scheduled run"))?;

            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tracing::info!(
                "Next sync at {} (in {}m)",
                next.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                wait.as_secs() / 60
            );
            tokio::time::sleep(wait).await;

            tracing::info!("Running scheduled sync");
            if let Err(e) = job().await {
                // Continue on the next slot even on error
                tracing::error!("Scheduled sync failed: {:?}", e);
            }
        }
    }
}
