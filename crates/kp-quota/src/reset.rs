use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::Arc;

use crate::ledger::QuotaLedger;

/// Calendar-day arithmetic in the configured quota timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayBoundary {
    tz: Tz,
}

impl DayBoundary {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn utc() -> Self {
        Self::new(chrono_tz::UTC)
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// The quota date that `now` falls on.
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    /// The next local midnight after `now`, as a UTC instant.
    ///
    /// When midnight is skipped by a DST transition the first valid local
    /// time after it is used.
    pub fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let Some(tomorrow) = self.today(now).succ_opt() else {
            return DateTime::<Utc>::MAX_UTC;
        };
        let midnight = tomorrow.and_time(NaiveTime::MIN);
        (0..=3)
            .find_map(|hours| {
                self.tz
                    .from_local_datetime(&(midnight + Duration::hours(hours)))
                    .earliest()
            })
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
    }
}

impl Default for DayBoundary {
    fn default() -> Self {
        Self::utc()
    }
}

/// Outcome of a proactive rollover pass over every credential.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResetReport {
    pub quota_date: NaiveDate,
    /// Hashes whose record for `quota_date` was written by this pass.
    pub rolled: Vec<String>,
    /// Hashes whose write failed; they stay pending for the next write.
    pub failed: Vec<String>,
}

/// Runs `force_reset_check` every `period` on the blocking pool.
///
/// Rollover does not depend on this task; it only makes fresh rows appear in
/// the store without waiting for the first charge of the day.
pub fn spawn_reset_task(
    ledger: Arc<QuotaLedger>,
    period: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let ledger = ledger.clone();
            match tokio::task::spawn_blocking(move || ledger.force_reset_check()).await {
                Ok(report) if !report.rolled.is_empty() => {
                    tracing::info!(
                        quota_date = %report.quota_date,
                        rolled = report.rolled.len(),
                        "Rolled credentials to new quota date"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Reset check task failed: {}", e),
            }
        }
    })
}
