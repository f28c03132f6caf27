use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::credential::Credential;
use crate::error::QuotaError;
use crate::record::QuotaRecord;
use crate::reset::{DayBoundary, ResetReport};
use crate::store::{QuotaStore, StoreError};

pub const DEFAULT_DAILY_BUDGET_UNITS: u64 = 10_000;
pub const DEFAULT_PERSISTENCE_RETRY_COUNT: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

pub fn default_exhaustion_markers() -> Vec<String> {
    vec!["403".to_string(), "quotaExceeded".to_string()]
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub daily_budget_units: u64,
    pub timezone: Tz,
    /// Extra write attempts after the first one fails.
    pub persistence_retry_count: u32,
    pub retry_backoff: Duration,
    /// Case-insensitive substrings of a failure message that mean the
    /// external API rejected the call for quota reasons.
    pub exhaustion_markers: Vec<String>,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            daily_budget_units: DEFAULT_DAILY_BUDGET_UNITS,
            timezone: chrono_tz::UTC,
            persistence_retry_count: DEFAULT_PERSISTENCE_RETRY_COUNT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            exhaustion_markers: default_exhaustion_markers(),
        }
    }
}

struct Slot {
    record: QuotaRecord,
    /// False while the store lags behind `record` (never written, or the last
    /// write failed).
    persisted: bool,
    /// Records from earlier days whose final write failed. Flushed before
    /// any later write for the same credential.
    unsaved: Vec<QuotaRecord>,
}

/// Today's usage for every configured credential.
///
/// Each credential has its own lock: charges and rollovers for one key are
/// serialized, while different keys never contend.
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
    boundary: DayBoundary,
    settings: LedgerSettings,
    credentials: Vec<Credential>,
    slots: HashMap<String, RwLock<Slot>>,
}

impl QuotaLedger {
    pub fn new(
        credentials: Vec<Credential>,
        store: Arc<dyn QuotaStore>,
        settings: LedgerSettings,
    ) -> Result<Self, QuotaError> {
        Self::with_clock(credentials, store, settings, Arc::new(SystemClock))
    }

    /// Builds the ledger and loads today's rows from the store so counters
    /// survive restarts.
    pub fn with_clock(
        mut credentials: Vec<Credential>,
        store: Arc<dyn QuotaStore>,
        settings: LedgerSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QuotaError> {
        if credentials.is_empty() {
            return Err(QuotaError::EmptyPool);
        }
        credentials.sort_by_key(|c| c.index());

        let mut indices = HashSet::new();
        let mut hashes = HashSet::new();
        for cred in &credentials {
            if !indices.insert(cred.index()) {
                return Err(QuotaError::DuplicateCredential(format!(
                    "key index {}",
                    cred.index()
                )));
            }
            if !hashes.insert(cred.hash().to_string()) {
                return Err(QuotaError::DuplicateCredential(format!(
                    "key #{} (hash: {})",
                    cred.index(),
                    cred.hash()
                )));
            }
        }

        let boundary = DayBoundary::new(settings.timezone);
        let now = clock.now();
        let today = boundary.today(now);
        let mut existing: HashMap<String, QuotaRecord> = store
            .list_by_date(today)?
            .into_iter()
            .map(|r| (r.key_hash.clone(), r))
            .collect();

        let slots = credentials
            .iter()
            .map(|cred| {
                let slot = match existing.remove(cred.hash()) {
                    Some(mut record) => {
                        // A renumbered key is rewritten on its next write.
                        let persisted = record.key_index == cred.index();
                        record.key_index = cred.index();
                        Slot {
                            record,
                            persisted,
                            unsaved: Vec::new(),
                        }
                    }
                    None => Slot {
                        record: QuotaRecord::fresh(cred.hash(), cred.index(), today, now),
                        persisted: false,
                        unsaved: Vec::new(),
                    },
                };
                (cred.hash().to_string(), RwLock::new(slot))
            })
            .collect();

        tracing::info!(
            keys = credentials.len(),
            daily_budget_units = settings.daily_budget_units,
            timezone = %settings.timezone,
            "Quota ledger initialized for {}",
            today
        );

        Ok(Self {
            store,
            clock,
            boundary,
            settings,
            credentials,
            slots,
        })
    }

    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    pub fn credential(&self, key_hash: &str) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.hash() == key_hash)
    }

    pub fn credential_by_index(&self, key_index: u32) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.index() == key_index)
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    pub fn daily_budget(&self) -> u64 {
        self.settings.daily_budget_units
    }

    pub fn boundary(&self) -> DayBoundary {
        self.boundary
    }

    pub fn today(&self) -> NaiveDate {
        self.boundary.today(self.clock.now())
    }

    pub fn next_reset(&self) -> DateTime<Utc> {
        self.boundary.next_reset(self.clock.now())
    }

    /// Adds `unit_cost` and one request to today's record for `key_hash`.
    ///
    /// A failed call whose message matches an exhaustion marker marks the
    /// credential exhausted regardless of local accounting. If the store
    /// write still fails after retries, the increment is kept in memory and
    /// `DegradedPersistence` is returned with the updated record. The same
    /// error is returned when an earlier day's unsaved record could not be
    /// flushed; it stays queued for the next write.
    pub fn charge_units(
        &self,
        key_hash: &str,
        unit_cost: u64,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<QuotaRecord, QuotaError> {
        let lock = self.slot(key_hash)?;
        let now = self.clock.now();
        let today = self.boundary.today(now);

        let mut slot = write(lock);
        self.roll_if_stale(&mut slot, today, now);
        let flushed = self.flush_unsaved(&mut slot);

        let budget = self.settings.daily_budget_units;
        let record = &mut slot.record;
        record.units_used = record.units_used.saturating_add(unit_cost);
        record.requests_count = record.requests_count.saturating_add(1);
        record.last_used_at = Some(now);
        record.updated_at = now;

        if !success {
            if let Some(message) = error_message {
                record.last_error = Some(message.to_string());
                if !record.is_exhausted && self.indicates_exhaustion(message) {
                    record.is_exhausted = true;
                    tracing::warn!(
                        key_index = record.key_index,
                        key_hash = %record.key_hash,
                        "Key marked as exhausted by upstream quota error"
                    );
                }
            }
        }

        if !record.is_exhausted && record.units_used >= budget {
            record.is_exhausted = true;
            tracing::warn!(
                key_index = record.key_index,
                key_hash = %record.key_hash,
                units_used = record.units_used,
                "Key reached its daily budget of {} units",
                budget
            );
        }

        let record = record.clone();
        let written = self.persist(&record);
        slot.persisted = written.is_ok();
        match written.and(flushed) {
            Ok(()) => {
                tracing::debug!(
                    key_index = record.key_index,
                    units_used = record.units_used,
                    requests_count = record.requests_count,
                    "Charged {} units",
                    unit_cost
                );
                Ok(record)
            }
            Err((attempts, source)) => {
                tracing::warn!(
                    key_index = record.key_index,
                    key_hash = %record.key_hash,
                    attempts,
                    "Usage kept in memory only, store write failed: {}",
                    source
                );
                Err(QuotaError::DegradedPersistence {
                    key_hash: record.key_hash.clone(),
                    attempts,
                    record: Box::new(record),
                    source,
                })
            }
        }
    }

    /// True iff today's record is not exhausted and below `budget_units`.
    pub fn is_available(&self, key_hash: &str, budget_units: u64) -> Result<bool, QuotaError> {
        Ok(self.record(key_hash)?.is_available(budget_units))
    }

    /// Today's record for one credential. A record from an earlier day reads
    /// as a fresh one.
    pub fn record(&self, key_hash: &str) -> Result<QuotaRecord, QuotaError> {
        let lock = self.slot(key_hash)?;
        let now = self.clock.now();
        let today = self.boundary.today(now);
        let slot = read(lock);
        Ok(current_view(&slot, today, now))
    }

    /// Today's records for every credential, ordered by key index.
    pub fn snapshot(&self) -> Vec<QuotaRecord> {
        let now = self.clock.now();
        let today = self.boundary.today(now);
        self.credentials
            .iter()
            .filter_map(|cred| self.slots.get(cred.hash()))
            .map(|lock| current_view(&read(lock), today, now))
            .collect()
    }

    pub fn available_count(&self) -> usize {
        let budget = self.settings.daily_budget_units;
        self.snapshot()
            .iter()
            .filter(|r| r.is_available(budget))
            .count()
    }

    /// Rolls every credential to today and writes any record the store does
    /// not have yet. Safe to call at any time; a second call on the same day
    /// writes nothing.
    pub fn force_reset_check(&self) -> ResetReport {
        let now = self.clock.now();
        let today = self.boundary.today(now);
        let mut report = ResetReport {
            quota_date: today,
            rolled: Vec::new(),
            failed: Vec::new(),
        };

        for cred in &self.credentials {
            let Some(lock) = self.slots.get(cred.hash()) else {
                continue;
            };
            let mut slot = write(lock);
            self.roll_if_stale(&mut slot, today, now);
            if slot.persisted && slot.unsaved.is_empty() {
                continue;
            }
            let flushed = self.flush_unsaved(&mut slot);
            let written = if slot.persisted {
                Ok(())
            } else {
                self.persist(&slot.record)
            };
            slot.persisted = written.is_ok();
            match written.and(flushed) {
                Ok(()) => report.rolled.push(cred.hash().to_string()),
                Err((attempts, e)) => {
                    tracing::warn!(
                        key_index = cred.index(),
                        key_hash = %cred.hash(),
                        attempts,
                        "Failed to persist record for {}: {}",
                        today,
                        e
                    );
                    report.failed.push(cred.hash().to_string());
                }
            }
        }

        report
    }

    /// Stored rows for one credential, newest first.
    pub fn history(&self, key_hash: &str, limit: usize) -> Result<Vec<QuotaRecord>, QuotaError> {
        self.slot(key_hash)?;
        Ok(self.store.history(key_hash, limit)?)
    }

    fn slot(&self, key_hash: &str) -> Result<&RwLock<Slot>, QuotaError> {
        self.slots
            .get(key_hash)
            .ok_or_else(|| QuotaError::UnknownCredential(key_hash.to_string()))
    }

    fn indicates_exhaustion(&self, message: &str) -> bool {
        let message = message.to_ascii_lowercase();
        self.settings
            .exhaustion_markers
            .iter()
            .any(|marker| !marker.is_empty() && message.contains(&marker.to_ascii_lowercase()))
    }

    /// Replaces a record from an earlier day with a fresh one for `today`.
    /// Charged usage the store never received is queued in `unsaved`.
    fn roll_if_stale(&self, slot: &mut Slot, today: NaiveDate, now: DateTime<Utc>) -> bool {
        if slot.record.quota_date >= today {
            return false;
        }
        tracing::info!(
            key_index = slot.record.key_index,
            key_hash = %slot.record.key_hash,
            "Resetting quota for new day {} (previous: {})",
            today,
            slot.record.quota_date
        );
        let fresh = QuotaRecord::fresh(
            slot.record.key_hash.clone(),
            slot.record.key_index,
            today,
            now,
        );
        let previous = std::mem::replace(&mut slot.record, fresh);
        // A record nobody charged has no usage to keep.
        if !slot.persisted && previous.requests_count > 0 {
            slot.unsaved.push(previous);
        }
        slot.persisted = false;
        true
    }

    /// Writes queued records from earlier days. Records that still fail stay
    /// queued; the last failure is returned.
    fn flush_unsaved(&self, slot: &mut Slot) -> Result<(), (u32, StoreError)> {
        let mut failure = None;
        let mut kept = Vec::new();
        for record in std::mem::take(&mut slot.unsaved) {
            match self.persist(&record) {
                Ok(()) => tracing::info!(
                    key_index = record.key_index,
                    key_hash = %record.key_hash,
                    units_used = record.units_used,
                    "Saved usage left over from {}",
                    record.quota_date
                ),
                Err((attempts, e)) => {
                    tracing::warn!(
                        key_index = record.key_index,
                        key_hash = %record.key_hash,
                        units_used = record.units_used,
                        attempts,
                        "Usage for {} still not saved: {}",
                        record.quota_date,
                        e
                    );
                    kept.push(record);
                    failure = Some((attempts, e));
                }
            }
        }
        slot.unsaved = kept;
        failure.map_or(Ok(()), Err)
    }

    /// Writes `record`, retrying up to `persistence_retry_count` more times.
    fn persist(&self, record: &QuotaRecord) -> Result<(), (u32, StoreError)> {
        let attempts = self.settings.persistence_retry_count.saturating_add(1);
        let mut attempt = 1;
        loop {
            match self.store.upsert(record) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err((attempt, e)),
                Err(e) => {
                    tracing::debug!(
                        key_hash = %record.key_hash,
                        "Store write attempt {}/{} failed: {}",
                        attempt,
                        attempts,
                        e
                    );
                    if !self.settings.retry_backoff.is_zero() {
                        std::thread::sleep(self.settings.retry_backoff);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

fn current_view(slot: &Slot, today: NaiveDate, now: DateTime<Utc>) -> QuotaRecord {
    if slot.record.quota_date < today {
        QuotaRecord::fresh(slot.record.key_hash.clone(), slot.record.key_index, today, now)
    } else {
        slot.record.clone()
    }
}

// A panic never leaves a slot half-written: every mutation is a plain field
// update on an owned record.
fn read(lock: &RwLock<Slot>) -> RwLockReadGuard<'_, Slot> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(lock: &RwLock<Slot>) -> RwLockWriteGuard<'_, Slot> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
