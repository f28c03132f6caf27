use chrono::{DateTime, Duration, TimeZone, Utc};
use kp_quota::{
    Credential, KeySelector, LedgerSettings, ManualClock, MemoryQuotaStore, QuotaError,
    QuotaLedger, QuotaRecord, QuotaStore, SqliteQuotaStore, StoreError,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 15, 10, 0, 0).unwrap()
}

fn settings() -> LedgerSettings {
    LedgerSettings {
        retry_backoff: std::time::Duration::ZERO,
        ..LedgerSettings::default()
    }
}

fn pool() -> Vec<Credential> {
    vec![
        Credential::new(1, "key-a"),
        Credential::new(2, "key-b"),
        Credential::new(3, "key-c"),
    ]
}

fn ledger(store: Arc<dyn QuotaStore>) -> (Arc<QuotaLedger>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start()));
    let ledger = QuotaLedger::with_clock(pool(), store, settings(), clock.clone()).unwrap();
    (Arc::new(ledger), clock)
}

fn hash(ledger: &QuotaLedger, index: u32) -> String {
    ledger.credential_by_index(index).unwrap().hash().to_string()
}

/// Fails the next `failures` writes, then behaves like the wrapped store.
struct FlakyStore {
    inner: MemoryQuotaStore,
    failures: AtomicU32,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryQuotaStore::new(),
            failures: AtomicU32::new(0),
        }
    }

    fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

impl QuotaStore for FlakyStore {
    fn upsert(&self, record: &QuotaRecord) -> Result<(), StoreError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.inner.upsert(record)
    }

    fn get(
        &self,
        key_hash: &str,
        date: chrono::NaiveDate,
    ) -> Result<Option<QuotaRecord>, StoreError> {
        self.inner.get(key_hash, date)
    }

    fn list_by_date(&self, date: chrono::NaiveDate) -> Result<Vec<QuotaRecord>, StoreError> {
        self.inner.list_by_date(date)
    }

    fn history(&self, key_hash: &str, limit: usize) -> Result<Vec<QuotaRecord>, StoreError> {
        self.inner.history(key_hash, limit)
    }
}

#[test]
fn concurrent_charges_sum_exactly() {
    let store = Arc::new(SqliteQuotaStore::in_memory().unwrap());
    let (ledger, _) = ledger(store.clone());
    let key = hash(&ledger, 1);
    let other = hash(&ledger, 2);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let ledger = ledger.clone();
            let key = key.clone();
            let other = other.clone();
            thread::spawn(move || {
                for i in 0..50u64 {
                    ledger.charge_units(&key, (t + i) % 5, true, None).unwrap();
                    if i % 10 == 0 {
                        ledger.charge_units(&other, 1, true, None).unwrap();
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let expected: u64 = (0..8u64)
        .flat_map(|t| (0..50u64).map(move |i| (t + i) % 5))
        .sum();
    let record = ledger.record(&key).unwrap();
    assert_eq!(record.units_used, expected);
    assert_eq!(record.requests_count, 400);

    let stored = store.get(&key, start().date_naive()).unwrap().unwrap();
    assert_eq!(stored.units_used, expected);
    assert_eq!(stored.requests_count, 400);

    let other_record = ledger.record(&other).unwrap();
    assert_eq!(other_record.units_used, 40);
    assert_eq!(other_record.requests_count, 40);
}

#[test]
fn exhaustion_is_never_cleared_within_a_day() {
    let (ledger, clock) = ledger(Arc::new(MemoryQuotaStore::new()));
    let key = hash(&ledger, 2);

    let record = ledger
        .charge_units(&key, 1, false, Some("HTTP 403: quotaExceeded"))
        .unwrap();
    assert!(record.is_exhausted);
    assert_eq!(record.last_error.as_deref(), Some("HTTP 403: quotaExceeded"));

    clock.advance(Duration::hours(3));
    for _ in 0..5 {
        let record = ledger.charge_units(&key, 0, true, None).unwrap();
        assert!(record.is_exhausted);
    }
    assert!(!ledger.is_available(&key, u64::MAX).unwrap());
}

#[test]
fn day_boundary_resets_usage_and_keeps_history() {
    let store = Arc::new(MemoryQuotaStore::new());
    let (ledger, clock) = ledger(store.clone());
    let a = hash(&ledger, 1);
    let b = hash(&ledger, 2);
    let yesterday = start().date_naive();

    ledger.charge_units(&a, 400, true, None).unwrap();
    ledger.charge_units(&a, 100, true, None).unwrap();
    ledger
        .charge_units(&b, 5, false, Some("quotaExceeded"))
        .unwrap();

    clock.advance(Duration::days(1));

    // Lazy view before anything is written.
    for record in ledger.snapshot() {
        assert_eq!(record.units_used, 0);
        assert_eq!(record.requests_count, 0);
        assert!(!record.is_exhausted);
        assert_eq!(record.quota_date, yesterday.succ_opt().unwrap());
    }

    let report = ledger.force_reset_check();
    assert_eq!(report.rolled.len(), 3);

    let old_a = store.get(&a, yesterday).unwrap().unwrap();
    assert_eq!(old_a.units_used, 500);
    assert_eq!(old_a.requests_count, 2);
    let old_b = store.get(&b, yesterday).unwrap().unwrap();
    assert!(old_b.is_exhausted);

    let new_b = store
        .get(&b, yesterday.succ_opt().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(new_b.units_used, 0);
    assert!(!new_b.is_exhausted);
    assert!(ledger.is_available(&b, 10_000).unwrap());

    let history = ledger.history(&a, 10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].units_used, 0);
    assert_eq!(history[1].units_used, 500);
}

#[test]
fn lazy_rollover_on_charge_preserves_previous_day() {
    let store = Arc::new(SqliteQuotaStore::in_memory().unwrap());
    let (ledger, clock) = ledger(store.clone());
    let a = hash(&ledger, 1);
    let day_one = start().date_naive();

    ledger.charge_units(&a, 9_000, true, None).unwrap();
    clock.advance(Duration::days(1));
    let record = ledger.charge_units(&a, 10, true, None).unwrap();

    assert_eq!(record.units_used, 10);
    assert_eq!(record.requests_count, 1);
    assert_eq!(record.quota_date, day_one.succ_opt().unwrap());
    assert_eq!(store.get(&a, day_one).unwrap().unwrap().units_used, 9_000);
}

#[test]
fn select_returns_least_used_available_key() {
    let (ledger, _) = ledger(Arc::new(MemoryQuotaStore::new()));
    ledger.charge_units(&hash(&ledger, 1), 100, true, None).unwrap();
    ledger.charge_units(&hash(&ledger, 2), 50, true, None).unwrap();
    ledger
        .charge_units(&hash(&ledger, 3), 0, false, Some("403 Forbidden"))
        .unwrap();

    let selector = KeySelector::least_used(ledger.clone());
    let chosen = selector.select(None).unwrap();
    assert_eq!(chosen.index(), 2);
    assert_eq!(chosen.secret(), "key-b");
}

#[test]
fn select_fails_when_every_key_is_exhausted() {
    let (ledger, _) = ledger(Arc::new(MemoryQuotaStore::new()));
    for index in 1..=3 {
        ledger
            .charge_units(&hash(&ledger, index), 1, false, Some("quotaExceeded"))
            .unwrap();
    }

    let selector = KeySelector::least_used(ledger.clone());
    match selector.select(None) {
        Err(QuotaError::PoolExhausted {
            total,
            exhausted,
            reset_at,
            ..
        }) => {
            assert_eq!(total, 3);
            assert_eq!(exhausted, 3);
            assert_eq!(reset_at, Utc.with_ymd_and_hms(2026, 6, 16, 0, 0, 0).unwrap());
        }
        other => panic!("expected PoolExhausted, got {other:?}"),
    }
}

#[test]
fn select_honors_minimum_remaining_units() {
    let (ledger, _) = ledger(Arc::new(MemoryQuotaStore::new()));
    ledger.charge_units(&hash(&ledger, 1), 9_500, true, None).unwrap();
    ledger.charge_units(&hash(&ledger, 2), 9_800, true, None).unwrap();
    ledger.charge_units(&hash(&ledger, 3), 9_000, true, None).unwrap();

    let selector = KeySelector::least_used(ledger.clone());
    assert_eq!(selector.select(Some(600)).unwrap().index(), 3);

    match selector.select(Some(2_000)) {
        Err(QuotaError::PoolExhausted {
            exhausted,
            required_units,
            ..
        }) => {
            assert_eq!(exhausted, 0);
            assert_eq!(required_units, Some(2_000));
        }
        other => panic!("expected PoolExhausted, got {other:?}"),
    }
}

#[test]
fn local_threshold_gates_availability() {
    let (ledger, _) = ledger(Arc::new(MemoryQuotaStore::new()));
    let k1 = hash(&ledger, 1);

    let record = ledger.charge_units(&k1, 9_999, true, None).unwrap();
    assert!(!record.is_exhausted);
    assert!(ledger.is_available(&k1, 10_000).unwrap());

    let record = ledger.charge_units(&k1, 2, true, None).unwrap();
    assert_eq!(record.units_used, 10_001);
    assert!(record.last_error.is_none());
    assert!(!ledger.is_available(&k1, 10_000).unwrap());
}

#[test]
fn failed_writes_degrade_without_losing_usage() {
    let store = Arc::new(FlakyStore::new());
    let (ledger, _) = ledger(store.clone());
    let key = hash(&ledger, 1);

    // Within the retry budget: the charge succeeds.
    store.fail_next(3);
    let record = ledger.charge_units(&key, 10, true, None).unwrap();
    assert_eq!(record.units_used, 10);

    // One more failure than the retry budget allows.
    store.fail_next(4);
    let err = ledger.charge_units(&key, 25, true, None).unwrap_err();
    match &err {
        QuotaError::DegradedPersistence {
            attempts, record, ..
        } => {
            assert_eq!(*attempts, 4);
            assert_eq!(record.units_used, 35);
        }
        other => panic!("expected DegradedPersistence, got {other:?}"),
    }
    assert_eq!(ledger.record(&key).unwrap().units_used, 35);
    let stored = store.get(&key, start().date_naive()).unwrap().unwrap();
    assert_eq!(stored.units_used, 10);

    // Once the store recovers the next write carries the full total.
    let report = ledger.force_reset_check();
    assert!(report.rolled.contains(&key));
    let stored = store.get(&key, start().date_naive()).unwrap().unwrap();
    assert_eq!(stored.units_used, 35);
    assert_eq!(stored.requests_count, 2);
}

#[test]
fn reset_check_reports_failed_writes() {
    let store = Arc::new(FlakyStore::new());
    let (ledger, _) = ledger(store.clone());

    store.fail_next(4);
    let report = ledger.force_reset_check();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.rolled.len(), 2);

    let retry = ledger.force_reset_check();
    assert_eq!(retry.rolled, report.failed);
    assert!(retry.failed.is_empty());
}

#[test]
fn unsaved_usage_is_written_before_the_day_rolls_over() {
    let store = Arc::new(FlakyStore::new());
    let (ledger, clock) = ledger(store.clone());
    let key = hash(&ledger, 1);
    let day_one = start().date_naive();

    ledger.charge_units(&key, 10, true, None).unwrap();
    store.fail_next(4);
    assert!(ledger.charge_units(&key, 25, true, None).is_err());

    clock.advance(Duration::days(1));
    let record = ledger.charge_units(&key, 1, true, None).unwrap();
    assert_eq!(record.quota_date, day_one.succ_opt().unwrap());
    assert_eq!(record.units_used, 1);

    let stored = store.get(&key, day_one).unwrap().unwrap();
    assert_eq!(stored.units_used, 35);
    assert_eq!(stored.requests_count, 2);
}

#[test]
fn unsaved_usage_stays_queued_while_the_store_is_down() {
    let store = Arc::new(FlakyStore::new());
    let (ledger, clock) = ledger(store.clone());
    let key = hash(&ledger, 1);
    let day_one = start().date_naive();
    let day_two = day_one.succ_opt().unwrap();

    ledger.charge_units(&key, 10, true, None).unwrap();
    store.fail_next(4);
    assert!(ledger.charge_units(&key, 25, true, None).is_err());

    // The flush of day one uses up every failure; today's write succeeds.
    clock.advance(Duration::days(1));
    store.fail_next(4);
    match ledger.charge_units(&key, 1, true, None) {
        Err(QuotaError::DegradedPersistence { record, .. }) => {
            assert_eq!(record.quota_date, day_two);
            assert_eq!(record.units_used, 1);
        }
        other => panic!("expected DegradedPersistence, got {other:?}"),
    }
    assert_eq!(store.get(&key, day_one).unwrap().unwrap().units_used, 10);
    assert_eq!(store.get(&key, day_two).unwrap().unwrap().units_used, 1);

    let report = ledger.force_reset_check();
    assert!(report.rolled.contains(&key));
    assert!(report.failed.is_empty());
    assert_eq!(store.get(&key, day_one).unwrap().unwrap().units_used, 35);
    // Keys that were never charged on day one leave no row for it.
    assert!(store.get(&hash(&ledger, 2), day_one).unwrap().is_none());

    assert!(ledger.force_reset_check().rolled.is_empty());
}

#[test]
fn usage_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quota.db");
    let clock = Arc::new(ManualClock::new(start()));
    let key = Credential::new(1, "key-a");

    {
        let store = Arc::new(SqliteQuotaStore::open(&path).unwrap());
        let ledger =
            QuotaLedger::with_clock(pool(), store, settings(), clock.clone()).unwrap();
        ledger.charge_units(key.hash(), 1_234, true, None).unwrap();
        ledger
            .charge_units(key.hash(), 1, false, Some("quotaExceeded"))
            .unwrap();
    }

    let store = Arc::new(SqliteQuotaStore::open(&path).unwrap());
    let ledger = QuotaLedger::with_clock(pool(), store, settings(), clock).unwrap();
    let record = ledger.record(key.hash()).unwrap();
    assert_eq!(record.units_used, 1_235);
    assert_eq!(record.requests_count, 2);
    assert!(record.is_exhausted);
}

#[test]
fn timezone_decides_the_day_boundary() {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 6, 15, 18, 0, 0).unwrap(),
    ));
    let settings = LedgerSettings {
        timezone: chrono_tz::Asia::Kolkata,
        ..settings()
    };
    let store = Arc::new(MemoryQuotaStore::new());
    let ledger = QuotaLedger::with_clock(pool(), store, settings, clock.clone()).unwrap();
    let key = hash(&ledger, 1);

    ledger.charge_units(&key, 10, true, None).unwrap();
    // 18:00Z is 23:30 in Kolkata; 18:45Z is already the next local day.
    clock.advance(Duration::minutes(45));
    assert_eq!(ledger.record(&key).unwrap().units_used, 0);
    assert_eq!(
        ledger.today(),
        chrono::NaiveDate::from_ymd_opt(2026, 6, 16).unwrap()
    );
}
