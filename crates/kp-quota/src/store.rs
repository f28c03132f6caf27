use crate::migrations;
use crate::record::QuotaRecord;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Invalid value in column {column}: {value}")]
    Corrupt { column: &'static str, value: i64 },
}

/// Durable storage of quota rows keyed by `(key_hash, quota_date)`.
///
/// Implementations must be safe to share between threads.
pub trait QuotaStore: Send + Sync {
    /// Insert or replace the row for `(record.key_hash, record.quota_date)`.
    fn upsert(&self, record: &QuotaRecord) -> Result<(), StoreError>;

    fn get(&self, key_hash: &str, date: NaiveDate) -> Result<Option<QuotaRecord>, StoreError>;

    fn list_by_date(&self, date: NaiveDate) -> Result<Vec<QuotaRecord>, StoreError>;

    /// Rows for one credential, newest date first.
    fn history(&self, key_hash: &str, limit: usize) -> Result<Vec<QuotaRecord>, StoreError>;
}

pub struct SqliteQuotaStore {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str = "SELECT key_hash, key_index, units_used, requests_count, quota_date,
        last_used_at, is_exhausted, last_error, created_at, updated_at
 FROM quota_records";

impl SqliteQuotaStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        migrations::run_migrations(&conn)
            .map_err(|e| StoreError::Migration(format!("{e:#}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_count(column: &'static str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt { column, value })
}

/// Raw row as read from SQLite, before the counters are range-checked.
struct RawRecord {
    record: QuotaRecord,
    units_used: i64,
    requests_count: i64,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    let units_used: i64 = row.get(2)?;
    let requests_count: i64 = row.get(3)?;
    Ok(RawRecord {
        record: QuotaRecord {
            key_hash: row.get(0)?,
            key_index: row.get(1)?,
            units_used: 0,
            requests_count: 0,
            quota_date: row.get(4)?,
            last_used_at: row.get(5)?,
            is_exhausted: row.get(6)?,
            last_error: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        },
        units_used,
        requests_count,
    })
}

impl RawRecord {
    fn finish(self) -> Result<QuotaRecord, StoreError> {
        let mut record = self.record;
        record.units_used = from_sql_count("units_used", self.units_used)?;
        record.requests_count = from_sql_count("requests_count", self.requests_count)?;
        Ok(record)
    }
}

impl QuotaStore for SqliteQuotaStore {
    fn upsert(&self, record: &QuotaRecord) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO quota_records (key_hash, key_index, units_used, requests_count, quota_date,
                                        last_used_at, is_exhausted, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(key_hash, quota_date) DO UPDATE SET
                 key_index = excluded.key_index,
                 units_used = excluded.units_used,
                 requests_count = excluded.requests_count,
                 last_used_at = excluded.last_used_at,
                 is_exhausted = excluded.is_exhausted,
                 last_error = excluded.last_error,
                 updated_at = excluded.updated_at",
            rusqlite::params![
                record.key_hash,
                record.key_index,
                to_sql_count(record.units_used),
                to_sql_count(record.requests_count),
                record.quota_date,
                record.last_used_at,
                record.is_exhausted,
                record.last_error,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get(&self, key_hash: &str, date: NaiveDate) -> Result<Option<QuotaRecord>, StoreError> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE key_hash = ?1 AND quota_date = ?2"),
                rusqlite::params![key_hash, date],
                read_row,
            )
            .optional()?;
        raw.map(RawRecord::finish).transpose()
    }

    fn list_by_date(&self, date: NaiveDate) -> Result<Vec<QuotaRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("{SELECT_COLUMNS} WHERE quota_date = ?1 ORDER BY key_index"))?;
        let rows = stmt
            .query_map([date], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRecord::finish).collect()
    }

    fn history(&self, key_hash: &str, limit: usize) -> Result<Vec<QuotaRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE key_hash = ?1 ORDER BY quota_date DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params![key_hash, to_sql_count(limit as u64)],
                read_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRecord::finish).collect()
    }
}

/// Non-durable store for tests and embedders that keep quota state in
/// process only.
#[derive(Default)]
pub struct MemoryQuotaStore {
    rows: Mutex<BTreeMap<(String, NaiveDate), QuotaRecord>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, BTreeMap<(String, NaiveDate), QuotaRecord>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }
}

impl QuotaStore for MemoryQuotaStore {
    fn upsert(&self, record: &QuotaRecord) -> Result<(), StoreError> {
        let mut rows = self.rows();
        let key = (record.key_hash.clone(), record.quota_date);
        let created_at = rows.get(&key).map(|existing| existing.created_at);
        let mut stored = record.clone();
        if let Some(created_at) = created_at {
            stored.created_at = created_at;
        }
        rows.insert(key, stored);
        Ok(())
    }

    fn get(&self, key_hash: &str, date: NaiveDate) -> Result<Option<QuotaRecord>, StoreError> {
        Ok(self.rows().get(&(key_hash.to_string(), date)).cloned())
    }

    fn list_by_date(&self, date: NaiveDate) -> Result<Vec<QuotaRecord>, StoreError> {
        let mut records: Vec<QuotaRecord> = self
            .rows()
            .values()
            .filter(|r| r.quota_date == date)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.key_index);
        Ok(records)
    }

    fn history(&self, key_hash: &str, limit: usize) -> Result<Vec<QuotaRecord>, StoreError> {
        Ok(self
            .rows()
            .values()
            .rev()
            .filter(|r| r.key_hash == key_hash)
            .take(limit)
            .cloned()
            .collect())
    }
}
