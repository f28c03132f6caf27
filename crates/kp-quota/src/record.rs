use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Usage of one credential on one calendar day.
///
/// Rows are keyed by `(key_hash, quota_date)`. Once `quota_date` is in the
/// past the row is history and is never written again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub key_hash: String,
    pub key_index: u32,
    pub units_used: u64,
    pub requests_count: u64,
    pub quota_date: NaiveDate,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_exhausted: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuotaRecord {
    /// A zeroed record for `quota_date`.
    pub fn fresh(
        key_hash: impl Into<String>,
        key_index: u32,
        quota_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key_hash: key_hash.into(),
            key_index,
            units_used: 0,
            requests_count: 0,
            quota_date,
            last_used_at: None,
            is_exhausted: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining(&self, budget_units: u64) -> u64 {
        budget_units.saturating_sub(self.units_used)
    }

    /// Both the explicit exhaustion flag and local threshold accounting gate
    /// availability.
    pub fn is_available(&self, budget_units: u64) -> bool {
        !self.is_exhausted && self.units_used < budget_units
    }
}
