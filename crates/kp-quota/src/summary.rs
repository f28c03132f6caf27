use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::record::QuotaRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Available,
    Exhausted,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Available => "available",
            KeyStatus::Exhausted => "exhausted",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeySummary {
    pub index: u32,
    pub hash: String,
    pub status: KeyStatus,
    pub units_used: u64,
    pub units_remaining: u64,
    pub usage_percentage: f64,
    pub requests: u64,
    pub is_exhausted: bool,
    pub last_error: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Operator view of the whole pool for the current quota date.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub quota_date: NaiveDate,
    pub total_keys: usize,
    pub available_keys: usize,
    pub exhausted_keys: usize,
    pub daily_budget_units: u64,
    pub strategy: String,
    pub next_reset: DateTime<Utc>,
    pub keys: Vec<KeySummary>,
}

impl PoolSummary {
    pub fn build(
        quota_date: NaiveDate,
        records: &[QuotaRecord],
        daily_budget_units: u64,
        strategy: &str,
        next_reset: DateTime<Utc>,
    ) -> Self {
        let keys: Vec<KeySummary> = records
            .iter()
            .map(|r| KeySummary {
                index: r.key_index,
                hash: r.key_hash.clone(),
                status: if r.is_available(daily_budget_units) {
                    KeyStatus::Available
                } else {
                    KeyStatus::Exhausted
                },
                units_used: r.units_used,
                units_remaining: r.remaining(daily_budget_units),
                usage_percentage: usage_percentage(r.units_used, daily_budget_units),
                requests: r.requests_count,
                is_exhausted: r.is_exhausted,
                last_error: r.last_error.clone(),
                last_used_at: r.last_used_at,
            })
            .collect();

        let available_keys = keys
            .iter()
            .filter(|k| k.status == KeyStatus::Available)
            .count();

        Self {
            quota_date,
            total_keys: keys.len(),
            available_keys,
            exhausted_keys: keys.len() - available_keys,
            daily_budget_units,
            strategy: strategy.to_string(),
            next_reset,
            keys,
        }
    }
}

/// Percentage of the budget used, rounded to two decimals.
fn usage_percentage(units_used: u64, budget: u64) -> f64 {
    if budget == 0 {
        return 100.0;
    }
    let pct = units_used as f64 / budget as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}
