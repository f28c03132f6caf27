//! Wiring and output helpers used by the `keypool` binary.

use kp_config::{PoolConfig, ResolvedCredential};
use kp_quota::{
    Credential, LedgerSettings, PoolSummary, QuotaLedger, QuotaManager, QuotaRecord, QuotaStore,
    SqliteQuotaStore,
};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

/// Build-time version string.
///
/// When `KEYPOOL_VERSION` is provided in the build environment, that value is
/// used. Otherwise we fall back to the crate package version.
pub const VERSION: &str = match option_env!("KEYPOOL_VERSION") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn ledger_settings(config: &PoolConfig) -> anyhow::Result<LedgerSettings> {
    Ok(LedgerSettings {
        daily_budget_units: config.daily_budget_units,
        timezone: config.timezone()?,
        persistence_retry_count: config.persistence_retry_count,
        retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        exhaustion_markers: config.exhaustion_markers.clone(),
    })
}

/// Opens the SQLite store named by `config` and builds a manager over the
/// configured credentials.
pub fn build_manager(config: &PoolConfig) -> anyhow::Result<QuotaManager> {
    let credentials = config.resolve_credentials()?;
    let db_path = config.database_path()?;
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = Arc::new(SqliteQuotaStore::open(&db_path)?);
    tracing::debug!("Using quota database {}", db_path.display());
    build_manager_with(config, &credentials, store)
}

pub fn build_manager_with(
    config: &PoolConfig,
    credentials: &[ResolvedCredential],
    store: Arc<dyn QuotaStore>,
) -> anyhow::Result<QuotaManager> {
    let credentials = credentials
        .iter()
        .map(|c| Credential::new(c.index, &c.key))
        .collect();
    let ledger = QuotaLedger::new(credentials, store, ledger_settings(config)?)?;
    Ok(QuotaManager::new(
        Arc::new(ledger),
        config.policy.into_policy(),
    ))
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// What `keypool select` prints. The raw key is never part of it.
#[derive(Debug, Serialize, PartialEq)]
pub struct SelectedKey {
    pub index: u32,
    pub hash: String,
}

impl From<&Credential> for SelectedKey {
    fn from(cred: &Credential) -> Self {
        Self {
            index: cred.index(),
            hash: cred.hash().to_string(),
        }
    }
}

pub fn render_summary(summary: &PoolSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Quota date {} | {} of {} keys available | budget {} units/key | strategy {}",
        summary.quota_date,
        summary.available_keys,
        summary.total_keys,
        summary.daily_budget_units,
        summary.strategy
    );
    let _ = writeln!(out, "Next reset: {}", summary.next_reset.to_rfc3339());
    let _ = writeln!(
        out,
        "{:<5} {:<32} {:<10} {:>10} {:>10} {:>8} {:>8}  {}",
        "KEY", "HASH", "STATUS", "USED", "REMAINING", "USAGE%", "REQS", "LAST ERROR"
    );
    for key in &summary.keys {
        let _ = writeln!(
            out,
            "#{:<4} {:<32} {:<10} {:>10} {:>10} {:>8.2} {:>8}  {}",
            key.index,
            key.hash,
            key.status.as_str(),
            key.units_used,
            key.units_remaining,
            key.usage_percentage,
            key.requests,
            key.last_error.as_deref().unwrap_or("-")
        );
    }
    out
}

pub fn render_history(records: &[QuotaRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<10} {:>10} {:>8} {:<9}  {}",
        "DATE", "USED", "REQS", "EXHAUSTED", "LAST USED"
    );
    for r in records {
        let _ = writeln!(
            out,
            "{:<10} {:>10} {:>8} {:<9}  {}",
            r.quota_date,
            r.units_used,
            r.requests_count,
            if r.is_exhausted { "yes" } else { "no" },
            r.last_used_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    out
}
