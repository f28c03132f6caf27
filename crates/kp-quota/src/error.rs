use chrono::{DateTime, Utc};

use crate::record::QuotaRecord;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("Unknown credential: {0}")]
    UnknownCredential(String),
    #[error("No credential available ({exhausted}/{total} exhausted); next reset at {reset_at}")]
    PoolExhausted {
        total: usize,
        exhausted: usize,
        required_units: Option<u64>,
        reset_at: DateTime<Utc>,
    },
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("Usage for {key_hash} kept in memory after {attempts} failed writes: {source}")]
    DegradedPersistence {
        key_hash: String,
        attempts: u32,
        record: Box<QuotaRecord>,
        source: StoreError,
    },
    #[error("Credential pool is empty")]
    EmptyPool,
    #[error("Duplicate credential: {0}")]
    DuplicateCredential(String),
}

impl QuotaError {
    pub fn error_code(&self) -> &'static str {
        match self {
            QuotaError::UnknownCredential(_) => "UNKNOWN_CREDENTIAL",
            QuotaError::PoolExhausted { .. } => "POOL_EXHAUSTED",
            QuotaError::Persistence(_) => "PERSISTENCE_ERROR",
            QuotaError::DegradedPersistence { .. } => "DEGRADED_PERSISTENCE",
            QuotaError::EmptyPool => "EMPTY_POOL",
            QuotaError::DuplicateCredential(_) => "DUPLICATE_CREDENTIAL",
        }
    }

    /// Whether the caller can expect a later attempt to succeed. Pool
    /// exhaustion clears at `reset_at`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QuotaError::PoolExhausted { .. } | QuotaError::Persistence(_)
        )
    }

    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        match self {
            QuotaError::PoolExhausted { reset_at, .. } => Some(*reset_at),
            _ => None,
        }
    }

    /// The in-memory record for a charge whose write could not be persisted.
    pub fn degraded_record(&self) -> Option<&QuotaRecord> {
        match self {
            QuotaError::DegradedPersistence { record, .. } => Some(record),
            _ => None,
        }
    }
}
