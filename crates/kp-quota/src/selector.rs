use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::credential::Credential;
use crate::error::QuotaError;
use crate::ledger::QuotaLedger;
use crate::record::QuotaRecord;

/// Chooses one credential among those eligible for the next call.
pub trait SelectionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns a position in `candidates`, which is non-empty and ordered by
    /// key index.
    fn choose(&self, candidates: &[QuotaRecord]) -> usize;
}

/// Lowest `units_used` wins; ties go to the lowest key index.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastUsed;

impl SelectionPolicy for LeastUsed {
    fn name(&self) -> &'static str {
        "least_used"
    }

    fn choose(&self, candidates: &[QuotaRecord]) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| (r.units_used, r.key_index))
            .map(|(pos, _)| pos)
            .unwrap_or(0)
    }
}

/// Rotates through eligible credentials in key-index order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    last_index: AtomicU32,
}

impl SelectionPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    // Concurrent callers may occasionally be handed the same key.
    fn choose(&self, candidates: &[QuotaRecord]) -> usize {
        let last = self.last_index.load(Ordering::Relaxed);
        let pos = candidates
            .iter()
            .position(|r| r.key_index > last)
            .unwrap_or(0);
        if let Some(chosen) = candidates.get(pos) {
            self.last_index.store(chosen.key_index, Ordering::Relaxed);
        }
        pos
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    LeastUsed,
    RoundRobin,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::LeastUsed => "least_used",
            SelectionStrategy::RoundRobin => "round_robin",
        }
    }

    pub fn into_policy(self) -> Box<dyn SelectionPolicy> {
        match self {
            SelectionStrategy::LeastUsed => Box::new(LeastUsed),
            SelectionStrategy::RoundRobin => Box::new(RoundRobin::default()),
        }
    }
}

pub struct KeySelector {
    ledger: Arc<QuotaLedger>,
    policy: Box<dyn SelectionPolicy>,
}

impl KeySelector {
    pub fn new(ledger: Arc<QuotaLedger>, policy: Box<dyn SelectionPolicy>) -> Self {
        Self { ledger, policy }
    }

    pub fn least_used(ledger: Arc<QuotaLedger>) -> Self {
        Self::new(ledger, Box::new(LeastUsed))
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Picks a credential for the next call.
    ///
    /// With `minimum_remaining_units`, only credentials with at least that
    /// much budget left are eligible. Fails with `PoolExhausted` when nothing
    /// is eligible.
    pub fn select(&self, minimum_remaining_units: Option<u64>) -> Result<Credential, QuotaError> {
        let budget = self.ledger.daily_budget();
        let snapshot = self.ledger.snapshot();
        let total = snapshot.len();
        let exhausted = snapshot.iter().filter(|r| !r.is_available(budget)).count();

        let candidates: Vec<QuotaRecord> = snapshot
            .into_iter()
            .filter(|r| r.is_available(budget))
            .filter(|r| minimum_remaining_units.map_or(true, |min| r.remaining(budget) >= min))
            .collect();

        if candidates.is_empty() {
            let reset_at = self.ledger.next_reset();
            tracing::warn!(
                exhausted,
                total,
                required_units = ?minimum_remaining_units,
                "No credential available until {}",
                reset_at
            );
            return Err(QuotaError::PoolExhausted {
                total,
                exhausted,
                required_units: minimum_remaining_units,
                reset_at,
            });
        }

        let pos = self.policy.choose(&candidates).min(candidates.len() - 1);
        let chosen = &candidates[pos];
        tracing::debug!(
            key_index = chosen.key_index,
            key_hash = %chosen.key_hash,
            units_used = chosen.units_used,
            policy = self.policy.name(),
            "Selected API key"
        );

        self.ledger
            .credential(&chosen.key_hash)
            .cloned()
            .ok_or_else(|| QuotaError::UnknownCredential(chosen.key_hash.clone()))
    }
}
