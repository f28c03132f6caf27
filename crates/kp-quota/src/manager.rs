use std::sync::Arc;

use crate::credential::Credential;
use crate::error::QuotaError;
use crate::ledger::QuotaLedger;
use crate::record::QuotaRecord;
use crate::reset::ResetReport;
use crate::selector::{KeySelector, SelectionPolicy};
use crate::summary::PoolSummary;

/// Entry point for callers of the external API: ask for a key, then report
/// what the call cost.
pub struct QuotaManager {
    ledger: Arc<QuotaLedger>,
    selector: KeySelector,
}

impl QuotaManager {
    pub fn new(ledger: Arc<QuotaLedger>, policy: Box<dyn SelectionPolicy>) -> Self {
        let selector = KeySelector::new(ledger.clone(), policy);
        Self { ledger, selector }
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn select(&self, minimum_remaining_units: Option<u64>) -> Result<Credential, QuotaError> {
        self.selector.select(minimum_remaining_units)
    }

    pub fn charge_units(
        &self,
        credential: &Credential,
        unit_cost: u64,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<QuotaRecord, QuotaError> {
        self.ledger
            .charge_units(credential.hash(), unit_cost, success, error_message)
    }

    pub fn snapshot(&self) -> Vec<QuotaRecord> {
        self.ledger.snapshot()
    }

    pub fn force_reset_check(&self) -> ResetReport {
        self.ledger.force_reset_check()
    }

    pub fn summary(&self) -> PoolSummary {
        PoolSummary::build(
            self.ledger.today(),
            &self.ledger.snapshot(),
            self.ledger.daily_budget(),
            self.selector.policy_name(),
            self.ledger.next_reset(),
        )
    }

    pub fn history(
        &self,
        credential: &Credential,
        limit: usize,
    ) -> Result<Vec<QuotaRecord>, QuotaError> {
        self.ledger.history(credential.hash(), limit)
    }

    pub fn credential_by_index(&self, key_index: u32) -> Result<Credential, QuotaError> {
        self.ledger
            .credential_by_index(key_index)
            .cloned()
            .ok_or_else(|| QuotaError::UnknownCredential(format!("key #{key_index}")))
    }
}
