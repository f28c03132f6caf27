pub mod clock;
pub mod credential;
pub mod error;
pub mod ledger;
pub mod manager;
pub mod migrations;
pub mod record;
pub mod reset;
pub mod selector;
pub mod store;
pub mod summary;

pub use clock::{Clock, ManualClock, SystemClock};
pub use credential::{hash_key, Credential};
pub use error::QuotaError;
pub use ledger::{LedgerSettings, QuotaLedger};
pub use manager::QuotaManager;
pub use record::QuotaRecord;
pub use reset::{spawn_reset_task, DayBoundary, ResetReport};
pub use selector::{KeySelector, LeastUsed, RoundRobin, SelectionPolicy, SelectionStrategy};
pub use store::{MemoryQuotaStore, QuotaStore, SqliteQuotaStore, StoreError};
pub use summary::{KeyStatus, PoolSummary};
