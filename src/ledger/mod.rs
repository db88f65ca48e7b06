// Ledger module - WHO HAS SEEN WHAT
// Received-spend tracking and shared Bloom filter reconciliation

mod shared;
mod spend_ledger;
mod spending_id;

pub use shared::{now_millis, SharedLedger};
pub use spend_ledger::{
    CleanupReport, DoubleSpendLedger, LedgerConfig, LedgerError, LedgerStats, ReconcileOutcome,
    Reconciliation,
};
pub use spending_id::SpendingIdentifier;
