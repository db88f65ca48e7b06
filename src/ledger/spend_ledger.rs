// DoubleSpendLedger - shared Bloom filter reconciliation
//
// Tracks spending identifiers this device has received (exact, with a
// received-at time) and a shared filter summarizing everything it has
// seen, its own receipts plus filters gossiped by peers. Incoming
// payments are rejected when any identifier hits either.
//
// Reconciliation ladder, given an optional peer filter F_R:
//   1. more receipts than expected_items -> CapacityExceeded, no filter
//   2. F_M = filter over our receipts
//   3. F_P = F_S ∪ F_M
//   4. no F_R -> F_S = F_P, OnlyOurs
//   5. F_P ∪ F_R fits -> IncludedReceived
//   6. F_M ∪ F_R fits -> ResetShared
//   7. F_P fits -> KeptPrevious, else F_M -> OnlyOurs

use crate::filter::{optimal_num_hash_functions, BloomFilter, BloomFilterError};
use crate::storage::{StoreError, TokenStore};
use crate::token::Token;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const MILLIS_PER_SEC: i64 = 1000;

/// Errors from ledger operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Filter error: {0}")]
    Filter(#[from] BloomFilterError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid ledger config: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// CONFIG
// ============================================================================

/// Configuration for the double-spend ledger
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Shared filter size in bytes (bit length = 8x)
    pub capacity_bytes: usize,
    /// Estimated element count the shared filter may hold
    pub expected_items: usize,
    /// Target false positive rate, drives the hash-function count
    pub false_positive_rate: f64,
    /// How long a received identifier counts against capacity (seconds)
    pub expiry_window_secs: u64,
    /// Store slot holding the shared filter
    pub filter_slot: String,
    /// Minimum time between automatic cleanups (seconds)
    pub cleanup_interval_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 240,
            expected_items: 100,
            false_positive_rate: 0.03,
            expiry_window_secs: 12 * 60 * 60,
            filter_slot: "shared".to_string(),
            cleanup_interval_secs: 12 * 60 * 60,
        }
    }
}

impl LedgerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_bytes(mut self, capacity_bytes: usize) -> Self {
        self.capacity_bytes = capacity_bytes;
        self
    }

    pub fn with_expected_items(mut self, expected_items: usize) -> Self {
        self.expected_items = expected_items;
        self
    }

    pub fn with_false_positive_rate(mut self, rate: f64) -> Self {
        self.false_positive_rate = rate;
        self
    }

    pub fn with_expiry_window(mut self, secs: u64) -> Self {
        self.expiry_window_secs = secs;
        self
    }

    pub fn with_filter_slot(mut self, slot: &str) -> Self {
        self.filter_slot = slot.to_string();
        self
    }

    pub fn with_cleanup_interval(mut self, secs: u64) -> Self {
        self.cleanup_interval_secs = secs;
        self
    }

    /// Hash functions used by every filter of this ledger
    pub fn num_hash_functions(&self) -> u32 {
        optimal_num_hash_functions(self.false_positive_rate)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.capacity_bytes == 0 {
            return Err(LedgerError::InvalidConfig("capacity_bytes cannot be 0".to_string()));
        }
        if self.expected_items == 0 {
            return Err(LedgerError::InvalidConfig("expected_items cannot be 0".to_string()));
        }
        if !(self.false_positive_rate > 0.0 && self.false_positive_rate < 1.0) {
            return Err(LedgerError::InvalidConfig(format!(
                "false_positive_rate must be in (0, 1), got {}",
                self.false_positive_rate
            )));
        }
        if self.filter_slot.is_empty() {
            return Err(LedgerError::InvalidConfig("filter_slot cannot be empty".to_string()));
        }
        Ok(())
    }

    fn expiry_window_ms(&self) -> i64 {
        (self.expiry_window_secs as i64).saturating_mul(MILLIS_PER_SEC)
    }

    fn cleanup_interval_ms(&self) -> i64 {
        (self.cleanup_interval_secs as i64).saturating_mul(MILLIS_PER_SEC)
    }
}

// ============================================================================
// OUTCOMES AND STATS
// ============================================================================

/// Which rung of the reconciliation ladder was taken
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconcileOutcome {
    IncludedReceived,
    ResetShared,
    KeptPrevious,
    OnlyOurs,
    CapacityExceeded,
}

impl ReconcileOutcome {
    /// Stable result code
    pub fn code(&self) -> &'static str {
        match self {
            Self::IncludedReceived => "INCLUDED_RECEIVED",
            Self::ResetShared => "RESET_SHARED",
            Self::KeptPrevious => "KEPT_PREVIOUS",
            Self::OnlyOurs => "ONLY_OURS",
            Self::CapacityExceeded => "CAPACITY_EXCEEDED",
        }
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of one reconciliation: the filter to broadcast (if any)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reconciliation {
    pub filter: Option<BloomFilter>,
    pub outcome: ReconcileOutcome,
}

/// Result of an expiry sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub remaining: usize,
    pub filter_reset: bool,
}

/// Snapshot for monitoring
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LedgerStats {
    pub received_count: usize,
    pub shared_filter_estimate: usize,
    pub shared_filter_set_bits: usize,
    pub capacity_bytes: usize,
    pub expected_items: usize,
    pub num_hash_functions: u32,
    pub false_positive_rate: f64,
    pub received_filters: u64,
    pub last_cleanup_ms: i64,
    pub since_last_cleanup_ms: i64,
}

// ============================================================================
// LEDGER
// ============================================================================

/// Double-spend detection state for one local identity
///
/// Not internally synchronized; share it through
/// [`SharedLedger`](super::SharedLedger).
pub struct DoubleSpendLedger {
    config: LedgerConfig,
    num_hash_functions: u32,
    store: Arc<dyn TokenStore>,
    shared: BloomFilter,
    received: HashMap<String, i64>,
    received_filters: u64,
    last_cleanup_ms: i64,
}

impl fmt::Debug for DoubleSpendLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoubleSpendLedger")
            .field("config", &self.config)
            .field("shared", &self.shared)
            .field("received", &self.received.len())
            .field("received_filters", &self.received_filters)
            .finish()
    }
}

impl DoubleSpendLedger {
    /// Load (or initialize) ledger state from `store`
    pub fn open(config: LedgerConfig, store: Arc<dyn TokenStore>, now_ms: i64) -> Result<Self, LedgerError> {
        config.validate()?;
        let num_hash_functions = config.num_hash_functions();

        let shared = match store.get_filter(&config.filter_slot)? {
            Some(bytes) if bytes.len() == config.capacity_bytes => {
                BloomFilter::from_bytes(&bytes, num_hash_functions)?
            }
            Some(bytes) => {
                warn!(
                    stored = bytes.len(),
                    configured = config.capacity_bytes,
                    "Stored shared filter has a different capacity, starting fresh"
                );
                let fresh = BloomFilter::new(config.capacity_bytes, num_hash_functions)?;
                store.save_filter(&config.filter_slot, &fresh.to_bytes())?;
                fresh
            }
            None => {
                let fresh = BloomFilter::new(config.capacity_bytes, num_hash_functions)?;
                store.save_filter(&config.filter_slot, &fresh.to_bytes())?;
                debug!(slot = %config.filter_slot, "Initialized shared filter");
                fresh
            }
        };

        let received = store.list_received()?.into_iter().collect();

        Ok(Self {
            config,
            num_hash_functions,
            store,
            shared,
            received,
            received_filters: 0,
            last_cleanup_ms: now_ms,
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn shared_filter(&self) -> &BloomFilter {
        &self.shared
    }

    pub fn shared_filter_bytes(&self) -> Vec<u8> {
        self.shared.to_bytes()
    }

    /// Received identifiers still inside the expiry window
    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn received_filters(&self) -> u64 {
        self.received_filters
    }

    /// Received-at time of a spending identifier, if we hold it
    pub fn received_at(&self, spending_id: &str) -> Option<i64> {
        self.received.get(spending_id).copied()
    }

    fn empty_filter(&self) -> Result<BloomFilter, LedgerError> {
        Ok(BloomFilter::new(self.config.capacity_bytes, self.num_hash_functions)?)
    }

    fn set_shared(&mut self, filter: BloomFilter) -> Result<(), LedgerError> {
        self.store.save_filter(&self.config.filter_slot, &filter.to_bytes())?;
        self.shared = filter;
        Ok(())
    }

    /// Run the reconciliation ladder, persisting the chosen filter
    pub fn reconcile(&mut self, received: Option<&BloomFilter>) -> Result<Reconciliation, LedgerError> {
        let limit = self.config.expected_items;

        if self.received.len() > limit {
            warn!(
                received = self.received.len(),
                expected_items = limit,
                "Too many received spends to vouch for, not sharing a filter"
            );
            return Ok(Reconciliation {
                filter: None,
                outcome: ReconcileOutcome::CapacityExceeded,
            });
        }

        let mut ours = self.empty_filter()?;
        for spending_id in self.received.keys() {
            ours.put(spending_id);
        }

        let previous = self.shared.union(&ours)?;

        let (chosen, outcome) = match received {
            None => (previous, ReconcileOutcome::OnlyOurs),
            Some(theirs) => {
                let combined = previous.union(theirs)?;
                if combined.estimate_size() <= limit {
                    (combined, ReconcileOutcome::IncludedReceived)
                } else {
                    let reset = ours.union(theirs)?;
                    if reset.estimate_size() <= limit {
                        (reset, ReconcileOutcome::ResetShared)
                    } else if previous.estimate_size() <= limit {
                        (previous, ReconcileOutcome::KeptPrevious)
                    } else {
                        (ours, ReconcileOutcome::OnlyOurs)
                    }
                }
            }
        };

        debug!(
            outcome = %outcome,
            estimate = chosen.estimate_size(),
            received = self.received.len(),
            "Reconciled shared filter"
        );
        self.set_shared(chosen.clone())?;
        Ok(Reconciliation {
            filter: Some(chosen),
            outcome,
        })
    }

    /// Spending identifier already seen, exactly or probably
    pub fn is_seen(&self, spending_id: &str) -> bool {
        self.received.contains_key(spending_id) || self.shared.might_contain(spending_id)
    }

    /// True if any token was already received here or hits the shared filter
    pub fn is_double_spent(&self, tokens: &[Token]) -> bool {
        self.find_double_spent(tokens).is_some()
    }

    /// First token whose spending identifier has been seen
    pub fn find_double_spent<'a>(&self, tokens: &'a [Token]) -> Option<&'a Token> {
        let hit = tokens.iter().find(|t| self.is_seen(t.spending_id().as_str()));
        if let Some(token) = hit {
            let exact = self.received.contains_key(token.spending_id().as_str());
            warn!(token_id = %token.id(), exact, "Double spend detected");
        }
        hit
    }

    /// Record a raw spending identifier as received at `now_ms`
    pub fn record_received(&mut self, spending_id: &str, now_ms: i64) -> Result<(), LedgerError> {
        self.store.save_received(spending_id, now_ms)?;
        self.received.insert(spending_id.to_string(), now_ms);
        Ok(())
    }

    /// Stamp `tokens` as received, remember their identifiers and
    /// refresh the shared filter
    ///
    /// All or nothing: if any identifier cannot be recorded, or the filter
    /// cannot be saved, the identifiers recorded by this call are dropped.
    pub fn add_received_money(&mut self, tokens: &mut [Token], now_ms: i64) -> Result<Reconciliation, LedgerError> {
        let mut recorded = Vec::with_capacity(tokens.len());
        let mut outcome = Ok(());
        for token in tokens.iter_mut() {
            token.set_date_received(now_ms);
            let spending_id = token.spending_id().to_string();
            let fresh = !self.received.contains_key(&spending_id);
            if let Err(e) = self.record_received(&spending_id, now_ms) {
                outcome = Err(e);
                break;
            }
            if fresh {
                recorded.push(spending_id);
            }
        }

        let reconciliation = match outcome.and_then(|()| self.reconcile(None)) {
            Ok(reconciliation) => reconciliation,
            Err(e) => {
                warn!(error = %e, count = recorded.len(), "Could not add received money, rolling back");
                self.forget_received(&recorded);
                return Err(e);
            }
        };
        info!(count = tokens.len(), outcome = %reconciliation.outcome, "Added received money");

        if self.should_cleanup(now_ms) {
            if let Err(e) = self.perform_cleanup(now_ms) {
                warn!(error = %e, "Cleanup after receiving money failed");
            }
        }
        Ok(reconciliation)
    }

    fn forget_received(&mut self, spending_ids: &[String]) {
        for spending_id in spending_ids {
            self.received.remove(spending_id);
            if let Err(e) = self.store.delete_received(spending_id) {
                warn!(spending_id = %spending_id, error = %e, "Failed to drop received spend");
            }
        }
    }

    /// Reconcile a filter broadcast by a peer
    pub fn process_received_filter(&mut self, bytes: &[u8]) -> Result<Reconciliation, LedgerError> {
        if bytes.len() != self.config.capacity_bytes {
            return Err(BloomFilterError::SizeMismatch {
                left: self.config.capacity_bytes * 8,
                right: bytes.len() * 8,
            }
            .into());
        }

        let theirs = BloomFilter::from_bytes(bytes, self.num_hash_functions)?;
        let reconciliation = self.reconcile(Some(&theirs))?;
        self.received_filters += 1;
        info!(
            outcome = %reconciliation.outcome,
            received_filters = self.received_filters,
            "Processed peer filter"
        );
        Ok(reconciliation)
    }

    /// Non-empty and within capacity
    pub fn has_valid_filter_to_share(&self) -> bool {
        self.shared.approximate_count() > 0 && self.shared.estimate_size() <= self.config.expected_items
    }

    pub fn should_cleanup(&self, now_ms: i64) -> bool {
        now_ms - self.last_cleanup_ms > self.config.cleanup_interval_ms()
    }

    /// Drop received identifiers older than the expiry window; when none
    /// remain the shared filter starts over empty
    pub fn perform_cleanup(&mut self, now_ms: i64) -> Result<CleanupReport, LedgerError> {
        let threshold = now_ms - self.config.expiry_window_ms();
        let expired: Vec<String> = self
            .received
            .iter()
            .filter(|(_, received_at)| **received_at < threshold)
            .map(|(id, _)| id.clone())
            .collect();

        for spending_id in &expired {
            self.store.delete_received(spending_id)?;
            self.received.remove(spending_id);
        }

        let filter_reset = self.received.is_empty();
        if filter_reset {
            let fresh = self.empty_filter()?;
            self.set_shared(fresh)?;
        }
        self.last_cleanup_ms = now_ms;

        let report = CleanupReport {
            removed: expired.len(),
            remaining: self.received.len(),
            filter_reset,
        };
        info!(
            removed = report.removed,
            remaining = report.remaining,
            filter_reset,
            "Ledger cleanup completed"
        );
        Ok(report)
    }

    /// Forget every received identifier and empty the shared filter
    pub fn clear_all_data(&mut self) -> Result<(), LedgerError> {
        self.store.clear_received()?;
        self.received.clear();
        let fresh = self.empty_filter()?;
        self.set_shared(fresh)?;
        self.received_filters = 0;
        info!("Ledger data cleared");
        Ok(())
    }

    pub fn statistics(&self, now_ms: i64) -> LedgerStats {
        LedgerStats {
            received_count: self.received.len(),
            shared_filter_estimate: self.shared.estimate_size(),
            shared_filter_set_bits: self.shared.set_bits(),
            capacity_bytes: self.config.capacity_bytes,
            expected_items: self.config.expected_items,
            num_hash_functions: self.num_hash_functions,
            false_positive_rate: self.shared.false_positive_rate(),
            received_filters: self.received_filters,
            last_cleanup_ms: self.last_cleanup_ms,
            since_last_cleanup_ms: now_ms - self.last_cleanup_ms,
        }
    }
}
