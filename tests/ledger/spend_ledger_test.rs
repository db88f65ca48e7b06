// Double-Spend Ledger Tests
// Reconciliation ladder, persistence and expiry of received spends

use offcash::filter::BloomFilter;
use offcash::ledger::{DoubleSpendLedger, LedgerConfig, ReconcileOutcome, SharedLedger, SpendingIdentifier};
use offcash::storage::{MemoryTokenStore, SledTokenStore, TokenStore};
use offcash::token::{IssuerKeypair, Token, TokenSigner};
use std::sync::Arc;
use tempfile::TempDir;

const HOUR_MS: i64 = 60 * 60 * 1000;

fn memory_ledger(config: LedgerConfig) -> DoubleSpendLedger {
    DoubleSpendLedger::open(config, Arc::new(MemoryTokenStore::new()), 0).unwrap()
}

fn peer_filter(config: &LedgerConfig, prefix: &str, n: usize) -> BloomFilter {
    let mut filter = BloomFilter::new(config.capacity_bytes, config.num_hash_functions()).unwrap();
    for i in 0..n {
        filter.put(&Token::create_id(prefix, i as i64));
    }
    filter
}

// ============================================================================
// RECONCILIATION LADDER
// ============================================================================

#[test]
fn test_no_peer_filter_shares_only_ours() {
    let mut ledger = memory_ledger(LedgerConfig::default());
    ledger.record_received("spend-a", 10).unwrap();

    let result = ledger.reconcile(None).unwrap();
    assert_eq!(result.outcome, ReconcileOutcome::OnlyOurs);
    let filter = result.filter.unwrap();
    assert!(filter.might_contain("spend-a"));
    assert_eq!(ledger.shared_filter(), &filter);
}

#[test]
fn test_small_peer_filter_is_included() {
    let config = LedgerConfig::default();
    let mut ledger = memory_ledger(config.clone());
    ledger.record_received("spend-a", 10).unwrap();

    let theirs = peer_filter(&config, "peer", 10);
    let result = ledger.process_received_filter(&theirs.to_bytes()).unwrap();

    assert_eq!(result.outcome, ReconcileOutcome::IncludedReceived);
    assert!(ledger.is_seen("spend-a"));
    assert!(ledger.is_seen(&Token::create_id("peer", 3)));
    assert_eq!(ledger.received_filters(), 1);
}

#[test]
fn test_overfull_history_resets_shared() {
    let config = LedgerConfig::default().with_expected_items(30);
    let mut ledger = memory_ledger(config.clone());

    let first = peer_filter(&config, "first", 20);
    assert_eq!(
        ledger.process_received_filter(&first.to_bytes()).unwrap().outcome,
        ReconcileOutcome::IncludedReceived
    );

    let second = peer_filter(&config, "second", 20);
    let result = ledger.process_received_filter(&second.to_bytes()).unwrap();
    assert_eq!(result.outcome, ReconcileOutcome::ResetShared);
    assert!(ledger.is_seen(&Token::create_id("second", 0)));
    assert_eq!(ledger.received_filters(), 2);
}

#[test]
fn test_oversized_peer_filter_keeps_previous() {
    let config = LedgerConfig::default().with_expected_items(30);
    let mut ledger = memory_ledger(config.clone());
    for i in 0..5 {
        ledger.record_received(&format!("mine-{}", i), 10).unwrap();
    }
    let before = ledger.reconcile(None).unwrap().filter.unwrap();

    let theirs = peer_filter(&config, "crowd", 60);
    let result = ledger.process_received_filter(&theirs.to_bytes()).unwrap();

    assert_eq!(result.outcome, ReconcileOutcome::KeptPrevious);
    assert_eq!(result.filter.unwrap(), before);
}

#[test]
fn test_too_many_receipts_share_nothing() {
    let mut ledger = memory_ledger(LedgerConfig::default().with_expected_items(2));
    for id in ["a", "b", "c"] {
        ledger.record_received(id, 10).unwrap();
    }

    let result = ledger.reconcile(None).unwrap();
    assert_eq!(result.outcome, ReconcileOutcome::CapacityExceeded);
    assert!(result.filter.is_none());
    // exact receipts still catch replays
    assert!(ledger.is_seen("c"));
}

#[test]
fn test_filter_to_share_requires_content() {
    let mut ledger = memory_ledger(LedgerConfig::default());
    assert!(!ledger.has_valid_filter_to_share());

    for id in ["spend-a", "spend-b", "spend-c"] {
        ledger.record_received(id, 10).unwrap();
    }
    ledger.reconcile(None).unwrap();
    assert!(ledger.has_valid_filter_to_share());
}

// ============================================================================
// DOUBLE-SPEND DETECTION
// ============================================================================

#[test]
fn test_received_money_is_detected_again() {
    let signer = TokenSigner::new(IssuerKeypair::generate());
    let mut ledger = memory_ledger(LedgerConfig::default());

    let mut paid = vec![signer.issue("alice", 5, 1), signer.issue("alice", 5, 2)];
    assert!(!ledger.is_double_spent(&paid));

    ledger.add_received_money(&mut paid, 500).unwrap();
    assert!(paid.iter().all(|t| t.date_received() == Some(500)));

    let replay = vec![signer.issue("bob", 1, 9), signer.issue("alice", 5, 2)];
    let hit = ledger.find_double_spent(&replay).unwrap();
    assert_eq!(hit.id(), replay[1].id());
}

#[test]
fn test_account_and_bill_spends_share_the_ledger() {
    let mut ledger = memory_ledger(LedgerConfig::default());
    let first = SpendingIdentifier::for_account("acct-1", 1);
    let bill = SpendingIdentifier::for_bill("bill-9", "alice", None);
    ledger.record_received(first.as_str(), 10).unwrap();
    ledger.record_received(bill.as_str(), 10).unwrap();

    assert!(ledger.is_seen(first.as_str()));
    assert!(ledger.is_seen(bill.as_str()));
    // a new nonce or a new owner is a new spend
    assert_eq!(ledger.received_at(SpendingIdentifier::for_account("acct-1", 2).as_str()), None);
    let passed_on = SpendingIdentifier::for_bill("bill-9", "bob", Some(&bill));
    assert_eq!(ledger.received_at(passed_on.as_str()), None);
    assert_eq!(ledger.received_at(bill.as_str()), Some(10));
}

// ============================================================================
// PERSISTENCE
// ============================================================================

#[test]
fn test_state_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let id = Token::create_id("alice", 1);

    {
        let store = Arc::new(SledTokenStore::open(temp_dir.path()).unwrap());
        let mut ledger = DoubleSpendLedger::open(LedgerConfig::default(), store.clone(), 0).unwrap();
        ledger.record_received(&id, 100).unwrap();
        ledger.reconcile(None).unwrap();
        store.flush().unwrap();
    }

    let store: Arc<dyn TokenStore> = Arc::new(SledTokenStore::open(temp_dir.path()).unwrap());
    let ledger = DoubleSpendLedger::open(LedgerConfig::default(), store, 0).unwrap();
    assert_eq!(ledger.received_count(), 1);
    assert_eq!(ledger.received_at(&id), Some(100));
    assert!(ledger.shared_filter().might_contain(&id));
}

#[test]
fn test_stored_filter_of_other_size_is_replaced() {
    let store = Arc::new(MemoryTokenStore::new());
    store.save_filter("shared", &[0xFF; 16]).unwrap();

    let ledger = DoubleSpendLedger::open(LedgerConfig::default(), store.clone(), 0).unwrap();
    assert!(ledger.shared_filter().is_empty());
    assert_eq!(store.get_filter("shared").unwrap().map(|b| b.len()), Some(240));
}

// ============================================================================
// EXPIRY
// ============================================================================

#[test]
fn test_cleanup_of_everything_resets_filter() {
    let mut ledger = memory_ledger(LedgerConfig::default().with_expiry_window(60));
    ledger.record_received("old", 0).unwrap();
    ledger.reconcile(None).unwrap();
    assert!(ledger.is_seen("old"));

    let report = ledger.perform_cleanup(HOUR_MS).unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.remaining, 0);
    assert!(report.filter_reset);
    assert!(!ledger.is_seen("old"));
    assert!(ledger.shared_filter().is_empty());
}

#[test]
fn test_cleanup_due_after_interval() {
    let ledger = memory_ledger(LedgerConfig::default().with_cleanup_interval(60));
    assert!(!ledger.should_cleanup(60 * 1000));
    assert!(ledger.should_cleanup(60 * 1000 + 1));
}

#[test]
fn test_clear_all_data() {
    let mut ledger = memory_ledger(LedgerConfig::default());
    ledger.record_received("a", 1).unwrap();
    ledger.reconcile(None).unwrap();

    ledger.clear_all_data().unwrap();
    assert_eq!(ledger.received_count(), 0);
    assert!(!ledger.is_seen("a"));

    let stats = ledger.statistics(10);
    assert_eq!(stats.received_count, 0);
    assert_eq!(stats.shared_filter_set_bits, 0);
    assert_eq!(stats.since_last_cleanup_ms, 10);
}

#[tokio::test]
async fn test_shared_ledger_cleanup_now() {
    let config = LedgerConfig::default().with_expiry_window(1);
    let ledger = DoubleSpendLedger::open(config, Arc::new(MemoryTokenStore::new()), 0).unwrap();
    let shared = SharedLedger::new(ledger);
    shared.lock().await.record_received("stale", 0).unwrap();

    let report = shared.cleanup_now().await.unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(shared.lock().await.received_count(), 0);
}

#[tokio::test]
async fn test_periodic_sweep_drops_only_expired() {
    let store = Arc::new(MemoryTokenStore::new());
    let config = LedgerConfig::default().with_expiry_window(HOUR_MS as u64 / 1000);
    let ledger = DoubleSpendLedger::open(config, store.clone(), 0).unwrap();
    let shared = SharedLedger::new(ledger);
    {
        let mut ledger = shared.lock().await;
        ledger.record_received("stale", 0).unwrap();
        ledger.record_received("fresh", offcash::ledger::now_millis()).unwrap();
    }

    let sweeper = shared.spawn_cleanup_task(std::time::Duration::from_millis(10));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    sweeper.abort();

    let ledger = shared.lock().await;
    assert_eq!(ledger.received_count(), 1);
    assert!(ledger.is_seen("fresh"));
    let persisted: Vec<String> = store.list_received().unwrap().into_iter().map(|(id, _)| id).collect();
    assert_eq!(persisted, vec!["fresh".to_string()]);
}
