// Store Tests
// Token, received-spend and filter persistence for both store backends

use offcash::storage::{
    restore_tokens, snapshot_tokens, MemoryTokenStore, SledTokenStore, StoreError, TokenStore,
};
use offcash::token::Token;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

fn token(id: &str, amount: i64) -> Token {
    Token::new(id.to_string(), amount, vec![0xAB; 8], 1)
}

fn backends() -> Vec<(&'static str, Box<dyn TokenStore>)> {
    vec![
        ("memory", Box::new(MemoryTokenStore::new())),
        ("sled", Box::new(SledTokenStore::temporary().unwrap())),
    ]
}

// ============================================================================
// TOKENS
// ============================================================================

#[test]
fn test_spent_tokens_leave_balance() {
    for (name, store) in backends() {
        store.save_all(&[token("a", 5), token("b", 7), token("c", 10)]).unwrap();
        assert_eq!(store.balance().unwrap(), 22, "{}", name);

        assert!(store.mark_spent("b").unwrap());
        assert!(!store.mark_spent("missing").unwrap());

        assert_eq!(store.balance().unwrap(), 15, "{}", name);
        let spent: Vec<String> = store.list_spent().unwrap().iter().map(|t| t.id().to_string()).collect();
        assert_eq!(spent, vec!["b"], "{}", name);
        assert_eq!(store.list_unspent().unwrap().len(), 2, "{}", name);
    }
}

#[test]
fn test_save_overwrites() {
    for (name, store) in backends() {
        store.save(&token("a", 5)).unwrap();
        let mut updated = token("a", 5);
        updated.mark_spent();
        store.save(&updated).unwrap();

        assert_eq!(store.get("a").unwrap(), Some(updated), "{}", name);
        assert_eq!(store.balance().unwrap(), 0, "{}", name);
    }
}

#[test]
fn test_received_date_and_delete() {
    for (name, store) in backends() {
        store.save(&token("a", 5)).unwrap();
        assert!(store.update_received_date("a", 42).unwrap());
        assert_eq!(store.get("a").unwrap().unwrap().date_received(), Some(42), "{}", name);
        assert!(!store.update_received_date("missing", 42).unwrap());

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert_eq!(store.get("a").unwrap(), None, "{}", name);
    }
}

// ============================================================================
// ALL-OR-NOTHING WRITES
// ============================================================================

/// Memory store whose n-th token write fails
struct FailingWriteStore {
    inner: MemoryTokenStore,
    writes: AtomicUsize,
    fail_on: usize,
}

impl FailingWriteStore {
    fn new(tokens: &[Token], fail_on: usize) -> Self {
        Self {
            inner: MemoryTokenStore::with_tokens(tokens),
            writes: AtomicUsize::new(0),
            fail_on,
        }
    }

    fn count_write(&self) -> Result<(), StoreError> {
        if self.writes.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(StoreError::DatabaseError("disk full".to_string()));
        }
        Ok(())
    }
}

impl TokenStore for FailingWriteStore {
    fn save(&self, token: &Token) -> Result<(), StoreError> {
        self.count_write()?;
        self.inner.save(token)
    }
    fn get(&self, id: &str) -> Result<Option<Token>, StoreError> {
        self.inner.get(id)
    }
    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete(id)
    }
    fn mark_spent(&self, id: &str) -> Result<bool, StoreError> {
        self.count_write()?;
        self.inner.mark_spent(id)
    }
    fn list_unspent(&self) -> Result<Vec<Token>, StoreError> {
        self.inner.list_unspent()
    }
    fn list_spent(&self) -> Result<Vec<Token>, StoreError> {
        self.inner.list_spent()
    }
    fn update_received_date(&self, id: &str, date_received: i64) -> Result<bool, StoreError> {
        self.inner.update_received_date(id, date_received)
    }
    fn save_received(&self, spending_id: &str, received_at: i64) -> Result<(), StoreError> {
        self.inner.save_received(spending_id, received_at)
    }
    fn list_received(&self) -> Result<Vec<(String, i64)>, StoreError> {
        self.inner.list_received()
    }
    fn delete_received(&self, spending_id: &str) -> Result<(), StoreError> {
        self.inner.delete_received(spending_id)
    }
    fn clear_received(&self) -> Result<(), StoreError> {
        self.inner.clear_received()
    }
    fn save_filter(&self, slot: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.inner.save_filter(slot, bytes)
    }
    fn get_filter(&self, slot: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get_filter(slot)
    }
    fn delete_filter(&self, slot: &str) -> Result<(), StoreError> {
        self.inner.delete_filter(slot)
    }
}

#[test]
fn test_save_all_failing_midway_keeps_nothing() {
    let mut existing = token("b", 7);
    existing.mark_spent();
    let store = FailingWriteStore::new(&[existing.clone()], 3);

    let err = store.save_all(&[token("a", 5), token("b", 7), token("c", 10)]).unwrap_err();
    assert!(matches!(err, StoreError::DatabaseError(_)));

    assert_eq!(store.get("a").unwrap(), None);
    assert_eq!(store.get("b").unwrap(), Some(existing));
    assert_eq!(store.get("c").unwrap(), None);
    assert_eq!(store.balance().unwrap(), 0);
}

#[test]
fn test_mark_all_spent_failing_midway_spends_nothing() {
    let store = FailingWriteStore::new(&[token("a", 5), token("b", 7), token("c", 10)], 3);
    let ids: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();

    assert!(store.mark_all_spent(&ids).is_err());
    assert_eq!(store.balance().unwrap(), 22);
    assert!(store.list_spent().unwrap().is_empty());

    // the failure was transient
    store.mark_all_spent(&ids).unwrap();
    assert_eq!(store.balance().unwrap(), 0);
}

#[test]
fn test_snapshot_and_restore() {
    for (name, store) in backends() {
        store.save(&token("a", 5)).unwrap();
        let snapshot = snapshot_tokens(store.as_ref(), ["a", "z"]).unwrap();

        store.mark_spent("a").unwrap();
        store.save(&token("z", 1)).unwrap();
        restore_tokens(store.as_ref(), &snapshot);

        assert!(!store.get("a").unwrap().unwrap().is_spent(), "{}", name);
        assert_eq!(store.get("z").unwrap(), None, "{}", name);
    }
}

// ============================================================================
// RECEIVED SPENDS AND FILTERS
// ============================================================================

#[test]
fn test_received_spends() {
    for (name, store) in backends() {
        store.save_received("x", 10).unwrap();
        store.save_received("y", 20).unwrap();
        store.save_received("x", 30).unwrap();

        let mut received = store.list_received().unwrap();
        received.sort();
        assert_eq!(received, vec![("x".to_string(), 30), ("y".to_string(), 20)], "{}", name);

        store.delete_received("x").unwrap();
        assert_eq!(store.list_received().unwrap().len(), 1, "{}", name);
        store.clear_received().unwrap();
        assert!(store.list_received().unwrap().is_empty(), "{}", name);
    }
}

#[test]
fn test_filter_slots() {
    for (name, store) in backends() {
        store.save_filter("shared", &[1, 2, 3]).unwrap();
        store.save_filter("peer", &[9]).unwrap();
        assert_eq!(store.get_filter("shared").unwrap(), Some(vec![1, 2, 3]), "{}", name);

        store.delete_filter("shared").unwrap();
        assert_eq!(store.get_filter("shared").unwrap(), None, "{}", name);
        assert_eq!(store.get_filter("peer").unwrap(), Some(vec![9]), "{}", name);
    }
}

// ============================================================================
// SLED PERSISTENCE
// ============================================================================

#[test]
fn test_sled_reopen_keeps_everything() {
    let temp_dir = TempDir::new().unwrap();

    {
        let store = SledTokenStore::open(temp_dir.path()).unwrap();
        store.save(&token("a", 5)).unwrap();
        store.mark_spent("a").unwrap();
        store.save(&token("b", 9)).unwrap();
        store.save_received("r", 77).unwrap();
        store.save_filter("shared", &[0xFF; 4]).unwrap();
        store.flush().unwrap();
    }

    let store = SledTokenStore::open(temp_dir.path()).unwrap();
    let stats = store.stats().unwrap();
    assert_eq!(stats.token_count, 2);
    assert_eq!(stats.unspent_count, 1);
    assert_eq!(stats.received_count, 1);
    assert_eq!(stats.filter_count, 1);
    assert_eq!(store.balance().unwrap(), 9);
    assert!(store.get("a").unwrap().unwrap().is_spent());
}

#[test]
fn test_memory_store_preloaded() {
    let store = MemoryTokenStore::with_tokens(&[token("a", 5), token("b", 5)]);
    assert_eq!(store.balance().unwrap(), 10);
}
