// In-memory TokenStore for tests and ephemeral wallets

use super::store::{StoreError, TokenStore};
use crate::token::Token;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    tokens: BTreeMap<String, Token>,
    received: BTreeMap<String, i64>,
    filters: BTreeMap<String, Vec<u8>>,
}

/// Volatile store with the same semantics as the sled one
#[derive(Default)]
pub struct MemoryTokenStore {
    inner: Mutex<Inner>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-loaded with `tokens`
    pub fn with_tokens(tokens: &[Token]) -> Self {
        let store = Self::new();
        if let Ok(mut inner) = store.inner.lock() {
            for token in tokens {
                inner.tokens.insert(token.id().to_string(), token.clone());
            }
        }
        store
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::DatabaseError("store lock poisoned".to_string()))
    }
}

impl TokenStore for MemoryTokenStore {
    fn save(&self, token: &Token) -> Result<(), StoreError> {
        self.lock()?.tokens.insert(token.id().to_string(), token.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Token>, StoreError> {
        Ok(self.lock()?.tokens.get(id).cloned())
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.tokens.remove(id).is_some())
    }

    fn mark_spent(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.tokens.get_mut(id).map(Token::mark_spent).is_some())
    }

    fn list_unspent(&self) -> Result<Vec<Token>, StoreError> {
        Ok(self.lock()?.tokens.values().filter(|t| !t.is_spent()).cloned().collect())
    }

    fn list_spent(&self) -> Result<Vec<Token>, StoreError> {
        Ok(self.lock()?.tokens.values().filter(|t| t.is_spent()).cloned().collect())
    }

    fn update_received_date(&self, id: &str, date_received: i64) -> Result<bool, StoreError> {
        Ok(self
            .lock()?
            .tokens
            .get_mut(id)
            .map(|t| t.set_date_received(date_received))
            .is_some())
    }

    fn save_received(&self, spending_id: &str, received_at: i64) -> Result<(), StoreError> {
        self.lock()?.received.insert(spending_id.to_string(), received_at);
        Ok(())
    }

    fn list_received(&self) -> Result<Vec<(String, i64)>, StoreError> {
        Ok(self.lock()?.received.iter().map(|(k, v)| (k.clone(), *v)).collect())
    }

    fn delete_received(&self, spending_id: &str) -> Result<(), StoreError> {
        self.lock()?.received.remove(spending_id);
        Ok(())
    }

    fn clear_received(&self) -> Result<(), StoreError> {
        self.lock()?.received.clear();
        Ok(())
    }

    fn save_filter(&self, slot: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.lock()?.filters.insert(slot.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get_filter(&self, slot: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock()?.filters.get(slot).cloned())
    }

    fn delete_filter(&self, slot: &str) -> Result<(), StoreError> {
        self.lock()?.filters.remove(slot);
        Ok(())
    }
}
