// TokenStore - persistence for tokens, received spends and shared filters
//
// Three collections:
// - tokens:   token id -> postcard-encoded Token
// - received: spending identifier -> received-at (Unix millis, i64 BE)
// - filters:  slot name -> raw Bloom filter bytes

use crate::token::{total_amount, Token};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Sled tree names
mod trees {
    pub const TOKENS: &str = "tokens";
    pub const RECEIVED: &str = "received";
    pub const FILTERS: &str = "filters";
}

/// Errors from storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    OpenFailed(String),

    #[error("Database operation failed: {0}")]
    DatabaseError(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Flush failed: {0}")]
    FlushFailed(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::DatabaseError(err.to_string())
    }
}

/// Statistics about the storage
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub token_count: usize,
    pub unspent_count: usize,
    pub received_count: usize,
    pub filter_count: usize,
}

/// Token and ledger persistence used by the transfer protocol
///
/// Mutating calls that target a missing token return `Ok(false)`.
pub trait TokenStore: Send + Sync {
    // tokens
    fn save(&self, token: &Token) -> Result<(), StoreError>;
    fn get(&self, id: &str) -> Result<Option<Token>, StoreError>;
    fn delete(&self, id: &str) -> Result<bool, StoreError>;
    fn mark_spent(&self, id: &str) -> Result<bool, StoreError>;
    fn list_unspent(&self) -> Result<Vec<Token>, StoreError>;
    fn list_spent(&self) -> Result<Vec<Token>, StoreError>;
    fn update_received_date(&self, id: &str, date_received: i64) -> Result<bool, StoreError>;

    // received spending identifiers
    fn save_received(&self, spending_id: &str, received_at: i64) -> Result<(), StoreError>;
    fn list_received(&self) -> Result<Vec<(String, i64)>, StoreError>;
    fn delete_received(&self, spending_id: &str) -> Result<(), StoreError>;
    fn clear_received(&self) -> Result<(), StoreError>;

    // shared filters, keyed by slot
    fn save_filter(&self, slot: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn get_filter(&self, slot: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn delete_filter(&self, slot: &str) -> Result<(), StoreError>;

    /// Save every token or none of them
    fn save_all(&self, tokens: &[Token]) -> Result<(), StoreError> {
        write_each(self, tokens.iter().map(|t| t.id()), |i, _| self.save(&tokens[i]))
    }

    /// Mark every listed token spent or none of them
    fn mark_all_spent(&self, ids: &[String]) -> Result<(), StoreError> {
        write_each(self, ids.iter().map(String::as_str), |_, id| self.mark_spent(id).map(|_| ()))
    }

    /// Sum of unspent amounts
    fn balance(&self) -> Result<i64, StoreError> {
        Ok(total_amount(&self.list_unspent()?))
    }
}

/// Stored state of each token id, `None` where absent
pub type TokenSnapshot = Vec<(String, Option<Token>)>;

/// Capture the current state of `ids` so it can be put back later
pub fn snapshot_tokens<'a, S>(store: &S, ids: impl IntoIterator<Item = &'a str>) -> Result<TokenSnapshot, StoreError>
where
    S: TokenStore + ?Sized,
{
    ids.into_iter()
        .map(|id| Ok((id.to_string(), store.get(id)?)))
        .collect()
}

/// Put tokens back as captured, newest first. Best effort.
pub fn restore_tokens<S>(store: &S, snapshot: &[(String, Option<Token>)])
where
    S: TokenStore + ?Sized,
{
    for (id, before) in snapshot.iter().rev() {
        let restored = match before {
            Some(token) => store.save(token),
            None => store.delete(id).map(|_| ()),
        };
        if let Err(e) = restored {
            warn!(token_id = %id, error = %e, "Failed to restore token");
        }
    }
}

/// Apply `write` to each id in turn; if one fails, restore every token
/// touched so far
fn write_each<'a, S, F>(store: &S, ids: impl IntoIterator<Item = &'a str>, mut write: F) -> Result<(), StoreError>
where
    S: TokenStore + ?Sized,
    F: FnMut(usize, &str) -> Result<(), StoreError>,
{
    let mut touched = TokenSnapshot::new();
    for (index, id) in ids.into_iter().enumerate() {
        let step = store.get(id).and_then(|before| {
            touched.push((id.to_string(), before));
            write(index, id)
        });
        if let Err(e) = step {
            restore_tokens(store, &touched);
            return Err(e);
        }
    }
    Ok(())
}

fn encode_token(token: &Token) -> Result<Vec<u8>, StoreError> {
    postcard::to_allocvec(token).map_err(|e| StoreError::SerializationFailed(e.to_string()))
}

fn decode_token(bytes: &[u8]) -> Result<Token, StoreError> {
    postcard::from_bytes(bytes).map_err(|e| StoreError::DeserializationFailed(e.to_string()))
}

fn decode_timestamp(bytes: &[u8]) -> Result<i64, StoreError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::DeserializationFailed("Invalid timestamp length".to_string()))?;
    Ok(i64::from_be_bytes(raw))
}

fn decode_key(bytes: &[u8]) -> Result<String, StoreError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| StoreError::DeserializationFailed(e.to_string()))
}

/// Persistent token store using sled
///
/// Crash-safe and embedded; writes are durable after [`flush`](Self::flush).
pub struct SledTokenStore {
    db: sled::Db,
    tokens: sled::Tree,
    received: sled::Tree,
    filters: sled::Tree,
}

impl SledTokenStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        Self::from_db(db)
    }

    /// Throwaway store that is removed when dropped
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            tokens: db.open_tree(trees::TOKENS)?,
            received: db.open_tree(trees::RECEIVED)?,
            filters: db.open_tree(trees::FILTERS)?,
            db,
        })
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::FlushFailed(e.to_string()))?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StorageStats, StoreError> {
        Ok(StorageStats {
            token_count: self.tokens.len(),
            unspent_count: self.list_unspent()?.len(),
            received_count: self.received.len(),
            filter_count: self.filters.len(),
        })
    }

    fn all_tokens(&self) -> Result<Vec<Token>, StoreError> {
        let mut tokens = Vec::new();
        for result in self.tokens.iter() {
            let (_, value) = result?;
            tokens.push(decode_token(&value)?);
        }
        Ok(tokens)
    }

    /// Read-modify-write a stored token
    fn update_token<F>(&self, id: &str, update: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut Token),
    {
        let Some(bytes) = self.tokens.get(id.as_bytes())? else {
            return Ok(false);
        };
        let mut token = decode_token(&bytes)?;
        update(&mut token);
        self.tokens.insert(id.as_bytes(), encode_token(&token)?)?;
        Ok(true)
    }
}

impl TokenStore for SledTokenStore {
    fn save(&self, token: &Token) -> Result<(), StoreError> {
        self.tokens.insert(token.id().as_bytes(), encode_token(token)?)?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Token>, StoreError> {
        self.tokens
            .get(id.as_bytes())?
            .map(|bytes| decode_token(&bytes))
            .transpose()
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.tokens.remove(id.as_bytes())?.is_some())
    }

    fn mark_spent(&self, id: &str) -> Result<bool, StoreError> {
        self.update_token(id, Token::mark_spent)
    }

    fn list_unspent(&self) -> Result<Vec<Token>, StoreError> {
        Ok(self.all_tokens()?.into_iter().filter(|t| !t.is_spent()).collect())
    }

    fn list_spent(&self) -> Result<Vec<Token>, StoreError> {
        Ok(self.all_tokens()?.into_iter().filter(Token::is_spent).collect())
    }

    fn update_received_date(&self, id: &str, date_received: i64) -> Result<bool, StoreError> {
        self.update_token(id, |token| token.set_date_received(date_received))
    }

    fn save_received(&self, spending_id: &str, received_at: i64) -> Result<(), StoreError> {
        self.received
            .insert(spending_id.as_bytes(), &received_at.to_be_bytes()[..])?;
        Ok(())
    }

    fn list_received(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let mut received = Vec::new();
        for result in self.received.iter() {
            let (key, value) = result?;
            received.push((decode_key(&key)?, decode_timestamp(&value)?));
        }
        Ok(received)
    }

    fn delete_received(&self, spending_id: &str) -> Result<(), StoreError> {
        self.received.remove(spending_id.as_bytes())?;
        Ok(())
    }

    fn clear_received(&self) -> Result<(), StoreError> {
        self.received.clear()?;
        Ok(())
    }

    fn save_filter(&self, slot: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.filters.insert(slot.as_bytes(), bytes)?;
        Ok(())
    }

    fn get_filter(&self, slot: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.filters.get(slot.as_bytes())?.map(|v| v.to_vec()))
    }

    fn delete_filter(&self, slot: &str) -> Result<(), StoreError> {
        self.filters.remove(slot.as_bytes())?;
        Ok(())
    }
}
