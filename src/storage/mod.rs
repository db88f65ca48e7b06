// Storage module - PERSISTENCE
// Token store trait with sled-backed and in-memory implementations

mod memory;
mod store;

pub use memory::MemoryTokenStore;
pub use store::{restore_tokens, snapshot_tokens, SledTokenStore, StorageStats, StoreError, TokenSnapshot, TokenStore};
