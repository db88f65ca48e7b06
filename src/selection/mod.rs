// Selection module - WHICH BILLS TO HAND OVER
// Seeded, reproducible token selection with trie inclusion proofs

mod prp;
mod selector;
mod strategy;

use crate::trie::TrieError;
use thiserror::Error;

pub use prp::TokenPrp;
pub use selector::{DeterministicSelector, SelectionProof, SelectionStats, TokenEntry};
pub use strategy::{MerkleSelection, SeededRandomSelection, SelectionStrategy};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("No unspent tokens available")]
    NoTokens,

    #[error("Insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: i64, requested: i64 },

    #[error("Token amounts overflow")]
    AmountOverflow,

    #[error("Nibble out of range: {0}")]
    InvalidNibble(u8),

    #[error("Trie error: {0}")]
    Trie(#[from] TrieError),
}
