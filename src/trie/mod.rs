// Trie module - TOKEN COMMITMENT
// Hex-nibble Merkle-Patricia trie with a root digest and inclusion proofs

mod nibble;
mod node;
mod proof;
#[allow(clippy::module_inception)]
mod trie;

use thiserror::Error;

pub use nibble::{hex_key, nibbles_to_string, parse_key};
pub use node::EMPTY_HASH;
pub use proof::{InclusionProof, ProofError};
pub use trie::{same_root, MerkleTrie, StringItem, TrieItem};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrieError {
    #[error("Invalid trie key: {0}")]
    InvalidKey(String),

    /// An empty value at a branch would hash like no value at all
    #[error("Empty value for trie key {0}")]
    EmptyValue(String),
}
