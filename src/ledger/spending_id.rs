// Spending identifiers for different money representations
//
// The ledger only sees opaque strings. These constructors pin down how
// UTXO-, account- and bill-style money map onto them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifier of a single spend event
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpendingIdentifier(String);

impl SpendingIdentifier {
    /// A UTXO is spent exactly once, so its id is the identifier
    pub fn for_utxo(tx_id: &str) -> Self {
        Self(tx_id.to_string())
    }

    /// hex(SHA-256("account||nonce"))
    pub fn for_account(account_id: &str, nonce: i64) -> Self {
        Self::hashed(&format!("{}||{}", account_id, nonce))
    }

    /// hex(SHA-256("bill||owner")), or chained from the previous spend
    pub fn for_bill(bill_id: &str, owner: &str, previous: Option<&SpendingIdentifier>) -> Self {
        match previous {
            Some(previous) => Self::hashed(&format!("{}||{}", previous.0, owner)),
            None => Self::hashed(&format!("{}||{}", bill_id, owner)),
        }
    }

    fn hashed(input: &str) -> Self {
        Self(hex::encode(Sha256::digest(input.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpendingIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SpendingIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
