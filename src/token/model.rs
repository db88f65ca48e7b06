use crate::ledger::SpendingIdentifier;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A bill-style cash token issued by an intermediary
///
/// Only `is_spent` and `date_received` change after issuance; they are
/// local bookkeeping and are not covered by the issuer signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    id: String,
    amount: i64,
    issuer_signature: Vec<u8>,
    is_spent: bool,
    date_created: i64,
    date_received: Option<i64>,
}

impl Token {
    /// Create a token from issued parts
    pub fn new(id: String, amount: i64, issuer_signature: Vec<u8>, date_created: i64) -> Self {
        Self {
            id,
            amount,
            issuer_signature,
            is_spent: false,
            date_created,
            date_received: None,
        }
    }

    /// Derive a token ID: hex SHA-256 of "owner:date_created"
    pub fn create_id(owner: &str, date_created: i64) -> String {
        let raw = format!("{}:{}", owner, date_created);
        hex::encode(Sha256::digest(raw.as_bytes()))
    }

    /// Get the token ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the amount in cents
    pub fn amount(&self) -> i64 {
        self.amount
    }

    /// Get the issuer signature (DER)
    pub fn issuer_signature(&self) -> &[u8] {
        &self.issuer_signature
    }

    pub fn is_spent(&self) -> bool {
        self.is_spent
    }

    /// Creation time in Unix milliseconds
    pub fn date_created(&self) -> i64 {
        self.date_created
    }

    /// When the local holder received this token, in Unix milliseconds
    pub fn date_received(&self) -> Option<i64> {
        self.date_received
    }

    /// The spending identifier tracked for double-spend detection
    ///
    /// A token changes hands offline at most once before it settles, so
    /// it is spent like a UTXO and its id serves directly.
    pub fn spending_id(&self) -> SpendingIdentifier {
        SpendingIdentifier::for_utxo(&self.id)
    }

    pub fn mark_spent(&mut self) {
        self.is_spent = true;
    }

    pub fn set_date_received(&mut self, date_received: i64) {
        self.date_received = Some(date_received);
    }

    /// Return a copy with a different amount (signature untouched)
    pub fn with_amount(mut self, amount: i64) -> Self {
        self.amount = amount;
        self
    }

    /// Canonical bytes covered by the issuer signature:
    /// id (UTF-8) || amount (i64 BE) || date_created (i64 BE)
    pub fn signing_bytes(id: &str, amount: i64, date_created: i64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(id.len() + 16);
        bytes.extend_from_slice(id.as_bytes());
        bytes.extend_from_slice(&amount.to_be_bytes());
        bytes.extend_from_slice(&date_created.to_be_bytes());
        bytes
    }

    /// Canonical bytes of this token
    pub fn to_signing_bytes(&self) -> Vec<u8> {
        Self::signing_bytes(&self.id, self.amount, self.date_created)
    }
}

/// Sum of token amounts, saturating at the `i64` bounds
pub fn total_amount(tokens: &[Token]) -> i64 {
    tokens.iter().map(Token::amount).fold(0, i64::saturating_add)
}

/// Sum of token amounts, `None` on overflow
pub fn checked_total_amount<'a>(tokens: impl IntoIterator<Item = &'a Token>) -> Option<i64> {
    tokens.into_iter().try_fold(0i64, |sum, token| sum.checked_add(token.amount()))
}
