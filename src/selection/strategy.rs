// Selection strategies
//
// MerkleSelection is the seeded trie walk. SeededRandomSelection shuffles
// with an RNG keyed by the seed and is kept as a baseline for comparison.

use super::selector::DeterministicSelector;
use super::SelectionError;
use crate::token::{checked_total_amount, Token};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};

/// Picks tokens covering an amount for a merchant seed
pub trait SelectionStrategy: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    fn select(&self, tokens: &[Token], seed: &str, amount: i64) -> Result<Vec<Token>, SelectionError>;
}

/// Trie walk in seeded nibble order
#[derive(Clone, Debug, Default)]
pub struct MerkleSelection {
    selector: DeterministicSelector,
}

impl MerkleSelection {
    pub fn new(selector: DeterministicSelector) -> Self {
        Self { selector }
    }

    pub fn selector(&self) -> &DeterministicSelector {
        &self.selector
    }
}

impl SelectionStrategy for MerkleSelection {
    fn name(&self) -> &'static str {
        "merkle"
    }

    fn select(&self, tokens: &[Token], seed: &str, amount: i64) -> Result<Vec<Token>, SelectionError> {
        self.selector.select(tokens, seed, amount)
    }
}

/// Greedy pick over a seeded shuffle of the unspent tokens
#[derive(Clone, Copy, Debug, Default)]
pub struct SeededRandomSelection;

impl SeededRandomSelection {
    fn rng_for(seed: &str) -> StdRng {
        StdRng::from_seed(Sha256::digest(seed.as_bytes()).into())
    }
}

impl SelectionStrategy for SeededRandomSelection {
    fn name(&self) -> &'static str {
        "seeded-random"
    }

    fn select(&self, tokens: &[Token], seed: &str, amount: i64) -> Result<Vec<Token>, SelectionError> {
        if amount <= 0 {
            return Ok(Vec::new());
        }

        let mut unspent: Vec<&Token> = tokens.iter().filter(|t| !t.is_spent()).collect();
        if unspent.is_empty() {
            return Err(SelectionError::NoTokens);
        }
        let available = checked_total_amount(unspent.iter().copied()).ok_or(SelectionError::AmountOverflow)?;
        if available < amount {
            return Err(SelectionError::InsufficientFunds {
                available,
                requested: amount,
            });
        }

        // sort first so the shuffle only depends on the token set
        unspent.sort_by(|a, b| a.id().cmp(b.id()));
        unspent.shuffle(&mut Self::rng_for(seed));

        let mut selected = Vec::new();
        let mut sum = 0i64;
        for token in unspent {
            sum = sum.saturating_add(token.amount());
            selected.push(token.clone());
            if sum >= amount {
                break;
            }
        }
        Ok(selected)
    }
}
