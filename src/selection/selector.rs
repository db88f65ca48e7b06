// DeterministicSelector - seeded token selection over a token trie
//
// The holder indexes its unspent tokens in a MerkleTrie keyed by the hex
// of each token id, then walks the keys grouped by nibble in an order
// fixed by the merchant's seed. Tokens are accepted greedily along that
// walk until the target is covered, so the same seed over the same token
// set always yields the same selection.

use super::prp::TokenPrp;
use super::SelectionError;
use crate::token::{checked_total_amount, total_amount, Token, TokenVerifier};
use crate::trie::{hex_key, InclusionProof, MerkleTrie, TrieItem};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

// ============================================================================
// TRIE ITEM
// ============================================================================

/// A token as stored in the selection trie
///
/// The committed value is the canonical signing bytes followed by the
/// issuer signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenEntry(pub Token);

impl TokenEntry {
    pub fn token(&self) -> &Token {
        &self.0
    }
}

impl TrieItem for TokenEntry {
    fn trie_key(&self) -> String {
        hex_key(self.0.id())
    }

    fn trie_value(&self) -> Vec<u8> {
        let mut value = self.0.to_signing_bytes();
        value.extend_from_slice(self.0.issuer_signature());
        value
    }
}

/// Amount committed in a token entry value, given the token id
fn committed_amount(id: &str, value: &[u8]) -> Option<i64> {
    let start = id.len();
    let bytes = value.get(start..start + 8)?;
    if !value.starts_with(id.as_bytes()) {
        return None;
    }
    Some(i64::from_be_bytes(bytes.try_into().ok()?))
}

// ============================================================================
// SELECTION PROOF
// ============================================================================

/// Evidence that a selection was drawn from a committed token set
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionProof {
    pub root_hash: [u8; 32],
    pub selected_ids: Vec<String>,
    pub inclusion_proofs: Vec<InclusionProof>,
    pub total_amount: i64,
}

/// Summary of a selection against the holder's tokens
#[derive(Clone, Debug, PartialEq)]
pub struct SelectionStats {
    pub total_tokens: usize,
    pub selected_tokens: usize,
    pub total_amount: i64,
    pub selected_amount: i64,
    pub selection_ratio: f64,
    pub amount_ratio: f64,
}

impl SelectionStats {
    pub fn new(tokens: &[Token], selected: &[Token]) -> Self {
        let total = total_amount(tokens);
        let chosen = total_amount(selected);
        let ratio = |part: f64, whole: f64| if whole == 0.0 { 0.0 } else { part / whole };
        Self {
            total_tokens: tokens.len(),
            selected_tokens: selected.len(),
            total_amount: total,
            selected_amount: chosen,
            selection_ratio: ratio(selected.len() as f64, tokens.len() as f64),
            amount_ratio: ratio(chosen as f64, total as f64),
        }
    }
}

// ============================================================================
// SELECTOR
// ============================================================================

/// Seeded, reproducible token selection
#[derive(Clone, Debug, Default)]
pub struct DeterministicSelector {
    verifier: Option<TokenVerifier>,
}

impl DeterministicSelector {
    pub fn new() -> Self {
        Self { verifier: None }
    }

    /// Only admit tokens whose issuer signature verifies
    pub fn with_verifier(mut self, verifier: TokenVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Build a trie over the unspent (and, with a verifier, validly
    /// signed) tokens
    pub fn build_trie(&self, tokens: &[Token]) -> Result<MerkleTrie<TokenEntry>, SelectionError> {
        let mut trie = MerkleTrie::new();
        for token in tokens.iter().filter(|t| !t.is_spent()) {
            if let Some(verifier) = &self.verifier {
                if !verifier.verify(token) {
                    debug!(token_id = %token.id(), "Skipping token with invalid issuer signature");
                    continue;
                }
            }
            trie.put(TokenEntry(token.clone()))?;
        }
        Ok(trie)
    }

    /// Keys of `trie` in seeded visiting order
    pub fn ordered_keys(&self, trie: &MerkleTrie<TokenEntry>, seed: &str) -> Vec<String> {
        let order = TokenPrp::new(seed).visit_order();
        let keys = trie.keys();
        order_suffixes(keys.iter().map(String::as_str).collect(), &order)
    }

    /// Walk `trie` in seeded order, accepting tokens until `target` is
    /// reached or the tokens run out
    pub fn choose_from_trie(&self, seed: &str, trie: &MerkleTrie<TokenEntry>, target: i64) -> Vec<Token> {
        let mut selected = Vec::new();
        let mut sum = 0i64;
        if target <= 0 {
            return selected;
        }

        for key in self.ordered_keys(trie, seed) {
            let Some(entry) = trie.get(&key) else { continue };
            if entry.token().is_spent() {
                continue;
            }
            // past i64::MAX the target is covered
            sum = sum.saturating_add(entry.token().amount());
            selected.push(entry.token().clone());
            if sum >= target {
                break;
            }
        }
        selected
    }

    /// Select tokens covering `amount` for the merchant `seed`
    pub fn select(&self, tokens: &[Token], seed: &str, amount: i64) -> Result<Vec<Token>, SelectionError> {
        if amount <= 0 {
            return Ok(Vec::new());
        }

        let trie = self.build_trie(tokens)?;
        if trie.is_empty() {
            return Err(SelectionError::NoTokens);
        }

        let available =
            checked_total_amount(trie.items().iter().map(|e| e.token())).ok_or(SelectionError::AmountOverflow)?;
        if available < amount {
            return Err(SelectionError::InsufficientFunds {
                available,
                requested: amount,
            });
        }

        let selected = self.choose_from_trie(seed, &trie, amount);
        debug!(
            seed = %seed,
            requested = amount,
            selected = selected.len(),
            total = total_amount(&selected),
            "Selected tokens"
        );
        Ok(selected)
    }

    /// Inclusion proofs for `selected` against `trie`
    pub fn generate_token_inclusion_proofs(
        &self,
        trie: &MerkleTrie<TokenEntry>,
        selected: &[Token],
    ) -> Result<Vec<InclusionProof>, SelectionError> {
        selected
            .iter()
            .map(|t| trie.generate_inclusion_proof(&hex_key(t.id())).map_err(Into::into))
            .collect()
    }

    /// Re-run the selection and compare id sets
    pub fn verify_token_selection(&self, seed: &str, original: &[Token], claimed: &[Token], amount: i64) -> bool {
        let Ok(trie) = self.build_trie(original) else {
            return false;
        };
        let reselected = self.choose_from_trie(seed, &trie, amount);

        let expected: HashSet<&str> = reselected.iter().map(Token::id).collect();
        let actual: HashSet<&str> = claimed.iter().map(Token::id).collect();
        expected == actual
    }

    /// Root digest of the trie over `tokens`
    pub fn root_hash(&self, tokens: &[Token]) -> Result<[u8; 32], SelectionError> {
        Ok(self.build_trie(tokens)?.root_hash())
    }

    pub fn generate_selection_proof(&self, all: &[Token], selected: &[Token]) -> Result<SelectionProof, SelectionError> {
        let trie = self.build_trie(all)?;
        Ok(SelectionProof {
            root_hash: trie.root_hash(),
            selected_ids: selected.iter().map(|t| t.id().to_string()).collect(),
            inclusion_proofs: self.generate_token_inclusion_proofs(&trie, selected)?,
            total_amount: total_amount(selected),
        })
    }

    /// Check a selection proof from the merchant side
    ///
    /// Every proof must be a valid inclusion under the root, match the
    /// listed id, and the committed amounts must add up to the claimed
    /// total, which must cover `expected_amount`.
    pub fn verify_selection_proof(&self, proof: &SelectionProof, expected_amount: i64) -> bool {
        if proof.selected_ids.len() != proof.inclusion_proofs.len() {
            return false;
        }

        let mut committed = 0i64;
        for (id, inclusion) in proof.selected_ids.iter().zip(&proof.inclusion_proofs) {
            if !inclusion.is_included || inclusion.key != hex_key(id) || !inclusion.verify(&proof.root_hash) {
                return false;
            }
            match inclusion.value.as_deref().and_then(|v| committed_amount(id, v)) {
                Some(amount) => match committed.checked_add(amount) {
                    Some(sum) => committed = sum,
                    None => return false,
                },
                None => return false,
            }
        }

        committed == proof.total_amount && proof.total_amount >= expected_amount
    }
}

/// Order key suffixes: a key ending here comes first, then one group per
/// leading nibble in `order`, recursing into groups with several keys
fn order_suffixes(suffixes: Vec<&str>, order: &[u8]) -> Vec<String> {
    if suffixes.len() <= 1 {
        return suffixes.into_iter().map(str::to_string).collect();
    }

    let mut ordered = Vec::with_capacity(suffixes.len());
    let mut groups: [Vec<&str>; 16] = std::array::from_fn(|_| Vec::new());
    for suffix in suffixes {
        let mut chars = suffix.chars();
        match chars.next().and_then(|c| c.to_digit(16)) {
            Some(nibble) => groups[nibble as usize].push(suffix),
            None => ordered.push(String::new()),
        }
    }

    for &nibble in order {
        let group = std::mem::take(&mut groups[nibble as usize]);
        match group.len() {
            0 => {}
            1 => ordered.push(group[0].to_string()),
            _ => {
                let head = &group[0][..1];
                let tails = group.iter().map(|k| &k[1..]).collect();
                ordered.extend(order_suffixes(tails, order).into_iter().map(|t| format!("{}{}", head, t)));
            }
        }
    }
    ordered
}
