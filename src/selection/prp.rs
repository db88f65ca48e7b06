// Seeded nibble permutation used to order trie groups

use super::SelectionError;
use sha2::{Digest, Sha256};

/// Keyed nibble mapping: `sha256("{seed}:{nibble}")[0] % 16`
///
/// The mapping is not a bijection; [`visit_order`](Self::visit_order)
/// turns it into one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenPrp {
    seed: String,
    table: [u8; 16],
}

impl TokenPrp {
    pub fn new(seed: &str) -> Self {
        let table = std::array::from_fn(|nibble| Self::compute(seed, nibble as u8));
        Self {
            seed: seed.to_string(),
            table,
        }
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }

    /// Permuted value for `nibble` (0..16)
    pub fn apply(&self, nibble: u8) -> Result<u8, SelectionError> {
        self.table
            .get(nibble as usize)
            .copied()
            .ok_or(SelectionError::InvalidNibble(nibble))
    }

    /// Group visiting order: `apply(0)..apply(15)` with repeats skipped,
    /// followed by the nibbles never produced, ascending
    pub fn visit_order(&self) -> Vec<u8> {
        let mut seen = [false; 16];
        let mut order = Vec::with_capacity(16);
        for &nibble in self.table.iter() {
            if !seen[nibble as usize] {
                seen[nibble as usize] = true;
                order.push(nibble);
            }
        }
        order.extend((0..16u8).filter(|n| !seen[*n as usize]));
        order
    }

    fn compute(seed: &str, nibble: u8) -> u8 {
        let digest = Sha256::digest(format!("{}:{}", seed, nibble).as_bytes());
        digest[0] % 16
    }
}
