// Bloom Filter - fixed-capacity probabilistic membership set
//
// Slots are derived from two JVM-style string hashes combined as
// h1 + i*h2 so that filters exchanged with peers running other
// implementations select the same bits.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Hash function count used when none is configured
pub const DEFAULT_NUM_HASH_FUNCTIONS: u32 = 3;

/// Errors from Bloom filter operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BloomFilterError {
    #[error("Bloom filters must have the same size: {left} bits vs {right} bits")]
    SizeMismatch { left: usize, right: usize },

    #[error("Invalid filter capacity: {0} bytes")]
    InvalidCapacity(usize),

    #[error("Invalid hash function count: {0}")]
    InvalidHashCount(u32),
}

/// Optimal number of hash functions for a target false-positive probability
pub fn optimal_num_hash_functions(fpp: f64) -> u32 {
    let k = (-fpp.ln() / std::f64::consts::LN_2).round();
    if k.is_nan() || k < 1.0 {
        1
    } else {
        k as u32
    }
}

/// Optimal number of bits for `expected_insertions` at the given false-positive probability
pub fn optimal_num_bits(expected_insertions: u64, fpp: f64) -> u64 {
    // Smallest positive subnormal, as the JVM's Double.MIN_VALUE
    let fpp = if fpp == 0.0 { f64::from_bits(1) } else { fpp };
    let ln2 = std::f64::consts::LN_2;
    let bits = -(expected_insertions as f64) * fpp.ln() / (ln2 * ln2);
    if bits.is_sign_negative() {
        0
    } else {
        bits as u64
    }
}

/// Fixed-size Bloom filter over string elements
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_hash_functions: u32,
    approximate_count: usize,
}

impl BloomFilter {
    /// Create an empty filter of `capacity_bytes` bytes (`capacity_bytes * 8` slots)
    pub fn new(capacity_bytes: usize, num_hash_functions: u32) -> Result<Self, BloomFilterError> {
        if capacity_bytes == 0 {
            return Err(BloomFilterError::InvalidCapacity(capacity_bytes));
        }
        if num_hash_functions == 0 {
            return Err(BloomFilterError::InvalidHashCount(num_hash_functions));
        }

        Ok(Self {
            bits: vec![0u8; capacity_bytes],
            num_hash_functions,
            approximate_count: 0,
        })
    }

    /// Rebuild a filter from its wire bytes
    ///
    /// The optimistic counter is seeded from the cardinality estimate since
    /// the insertion history is not transmitted.
    pub fn from_bytes(bytes: &[u8], num_hash_functions: u32) -> Result<Self, BloomFilterError> {
        let mut filter = Self::new(bytes.len(), num_hash_functions)?;
        filter.bits.copy_from_slice(bytes);
        filter.approximate_count = filter.estimate_size();
        Ok(filter)
    }

    /// Serialize for transmission: byte `i` holds slots `8i..8i+7`, LSB first
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.clone()
    }

    /// Insert an element, returning whether any bit flipped
    pub fn put(&mut self, element: &str) -> bool {
        let mut changed = false;
        for index in self.slot_indices(element) {
            if !self.get_bit(index) {
                self.set_bit(index);
                changed = true;
            }
        }

        if changed {
            self.approximate_count += 1;
        }
        changed
    }

    /// True if every slot for `element` is set. Never a false negative.
    pub fn might_contain(&self, element: &str) -> bool {
        self.slot_indices(element).into_iter().all(|index| self.get_bit(index))
    }

    /// Bitwise OR `other` into this filter
    pub fn merge(&mut self, other: &BloomFilter) -> Result<(), BloomFilterError> {
        if other.bit_size() != self.bit_size() {
            return Err(BloomFilterError::SizeMismatch {
                left: self.bit_size(),
                right: other.bit_size(),
            });
        }

        for (mine, theirs) in self.bits.iter_mut().zip(other.bits.iter()) {
            *mine |= *theirs;
        }
        self.approximate_count = self.estimate_size();
        Ok(())
    }

    /// Copy-then-merge, leaving both inputs untouched
    pub fn union(&self, other: &BloomFilter) -> Result<BloomFilter, BloomFilterError> {
        let mut combined = self.clone();
        combined.merge(other)?;
        Ok(combined)
    }

    /// Cardinality estimate: -ln(1 - s/m) * m / k
    pub fn estimate_size(&self) -> usize {
        let m = self.bit_size() as f64;
        let s = self.set_bits() as f64;
        let k = self.num_hash_functions as f64;

        if s == 0.0 {
            return 0;
        }
        if s == m {
            return usize::MAX;
        }

        let estimate = -(1.0 - s / m).ln() * m / k;
        estimate as usize
    }

    /// Probability that an absent element is reported present: (s/m)^k
    pub fn false_positive_rate(&self) -> f64 {
        let ratio = self.set_bits() as f64 / self.bit_size() as f64;
        ratio.powi(self.num_hash_functions as i32)
    }

    /// Fast counter bumped on every insertion that flipped at least one bit
    pub fn approximate_count(&self) -> usize {
        self.approximate_count
    }

    pub fn num_hash_functions(&self) -> u32 {
        self.num_hash_functions
    }

    pub fn bit_size(&self) -> usize {
        self.bits.len() * 8
    }

    pub fn capacity_bytes(&self) -> usize {
        self.bits.len()
    }

    /// Number of slots currently set
    pub fn set_bits(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    fn get_bit(&self, index: usize) -> bool {
        self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    fn set_bit(&mut self, index: usize) {
        self.bits[index / 8] |= 1 << (index % 8);
    }

    fn slot_indices(&self, element: &str) -> Vec<usize> {
        let h1 = jvm_string_hash(element.encode_utf16());
        let h2 = reversed_hash(element);
        let m = self.bit_size() as u64;

        (0..self.num_hash_functions)
            .map(|i| {
                let combined = h1.wrapping_add((i as i32).wrapping_mul(h2));
                (combined.unsigned_abs() as u64 % m) as usize
            })
            .collect()
    }
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bit_size", &self.bit_size())
            .field("num_hash_functions", &self.num_hash_functions)
            .field("set_bits", &self.set_bits())
            .field("approximate_count", &self.approximate_count)
            .finish()
    }
}

/// Hash of `element` reversed character by character; surrogate pairs
/// stay in order
fn reversed_hash(element: &str) -> i32 {
    let reversed: String = element.chars().rev().collect();
    jvm_string_hash(reversed.encode_utf16())
}

/// `String.hashCode()` over UTF-16 code units with 32-bit wrapping
fn jvm_string_hash(units: impl Iterator<Item = u16>) -> i32 {
    units.fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32))
}
