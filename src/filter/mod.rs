// Filter module - SEEN SPENDS
// Space-bounded, mergeable probabilistic set of spending identifiers

mod bloom;

pub use bloom::{
    optimal_num_bits, optimal_num_hash_functions, BloomFilter, BloomFilterError,
    DEFAULT_NUM_HASH_FUNCTIONS,
};
