// offcash - offline peer-to-peer cash
//
// Holders pay merchants hand to hand with issuer-signed tokens. The
// merchant's seed fixes which tokens the holder must hand over, and a
// gossiped Bloom filter of spent tokens flags replays while both sides
// are still offline.

pub mod filter;
pub mod ledger;
pub mod logging;
pub mod selection;
pub mod settlement;
pub mod storage;
pub mod token;
pub mod transfer;
pub mod transport;
pub mod trie;
