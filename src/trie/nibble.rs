// Nibble paths: one lowercase hex character per trie level

use super::TrieError;

/// Parse a hex key into its nibble path
pub fn parse_key(key: &str) -> Result<Vec<u8>, TrieError> {
    key.chars()
        .map(|c| match c {
            '0'..='9' => Ok(c as u8 - b'0'),
            'a'..='f' => Ok(c as u8 - b'a' + 10),
            _ => Err(TrieError::InvalidKey(format!(
                "invalid hex character {:?} in {:?}",
                c, key
            ))),
        })
        .collect()
}

/// Render a nibble path back to its hex characters
pub fn nibbles_to_string(nibbles: &[u8]) -> String {
    nibbles.iter().map(|n| nibble_char(*n)).collect()
}

/// Hex character for a nibble value (0..16)
pub fn nibble_char(nibble: u8) -> char {
    char::from_digit(nibble as u32, 16).unwrap_or('0')
}

pub(crate) fn nibbles_to_bytes(nibbles: &[u8]) -> Vec<u8> {
    nibbles.iter().map(|n| nibble_char(*n) as u8).collect()
}

pub(crate) fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Lowercase hex of the UTF-8 bytes of `input`, usable as a trie key
pub fn hex_key(input: &str) -> String {
    hex::encode(input.as_bytes())
}
