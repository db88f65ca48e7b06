// Trie nodes with cached content digests
//
// Hashes (SHA-256):
// - leaf:      "leaf"      || path || value
// - extension: "extension" || path || child hash
// - branch:    "branch"    || 16 x (child hash or 32 zero bytes) || value
// Paths are hashed and serialized as their hex characters.

use super::nibble::nibbles_to_bytes;
use sha2::{Digest, Sha256};

/// Digest of an absent child / empty trie
pub const EMPTY_HASH: [u8; 32] = [0u8; 32];

pub(crate) const LEAF_TAG: u8 = 0;
pub(crate) const EXTENSION_TAG: u8 = 1;
pub(crate) const BRANCH_TAG: u8 = 2;

pub(crate) type Children = [Option<Box<Node>>; 16];

#[derive(Clone, Debug)]
pub(crate) enum NodeKind {
    Leaf {
        path: Vec<u8>,
        value: Vec<u8>,
    },
    Extension {
        path: Vec<u8>,
        child: Box<Node>,
    },
    Branch {
        children: Children,
        value: Option<Vec<u8>>,
    },
}

/// A trie node; its digest is fixed at construction, so any change below
/// it forces the path to be rebuilt
#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub(crate) kind: NodeKind,
    hash: [u8; 32],
}

impl Node {
    pub(crate) fn leaf(path: Vec<u8>, value: Vec<u8>) -> Box<Node> {
        let hash = leaf_hash(&path, &value);
        Box::new(Node {
            kind: NodeKind::Leaf { path, value },
            hash,
        })
    }

    pub(crate) fn extension(path: Vec<u8>, child: Box<Node>) -> Box<Node> {
        let hash = extension_hash(&path, &child.hash);
        Box::new(Node {
            kind: NodeKind::Extension { path, child },
            hash,
        })
    }

    pub(crate) fn branch(children: Children, value: Option<Vec<u8>>) -> Box<Node> {
        let hashes = child_hashes(&children);
        let hash = branch_hash(&hashes, value.as_deref());
        Box::new(Node {
            kind: NodeKind::Branch { children, value },
            hash,
        })
    }

    pub(crate) fn empty_children() -> Children {
        std::array::from_fn(|_| None)
    }

    pub(crate) fn hash(&self) -> [u8; 32] {
        self.hash
    }

    /// Proof encoding: `[tag][len BE][path][len BE][value]` for leaves and
    /// extensions (the extension "value" is the child hash), and
    /// `[tag][16 x 32-byte child hash][len BE][value]` for branches
    pub(crate) fn serialize(&self) -> Vec<u8> {
        match &self.kind {
            NodeKind::Leaf { path, value } => encode_keyed(LEAF_TAG, path, value),
            NodeKind::Extension { path, child } => encode_keyed(EXTENSION_TAG, path, &child.hash),
            NodeKind::Branch { children, value } => {
                let value = value.as_deref().unwrap_or(&[]);
                let mut out = Vec::with_capacity(1 + 16 * 32 + 4 + value.len());
                out.push(BRANCH_TAG);
                for hash in child_hashes(children) {
                    out.extend_from_slice(&hash);
                }
                out.extend_from_slice(&(value.len() as u32).to_be_bytes());
                out.extend_from_slice(value);
                out
            }
        }
    }
}

fn encode_keyed(tag: u8, path: &[u8], value: &[u8]) -> Vec<u8> {
    let key = nibbles_to_bytes(path);
    let mut out = Vec::with_capacity(1 + 4 + key.len() + 4 + value.len());
    out.push(tag);
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(&key);
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
    out
}

pub(crate) fn child_hashes(children: &Children) -> [[u8; 32]; 16] {
    std::array::from_fn(|i| children[i].as_ref().map_or(EMPTY_HASH, |c| c.hash))
}

pub(crate) fn leaf_hash(path: &[u8], value: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"leaf");
    hasher.update(nibbles_to_bytes(path));
    hasher.update(value);
    hasher.finalize().into()
}

pub(crate) fn extension_hash(path: &[u8], child_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"extension");
    hasher.update(nibbles_to_bytes(path));
    hasher.update(child_hash);
    hasher.finalize().into()
}

pub(crate) fn branch_hash(children: &[[u8; 32]; 16], value: Option<&[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"branch");
    for hash in children {
        hasher.update(hash);
    }
    if let Some(value) = value {
        hasher.update(value);
    }
    hasher.finalize().into()
}
