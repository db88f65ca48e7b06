// Inclusion / non-inclusion proofs
//
// A proof is the serialized node list on the lookup path of a key, root
// first. Verification walks it top-down to check that every node links to
// the next along the key and that the last node settles the claim, then
// re-hashes bottom-up and compares against the expected root.

use super::nibble::parse_key;
use super::node::{
    branch_hash, extension_hash, leaf_hash, BRANCH_TAG, EMPTY_HASH, EXTENSION_TAG, LEAF_TAG,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProofError {
    #[error("Malformed proof node {index}: {reason}")]
    MalformedNode { index: usize, reason: String },

    #[error("Invalid proof key: {0}")]
    InvalidKey(String),

    #[error("Proof path diverges from key at node {0}")]
    PathMismatch(usize),

    #[error("Proof node {0} does not link to its child")]
    LinkMismatch(usize),

    #[error("Last proof node does not support the claim")]
    ClaimMismatch,

    #[error("Proof does not reproduce the expected root")]
    RootMismatch,
}

/// Decoded proof node
#[derive(Clone, Debug, PartialEq, Eq)]
enum ProofNode {
    Leaf {
        path: Vec<u8>,
        value: Vec<u8>,
    },
    Extension {
        path: Vec<u8>,
        child_hash: [u8; 32],
    },
    Branch {
        children: [[u8; 32]; 16],
        value: Option<Vec<u8>>,
    },
}

impl ProofNode {
    fn decode(index: usize, bytes: &[u8]) -> Result<Self, ProofError> {
        let malformed = |reason: &str| ProofError::MalformedNode {
            index,
            reason: reason.to_string(),
        };
        let mut reader = Reader::new(bytes);
        let tag = reader.take(1).ok_or_else(|| malformed("missing tag"))?[0];

        let node = match tag {
            LEAF_TAG | EXTENSION_TAG => {
                let path = reader.take_prefixed().ok_or_else(|| malformed("truncated path"))?;
                let path = std::str::from_utf8(path)
                    .ok()
                    .and_then(|p| parse_key(p).ok())
                    .ok_or_else(|| malformed("path is not hex"))?;
                let value = reader.take_prefixed().ok_or_else(|| malformed("truncated value"))?;

                if tag == LEAF_TAG {
                    ProofNode::Leaf {
                        path,
                        value: value.to_vec(),
                    }
                } else {
                    let child_hash = <[u8; 32]>::try_from(value)
                        .map_err(|_| malformed("extension child hash must be 32 bytes"))?;
                    ProofNode::Extension { path, child_hash }
                }
            }
            BRANCH_TAG => {
                let mut children = [EMPTY_HASH; 16];
                for child in children.iter_mut() {
                    let hash = reader.take(32).ok_or_else(|| malformed("truncated child hash"))?;
                    child.copy_from_slice(hash);
                }
                let value = reader.take_prefixed().ok_or_else(|| malformed("truncated value"))?;
                ProofNode::Branch {
                    children,
                    value: (!value.is_empty()).then(|| value.to_vec()),
                }
            }
            other => return Err(malformed(&format!("unknown tag {}", other))),
        };

        if !reader.is_empty() {
            return Err(malformed("trailing bytes"));
        }
        Ok(node)
    }

    fn hash(&self) -> [u8; 32] {
        match self {
            ProofNode::Leaf { path, value } => leaf_hash(path, value),
            ProofNode::Extension { path, child_hash } => extension_hash(path, child_hash),
            ProofNode::Branch { children, value } => branch_hash(children, value.as_deref()),
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.bytes.len() < n {
            return None;
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Some(head)
    }

    fn take_prefixed(&mut self) -> Option<&'a [u8]> {
        let len = self.take(4)?;
        let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
        self.take(len)
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Proof that a key is (or is not) committed to by a trie root
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub proof_nodes: Vec<Vec<u8>>,
    pub is_included: bool,
}

impl InclusionProof {
    pub fn new(key: &str, value: Option<Vec<u8>>, proof_nodes: Vec<Vec<u8>>) -> Self {
        Self {
            key: key.to_string(),
            is_included: value.is_some(),
            value,
            proof_nodes,
        }
    }

    /// True when the proof is consistent with `root_hash`
    pub fn verify(&self, root_hash: &[u8; 32]) -> bool {
        self.check(root_hash).is_ok()
    }

    /// Like [`verify`](Self::verify) but says what went wrong
    pub fn check(&self, root_hash: &[u8; 32]) -> Result<(), ProofError> {
        if self.is_included != self.value.is_some() {
            return Err(ProofError::ClaimMismatch);
        }

        if self.proof_nodes.is_empty() {
            // only an empty trie has nothing on the lookup path
            return if !self.is_included && *root_hash == EMPTY_HASH {
                Ok(())
            } else {
                Err(ProofError::RootMismatch)
            };
        }

        let key = parse_key(&self.key).map_err(|e| ProofError::InvalidKey(e.to_string()))?;
        let nodes = self
            .proof_nodes
            .iter()
            .enumerate()
            .map(|(i, bytes)| ProofNode::decode(i, bytes))
            .collect::<Result<Vec<_>, _>>()?;

        // top-down: follow the key through every non-terminal node
        let last = nodes.len() - 1;
        let mut rest: &[u8] = &key;
        let mut slots = Vec::with_capacity(last);
        for (index, node) in nodes[..last].iter().enumerate() {
            match node {
                ProofNode::Leaf { .. } => return Err(ProofError::PathMismatch(index)),
                ProofNode::Extension { path, .. } => {
                    if !rest.starts_with(path) {
                        return Err(ProofError::PathMismatch(index));
                    }
                    rest = &rest[path.len()..];
                    slots.push(None);
                }
                ProofNode::Branch { .. } => {
                    let (nibble, tail) = rest.split_first().ok_or(ProofError::PathMismatch(index))?;
                    rest = tail;
                    slots.push(Some(*nibble as usize));
                }
            }
        }

        if !settles_claim(&nodes[last], rest, self.value.as_deref()) {
            return Err(ProofError::ClaimMismatch);
        }

        // bottom-up: each parent must commit to the recomputed child digest
        let mut computed = nodes[last].hash();
        for index in (0..last).rev() {
            let linked = match (&nodes[index], slots[index]) {
                (ProofNode::Extension { child_hash, .. }, None) => *child_hash,
                (ProofNode::Branch { children, .. }, Some(slot)) => children[slot],
                _ => return Err(ProofError::LinkMismatch(index)),
            };
            if linked != computed {
                return Err(ProofError::LinkMismatch(index));
            }
            computed = nodes[index].hash();
        }

        if computed == *root_hash {
            Ok(())
        } else {
            Err(ProofError::RootMismatch)
        }
    }
}

/// Does the terminal node prove presence of `value` (or absence when `None`)
/// for the remaining key nibbles `rest`?
fn settles_claim(node: &ProofNode, rest: &[u8], value: Option<&[u8]>) -> bool {
    match (node, value) {
        (ProofNode::Leaf { path, value: stored }, Some(expected)) => {
            path.as_slice() == rest && stored.as_slice() == expected
        }
        (ProofNode::Leaf { path, .. }, None) => path.as_slice() != rest,
        (ProofNode::Extension { .. }, Some(_)) => false,
        (ProofNode::Extension { path, .. }, None) => !rest.starts_with(path),
        (ProofNode::Branch { children, value: stored }, expected) => match rest.split_first() {
            None => stored.as_deref() == expected,
            Some((nibble, _)) => expected.is_none() && children[*nibble as usize] == EMPTY_HASH,
        },
    }
}
