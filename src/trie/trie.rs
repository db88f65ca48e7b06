// MerkleTrie - hash-linked hex-nibble Patricia trie
//
// Every mutation rebuilds the nodes along the touched path, so each
// node's cached digest always covers its current descendants and the
// root digest commits to the whole item set. The shape is canonical for
// a given key set, which makes the root independent of insertion order.

use super::nibble::{common_prefix_len, nibbles_to_string, parse_key};
use super::node::{Node, NodeKind, EMPTY_HASH};
use super::proof::InclusionProof;
use super::TrieError;
use std::collections::HashMap;

/// Something that can be stored in a [`MerkleTrie`]
pub trait TrieItem {
    /// Hex key (`[0-9a-f]*`) the item is indexed under
    fn trie_key(&self) -> String;
    /// Bytes committed to by the trie
    fn trie_value(&self) -> Vec<u8>;
}

/// Plain string item
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StringItem {
    pub key: String,
    pub value: String,
}

impl StringItem {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

impl TrieItem for StringItem {
    fn trie_key(&self) -> String {
        self.key.clone()
    }

    fn trie_value(&self) -> Vec<u8> {
        self.value.as_bytes().to_vec()
    }
}

/// Merkle-Patricia trie over hex keys
#[derive(Clone, Debug)]
pub struct MerkleTrie<T: TrieItem> {
    root: Option<Box<Node>>,
    items: HashMap<String, T>,
}

impl<T: TrieItem> Default for MerkleTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TrieItem> MerkleTrie<T> {
    pub fn new() -> Self {
        Self {
            root: None,
            items: HashMap::new(),
        }
    }

    /// Insert or replace an item
    pub fn put(&mut self, item: T) -> Result<(), TrieError> {
        let key = item.trie_key();
        let path = parse_key(&key)?;
        let value = item.trie_value();
        if value.is_empty() {
            return Err(TrieError::EmptyValue(key));
        }

        self.root = Some(insert(self.root.take(), &path, value));
        self.items.insert(key, item);
        Ok(())
    }

    /// Look up an item by key
    pub fn get(&self, key: &str) -> Option<&T> {
        self.items.get(key)
    }

    /// Look up the committed value bytes by walking the trie
    pub fn get_value(&self, key: &str) -> Option<&[u8]> {
        let path = parse_key(key).ok()?;
        lookup(self.root.as_deref(), &path)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get_value(key).is_some()
    }

    /// Remove an item, re-compacting the path
    pub fn remove(&mut self, key: &str) -> Result<Option<T>, TrieError> {
        let path = parse_key(key)?;
        let removed = self.items.remove(key);
        if removed.is_some() {
            self.root = delete(self.root.take(), &path);
        }
        Ok(removed)
    }

    /// Root digest, or 32 zero bytes for an empty trie
    pub fn root_hash(&self) -> [u8; 32] {
        self.root.as_ref().map_or(EMPTY_HASH, |node| node.hash())
    }

    pub fn root_hash_hex(&self) -> String {
        hex::encode(self.root_hash())
    }

    /// Collect the serialized nodes on the lookup path of `key`, root first
    pub fn generate_inclusion_proof(&self, key: &str) -> Result<InclusionProof, TrieError> {
        let path = parse_key(key)?;
        let mut proof_nodes = Vec::new();

        let mut current = self.root.as_deref();
        let mut rest: &[u8] = &path;
        while let Some(node) = current {
            proof_nodes.push(node.serialize());
            current = match &node.kind {
                NodeKind::Leaf { .. } => None,
                NodeKind::Extension { path, child } => {
                    if rest.starts_with(path) {
                        rest = &rest[path.len()..];
                        Some(child.as_ref())
                    } else {
                        None
                    }
                }
                NodeKind::Branch { children, .. } => match rest.split_first() {
                    Some((nibble, tail)) => {
                        rest = tail;
                        children[*nibble as usize].as_deref()
                    }
                    None => None,
                },
            };
        }

        let value = self.get_value(key).map(<[u8]>::to_vec);
        Ok(InclusionProof::new(key, value, proof_nodes))
    }

    /// All keys in ascending nibble order
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.items.len());
        collect_keys(self.root.as_deref(), &mut Vec::new(), &mut keys);
        keys
    }

    /// Items in ascending key order
    pub fn items(&self) -> Vec<&T> {
        self.keys().iter().filter_map(|k| self.items.get(k)).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn clear(&mut self) {
        self.root = None;
        self.items.clear();
    }
}

/// True when both tries commit to the same content
pub fn same_root<A: TrieItem, B: TrieItem>(a: &MerkleTrie<A>, b: &MerkleTrie<B>) -> bool {
    a.root_hash() == b.root_hash()
}

/// Branch (optionally behind an extension for a non-empty shared prefix)
fn wrap_in_extension(prefix: &[u8], branch: Box<Node>) -> Box<Node> {
    if prefix.is_empty() {
        branch
    } else {
        Node::extension(prefix.to_vec(), branch)
    }
}

fn insert(node: Option<Box<Node>>, key: &[u8], value: Vec<u8>) -> Box<Node> {
    let node = match node {
        None => return Node::leaf(key.to_vec(), value),
        Some(node) => node,
    };

    match node.kind {
        NodeKind::Leaf {
            path,
            value: existing,
        } => {
            let common = common_prefix_len(key, &path);
            let mut children = Node::empty_children();

            if common == key.len() && common == path.len() {
                return Node::leaf(path, value);
            }

            let branch = if common == key.len() {
                // new key is a strict prefix of the leaf's key
                children[path[common] as usize] = Some(Node::leaf(path[common + 1..].to_vec(), existing));
                Node::branch(children, Some(value))
            } else if common == path.len() {
                // leaf's key is a strict prefix of the new key
                children[key[common] as usize] = Some(Node::leaf(key[common + 1..].to_vec(), value));
                Node::branch(children, Some(existing))
            } else {
                children[path[common] as usize] = Some(Node::leaf(path[common + 1..].to_vec(), existing));
                children[key[common] as usize] = Some(Node::leaf(key[common + 1..].to_vec(), value));
                Node::branch(children, None)
            };

            wrap_in_extension(&key[..common], branch)
        }

        NodeKind::Extension { path, child } => {
            let common = common_prefix_len(key, &path);
            if common == path.len() {
                let child = insert(Some(child), &key[common..], value);
                return Node::extension(path, child);
            }

            // split the extension at the divergence point
            let mut children = Node::empty_children();
            let ext_rest = &path[common..];
            children[ext_rest[0] as usize] = Some(if ext_rest.len() == 1 {
                child
            } else {
                Node::extension(ext_rest[1..].to_vec(), child)
            });

            let new_rest = &key[common..];
            let branch_value = match new_rest.split_first() {
                Some((nibble, tail)) => {
                    children[*nibble as usize] = Some(Node::leaf(tail.to_vec(), value));
                    None
                }
                None => Some(value),
            };

            wrap_in_extension(&path[..common], Node::branch(children, branch_value))
        }

        NodeKind::Branch {
            mut children,
            value: branch_value,
        } => match key.split_first() {
            None => Node::branch(children, Some(value)),
            Some((nibble, tail)) => {
                let slot = *nibble as usize;
                children[slot] = Some(insert(children[slot].take(), tail, value));
                Node::branch(children, branch_value)
            }
        },
    }
}

fn lookup<'a>(node: Option<&'a Node>, key: &[u8]) -> Option<&'a [u8]> {
    match &node?.kind {
        NodeKind::Leaf { path, value } => (path.as_slice() == key).then_some(value.as_slice()),
        NodeKind::Extension { path, child } => {
            if key.starts_with(path) {
                lookup(Some(child.as_ref()), &key[path.len()..])
            } else {
                None
            }
        }
        NodeKind::Branch { children, value } => match key.split_first() {
            None => value.as_deref(),
            Some((nibble, tail)) => lookup(children[*nibble as usize].as_deref(), tail),
        },
    }
}

fn delete(node: Option<Box<Node>>, key: &[u8]) -> Option<Box<Node>> {
    let node = node?;
    match node.kind {
        NodeKind::Leaf { path, value } => {
            if path.as_slice() == key {
                None
            } else {
                Some(Node::leaf(path, value))
            }
        }
        NodeKind::Extension { path, child } => {
            if key.starts_with(&path) {
                let child = delete(Some(child), &key[path.len()..]);
                compact_extension(path, child)
            } else {
                Some(Node::extension(path, child))
            }
        }
        NodeKind::Branch {
            mut children,
            value,
        } => match key.split_first() {
            None => compact_branch(children, None),
            Some((nibble, tail)) => {
                let slot = *nibble as usize;
                children[slot] = delete(children[slot].take(), tail);
                compact_branch(children, value)
            }
        },
    }
}

/// Collapse a branch that no longer needs to branch
fn compact_branch(children: [Option<Box<Node>>; 16], value: Option<Vec<u8>>) -> Option<Box<Node>> {
    let occupied: Vec<usize> = (0..16).filter(|i| children[*i].is_some()).collect();

    match (occupied.as_slice(), value) {
        ([], None) => None,
        ([], Some(value)) => Some(Node::leaf(Vec::new(), value)),
        ([slot], None) => {
            let slot = *slot;
            let mut children = children;
            let child = children[slot].take()?;
            Some(prepend_path(&[slot as u8], child))
        }
        (_, value) => Some(Node::branch(children, value)),
    }
}

fn compact_extension(path: Vec<u8>, child: Option<Box<Node>>) -> Option<Box<Node>> {
    child.map(|child| prepend_path(&path, child))
}

/// Push `prefix` down into `node`, merging with leaf/extension paths
fn prepend_path(prefix: &[u8], node: Box<Node>) -> Box<Node> {
    match node.kind {
        NodeKind::Leaf { path, value } => Node::leaf([prefix, &path].concat(), value),
        NodeKind::Extension { path, child } => Node::extension([prefix, &path].concat(), child),
        NodeKind::Branch { .. } => Node::extension(prefix.to_vec(), node),
    }
}

fn collect_keys(node: Option<&Node>, prefix: &mut Vec<u8>, keys: &mut Vec<String>) {
    let Some(node) = node else { return };

    match &node.kind {
        NodeKind::Leaf { path, .. } => {
            let len = prefix.len();
            prefix.extend_from_slice(path);
            keys.push(nibbles_to_string(prefix));
            prefix.truncate(len);
        }
        NodeKind::Extension { path, child } => {
            let len = prefix.len();
            prefix.extend_from_slice(path);
            collect_keys(Some(child.as_ref()), prefix, keys);
            prefix.truncate(len);
        }
        NodeKind::Branch { children, value } => {
            if value.is_some() {
                keys.push(nibbles_to_string(prefix));
            }
            for (nibble, child) in children.iter().enumerate() {
                if let Some(child) = child {
                    prefix.push(nibble as u8);
                    collect_keys(Some(child.as_ref()), prefix, keys);
                    prefix.pop();
                }
            }
        }
    }
}
