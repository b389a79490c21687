//! # Merkle State Tree
//!
//! Authenticated key-value map. The root hash summarizes every (key, value)
//! pair; change anything anywhere and the root changes.
//!
//! ```text
//! leaf     = SHA256(key || canonical_json(value))
//! internal = SHA256(left || right)
//! levels   = leaves sorted by key, paired bottom-up,
//!            last node duplicated on odd counts
//! ```
//!
//! Sorting by key makes the root a pure function of the final key set:
//! insertion order never matters.
//!
//! ## Laziness
//!
//! Leaf hashes are computed eagerly on `update` (one hash per write), while
//! the internal levels are only rebuilt when someone asks for the root or a
//! proof. A batch of a thousand updates costs one rebuild, not a thousand.
//! Internal nodes are memoized by `(left, right)` in a bounded cache, so a
//! rebuild after a handful of writes mostly hits the cache for the subtrees
//! that did not change.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_MERKLE_CACHE_CAPACITY;
use crate::crypto::{hash_pair, hex_hash, sha256_multi, Hash, ZERO_HASH};
use crate::value::Value;

/// Hash a single leaf.
pub fn leaf_hash(key: &str, value: &Value) -> Hash {
    sha256_multi(&[key.as_bytes(), &value.canonical_bytes()])
}

// ---------------------------------------------------------------------------
// Proofs
// ---------------------------------------------------------------------------

/// Which side of the running hash a sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// One step of an inclusion proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    #[serde(with = "hex_hash")]
    pub sibling: Hash,
    pub side: Side,
}

/// Inclusion proof for a single key.
///
/// Self-contained: a verifier needs nothing but the proof to check it, and
/// then compares `root_hash` against a root it trusts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub key: String,
    pub value: Value,
    /// Siblings from the leaf level up to (not including) the root.
    pub path: Vec<ProofStep>,
    #[serde(with = "hex_hash")]
    pub root_hash: Hash,
}

// ---------------------------------------------------------------------------
// MerkleTree
// ---------------------------------------------------------------------------

/// In-memory authenticated state.
pub struct MerkleTree {
    leaves: BTreeMap<String, Value>,
    /// Leaf hashes, kept in lockstep with `leaves`.
    leaf_hashes: BTreeMap<String, Hash>,
    /// `levels[0]` are leaf hashes in key order; the last level is `[root]`.
    levels: Vec<Vec<Hash>>,
    dirty: bool,
    node_cache: HashMap<(Hash, Hash), Hash>,
    cache_capacity: usize,
}

impl MerkleTree {
    /// Create an empty tree with the default node cache capacity.
    pub fn new() -> Self {
        Self::with_cache_capacity(DEFAULT_MERKLE_CACHE_CAPACITY)
    }

    /// Create an empty tree whose node cache holds at most `capacity` entries.
    pub fn with_cache_capacity(capacity: usize) -> Self {
        Self {
            leaves: BTreeMap::new(),
            leaf_hashes: BTreeMap::new(),
            levels: Vec::new(),
            dirty: false,
            node_cache: HashMap::new(),
            cache_capacity: capacity,
        }
    }

    /// Build a tree from a full state map.
    pub fn from_entries(entries: BTreeMap<String, Value>) -> Self {
        let mut tree = Self::new();
        tree.load(entries);
        tree
    }

    /// Replace the whole contents of the tree. The node cache survives.
    pub fn load(&mut self, entries: BTreeMap<String, Value>) {
        self.leaf_hashes = entries
            .iter()
            .map(|(k, v)| (k.clone(), leaf_hash(k, v)))
            .collect();
        self.leaves = entries;
        self.dirty = true;
    }

    /// Insert or overwrite one key.
    pub fn update(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.leaf_hashes.insert(key.clone(), leaf_hash(&key, &value));
        self.leaves.insert(key, value);
        self.dirty = true;
    }

    /// Insert or overwrite many keys; the rebuild is still deferred.
    pub fn batch_update<I>(&mut self, changes: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        for (key, value) in changes {
            self.update(key, value);
        }
    }

    /// Remove a key, returning its previous value.
    pub fn delete(&mut self, key: &str) -> Option<Value> {
        let removed = self.leaves.remove(key);
        if removed.is_some() {
            self.leaf_hashes.remove(key);
            self.dirty = true;
        }
        removed
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.leaves.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.leaves.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// `true` when the internal levels are stale.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Borrow the full state map.
    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.leaves
    }

    /// Owned copy of the full state map.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.leaves.clone()
    }

    /// Keys starting with `prefix`, in order.
    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a String> + 'a {
        self.leaves
            .range(prefix.to_string()..)
            .map(|(k, _)| k)
            .take_while(move |k| k.starts_with(prefix))
    }

    /// Number of memoized internal nodes.
    pub fn cache_len(&self) -> usize {
        self.node_cache.len()
    }

    /// Root hash of the current contents. Rebuilds internal levels if dirty.
    ///
    /// An empty tree returns [`ZERO_HASH`]; a single-leaf tree returns the
    /// leaf hash itself.
    pub fn get_root_hash(&mut self) -> Hash {
        self.rebuild_if_dirty();
        self.levels
            .last()
            .and_then(|top| top.first())
            .copied()
            .unwrap_or(ZERO_HASH)
    }

    /// Inclusion proof for `key`, or `None` if the key is absent.
    pub fn generate_proof(&mut self, key: &str) -> Option<MerkleProof> {
        let value = self.leaves.get(key)?.clone();
        self.rebuild_if_dirty();

        let mut index = self
            .leaf_hashes
            .range::<str, _>((Bound::Unbounded, Bound::Excluded(key)))
            .count();
        let mut path = Vec::with_capacity(self.levels.len().saturating_sub(1));

        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let (sibling_index, side) = if index % 2 == 0 {
                // odd tail: the node was paired with itself
                ((index + 1).min(level.len() - 1), Side::Right)
            } else {
                (index - 1, Side::Left)
            };
            path.push(ProofStep {
                sibling: level[sibling_index],
                side,
            });
            index /= 2;
        }

        let root_hash = self
            .levels
            .last()
            .and_then(|top| top.first())
            .copied()
            .unwrap_or(ZERO_HASH);

        Some(MerkleProof {
            key: key.to_string(),
            value,
            path,
            root_hash,
        })
    }

    /// Check a proof on its own terms.
    ///
    /// The leaf hash is recomputed from `(key, value)`, so a tampered value
    /// fails; the path is folded and compared against `root_hash`, so a
    /// tampered root fails. Whether `root_hash` is a root worth trusting is
    /// the caller's decision.
    pub fn verify_proof(proof: &MerkleProof) -> bool {
        let computed = proof
            .path
            .iter()
            .fold(leaf_hash(&proof.key, &proof.value), |acc, step| match step.side {
                Side::Left => hash_pair(&step.sibling, &acc),
                Side::Right => hash_pair(&acc, &step.sibling),
            });
        computed == proof.root_hash
    }

    fn rebuild_if_dirty(&mut self) {
        if !self.dirty {
            return;
        }
        self.levels.clear();

        let mut level: Vec<Hash> = self.leaf_hashes.values().copied().collect();
        if !level.is_empty() {
            while level.len() > 1 {
                let mut next = Vec::with_capacity((level.len() + 1) / 2);
                for chunk in level.chunks(2) {
                    let left = chunk[0];
                    let right = if chunk.len() == 2 { chunk[1] } else { chunk[0] };
                    next.push(self.parent(left, right));
                }
                self.levels.push(std::mem::replace(&mut level, next));
            }
            self.levels.push(level);
        }

        self.dirty = false;
    }

    fn parent(&mut self, left: Hash, right: Hash) -> Hash {
        if let Some(hit) = self.node_cache.get(&(left, right)) {
            return *hit;
        }
        let parent = hash_pair(&left, &right);
        if self.cache_capacity > 0 {
            if self.node_cache.len() >= self.cache_capacity {
                // wholesale eviction keeps the bound without LRU bookkeeping
                self.node_cache.clear();
            }
            self.node_cache.insert((left, right), parent);
        }
        parent
    }
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with(n: usize) -> MerkleTree {
        let mut tree = MerkleTree::new();
        for i in 0..n {
            tree.update(format!("acct:{i:03}"), Value::account(i as i64 * 10));
        }
        tree
    }

    #[test]
    fn empty_tree_root_is_zero() {
        let mut tree = MerkleTree::new();
        assert_eq!(tree.get_root_hash(), ZERO_HASH);
        assert!(tree.generate_proof("missing").is_none());
    }

    #[test]
    fn single_leaf_root_is_leaf_hash() {
        let mut tree = MerkleTree::new();
        tree.update("only", Value::Number(1));
        assert_eq!(tree.get_root_hash(), leaf_hash("only", &Value::Number(1)));

        let proof = tree.generate_proof("only").unwrap();
        assert!(proof.path.is_empty());
        assert!(MerkleTree::verify_proof(&proof));
    }

    #[test]
    fn root_is_independent_of_insertion_order() {
        let mut forward = MerkleTree::new();
        let mut backward = MerkleTree::new();
        let pairs: Vec<(String, Value)> = (0..13)
            .map(|i| (format!("k{i}"), Value::Number(i)))
            .collect();

        forward.batch_update(pairs.clone());
        backward.batch_update(pairs.into_iter().rev());

        assert_eq!(forward.get_root_hash(), backward.get_root_hash());
    }

    #[test]
    fn different_values_different_roots() {
        let mut a = MerkleTree::new();
        let mut b = MerkleTree::new();
        a.update("alice", Value::account(100));
        b.update("alice", Value::account(200));
        assert_ne!(a.get_root_hash(), b.get_root_hash());
    }

    #[test]
    fn leaf_is_key_then_canonical_json() {
        let expected = crate::crypto::sha256(br#"alice{"balance":100}"#);
        assert_eq!(leaf_hash("alice", &Value::account(100)), expected);
    }

    #[test]
    fn proofs_verify_for_every_key_at_every_size() {
        for n in 1..=17 {
            let mut tree = tree_with(n);
            let root = tree.get_root_hash();
            let keys: Vec<String> = tree.entries().keys().cloned().collect();
            for key in keys {
                let proof = tree.generate_proof(&key).unwrap();
                assert_eq!(proof.root_hash, root);
                assert!(MerkleTree::verify_proof(&proof), "n={n} key={key}");
            }
        }
    }

    #[test]
    fn tampered_value_fails_verification() {
        let mut tree = tree_with(6);
        let mut proof = tree.generate_proof("acct:003").unwrap();
        proof.value = Value::account(1_000_000);
        assert!(!MerkleTree::verify_proof(&proof));
    }

    #[test]
    fn tampered_root_fails_verification() {
        let mut tree = tree_with(6);
        let mut proof = tree.generate_proof("acct:002").unwrap();
        proof.root_hash[0] ^= 0xFF;
        assert!(!MerkleTree::verify_proof(&proof));
    }

    #[test]
    fn tampered_sibling_fails_verification() {
        let mut tree = tree_with(5);
        let mut proof = tree.generate_proof("acct:004").unwrap();
        proof.path[0].sibling[31] ^= 0x01;
        assert!(!MerkleTree::verify_proof(&proof));
    }

    #[test]
    fn rebuild_is_lazy() {
        let mut tree = tree_with(4);
        assert!(tree.is_dirty());
        let root = tree.get_root_hash();
        assert!(!tree.is_dirty());

        tree.update("acct:000", Value::account(5));
        assert!(tree.is_dirty());
        assert_ne!(tree.get_root_hash(), root);
    }

    #[test]
    fn delete_restores_previous_root() {
        let mut tree = tree_with(3);
        let before = tree.get_root_hash();
        tree.update("extra", Value::Number(1));
        assert_ne!(tree.get_root_hash(), before);

        assert_eq!(tree.delete("extra"), Some(Value::Number(1)));
        assert_eq!(tree.get_root_hash(), before);
        assert_eq!(tree.delete("extra"), None);
    }

    #[test]
    fn node_cache_stays_bounded() {
        let mut tree = MerkleTree::with_cache_capacity(8);
        for i in 0..64 {
            tree.update(format!("k{i}"), Value::Number(i));
            tree.get_root_hash();
            assert!(tree.cache_len() <= 8);
        }
    }

    #[test]
    fn cached_and_uncached_roots_agree() {
        let mut cached = tree_with(20);
        let mut uncached = MerkleTree::with_cache_capacity(0);
        uncached.load(cached.snapshot());

        cached.get_root_hash();
        cached.update("acct:007", Value::account(1));
        uncached.update("acct:007", Value::account(1));

        assert_eq!(cached.get_root_hash(), uncached.get_root_hash());
        assert_eq!(uncached.cache_len(), 0);
    }

    #[test]
    fn prefix_scan() {
        let mut tree = MerkleTree::new();
        tree.update("spent:a:0", Value::Number(0));
        tree.update("spent:b:1", Value::Number(0));
        tree.update("spender", Value::Number(0));
        tree.update("alice", Value::Number(0));

        let spent: Vec<&String> = tree.keys_with_prefix("spent:").collect();
        assert_eq!(spent.len(), 2);
    }

    #[test]
    fn proof_serializes_as_json() {
        let mut tree = tree_with(3);
        let proof = tree.generate_proof("acct:001").unwrap();
        let json = serde_json::to_string(&proof).unwrap();
        let back: MerkleProof = serde_json::from_str(&json).unwrap();
        assert_eq!(back, proof);
        assert!(MerkleTree::verify_proof(&back));
    }
}
