//! Hash-backed merkle map: an authenticated key/value state with snapshot
//! semantics and structural sharing.
//!
//! Every mutation returns a new [MerkleMap]; the receiver stays valid, and
//! the two share every untouched subtree through the content-addressed
//! [Store]. Two peers holding the same key/value set compute the same
//! [root_hash](MerkleMap::root_hash) no matter what order they applied their
//! writes in.

mod node;
mod proof;
mod store;

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;

use crate::common::{hash, Id};
use crate::{Error, Result};

pub use proof::{root_hash_of, verify, Proof, SlotGroup};
pub use store::{MemoryStore, Store};

use node::Tree;
use store::TreeIo;

/// Maximum number of entries in a leaf bucket, and the width of every hash
/// vector. Fixed by the network protocol.
pub const LEAF_SIZE: usize = 16;

const ZERO_VALUE: [u8; 32] = [0; 32];

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// A map key. Integer keys canonicalise to a 32-byte big-endian encoding, so
/// `Key::from(7u64)` and the explicit byte form hash identically.
pub struct Key(Bytes);

impl Key {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The hash that routes this key: slot `hash[31] % 16`, tree path along
    /// the leading bits.
    pub fn slot_hash(&self) -> Id {
        hash(&self.0)
    }
}

impl From<Bytes> for Key {
    fn from(bytes: Bytes) -> Key {
        Key(bytes)
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Key {
        Key(bytes.into())
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Key {
        Key(Bytes::copy_from_slice(bytes))
    }
}

impl From<&str> for Key {
    fn from(text: &str) -> Key {
        Key(Bytes::copy_from_slice(text.as_bytes()))
    }
}

impl From<u64> for Key {
    fn from(number: u64) -> Key {
        Key(canonical_int(number as u128))
    }
}

impl From<u128> for Key {
    fn from(number: u128) -> Key {
        Key(canonical_int(number))
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
/// A map value. The 32 zero bytes mean "absent": inserting them deletes the
/// key instead.
pub struct Value(Bytes);

impl Value {
    /// The deletion sentinel.
    pub fn zero() -> Value {
        Value(Bytes::from_static(&ZERO_VALUE))
    }

    pub fn is_zero(&self) -> bool {
        self.0.len() == 32 && self.0.iter().all(|byte| *byte == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for Value {
    fn from(bytes: Bytes) -> Value {
        Value(bytes)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Value {
        Value(bytes.into())
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Value {
        Value(Bytes::copy_from_slice(bytes))
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Value {
        Value(Bytes::copy_from_slice(text.as_bytes()))
    }
}

impl From<u64> for Value {
    fn from(number: u64) -> Value {
        Value(canonical_int(number as u128))
    }
}

impl From<u128> for Value {
    fn from(number: u128) -> Value {
        Value(canonical_int(number))
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Value({:?})", String::from_utf8_lossy(&self.0))
    }
}

fn canonical_int(number: u128) -> Bytes {
    let mut bytes = [0u8; 32];
    bytes[16..].copy_from_slice(&number.to_be_bytes());
    Bytes::copy_from_slice(&bytes)
}

#[derive(Clone)]
/// A snapshot of the authenticated map.
///
/// Cheap to clone; mutating operations return a new snapshot and leave the
/// receiver untouched. Mutators must be serialised by the caller, readers
/// may run concurrently against any snapshot.
pub struct MerkleMap {
    io: Arc<TreeIo>,
    root: Tree,
    root_hash: Id,
    root_hashes: [Id; LEAF_SIZE],
    count: usize,
}

impl MerkleMap {
    /// An empty map on top of `store`. Nothing is written until the first
    /// mutation.
    pub fn new(store: Arc<dyn Store>) -> MerkleMap {
        MerkleMap::with_io(Arc::new(TreeIo::new(store)))
    }

    /// An empty map over a fresh [MemoryStore]; mostly useful in tests.
    pub fn in_memory() -> MerkleMap {
        MerkleMap::new(Arc::new(MemoryStore::new()))
    }

    // === Options ===

    /// Override the decoded-node cache capacity.
    pub fn with_cache_capacity(self, capacity: usize) -> MerkleMap {
        let io = Arc::new(TreeIo::with_capacity(self.io.store(), capacity));
        MerkleMap { io, ..self }
    }

    fn with_io(io: Arc<TreeIo>) -> MerkleMap {
        let (root, hv, root_hash) = node::empty_root();

        MerkleMap {
            io,
            root,
            root_hash,
            root_hashes: hv.hashes,
            count: hv.count,
        }
    }

    /// Reattach to a tree persisted under `root_hash`.
    pub fn restore(store: Arc<dyn Store>, root_hash: &Id) -> Result<MerkleMap> {
        let io = Arc::new(TreeIo::new(store));

        let empty = MerkleMap::with_io(io.clone());
        if empty.root_hash == *root_hash {
            return Ok(empty);
        }

        match io.read_root_record(root_hash)? {
            None => Err(Error::RootNotFound(*root_hash)),
            Some((_, root)) => {
                let hv = root
                    .cache()
                    .cloned()
                    .ok_or(Error::MalformedNode("root record without a hash vector"))?;

                if node::hashes_root(&hv.hashes)? != *root_hash {
                    return Err(Error::HashMismatch(*root_hash));
                }

                Ok(MerkleMap {
                    io,
                    root,
                    root_hash: *root_hash,
                    root_hashes: hv.hashes,
                    count: hv.count,
                })
            }
        }
    }

    // === Getters ===

    /// Number of live keys.
    pub fn size(&self) -> usize {
        self.count
    }

    /// The 32-byte commitment to the whole map.
    pub fn root_hash(&self) -> Id {
        self.root_hash
    }

    /// The root's per-slot merkle signature; proofs verify against this.
    pub fn root_hashes(&self) -> [Id; LEAF_SIZE] {
        self.root_hashes
    }

    /// Number of leaf buckets in the tree.
    pub fn bucket_count(&self) -> Result<usize> {
        node::leaf_count(&self.io, &self.root)
    }

    // === Public Methods ===

    pub fn get(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        node::get_at(&self.io, &self.root, &key.slot_hash(), &key)
    }

    pub fn contains(&self, key: impl Into<Key>) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert or replace a key. Inserting the zero value deletes instead.
    pub fn insert(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<MerkleMap> {
        let key = key.into();
        let value = value.into();

        if value.is_zero() {
            return self.delete(key);
        }

        let key_hash = key.slot_hash();
        let (tree, changed) = node::insert_at(&self.io, self.root.clone(), &key_hash, key, value)?;

        if !changed {
            return Ok(self.clone());
        }

        self.commit(tree)
    }

    /// Apply a batch of writes in one transaction; later pairs win over
    /// earlier ones for the same key, zero values delete.
    pub fn insert_many<K, V>(&self, pairs: impl IntoIterator<Item = (K, V)>) -> Result<MerkleMap>
    where
        K: Into<Key>,
        V: Into<Value>,
    {
        let mut tree = self.root.clone();
        let mut changed_any = false;

        for (key, value) in pairs {
            let key = key.into();
            let value = value.into();
            let key_hash = key.slot_hash();

            let (next, changed) = if value.is_zero() {
                node::delete_at(&self.io, tree, &key_hash, &key)?
            } else {
                node::insert_at(&self.io, tree, &key_hash, key, value)?
            };

            tree = next;
            changed_any |= changed;
        }

        if !changed_any {
            return Ok(self.clone());
        }

        self.commit(tree)
    }

    pub fn delete(&self, key: impl Into<Key>) -> Result<MerkleMap> {
        let key = key.into();
        let key_hash = key.slot_hash();

        let (tree, changed) = node::delete_at(&self.io, self.root.clone(), &key_hash, &key)?;

        if !changed {
            return Ok(self.clone());
        }

        self.commit(tree)
    }

    /// All entries in left-to-right tree order. Stable for a given tree
    /// shape, not sorted by key.
    pub fn to_list(&self) -> Result<Vec<(Key, Value)>> {
        let mut entries = Vec::with_capacity(self.count);
        node::entries_at(&self.io, &self.root, &mut entries)?;
        Ok(entries)
    }

    /// An inclusion (or absence) proof for `key`, verifiable offline against
    /// [root_hashes](MerkleMap::root_hashes).
    pub fn proof(&self, key: impl Into<Key>) -> Result<Proof> {
        proof::prove(&self.io, &self.root, &key.into())
    }

    // === Private Methods ===

    /// Freeze the working tree into the store and record the new root.
    ///
    /// Interior nodes are written before the root record, so a failed flush
    /// can orphan content-addressed nodes but never expose a partial tree.
    fn commit(&self, tree: Tree) -> Result<MerkleMap> {
        let (_, hv, root) = node::flush(&self.io, tree)?;
        let root_hash = node::hashes_root(&hv.hashes)?;

        let bytes = node::encode_node(&root)?;
        self.io.write_root_record(&root_hash, &bytes)?;

        Ok(MerkleMap {
            io: self.io.clone(),
            root,
            root_hash,
            root_hashes: hv.hashes,
            count: hv.count,
        })
    }
}

impl Debug for MerkleMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MerkleMap")
            .field("root_hash", &self.root_hash)
            .field("size", &self.count)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pairs(range: std::ops::Range<u32>) -> Vec<(Key, Value)> {
        range
            .map(|i| {
                (
                    Key::from(format!("k{}", i).into_bytes()),
                    Value::from(format!("v{}", i).into_bytes()),
                )
            })
            .collect()
    }

    #[test]
    fn empty_tree_has_a_stable_root() {
        let a = MerkleMap::in_memory();
        let b = MerkleMap::in_memory();

        assert_eq!(a.root_hash(), b.root_hash());
        assert_eq!(a.size(), 0);
        assert_eq!(a.bucket_count().unwrap(), 1);
        assert_eq!(a.get("anything").unwrap(), None);
    }

    #[test]
    fn insert_then_get() {
        let map = MerkleMap::in_memory();
        let map = map.insert("k", "v").unwrap();

        assert_eq!(map.get("k").unwrap(), Some(Value::from("v")));
        assert_eq!(map.size(), 1);
        assert!(map.contains("k").unwrap());
        assert!(!map.contains("other").unwrap());
    }

    #[test]
    fn insert_then_delete_restores_the_empty_root() {
        let empty = MerkleMap::in_memory();
        let map = empty.insert("k", "v").unwrap();
        assert_ne!(map.root_hash(), empty.root_hash());

        let map = map.delete("k").unwrap();
        assert_eq!(map.root_hash(), empty.root_hash());
        assert_eq!(map.size(), 0);
        assert_eq!(map.get("k").unwrap(), None);
    }

    #[test]
    fn zero_value_deletes_the_key() {
        let map = MerkleMap::in_memory().insert("k", "v").unwrap();
        let map = map.insert("k", Value::zero()).unwrap();

        assert_eq!(map.get("k").unwrap(), None);
        assert_eq!(map.root_hash(), MerkleMap::in_memory().root_hash());
    }

    #[test]
    fn snapshots_stay_valid_across_mutations() {
        let before = MerkleMap::in_memory().insert_many(pairs(0..20)).unwrap();
        let after = before.insert("k0", "changed").unwrap();

        assert_eq!(before.get("k0").unwrap(), Some(Value::from("v0")));
        assert_eq!(after.get("k0").unwrap(), Some(Value::from("changed")));
        assert_eq!(before.size(), 20);
        assert_eq!(after.size(), 20);
    }

    #[test]
    fn root_hash_ignores_insertion_order() {
        let forward = MerkleMap::in_memory().insert_many(pairs(0..30)).unwrap();

        let mut reversed = pairs(0..30);
        reversed.reverse();
        let backward = MerkleMap::in_memory().insert_many(reversed).unwrap();

        assert_eq!(forward.root_hash(), backward.root_hash());
        assert_eq!(forward.root_hashes(), backward.root_hashes());
    }

    #[test]
    fn one_by_one_matches_batched_inserts() {
        let batched = MerkleMap::in_memory().insert_many(pairs(0..25)).unwrap();

        let mut one_by_one = MerkleMap::in_memory();
        for (key, value) in pairs(0..25) {
            one_by_one = one_by_one.insert(key, value).unwrap();
        }

        assert_eq!(batched.root_hash(), one_by_one.root_hash());
    }

    #[test]
    fn sixteen_keys_fit_in_one_bucket_seventeen_split() {
        let sixteen = MerkleMap::in_memory().insert_many(pairs(1..17)).unwrap();
        assert_eq!(sixteen.bucket_count().unwrap(), 1);

        let seventeen = MerkleMap::in_memory().insert_many(pairs(1..18)).unwrap();
        assert!(seventeen.bucket_count().unwrap() >= 2);
        assert_eq!(seventeen.size(), 17);

        // Every key is still reachable after the split.
        for (key, value) in pairs(1..18) {
            assert_eq!(seventeen.get(key).unwrap(), Some(value));
        }
    }

    #[test]
    fn deleting_below_capacity_merges_back_to_one_bucket() {
        let mut map = MerkleMap::in_memory().insert_many(pairs(0..40)).unwrap();
        assert!(map.bucket_count().unwrap() >= 2);

        for i in 10..40 {
            map = map.delete(format!("k{}", i).into_bytes()).unwrap();
        }

        assert_eq!(map.size(), 10);
        assert_eq!(map.bucket_count().unwrap(), 1);

        // The merged tree equals one built directly from the survivors.
        let direct = MerkleMap::in_memory().insert_many(pairs(0..10)).unwrap();
        assert_eq!(map.root_hash(), direct.root_hash());
    }

    #[test]
    fn repeated_insert_writes_nothing_new() {
        let store = Arc::new(MemoryStore::new());
        let map = MerkleMap::new(store.clone());

        let map = map.insert("k", "v").unwrap();
        let writes = store.write_count();

        let same = map.insert("k", "v").unwrap();
        assert_eq!(store.write_count(), writes);
        assert_eq!(same.root_hash(), map.root_hash());
    }

    #[test]
    fn restore_round_trips_every_observable_operation() {
        let store = Arc::new(MemoryStore::new());
        let original = MerkleMap::new(store.clone())
            .insert_many(pairs(0..40))
            .unwrap();

        let restored = MerkleMap::restore(store, &original.root_hash()).unwrap();

        assert_eq!(restored.root_hash(), original.root_hash());
        assert_eq!(restored.root_hashes(), original.root_hashes());
        assert_eq!(restored.size(), original.size());
        assert_eq!(restored.to_list().unwrap(), original.to_list().unwrap());
        for (key, value) in pairs(0..40) {
            assert_eq!(restored.get(key).unwrap(), Some(value));
        }
    }

    #[test]
    fn restore_of_an_unknown_root_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let missing = hash(b"no such root");

        assert!(matches!(
            MerkleMap::restore(store, &missing),
            Err(Error::RootNotFound(k)) if k == missing
        ));
    }

    #[test]
    fn restore_of_the_empty_root_needs_no_record() {
        let store = Arc::new(MemoryStore::new());
        let empty_hash = MerkleMap::new(store.clone()).root_hash();

        let restored = MerkleMap::restore(store, &empty_hash).unwrap();
        assert_eq!(restored.size(), 0);
    }

    #[test]
    fn integer_keys_canonicalise_to_32_byte_big_endian() {
        let by_int = MerkleMap::in_memory().insert(7u64, "v").unwrap();

        let mut canonical = [0u8; 32];
        canonical[31] = 7;
        let by_bytes = MerkleMap::in_memory()
            .insert(canonical.to_vec(), "v")
            .unwrap();

        assert_eq!(by_int.root_hash(), by_bytes.root_hash());
    }

    #[test]
    fn to_list_returns_every_entry_once() {
        let map = MerkleMap::in_memory().insert_many(pairs(0..33)).unwrap();

        let mut listed = map.to_list().unwrap();
        listed.sort();
        let mut expected = pairs(0..33);
        expected.sort();

        assert_eq!(listed, expected);
    }
}
