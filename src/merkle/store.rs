//! The content-addressed node store and its in-memory reference implementation.
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use lru::LruCache;

use super::node::{decode_node, Tree};
use crate::common::{hash, Id};
use crate::{Error, Result};

/// How many decoded nodes to keep around between store reads.
const MAX_CACHED_NODES: usize = 1000;

/// Durable key/value records for serialised merkle nodes.
///
/// Interior records are content-addressed (`key = hash(bytes)`); the root
/// record additionally maps a tree's root hash to its root node. Writes must
/// be durable upon return and idempotent: writing a key that already holds
/// the same bytes is a no-op.
pub trait Store: Send + Sync {
    /// Fetch the record under `key`, or `None` if it was never written.
    fn read(&self, key: &Id) -> Result<Option<Bytes>>;

    /// Persist `bytes` under `key`.
    fn write(&self, key: &Id, bytes: &[u8]) -> Result<()>;
}

#[derive(Debug, Default)]
/// In-memory [Store], shared behind an `Arc` by tests and `in_memory` trees.
pub struct MemoryStore {
    records: Mutex<HashMap<Id, Bytes>>,
    writes: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of writes that actually created a record; repeats don't count.
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap()
    }
}

impl Store for MemoryStore {
    fn read(&self, key: &Id) -> Result<Option<Bytes>> {
        Ok(self.records.lock().unwrap().get(key).cloned())
    }

    fn write(&self, key: &Id, bytes: &[u8]) -> Result<()> {
        let mut records = self.records.lock().unwrap();

        if !records.contains_key(key) {
            records.insert(*key, Bytes::copy_from_slice(bytes));
            *self.writes.lock().unwrap() += 1;
        }

        Ok(())
    }
}

/// Store access with read-back verification and a decoded-node cache.
pub(crate) struct TreeIo {
    store: Arc<dyn Store>,
    cache: Mutex<LruCache<Id, Tree>>,
}

impl TreeIo {
    pub fn new(store: Arc<dyn Store>) -> TreeIo {
        TreeIo::with_capacity(store, MAX_CACHED_NODES)
    }

    pub fn with_capacity(store: Arc<dyn Store>, capacity: usize) -> TreeIo {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");

        TreeIo {
            store,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Load a content-addressed node, verifying the bytes against their key.
    pub fn read_node(&self, key: &Id) -> Result<Tree> {
        if let Some(tree) = self.cache.lock().unwrap().get(key) {
            return Ok(tree.clone());
        }

        let bytes = self
            .store
            .read(key)?
            .ok_or(Error::MissingNode(*key))?;

        if hash(&bytes) != *key {
            return Err(Error::HashMismatch(*key));
        }

        let tree = decode_node(&bytes)?;
        self.cache.lock().unwrap().put(*key, tree.clone());

        Ok(tree)
    }

    /// Persist a node under its content key and remember the decoded form.
    pub fn write_node(&self, key: &Id, bytes: &[u8], tree: &Tree) -> Result<()> {
        self.store.write(key, bytes)?;
        self.cache.lock().unwrap().put(*key, tree.clone());
        Ok(())
    }

    /// Persist the root record: `root_hash -> serialised root node`.
    pub fn write_root_record(&self, root_hash: &Id, bytes: &[u8]) -> Result<()> {
        self.store.write(root_hash, bytes)
    }

    /// Load the node recorded under a root hash, if any, along with its
    /// content key.
    pub fn read_root_record(&self, root_hash: &Id) -> Result<Option<(Id, Tree)>> {
        match self.store.read(root_hash)? {
            None => Ok(None),
            Some(bytes) => {
                let tree = decode_node(&bytes)?;
                Ok(Some((hash(&bytes), tree)))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_store_writes_are_idempotent() {
        let store = MemoryStore::new();
        let key = hash(b"record");

        store.write(&key, b"payload").unwrap();
        store.write(&key, b"payload").unwrap();

        assert_eq!(store.write_count(), 1);
        assert_eq!(store.read(&key).unwrap().unwrap(), &b"payload"[..]);
    }

    #[test]
    fn read_node_rejects_corrupt_bytes() {
        let store = Arc::new(MemoryStore::new());
        let key = hash(b"not the payload");
        store.write(&key, b"payload").unwrap();

        let io = TreeIo::new(store);

        assert!(matches!(
            io.read_node(&key),
            Err(Error::HashMismatch(k)) if k == key
        ));
    }

    #[test]
    fn read_node_reports_missing_children() {
        let io = TreeIo::new(Arc::new(MemoryStore::new()));
        let key = hash(b"absent");

        assert!(matches!(
            io.read_node(&key),
            Err(Error::MissingNode(k)) if k == key
        ));
    }
}
