//! K-bucket routing table over the 256-bit identifier ring.
//!
//! Peers are routed into a bucket-split trie by their item key (the hash of
//! their wallet address). Only the bucket holding the local node's own
//! anchor entry splits when full; every other full bucket silently drops
//! newcomers, so established contacts are never evicted by strangers.

use std::collections::BTreeMap;

use tracing::trace;

use crate::common::{unix_now, Id, NodeId, PeerItem, Prefix};

/// Bucket capacity. Fixed by the network protocol.
pub const K: usize = 20;

#[derive(Debug)]
/// The routing table: a trie of buckets anchored on the local node.
pub struct KBuckets {
    self_id: NodeId,
    self_key: Id,
    root: KTree,
}

#[derive(Debug)]
enum KTree {
    Leaf {
        prefix: Prefix,
        items: BTreeMap<Id, PeerItem>,
    },
    Inner {
        prefix: Prefix,
        zero: Box<KTree>,
        one: Box<KTree>,
    },
}

impl KBuckets {
    /// A fresh table holding only the local node's anchor entry.
    pub fn new(self_id: NodeId) -> KBuckets {
        let mut items = BTreeMap::new();
        items.insert(self_id.item_key(), PeerItem::self_marker(self_id));

        KBuckets {
            self_id,
            self_key: self_id.item_key(),
            root: KTree::Leaf {
                prefix: Prefix::EMPTY,
                items,
            },
        }
    }

    // === Getters ===

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Number of peers tracked, not counting the local anchor.
    pub fn size(&self) -> usize {
        self.root.count_peers()
    }

    /// Number of buckets the trie has split into.
    pub fn bucket_count(&self) -> usize {
        self.root.leaf_count()
    }

    pub fn member(&self, id: &NodeId) -> bool {
        self.item(id).is_some()
    }

    pub fn item(&self, id: &NodeId) -> Option<&PeerItem> {
        self.root.find(&id.item_key())
    }

    // === Public Methods ===

    /// Insert or replace a peer.
    ///
    /// A full bucket splits only while it holds the local anchor; otherwise
    /// the newcomer is dropped and the established contacts stay.
    pub fn insert_item(&mut self, item: PeerItem) {
        let item_key = item.item_key();
        self.root.insert(item, item_key, &self.self_key);
    }

    pub fn insert_items(&mut self, items: impl IntoIterator<Item = PeerItem>) {
        for item in items {
            self.insert_item(item);
        }
    }

    /// Replace a peer only if it is already tracked.
    pub fn update_item(&mut self, item: PeerItem) {
        let item_key = item.item_key();
        if self.root.find(&item_key).is_some() {
            self.root.insert(item, item_key, &self.self_key);
        }
    }

    /// Remove a peer. Removing the local anchor is a no-op.
    pub fn delete_item(&mut self, id: &NodeId) {
        let item_key = id.item_key();
        if item_key == self.self_key {
            return;
        }
        self.root.remove(&item_key);
    }

    /// The `n` live peers nearest to `key` by ring distance.
    ///
    /// Walks the trie key-side first, drawing from sibling subtrees only
    /// when the near side comes up short, then orders the gathered peers by
    /// distance. Disabled peers (`last_seen` in the future) and the local
    /// anchor are skipped.
    pub fn nearest_n(&self, key: &Id, n: usize) -> Vec<PeerItem> {
        let now = unix_now();
        let mut found = Vec::new();
        self.root.nearest(key, n, now, &mut found);

        found.sort_by_cached_key(|item| item.item_key().distance(key));
        found.truncate(n);
        found
    }

    /// [nearest_n](KBuckets::nearest_n) narrowed to peers at most as far
    /// from `key` as the local node itself.
    pub fn nearer_n(&self, key: &Id, n: usize) -> Vec<PeerItem> {
        let self_distance = self.self_key.distance(key);

        self.nearest_n(key, n)
            .into_iter()
            .filter(|item| item.item_key().distance(key) <= self_distance)
            .collect()
    }

    /// Every entry in the table, the local anchor included.
    pub fn to_list(&self) -> Vec<PeerItem> {
        let mut out = Vec::new();
        self.root.collect(&mut out);
        out.into_iter().map(|(_, item)| item).collect()
    }

    /// All peers except `pivot`, ordered around the ring: ascending by item
    /// key, starting from the smallest key strictly greater than the pivot.
    pub fn to_ring_list(&self, pivot: &Id) -> Vec<PeerItem> {
        let mut entries = Vec::new();
        self.root.collect(&mut entries);

        // In-order trie traversal already yields ascending keys.
        entries.retain(|(key, item)| key != pivot && !item.is_self());

        let start = entries
            .iter()
            .position(|(key, _)| key > pivot)
            .unwrap_or(0);
        entries.rotate_left(start);

        entries.into_iter().map(|(_, item)| item).collect()
    }

    /// The `n` ring successors of `pivot`.
    pub fn next_n(&self, pivot: &Id, n: usize) -> Vec<PeerItem> {
        self.to_ring_list(pivot).into_iter().take(n).collect()
    }

    /// The `n` ring predecessors of `pivot`, nearest first.
    pub fn prev_n(&self, pivot: &Id, n: usize) -> Vec<PeerItem> {
        self.to_ring_list(pivot).into_iter().rev().take(n).collect()
    }
}

impl KTree {
    fn insert(&mut self, item: PeerItem, item_key: Id, self_key: &Id) {
        match self {
            KTree::Leaf { prefix, items } => {
                if items.contains_key(&item_key) || items.len() < K {
                    items.insert(item_key, item);
                    return;
                }

                if !items.contains_key(self_key) {
                    trace!(key = ?item_key, "Bucket full, dropping peer");
                    return;
                }

                // Split the self bucket and route everything one level down.
                trace!(prefix = ?prefix, "Splitting self bucket");

                let split_depth = prefix.len();
                let mut zero = BTreeMap::new();
                let mut one = BTreeMap::new();
                for (key, existing) in std::mem::take(items) {
                    if key.bit(split_depth) {
                        one.insert(key, existing);
                    } else {
                        zero.insert(key, existing);
                    }
                }

                let prefix = *prefix;
                *self = KTree::Inner {
                    zero: Box::new(KTree::Leaf {
                        prefix: prefix.child(false),
                        items: zero,
                    }),
                    one: Box::new(KTree::Leaf {
                        prefix: prefix.child(true),
                        items: one,
                    }),
                    prefix,
                };

                self.insert(item, item_key, self_key);
            }
            KTree::Inner { prefix, zero, one } => {
                let child = if item_key.bit(prefix.len()) { one } else { zero };
                child.insert(item, item_key, self_key);
            }
        }
    }

    fn remove(&mut self, item_key: &Id) {
        match self {
            KTree::Leaf { items, .. } => {
                items.remove(item_key);
            }
            KTree::Inner { prefix, zero, one } => {
                let child = if item_key.bit(prefix.len()) { one } else { zero };
                child.remove(item_key);
            }
        }
    }

    fn find(&self, item_key: &Id) -> Option<&PeerItem> {
        match self {
            KTree::Leaf { items, .. } => items.get(item_key),
            KTree::Inner { prefix, zero, one } => {
                let child = if item_key.bit(prefix.len()) { one } else { zero };
                child.find(item_key)
            }
        }
    }

    fn nearest(&self, key: &Id, n: usize, now: i64, out: &mut Vec<PeerItem>) {
        match self {
            KTree::Leaf { items, .. } => {
                out.extend(
                    items
                        .values()
                        .filter(|item| !item.is_self() && !item.is_disabled(now))
                        .cloned(),
                );
            }
            KTree::Inner { prefix, zero, one } => {
                let (near, far) = if key.bit(prefix.len()) {
                    (one, zero)
                } else {
                    (zero, one)
                };

                let before = out.len();
                near.nearest(key, n, now, out);
                if out.len() - before < n {
                    far.nearest(key, n, now, out);
                }
            }
        }
    }

    fn collect(&self, out: &mut Vec<(Id, PeerItem)>) {
        match self {
            KTree::Leaf { items, .. } => {
                out.extend(items.iter().map(|(key, item)| (*key, item.clone())));
            }
            KTree::Inner { zero, one, .. } => {
                zero.collect(out);
                one.collect(out);
            }
        }
    }

    fn count_peers(&self) -> usize {
        match self {
            KTree::Leaf { items, .. } => {
                items.values().filter(|item| !item.is_self()).count()
            }
            KTree::Inner { zero, one, .. } => zero.count_peers() + one.count_peers(),
        }
    }

    fn leaf_count(&self) -> usize {
        match self {
            KTree::Leaf { .. } => 1,
            KTree::Inner { zero, one, .. } => zero.leaf_count() + one.leaf_count(),
        }
    }

    #[cfg(test)]
    fn max_bucket_size(&self) -> usize {
        match self {
            KTree::Leaf { items, .. } => items.len(),
            KTree::Inner { zero, one, .. } => zero.max_bucket_size().max(one.max_bucket_size()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::Distance;

    fn table_with(peers: &[PeerItem]) -> KBuckets {
        let mut table = KBuckets::new(NodeId::random());
        table.insert_items(peers.iter().cloned());
        table
    }

    fn brute_force_nearest(peers: &[PeerItem], key: &Id, n: usize) -> Vec<Id> {
        let mut keys: Vec<(Distance, Id)> = peers
            .iter()
            .map(|item| (item.item_key().distance(key), item.item_key()))
            .collect();
        keys.sort();
        keys.into_iter().take(n).map(|(_, key)| key).collect()
    }

    #[test]
    fn new_table_holds_only_self() {
        let self_id = NodeId::random();
        let table = KBuckets::new(self_id);

        assert!(table.member(&self_id));
        assert_eq!(table.size(), 0);
        assert_eq!(table.bucket_count(), 1);
        assert!(table.nearest_n(&Id::random(), 10).is_empty());
    }

    #[test]
    fn self_survives_saturation_and_deletion() {
        let self_id = NodeId::random();
        let mut table = KBuckets::new(self_id);

        for _ in 0..100 {
            table.insert_item(PeerItem::random());
        }

        table.delete_item(&self_id);

        assert!(table.member(&self_id));
        assert!(table.bucket_count() > 1, "self bucket must have split");
    }

    #[test]
    fn no_bucket_ever_exceeds_k() {
        let mut table = KBuckets::new(NodeId::random());

        for _ in 0..500 {
            table.insert_item(PeerItem::random());
        }

        assert!(table.root.max_bucket_size() <= K);
        assert!(table.size() <= 500);
    }

    #[test]
    fn insert_replaces_existing_entries() {
        let mut table = KBuckets::new(NodeId::random());
        let peer = PeerItem::random();

        table.insert_item(peer.clone());
        table.insert_item(peer.clone().with_last_seen(peer.last_seen + 100));

        assert_eq!(table.size(), 1);
        assert_eq!(
            table.item(&peer.id).map(|item| item.last_seen),
            Some(peer.last_seen + 100)
        );
    }

    #[test]
    fn update_item_ignores_unknown_peers() {
        let mut table = KBuckets::new(NodeId::random());

        table.update_item(PeerItem::random());

        assert_eq!(table.size(), 0);
    }

    #[test]
    fn delete_item_removes_peers() {
        let mut table = KBuckets::new(NodeId::random());
        let peer = PeerItem::random();

        table.insert_item(peer.clone());
        assert!(table.member(&peer.id));

        table.delete_item(&peer.id);
        assert!(!table.member(&peer.id));
        assert_eq!(table.size(), 0);
    }

    #[test]
    fn nearest_n_is_exact_on_an_unsplit_table() {
        let peers: Vec<PeerItem> = (0..10).map(|_| PeerItem::random()).collect();
        let table = table_with(&peers);
        let key = Id::random();

        let nearest: Vec<Id> = table
            .nearest_n(&key, 5)
            .iter()
            .map(|item| item.item_key())
            .collect();

        assert_eq!(nearest, brute_force_nearest(&peers, &key, 5));
    }

    #[test]
    fn nearest_n_returns_min_of_n_and_live_peers() {
        let peers: Vec<PeerItem> = (0..60).map(|_| PeerItem::random()).collect();
        let table = table_with(&peers);
        let key = Id::random();
        let live = table.size();

        assert_eq!(table.nearest_n(&key, 7).len(), 7.min(live));
        assert_eq!(table.nearest_n(&key, 1000).len(), live);

        // Sorted by distance, nearest first.
        let distances: Vec<Distance> = table
            .nearest_n(&key, 1000)
            .iter()
            .map(|item| item.item_key().distance(&key))
            .collect();
        let mut sorted = distances.clone();
        sorted.sort();
        assert_eq!(distances, sorted);
    }

    #[test]
    fn disabled_peers_are_hidden_from_lookups() {
        let mut table = KBuckets::new(NodeId::random());
        let mut sick = PeerItem::random();
        let healthy = PeerItem::random();

        sick.penalize(unix_now(), 3600);
        table.insert_item(sick.clone());
        table.insert_item(healthy.clone());

        let found: Vec<NodeId> = table
            .nearest_n(&Id::random(), 10)
            .iter()
            .map(|item| item.id)
            .collect();

        assert_eq!(found, vec![healthy.id]);
        // Still a member, just not offered to lookups.
        assert!(table.member(&sick.id));
    }

    #[test]
    fn nearer_n_keeps_peers_within_the_self_distance() {
        let peers: Vec<PeerItem> = (0..40).map(|_| PeerItem::random()).collect();
        let table = table_with(&peers);
        let key = Id::random();
        let self_distance = table.self_id().item_key().distance(&key);

        let nearer = table.nearer_n(&key, 40);

        for item in &nearer {
            assert!(item.item_key().distance(&key) <= self_distance);
        }

        let expected = table
            .nearest_n(&key, 40)
            .into_iter()
            .filter(|item| item.item_key().distance(&key) <= self_distance)
            .count();
        assert_eq!(nearer.len(), expected);
    }

    #[test]
    fn ring_list_is_rotated_and_ascending() {
        let peers: Vec<PeerItem> = (0..15).map(|_| PeerItem::random()).collect();
        let table = table_with(&peers);
        let pivot = table.self_id().item_key();

        let ring = table.to_ring_list(&pivot);
        let keys: Vec<Id> = ring.iter().map(|item| item.item_key()).collect();

        assert_eq!(keys.len(), table.size());

        // Ascending except for a single wrap back past the pivot.
        let descents = keys.windows(2).filter(|pair| pair[0] > pair[1]).count();
        assert!(descents <= 1);

        if let Some(first) = keys.first() {
            for key in &keys {
                if key > &pivot {
                    assert!(first > &pivot, "rotation must start after the pivot");
                    break;
                }
            }
        }

        assert_eq!(table.next_n(&pivot, 3), ring[..3.min(ring.len())].to_vec());

        let mut reversed = ring.clone();
        reversed.reverse();
        assert_eq!(table.prev_n(&pivot, 3), reversed[..3.min(ring.len())].to_vec());
    }
}
