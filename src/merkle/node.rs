//! Tree node variants, hash-vector computation and node persistence.
use std::collections::BTreeMap;

use super::store::TreeIo;
use super::{Key, Value, LEAF_SIZE};
use crate::common::{hash, Id, Prefix};
use crate::enc::{self, Term};
use crate::{Error, Result};

/// Node encoding tags.
const TAG_LEAF: i64 = 0;
const TAG_INNER: i64 = 1;

#[derive(Clone, Debug)]
/// A merkle tree node, either resident or reattached from the store.
pub(crate) enum Tree {
    Leaf {
        prefix: Prefix,
        bucket: BTreeMap<Key, Value>,
        cache: Option<HashVector>,
    },
    Inner {
        prefix: Prefix,
        left: Child,
        right: Child,
        cache: Option<HashVector>,
    },
}

#[derive(Clone, Debug)]
/// A child subtree: owned in RAM during a mutation, or frozen in the store.
pub(crate) enum Child {
    Ram(Box<Tree>),
    Stored(Id),
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// A node's merkle signature: one lane hash per slot plus the key count
/// beneath the node.
pub(crate) struct HashVector {
    pub hashes: [Id; LEAF_SIZE],
    pub count: usize,
}

/// The slot a key's hash lands in within a leaf's hash vector.
pub(crate) fn slot(key_hash: &Id) -> usize {
    key_hash.0[31] as usize % LEAF_SIZE
}

/// The empty tree: a single leaf with no prefix and no entries, plus its
/// signature and root hash.
pub(crate) fn empty_root() -> (Tree, HashVector, Id) {
    let prefix = Prefix::EMPTY;
    let bucket = BTreeMap::new();

    // The empty leaf is a finite term over the encoder's own value types;
    // encoding it cannot fail.
    let hv = compute_leaf_vector(&prefix, &bucket).expect("encoding an empty leaf cannot fail");
    let root_hash = hashes_root(&hv.hashes).expect("encoding an empty leaf cannot fail");

    let tree = Tree::Leaf {
        prefix,
        bucket,
        cache: Some(hv.clone()),
    };

    (tree, hv, root_hash)
}

impl Tree {
    pub fn cache(&self) -> Option<&HashVector> {
        match self {
            Tree::Leaf { cache, .. } => cache.as_ref(),
            Tree::Inner { cache, .. } => cache.as_ref(),
        }
    }
}

// === Hash vectors ===

fn prefix_term(prefix: &Prefix) -> Term {
    enc::list(vec![
        enc::int(prefix.len() as i64),
        enc::bytes(prefix.as_bytes()),
    ])
}

fn decode_prefix(term: &Term) -> Result<Prefix> {
    let items = as_list(term)?;
    if items.len() != 2 {
        return Err(Error::MalformedNode("prefix is not a two element list"));
    }
    let len = as_int(&items[0])?;
    let bytes = as_bytes(&items[1])?;

    Prefix::from_bytes(bytes, len as usize).ok_or(Error::MalformedNode("prefix bits out of range"))
}

/// One slot group: the `[slot, prefix]` header followed by the `(key, value)`
/// pairs routed into the slot, in key order.
pub(crate) fn group_term<'a>(
    slot_index: usize,
    prefix: &Prefix,
    entries: impl Iterator<Item = (&'a Key, &'a Value)>,
) -> Term {
    let mut items = vec![enc::int(slot_index as i64), prefix_term(prefix)];

    for (key, value) in entries {
        items.push(enc::list(vec![
            enc::bytes(key.as_bytes()),
            enc::bytes(value.as_bytes()),
        ]));
    }

    enc::list(items)
}

/// A lane of an inner node: the hash of the two child lane hashes.
pub(crate) fn lane_hash(left: &Id, right: &Id) -> Result<Id> {
    enc::hash_of(&enc::list(vec![
        enc::bytes(left.to_vec()),
        enc::bytes(right.to_vec()),
    ]))
}

pub(crate) fn compute_leaf_vector(
    prefix: &Prefix,
    bucket: &BTreeMap<Key, Value>,
) -> Result<HashVector> {
    let mut hashes = [Id([0; 32]); LEAF_SIZE];

    for (index, lane) in hashes.iter_mut().enumerate() {
        let entries = bucket
            .iter()
            .filter(|(key, _)| slot(&key.slot_hash()) == index);
        *lane = enc::hash_of(&group_term(index, prefix, entries))?;
    }

    Ok(HashVector {
        hashes,
        count: bucket.len(),
    })
}

pub(crate) fn compute_inner_vector(
    left: &HashVector,
    right: &HashVector,
) -> Result<HashVector> {
    let mut hashes = [Id([0; 32]); LEAF_SIZE];

    for (index, lane) in hashes.iter_mut().enumerate() {
        *lane = lane_hash(&left.hashes[index], &right.hashes[index])?;
    }

    Ok(HashVector {
        hashes,
        count: left.count + right.count,
    })
}

/// The 32-byte root commitment over a full hash vector.
pub(crate) fn hashes_root(hashes: &[Id; LEAF_SIZE]) -> Result<Id> {
    let items = hashes.iter().map(|h| enc::bytes(h.to_vec())).collect();
    enc::hash_of(&enc::list(items))
}

// === Persistence ===

/// Serialise a frozen node (children stored, cache present).
pub(crate) fn encode_node(tree: &Tree) -> Result<Vec<u8>> {
    let hv_term = |hv: &HashVector| -> Term {
        enc::list(hv.hashes.iter().map(|h| enc::bytes(h.to_vec())).collect())
    };

    match tree {
        Tree::Leaf {
            prefix,
            bucket,
            cache: Some(hv),
        } => {
            let entries = bucket
                .iter()
                .map(|(key, value)| {
                    enc::list(vec![
                        enc::bytes(key.as_bytes()),
                        enc::bytes(value.as_bytes()),
                    ])
                })
                .collect();

            enc::encode(&enc::list(vec![
                enc::int(TAG_LEAF),
                prefix_term(prefix),
                hv_term(hv),
                enc::list(entries),
            ]))
        }
        Tree::Inner {
            prefix,
            left: Child::Stored(left),
            right: Child::Stored(right),
            cache: Some(hv),
        } => enc::encode(&enc::list(vec![
            enc::int(TAG_INNER),
            prefix_term(prefix),
            hv_term(hv),
            enc::int(hv.count as i64),
            enc::bytes(left.to_vec()),
            enc::bytes(right.to_vec()),
        ])),
        _ => Err(Error::MalformedNode("node is not frozen")),
    }
}

pub(crate) fn decode_node(bytes: &[u8]) -> Result<Tree> {
    let term = enc::decode(bytes)?;
    let items = as_list(&term)?;

    let tag = as_int(items.first().ok_or(Error::MalformedNode("empty node list"))?)?;

    match tag {
        TAG_LEAF => {
            if items.len() != 4 {
                return Err(Error::MalformedNode("leaf is not a four element list"));
            }
            let prefix = decode_prefix(&items[1])?;
            let hashes = decode_hashes(&items[2])?;

            let mut bucket = BTreeMap::new();
            for entry in as_list(&items[3])? {
                let pair = as_list(entry)?;
                if pair.len() != 2 {
                    return Err(Error::MalformedNode("entry is not a pair"));
                }
                bucket.insert(
                    Key::from(as_bytes(&pair[0])?.to_vec()),
                    Value::from(as_bytes(&pair[1])?.to_vec()),
                );
            }

            let count = bucket.len();
            Ok(Tree::Leaf {
                prefix,
                bucket,
                cache: Some(HashVector { hashes, count }),
            })
        }
        TAG_INNER => {
            if items.len() != 6 {
                return Err(Error::MalformedNode("inner is not a six element list"));
            }
            let prefix = decode_prefix(&items[1])?;
            let hashes = decode_hashes(&items[2])?;
            let count = as_int(&items[3])?;
            let left = Id::from_bytes(as_bytes(&items[4])?)?;
            let right = Id::from_bytes(as_bytes(&items[5])?)?;

            if count <= LEAF_SIZE as i64 {
                return Err(Error::MalformedNode("inner node below the leaf capacity"));
            }

            Ok(Tree::Inner {
                prefix,
                left: Child::Stored(left),
                right: Child::Stored(right),
                cache: Some(HashVector {
                    hashes,
                    count: count as usize,
                }),
            })
        }
        _ => Err(Error::MalformedNode("unknown node tag")),
    }
}

fn decode_hashes(term: &Term) -> Result<[Id; LEAF_SIZE]> {
    let items = as_list(term)?;
    if items.len() != LEAF_SIZE {
        return Err(Error::MalformedNode("hash vector is not 16 lanes"));
    }

    let mut hashes = [Id([0; 32]); LEAF_SIZE];
    for (lane, item) in hashes.iter_mut().zip(items) {
        *lane = Id::from_bytes(as_bytes(item)?)?;
    }

    Ok(hashes)
}

fn as_list(term: &Term) -> Result<&Vec<Term>> {
    match term {
        Term::List(items) => Ok(items),
        _ => Err(Error::MalformedNode("expected a list")),
    }
}

fn as_int(term: &Term) -> Result<i64> {
    match term {
        Term::Int(value) if *value >= 0 => Ok(*value),
        Term::Int(_) => Err(Error::MalformedNode("expected a non-negative integer")),
        _ => Err(Error::MalformedNode("expected an integer")),
    }
}

fn as_bytes(term: &Term) -> Result<&[u8]> {
    match term {
        Term::Bytes(bytes) => Ok(bytes),
        _ => Err(Error::MalformedNode("expected a binary")),
    }
}

// === Reads ===

/// Look a key up along its hash path.
pub(crate) fn get_at(io: &TreeIo, tree: &Tree, key_hash: &Id, key: &Key) -> Result<Option<Value>> {
    match tree {
        Tree::Leaf { bucket, .. } => Ok(bucket.get(key).cloned()),
        Tree::Inner {
            prefix,
            left,
            right,
            ..
        } => {
            let child = if key_hash.bit(prefix.len()) { right } else { left };
            match child {
                Child::Ram(tree) => get_at(io, tree, key_hash, key),
                Child::Stored(store_key) => {
                    let tree = io.read_node(store_key)?;
                    get_at(io, &tree, key_hash, key)
                }
            }
        }
    }
}

/// All entries, left-to-right.
pub(crate) fn entries_at(io: &TreeIo, tree: &Tree, out: &mut Vec<(Key, Value)>) -> Result<()> {
    match tree {
        Tree::Leaf { bucket, .. } => {
            out.extend(bucket.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(())
        }
        Tree::Inner { left, right, .. } => {
            child_entries(io, left, out)?;
            child_entries(io, right, out)
        }
    }
}

fn child_entries(io: &TreeIo, child: &Child, out: &mut Vec<(Key, Value)>) -> Result<()> {
    match child {
        Child::Ram(tree) => entries_at(io, tree, out),
        Child::Stored(store_key) => {
            let tree = io.read_node(store_key)?;
            entries_at(io, &tree, out)
        }
    }
}

/// Number of leaves beneath the node.
pub(crate) fn leaf_count(io: &TreeIo, tree: &Tree) -> Result<usize> {
    match tree {
        Tree::Leaf { .. } => Ok(1),
        Tree::Inner { left, right, .. } => {
            let count = |child: &Child| -> Result<usize> {
                match child {
                    Child::Ram(tree) => leaf_count(io, tree),
                    Child::Stored(store_key) => leaf_count(io, &io.read_node(store_key)?),
                }
            };
            Ok(count(left)? + count(right)?)
        }
    }
}

/// The hash vector of a child, reading it back if it lives in the store.
pub(crate) fn child_vector(io: &TreeIo, child: &Child) -> Result<HashVector> {
    match child {
        Child::Stored(store_key) => {
            let tree = io.read_node(store_key)?;
            tree.cache()
                .cloned()
                .ok_or(Error::MalformedNode("stored node without a hash vector"))
        }
        Child::Ram(tree) => match tree.cache() {
            Some(hv) => Ok(hv.clone()),
            None => Err(Error::MalformedNode("unflushed child in a frozen tree")),
        },
    }
}

fn child_count(io: &TreeIo, child: &Child) -> Result<usize> {
    match child {
        Child::Ram(tree) => tree_count(io, tree),
        Child::Stored(store_key) => tree_count(io, &io.read_node(store_key)?),
    }
}

fn tree_count(io: &TreeIo, tree: &Tree) -> Result<usize> {
    match tree {
        Tree::Leaf { bucket, .. } => Ok(bucket.len()),
        Tree::Inner { cache: Some(hv), .. } => Ok(hv.count),
        Tree::Inner {
            left,
            right,
            cache: None,
            ..
        } => Ok(child_count(io, left)? + child_count(io, right)?),
    }
}

// === Mutations ===

/// Take ownership of a child for mutation, remembering where it came from so
/// an unchanged subtree can be put back without re-writing it.
fn resolve_owned(io: &TreeIo, child: Child) -> Result<(Tree, Option<Id>)> {
    match child {
        Child::Ram(tree) => Ok((*tree, None)),
        Child::Stored(store_key) => Ok((io.read_node(&store_key)?, Some(store_key))),
    }
}

fn restore_child(tree: Tree, origin: Option<Id>, changed: bool) -> Child {
    match (changed, origin) {
        (false, Some(store_key)) => Child::Stored(store_key),
        _ => Child::Ram(Box::new(tree)),
    }
}

/// Insert or replace a non-zero value. Returns the new subtree and whether
/// anything actually changed.
pub(crate) fn insert_at(
    io: &TreeIo,
    tree: Tree,
    key_hash: &Id,
    key: Key,
    value: Value,
) -> Result<(Tree, bool)> {
    match tree {
        Tree::Leaf {
            prefix,
            mut bucket,
            cache,
        } => {
            if bucket.get(&key) == Some(&value) {
                return Ok((Tree::Leaf { prefix, bucket, cache }, false));
            }

            bucket.insert(key, value);

            if bucket.len() > LEAF_SIZE {
                Ok((split_leaf(prefix, bucket), true))
            } else {
                Ok((
                    Tree::Leaf {
                        prefix,
                        bucket,
                        cache: None,
                    },
                    true,
                ))
            }
        }
        Tree::Inner {
            prefix,
            left,
            right,
            cache,
        } => {
            let bit = key_hash.bit(prefix.len());
            let (near, far) = if bit { (right, left) } else { (left, right) };

            let (near_tree, origin) = resolve_owned(io, near)?;
            let (near_tree, changed) = insert_at(io, near_tree, key_hash, key, value)?;
            let near = restore_child(near_tree, origin, changed);

            let (left, right) = if bit { (far, near) } else { (near, far) };
            let cache = if changed { None } else { cache };

            Ok((
                Tree::Inner {
                    prefix,
                    left,
                    right,
                    cache,
                },
                changed,
            ))
        }
    }
}

/// Remove a key. Inner nodes whose subtree shrinks to the leaf capacity are
/// collapsed back into a single leaf, bottom-up.
pub(crate) fn delete_at(io: &TreeIo, tree: Tree, key_hash: &Id, key: &Key) -> Result<(Tree, bool)> {
    match tree {
        Tree::Leaf {
            prefix,
            mut bucket,
            cache,
        } => {
            let changed = bucket.remove(key).is_some();
            let cache = if changed { None } else { cache };

            Ok((
                Tree::Leaf {
                    prefix,
                    bucket,
                    cache,
                },
                changed,
            ))
        }
        Tree::Inner {
            prefix,
            left,
            right,
            cache,
        } => {
            let bit = key_hash.bit(prefix.len());
            let (near, far) = if bit { (right, left) } else { (left, right) };

            let (near_tree, origin) = resolve_owned(io, near)?;
            let (near_tree, changed) = delete_at(io, near_tree, key_hash, key)?;
            let near = restore_child(near_tree, origin, changed);

            let (left, right) = if bit { (far, near) } else { (near, far) };

            if !changed {
                return Ok((
                    Tree::Inner {
                        prefix,
                        left,
                        right,
                        cache,
                    },
                    false,
                ));
            }

            if child_count(io, &left)? + child_count(io, &right)? <= LEAF_SIZE {
                let mut bucket = BTreeMap::new();
                collect_child(io, &left, &mut bucket)?;
                collect_child(io, &right, &mut bucket)?;

                return Ok((
                    Tree::Leaf {
                        prefix,
                        bucket,
                        cache: None,
                    },
                    true,
                ));
            }

            Ok((
                Tree::Inner {
                    prefix,
                    left,
                    right,
                    cache: None,
                },
                true,
            ))
        }
    }
}

/// Partition an overfull bucket by the next routing bit. Either side may
/// overflow again, so the split recurses.
fn split_leaf(prefix: Prefix, bucket: BTreeMap<Key, Value>) -> Tree {
    let mut zero = BTreeMap::new();
    let mut one = BTreeMap::new();

    for (key, value) in bucket {
        if key.slot_hash().bit(prefix.len()) {
            one.insert(key, value);
        } else {
            zero.insert(key, value);
        }
    }

    let child = |prefix: Prefix, bucket: BTreeMap<Key, Value>| -> Child {
        if bucket.len() > LEAF_SIZE {
            Child::Ram(Box::new(split_leaf(prefix, bucket)))
        } else {
            Child::Ram(Box::new(Tree::Leaf {
                prefix,
                bucket,
                cache: None,
            }))
        }
    };

    Tree::Inner {
        left: child(prefix.child(false), zero),
        right: child(prefix.child(true), one),
        prefix,
        cache: None,
    }
}

fn collect_child(io: &TreeIo, child: &Child, out: &mut BTreeMap<Key, Value>) -> Result<()> {
    let collect_tree = |tree: &Tree, out: &mut BTreeMap<Key, Value>| -> Result<()> {
        let mut entries = Vec::new();
        entries_at(io, tree, &mut entries)?;
        out.extend(entries);
        Ok(())
    };

    match child {
        Child::Ram(tree) => collect_tree(tree, out),
        Child::Stored(store_key) => collect_tree(&io.read_node(store_key)?, out),
    }
}

// === Flush ===

/// Freeze a mutated tree: recompute dirty hash vectors bottom-up, persist
/// every recomputed node under its content key, and replace owned children
/// with store pointers. Untouched subtrees are neither rehashed nor
/// rewritten.
pub(crate) fn flush(io: &TreeIo, tree: Tree) -> Result<(Id, HashVector, Tree)> {
    match tree {
        Tree::Leaf {
            prefix,
            bucket,
            cache,
        } => {
            let hv = match cache {
                Some(hv) => hv,
                None => compute_leaf_vector(&prefix, &bucket)?,
            };

            let node = Tree::Leaf {
                prefix,
                bucket,
                cache: Some(hv.clone()),
            };
            let bytes = encode_node(&node)?;
            let store_key = hash(&bytes);
            io.write_node(&store_key, &bytes, &node)?;

            Ok((store_key, hv, node))
        }
        Tree::Inner {
            prefix,
            left,
            right,
            cache,
        } => {
            let (left_key, left_hv) = flush_child(io, left)?;
            let (right_key, right_hv) = flush_child(io, right)?;

            let hv = match cache {
                Some(hv) => hv,
                None => compute_inner_vector(&left_hv, &right_hv)?,
            };

            let node = Tree::Inner {
                prefix,
                left: Child::Stored(left_key),
                right: Child::Stored(right_key),
                cache: Some(hv.clone()),
            };
            let bytes = encode_node(&node)?;
            let store_key = hash(&bytes);
            io.write_node(&store_key, &bytes, &node)?;

            Ok((store_key, hv, node))
        }
    }
}

fn flush_child(io: &TreeIo, child: Child) -> Result<(Id, HashVector)> {
    match child {
        Child::Stored(store_key) => {
            let hv = child_vector(io, &Child::Stored(store_key))?;
            Ok((store_key, hv))
        }
        Child::Ram(tree) => {
            let (store_key, hv, _) = flush(io, *tree)?;
            Ok((store_key, hv))
        }
    }
}
