//! Inclusion and absence proofs over the merkle map.
//!
//! A proof is the key's root-to-leaf descent: at every inner node the side
//! the key routes through recurses and the other side contributes its lane
//! hash at the key's slot, and the terminal leaf contributes the full slot
//! group the key would live in. Folding the proof back up reproduces the
//! root's lane hash, so a verifier needs nothing but the proof, the key and
//! the tree's [root_hashes](super::MerkleMap::root_hashes).

use super::node::{child_vector, group_term, hashes_root, lane_hash, slot, Child, Tree};
use super::store::TreeIo;
use super::{Key, Value, LEAF_SIZE};
use crate::common::{Id, Prefix};
use crate::enc;
use crate::{Error, Result};

#[derive(Clone, Debug)]
/// One descent step of a proof, or its terminal witness.
pub enum Proof {
    /// The key routes into the left child; `right` is the sibling's lane hash.
    Left { down: Box<Proof>, right: Id },
    /// The key routes into the right child; `left` is the sibling's lane hash.
    Right { left: Id, down: Box<Proof> },
    /// The slot group at the terminal leaf.
    Leaf(SlotGroup),
}

#[derive(Clone, Debug)]
/// Every entry of the terminal leaf that shares the key's slot, in key
/// order, plus the group header fields.
pub struct SlotGroup {
    pub slot: u8,
    pub prefix: Prefix,
    pub entries: Vec<(Key, Value)>,
}

/// Build the proof for `key` by descending its hash path.
pub(crate) fn prove(io: &TreeIo, tree: &Tree, key: &Key) -> Result<Proof> {
    let key_hash = key.slot_hash();
    let slot_index = slot(&key_hash);

    walk(io, tree, &key_hash, slot_index)
}

fn walk(io: &TreeIo, tree: &Tree, key_hash: &Id, slot_index: usize) -> Result<Proof> {
    match tree {
        Tree::Leaf { prefix, bucket, .. } => {
            let entries = bucket
                .iter()
                .filter(|(key, _)| slot(&key.slot_hash()) == slot_index)
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();

            Ok(Proof::Leaf(SlotGroup {
                slot: slot_index as u8,
                prefix: *prefix,
                entries,
            }))
        }
        Tree::Inner {
            prefix,
            left,
            right,
            ..
        } => {
            let bit = key_hash.bit(prefix.len());
            let (near, far) = if bit { (right, left) } else { (left, right) };

            let sibling = child_vector(io, far)?.hashes[slot_index];

            let down = match near {
                Child::Ram(tree) => walk(io, tree, key_hash, slot_index)?,
                Child::Stored(store_key) => {
                    walk(io, &io.read_node(store_key)?, key_hash, slot_index)?
                }
            };

            Ok(if bit {
                Proof::Right {
                    left: sibling,
                    down: Box::new(down),
                }
            } else {
                Proof::Left {
                    down: Box::new(down),
                    right: sibling,
                }
            })
        }
    }
}

/// Check `proof` against a tree's root hashes and return what it proves for
/// `key`: `Some(value)` for inclusion, `None` for absence.
///
/// Fails with [Error::BadProof] when the proof does not fold back to
/// `root_hashes`, or when its shape does not follow the key's hash path.
pub fn verify(
    proof: &Proof,
    root_hashes: &[Id; LEAF_SIZE],
    key: &Key,
) -> Result<Option<Value>> {
    let key_hash = key.slot_hash();
    let slot_index = slot(&key_hash);

    let (lane, value) = fold(proof, key, &key_hash, slot_index, 0)?;

    if lane != root_hashes[slot_index] {
        return Err(Error::BadProof);
    }

    Ok(value)
}

/// The 32-byte root commitment a hash vector stands for; links the vector a
/// proof was verified against back to [root_hash](super::MerkleMap::root_hash).
pub fn root_hash_of(root_hashes: &[Id; LEAF_SIZE]) -> Result<Id> {
    hashes_root(root_hashes)
}

fn fold(
    proof: &Proof,
    key: &Key,
    key_hash: &Id,
    slot_index: usize,
    depth: usize,
) -> Result<(Id, Option<Value>)> {
    match proof {
        Proof::Left { down, right } => {
            if key_hash.bit(depth) {
                return Err(Error::BadProof);
            }
            let (lane, value) = fold(down, key, key_hash, slot_index, depth + 1)?;
            Ok((lane_hash(&lane, right)?, value))
        }
        Proof::Right { left, down } => {
            if !key_hash.bit(depth) {
                return Err(Error::BadProof);
            }
            let (lane, value) = fold(down, key, key_hash, slot_index, depth + 1)?;
            Ok((lane_hash(left, &lane)?, value))
        }
        Proof::Leaf(group) => {
            if group.slot as usize != slot_index
                || group.prefix.len() != depth
                || !group.prefix.matches(key_hash)
            {
                return Err(Error::BadProof);
            }

            let entries = group.entries.iter().map(|(key, value)| (key, value));
            let lane = enc::hash_of(&group_term(slot_index, &group.prefix, entries))?;

            let value = group
                .entries
                .iter()
                .find(|(candidate, _)| candidate == key)
                .map(|(_, value)| value.clone());

            Ok((lane, value))
        }
    }
}
