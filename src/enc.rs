//! Deterministic term encoding for merkle signatures and node persistence.
//!
//! Everything the tree hashes or persists is built from three term shapes:
//! integers, binaries and lists. Bencode covers exactly those and encodes
//! them deterministically, so the same logical term always produces the same
//! bytes on every peer. Dictionaries are never used; ordered data is fed in
//! as lists that the callers keep sorted.

pub use serde_bencode::value::Value as Term;

use crate::common::{hash, Id};
use crate::Result;

/// An integer term.
pub fn int(value: i64) -> Term {
    Term::Int(value)
}

/// A binary term.
pub fn bytes(value: impl Into<Vec<u8>>) -> Term {
    Term::Bytes(value.into())
}

/// A list term.
pub fn list(items: Vec<Term>) -> Term {
    Term::List(items)
}

/// Encode a term to its canonical byte form.
pub fn encode(term: &Term) -> Result<Vec<u8>> {
    Ok(serde_bencode::to_bytes(term)?)
}

/// Decode a canonical byte form back into a term.
pub fn decode(bytes: &[u8]) -> Result<Term> {
    Ok(serde_bencode::from_bytes(bytes)?)
}

/// The content hash of a term: `hash(encode(term))`.
pub fn hash_of(term: &Term) -> Result<Id> {
    Ok(hash(&encode(term)?))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let term = list(vec![
            int(7),
            bytes(b"key".to_vec()),
            list(vec![bytes(b"value".to_vec()), int(-1)]),
        ]);

        let encoded = encode(&term).unwrap();
        let decoded = decode(&encoded).unwrap();

        assert_eq!(encode(&decoded).unwrap(), encoded);
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = list(vec![int(1), bytes(b"x".to_vec())]);
        let b = list(vec![int(1), bytes(b"x".to_vec())]);

        assert_eq!(encode(&a).unwrap(), encode(&b).unwrap());
        assert_eq!(hash_of(&a).unwrap(), hash_of(&b).unwrap());
    }

    #[test]
    fn distinct_terms_hash_apart() {
        let empty = list(vec![]);
        let zero = list(vec![int(0)]);

        assert_ne!(hash_of(&empty).unwrap(), hash_of(&zero).unwrap());
    }
}
