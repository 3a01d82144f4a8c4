//! Main Crate Error

use crate::common::Id;

#[derive(thiserror::Error, Debug)]
/// Ringline crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error] from the node store.
    IO(#[from] std::io::Error),

    #[error("Failed to encode or decode node bytes: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// Indicates that an Id was built from a slice of the wrong length.
    #[error("Invalid Id size {0}, expected 32 bytes")]
    InvalidIdSize(usize),

    /// The requested root record does not exist in the store.
    ///
    /// Recoverable; the caller picked a root hash the store has never seen.
    #[error("Root {0:?} is not in the store")]
    RootNotFound(Id),

    /// A child pointer references a node the store cannot produce.
    ///
    /// Fatal invariant break: a persisted tree is incomplete.
    #[error("Store is missing merkle node {0:?}")]
    MissingNode(Id),

    /// Bytes read back from the store do not hash to their key.
    #[error("Node read back from the store does not match its key {0:?}")]
    HashMismatch(Id),

    /// A persisted node failed to decode into a known variant.
    #[error("Malformed merkle node encoding: {0}")]
    MalformedNode(&'static str),

    /// A proof does not bind to the root hashes it was checked against.
    #[error("Proof does not match the given root hashes")]
    BadProof,

    /// The caller dropped the search result channel mid-flight.
    #[error("Search cancelled by the caller")]
    SearchCancelled,
}
