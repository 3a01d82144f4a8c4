#![doc = include_str!("../README.md")]

mod common;
mod error;

pub mod enc;
pub mod kbuckets;
pub mod merkle;
pub mod search;
pub mod transport;

pub use crate::common::{
    address_of, hash, unix_now, Distance, Id, NodeId, PeerItem, PeerObject, Prefix,
    ServerDescriptor,
};
pub use crate::kbuckets::{KBuckets, K};
pub use crate::merkle::{MerkleMap, LEAF_SIZE};
pub use crate::search::{find, Search, SearchResult, ALPHA};
pub use crate::transport::{Command, Response, Transport, TransportError};
pub use error::Error;

/// Alias Result to be the crate Result.
pub type Result<T, E = Error> = core::result::Result<T, E>;
