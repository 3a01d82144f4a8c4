//! The RPC contract between the search driver and the network layer.
//!
//! The core issues exactly two commands; everything about framing, sockets
//! and per-call timeouts belongs to the [Transport] implementation.

use bytes::Bytes;

use crate::common::{Id, PeerItem};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// What a search asks a remote peer for.
pub enum Command {
    /// The peers nearest to the key that the remote node knows about.
    FindNode,
    /// A stored value, falling back to nearest peers when the node has none.
    FindValue,
}

#[derive(Clone, Debug)]
/// What a remote peer answered.
pub enum Response {
    /// Up to K peers nearer to the key.
    Nodes(Vec<PeerItem>),
    /// A stored value; terminal for the search that asked.
    Value(Bytes),
}

#[derive(thiserror::Error, Debug)]
/// A failed RPC. The search driver treats any of these as an empty node
/// list; retries and peer penalties belong to the caller.
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Transport failure: {0}")]
    Other(String),
}

/// Delivers `find_node` / `find_value` calls to remote peers.
///
/// Implementations must support [ALPHA](crate::search::ALPHA) concurrent
/// outstanding calls per search and enforce a per-call timeout.
pub trait Transport: Send + Sync + 'static {
    fn rpc(&self, peer: &PeerItem, command: Command, key: &Id)
        -> Result<Response, TransportError>;
}
