//! Peer entries held in the routing table and handed to the search driver.
use std::fmt::{self, Debug, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use super::id::{hash, Id};

/// Wallet address length in bytes.
pub const ADDRESS_SIZE: usize = 20;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
/// A peer's wallet public key; the stable identity of a node.
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    pub fn random() -> NodeId {
        NodeId(Id::random().0)
    }

    /// The ring position of this node: the hash of its wallet address.
    pub fn item_key(&self) -> Id {
        hash(&address_of(self))
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId(")?;
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..)")
    }
}

/// The 20-byte wallet address of a public key: the tail of its hash.
pub fn address_of(id: &NodeId) -> [u8; ADDRESS_SIZE] {
    let digest = hash(&id.0);
    let mut address = [0u8; ADDRESS_SIZE];
    address.copy_from_slice(&digest.0[32 - ADDRESS_SIZE..]);
    address
}

/// Seconds since the unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Clone, PartialEq, Eq, Debug)]
/// How to reach a peer's RPC endpoints.
pub struct ServerDescriptor {
    pub host: String,
    pub edge_port: u16,
    pub server_port: u16,
}

#[derive(Clone, PartialEq, Eq, Debug)]
/// What a routing-table entry points at.
pub enum PeerObject {
    /// A remote peer with a reachable endpoint.
    Server(ServerDescriptor),
    /// The local node's own anchor entry.
    SelfMarker,
}

#[derive(Clone, PartialEq, Eq)]
/// A peer as tracked by the routing table.
pub struct PeerItem {
    pub id: NodeId,
    pub object: PeerObject,
    /// Unix seconds of the last successful contact. A value in the future
    /// marks the peer as temporarily disabled.
    pub last_seen: i64,
    /// Failed contact attempts since the last success.
    pub retries: u32,
}

impl PeerItem {
    /// Creates a new entry for a remote peer, seen now.
    pub fn new(id: NodeId, server: ServerDescriptor) -> PeerItem {
        PeerItem {
            id,
            object: PeerObject::Server(server),
            last_seen: unix_now(),
            retries: 0,
        }
    }

    /// The local node's anchor entry.
    pub fn self_marker(id: NodeId) -> PeerItem {
        PeerItem {
            id,
            object: PeerObject::SelfMarker,
            last_seen: unix_now(),
            retries: 0,
        }
    }

    /// Creates a peer with a random identity for testing purposes.
    pub fn random() -> PeerItem {
        PeerItem::new(
            NodeId::random(),
            ServerDescriptor {
                host: "localhost".to_string(),
                edge_port: 0,
                server_port: 0,
            },
        )
    }

    pub fn with_last_seen(mut self, last_seen: i64) -> Self {
        self.last_seen = last_seen;
        self
    }

    /// The ring position this peer is routed by.
    pub fn item_key(&self) -> Id {
        self.id.item_key()
    }

    pub fn is_self(&self) -> bool {
        matches!(self.object, PeerObject::SelfMarker)
    }

    /// A peer whose `last_seen` lies in the future is hidden from lookups.
    pub fn is_disabled(&self, now: i64) -> bool {
        self.last_seen > now
    }

    /// Record a failed contact: bump `retries` and hide the peer until
    /// `now + penalty` seconds.
    pub fn penalize(&mut self, now: i64, penalty: i64) {
        self.retries += 1;
        self.last_seen = now + penalty;
    }

    /// Record a successful contact.
    pub fn touch(&mut self, now: i64) {
        self.retries = 0;
        self.last_seen = now;
    }
}

impl Debug for PeerItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerItem")
            .field("id", &self.id)
            .field("object", &self.object)
            .field("last_seen", &self.last_seen)
            .field("retries", &self.retries)
            .finish()
    }
}
