//! End-to-end lookups over a simulated network.
//!
//! Every simulated node runs a real routing table; the transport answers
//! `find_node` from the remote node's own `nearest_n`, so a search hops
//! through partial views exactly the way it would over a wire. Views mix
//! ring neighbours with random long-range contacts, the shape a kademlia
//! table settles into.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use ringline::{
    find, Command, Id, KBuckets, NodeId, PeerItem, Response, SearchResult, ServerDescriptor,
    Transport, TransportError, K,
};

struct SimNode {
    table: KBuckets,
    stored: Option<Bytes>,
}

struct SimNetwork {
    nodes: BTreeMap<Id, SimNode>,
}

impl SimNetwork {
    /// `size` nodes, each knowing its `neighbours` nearest ring neighbours
    /// on both sides plus `view` random long-range contacts.
    fn new(size: usize, neighbours: usize, view: usize, seed: u64) -> SimNetwork {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

        let mut identities: Vec<NodeId> = (0..size).map(|_| NodeId::random()).collect();
        identities.sort_by_key(|id| id.item_key());
        let peers: Vec<PeerItem> = identities.iter().map(|id| peer(*id)).collect();

        let mut nodes = BTreeMap::new();
        for (position, id) in identities.iter().enumerate() {
            let mut table = KBuckets::new(*id);

            for offset in 1..=neighbours {
                table.insert_item(peers[(position + offset) % size].clone());
                table.insert_item(peers[(position + size - offset) % size].clone());
            }

            let mut others: Vec<PeerItem> = peers
                .iter()
                .filter(|item| item.id != *id)
                .cloned()
                .collect();
            others.shuffle(&mut rng);
            table.insert_items(others.into_iter().take(view));

            nodes.insert(
                id.item_key(),
                SimNode {
                    table,
                    stored: None,
                },
            );
        }

        SimNetwork { nodes }
    }

    fn origin(&self) -> &SimNode {
        self.nodes.values().next().expect("network is not empty")
    }

    fn globally_nearest(&self, key: &Id, n: usize) -> Vec<Id> {
        let mut keys: Vec<Id> = self.nodes.keys().copied().collect();
        keys.sort_by_key(|item_key| item_key.distance(key));
        keys.truncate(n);
        keys
    }
}

fn peer(id: NodeId) -> PeerItem {
    PeerItem::new(
        id,
        ServerDescriptor {
            host: "sim".to_string(),
            edge_port: 0,
            server_port: 0,
        },
    )
}

impl Transport for SimNetwork {
    fn rpc(&self, peer: &PeerItem, command: Command, key: &Id) -> Result<Response, TransportError> {
        let node = self
            .nodes
            .get(&peer.item_key())
            .ok_or_else(|| TransportError::Unreachable(format!("{:?}", peer.id)))?;

        if command == Command::FindValue {
            if let Some(value) = &node.stored {
                return Ok(Response::Value(value.clone()));
            }
        }

        Ok(Response::Nodes(node.table.nearest_n(key, K)))
    }
}

#[test]
fn lookups_converge_across_partial_views() {
    let network = Arc::new(SimNetwork::new(60, 3, 10, 7));
    let key = Id::random();

    // Seed from one node's partial view, as a real node would.
    let seeds = network.origin().table.nearest_n(&key, K);
    assert!(!seeds.is_empty());

    let result = find(network.clone(), key, seeds, 8, Command::FindNode).unwrap();

    let SearchResult::Nodes(nodes) = result else {
        panic!("expected a node result");
    };

    assert!(!nodes.is_empty());
    assert!(nodes.len() <= 8);

    // Sorted nearest-first.
    let found: Vec<Id> = nodes.iter().map(|item| item.item_key()).collect();
    let mut sorted = found.clone();
    sorted.sort_by_key(|item_key| item_key.distance(&key));
    assert_eq!(found, sorted);

    // The best find sits among the true nearest of the whole network even
    // though no single node knows everyone.
    let best_global = network.globally_nearest(&key, 8);
    assert!(best_global.contains(&found[0]));
}

#[test]
fn values_are_retrieved_from_their_holder() {
    let mut network = SimNetwork::new(40, 3, 8, 11);
    let key = Id::random();

    // Store the value at the node nearest to the key, where a publish would
    // have put it.
    let holder_key = network.globally_nearest(&key, 1)[0];
    network
        .nodes
        .get_mut(&holder_key)
        .expect("holder exists")
        .stored = Some(Bytes::from_static(b"state root"));

    let network = Arc::new(network);
    let seeds = network.origin().table.nearest_n(&key, K);

    let result = find(network.clone(), key, seeds, 8, Command::FindValue).unwrap();

    match result {
        SearchResult::Value { value, nodes } => {
            assert_eq!(value, Bytes::from_static(b"state root"));
            assert!(!nodes.is_empty());
        }
        SearchResult::Nodes(nodes) => {
            panic!("value not found; converged on {} nodes instead", nodes.len());
        }
    }
}

#[test]
fn searches_terminate_with_nothing_stored() {
    let network = Arc::new(SimNetwork::new(25, 2, 6, 3));
    let key = Id::random();

    let seeds = network.origin().table.nearest_n(&key, K);

    let result = find(network, key, seeds, 5, Command::FindValue).unwrap();

    match result {
        SearchResult::Nodes(nodes) => assert!(nodes.len() <= 5),
        SearchResult::Value { .. } => panic!("nothing was stored"),
    }
}
