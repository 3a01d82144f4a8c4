//! Iterative parallel search: the α-worker lookup driver.
//!
//! A search starts from the seed peers nearest to its key, queries them with
//! [ALPHA] parallel workers, folds every response back into a candidate
//! frontier, and keeps dispatching whichever candidates are still strictly
//! closer than the best responder seen so far. It ends when a peer answers
//! with a value, or when the frontier is empty and every worker is idle.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender};
use tracing::{debug, trace};

use crate::common::{Distance, Id, PeerItem};
use crate::transport::{Command, Response, Transport};
use crate::{Error, Result};

/// Search parallelism factor. Fixed by the network protocol.
pub const ALPHA: usize = 3;

/// How long the driver waits on worker events before re-checking for
/// cancellation.
const EVENT_TICK: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
/// What a finished search produced.
pub enum SearchResult {
    /// The nearest peers discovered, sorted by distance to the key.
    Nodes(Vec<PeerItem>),
    /// A value, plus every peer contacted or discovered on the way to it.
    Value { value: Bytes, nodes: Vec<PeerItem> },
}

/// Run a search to completion on the calling thread.
///
/// `seeds` should come from `KBuckets::nearest_n(key, k)`; `k` bounds the
/// width of a node result.
pub fn find(
    transport: Arc<dyn Transport>,
    key: Id,
    seeds: Vec<PeerItem>,
    k: usize,
    command: Command,
) -> Result<SearchResult> {
    Driver::new(transport, key, seeds, k, command, None).run()
}

/// Handle to a search running on a background thread.
///
/// Dropping the handle cancels the search: the driver notices the dead
/// result channel, sends `Done` to every worker and aborts.
pub struct Search {
    receiver: Receiver<SearchResult>,
}

impl Search {
    pub fn start(
        transport: Arc<dyn Transport>,
        key: Id,
        seeds: Vec<PeerItem>,
        k: usize,
        command: Command,
    ) -> Search {
        let (sender, receiver) = flume::bounded(1);

        thread::spawn(move || {
            let mut driver = Driver::new(transport, key, seeds, k, command, Some(sender.clone()));
            if let Ok(result) = driver.run() {
                let _ = sender.send(result);
            }
        });

        Search { receiver }
    }

    /// Block until the search completes.
    pub fn recv(&self) -> Result<SearchResult> {
        self.receiver.recv().map_err(|_| Error::SearchCancelled)
    }

    /// The result, if the search has already finished.
    pub fn try_recv(&self) -> Option<SearchResult> {
        self.receiver.try_recv().ok()
    }
}

enum Task {
    Next(PeerItem),
    Done,
}

struct WorkerReply {
    from: PeerItem,
    response: Response,
}

/// One worker: a thread that performs RPCs one at a time over its own pair
/// of channels. A dead reply channel doubles as the worker's exit signal.
struct Worker {
    tasks: Sender<Task>,
    replies: Receiver<WorkerReply>,
    assigned: Option<PeerItem>,
}

struct Driver {
    transport: Arc<dyn Transport>,
    key: Id,
    k: usize,
    command: Command,

    /// Closest distance any responder has had to the key; never grows.
    min_distance: Option<Distance>,
    /// Candidates not yet dispatched, nearest first.
    queryable: Vec<PeerItem>,
    /// Peers a request was sent to.
    queried: HashMap<Id, PeerItem>,
    /// Peers discovered in responses.
    visited: HashMap<Id, PeerItem>,

    workers: Vec<Worker>,
    /// Indexes of idle workers.
    waiting: Vec<usize>,

    /// The caller's result channel, when running detached; a disconnect
    /// means the caller gave up.
    caller: Option<Sender<SearchResult>>,
}

impl Driver {
    fn new(
        transport: Arc<dyn Transport>,
        key: Id,
        seeds: Vec<PeerItem>,
        k: usize,
        command: Command,
        caller: Option<Sender<SearchResult>>,
    ) -> Driver {
        let mut unique = HashMap::new();
        for peer in seeds {
            unique.entry(peer.item_key()).or_insert(peer);
        }

        let mut queryable: Vec<PeerItem> = unique.into_values().collect();
        queryable.sort_by_cached_key(|peer| peer.item_key().distance(&key));

        Driver {
            transport,
            key,
            k,
            command,
            min_distance: None,
            queryable,
            queried: HashMap::new(),
            visited: HashMap::new(),
            workers: Vec::new(),
            waiting: Vec::new(),
            caller,
        }
    }

    fn run(&mut self) -> Result<SearchResult> {
        self.workers = (0..ALPHA).map(|_| self.spawn_worker()).collect();
        self.waiting = (0..ALPHA).collect();

        loop {
            if self.cancelled() {
                self.shutdown();
                return Err(Error::SearchCancelled);
            }

            self.dispatch();

            if self.queryable.is_empty() && self.waiting.len() == ALPHA {
                let nodes = self.nearest_known();
                self.shutdown();
                debug!(
                    key = ?self.key,
                    visited = self.visited.len(),
                    queried = self.queried.len(),
                    "Search exhausted its frontier"
                );
                return Ok(SearchResult::Nodes(nodes));
            }

            match self.next_event() {
                // Tick: go around and re-check for cancellation.
                None => continue,
                Some((index, Some(WorkerReply { from, response }))) => match response {
                    Response::Value(value) => {
                        let nodes = self.contacted_nodes();
                        self.shutdown();
                        debug!(key = ?self.key, from = ?from.id, "Search found a value");
                        return Ok(SearchResult::Value { value, nodes });
                    }
                    Response::Nodes(nodes) => self.absorb(index, from, nodes),
                },
                Some((index, None)) => {
                    // The worker's thread died. Replace it; its outstanding
                    // peer counts as queried with an empty response.
                    debug!(worker = index, "Worker exited, respawning");
                    let outstanding = self.workers[index].assigned.take();
                    self.workers[index] = self.spawn_worker();

                    match outstanding {
                        Some(peer) => self.absorb(index, peer, Vec::new()),
                        None => self.waiting.push(index),
                    }
                }
            }
        }
    }

    // === Worker pool ===

    fn spawn_worker(&self) -> Worker {
        let (task_sender, task_receiver) = flume::bounded::<Task>(1);
        let (reply_sender, reply_receiver) = flume::bounded::<WorkerReply>(1);

        let transport = self.transport.clone();
        let command = self.command;
        let key = self.key;

        thread::spawn(move || worker_loop(transport, command, key, task_receiver, reply_sender));

        Worker {
            tasks: task_sender,
            replies: reply_receiver,
            assigned: None,
        }
    }

    /// Pair queryable peers with idle workers, head of the frontier first.
    fn dispatch(&mut self) {
        while !self.queryable.is_empty() {
            let Some(index) = self.waiting.pop() else {
                break;
            };
            let peer = self.queryable.remove(0);

            // Queried before the worker ever sees the assignment.
            self.queried.insert(peer.item_key(), peer.clone());
            self.workers[index].assigned = Some(peer.clone());

            trace!(peer = ?peer.id, worker = index, "Dispatching query");

            if self.workers[index].tasks.send(Task::Next(peer)).is_err() {
                // Dead before it took the assignment; revive and record an
                // empty response for the peer.
                let outstanding = self.workers[index].assigned.take();
                self.workers[index] = self.spawn_worker();

                match outstanding {
                    Some(peer) => self.absorb(index, peer, Vec::new()),
                    None => self.waiting.push(index),
                }
            }
        }
    }

    /// Wait for the next worker reply or exit; `None` is a timeout tick.
    fn next_event(&self) -> Option<(usize, Option<WorkerReply>)> {
        let mut selector = flume::Selector::new();

        for (index, worker) in self.workers.iter().enumerate() {
            selector = selector.recv(&worker.replies, move |result| (index, result.ok()));
        }

        selector.wait_timeout(EVENT_TICK).ok()
    }

    fn shutdown(&mut self) {
        for worker in &self.workers {
            let _ = worker.tasks.send(Task::Done);
        }
    }

    fn cancelled(&self) -> bool {
        self.caller
            .as_ref()
            .map_or(false, |sender| sender.is_disconnected())
    }

    // === Driver state ===

    /// Fold a node-list response back into the search state.
    fn absorb(&mut self, index: usize, from: PeerItem, nodes: Vec<PeerItem>) {
        self.workers[index].assigned = None;
        self.waiting.push(index);

        for peer in &nodes {
            self.visited
                .entry(peer.item_key())
                .or_insert_with(|| peer.clone());
        }

        let from_distance = from.item_key().distance(&self.key);
        self.min_distance = Some(match self.min_distance {
            None => from_distance,
            Some(current) => current.min(from_distance),
        });

        // Rebuild the frontier: everything known but not yet queried that is
        // still strictly closer than the best responder, k nearest kept.
        let min_distance = self.min_distance;
        let mut merged: HashMap<Id, PeerItem> = HashMap::new();

        for peer in self.queryable.drain(..).chain(nodes) {
            let item_key = peer.item_key();

            if self.queried.contains_key(&item_key) {
                continue;
            }
            if let Some(bound) = min_distance {
                if item_key.distance(&self.key) >= bound {
                    continue;
                }
            }

            merged.entry(item_key).or_insert(peer);
        }

        let mut queryable: Vec<PeerItem> = merged.into_values().collect();
        queryable.sort_by_cached_key(|peer| peer.item_key().distance(&self.key));
        queryable.truncate(self.k);

        trace!(
            queryable = queryable.len(),
            visited = self.visited.len(),
            "Absorbed response"
        );

        self.queryable = queryable;
    }

    /// The k nearest of everything queried or discovered, sorted by distance.
    fn nearest_known(&self) -> Vec<PeerItem> {
        let mut nodes = self.contacted_nodes();
        nodes.truncate(self.k);
        nodes
    }

    /// `visited ∪ queried`, deduplicated and sorted by distance to the key.
    fn contacted_nodes(&self) -> Vec<PeerItem> {
        let mut unique: HashMap<Id, PeerItem> = HashMap::new();

        for peer in self.queried.values().chain(self.visited.values()) {
            unique.entry(peer.item_key()).or_insert_with(|| peer.clone());
        }

        let mut nodes: Vec<PeerItem> = unique.into_values().collect();
        nodes.sort_by_cached_key(|peer| peer.item_key().distance(&self.key));
        nodes
    }
}

fn worker_loop(
    transport: Arc<dyn Transport>,
    command: Command,
    key: Id,
    tasks: Receiver<Task>,
    replies: Sender<WorkerReply>,
) {
    while let Ok(Task::Next(peer)) = tasks.recv() {
        let response = match transport.rpc(&peer, command, &key) {
            Ok(response) => response,
            Err(err) => {
                debug!(peer = ?peer.id, ?err, "RPC failed, reporting an empty response");
                Response::Nodes(Vec::new())
            }
        };

        if replies
            .send(WorkerReply {
                from: peer,
                response,
            })
            .is_err()
        {
            break;
        }
    }
}
