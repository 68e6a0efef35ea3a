//! Client side of a node.
//!
//! A [`Node`] is the surface the application drives. Every call is
//! synchronous: it routes the key, arms the matching gate, sends a request,
//! and blocks until the server loop of the owning node has answered. The
//! node's own server loop runs on a background thread started by
//! [`Node::start`] and stopped by [`Node::destroy`].
//!
//! Only one put, one get and one size request may be outstanding per node.
//! Callers sharing a node across threads must serialize those calls; an
//! overlapping call fails with [`DhtError::GateBusy`].

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use tracing::{debug, info};

use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::gate::{Gate, Gates};
use crate::key::Key;
use crate::protocol::Message;
use crate::router::HashRouter;
use crate::server;
use crate::store::LocalStore;
use crate::transport::{Communicator, Rank};

/// Counters shared between a node's client and server roles.
#[derive(Debug, Default)]
pub struct NodeStats {
    dropped_puts: AtomicU64,
    messages_handled: AtomicU64,
}

impl NodeStats {
    /// Writes this node's store rejected because it was full.
    pub fn dropped_puts(&self) -> u64 {
        self.dropped_puts.load(Ordering::Relaxed)
    }

    /// Protocol messages this node's server loop has processed.
    pub fn messages_handled(&self) -> u64 {
        self.messages_handled.load(Ordering::Relaxed)
    }

    pub(crate) fn record_dropped_put(&self) -> u64 {
        self.dropped_puts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_message(&self) {
        self.messages_handled.fetch_add(1, Ordering::Relaxed);
    }
}

/// One participant of the table.
pub struct Node {
    rank: Rank,
    comm: Arc<Communicator>,
    router: HashRouter,
    gates: Arc<Gates>,
    stats: Arc<NodeStats>,
    synced: AtomicBool,
    server: JoinHandle<LocalStore>,
}

impl Node {
    /// Joins the table through `comm` and starts this node's server loop.
    ///
    /// The node's id is `comm.rank()`, also available as [`Node::rank`].
    pub fn start(comm: Communicator, config: &DhtConfig) -> Result<Self> {
        config.validate()?;
        let rank = comm.rank();
        let nodes = comm.nodes();
        let router = HashRouter::new(nodes)?;
        let comm = Arc::new(comm);
        let gates = Arc::new(Gates::default());
        let stats = Arc::new(NodeStats::default());

        let server = server::spawn(
            Arc::clone(&comm),
            LocalStore::with_capacity(config.capacity),
            Arc::clone(&gates),
            Arc::clone(&stats),
        )?;
        info!(rank, nodes, capacity = config.capacity, "node started");

        Ok(Self {
            rank,
            comm,
            router,
            gates,
            stats,
            synced: AtomicBool::new(false),
            server,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn nodes(&self) -> usize {
        self.router.nodes()
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    /// Rank that owns `key`.
    pub fn owner_of(&self, key: &str) -> Result<Rank> {
        Ok(self.router.route(&Key::new(key)?))
    }

    /// Stores `value` under `key` on the owning node.
    ///
    /// Returns once the owner has applied the write, so any later `get` of
    /// `key`, from any node, observes it. A write the owner drops because its
    /// store is full still returns `Ok`; see [`NodeStats::dropped_puts`].
    pub fn put(&self, key: &str, value: i64) -> Result<()> {
        let key = Key::new(key)?;
        let owner = self.router.route(&key);
        debug!(rank = self.rank, owner, %key, value, "put");
        self.request(&self.gates.put, owner, &Message::Put { key, value })
    }

    /// Fetches the value stored under `key`, or
    /// [`KEY_NOT_FOUND`](crate::protocol::KEY_NOT_FOUND).
    pub fn get(&self, key: &str) -> Result<i64> {
        let key = Key::new(key)?;
        let owner = self.router.route(&key);
        debug!(rank = self.rank, owner, %key, "get");
        self.request(&self.gates.get, owner, &Message::Get { key })
    }

    /// Total number of pairs stored across the whole cluster.
    pub fn size(&self) -> Result<u64> {
        let gate = &self.gates.size;
        gate.arm()?;
        for dest in 0..self.nodes() {
            if let Err(err) = self.comm.send(dest, &Message::SizeRequest) {
                gate.disarm();
                return Err(err);
            }
        }
        let total = gate.wait();
        debug!(rank = self.rank, total, "size");
        Ok(total)
    }

    /// Waits until every node has called `sync`. Each node may call it once.
    pub fn sync(&self) -> Result<()> {
        if self.synced.swap(true, Ordering::SeqCst) {
            return Err(DhtError::AlreadySynced(self.rank));
        }
        if let Err(err) = self.comm.barrier() {
            // The barrier was never passed, so the call may be retried.
            self.synced.store(false, Ordering::SeqCst);
            return Err(err);
        }
        debug!(rank = self.rank, "synced");
        Ok(())
    }

    /// Shuts this node down and writes its surviving pairs to `sink`.
    ///
    /// Waits at a barrier until no node can have requests in flight, stops
    /// the server loop with a self-addressed `Terminate`, then drains the
    /// store in key order. Returns the number of pairs written.
    ///
    /// The link is released even when writing to `sink` fails. The write
    /// error is returned and the pairs not yet written are lost with the node.
    pub fn destroy<W: Write>(self, sink: &mut W) -> Result<usize> {
        let Node {
            rank, comm, server, ..
        } = self;

        comm.barrier()?;
        comm.send(rank, &Message::Terminate)?;
        let mut store = server.join().map_err(|_| DhtError::ServerPanicked(rank))?;
        let drained = store.drain(sink);
        comm.close()?;
        let written = drained?;

        info!(rank, written, "node destroyed");
        Ok(written)
    }

    fn request<T>(&self, gate: &Gate<T>, dest: Rank, message: &Message) -> Result<T> {
        gate.arm()?;
        if let Err(err) = self.comm.send(dest, message) {
            gate.disarm();
            return Err(err);
        }
        Ok(gate.wait())
    }
}
