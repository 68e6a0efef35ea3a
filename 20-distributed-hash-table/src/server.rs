//! Per-node server loop.
//!
//! The loop owns the node's [`LocalStore`] and is its only writer. It waits
//! on the communicator for the next event, dispatches protocol messages by
//! tag, and feeds reduction contributions into the node's
//! [`SumReduction`]. Replies to the node's own client go back through the
//! gates.
//!
//! The loop exits on a self-addressed `Terminate` and hands the store back
//! through its join handle. Any protocol violation is fatal: the error is
//! logged and the process aborts.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, trace, warn};

use crate::error::{DhtError, Result};
use crate::gate::Gates;
use crate::node::NodeStats;
use crate::protocol::{KEY_NOT_FOUND, Message};
use crate::store::{LocalStore, PutOutcome};
use crate::transport::{Communicator, Event, Rank, SumReduction};

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Terminate,
}

pub(crate) struct Server {
    rank: Rank,
    comm: Arc<Communicator>,
    store: LocalStore,
    gates: Arc<Gates>,
    stats: Arc<NodeStats>,
    sizes: SumReduction,
}

/// Starts the loop on its own thread. Joining the handle yields the store
/// once the loop has processed `Terminate`.
pub(crate) fn spawn(
    comm: Arc<Communicator>,
    store: LocalStore,
    gates: Arc<Gates>,
    stats: Arc<NodeStats>,
) -> Result<JoinHandle<LocalStore>> {
    let rank = comm.rank();
    let server = Server::new(comm, store, gates, stats);
    let handle = thread::Builder::new()
        .name(format!("dht-server-{rank}"))
        .spawn(move || match server.run() {
            Ok(store) => store,
            Err(err) => {
                error!(rank, error = %err, "server loop failed, aborting");
                std::process::abort()
            }
        })?;
    Ok(handle)
}

impl Server {
    pub(crate) fn new(
        comm: Arc<Communicator>,
        store: LocalStore,
        gates: Arc<Gates>,
        stats: Arc<NodeStats>,
    ) -> Self {
        let sizes = SumReduction::new(comm.nodes());
        Self {
            rank: comm.rank(),
            comm,
            store,
            gates,
            stats,
            sizes,
        }
    }

    /// Runs until `Terminate`, returning the store.
    pub(crate) fn run(mut self) -> Result<LocalStore> {
        debug!(rank = self.rank, "server loop running");
        loop {
            match self.comm.next_event()? {
                Event::Message(envelope) => {
                    let message = Message::decode(&envelope.payload)?;
                    self.stats.record_message();
                    if self.dispatch(envelope.source, message)? == Flow::Terminate {
                        break;
                    }
                }
                Event::Contribution { source, value } => self.absorb(source, value)?,
            }
        }
        debug!(rank = self.rank, "server loop terminated");
        Ok(self.store)
    }

    fn dispatch(&mut self, source: Rank, message: Message) -> Result<Flow> {
        debug!(rank = self.rank, source, tag = ?message.tag(), "dispatch");
        match message {
            Message::Put { key, value } => {
                if let PutOutcome::Rejected(key) = self.store.put(key, value) {
                    let dropped = self.stats.record_dropped_put();
                    warn!(
                        rank = self.rank,
                        source,
                        %key,
                        capacity = self.store.capacity(),
                        dropped,
                        "local store full, write dropped"
                    );
                }
                self.comm.send(source, &Message::PutConfirm)?;
            }
            Message::Get { key } => {
                let value = self.store.get(key.as_str()).unwrap_or(KEY_NOT_FOUND);
                self.comm.send(source, &Message::GetResult { value })?;
            }
            Message::PutConfirm => self.gates.put.fulfill(())?,
            Message::GetResult { value } => self.gates.get.fulfill(value)?,
            Message::SizeRequest => {
                self.comm.contribute_sum(self.store.len() as u64, source)?;
            }
            Message::SizeResult { total } => self.gates.size.fulfill(total)?,
            Message::Terminate => {
                if source != self.rank {
                    return Err(DhtError::ForeignTerminate(source));
                }
                return Ok(Flow::Terminate);
            }
        }
        Ok(Flow::Continue)
    }

    // Contributions only arrive at the rank that asked for the size.
    fn absorb(&mut self, source: Rank, value: u64) -> Result<()> {
        trace!(rank = self.rank, source, value, "size contribution");
        if let Some(total) = self.sizes.add(value) {
            self.comm.send(self.rank, &Message::SizeResult { total })?;
        }
        Ok(())
    }
}
