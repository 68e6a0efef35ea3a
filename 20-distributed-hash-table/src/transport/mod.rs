//! Communication substrate shared by every node.
//!
//! The substrate gives each node a [`Communicator`] offering:
//!
//! - **Point-to-point sends**: reliable and FIFO per sender/receiver pair.
//!   A node sending to itself enqueues straight into its own inbox, never
//!   blocking, so the server loop can reply to its own client.
//! - **Barrier**: no participant returns until every node has entered.
//!   Rank 0 coordinates.
//! - **Sum reduction**: every node contributes one value to a root, and the
//!   root's [`SumReduction`] accumulates them as they arrive.
//!
//! Each node owns three mailboxes (crossbeam channels): the protocol inbox,
//! the barrier mailbox used only by the client role, and the contribution
//! mailbox drained by the server loop. A [`Link`] moves frames between nodes;
//! [`local`] wires nodes together inside one process, [`tcp`] across sockets.

pub mod local;
pub mod tcp;

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{DhtError, Result};
use crate::protocol::Message;

/// A node's position in the cluster, in `[0, nodes)`.
pub type Rank = usize;

/// Rank that coordinates barriers.
const COORDINATOR: Rank = 0;

/// Unit of transfer between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// An encoded protocol [`Message`], opaque to the substrate.
    Point { source: Rank, payload: Vec<u8> },
    /// A node reached the barrier (sent to the coordinator).
    BarrierEnter { source: Rank },
    /// Every node reached the barrier (sent by the coordinator).
    BarrierRelease,
    /// One node's share of a sum reduction.
    Contribution { source: Rank, value: u64 },
}

impl Frame {
    fn kind(&self) -> &'static str {
        match self {
            Frame::Point { .. } => "point",
            Frame::BarrierEnter { .. } => "barrier-enter",
            Frame::BarrierRelease => "barrier-release",
            Frame::Contribution { .. } => "contribution",
        }
    }
}

/// A protocol message as it arrives, still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub source: Rank,
    pub payload: Vec<u8>,
}

/// What the server loop wakes up for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Message(Envelope),
    Contribution { source: Rank, value: u64 },
}

/// Moves frames to other nodes.
///
/// A link must preserve the order of frames delivered to the same
/// destination. Frames addressed to the local rank never reach the link.
pub trait Link: Send + Sync {
    fn deliver(&self, dest: Rank, frame: Frame) -> Result<()>;

    /// Releases connections. Called once, when the node is destroyed.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Sending side of one node's mailboxes.
#[derive(Debug, Clone)]
pub(crate) struct Mailbox {
    inbox: Sender<Envelope>,
    barrier: Sender<Frame>,
    contributions: Sender<(Rank, u64)>,
}

/// Receiving side of one node's mailboxes.
#[derive(Debug)]
pub(crate) struct MailboxReceivers {
    inbox: Receiver<Envelope>,
    barrier: Receiver<Frame>,
    contributions: Receiver<(Rank, u64)>,
}

pub(crate) fn mailbox() -> (Mailbox, MailboxReceivers) {
    let (inbox_tx, inbox_rx) = unbounded();
    let (barrier_tx, barrier_rx) = unbounded();
    let (contributions_tx, contributions_rx) = unbounded();
    (
        Mailbox {
            inbox: inbox_tx,
            barrier: barrier_tx,
            contributions: contributions_tx,
        },
        MailboxReceivers {
            inbox: inbox_rx,
            barrier: barrier_rx,
            contributions: contributions_rx,
        },
    )
}

impl Mailbox {
    /// Files `frame` into the matching mailbox. Never blocks.
    pub(crate) fn route(&self, frame: Frame) -> Result<()> {
        let sent = match frame {
            Frame::Point { source, payload } => {
                self.inbox.send(Envelope { source, payload }).is_ok()
            }
            Frame::Contribution { source, value } => {
                self.contributions.send((source, value)).is_ok()
            }
            barrier @ (Frame::BarrierEnter { .. } | Frame::BarrierRelease) => {
                self.barrier.send(barrier).is_ok()
            }
        };
        if sent {
            Ok(())
        } else {
            Err(DhtError::Disconnected)
        }
    }
}

/// One node's endpoint on the substrate.
///
/// Shared between the node's client role and its server loop: the client
/// sends requests and enters barriers, the server receives events, replies,
/// and contributes to reductions.
pub struct Communicator {
    rank: Rank,
    nodes: usize,
    link: Box<dyn Link>,
    local: Mailbox,
    receivers: MailboxReceivers,
}

impl Communicator {
    pub(crate) fn new(
        rank: Rank,
        nodes: usize,
        link: Box<dyn Link>,
        local: Mailbox,
        receivers: MailboxReceivers,
    ) -> Self {
        Self {
            rank,
            nodes,
            link,
            local,
            receivers,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn nodes(&self) -> usize {
        self.nodes
    }

    /// Sends `message` to `dest`. Sends to self are a local enqueue.
    pub fn send(&self, dest: Rank, message: &Message) -> Result<()> {
        self.check_rank(dest)?;
        self.deliver(
            dest,
            Frame::Point {
                source: self.rank,
                payload: message.encode().to_vec(),
            },
        )
    }

    #[cfg(test)]
    pub(crate) fn send_payload(&self, dest: Rank, payload: Vec<u8>) -> Result<()> {
        self.deliver(
            dest,
            Frame::Point {
                source: self.rank,
                payload,
            },
        )
    }

    /// Blocks until a protocol message or a reduction contribution arrives.
    pub fn next_event(&self) -> Result<Event> {
        crossbeam_channel::select! {
            recv(self.receivers.inbox) -> envelope => envelope
                .map(Event::Message)
                .map_err(|_| DhtError::Disconnected),
            recv(self.receivers.contributions) -> contribution => contribution
                .map(|(source, value)| Event::Contribution { source, value })
                .map_err(|_| DhtError::Disconnected),
        }
    }

    /// Blocks until every node in the cluster has called `barrier`.
    pub fn barrier(&self) -> Result<()> {
        if self.nodes == 1 {
            return Ok(());
        }

        if self.rank == COORDINATOR {
            for _ in 1..self.nodes {
                match self.recv_barrier()? {
                    Frame::BarrierEnter { source } => trace!(source, "peer entered barrier"),
                    other => return Err(unexpected(&other, "barrier")),
                }
            }
            for peer in (0..self.nodes).filter(|&peer| peer != COORDINATOR) {
                self.deliver(peer, Frame::BarrierRelease)?;
            }
        } else {
            self.deliver(COORDINATOR, Frame::BarrierEnter { source: self.rank })?;
            match self.recv_barrier()? {
                Frame::BarrierRelease => {}
                other => return Err(unexpected(&other, "barrier")),
            }
        }
        Ok(())
    }

    /// Contributes `value` to the sum reduction rooted at `root`.
    pub fn contribute_sum(&self, value: u64, root: Rank) -> Result<()> {
        self.check_rank(root)?;
        self.deliver(
            root,
            Frame::Contribution {
                source: self.rank,
                value,
            },
        )
    }

    /// Releases the underlying link.
    pub fn close(&self) -> Result<()> {
        self.link.close()
    }

    fn deliver(&self, dest: Rank, frame: Frame) -> Result<()> {
        if dest == self.rank {
            self.local.route(frame)
        } else {
            self.link.deliver(dest, frame)
        }
    }

    fn recv_barrier(&self) -> Result<Frame> {
        self.receivers
            .barrier
            .recv()
            .map_err(|_| DhtError::Disconnected)
    }

    fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank < self.nodes {
            Ok(())
        } else {
            Err(DhtError::InvalidRank {
                rank,
                nodes: self.nodes,
            })
        }
    }
}

fn unexpected(frame: &Frame, mailbox: &'static str) -> DhtError {
    DhtError::UnexpectedFrame {
        frame: frame.kind(),
        mailbox,
    }
}

/// Root-side accumulator of a sum reduction.
///
/// Rounds never overlap at one root: a root starts a new round only after
/// the previous one completed.
#[derive(Debug)]
pub struct SumReduction {
    expected: usize,
    received: usize,
    total: u64,
}

impl SumReduction {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            received: 0,
            total: 0,
        }
    }

    /// Adds one contribution. Returns the total once all `expected`
    /// contributions are in, and resets for the next round.
    pub fn add(&mut self, value: u64) -> Option<u64> {
        self.total += value;
        self.received += 1;
        if self.received < self.expected {
            return None;
        }
        let total = self.total;
        self.received = 0;
        self.total = 0;
        Some(total)
    }
}
