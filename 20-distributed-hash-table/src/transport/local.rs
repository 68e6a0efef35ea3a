//! In-process substrate: every node is a thread in the same process and
//! frames move through crossbeam channels.

use std::sync::Arc;

use crate::error::{DhtError, Result};
use crate::transport::{Communicator, Frame, Link, Mailbox, Rank, mailbox};

struct LocalLink {
    peers: Arc<Vec<Mailbox>>,
}

impl Link for LocalLink {
    fn deliver(&self, dest: Rank, frame: Frame) -> Result<()> {
        let peer = self.peers.get(dest).ok_or(DhtError::InvalidRank {
            rank: dest,
            nodes: self.peers.len(),
        })?;
        peer.route(frame)
    }
}

/// Builds a fully connected in-process cluster of `nodes` communicators,
/// indexed by rank.
///
/// Channels are unbounded, so no send ever blocks, and each channel is FIFO,
/// so ordering holds per sender/receiver pair.
pub fn fabric(nodes: usize) -> Vec<Communicator> {
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..nodes).map(|_| mailbox()).unzip();
    let peers = Arc::new(senders);

    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, receivers)| {
            let link = LocalLink {
                peers: Arc::clone(&peers),
            };
            Communicator::new(rank, nodes, Box::new(link), peers[rank].clone(), receivers)
        })
        .collect()
}
