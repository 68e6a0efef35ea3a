//! In-process cluster harness.
//!
//! Runs every node of a table as a thread of the current process, wired
//! together by [`transport::local`](crate::transport::local). Handy for tests
//! and for drivers that do not need separate processes.

use std::thread;

use anyhow::{Context, Result, anyhow, ensure};

use crate::config::DhtConfig;
use crate::node::Node;
use crate::transport::local;

pub struct LocalCluster {
    nodes: usize,
    config: DhtConfig,
}

impl LocalCluster {
    pub fn new(nodes: usize, config: DhtConfig) -> Result<Self> {
        ensure!(nodes > 0, "a cluster needs at least one node");
        config.validate()?;
        Ok(Self { nodes, config })
    }

    pub fn nodes(&self) -> usize {
        self.nodes
    }

    /// Starts every node on its own thread and runs `f` there with the
    /// node, returning each thread's result in rank order.
    ///
    /// `f` owns its node and is expected to end with
    /// [`Node::destroy`]. Collective calls (`sync`, `destroy`) need every
    /// node to take part, so if one node bails out early the others block at
    /// the next collective and `run` never returns.
    pub fn run<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        F: Fn(Node) -> Result<T> + Sync,
        T: Send,
    {
        let comms = local::fabric(self.nodes);
        let f = &f;
        let config = &self.config;

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.nodes);
            for comm in comms {
                let rank = comm.rank();
                let handle = thread::Builder::new()
                    .name(format!("dht-node-{rank}"))
                    .spawn_scoped(scope, move || {
                        let node = Node::start(comm, config)
                            .with_context(|| format!("failed to start node {rank}"))?;
                        f(node)
                    })
                    .with_context(|| format!("failed to spawn node {rank}"))?;
                handles.push((rank, handle));
            }

            handles
                .into_iter()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .map_err(|_| anyhow!("node {rank} panicked"))?
                        .with_context(|| format!("node {rank} failed"))
                })
                .collect()
        })
    }
}
