//! Sharded distributed hash table.
//!
//! A fixed set of N nodes each own the keys that hash to them. Every node
//! exposes the same synchronous surface (`put`, `get`, `size`, `sync`,
//! `destroy`) and routes each call to the owning node behind the scenes.
//!
//! # Architecture
//!
//! Each node runs two roles:
//!
//! - **Client role**: the caller's thread. Routes keys, sends requests, and
//!   blocks on a gate until the reply arrives.
//! - **Server role**: a background thread that owns the node's local store,
//!   handles requests from every node (itself included), and fulfills the
//!   node's gates when replies come back.
//!
//! Nodes talk over a communication substrate that provides FIFO
//! point-to-point delivery, a barrier, and sum reductions. The substrate can
//! run inside one process ([`transport::local`]) or across sockets
//! ([`transport::tcp`]).
//!
//! # Example
//!
//! ```
//! use distributed_hash_table::{DhtConfig, LocalCluster, KEY_NOT_FOUND};
//!
//! let cluster = LocalCluster::new(2, DhtConfig::default())?;
//! let sizes = cluster.run(|node| {
//!     if node.rank() == 0 {
//!         node.put("alice", 42)?;
//!     }
//!     node.sync()?;
//!     assert_eq!(node.get("alice")?, 42);
//!     assert_eq!(node.get("dave")?, KEY_NOT_FOUND);
//!     let size = node.size()?;
//!     node.destroy(&mut std::io::sink())?;
//!     Ok(size)
//! })?;
//! assert_eq!(sizes, vec![1, 1]);
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! # Modules
//!
//! - [`store`]: node-local sorted key-value table
//! - [`router`]: djb2 hash routing of keys to ranks
//! - [`protocol`]: fixed-size tagged messages
//! - [`transport`]: communicator, barrier, reductions, local and TCP links
//! - [`gate`]: single-slot wait/notify primitives
//! - [`node`]: client operations
//! - [`cluster`]: in-process cluster harness

pub mod cluster;
pub mod config;
pub mod error;
pub mod gate;
pub mod key;
pub mod node;
pub mod protocol;
pub mod router;
pub mod store;
pub mod telemetry;
pub mod transport;

mod server;

pub use cluster::LocalCluster;
pub use config::{DhtConfig, TcpConfig};
pub use error::{DhtError, Result};
pub use key::{Key, MAX_KEY_LEN};
pub use node::{Node, NodeStats};
pub use protocol::KEY_NOT_FOUND;
pub use transport::{Communicator, Rank};
