use std::io;

use thiserror::Error;

use crate::transport::Rank;

pub type Result<T> = std::result::Result<T, DhtError>;

/// Errors surfaced by the table, its protocol, and the substrate underneath.
///
/// Missing keys are not errors: `get` reports them with
/// [`KEY_NOT_FOUND`](crate::protocol::KEY_NOT_FOUND). Writes dropped by a
/// full store are not errors either; they are logged and counted in
/// [`NodeStats`](crate::node::NodeStats).
#[derive(Error, Debug)]
pub enum DhtError {
    #[error("key is {len} bytes, the limit is {max}")]
    KeyTooLong { len: usize, max: usize },

    #[error("key contains a NUL byte")]
    KeyContainsNul,

    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("received {0} with no outstanding request")]
    UnexpectedReply(&'static str),

    #[error("unexpected {frame} frame on the {mailbox} mailbox")]
    UnexpectedFrame {
        frame: &'static str,
        mailbox: &'static str,
    },

    #[error("terminate sent by rank {0}; only a node may terminate itself")]
    ForeignTerminate(Rank),

    #[error("a {0} is already outstanding on this node")]
    GateBusy(&'static str),

    #[error("sync was already called on node {0}")]
    AlreadySynced(Rank),

    #[error("rank {rank} is outside a cluster of {nodes} nodes")]
    InvalidRank { rank: Rank, nodes: usize },

    #[error("communication substrate disconnected")]
    Disconnected,

    #[error("server loop of node {0} panicked")]
    ServerPanicked(Rank),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("frame codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl DhtError {
    /// True for errors that mean a peer (or this node) broke the message
    /// protocol. A server loop that hits one of these aborts the process.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            DhtError::UnknownTag(_)
                | DhtError::MalformedMessage(_)
                | DhtError::UnexpectedReply(_)
                | DhtError::UnexpectedFrame { .. }
                | DhtError::ForeignTerminate(_)
        )
    }
}
