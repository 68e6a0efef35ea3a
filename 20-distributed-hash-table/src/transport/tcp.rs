//! TCP substrate: one process (or thread) per node, one persistent
//! connection per ordered pair of nodes.
//!
//! # Wire format
//!
//! Every packet is length-prefixed:
//! - 4 bytes: packet length (big-endian u32)
//! - N bytes: `bincode`-encoded [`Packet`]
//!
//! The first packet on every connection is a `Hello` naming the dialing rank;
//! everything after it is a [`Frame`] whose source must be that rank. A single connection carries all
//! frames from one node to another, so TCP's ordering gives FIFO delivery
//! per pair. Each accepted connection gets a reader thread that files
//! incoming frames into the local mailboxes.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::TcpConfig;
use crate::error::{DhtError, Result};
use crate::transport::{Communicator, Frame, Link, Mailbox, Rank, mailbox};

#[derive(Debug, Serialize, Deserialize)]
enum Packet {
    Hello { rank: Rank },
    Frame(Frame),
}

/// Binds `peers[rank]` and joins the cluster described by `peers`.
pub fn bind(rank: Rank, peers: &[SocketAddr], config: &TcpConfig) -> Result<Communicator> {
    let addr = peers.get(rank).ok_or(DhtError::InvalidRank {
        rank,
        nodes: peers.len(),
    })?;
    let listener = TcpListener::bind(addr)?;
    connect(rank, listener, peers, config)
}

/// Joins the cluster described by `peers` using an already bound listener.
///
/// Dials every other node, retrying while peers are still starting, and
/// accepts one connection from each of them in the background.
pub fn connect(
    rank: Rank,
    listener: TcpListener,
    peers: &[SocketAddr],
    config: &TcpConfig,
) -> Result<Communicator> {
    config.validate()?;
    let nodes = peers.len();
    if rank >= nodes {
        return Err(DhtError::InvalidRank { rank, nodes });
    }

    let (local, receivers) = mailbox();
    spawn_acceptor(rank, nodes, listener, local.clone(), config)?;

    let mut writers = Vec::with_capacity(nodes);
    for (peer, addr) in peers.iter().enumerate() {
        if peer == rank {
            writers.push(None);
            continue;
        }
        let mut stream = dial(*addr, config)?;
        write_packet(&mut stream, &Packet::Hello { rank })?;
        debug!(rank, peer, %addr, "dialed peer");
        writers.push(Some(Mutex::new(stream)));
    }

    let link = TcpLink { writers };
    Ok(Communicator::new(rank, nodes, Box::new(link), local, receivers))
}

struct TcpLink {
    writers: Vec<Option<Mutex<TcpStream>>>,
}

impl Link for TcpLink {
    fn deliver(&self, dest: Rank, frame: Frame) -> Result<()> {
        let writer = self
            .writers
            .get(dest)
            .and_then(Option::as_ref)
            .ok_or(DhtError::InvalidRank {
                rank: dest,
                nodes: self.writers.len(),
            })?;
        let mut stream = writer.lock().unwrap_or_else(PoisonError::into_inner);
        write_packet(&mut *stream, &Packet::Frame(frame))
    }

    fn close(&self) -> Result<()> {
        for writer in self.writers.iter().flatten() {
            let stream = writer.lock().unwrap_or_else(PoisonError::into_inner);
            match stream.shutdown(Shutdown::Write) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotConnected => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

fn dial(addr: SocketAddr, config: &TcpConfig) -> Result<TcpStream> {
    let mut attempt = 1;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) if attempt < config.connect_attempts => {
                debug!(%addr, attempt, error = %err, "peer not reachable yet");
                thread::sleep(config.connect_backoff());
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Accepts one connection from every other node, handing each to its own
/// reader thread.
///
/// Only connections that complete the handshake count. Failed accepts,
/// bad handshakes and a second `Hello` from an already connected rank are
/// logged and dropped, and the acceptor keeps listening.
fn spawn_acceptor(
    rank: Rank,
    nodes: usize,
    listener: TcpListener,
    mailbox: Mailbox,
    config: &TcpConfig,
) -> Result<()> {
    let max_frame_len = config.max_frame_len;
    let handshake_timeout = config.connect_backoff() * config.connect_attempts;
    thread::Builder::new()
        .name(format!("dht-accept-{rank}"))
        .spawn(move || {
            let mut connected = vec![false; nodes];
            connected[rank] = true;
            let mut accepted = 1;
            while accepted < nodes {
                let mut stream = match listener.accept() {
                    Ok((stream, _)) => stream,
                    Err(err) => {
                        warn!(rank, error = %err, "failed to accept peer connection");
                        continue;
                    }
                };
                let hello = accept_hello(&mut stream, &connected, max_frame_len, handshake_timeout);
                let peer = match hello {
                    Ok(peer) => peer,
                    Err(err) => {
                        warn!(rank, error = %err, "rejected peer handshake");
                        continue;
                    }
                };
                connected[peer] = true;
                accepted += 1;
                debug!(rank, peer, "accepted peer");

                let mailbox = mailbox.clone();
                let spawned = thread::Builder::new()
                    .name(format!("dht-read-{rank}-{peer}"))
                    .spawn(move || {
                        match forward_frames(&mut stream, peer, &mailbox, max_frame_len) {
                            Ok(()) => debug!(rank, peer, "peer hung up"),
                            Err(err) => {
                                warn!(rank, peer, error = %err, "peer connection closed with error")
                            }
                        }
                    });
                if let Err(err) = spawned {
                    warn!(rank, peer, error = %err, "failed to spawn peer reader");
                }
            }
        })?;
    Ok(())
}

fn accept_hello(
    stream: &mut TcpStream,
    connected: &[bool],
    max_frame_len: usize,
    timeout: Duration,
) -> Result<Rank> {
    stream.set_read_timeout(Some(timeout))?;
    let peer = read_hello(stream, connected, max_frame_len)?;
    stream.set_read_timeout(None)?;
    Ok(peer)
}

/// Reads the handshake and returns the dialing rank. `connected[r]` is true
/// for ranks that already have a connection, including this node's own.
fn read_hello<R: Read>(reader: &mut R, connected: &[bool], max_frame_len: usize) -> Result<Rank> {
    match read_packet(reader, max_frame_len)? {
        Some(Packet::Hello { rank: peer }) if connected.get(peer) == Some(&false) => Ok(peer),
        Some(Packet::Hello { rank: peer }) => Err(DhtError::InvalidRank {
            rank: peer,
            nodes: connected.len(),
        }),
        Some(Packet::Frame(frame)) => Err(DhtError::UnexpectedFrame {
            frame: frame.kind(),
            mailbox: "handshake",
        }),
        None => Err(DhtError::Disconnected),
    }
}

/// Files every frame from `peer` into the local mailboxes until the peer
/// hangs up. Frames must name `peer` as their source.
fn forward_frames<R: Read>(
    reader: &mut R,
    peer: Rank,
    mailbox: &Mailbox,
    max_frame_len: usize,
) -> Result<()> {
    while let Some(packet) = read_packet(reader, max_frame_len)? {
        let frame = match packet {
            Packet::Frame(frame) => frame,
            Packet::Hello { .. } => {
                return Err(DhtError::UnexpectedFrame {
                    frame: "hello",
                    mailbox: "inbox",
                });
            }
        };
        let source = match &frame {
            Frame::Point { source, .. }
            | Frame::BarrierEnter { source }
            | Frame::Contribution { source, .. } => Some(*source),
            Frame::BarrierRelease => None,
        };
        if let Some(claimed) = source.filter(|&source| source != peer) {
            return Err(DhtError::MalformedMessage(format!(
                "{} frame from rank {peer} claims source {claimed}",
                frame.kind()
            )));
        }
        mailbox.route(frame)?;
    }
    Ok(())
}

/// Reads one packet; `None` when the peer closed the connection cleanly
/// between packets. A connection that ends inside a packet, length prefix
/// included, is an error.
fn read_packet<R: Read>(reader: &mut R, max_frame_len: usize) -> Result<Option<Packet>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match reader.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_len {
        return Err(DhtError::MalformedMessage(format!(
            "packet of {len} bytes exceeds the {max_frame_len}-byte limit"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(Some(bincode::deserialize(&buf)?))
}

fn write_packet<W: Write>(writer: &mut W, packet: &Packet) -> Result<()> {
    let body = bincode::serialize(packet)?;
    let len = u32::try_from(body.len())
        .map_err(|_| DhtError::MalformedMessage(format!("packet of {} bytes", body.len())))?;
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&body);
    writer.write_all(&buf)?;
    Ok(())
}
