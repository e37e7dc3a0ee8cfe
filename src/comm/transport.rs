//! Message-layer seam
//!
//! The engine treats the transport as an external collaborator providing
//! point-to-point byte movement with 32-bit tags, a barrier, and
//! MULTIPLE-style threading (any thread may send or receive).
//! [`ChannelTransport`] is an in-process rank mesh used by tests and
//! single-process runs; an MPI binding implements the same trait.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Barrier};
use std::time::Duration;

/// Point-to-point message layer over a fixed set of ranks
pub trait Transport: Send + Sync + 'static {
    /// This process's rank
    fn rank(&self) -> usize;

    /// Number of ranks
    fn size(&self) -> usize;

    /// Send `bytes` to `dst` with `tag`.
    ///
    /// May buffer and return before the receiver has matched (isend
    /// semantics); completion is guaranteed by the matching receive.
    fn send(&self, bytes: &[u8], dst: usize, tag: u32) -> Result<()>;

    /// Receive the message from `src` carrying `tag`
    fn recv(&self, src: usize, tag: u32) -> Result<Vec<u8>>;

    /// Exchange `bytes` with `peer` under one tag, overwriting in place
    fn sendrecv_replace(&self, bytes: &mut Vec<u8>, peer: usize, tag: u32) -> Result<()> {
        self.send(bytes, peer, tag)?;
        *bytes = self.recv(peer, tag)?;
        Ok(())
    }

    /// Block until every rank has entered the barrier
    fn barrier(&self) -> Result<()>;
}

struct Msg {
    src: usize,
    tag: u32,
    bytes: Vec<u8>,
}

/// In-process rank mesh over channels
///
/// Messages match on `(src, tag)`; unmatched arrivals are stashed until a
/// receiver asks for them. A receive that stays unmatched for
/// [`RECV_TIMEOUT`] returns a transport error instead of hanging, which
/// turns protocol deadlocks into test failures.
pub struct ChannelTransport {
    rank: usize,
    peers: Vec<Sender<Msg>>,
    inbox: Mutex<Receiver<Msg>>,
    stash: Mutex<Vec<Msg>>,
    barrier: Arc<Barrier>,
}

/// How long a receive waits before reporting a matching failure
pub const RECV_TIMEOUT: Duration = Duration::from_secs(10);

impl ChannelTransport {
    /// Build a fully-connected mesh of `p` ranks
    pub fn mesh(p: usize) -> Vec<Arc<Self>> {
        assert!(p > 0, "mesh needs at least one rank");
        let mut senders = Vec::with_capacity(p);
        let mut receivers = Vec::with_capacity(p);
        for _ in 0..p {
            let (tx, rx) = channel();
            senders.push(tx);
            receivers.push(rx);
        }
        let barrier = Arc::new(Barrier::new(p));
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, rx)| {
                Arc::new(Self {
                    rank,
                    peers: senders.clone(),
                    inbox: Mutex::new(rx),
                    stash: Mutex::new(Vec::new()),
                    barrier: barrier.clone(),
                })
            })
            .collect()
    }

    /// A single-rank mesh (the default for undistributed matrices)
    pub fn solo() -> Arc<Self> {
        Self::mesh(1).pop().expect("mesh(1) yields one endpoint")
    }

    fn take_stashed(&self, src: usize, tag: u32) -> Option<Vec<u8>> {
        let mut stash = self.stash.lock();
        let at = stash.iter().position(|m| m.src == src && m.tag == tag)?;
        Some(stash.remove(at).bytes)
    }
}

impl Transport for ChannelTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, bytes: &[u8], dst: usize, tag: u32) -> Result<()> {
        if dst >= self.peers.len() {
            return Err(Error::transport(format!("send to rank {} of {}", dst, self.peers.len())));
        }
        self.peers[dst]
            .send(Msg {
                src: self.rank,
                tag,
                bytes: bytes.to_vec(),
            })
            .map_err(|_| Error::transport(format!("rank {} is gone", dst)))
    }

    fn recv(&self, src: usize, tag: u32) -> Result<Vec<u8>> {
        if let Some(bytes) = self.take_stashed(src, tag) {
            return Ok(bytes);
        }
        let inbox = self.inbox.lock();
        loop {
            // another receiver on this rank may have stashed our match
            // while we waited for the inbox
            if let Some(bytes) = self.take_stashed(src, tag) {
                return Ok(bytes);
            }
            match inbox.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) if msg.src == src && msg.tag == tag => return Ok(msg.bytes),
                Ok(msg) => self.stash.lock().push(msg),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(Error::transport(format!(
                        "rank {}: no message from {} with tag {:#x} within {:?}",
                        self.rank, src, tag, RECV_TIMEOUT
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::transport("mesh torn down mid-receive".to_string()));
                }
            }
        }
    }

    fn barrier(&self) -> Result<()> {
        self.barrier.wait();
        Ok(())
    }
}
