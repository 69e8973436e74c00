//! Message transport seam.
//!
//! The engine never implements a wire protocol; it hands fully formed
//! envelopes to a [`Transport`]. The in-process [`ChannelTransport`]
//! backs the integration tests and doubles as a reference for real
//! network implementations. Its partition controls simulate link
//! failures without touching the consensus code.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use log::debug;
use tokio::sync::mpsc;

use crate::raft::{RaftError, RaftMessage};

/// One routed consensus message. `group_id` multiplexes many groups over
/// a single node-to-node link.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub group_id: u64,
    pub from: u64,
    pub message: RaftMessage,
}

/// Fire-and-forget message delivery. Implementations must not block the
/// caller; loss and duplication are tolerated by the protocol.
pub trait Transport: Send + Sync {
    fn send(&self, addr: &str, envelope: Envelope) -> Result<(), RaftError>;
}

struct ChannelInner {
    mailboxes: HashMap<String, mpsc::UnboundedSender<Envelope>>,
    blocked_addrs: HashSet<String>,
    blocked_nodes: HashSet<u64>,
}

/// In-process transport: a registry of per-address mailboxes.
pub struct ChannelTransport {
    inner: Mutex<ChannelInner>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ChannelInner {
                mailboxes: HashMap::new(),
                blocked_addrs: HashSet::new(),
                blocked_nodes: HashSet::new(),
            }),
        }
    }

    /// Register a mailbox for `addr`; the caller drains the receiver and
    /// routes envelopes into its server.
    pub fn register(&self, addr: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap()
            .mailboxes
            .insert(addr.to_string(), tx);
        rx
    }

    /// Drop every message to `addr` and from `node_id`, simulating a
    /// fully partitioned node.
    pub fn isolate(&self, node_id: u64, addr: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocked_addrs.insert(addr.to_string());
        inner.blocked_nodes.insert(node_id);
    }

    /// Undo [`ChannelTransport::isolate`].
    pub fn heal(&self, node_id: u64, addr: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocked_addrs.remove(addr);
        inner.blocked_nodes.remove(&node_id);
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ChannelTransport {
    fn send(&self, addr: &str, envelope: Envelope) -> Result<(), RaftError> {
        let inner = self.inner.lock().unwrap();
        if inner.blocked_addrs.contains(addr) || inner.blocked_nodes.contains(&envelope.from) {
            debug!("dropping message to partitioned address {addr}");
            return Ok(());
        }
        match inner.mailboxes.get(addr) {
            Some(tx) => {
                // A closed mailbox means the peer went away; the protocol
                // retries, so this is not an error for the caller.
                if tx.send(envelope).is_err() {
                    debug!("mailbox for {addr} is closed, dropping message");
                }
                Ok(())
            }
            None => {
                debug!("no mailbox registered for {addr}, dropping message");
                Ok(())
            }
        }
    }
}
