//! Leader-side snapshot transfer.
//!
//! A peer that is brand new or whose needed entries were compacted away
//! is caught up by streaming an application snapshot instead of log
//! entries. Each transfer holds one slot of the server-wide
//! [`SnapshotGovernor`](crate::server::SnapshotGovernor) for its whole
//! duration; the slot is released on every exit path when the task ends.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::resolver::NodeResolver;
use crate::server::SnapshotGovernor;
use crate::statemachine::Snapshot;
use crate::transport::{Envelope, Transport};

use super::group::GroupEvent;
use super::{Peer, RaftMessage};

/// Self-describing header of a snapshot transfer: the point-in-time
/// `(index, term, membership)` the capture reflects, plus the opaque
/// application context blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct SnapshotMeta {
    pub index: u64,
    pub term: u64,
    pub peers: Vec<Peer>,
    pub context: Vec<u8>,
}

/// Everything a transfer task needs, resolved while the group lock was
/// held. The task itself never touches group state; it reports back
/// through the group's event channel.
pub(crate) struct SnapshotStream {
    pub group_id: u64,
    pub node_id: u64,
    pub term: u64,
    pub to: u64,
    pub meta: SnapshotMeta,
    pub governor: Arc<SnapshotGovernor>,
    pub resolver: Arc<dyn NodeResolver>,
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::UnboundedSender<GroupEvent>,
}

impl SnapshotStream {
    /// Stream the snapshot to the target peer. The final acknowledgment
    /// travels back through the normal message path; this task only
    /// reports whether streaming itself completed.
    pub(crate) async fn run(self, mut snapshot: Box<dyn Snapshot>) {
        let index = self.meta.index;
        let ok = match self.stream(&mut snapshot).await {
            Ok(()) => {
                debug!(
                    "group {} finished streaming snapshot at index {} to node {}",
                    self.group_id, index, self.to
                );
                true
            }
            Err(reason) => {
                warn!(
                    "group {} snapshot transfer to node {} failed: {}",
                    self.group_id, self.to, reason
                );
                false
            }
        };

        // The group may already be gone; nothing left to report to then.
        let _ = self.events.send(GroupEvent::SnapshotStreamed {
            to: self.to,
            index,
            ok,
        });
    }

    async fn stream(&self, snapshot: &mut Box<dyn Snapshot>) -> Result<(), String> {
        let _slot = self
            .governor
            .acquire()
            .await
            .map_err(|e| format!("governor: {e}"))?;

        let addr = self
            .resolver
            .resolve(self.to)
            .map_err(|e| format!("resolve node {}: {e}", self.to))?;

        info!(
            "group {} streaming snapshot at index {} to node {} ({})",
            self.group_id, self.meta.index, self.to, addr
        );

        // Header first, then one message per chunk, then the final marker.
        self.send_chunk(&addr, Some(self.meta.clone()), 0, Vec::new(), false)?;

        let mut seq = 1;
        loop {
            match snapshot.next_chunk() {
                Ok(Some(data)) => {
                    self.send_chunk(&addr, None, seq, data, false)?;
                    seq += 1;
                }
                Ok(None) => {
                    self.send_chunk(&addr, None, seq, Vec::new(), true)?;
                    return Ok(());
                }
                Err(e) => return Err(format!("reading snapshot chunk {seq}: {e}")),
            }
        }
    }

    fn send_chunk(
        &self,
        addr: &str,
        meta: Option<SnapshotMeta>,
        seq: u64,
        data: Vec<u8>,
        done: bool,
    ) -> Result<(), String> {
        let envelope = Envelope {
            group_id: self.group_id,
            from: self.node_id,
            message: RaftMessage::SnapshotChunk {
                term: self.term,
                leader_id: self.node_id,
                meta,
                seq,
                data,
                done,
            },
        };
        self.transport
            .send(addr, envelope)
            .map_err(|e| format!("sending chunk {seq}: {e}"))
    }
}
