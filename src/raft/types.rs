use serde::{Deserialize, Serialize};

/// Role the local node currently plays inside one consensus group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// Membership role of a peer. Learners receive log entries and snapshots
/// but never vote and never count toward quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum PeerRole {
    Voter,
    Learner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Peer {
    pub node_id: u64,
    pub role: PeerRole,
}

impl Peer {
    pub fn voter(node_id: u64) -> Self {
        Self {
            node_id,
            role: PeerRole::Voter,
        }
    }

    pub fn learner(node_id: u64) -> Self {
        Self {
            node_id,
            role: PeerRole::Learner,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum ConfChangeKind {
    Add,
    Remove,
}

/// A membership change, replicated through the log as a special entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ConfChange {
    pub kind: ConfChangeKind,
    pub peer: Peer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum EntryPayload {
    Command(Vec<u8>),
    ConfChange(ConfChange),
}

/// One replicated log entry. Indices start at 1 and are strictly
/// increasing per group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub payload: EntryPayload,
}

/// Durable per-group state. Persisted before any externally visible
/// action that depends on it (vote cast, term advance).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<u64>,
    pub commit: u64,
}

/// A peer the leader has not heard from for longer than the liveness
/// threshold. Derived on status queries, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownPeer {
    pub node_id: u64,
    pub down_seconds: u64,
}

/// Leader-local view of one peer's replication cursor, exposed through
/// status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub node_id: u64,
    pub match_index: u64,
    pub next_index: u64,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupStatus {
    pub id: u64,
    pub role: NodeRole,
    pub leader: Option<u64>,
    pub term: u64,
    pub commit_index: u64,
    pub applied_index: u64,
    pub first_index: u64,
    pub last_index: u64,
    pub peers: Vec<Peer>,
    pub replicas: Vec<ReplicaStatus>,
    pub down_peers: Vec<DownPeer>,
    pub pending_peers: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub node_id: u64,
    pub groups: Vec<GroupStatus>,
    pub snapshot_slots_in_use: usize,
    pub snapshot_slots_available: usize,
}
