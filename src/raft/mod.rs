mod config;
mod error;
mod group;
mod log;
mod progress;
mod snapshot;
mod types;

pub use self::config::{GroupConfig, ServerOptions, StorageMode};
pub use self::error::RaftError;
pub use self::group::RaftGroup;
pub use self::log::RaftLog;
pub use self::progress::{Progress, ProgressState};
pub use self::snapshot::SnapshotMeta;
pub use self::types::{
    ConfChange, ConfChangeKind, DownPeer, EntryPayload, GroupStatus, HardState, LogEntry,
    NodeRole, Peer, PeerRole, ReplicaStatus, ServerStatus,
};

pub(crate) use self::config::TickConfig;

/// Messages exchanged between group replicas. The transport carries them
/// opaquely inside [`crate::transport::Envelope`]s.
#[derive(Debug, Clone)]
pub enum RaftMessage {
    /// Pre-vote probe: does not bump terms, so a partitioned node cannot
    /// disrupt a healthy group by campaigning in isolation.
    PreVote {
        term: u64,
        candidate_id: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    PreVoteResponse {
        term: u64,
        vote_granted: bool,
    },
    RequestVote {
        term: u64,
        candidate_id: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteResponse {
        term: u64,
        vote_granted: bool,
    },
    AppendEntries {
        term: u64,
        leader_id: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesResponse {
        term: u64,
        success: bool,
        match_index: u64,
        /// Conflict hint on rejection: the leader jumps its next_index
        /// straight past the follower's conflicting run.
        hint: u64,
    },
    /// Ask the leader to hand leadership to `target`.
    TransferLeader {
        term: u64,
        target: u64,
    },
    /// Leadership transfer signal: the target starts an election
    /// immediately, skipping the randomized wait.
    TimeoutNow {
        term: u64,
    },
    SnapshotChunk {
        term: u64,
        leader_id: u64,
        /// Present on the first message (`seq == 0`) of a transfer.
        meta: Option<SnapshotMeta>,
        seq: u64,
        data: Vec<u8>,
        done: bool,
    },
    SnapshotAck {
        term: u64,
        index: u64,
        success: bool,
    },
}
