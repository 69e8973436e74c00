use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not a leader (known leader: {leader:?})")]
    NotLeader { leader: Option<u64> },

    #[error("A conflicting change is already pending")]
    Busy,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Raft group not found: {0}")]
    NotFound(u64),

    #[error("Quorum unreachable or operation timed out")]
    Unavailable,

    #[error("Snapshot installation aborted: {0}")]
    Aborted(String),

    #[error("Log index {index} is compacted (first retained index: {first_index})")]
    Compacted { index: u64, first_index: u64 },

    #[error("Raft server is stopped")]
    Stopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage corruption: {0}")]
    Corrupt(String),
}
