//! Application hook contract.
//!
//! The consensus engine is generic over the replicated application: it
//! delivers committed commands, membership changes and snapshots through
//! this trait and never interprets command payloads itself.

use crate::raft::{ConfChange, RaftError};

/// Implemented by the host application. All hooks are invoked from the
/// owning group's event loop: per group, `apply` is called exactly once
/// per index, strictly in increasing index order, across leadership
/// changes and restarts.
pub trait StateMachine: Send + Sync {
    /// Apply a committed command. Returning an error halts the apply
    /// loop at this index; it is retried until it succeeds.
    fn apply(&self, cmd: &[u8], index: u64) -> Result<(), RaftError>;

    /// Apply a committed membership change. The group's own peer table
    /// has already been updated when this is invoked.
    fn apply_member_change(&self, cc: &ConfChange, index: u64) -> Result<(), RaftError>;

    /// A command accepted by `submit` failed before commit (leadership
    /// lost, term changed). The outcome is unknown: the command may still
    /// commit through another leader. Callers must retry idempotently.
    fn on_replicate_error(&self, cmd: &[u8], status: &RaftError);

    /// The group observed a leader change. `leader == 0` means the
    /// leadership is currently unknown.
    fn on_leader_change(&self, leader: u64, term: u64);

    /// Produce a consistent point-in-time capture of the application
    /// state. The returned snapshot must stay readable while the state
    /// machine continues applying newer entries concurrently.
    fn get_snapshot(&self) -> Result<Box<dyn Snapshot>, RaftError>;

    /// Begin installing a snapshot received from the leader. `context` is
    /// the opaque blob the sending side produced via [`Snapshot::context`].
    fn apply_snapshot_start(&self, context: &[u8]) -> Result<(), RaftError>;

    /// Install one ordered batch of snapshot chunks. Must be bounded in
    /// memory: the whole snapshot is never buffered.
    fn apply_snapshot_data(&self, chunks: &[Vec<u8>]) -> Result<(), RaftError>;

    /// Atomically commit the installation. From this point the state
    /// machine's applied index is `index`. Any failure before this call
    /// must leave the previously visible state untouched.
    fn apply_snapshot_finish(&self, index: u64) -> Result<(), RaftError>;
}

/// A point-in-time capture being streamed to one peer. Owned exclusively
/// by the sending transfer session until fully streamed, then dropped.
pub trait Snapshot: Send {
    /// Pull the next chunk, or `None` when the snapshot is exhausted.
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RaftError>;

    /// The log index this capture reflects.
    fn applied_index(&self) -> u64;

    /// Opaque application-level context handed to the receiver's
    /// `apply_snapshot_start`, e.g. a schema or format version tag.
    fn context(&self) -> Vec<u8>;
}
