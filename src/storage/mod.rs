//! Pluggable log and hard-state backend.
//!
//! A consensus group owns exactly one `Storage` instance. The in-memory
//! and on-disk variants are interchangeable implementations of the same
//! contract; the group never assumes durability beyond what the chosen
//! backend provides.

mod disk;
mod mem;

pub use self::disk::DiskStorage;
pub use self::mem::MemStorage;

use crate::raft::{HardState, LogEntry, RaftError};

/// Log slice bounds are half-open: `entries(lo, hi)` returns indices in
/// `[lo, hi)`. Indices below `first_index()` fail with
/// [`RaftError::Compacted`]; the peer that needs them must be caught up
/// via snapshot transfer instead.
pub trait Storage: Send {
    /// First retained log index. Everything below it has been compacted.
    fn first_index(&self) -> u64;

    /// Last appended log index, or `first_index() - 1` when empty.
    fn last_index(&self) -> u64;

    /// Term of the entry at `index`. Index 0 has term 0; the compaction
    /// boundary `first_index() - 1` keeps its recorded term.
    fn term_at(&self, index: u64) -> Result<u64, RaftError>;

    /// Entries in `[lo, hi)`, with `hi` clamped to `last_index() + 1`.
    fn entries(&self, lo: u64, hi: u64) -> Result<Vec<LogEntry>, RaftError>;

    /// Append entries. They must continue the log contiguously.
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), RaftError>;

    /// Drop all entries with `index >= from` (conflict repair).
    fn truncate_suffix(&mut self, from: u64) -> Result<(), RaftError>;

    /// Compact the prefix: drop all entries with `index <= to`.
    fn truncate_prefix(&mut self, to: u64) -> Result<(), RaftError>;

    /// Reset the log to reflect an installed snapshot covering
    /// `(index, term)`: all entries are dropped and `first_index()`
    /// becomes `index + 1`.
    fn apply_snapshot_mark(&mut self, index: u64, term: u64) -> Result<(), RaftError>;

    fn hard_state(&self) -> HardState;

    /// Persist the hard state. Must be durable (per the backend's
    /// guarantee) before the caller takes any dependent action.
    fn set_hard_state(&mut self, hs: &HardState) -> Result<(), RaftError>;
}
