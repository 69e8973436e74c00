use log::debug;

use crate::storage::Storage;

use super::{HardState, LogEntry, RaftError};

/// Unified view over the group's storage backend: tracks the commit and
/// apply cursors and implements the log-matching checks shared by leader
/// and follower paths.
pub struct RaftLog {
    store: Box<dyn Storage>,
    committed: u64,
    applied: u64,
}

impl RaftLog {
    /// `applied` is the index the application state machine already
    /// reflects (from its snapshot metadata); recovery never re-delivers
    /// anything at or below it.
    pub fn new(store: Box<dyn Storage>, applied: u64) -> Result<Self, RaftError> {
        let hs = store.hard_state();
        if applied > store.last_index() {
            return Err(RaftError::InvalidArgument(format!(
                "applied index {} beyond last log index {}",
                applied,
                store.last_index()
            )));
        }
        // The entries needed to close the gap are gone; the group would
        // never be able to apply again.
        if applied + 1 < store.first_index() {
            return Err(RaftError::Corrupt(format!(
                "applied index {} below the compaction point {}",
                applied,
                store.first_index() - 1
            )));
        }
        let committed = hs.commit.max(applied);
        Ok(Self {
            store,
            committed,
            applied,
        })
    }

    pub fn first_index(&self) -> u64 {
        self.store.first_index()
    }

    pub fn last_index(&self) -> u64 {
        self.store.last_index()
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn term_at(&self, index: u64) -> Result<u64, RaftError> {
        self.store.term_at(index)
    }

    pub fn last_term(&self) -> u64 {
        self.store.term_at(self.store.last_index()).unwrap_or(0)
    }

    pub fn entries(&self, lo: u64, hi: u64) -> Result<Vec<LogEntry>, RaftError> {
        self.store.entries(lo, hi)
    }

    pub fn hard_state(&self) -> HardState {
        self.store.hard_state()
    }

    pub fn set_hard_state(&mut self, hs: &HardState) -> Result<(), RaftError> {
        self.store.set_hard_state(hs)
    }

    /// Leader-side append of freshly proposed entries.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<(), RaftError> {
        self.store.append(entries)
    }

    /// True when a candidate with `(last_index, last_term)` is at least
    /// as up to date as the local log (vote safety check).
    pub fn is_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        last_term > self.last_term()
            || (last_term == self.last_term() && last_index >= self.last_index())
    }

    /// Follower-side append: verifies the log-matching property at
    /// `(prev_index, prev_term)`, repairs a conflicting tail, appends the
    /// rest. Returns the new matched index, or `None` on mismatch.
    pub fn maybe_append(
        &mut self,
        prev_index: u64,
        prev_term: u64,
        entries: &[LogEntry],
    ) -> Result<Option<u64>, RaftError> {
        if prev_index > self.last_index() {
            return Ok(None);
        }
        // Entries at or below the compaction point were committed and
        // applied; they match by the log-matching property.
        let matches = match self.store.term_at(prev_index) {
            Ok(term) => term == prev_term,
            Err(RaftError::Compacted { .. }) => true,
            Err(e) => return Err(e),
        };
        if !matches {
            return Ok(None);
        }

        for (pos, entry) in entries.iter().enumerate() {
            if entry.index <= self.store.first_index() - 1 {
                continue;
            }
            match self.store.term_at(entry.index) {
                Ok(term) if term == entry.term => continue,
                Ok(_) => {
                    // Conflict: drop our tail and take the leader's.
                    if entry.index <= self.committed {
                        return Err(RaftError::Corrupt(format!(
                            "entry {} conflicts below commit index {}",
                            entry.index, self.committed
                        )));
                    }
                    debug!(
                        "log conflict at index {}, truncating local tail",
                        entry.index
                    );
                    self.store.truncate_suffix(entry.index)?;
                    self.store.append(&entries[pos..])?;
                    break;
                }
                Err(RaftError::InvalidArgument(_)) => {
                    // Past our last index: append the remainder.
                    self.store.append(&entries[pos..])?;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Some(prev_index + entries.len() as u64))
    }

    /// Hint returned with a rejected append so the leader can jump its
    /// next_index over the whole conflicting run instead of probing one
    /// index at a time.
    pub fn conflict_hint(&self, prev_index: u64) -> u64 {
        let mut hint = prev_index.min(self.last_index());
        if hint == 0 {
            return 0;
        }
        if let Ok(term) = self.store.term_at(hint) {
            while hint > self.store.first_index()
                && self.store.term_at(hint - 1).map(|t| t == term).unwrap_or(false)
            {
                hint -= 1;
            }
            hint -= 1;
        }
        hint
    }

    /// Advance the commit cursor; it never moves backward.
    pub fn commit_to(&mut self, index: u64) -> bool {
        let index = index.min(self.last_index());
        if index > self.committed {
            self.committed = index;
            true
        } else {
            false
        }
    }

    /// The next committed-but-unapplied entry, if any.
    pub fn next_unapplied(&self) -> Result<Option<LogEntry>, RaftError> {
        if self.applied >= self.committed {
            return Ok(None);
        }
        let index = self.applied + 1;
        let mut entries = self.store.entries(index, index + 1)?;
        Ok(entries.pop())
    }

    pub fn applied_to(&mut self, index: u64) {
        debug_assert!(index == self.applied + 1);
        self.applied = index;
    }

    /// Compact the log prefix. `index` must not exceed the applied index.
    pub fn compact_to(&mut self, index: u64) -> Result<(), RaftError> {
        if index == 0 || index > self.applied {
            return Err(RaftError::InvalidArgument(format!(
                "truncate index {} must be in 1..={} (applied)",
                index, self.applied
            )));
        }
        self.store.truncate_prefix(index)
    }

    /// Reset the log after a snapshot install covering `(index, term)`.
    pub fn install_snapshot(&mut self, index: u64, term: u64) -> Result<(), RaftError> {
        self.store.apply_snapshot_mark(index, term)?;
        self.committed = self.committed.max(index);
        self.applied = index;
        Ok(())
    }
}
