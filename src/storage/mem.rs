use crate::raft::{HardState, LogEntry, RaftError};

use super::Storage;

/// Volatile storage for tests and throwaway groups. Also serves as the
/// shared core of [`super::DiskStorage`], which keeps the same state in
/// memory and mirrors every mutation to disk.
pub struct MemStorage {
    /// Index of the last compacted entry; 0 when nothing was compacted.
    truncated_index: u64,
    truncated_term: u64,
    entries: Vec<LogEntry>,
    hard_state: HardState,
}

impl MemStorage {
    pub fn new() -> Self {
        Self {
            truncated_index: 0,
            truncated_term: 0,
            entries: Vec::new(),
            hard_state: HardState::default(),
        }
    }

    pub(crate) fn from_parts(
        truncated_index: u64,
        truncated_term: u64,
        entries: Vec<LogEntry>,
        hard_state: HardState,
    ) -> Self {
        Self {
            truncated_index,
            truncated_term,
            entries,
            hard_state,
        }
    }

    pub(crate) fn parts(&self) -> (u64, u64, &[LogEntry]) {
        (self.truncated_index, self.truncated_term, &self.entries)
    }

    fn position(&self, index: u64) -> usize {
        (index - self.truncated_index - 1) as usize
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemStorage {
    fn first_index(&self) -> u64 {
        self.truncated_index + 1
    }

    fn last_index(&self) -> u64 {
        self.truncated_index + self.entries.len() as u64
    }

    fn term_at(&self, index: u64) -> Result<u64, RaftError> {
        if index == 0 {
            return Ok(0);
        }
        if index == self.truncated_index {
            return Ok(self.truncated_term);
        }
        if index < self.truncated_index {
            return Err(RaftError::Compacted {
                index,
                first_index: self.first_index(),
            });
        }
        if index > self.last_index() {
            return Err(RaftError::InvalidArgument(format!(
                "log index {} beyond last index {}",
                index,
                self.last_index()
            )));
        }
        Ok(self.entries[self.position(index)].term)
    }

    fn entries(&self, lo: u64, hi: u64) -> Result<Vec<LogEntry>, RaftError> {
        if lo < self.first_index() {
            return Err(RaftError::Compacted {
                index: lo,
                first_index: self.first_index(),
            });
        }
        let hi = hi.min(self.last_index() + 1);
        if lo >= hi {
            return Ok(Vec::new());
        }
        let start = self.position(lo);
        let end = self.position(hi - 1) + 1;
        Ok(self.entries[start..end].to_vec())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<(), RaftError> {
        for entry in entries {
            if entry.index != self.last_index() + 1 {
                return Err(RaftError::InvalidArgument(format!(
                    "non-contiguous append: entry index {} after last index {}",
                    entry.index,
                    self.last_index()
                )));
            }
            self.entries.push(entry.clone());
        }
        Ok(())
    }

    fn truncate_suffix(&mut self, from: u64) -> Result<(), RaftError> {
        if from <= self.truncated_index {
            return Err(RaftError::Compacted {
                index: from,
                first_index: self.first_index(),
            });
        }
        if from > self.last_index() {
            return Ok(());
        }
        let keep = self.position(from);
        self.entries.truncate(keep);
        Ok(())
    }

    fn truncate_prefix(&mut self, to: u64) -> Result<(), RaftError> {
        if to <= self.truncated_index {
            return Ok(());
        }
        let to = to.min(self.last_index());
        let term = self.term_at(to)?;
        let drop = self.position(to) + 1;
        self.entries.drain(..drop);
        self.truncated_index = to;
        self.truncated_term = term;
        Ok(())
    }

    fn apply_snapshot_mark(&mut self, index: u64, term: u64) -> Result<(), RaftError> {
        self.entries.clear();
        self.truncated_index = index;
        self.truncated_term = term;
        Ok(())
    }

    fn hard_state(&self) -> HardState {
        self.hard_state.clone()
    }

    fn set_hard_state(&mut self, hs: &HardState) -> Result<(), RaftError> {
        self.hard_state = hs.clone();
        Ok(())
    }
}
