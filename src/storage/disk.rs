use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::warn;

use crate::raft::{HardState, LogEntry, RaftError};

use super::{MemStorage, Storage};

const LOG_FILE: &str = "log.bin";
const STATE_FILE: &str = "state.bin";

#[derive(bincode::Encode, bincode::Decode)]
struct DiskLog {
    truncated_index: u64,
    truncated_term: u64,
    entries: Vec<LogEntry>,
}

/// Durable storage: the full log state is kept in memory and every
/// mutation rewrites the backing file. Hard state lives in its own file
/// and is flushed before `set_hard_state` returns.
pub struct DiskStorage {
    inner: MemStorage,
    log_file: PathBuf,
    state_file: PathBuf,
}

impl DiskStorage {
    /// Open or create storage under `dir`. A corrupt file is a fatal
    /// startup error: the group fails to come up, the server survives.
    pub fn open(dir: &Path) -> Result<Self, RaftError> {
        std::fs::create_dir_all(dir)?;
        let log_file = dir.join(LOG_FILE);
        let state_file = dir.join(STATE_FILE);

        let (truncated_index, truncated_term, entries) = if log_file.exists() {
            let buffer = read_file(&log_file)?;
            if buffer.is_empty() {
                (0, 0, Vec::new())
            } else {
                let (disk_log, _): (DiskLog, usize) =
                    bincode::decode_from_slice(&buffer, bincode::config::standard())
                        .map_err(|e| corrupt(&log_file, e))?;
                (
                    disk_log.truncated_index,
                    disk_log.truncated_term,
                    disk_log.entries,
                )
            }
        } else {
            (0, 0, Vec::new())
        };

        let hard_state = if state_file.exists() {
            let buffer = read_file(&state_file)?;
            if buffer.is_empty() {
                HardState::default()
            } else {
                let (hs, _): (HardState, usize) =
                    bincode::decode_from_slice(&buffer, bincode::config::standard())
                        .map_err(|e| corrupt(&state_file, e))?;
                hs
            }
        } else {
            HardState::default()
        };

        Ok(Self {
            inner: MemStorage::from_parts(truncated_index, truncated_term, entries, hard_state),
            log_file,
            state_file,
        })
    }

    /// Delete the storage directory of a removed group.
    pub fn destroy(dir: &Path) -> Result<(), RaftError> {
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// Retain the storage directory of a removed group as a backup
    /// artifact by renaming it out of the way.
    pub fn backup(dir: &Path) -> Result<(), RaftError> {
        if !dir.exists() {
            return Ok(());
        }
        let mut target = dir.as_os_str().to_owned();
        target.push(".bak");
        let target = PathBuf::from(target);
        if target.exists() {
            warn!("overwriting previous raft log backup at {target:?}");
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(dir, &target)?;
        Ok(())
    }

    fn save_log(&self) -> Result<(), RaftError> {
        let (truncated_index, truncated_term, entries) = self.inner.parts();
        let disk_log = DiskLog {
            truncated_index,
            truncated_term,
            entries: entries.to_vec(),
        };
        let encoded = bincode::encode_to_vec(&disk_log, bincode::config::standard())
            .map_err(|e| RaftError::Corrupt(e.to_string()))?;
        let mut file = File::create(&self.log_file)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        Ok(())
    }

    fn save_state(&self) -> Result<(), RaftError> {
        let encoded = bincode::encode_to_vec(self.inner.hard_state(), bincode::config::standard())
            .map_err(|e| RaftError::Corrupt(e.to_string()))?;
        let mut file = File::create(&self.state_file)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, RaftError> {
    let mut file = File::open(path)?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    Ok(buffer)
}

fn corrupt(path: &Path, err: bincode::error::DecodeError) -> RaftError {
    RaftError::Corrupt(format!("failed to decode {}: {err}", path.display()))
}

impl Storage for DiskStorage {
    fn first_index(&self) -> u64 {
        self.inner.first_index()
    }

    fn last_index(&self) -> u64 {
        self.inner.last_index()
    }

    fn term_at(&self, index: u64) -> Result<u64, RaftError> {
        self.inner.term_at(index)
    }

    fn entries(&self, lo: u64, hi: u64) -> Result<Vec<LogEntry>, RaftError> {
        self.inner.entries(lo, hi)
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<(), RaftError> {
        self.inner.append(entries)?;
        self.save_log()
    }

    fn truncate_suffix(&mut self, from: u64) -> Result<(), RaftError> {
        self.inner.truncate_suffix(from)?;
        self.save_log()
    }

    fn truncate_prefix(&mut self, to: u64) -> Result<(), RaftError> {
        self.inner.truncate_prefix(to)?;
        self.save_log()
    }

    fn apply_snapshot_mark(&mut self, index: u64, term: u64) -> Result<(), RaftError> {
        self.inner.apply_snapshot_mark(index, term)?;
        self.save_log()
    }

    fn hard_state(&self) -> HardState {
        self.inner.hard_state()
    }

    fn set_hard_state(&mut self, hs: &HardState) -> Result<(), RaftError> {
        self.inner.set_hard_state(hs)?;
        self.save_state()
    }
}
