use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    /// Sending one probe batch at a time until the follower's log
    /// position is known.
    Probe,
    /// Position known, streaming entries.
    Replicate,
    /// Too far behind for incremental catch-up; waiting on a snapshot
    /// transfer.
    Snapshot,
}

impl ProgressState {
    pub fn name(&self) -> &'static str {
        match self {
            ProgressState::Probe => "probe",
            ProgressState::Replicate => "replicate",
            ProgressState::Snapshot => "snapshot",
        }
    }
}

/// Leader-local replication cursor for one peer. Exists only while the
/// node believes it is leader; rebuilt on every leadership acquisition.
#[derive(Debug, Clone)]
pub struct Progress {
    pub match_index: u64,
    pub next_index: u64,
    pub state: ProgressState,
    pub last_contact: Instant,
    /// A snapshot transfer task for this peer is currently running.
    pub snapshot_inflight: bool,
    /// Earliest time another snapshot attempt may start.
    pub snapshot_retry_at: Instant,
}

impl Progress {
    pub fn new(next_index: u64) -> Self {
        Self {
            match_index: 0,
            next_index: next_index.max(1),
            state: ProgressState::Probe,
            last_contact: Instant::now(),
            snapshot_inflight: false,
            snapshot_retry_at: Instant::now(),
        }
    }

    /// Progress for a freshly added member: it has no log at all and is
    /// caught up via snapshot transfer first.
    pub fn new_member() -> Self {
        let mut pr = Self::new(1);
        pr.state = ProgressState::Snapshot;
        pr
    }

    pub fn on_contact(&mut self) {
        self.last_contact = Instant::now();
    }

    /// Successful append acknowledgment up to `index`.
    pub fn on_success(&mut self, index: u64) {
        if index > self.match_index {
            self.match_index = index;
        }
        if index + 1 > self.next_index {
            self.next_index = index + 1;
        }
        if self.state == ProgressState::Probe {
            self.state = ProgressState::Replicate;
        }
    }

    /// Rejected append with the follower's conflict hint: jump straight
    /// past the conflicting run instead of stepping back one index at a
    /// time, which bounds catch-up latency on long divergence.
    pub fn on_reject(&mut self, hint: u64) {
        let backed_off = (hint + 1)
            .min(self.next_index.saturating_sub(1))
            .max(self.match_index + 1);
        self.next_index = backed_off.max(1);
        self.state = ProgressState::Probe;
    }

    /// Switch to snapshot catch-up because the entries this peer needs
    /// have been compacted away.
    pub fn begin_snapshot(&mut self) {
        self.state = ProgressState::Snapshot;
        self.snapshot_inflight = false;
    }

    /// Snapshot installed up to `index`; resume incremental replication.
    pub fn snapshot_done(&mut self, index: u64) {
        self.snapshot_inflight = false;
        self.on_success(index);
        self.state = ProgressState::Probe;
    }

    pub fn snapshot_failed(&mut self, retry_after: Duration) {
        self.snapshot_inflight = false;
        self.snapshot_retry_at = Instant::now() + retry_after;
    }

    /// Whether a new snapshot transfer should be started for this peer.
    pub fn wants_snapshot(&self) -> bool {
        self.state == ProgressState::Snapshot
            && !self.snapshot_inflight
            && Instant::now() >= self.snapshot_retry_at
    }

    pub fn down_for(&self, threshold: Duration) -> Option<Duration> {
        let elapsed = self.last_contact.elapsed();
        if elapsed > threshold {
            Some(elapsed)
        } else {
            None
        }
    }
}
