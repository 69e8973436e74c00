use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::resolver::NodeResolver;
use crate::statemachine::StateMachine;
use crate::transport::Transport;

use super::{Peer, PeerRole, RaftError};

/// Server-wide options, shared by every consensus group on this node.
pub struct ServerOptions {
    pub node_id: u64,
    pub resolver: Arc<dyn NodeResolver>,
    pub transport: Arc<dyn Transport>,
    /// Upper bound on simultaneous outbound snapshot transfers across
    /// all groups. Requests beyond it queue, they are never refused.
    pub max_snapshot_concurrency: usize,
    pub election_timeout_min: u64, // in milliseconds
    pub election_timeout_max: u64, // in milliseconds
    pub heartbeat_interval: u64,   // in milliseconds
    /// A peer with no contact for this long is reported down.
    pub down_after: u64, // in milliseconds
    /// A peer trailing the commit index by more than this many entries
    /// is reported pending.
    pub pending_lag: u64,
    pub max_entries_per_append: u64,
}

impl ServerOptions {
    pub fn new(
        node_id: u64,
        resolver: Arc<dyn NodeResolver>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            node_id,
            resolver,
            transport,
            max_snapshot_concurrency: 5,
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            down_after: 3000,
            pending_lag: 64,
            max_entries_per_append: 64,
        }
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        if self.node_id == 0 {
            return Err(RaftError::InvalidArgument("node id must be non-zero".into()));
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::InvalidArgument(
                "election timeout range must be non-empty".into(),
            ));
        }
        if self.heartbeat_interval == 0
            || self.heartbeat_interval * 2 > self.election_timeout_min
        {
            return Err(RaftError::InvalidArgument(
                "heartbeat interval must be well below the election timeout".into(),
            ));
        }
        if self.max_snapshot_concurrency == 0 {
            return Err(RaftError::InvalidArgument(
                "max snapshot concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn tick_config(&self) -> TickConfig {
        TickConfig {
            election_timeout_min: self.election_timeout_min,
            election_timeout_max: self.election_timeout_max,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval),
            down_after: Duration::from_millis(self.down_after),
            pending_lag: self.pending_lag,
            max_entries_per_append: self.max_entries_per_append,
            // Failed or stalled transfers retry after a full election
            // timeout so a flapping peer cannot monopolize a slot.
            snapshot_retry: Duration::from_millis(self.election_timeout_max),
        }
    }
}

/// Timing knobs handed to each group's event loop.
#[derive(Debug, Clone)]
pub(crate) struct TickConfig {
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    pub heartbeat_interval: Duration,
    pub down_after: Duration,
    pub pending_lag: u64,
    pub max_entries_per_append: u64,
    pub snapshot_retry: Duration,
}

/// Where a group keeps its log and hard state.
#[derive(Debug, Clone)]
pub enum StorageMode {
    Memory,
    Disk { path: PathBuf },
}

/// Per-group creation options.
pub struct GroupConfig {
    pub id: u64,
    /// Initial membership, local node included.
    pub peers: Vec<Peer>,
    pub storage: StorageMode,
    /// Index the bound state machine already reflects (from its snapshot
    /// metadata). Apply resumes strictly after it.
    pub applied: u64,
    pub state_machine: Arc<dyn StateMachine>,
}

impl GroupConfig {
    pub fn new(id: u64, peers: Vec<Peer>, state_machine: Arc<dyn StateMachine>) -> Self {
        Self {
            id,
            peers,
            storage: StorageMode::Memory,
            applied: 0,
            state_machine,
        }
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        if self.peers.is_empty() {
            return Err(RaftError::InvalidArgument("peer list is empty".into()));
        }
        if !self.peers.iter().any(|p| p.role == PeerRole::Voter) {
            return Err(RaftError::InvalidArgument(
                "peer list contains no voters".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            if peer.node_id == 0 {
                return Err(RaftError::InvalidArgument("peer id must be non-zero".into()));
            }
            if !seen.insert(peer.node_id) {
                return Err(RaftError::InvalidArgument(format!(
                    "duplicate peer id {}",
                    peer.node_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::RaftError;
    use crate::resolver::StaticResolver;
    use crate::statemachine::{Snapshot, StateMachine};
    use crate::transport::ChannelTransport;

    struct NullSm;

    impl StateMachine for NullSm {
        fn apply(&self, _cmd: &[u8], _index: u64) -> Result<(), RaftError> {
            Ok(())
        }
        fn apply_member_change(
            &self,
            _cc: &crate::raft::ConfChange,
            _index: u64,
        ) -> Result<(), RaftError> {
            Ok(())
        }
        fn on_replicate_error(&self, _cmd: &[u8], _status: &RaftError) {}
        fn on_leader_change(&self, _leader: u64, _term: u64) {}
        fn get_snapshot(&self) -> Result<Box<dyn Snapshot>, RaftError> {
            Err(RaftError::InvalidArgument("no snapshot".into()))
        }
        fn apply_snapshot_start(&self, _context: &[u8]) -> Result<(), RaftError> {
            Ok(())
        }
        fn apply_snapshot_data(&self, _chunks: &[Vec<u8>]) -> Result<(), RaftError> {
            Ok(())
        }
        fn apply_snapshot_finish(&self, _index: u64) -> Result<(), RaftError> {
            Ok(())
        }
    }

    fn options() -> ServerOptions {
        ServerOptions::new(
            1,
            Arc::new(StaticResolver::new()),
            Arc::new(ChannelTransport::new()),
        )
    }

    #[test]
    fn default_options_are_valid() {
        assert!(options().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_election_timeout_range() {
        let mut opts = options();
        opts.election_timeout_min = 300;
        opts.election_timeout_max = 150;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn group_config_requires_a_voter() {
        let cfg = GroupConfig::new(1, vec![Peer::learner(1)], Arc::new(NullSm));
        assert!(matches!(
            cfg.validate(),
            Err(RaftError::InvalidArgument(_))
        ));
    }

    #[test]
    fn group_config_rejects_duplicate_peers() {
        let cfg = GroupConfig::new(
            1,
            vec![Peer::voter(1), Peer::voter(2), Peer::voter(2)],
            Arc::new(NullSm),
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn group_config_rejects_empty_peer_list() {
        let cfg = GroupConfig::new(1, vec![], Arc::new(NullSm));
        assert!(cfg.validate().is_err());
    }
}
