//! One consensus group: election, log replication, membership change and
//! snapshot catch-up for a single replicated log.
//!
//! All group state is mutated under a single mutex: exactly one logical
//! step (message arrival, timer fire, or local submission) runs at a
//! time, while groups and their I/O proceed fully in parallel with each
//! other. The decision logic itself never blocks; only transport and
//! storage calls may.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::resolver::NodeResolver;
use crate::server::SnapshotGovernor;
use crate::statemachine::StateMachine;
use crate::storage::{DiskStorage, MemStorage, Storage};
use crate::transport::{Envelope, Transport};

use super::log::RaftLog;
use super::progress::{Progress, ProgressState};
use super::snapshot::{SnapshotMeta, SnapshotStream};
use super::{
    ConfChange, ConfChangeKind, DownPeer, EntryPayload, GroupConfig, GroupStatus, HardState,
    LogEntry, NodeRole, PeerRole, RaftError, RaftMessage, ReplicaStatus, StorageMode, TickConfig,
};

/// Events consumed by the group's single-threaded event loop.
pub(crate) enum GroupEvent {
    Inbound(Envelope),
    /// A snapshot transfer task finished streaming (the receiver's final
    /// acknowledgment travels separately through the message path).
    SnapshotStreamed { to: u64, index: u64, ok: bool },
    Shutdown,
}

/// Receiver-side state of an in-progress snapshot installation. Dropped
/// wholesale on any error: installation is all-or-nothing.
struct InstallState {
    from: u64,
    next_seq: u64,
    meta: SnapshotMeta,
}

/// Handle to one consensus group. Cheap to share; all operations are
/// routed through the group's internal exclusivity discipline.
pub struct RaftGroup {
    id: u64,
    storage_mode: StorageMode,
    core: Arc<Mutex<GroupCore>>,
    events: mpsc::UnboundedSender<GroupEvent>,
    shutdown: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RaftGroup {
    pub(crate) fn spawn(
        node_id: u64,
        tick: TickConfig,
        resolver: Arc<dyn NodeResolver>,
        transport: Arc<dyn Transport>,
        governor: Arc<SnapshotGovernor>,
        cfg: GroupConfig,
    ) -> Result<Arc<Self>, RaftError> {
        cfg.validate()?;
        let GroupConfig {
            id,
            peers,
            storage,
            applied,
            state_machine,
        } = cfg;

        let store: Box<dyn Storage> = match &storage {
            StorageMode::Memory => Box::new(MemStorage::new()),
            StorageMode::Disk { path } => Box::new(DiskStorage::open(path)?),
        };
        let raft_log = RaftLog::new(store, applied)?;

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let heartbeat = tick.heartbeat_interval;
        let mut core = GroupCore::new(
            id,
            node_id,
            &peers,
            raft_log,
            state_machine,
            tick,
            resolver,
            transport,
            governor,
            events_tx.clone(),
        );
        // Replay entries that were committed before a restart but not
        // yet reflected in the state machine.
        core.apply_ready();
        let core = Arc::new(Mutex::new(core));

        let inbox_core = Arc::clone(&core);
        let inbox = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    GroupEvent::Shutdown => break,
                    GroupEvent::Inbound(envelope) => inbox_core.lock().unwrap().step(envelope),
                    GroupEvent::SnapshotStreamed { to, index, ok } => inbox_core
                        .lock()
                        .unwrap()
                        .on_snapshot_streamed(to, index, ok),
                }
            }
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let tick_core = Arc::clone(&core);
        let tick_flag = Arc::clone(&shutdown);
        let ticker = tokio::spawn(async move {
            loop {
                sleep(heartbeat).await;
                if tick_flag.load(Ordering::SeqCst) {
                    break;
                }
                tick_core.lock().unwrap().tick();
            }
        });

        Ok(Arc::new(Self {
            id,
            storage_mode: storage,
            core,
            events: events_tx,
            shutdown,
            tasks: Mutex::new(vec![inbox, ticker]),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Propose a command. Success means the command entered the
    /// replication pipeline, not that it is durable or committed; the
    /// outcome is delivered through the state machine hooks.
    pub fn submit(&self, cmd: Vec<u8>) -> Result<(), RaftError> {
        self.core.lock().unwrap().submit(cmd)
    }

    /// Propose a membership change. At most one may be in flight per
    /// group; a second proposal is rejected with [`RaftError::Busy`].
    pub fn change_member(&self, cc: ConfChange) -> Result<(), RaftError> {
        self.core.lock().unwrap().change_member(cc)
    }

    /// Compact the local log prefix up to `index` (which must not exceed
    /// the applied index).
    pub fn truncate(&self, index: u64) -> Result<(), RaftError> {
        self.core.lock().unwrap().truncate(index)
    }

    /// Ask the current leader to yield leadership to this node.
    pub fn try_to_leader(&self) -> Result<(), RaftError> {
        self.core.lock().unwrap().try_to_leader()
    }

    pub fn is_leader(&self) -> bool {
        self.core.lock().unwrap().role == NodeRole::Leader
    }

    pub fn leader_term(&self) -> (Option<u64>, u64) {
        let core = self.core.lock().unwrap();
        (core.leader, core.term)
    }

    pub fn status(&self) -> GroupStatus {
        self.core.lock().unwrap().status()
    }

    pub(crate) fn storage_mode(&self) -> StorageMode {
        self.storage_mode.clone()
    }

    pub(crate) fn deliver(&self, envelope: Envelope) {
        if self.events.send(GroupEvent::Inbound(envelope)).is_err() {
            debug!("group {} event loop is gone, dropping message", self.id);
        }
    }

    /// Tear the group down: cancels pending elections, in-flight
    /// replication and any snapshot transfer it owns.
    pub(crate) fn stop(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(GroupEvent::Shutdown);
        {
            let mut core = self.core.lock().unwrap();
            core.stopped = true;
            core.fail_pending(|| RaftError::Stopped);
            for task in core.snapshot_tasks.drain(..) {
                task.abort();
            }
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

struct GroupCore {
    id: u64,
    node_id: u64,
    sm: Arc<dyn StateMachine>,
    log: RaftLog,
    peers: HashMap<u64, super::Peer>,

    role: NodeRole,
    term: u64,
    voted_for: Option<u64>,
    leader: Option<u64>,
    /// (leader, term) last reported through `on_leader_change`.
    announced: (u64, u64),

    progress: HashMap<u64, Progress>,
    votes: HashMap<u64, bool>,
    in_prevote: bool,

    election_deadline: Instant,
    last_heartbeat: Instant,
    last_leader_contact: Instant,

    /// Index of the proposed-but-uncommitted membership change, if any.
    pending_conf: Option<u64>,
    /// Commands accepted while leader, kept until commit so replication
    /// failures can be reported with the original payload.
    pending_cmds: BTreeMap<u64, Vec<u8>>,
    transfer_target: Option<u64>,
    install: Option<InstallState>,

    tick_cfg: TickConfig,
    resolver: Arc<dyn NodeResolver>,
    transport: Arc<dyn Transport>,
    governor: Arc<SnapshotGovernor>,
    events: mpsc::UnboundedSender<GroupEvent>,
    snapshot_tasks: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl GroupCore {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: u64,
        node_id: u64,
        peers: &[super::Peer],
        log: RaftLog,
        sm: Arc<dyn StateMachine>,
        tick_cfg: TickConfig,
        resolver: Arc<dyn NodeResolver>,
        transport: Arc<dyn Transport>,
        governor: Arc<SnapshotGovernor>,
        events: mpsc::UnboundedSender<GroupEvent>,
    ) -> Self {
        let hs = log.hard_state();
        let mut core = Self {
            id,
            node_id,
            sm,
            log,
            peers: peers.iter().map(|p| (p.node_id, *p)).collect(),
            role: NodeRole::Follower,
            term: hs.term,
            voted_for: hs.voted_for,
            leader: None,
            announced: (0, hs.term),
            progress: HashMap::new(),
            votes: HashMap::new(),
            in_prevote: false,
            election_deadline: Instant::now(),
            last_heartbeat: Instant::now(),
            last_leader_contact: Instant::now(),
            pending_conf: None,
            pending_cmds: BTreeMap::new(),
            transfer_target: None,
            install: None,
            tick_cfg,
            resolver,
            transport,
            governor,
            events,
            snapshot_tasks: Vec::new(),
            stopped: false,
        };
        core.randomize_deadline();
        core
    }

    // ---- small helpers ----------------------------------------------

    fn is_voter(&self, node_id: u64) -> bool {
        self.peers
            .get(&node_id)
            .map(|p| p.role == PeerRole::Voter)
            .unwrap_or(false)
    }

    fn voter_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.role == PeerRole::Voter)
            .count()
    }

    fn quorum(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    fn peer_ids(&self) -> Vec<u64> {
        self.peers
            .keys()
            .copied()
            .filter(|id| *id != self.node_id)
            .collect()
    }

    fn randomize_deadline(&mut self) {
        let mut rng = rand::rng();
        let timeout_ms = rng.random_range(
            self.tick_cfg.election_timeout_min..=self.tick_cfg.election_timeout_max,
        );
        self.election_deadline = Instant::now() + Duration::from_millis(timeout_ms);
    }

    fn persist_hard_state(&mut self) -> Result<(), RaftError> {
        let hs = HardState {
            term: self.term,
            voted_for: self.voted_for,
            commit: self.log.committed(),
        };
        self.log.set_hard_state(&hs)
    }

    fn send_to(&self, to: u64, message: RaftMessage) {
        let addr = match self.resolver.resolve(to) {
            Ok(addr) => addr,
            Err(e) => {
                debug!("group {}: cannot resolve node {to}: {e}", self.id);
                return;
            }
        };
        let envelope = Envelope {
            group_id: self.id,
            from: self.node_id,
            message,
        };
        if let Err(e) = self.transport.send(&addr, envelope) {
            debug!("group {}: send to node {to} ({addr}) failed: {e}", self.id);
        }
    }

    fn broadcast(&self, message: RaftMessage) {
        for to in self.peer_ids() {
            self.send_to(to, message.clone());
        }
    }

    fn announce_leader(&mut self) {
        let current = (self.leader.unwrap_or(0), self.term);
        if current != self.announced {
            self.announced = current;
            self.sm.on_leader_change(current.0, current.1);
        }
    }

    fn fail_pending(&mut self, make_status: impl Fn() -> RaftError) {
        let pending = std::mem::take(&mut self.pending_cmds);
        for (index, cmd) in pending {
            debug!(
                "group {}: command at index {index} failed before commit",
                self.id
            );
            self.sm.on_replicate_error(&cmd, &make_status());
        }
    }

    // ---- timers -----------------------------------------------------

    fn tick(&mut self) {
        if self.stopped {
            return;
        }
        if self.role == NodeRole::Leader {
            if self.last_heartbeat.elapsed() >= self.tick_cfg.heartbeat_interval {
                self.send_heartbeats();
            }
            self.check_leader_lease();
            self.maybe_send_snapshots();
        } else if Instant::now() >= self.election_deadline && self.is_voter(self.node_id) {
            self.start_campaign();
        }
    }

    /// A leader that cannot reach a quorum within a full election
    /// timeout steps down instead of lingering as a zombie; the healthy
    /// side of a partition will have elected its own leader by then.
    fn check_leader_lease(&mut self) {
        if self.voter_count() <= 1 {
            return;
        }
        let window = Duration::from_millis(self.tick_cfg.election_timeout_max);
        let mut active = usize::from(self.is_voter(self.node_id));
        for (id, pr) in &self.progress {
            if self.is_voter(*id) && pr.last_contact.elapsed() <= window {
                active += 1;
            }
        }
        if active < self.quorum() {
            info!(
                "group {}: leader lost contact with quorum, stepping down at term {}",
                self.id, self.term
            );
            let term = self.term;
            self.become_follower(term, None);
        }
    }

    // ---- elections --------------------------------------------------

    /// Pre-vote phase: probe for electability without bumping terms, so
    /// a node campaigning behind a partition cannot disrupt the group.
    fn start_campaign(&mut self) {
        self.role = NodeRole::Candidate;
        self.in_prevote = true;
        self.leader = None;
        self.votes.clear();
        self.votes.insert(self.node_id, true);
        self.randomize_deadline();
        self.announce_leader();

        if self.granted_votes() >= self.quorum() {
            self.start_election();
            return;
        }
        debug!(
            "group {}: starting pre-vote at term {}",
            self.id, self.term
        );
        self.broadcast(RaftMessage::PreVote {
            term: self.term + 1,
            candidate_id: self.node_id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        });
    }

    fn start_election(&mut self) {
        self.role = NodeRole::Candidate;
        self.in_prevote = false;
        self.term += 1;
        self.voted_for = Some(self.node_id);
        self.leader = None;
        if let Err(e) = self.persist_hard_state() {
            error!("group {}: persisting vote failed: {e}", self.id);
            return;
        }
        self.votes.clear();
        self.votes.insert(self.node_id, true);
        self.randomize_deadline();
        info!(
            "group {}: node {} starting election for term {}",
            self.id, self.node_id, self.term
        );
        self.broadcast(RaftMessage::RequestVote {
            term: self.term,
            candidate_id: self.node_id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        });
        self.announce_leader();
        self.check_votes();
    }

    fn granted_votes(&self) -> usize {
        self.votes
            .iter()
            .filter(|(id, granted)| **granted && self.is_voter(**id))
            .count()
    }

    fn check_votes(&mut self) {
        if self.granted_votes() >= self.quorum() {
            if self.in_prevote {
                self.start_election();
            } else {
                self.become_leader();
            }
        }
    }

    fn become_leader(&mut self) {
        if self.role != NodeRole::Candidate {
            return;
        }
        info!(
            "group {}: node {} became leader for term {}",
            self.id, self.node_id, self.term
        );
        self.role = NodeRole::Leader;
        self.leader = Some(self.node_id);
        self.transfer_target = None;

        // Per-peer replication state is leader-local and rebuilt on
        // every leadership acquisition.
        let next = self.log.last_index() + 1;
        self.progress.clear();
        for id in self.peer_ids() {
            self.progress.insert(id, Progress::new(next));
        }

        // Re-arm the single-conf-change guard if an uncommitted change
        // is still sitting in the log from an earlier leadership.
        self.pending_conf = None;
        if let Ok(entries) = self
            .log
            .entries(self.log.committed() + 1, self.log.last_index() + 1)
        {
            for entry in &entries {
                if matches!(entry.payload, EntryPayload::ConfChange(_)) {
                    self.pending_conf = Some(entry.index);
                }
            }
        }

        self.announce_leader();
        self.send_heartbeats();
        self.update_commit_index();
    }

    fn become_follower(&mut self, term: u64, leader: Option<u64>) {
        let was_leader = self.role == NodeRole::Leader;
        self.role = NodeRole::Follower;
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            if let Err(e) = self.persist_hard_state() {
                error!("group {}: persisting term failed: {e}", self.id);
            }
        }
        self.leader = leader;
        self.votes.clear();
        self.in_prevote = false;
        self.transfer_target = None;
        self.progress.clear();
        self.randomize_deadline();
        if was_leader {
            let known = self.leader;
            self.fail_pending(|| RaftError::NotLeader { leader: known });
        }
        self.announce_leader();
    }

    // ---- local operations -------------------------------------------

    fn submit(&mut self, cmd: Vec<u8>) -> Result<(), RaftError> {
        if self.stopped {
            return Err(RaftError::Stopped);
        }
        if self.role != NodeRole::Leader {
            return Err(RaftError::NotLeader {
                leader: self.leader,
            });
        }
        // Proposals pause while handing leadership over.
        if self.transfer_target.is_some() {
            return Err(RaftError::Busy);
        }
        let index = self.log.last_index() + 1;
        let entry = LogEntry {
            index,
            term: self.term,
            payload: EntryPayload::Command(cmd.clone()),
        };
        self.log.append(&[entry])?;
        self.pending_cmds.insert(index, cmd);
        self.update_commit_index();
        self.replicate_all();
        Ok(())
    }

    fn change_member(&mut self, cc: ConfChange) -> Result<(), RaftError> {
        if self.stopped {
            return Err(RaftError::Stopped);
        }
        if self.role != NodeRole::Leader {
            return Err(RaftError::NotLeader {
                leader: self.leader,
            });
        }
        if self.pending_conf.is_some() || self.transfer_target.is_some() {
            return Err(RaftError::Busy);
        }
        if cc.peer.node_id == 0 {
            return Err(RaftError::InvalidArgument("peer id must be non-zero".into()));
        }
        match cc.kind {
            ConfChangeKind::Add => {
                if self.peers.contains_key(&cc.peer.node_id) {
                    return Err(RaftError::InvalidArgument(format!(
                        "node {} is already a member",
                        cc.peer.node_id
                    )));
                }
            }
            ConfChangeKind::Remove => {
                if !self.peers.contains_key(&cc.peer.node_id) {
                    return Err(RaftError::InvalidArgument(format!(
                        "node {} is not a member",
                        cc.peer.node_id
                    )));
                }
            }
        }
        let index = self.log.last_index() + 1;
        let entry = LogEntry {
            index,
            term: self.term,
            payload: EntryPayload::ConfChange(cc),
        };
        self.log.append(&[entry])?;
        self.pending_conf = Some(index);
        info!(
            "group {}: proposed membership change {:?} at index {index}",
            self.id, cc
        );
        self.update_commit_index();
        self.replicate_all();
        Ok(())
    }

    fn truncate(&mut self, index: u64) -> Result<(), RaftError> {
        if self.stopped {
            return Err(RaftError::Stopped);
        }
        self.log.compact_to(index)?;
        info!(
            "group {}: log compacted up to index {index} (first retained {})",
            self.id,
            self.log.first_index()
        );
        if self.role == NodeRole::Leader {
            let first = self.log.first_index();
            for pr in self.progress.values_mut() {
                if pr.state != ProgressState::Snapshot && pr.next_index < first {
                    pr.begin_snapshot();
                }
            }
        }
        Ok(())
    }

    fn try_to_leader(&mut self) -> Result<(), RaftError> {
        if self.stopped {
            return Err(RaftError::Stopped);
        }
        if self.role == NodeRole::Leader {
            return Ok(());
        }
        if !self.is_voter(self.node_id) {
            return Err(RaftError::InvalidArgument(
                "a learner cannot take leadership".into(),
            ));
        }
        match self.leader {
            Some(leader) => {
                self.send_to(
                    leader,
                    RaftMessage::TransferLeader {
                        term: self.term,
                        target: self.node_id,
                    },
                );
                Ok(())
            }
            None => Err(RaftError::Unavailable),
        }
    }

    // ---- replication ------------------------------------------------

    fn send_heartbeats(&mut self) {
        self.last_heartbeat = Instant::now();
        for to in self.peer_ids() {
            let prev = match self.progress.get(&to) {
                // Peers mid-snapshot still get heartbeats from their
                // matched position so they keep recognizing the leader.
                Some(pr) if pr.state == ProgressState::Snapshot => pr.match_index,
                Some(pr) => pr.next_index - 1,
                None => continue,
            };
            let prev_term = self.log.term_at(prev).unwrap_or(0);
            self.send_to(
                to,
                RaftMessage::AppendEntries {
                    term: self.term,
                    leader_id: self.node_id,
                    prev_log_index: prev,
                    prev_log_term: prev_term,
                    entries: vec![],
                    leader_commit: self.log.committed(),
                },
            );
        }
    }

    fn replicate_all(&mut self) {
        for to in self.peer_ids() {
            self.replicate_to(to);
        }
    }

    fn replicate_to(&mut self, to: u64) {
        let (next, probing) = match self.progress.get(&to) {
            Some(pr) if pr.state != ProgressState::Snapshot => {
                (pr.next_index, pr.state == ProgressState::Probe)
            }
            _ => return,
        };
        let prev = next - 1;
        let prev_term = match self.log.term_at(prev) {
            Ok(term) => term,
            Err(RaftError::Compacted { .. }) => {
                self.mark_for_snapshot(to);
                return;
            }
            Err(e) => {
                error!("group {}: replicate to {to} failed: {e}", self.id);
                return;
            }
        };
        // Probing peers get one entry at a time until their position is
        // confirmed; replicating peers get full batches.
        let hi = if probing {
            next + 1
        } else {
            next + self.tick_cfg.max_entries_per_append
        };
        let entries = match self.log.entries(next, hi) {
            Ok(entries) => entries,
            Err(RaftError::Compacted { .. }) => {
                self.mark_for_snapshot(to);
                return;
            }
            Err(e) => {
                error!("group {}: reading entries for {to} failed: {e}", self.id);
                return;
            }
        };
        self.send_to(
            to,
            RaftMessage::AppendEntries {
                term: self.term,
                leader_id: self.node_id,
                prev_log_index: prev,
                prev_log_term: prev_term,
                entries,
                leader_commit: self.log.committed(),
            },
        );
    }

    fn mark_for_snapshot(&mut self, to: u64) {
        if let Some(pr) = self.progress.get_mut(&to) {
            if pr.state != ProgressState::Snapshot {
                info!(
                    "group {}: node {to} needs entries before index {}, switching to snapshot",
                    self.id,
                    self.log.first_index()
                );
                pr.begin_snapshot();
            }
        }
    }

    fn update_commit_index(&mut self) {
        if self.role != NodeRole::Leader {
            return;
        }
        let mut matches: Vec<u64> = Vec::new();
        for (id, peer) in &self.peers {
            if peer.role != PeerRole::Voter {
                continue;
            }
            if *id == self.node_id {
                matches.push(self.log.last_index());
            } else {
                matches.push(self.progress.get(id).map(|p| p.match_index).unwrap_or(0));
            }
        }
        if matches.is_empty() {
            return;
        }
        matches.sort_unstable();
        // Largest index replicated on a strict majority of voters.
        let candidate = matches[(matches.len() - 1) / 2];
        if candidate <= self.log.committed() {
            return;
        }
        // Only entries of the current term commit directly; earlier-term
        // entries commit as a side effect (prevents resurrecting an
        // overwritten tail).
        match self.log.term_at(candidate) {
            Ok(term) if term == self.term => {
                self.log.commit_to(candidate);
                if let Err(e) = self.persist_hard_state() {
                    error!("group {}: persisting commit index failed: {e}", self.id);
                }
                self.apply_ready();
            }
            _ => {}
        }
    }

    /// Deliver committed entries to the state machine, strictly in index
    /// order, exactly once per index.
    fn apply_ready(&mut self) {
        let mut conf_applied = false;
        loop {
            let entry = match self.log.next_unapplied() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!("group {}: reading entry to apply failed: {e}", self.id);
                    break;
                }
            };
            let index = entry.index;
            match &entry.payload {
                EntryPayload::Command(cmd) => {
                    if let Err(e) = self.sm.apply(cmd, index) {
                        error!(
                            "group {}: apply at index {index} failed: {e}; retrying later",
                            self.id
                        );
                        break;
                    }
                }
                EntryPayload::ConfChange(cc) => {
                    let cc = *cc;
                    self.apply_conf_change(&cc, index);
                    conf_applied = true;
                    if let Err(e) = self.sm.apply_member_change(&cc, index) {
                        error!(
                            "group {}: member change at index {index} failed: {e}; retrying later",
                            self.id
                        );
                        break;
                    }
                }
            }
            self.log.applied_to(index);
            self.pending_cmds.remove(&index);
            if self.pending_conf == Some(index) {
                self.pending_conf = None;
            }
        }
        // A membership change may have shrunk the quorum, which can make
        // earlier entries committable immediately.
        if conf_applied && self.role == NodeRole::Leader {
            self.update_commit_index();
        }
    }

    /// Membership takes effect as soon as the entry is applied locally,
    /// including for the leader itself. Idempotent so a retried hook
    /// cannot double-apply.
    fn apply_conf_change(&mut self, cc: &ConfChange, index: u64) {
        match cc.kind {
            ConfChangeKind::Add => {
                if self.peers.contains_key(&cc.peer.node_id) {
                    debug!(
                        "group {}: node {} already a member, ignoring add",
                        self.id, cc.peer.node_id
                    );
                    return;
                }
                info!(
                    "group {}: added node {} as {:?} at index {index}",
                    self.id, cc.peer.node_id, cc.peer.role
                );
                self.peers.insert(cc.peer.node_id, cc.peer);
                if self.role == NodeRole::Leader && cc.peer.node_id != self.node_id {
                    // A fresh member has no log; it is caught up via
                    // snapshot transfer before incremental replication.
                    self.progress
                        .insert(cc.peer.node_id, Progress::new_member());
                }
            }
            ConfChangeKind::Remove => {
                if self.peers.remove(&cc.peer.node_id).is_none() {
                    return;
                }
                info!(
                    "group {}: removed node {} at index {index}",
                    self.id, cc.peer.node_id
                );
                self.progress.remove(&cc.peer.node_id);
                if self.transfer_target == Some(cc.peer.node_id) {
                    self.transfer_target = None;
                }
                if cc.peer.node_id == self.node_id && self.role == NodeRole::Leader {
                    // The removal entry is committed at this point, so
                    // stepping down now leaves no leaderless gap.
                    info!("group {}: leader removed itself, stepping down", self.id);
                    let term = self.term;
                    self.become_follower(term, None);
                }
            }
        }
    }

    // ---- snapshot sending -------------------------------------------

    fn maybe_send_snapshots(&mut self) {
        if self.role != NodeRole::Leader {
            return;
        }
        let wanting: Vec<u64> = self
            .progress
            .iter()
            .filter(|(_, pr)| pr.wants_snapshot())
            .map(|(id, _)| *id)
            .collect();
        for to in wanting {
            let snapshot = match self.sm.get_snapshot() {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("group {}: state machine refused snapshot: {e}", self.id);
                    if let Some(pr) = self.progress.get_mut(&to) {
                        pr.snapshot_failed(self.tick_cfg.snapshot_retry);
                    }
                    continue;
                }
            };
            let index = snapshot.applied_index();
            let term = match self.log.term_at(index) {
                Ok(term) => term,
                Err(e) => {
                    warn!(
                        "group {}: no term for snapshot index {index}: {e}",
                        self.id
                    );
                    if let Some(pr) = self.progress.get_mut(&to) {
                        pr.snapshot_failed(self.tick_cfg.snapshot_retry);
                    }
                    continue;
                }
            };
            // Membership is read in the same locked section that produced
            // the snapshot handle. When the state machine hands out a
            // snapshot older than its live state, the peer list here can
            // be newer than `index`; that is safe, as the receiver replays
            // the conf entries above `index` and applies them
            // idempotently.
            let meta = SnapshotMeta {
                index,
                term,
                peers: self.peers.values().copied().collect(),
                context: snapshot.context(),
            };
            if let Some(pr) = self.progress.get_mut(&to) {
                pr.snapshot_inflight = true;
            }
            let stream = SnapshotStream {
                group_id: self.id,
                node_id: self.node_id,
                term: self.term,
                to,
                meta,
                governor: Arc::clone(&self.governor),
                resolver: Arc::clone(&self.resolver),
                transport: Arc::clone(&self.transport),
                events: self.events.clone(),
            };
            self.snapshot_tasks.retain(|task| !task.is_finished());
            self.snapshot_tasks.push(tokio::spawn(stream.run(snapshot)));
        }
    }

    fn on_snapshot_streamed(&mut self, to: u64, index: u64, ok: bool) {
        if self.stopped || self.role != NodeRole::Leader {
            return;
        }
        let retry = self.tick_cfg.snapshot_retry;
        if let Some(pr) = self.progress.get_mut(&to) {
            if pr.state != ProgressState::Snapshot {
                return;
            }
            if ok {
                debug!(
                    "group {}: snapshot at index {index} streamed to node {to}, awaiting ack",
                    self.id
                );
                pr.snapshot_inflight = false;
                pr.snapshot_retry_at = Instant::now() + retry;
            } else {
                pr.snapshot_failed(retry);
            }
        }
    }

    // ---- message dispatch -------------------------------------------

    fn step(&mut self, envelope: Envelope) {
        if self.stopped {
            return;
        }
        let from = envelope.from;
        match envelope.message {
            RaftMessage::PreVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => self.handle_pre_vote(candidate_id, term, last_log_index, last_log_term),
            RaftMessage::PreVoteResponse { term, vote_granted } => {
                self.handle_pre_vote_response(from, term, vote_granted)
            }
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => self.handle_request_vote(candidate_id, term, last_log_index, last_log_term),
            RaftMessage::RequestVoteResponse { term, vote_granted } => {
                self.handle_request_vote_response(from, term, vote_granted)
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                leader_id,
                term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ),
            RaftMessage::AppendEntriesResponse {
                term,
                success,
                match_index,
                hint,
            } => self.handle_append_response(from, term, success, match_index, hint),
            RaftMessage::TransferLeader { term, target } => {
                self.handle_transfer_leader(term, target)
            }
            RaftMessage::TimeoutNow { term } => self.handle_timeout_now(term),
            RaftMessage::SnapshotChunk {
                term,
                leader_id,
                meta,
                seq,
                data,
                done,
            } => self.handle_snapshot_chunk(leader_id, term, meta, seq, data, done),
            RaftMessage::SnapshotAck {
                term,
                index,
                success,
            } => self.handle_snapshot_ack(from, term, index, success),
        }
    }

    fn handle_pre_vote(&mut self, from: u64, term: u64, last_index: u64, last_term: u64) {
        // Pre-votes change no state, not even on a higher term.
        let heard_from_leader = self.leader.is_some()
            && self.last_leader_contact.elapsed()
                < Duration::from_millis(self.tick_cfg.election_timeout_min);
        let vote_granted =
            term >= self.term && !heard_from_leader && self.log.is_up_to_date(last_index, last_term);
        self.send_to(
            from,
            RaftMessage::PreVoteResponse {
                term: self.term,
                vote_granted,
            },
        );
    }

    fn handle_pre_vote_response(&mut self, from: u64, term: u64, vote_granted: bool) {
        if term > self.term {
            self.become_follower(term, None);
            return;
        }
        if self.role == NodeRole::Candidate && self.in_prevote && vote_granted {
            if self.is_voter(from) {
                self.votes.insert(from, true);
            }
            self.check_votes();
        }
    }

    fn handle_request_vote(&mut self, from: u64, term: u64, last_index: u64, last_term: u64) {
        if term > self.term {
            self.become_follower(term, None);
        }
        let mut vote_granted = false;
        if term == self.term
            && self.is_voter(from)
            && (self.voted_for.is_none() || self.voted_for == Some(from))
            && self.log.is_up_to_date(last_index, last_term)
        {
            vote_granted = true;
            self.voted_for = Some(from);
            if let Err(e) = self.persist_hard_state() {
                error!("group {}: persisting vote failed: {e}", self.id);
                return;
            }
            self.randomize_deadline();
        }
        self.send_to(
            from,
            RaftMessage::RequestVoteResponse {
                term: self.term,
                vote_granted,
            },
        );
    }

    fn handle_request_vote_response(&mut self, from: u64, term: u64, vote_granted: bool) {
        if term > self.term {
            self.become_follower(term, None);
            return;
        }
        if self.role == NodeRole::Candidate
            && !self.in_prevote
            && term == self.term
            && vote_granted
        {
            if self.is_voter(from) {
                self.votes.insert(from, true);
            }
            self.check_votes();
        }
    }

    fn handle_append_entries(
        &mut self,
        from: u64,
        term: u64,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) {
        if term < self.term {
            // Stale leader: reply with our term so it deposes itself.
            self.send_to(
                from,
                RaftMessage::AppendEntriesResponse {
                    term: self.term,
                    success: false,
                    match_index: 0,
                    hint: 0,
                },
            );
            return;
        }
        if term > self.term || self.role != NodeRole::Follower {
            self.become_follower(term, Some(from));
        }
        if self.leader != Some(from) {
            self.leader = Some(from);
            self.announce_leader();
        }
        self.randomize_deadline();
        self.last_leader_contact = Instant::now();

        match self.log.maybe_append(prev_index, prev_term, &entries) {
            Ok(Some(matched)) => {
                if self.log.commit_to(leader_commit.min(matched)) {
                    if let Err(e) = self.persist_hard_state() {
                        error!("group {}: persisting commit index failed: {e}", self.id);
                    }
                    self.apply_ready();
                }
                self.send_to(
                    from,
                    RaftMessage::AppendEntriesResponse {
                        term: self.term,
                        success: true,
                        match_index: matched,
                        hint: 0,
                    },
                );
            }
            Ok(None) => {
                let hint = self.log.conflict_hint(prev_index);
                debug!(
                    "group {}: log mismatch at prev index {prev_index}, hint {hint}",
                    self.id
                );
                self.send_to(
                    from,
                    RaftMessage::AppendEntriesResponse {
                        term: self.term,
                        success: false,
                        match_index: 0,
                        hint,
                    },
                );
            }
            Err(e) => {
                error!("group {}: append from leader failed: {e}", self.id);
                self.send_to(
                    from,
                    RaftMessage::AppendEntriesResponse {
                        term: self.term,
                        success: false,
                        match_index: 0,
                        hint: self.log.last_index(),
                    },
                );
            }
        }
    }

    fn handle_append_response(
        &mut self,
        from: u64,
        term: u64,
        success: bool,
        match_index: u64,
        hint: u64,
    ) {
        if term > self.term {
            self.become_follower(term, None);
            return;
        }
        if self.role != NodeRole::Leader || term != self.term {
            return;
        }
        {
            let Some(pr) = self.progress.get_mut(&from) else {
                return;
            };
            pr.on_contact();
            if pr.state == ProgressState::Snapshot {
                return;
            }
            if success {
                pr.on_success(match_index);
            } else {
                pr.on_reject(hint);
            }
        }
        if success {
            let last = self.log.last_index();
            let (caught_up, more) = self
                .progress
                .get(&from)
                .map(|pr| (pr.match_index >= last, pr.next_index <= last))
                .unwrap_or((false, false));
            self.update_commit_index();
            if self.transfer_target == Some(from) && caught_up {
                self.complete_transfer(from);
                return;
            }
            if more {
                self.replicate_to(from);
            }
        } else {
            let needs_snapshot = self
                .progress
                .get(&from)
                .map(|pr| pr.next_index < self.log.first_index())
                .unwrap_or(false);
            if needs_snapshot {
                self.mark_for_snapshot(from);
            } else {
                self.replicate_to(from);
            }
        }
    }

    fn handle_transfer_leader(&mut self, term: u64, target: u64) {
        if self.role != NodeRole::Leader || term != self.term {
            return;
        }
        if target == self.node_id {
            return;
        }
        if !self.is_voter(target) {
            debug!(
                "group {}: ignoring leadership transfer to non-voter {target}",
                self.id
            );
            return;
        }
        let Some(pr) = self.progress.get(&target) else {
            return;
        };
        info!(
            "group {}: leadership transfer to node {target} requested",
            self.id
        );
        self.transfer_target = Some(target);
        if pr.match_index >= self.log.last_index() {
            self.complete_transfer(target);
        } else {
            // Keep pushing entries; completion is checked on each ack.
            self.replicate_to(target);
        }
    }

    fn complete_transfer(&mut self, target: u64) {
        info!(
            "group {}: target node {target} caught up, yielding leadership",
            self.id
        );
        self.send_to(target, RaftMessage::TimeoutNow { term: self.term });
        let term = self.term;
        self.become_follower(term, None);
    }

    fn handle_timeout_now(&mut self, term: u64) {
        if term < self.term || self.role == NodeRole::Leader || !self.is_voter(self.node_id) {
            return;
        }
        info!(
            "group {}: received leadership handoff, campaigning immediately",
            self.id
        );
        if term > self.term {
            self.become_follower(term, None);
        }
        // Skip the pre-vote phase: the old leader just vouched for us.
        self.start_election();
    }

    // ---- snapshot receiving -----------------------------------------

    fn handle_snapshot_chunk(
        &mut self,
        from: u64,
        term: u64,
        meta: Option<SnapshotMeta>,
        seq: u64,
        data: Vec<u8>,
        done: bool,
    ) {
        if term < self.term {
            // A deposed leader's stray chunk must not abort a transfer
            // the current leader is driving; reject without touching the
            // installation state.
            self.send_to(
                from,
                RaftMessage::SnapshotAck {
                    term: self.term,
                    index: 0,
                    success: false,
                },
            );
            return;
        }
        if term > self.term || self.role != NodeRole::Follower {
            self.become_follower(term, Some(from));
        }
        if self.leader != Some(from) {
            self.leader = Some(from);
            self.announce_leader();
        }
        self.randomize_deadline();
        self.last_leader_contact = Instant::now();

        if seq == 0 {
            let Some(meta) = meta else {
                warn!("group {}: snapshot header without metadata", self.id);
                self.nack_snapshot(from, 0);
                return;
            };
            if meta.index <= self.log.applied() {
                // Duplicate transfer for state we already hold: confirm
                // it so the leader resumes incremental replication.
                self.send_to(
                    from,
                    RaftMessage::SnapshotAck {
                        term: self.term,
                        index: meta.index,
                        success: true,
                    },
                );
                return;
            }
            if self.install.is_some() {
                warn!("group {}: restarting snapshot installation", self.id);
            }
            if let Err(e) = self.sm.apply_snapshot_start(&meta.context) {
                warn!("group {}: snapshot start rejected: {e}", self.id);
                self.install = None;
                self.nack_snapshot(from, meta.index);
                return;
            }
            info!(
                "group {}: installing snapshot at index {} from node {from}",
                self.id, meta.index
            );
            self.install = Some(InstallState {
                from,
                next_seq: 1,
                meta,
            });
            return;
        }

        let Some(mut install) = self.install.take() else {
            debug!("group {}: snapshot chunk without installation", self.id);
            self.nack_snapshot(from, 0);
            return;
        };
        if install.from != from || seq != install.next_seq {
            // Out-of-order or interleaved transfer: abort outright, the
            // sender restarts from scratch. No partial state is visible
            // because finish was never called.
            warn!(
                "group {}: aborting snapshot install (expected seq {} from {}, got {seq} from {from})",
                self.id, install.next_seq, install.from
            );
            self.nack_snapshot(from, install.meta.index);
            return;
        }

        if !done {
            if let Err(e) = self.sm.apply_snapshot_data(&[data]) {
                warn!("group {}: snapshot chunk rejected: {e}", self.id);
                self.nack_snapshot(from, install.meta.index);
                return;
            }
            install.next_seq += 1;
            self.install = Some(install);
            return;
        }

        let meta = install.meta;
        if let Err(e) = self.sm.apply_snapshot_finish(meta.index) {
            warn!("group {}: snapshot finish rejected: {e}", self.id);
            self.nack_snapshot(from, meta.index);
            return;
        }
        if let Err(e) = self.log.install_snapshot(meta.index, meta.term) {
            error!("group {}: resetting log after snapshot failed: {e}", self.id);
            self.nack_snapshot(from, meta.index);
            return;
        }
        // The snapshot carries the membership it was taken under.
        self.peers = meta.peers.iter().map(|p| (p.node_id, *p)).collect();
        if let Err(e) = self.persist_hard_state() {
            error!("group {}: persisting snapshot state failed: {e}", self.id);
        }
        info!(
            "group {}: snapshot installed, applied index now {}",
            self.id, meta.index
        );
        self.send_to(
            from,
            RaftMessage::SnapshotAck {
                term: self.term,
                index: meta.index,
                success: true,
            },
        );
    }

    fn nack_snapshot(&mut self, to: u64, index: u64) {
        self.install = None;
        self.send_to(
            to,
            RaftMessage::SnapshotAck {
                term: self.term,
                index,
                success: false,
            },
        );
    }

    fn handle_snapshot_ack(&mut self, from: u64, term: u64, index: u64, success: bool) {
        if term > self.term {
            self.become_follower(term, None);
            return;
        }
        if self.role != NodeRole::Leader {
            return;
        }
        let retry = self.tick_cfg.snapshot_retry;
        let finished = {
            let Some(pr) = self.progress.get_mut(&from) else {
                return;
            };
            pr.on_contact();
            if pr.state != ProgressState::Snapshot {
                return;
            }
            if success {
                info!(
                    "group {}: node {from} installed snapshot at index {index}",
                    self.id
                );
                pr.snapshot_done(index);
                true
            } else {
                debug!("group {}: node {from} rejected snapshot", self.id);
                pr.snapshot_failed(retry);
                false
            }
        };
        if finished {
            // Resume incremental replication for the tail.
            self.replicate_to(from);
        }
    }

    // ---- introspection ----------------------------------------------

    fn status(&self) -> GroupStatus {
        let mut replicas = Vec::new();
        let mut down_peers = Vec::new();
        let mut pending_peers = Vec::new();
        if self.role == NodeRole::Leader {
            for (id, pr) in &self.progress {
                replicas.push(ReplicaStatus {
                    node_id: *id,
                    match_index: pr.match_index,
                    next_index: pr.next_index,
                    state: pr.state.name().to_string(),
                });
                if let Some(down) = pr.down_for(self.tick_cfg.down_after) {
                    down_peers.push(DownPeer {
                        node_id: *id,
                        down_seconds: down.as_secs(),
                    });
                }
                if pr.state == ProgressState::Snapshot
                    || pr.match_index + self.tick_cfg.pending_lag < self.log.committed()
                {
                    pending_peers.push(*id);
                }
            }
            replicas.sort_by_key(|r| r.node_id);
            down_peers.sort_by_key(|d| d.node_id);
            pending_peers.sort_unstable();
        }
        let mut peers: Vec<super::Peer> = self.peers.values().copied().collect();
        peers.sort_by_key(|p| p.node_id);
        GroupStatus {
            id: self.id,
            role: self.role,
            leader: self.leader,
            term: self.term,
            commit_index: self.log.committed(),
            applied_index: self.log.applied(),
            first_index: self.log.first_index(),
            last_index: self.log.last_index(),
            peers,
            replicas,
            down_peers,
            pending_peers,
        }
    }
}
