//! Multi-group server: one process-wide registry owning every consensus
//! group on this node, plus the shared snapshot transfer governor.

mod governor;

pub use self::governor::{SnapshotGovernor, SnapshotSlot};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::raft::{
    GroupConfig, RaftError, RaftGroup, ServerOptions, ServerStatus, StorageMode, TickConfig,
};
use crate::resolver::NodeResolver;
use crate::storage::DiskStorage;
use crate::transport::{Envelope, Transport};

/// Hosts any number of independent consensus groups on one node. Groups
/// share the node's resolver, transport, timing configuration and the
/// snapshot governor; each keeps its own log, membership and elections.
pub struct RaftServer {
    node_id: u64,
    tick: TickConfig,
    resolver: Arc<dyn NodeResolver>,
    transport: Arc<dyn Transport>,
    governor: Arc<SnapshotGovernor>,
    groups: Mutex<HashMap<u64, Arc<RaftGroup>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl RaftServer {
    pub fn new(options: ServerOptions) -> Result<Self, RaftError> {
        options.validate()?;
        let tick = options.tick_config();
        Ok(Self {
            node_id: options.node_id,
            tick,
            resolver: options.resolver,
            transport: options.transport,
            governor: Arc::new(SnapshotGovernor::new(options.max_snapshot_concurrency)),
            groups: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Begin serving. Groups can only be created on a started server.
    pub fn start(&self) -> Result<(), RaftError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RaftError::Stopped);
        }
        if !self.started.swap(true, Ordering::SeqCst) {
            info!("raft server on node {} started", self.node_id);
        }
        Ok(())
    }

    /// Shut everything down: all groups stop, queued snapshot transfers
    /// are woken with [`RaftError::Stopped`]. Idempotent; the server
    /// cannot be restarted afterwards.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("raft server on node {} stopping", self.node_id);
        self.governor.close();
        let groups: Vec<Arc<RaftGroup>> = self.groups.lock().unwrap().drain().map(|(_, g)| g).collect();
        for group in groups {
            group.stop();
        }
    }

    /// Create a new consensus group and start participating in it.
    pub fn create_raft(&self, cfg: GroupConfig) -> Result<Arc<RaftGroup>, RaftError> {
        self.check_running()?;
        let mut groups = self.groups.lock().unwrap();
        if groups.contains_key(&cfg.id) {
            return Err(RaftError::InvalidArgument(format!(
                "group {} already exists",
                cfg.id
            )));
        }
        let id = cfg.id;
        let group = RaftGroup::spawn(
            self.node_id,
            self.tick.clone(),
            Arc::clone(&self.resolver),
            Arc::clone(&self.transport),
            Arc::clone(&self.governor),
            cfg,
        )?;
        groups.insert(id, Arc::clone(&group));
        info!("node {}: group {id} created", self.node_id);
        Ok(group)
    }

    /// Detach a group from this node and release its resources. With
    /// `backup` the on-disk log is kept aside instead of deleted.
    pub fn remove_raft(&self, id: u64, backup: bool) -> Result<(), RaftError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RaftError::Stopped);
        }
        let group = self
            .groups
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or(RaftError::NotFound(id))?;
        let mode = group.storage_mode();
        group.stop();
        if let StorageMode::Disk { path } = mode {
            let result = if backup {
                DiskStorage::backup(&path)
            } else {
                DiskStorage::destroy(&path)
            };
            if let Err(e) = result {
                warn!("node {}: cleaning up storage of group {id}: {e}", self.node_id);
            }
        }
        info!("node {}: group {id} removed (backup: {backup})", self.node_id);
        Ok(())
    }

    pub fn find_raft(&self, id: u64) -> Result<Arc<RaftGroup>, RaftError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RaftError::Stopped);
        }
        self.groups
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(RaftError::NotFound(id))
    }

    /// Snapshot of every group's state plus governor utilization.
    pub fn get_status(&self) -> ServerStatus {
        let groups: Vec<_> = self.groups.lock().unwrap().values().cloned().collect();
        let mut statuses: Vec<_> = groups.iter().map(|g| g.status()).collect();
        statuses.sort_by_key(|s| s.id);
        ServerStatus {
            node_id: self.node_id,
            groups: statuses,
            snapshot_slots_in_use: self.governor.in_use(),
            snapshot_slots_available: self.governor.available(),
        }
    }

    /// Route an inbound envelope to its group. Messages for groups this
    /// node does not host are dropped.
    pub fn dispatch(&self, envelope: Envelope) {
        let group = self.groups.lock().unwrap().get(&envelope.group_id).cloned();
        match group {
            Some(group) => group.deliver(envelope),
            None => debug!(
                "node {}: dropping message for unknown group {}",
                self.node_id, envelope.group_id
            ),
        }
    }

    fn check_running(&self) -> Result<(), RaftError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RaftError::Stopped);
        }
        if !self.started.load(Ordering::SeqCst) {
            return Err(RaftError::Unavailable);
        }
        Ok(())
    }
}

impl Drop for RaftServer {
    fn drop(&mut self) {
        self.stop();
    }
}
