//! Shared harness for the integration tests: an in-process cluster of
//! servers wired through [`ChannelTransport`], plus a recording state
//! machine with real snapshot support.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::sleep;

use multiraft::{
    ChannelTransport, ConfChange, GroupConfig, Peer, RaftError, RaftGroup, RaftServer,
    ServerOptions, Snapshot, StateMachine, StaticResolver,
};

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn addr(node: u64) -> String {
    format!("node-{node}")
}

pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(20)).await;
    }
}

#[derive(Default)]
struct SmState {
    applied: u64,
    commands: Vec<(u64, Vec<u8>)>,
    member_changes: Vec<(u64, ConfChange)>,
    leader_changes: Vec<(u64, u64)>,
    replicate_errors: Vec<Vec<u8>>,
    /// Out-of-order or duplicate deliveries; always expected empty.
    violations: Vec<String>,
    snapshot_installs: u64,
    incoming: Option<Vec<Vec<u8>>>,
}

/// Records every hook invocation and checks that applies arrive exactly
/// once, strictly in index order. Snapshots carry the full command
/// history, chunked to exercise the streaming path.
#[derive(Default)]
pub struct TestSm {
    inner: Mutex<SmState>,
}

impl TestSm {
    pub fn new() -> Self {
        Self::default()
    }

    /// A state machine that already reflects everything up to `index`,
    /// as after loading a local snapshot on restart.
    pub fn with_applied(index: u64) -> Self {
        let sm = Self::default();
        sm.inner.lock().unwrap().applied = index;
        sm
    }

    pub fn applied_index(&self) -> u64 {
        self.inner.lock().unwrap().applied
    }

    pub fn commands(&self) -> Vec<(u64, Vec<u8>)> {
        self.inner.lock().unwrap().commands.clone()
    }

    pub fn member_changes(&self) -> Vec<(u64, ConfChange)> {
        self.inner.lock().unwrap().member_changes.clone()
    }

    pub fn leader_changes(&self) -> Vec<(u64, u64)> {
        self.inner.lock().unwrap().leader_changes.clone()
    }

    pub fn replicate_errors(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().replicate_errors.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.inner.lock().unwrap().violations.clone()
    }

    pub fn snapshot_installs(&self) -> u64 {
        self.inner.lock().unwrap().snapshot_installs
    }
}

impl StateMachine for TestSm {
    fn apply(&self, cmd: &[u8], index: u64) -> Result<(), RaftError> {
        let mut state = self.inner.lock().unwrap();
        let applied = state.applied;
        if index != applied + 1 {
            state
                .violations
                .push(format!("apply at index {index} after applied {applied}"));
        }
        state.commands.push((index, cmd.to_vec()));
        state.applied = index;
        Ok(())
    }

    fn apply_member_change(&self, cc: &ConfChange, index: u64) -> Result<(), RaftError> {
        let mut state = self.inner.lock().unwrap();
        let applied = state.applied;
        if index != applied + 1 {
            state
                .violations
                .push(format!("member change at index {index} after applied {applied}"));
        }
        state.member_changes.push((index, *cc));
        state.applied = index;
        Ok(())
    }

    fn on_replicate_error(&self, cmd: &[u8], _status: &RaftError) {
        self.inner.lock().unwrap().replicate_errors.push(cmd.to_vec());
    }

    fn on_leader_change(&self, leader: u64, term: u64) {
        self.inner.lock().unwrap().leader_changes.push((leader, term));
    }

    fn get_snapshot(&self) -> Result<Box<dyn Snapshot>, RaftError> {
        let state = self.inner.lock().unwrap();
        let mut batches = VecDeque::new();
        for batch in state.commands.chunks(3) {
            let encoded = bincode::encode_to_vec(batch.to_vec(), bincode::config::standard())
                .map_err(|e| RaftError::Corrupt(e.to_string()))?;
            batches.push_back(encoded);
        }
        Ok(Box::new(TestSnapshot {
            applied: state.applied,
            batches,
        }))
    }

    fn apply_snapshot_start(&self, _context: &[u8]) -> Result<(), RaftError> {
        self.inner.lock().unwrap().incoming = Some(Vec::new());
        Ok(())
    }

    fn apply_snapshot_data(&self, chunks: &[Vec<u8>]) -> Result<(), RaftError> {
        let mut state = self.inner.lock().unwrap();
        match state.incoming.as_mut() {
            Some(incoming) => {
                incoming.extend(chunks.iter().cloned());
                Ok(())
            }
            None => Err(RaftError::Aborted("no snapshot installation".into())),
        }
    }

    fn apply_snapshot_finish(&self, index: u64) -> Result<(), RaftError> {
        let mut state = self.inner.lock().unwrap();
        let incoming = state
            .incoming
            .take()
            .ok_or_else(|| RaftError::Aborted("no snapshot installation".into()))?;
        let mut commands = Vec::new();
        for chunk in incoming {
            let (batch, _): (Vec<(u64, Vec<u8>)>, usize) =
                bincode::decode_from_slice(&chunk, bincode::config::standard())
                    .map_err(|e| RaftError::Corrupt(e.to_string()))?;
            commands.extend(batch);
        }
        // Replace wholesale: installation is atomic from the outside.
        state.commands = commands;
        state.applied = index;
        state.snapshot_installs += 1;
        Ok(())
    }
}

struct TestSnapshot {
    applied: u64,
    batches: VecDeque<Vec<u8>>,
}

impl Snapshot for TestSnapshot {
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RaftError> {
        Ok(self.batches.pop_front())
    }

    fn applied_index(&self) -> u64 {
        self.applied
    }

    fn context(&self) -> Vec<u8> {
        Vec::new()
    }
}

pub struct TestNode {
    pub id: u64,
    pub server: Arc<RaftServer>,
    /// One recording state machine per group hosted on this node.
    sms: Mutex<BTreeMap<u64, Arc<TestSm>>>,
}

pub struct Cluster {
    pub transport: Arc<ChannelTransport>,
    pub resolver: Arc<StaticResolver>,
    pub nodes: BTreeMap<u64, TestNode>,
    pumps: Vec<JoinHandle<()>>,
}

impl Cluster {
    pub fn new(ids: &[u64]) -> Self {
        init_logs();
        let transport = Arc::new(ChannelTransport::new());
        let resolver = Arc::new(StaticResolver::new());
        let mut cluster = Self {
            transport,
            resolver,
            nodes: BTreeMap::new(),
            pumps: Vec::new(),
        };
        for id in ids {
            cluster.add_node(*id);
        }
        cluster
    }

    /// Bring up one more server and plug it into the shared transport.
    pub fn add_node(&mut self, id: u64) {
        self.resolver.add_node(id, &addr(id));
        let options = ServerOptions::new(id, self.resolver.clone(), self.transport.clone());
        let server = Arc::new(RaftServer::new(options).unwrap());
        server.start().unwrap();

        let mut mailbox = self.transport.register(&addr(id));
        let pump_server = Arc::clone(&server);
        self.pumps.push(tokio::spawn(async move {
            while let Some(envelope) = mailbox.recv().await {
                pump_server.dispatch(envelope);
            }
        }));

        self.nodes.insert(
            id,
            TestNode {
                id,
                server,
                sms: Mutex::new(BTreeMap::new()),
            },
        );
    }

    /// Create the same group on every listed node, with all of them as
    /// initial voters.
    pub fn create_group(&self, group_id: u64, members: &[u64]) {
        let peers: Vec<Peer> = members.iter().map(|id| Peer::voter(*id)).collect();
        for id in members {
            self.create_group_on(*id, group_id, peers.clone());
        }
    }

    pub fn create_group_on(&self, node: u64, group_id: u64, peers: Vec<Peer>) {
        let node = &self.nodes[&node];
        let sm = Arc::new(TestSm::new());
        node.sms.lock().unwrap().insert(group_id, Arc::clone(&sm));
        let cfg = GroupConfig::new(group_id, peers, sm);
        node.server.create_raft(cfg).unwrap();
    }

    pub fn group(&self, node: u64, group_id: u64) -> Arc<RaftGroup> {
        self.nodes[&node].server.find_raft(group_id).unwrap()
    }

    pub fn sm(&self, node: u64, group_id: u64) -> Arc<TestSm> {
        Arc::clone(&self.nodes[&node].sms.lock().unwrap()[&group_id])
    }

    pub async fn wait_for_leader(&self, group_id: u64) -> u64 {
        self.wait_for_leader_other_than(group_id, 0).await
    }

    /// Wait for some node other than `not` to claim leadership (pass 0
    /// to accept any node).
    pub async fn wait_for_leader_other_than(&self, group_id: u64, not: u64) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            for (id, node) in &self.nodes {
                if *id == not {
                    continue;
                }
                if let Ok(group) = node.server.find_raft(group_id) {
                    if group.is_leader() {
                        return *id;
                    }
                }
            }
            if Instant::now() > deadline {
                panic!("no leader elected for group {group_id}");
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Submit through a specific node, retrying while an election is
    /// still settling.
    pub async fn submit_to(&self, node: u64, group_id: u64, cmd: &[u8]) {
        let group = self.group(node, group_id);
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            match group.submit(cmd.to_vec()) {
                Ok(()) => return,
                Err(RaftError::NotLeader { .. }) | Err(RaftError::Busy) => {}
                Err(e) => panic!("submit on node {node} failed: {e}"),
            }
            if Instant::now() > deadline {
                panic!("node {node} never accepted the command");
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_applied(&self, node: u64, group_id: u64, index: u64) {
        let sm = self.sm(node, group_id);
        wait_until(&format!("node {node} to apply index {index}"), || {
            sm.applied_index() >= index
        })
        .await;
    }

    pub fn isolate(&self, node: u64) {
        self.transport.isolate(node, &addr(node));
    }

    pub fn heal(&self, node: u64) {
        self.transport.heal(node, &addr(node));
    }

    pub fn stop(&self) {
        for node in self.nodes.values() {
            node.server.stop();
        }
        for pump in &self.pumps {
            pump.abort();
        }
    }
}
