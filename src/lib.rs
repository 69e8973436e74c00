//! Multi-group Raft consensus engine.
//!
//! A [`server::RaftServer`] hosts many independent consensus groups on
//! one node. Each group replicates an ordered log of opaque commands
//! across its peers and feeds committed entries, exactly once and in
//! index order, to an application [`statemachine::StateMachine`].
//! Lagging or freshly added peers are caught up with application
//! snapshots, throttled server-wide by a FIFO governor.
//!
//! The engine is transport-agnostic: peers exchange messages through a
//! [`transport::Transport`] implementation, with node ids mapped to
//! addresses by a [`resolver::NodeResolver`].

pub mod raft;
pub mod resolver;
pub mod server;
pub mod statemachine;
pub mod storage;
pub mod transport;

pub use raft::{
    ConfChange, ConfChangeKind, DownPeer, EntryPayload, GroupConfig, GroupStatus, HardState,
    LogEntry, NodeRole, Peer, PeerRole, RaftError, RaftGroup, RaftMessage, ReplicaStatus,
    ServerOptions, ServerStatus, SnapshotMeta, StorageMode,
};
pub use resolver::{NodeResolver, StaticResolver};
pub use server::RaftServer;
pub use statemachine::{Snapshot, StateMachine};
pub use storage::{DiskStorage, MemStorage, Storage};
pub use transport::{ChannelTransport, Envelope, Transport};
