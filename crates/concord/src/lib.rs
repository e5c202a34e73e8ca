//! # concord
//!
//! Peer coordination for clustered game servers. Each node publishes a
//! record to a shared repository, subscribes to every other live node and
//! serves two shared facilities over those links:
//!
//! - cluster-wide named locks, arbitrated by node-name priority
//! - replicated or remotely mastered key/value mappings
//!
//! Nodes can also run named actions on each other. Peers sharing a secret
//! refuse subscribers that cannot prove they know it.
//!
//! A [`Node`] is configured up front and started into a [`NodeHandle`].

pub mod actions;
pub mod config;
pub mod handle;
pub mod locks;
pub mod mapping;
pub mod node;
pub mod peer;
pub mod repository;
pub mod scheduler;
pub mod session;

pub use actions::{NodeAction, NodeActions};
pub use config::NodeConfig;
pub use handle::NodeHandle;
pub use locks::{LockState, LockStats, NameOrder, PriorityRule};
pub use mapping::{
    BincodeCodec, MappingCodec, MappingId, MappingListener, ReplicationPolicy, Update,
};
pub use node::{Node, StaleCache};
pub use peer::{PeerState, PeerStatus};
pub use repository::{FileNodeRepository, MemoryNodeRepository, NodeRepository};
