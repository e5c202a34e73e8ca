//! # concord-proto
//!
//! Protocol types, constants, and data structures shared by every concord
//! node: the error enum, membership records, lock identifiers and the
//! messages carried over peer sessions.

pub mod constants;
pub mod creds;
pub mod defaults;
pub mod error;
pub mod hash;
pub mod lock;
pub mod message;
pub mod node;

// Re-export commonly used types at the crate root
pub use creds::PeerCreds;
pub use error::{ConcordError, ConcordResult};
pub use lock::Lock;
pub use message::{MappingCall, NodeEvent, NodeSnapshot, PeerMessage, PeerRequest};
pub use node::{NodeRecord, Relationship};
