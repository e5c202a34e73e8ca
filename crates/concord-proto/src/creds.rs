//! Peer credentials.
//!
//! Nodes of one cluster share a secret. A subscribing node proves it knows
//! the secret by sending a password derived from its name and the secret,
//! never the secret itself.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity a node presents when it subscribes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCreds {
    pub node_name: String,
    /// Hex SHA-256 of the node name followed by the shared secret. Empty
    /// when the sender has no secret configured.
    pub password: String,
}

impl PeerCreds {
    pub fn new(node_name: impl Into<String>, shared_secret: Option<&str>) -> Self {
        let node_name = node_name.into();
        let password = shared_secret
            .map(|secret| create_password(&node_name, secret))
            .unwrap_or_default();
        Self {
            node_name,
            password,
        }
    }

    /// Whether these credentials were made with `shared_secret`. A node
    /// without a secret accepts every peer.
    pub fn is_authentic(&self, shared_secret: Option<&str>) -> bool {
        match shared_secret {
            None => true,
            Some(secret) => create_password(&self.node_name, secret) == self.password,
        }
    }
}

pub fn create_password(node_name: &str, shared_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(node_name.as_bytes());
    hasher.update(shared_secret.as_bytes());
    hex::encode(hasher.finalize())
}
