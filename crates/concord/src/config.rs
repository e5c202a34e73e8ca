//! Node configuration.

use std::time::Duration;

use concord_proto::constants::CONCORD_LISTEN_PORT;
use concord_proto::creds::PeerCreds;
use concord_proto::defaults::{
    DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_MAPPING_FLUSH_INTERVAL_MS, DEFAULT_MAX_FRAME_SIZE,
    DEFAULT_MINISTER_COUNT, DEFAULT_PEER_REFRESH_INTERVAL_SECS, DEFAULT_STALE_INTERVAL_SECS,
};
use concord_proto::node::{now_millis, NodeRecord};

/// Identity and tunables for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique node name; also the lock priority key.
    pub node_name: String,
    /// Host name peers in the same region connect to.
    pub host_name: String,
    /// Host name peers in other regions connect to.
    pub public_host_name: String,
    pub region: Option<String>,
    /// Address the session listener binds.
    pub bind_addr: String,
    /// Port the session listener binds; 0 picks an ephemeral port.
    pub port: u16,
    /// Records older than this are ignored, and reconnects are gated by it.
    pub stale_interval: Duration,
    pub refresh_interval: Duration,
    pub lock_timeout: Duration,
    pub flush_interval: Duration,
    pub minister_count: usize,
    pub max_frame_size: usize,
    /// Secret shared by every node of the cluster. Without one, any node
    /// may subscribe.
    pub shared_secret: Option<String>,
}

impl NodeConfig {
    pub fn new(node_name: impl Into<String>, host_name: impl Into<String>) -> Self {
        let host_name = host_name.into();
        Self {
            node_name: node_name.into(),
            public_host_name: host_name.clone(),
            host_name,
            region: None,
            bind_addr: "0.0.0.0".to_string(),
            port: CONCORD_LISTEN_PORT,
            stale_interval: Duration::from_secs(DEFAULT_STALE_INTERVAL_SECS),
            refresh_interval: Duration::from_secs(DEFAULT_PEER_REFRESH_INTERVAL_SECS),
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            flush_interval: Duration::from_millis(DEFAULT_MAPPING_FLUSH_INTERVAL_MS),
            minister_count: DEFAULT_MINISTER_COUNT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            shared_secret: None,
        }
    }

    /// A config for a node listening on loopback with an ephemeral port.
    pub fn local(node_name: impl Into<String>) -> Self {
        let mut config = Self::new(node_name, "127.0.0.1");
        config.bind_addr = "127.0.0.1".to_string();
        config.port = 0;
        config
    }

    /// The membership record this node publishes, stamped `now`.
    pub fn record(&self, port: u16) -> NodeRecord {
        NodeRecord {
            node_name: self.node_name.clone(),
            host_name: self.host_name.clone(),
            public_host_name: self.public_host_name.clone(),
            region: self.region.clone(),
            port,
            last_updated: now_millis(),
            shutdown: false,
        }
    }

    /// Credentials this node presents when it subscribes to a peer.
    pub fn creds(&self) -> PeerCreds {
        PeerCreds::new(self.node_name.clone(), self.shared_secret.as_deref())
    }

    pub fn stale_interval_ms(&self) -> u64 {
        self.stale_interval.as_millis() as u64
    }
}
