//! Cluster membership storage.
//!
//! Every node heartbeats its own [`NodeRecord`] into a shared repository
//! and periodically loads everyone else's. The repository is the only
//! discovery mechanism: a node learns of its peers exclusively from here.
//!
//! Two implementations are provided:
//! - `FileNodeRepository`: one bincode file per node in a shared directory.
//! - `MemoryNodeRepository`: in-process map for tests and single-process
//!   clusters.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use concord_proto::error::{ConcordError, ConcordResult};
use concord_proto::node::{now_millis, NodeRecord};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Trait that all membership backends must implement.
#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// Human-readable name of this backend (e.g. "file", "memory").
    fn name(&self) -> &str;

    /// Store `record` with a fresh `last_updated` stamp.
    async fn heartbeat(&self, record: &NodeRecord) -> ConcordResult<()>;

    /// Every stored record, including the caller's own.
    async fn load_nodes(&self) -> ConcordResult<Vec<NodeRecord>>;

    /// Mark a node as cleanly shut down.
    async fn shutdown_node(&self, node_name: &str) -> ConcordResult<()>;
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

pub struct FileNodeRepository {
    dir: PathBuf,
}

impl FileNodeRepository {
    pub async fn open(dir: impl Into<PathBuf>) -> ConcordResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            error!("failed to create node directory {}: {}", dir.display(), e);
            ConcordError::Eio
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn node_path(&self, node_name: &str) -> PathBuf {
        self.dir.join(format!("{}.node", node_name))
    }

    async fn save(&self, record: &NodeRecord) -> ConcordResult<()> {
        let path = self.node_path(&record.node_name);
        let tmp = path.with_extension("tmp");
        let data = bincode::serialize(record).map_err(|_| ConcordError::SystemError)?;
        fs::write(&tmp, &data).await.map_err(|e| {
            error!("failed to write node record {}: {}", tmp.display(), e);
            ConcordError::Eio
        })?;
        fs::rename(&tmp, &path).await.map_err(|e| {
            error!("failed to replace node record {}: {}", path.display(), e);
            ConcordError::Eio
        })?;
        Ok(())
    }

    async fn load(&self, path: &Path) -> ConcordResult<NodeRecord> {
        let data = fs::read(path).await.map_err(|_| ConcordError::Eio)?;
        bincode::deserialize(&data).map_err(|_| {
            error!("corrupt node record: {}", path.display());
            ConcordError::SystemError
        })
    }
}

#[async_trait]
impl NodeRepository for FileNodeRepository {
    fn name(&self) -> &str {
        "file"
    }

    async fn heartbeat(&self, record: &NodeRecord) -> ConcordResult<()> {
        let mut record = record.clone();
        record.last_updated = now_millis();
        record.shutdown = false;
        self.save(&record).await?;
        debug!("heartbeat: {}", record);
        Ok(())
    }

    async fn load_nodes(&self) -> ConcordResult<Vec<NodeRecord>> {
        let mut nodes = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await.map_err(|_| ConcordError::Eio)?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("node") {
                continue;
            }
            match self.load(&path).await {
                Ok(record) => nodes.push(record),
                Err(e) => warn!("skipping node record {}: {}", path.display(), e),
            }
        }
        nodes.sort_by(|a, b| a.node_name.cmp(&b.node_name));
        Ok(nodes)
    }

    async fn shutdown_node(&self, node_name: &str) -> ConcordResult<()> {
        let path = self.node_path(node_name);
        if !path.exists() {
            return Ok(());
        }
        let mut record = self.load(&path).await?;
        record.shutdown = true;
        self.save(&record).await
    }
}

// ---------------------------------------------------------------------------
// Memory backend
// ---------------------------------------------------------------------------

/// Cloning shares the underlying map, so several in-process nodes can use
/// one repository.
#[derive(Clone, Default)]
pub struct MemoryNodeRepository {
    nodes: Arc<RwLock<BTreeMap<String, NodeRecord>>>,
}

impl MemoryNodeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record as-is, without touching its timestamp.
    pub async fn insert(&self, record: NodeRecord) {
        self.nodes.write().await.insert(record.node_name.clone(), record);
    }

    pub async fn remove(&self, node_name: &str) {
        self.nodes.write().await.remove(node_name);
    }
}

#[async_trait]
impl NodeRepository for MemoryNodeRepository {
    fn name(&self) -> &str {
        "memory"
    }

    async fn heartbeat(&self, record: &NodeRecord) -> ConcordResult<()> {
        let mut record = record.clone();
        record.last_updated = now_millis();
        record.shutdown = false;
        self.insert(record).await;
        Ok(())
    }

    async fn load_nodes(&self) -> ConcordResult<Vec<NodeRecord>> {
        Ok(self.nodes.read().await.values().cloned().collect())
    }

    async fn shutdown_node(&self, node_name: &str) -> ConcordResult<()> {
        if let Some(record) = self.nodes.write().await.get_mut(node_name) {
            record.shutdown = true;
        }
        Ok(())
    }
}
