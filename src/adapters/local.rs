//! In-process transport
//!
//! Runs every node of a cluster inside one process: each [`LocalNode`]
//! owns a real on-disk shard store and metadata replica, and can be taken
//! offline or made unresponsive to exercise failure handling.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::config::EngineConfig;
use crate::domain::{
    CommitOutcome, EventPublisher, ListFilter, MetadataEntry, MetadataService, NodeConnector,
    NodeId, NodeInfo, ObjectId, ProposalNumber, ProposeOutcome, PutOutcome, PutShardRequest,
    ShardProbe, ShardService, VersionedEntry,
};
use crate::engine::StorageEngine;
use crate::error::{Error, Result};
use crate::metadata::{MetadataReplica, MetadataStore};
use crate::registry::{NodeRegistry, Ping};
use crate::shard::ShardStore;

/// Injected failure behaviour of a local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultMode {
    #[default]
    Online,
    /// Every call fails immediately with `NodeUnavailable`.
    Offline,
    /// Every call hangs until the caller gives up.
    Unresponsive,
}

/// One storage node living in this process.
pub struct LocalNode {
    id: NodeId,
    address: String,
    data_dir: PathBuf,
    shards: Arc<ShardStore>,
    replica: MetadataReplica,
    fault: RwLock<FaultMode>,
}

impl LocalNode {
    /// Open (or reopen) the node's stores under `data_dir`.
    pub fn open(id: NodeId, data_dir: impl AsRef<Path>, config: &EngineConfig) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let shards = ShardStore::open(id.clone(), &data_dir, &config.shard_store)?;
        let replica = MetadataReplica::open(id.clone(), &data_dir, config.shard_store.sync_writes)?;
        Ok(Self {
            address: format!("local://{}", id),
            id,
            data_dir,
            shards: Arc::new(shards),
            replica,
            fault: RwLock::new(FaultMode::Online),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn shard_store(&self) -> &Arc<ShardStore> {
        &self.shards
    }

    pub fn replica(&self) -> &MetadataReplica {
        &self.replica
    }

    pub fn fault(&self) -> FaultMode {
        *self.fault.read()
    }

    pub fn set_fault(&self, mode: FaultMode) {
        debug!(node = %self.id, ?mode, "Fault mode changed");
        *self.fault.write() = mode;
    }

    /// Heartbeat message for this node.
    pub fn ping(&self) -> Ping {
        Ping {
            node_id: self.id.clone(),
            address: self.address.clone(),
            capacity: self.shards.capacity(),
        }
    }

    async fn gate(&self) -> Result<()> {
        match self.fault() {
            FaultMode::Online => Ok(()),
            FaultMode::Offline => Err(Error::NodeUnavailable(format!("node {} is offline", self.id))),
            FaultMode::Unresponsive => std::future::pending().await,
        }
    }
}

#[async_trait]
impl ShardService for LocalNode {
    fn node_id(&self) -> &NodeId {
        &self.id
    }

    async fn put_shard(&self, request: PutShardRequest) -> Result<PutOutcome> {
        self.gate().await?;
        self.shards.put(request).await
    }

    async fn get_shard(&self, object_id: &ObjectId, shard_index: usize) -> Result<Bytes> {
        self.gate().await?;
        self.shards.get(object_id, shard_index).await
    }

    async fn delete_shard(&self, object_id: &ObjectId, shard_index: usize) -> Result<bool> {
        self.gate().await?;
        self.shards.delete(object_id, shard_index).await
    }

    async fn probe_shard(
        &self,
        object_id: &ObjectId,
        shard_index: usize,
        deep: bool,
    ) -> Result<ShardProbe> {
        self.gate().await?;
        self.shards.probe(object_id, shard_index, deep).await
    }
}

#[async_trait]
impl MetadataService for LocalNode {
    fn replica_id(&self) -> &NodeId {
        &self.id
    }

    async fn propose(
        &self,
        object_id: &ObjectId,
        proposal: &ProposalNumber,
        entry: &MetadataEntry,
    ) -> Result<ProposeOutcome> {
        self.gate().await?;
        self.replica.propose(object_id, proposal, entry).await
    }

    async fn commit(&self, object_id: &ObjectId, proposal: &ProposalNumber) -> Result<CommitOutcome> {
        self.gate().await?;
        self.replica.commit(object_id, proposal).await
    }

    async fn read(&self, object_id: &ObjectId) -> Result<Option<VersionedEntry>> {
        self.gate().await?;
        Ok(self.replica.read(object_id).await)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<VersionedEntry>> {
        self.gate().await?;
        Ok(self.replica.list(filter).await)
    }
}

/// Resolves node ids to in-process nodes.
#[derive(Default)]
pub struct LocalConnector {
    nodes: DashMap<NodeId, Arc<LocalNode>>,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, node: Arc<LocalNode>) {
        self.nodes.insert(node.id().clone(), node);
    }

    pub fn get(&self, node_id: &NodeId) -> Option<Arc<LocalNode>> {
        self.nodes.get(node_id).map(|n| Arc::clone(n.value()))
    }
}

impl NodeConnector for LocalConnector {
    fn shard_service(&self, node: &NodeInfo) -> Result<Arc<dyn ShardService>> {
        self.get(&node.id)
            .map(|n| n as Arc<dyn ShardService>)
            .ok_or_else(|| Error::NodeUnavailable(format!("no local node {}", node.id)))
    }
}

// =============================================================================
// Embedded cluster
// =============================================================================

/// A whole cluster in one process: nodes, registry, metadata quorum over
/// every node's replica, and a [`StorageEngine`] on top.
pub struct LocalCluster {
    nodes: Vec<Arc<LocalNode>>,
    connector: Arc<LocalConnector>,
    engine: StorageEngine,
}

impl LocalCluster {
    /// Start `node_count` nodes with data under `root/<node-id>`, all
    /// registered alive.
    pub fn start(
        node_count: usize,
        root: impl AsRef<Path>,
        config: EngineConfig,
        events: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        let root = root.as_ref();
        let registry = NodeRegistry::new(config.registry.clone());
        let connector = Arc::new(LocalConnector::new());

        let mut nodes = Vec::with_capacity(node_count);
        for i in 0..node_count {
            let id = NodeId::new(format!("node-{}", i));
            let node = Arc::new(LocalNode::open(id.clone(), root.join(id.as_str()), &config)?);
            registry.register(&node.ping())?;
            connector.insert(Arc::clone(&node));
            nodes.push(node);
        }

        let replicas: Vec<Arc<dyn MetadataService>> = nodes
            .iter()
            .map(|n| Arc::clone(n) as Arc<dyn MetadataService>)
            .collect();
        let proposer = NodeId::new("coordinator");
        let metadata = Arc::new(MetadataStore::new(proposer, replicas, config.metadata.clone()));

        let engine = StorageEngine::new(
            config,
            registry,
            Arc::clone(&connector) as Arc<dyn NodeConnector>,
            metadata,
            events,
        )?;

        Ok(Self {
            nodes,
            connector,
            engine,
        })
    }

    pub fn engine(&self) -> &StorageEngine {
        &self.engine
    }

    pub fn nodes(&self) -> &[Arc<LocalNode>] {
        &self.nodes
    }

    pub fn connector(&self) -> &Arc<LocalConnector> {
        &self.connector
    }

    pub fn node(&self, node_id: &NodeId) -> Option<Arc<LocalNode>> {
        self.connector.get(node_id)
    }

    /// Take a node offline and declare it dead in the registry.
    pub fn kill(&self, node_id: &NodeId) -> Result<()> {
        let node = self
            .node(node_id)
            .ok_or_else(|| Error::NotFound(format!("node {}", node_id)))?;
        node.set_fault(FaultMode::Offline);
        self.engine.registry().mark_dead(node_id)
    }

    /// Add and register one more node.
    pub fn add_node(&self, id: NodeId, data_dir: impl AsRef<Path>) -> Result<Arc<LocalNode>> {
        let node = Arc::new(LocalNode::open(id, data_dir, self.engine.config())?);
        self.engine.registry().register(&node.ping())?;
        self.connector.insert(Arc::clone(&node));
        Ok(node)
    }
}
