//! Storage Engine
//!
//! Gateway-facing facade over the coordinators: `put_object`,
//! `get_object`, `delete_object`, `head_object` and `list_versions`.
//! Owns the heal queue and the Healing Manager and starts the background
//! loops (registry evaluation, healing) on request.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::coordinator::{
    bounded, ClusterContext, PutOptions, ReadCoordinator, ReadResult, WriteCoordinator,
    WriteReceipt, WriteRequest,
};
use crate::domain::{
    DomainEvent, EventPublisher, ListFilter, MetadataEntry, NodeConnector, ObjectId, ObjectState,
    VersionId, VersionedEntry,
};
use crate::ec::CodecCache;
use crate::error::{Error, Result};
use crate::heal::{HealQueue, HealReason, HealingManager};
use crate::metadata::MetadataStore;
use crate::placement::PlacementEngine;
use crate::registry::NodeRegistry;

pub struct StorageEngine {
    config: EngineConfig,
    ctx: ClusterContext,
    writer: WriteCoordinator,
    reader: ReadCoordinator,
    healer: Arc<HealingManager>,
}

impl StorageEngine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<NodeRegistry>,
        connector: Arc<dyn NodeConnector>,
        metadata: Arc<MetadataStore>,
        events: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        config.validate()?;

        let heal_queue = Arc::new(
            HealQueue::new(config.heal.queue_capacity).with_publisher(Arc::clone(&events)),
        );
        let ctx = ClusterContext {
            registry,
            placement: PlacementEngine::new(),
            codecs: Arc::new(CodecCache::new()),
            connector,
            metadata,
            heal_queue,
            events,
        };

        let writer = WriteCoordinator::new(ctx.clone(), config.erasure.clone(), config.write.clone());
        let reader = ReadCoordinator::new(ctx.clone(), config.read.clone());
        let healer = HealingManager::new(ctx.clone(), config.heal.clone());

        Ok(Self {
            config,
            ctx,
            writer,
            reader,
            healer,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &ClusterContext {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.ctx.registry
    }

    pub fn healer(&self) -> &Arc<HealingManager> {
        &self.healer
    }

    pub fn heal_queue(&self) -> &Arc<HealQueue> {
        &self.ctx.heal_queue
    }

    /// Start the registry evaluation loop and the Healing Manager.
    pub fn spawn_background(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        info!("Starting background loops");
        let registry = Arc::clone(&self.ctx.registry);
        let events = Arc::clone(&self.ctx.events);
        let registry_shutdown = shutdown.clone();
        let healer = Arc::clone(&self.healer);

        vec![
            tokio::spawn(async move { registry.run(events, registry_shutdown).await }),
            tokio::spawn(async move { healer.run(shutdown).await }),
        ]
    }

    // =========================================================================
    // Object operations
    // =========================================================================

    /// Store `data` as a new version of `bucket/key`.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        options: PutOptions,
    ) -> Result<VersionId> {
        let receipt = self.put_object_with_receipt(bucket, key, data, options).await?;
        Ok(receipt.object_id.version)
    }

    /// Like [`put_object`](Self::put_object), returning the full write receipt.
    pub async fn put_object_with_receipt(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        options: PutOptions,
    ) -> Result<WriteReceipt> {
        self.writer
            .write(WriteRequest::new(bucket, key, data).with_options(options))
            .await
    }

    /// Bytes of `version`, or of the latest live version.
    pub async fn get_object(&self, bucket: &str, key: &str, version: Option<VersionId>) -> Result<Bytes> {
        Ok(self.read_object(bucket, key, version).await?.data)
    }

    /// Bytes plus the entry and the shard health seen on the way.
    pub async fn read_object(
        &self,
        bucket: &str,
        key: &str,
        version: Option<VersionId>,
    ) -> Result<ReadResult> {
        self.reader.read(bucket, key, version).await
    }

    /// Committed entry of a live version, without fetching shards.
    pub async fn head_object(
        &self,
        bucket: &str,
        key: &str,
        version: Option<VersionId>,
    ) -> Result<MetadataEntry> {
        let versioned = self.resolve(bucket, key, version).await?;
        match versioned.entry.state {
            ObjectState::Committed | ObjectState::Corrupt => Ok(versioned.entry),
            ObjectState::Deleted | ObjectState::Pending => {
                Err(Error::NotFound(versioned.entry.object_id.to_string()))
            }
        }
    }

    /// Every known version of `bucket/key`, newest first, deletion markers
    /// included.
    pub async fn list_versions(&self, bucket: &str, key: &str) -> Result<Vec<VersionedEntry>> {
        let mut versions = self.ctx.metadata.list(&ListFilter::key(bucket, key)).await?;
        versions.sort_by(|a, b| b.entry.object_id.version.cmp(&a.entry.object_id.version));
        Ok(versions)
    }

    /// Mark `version` (or the latest live version) deleted, cancel its heal
    /// task and remove its shards in the background.
    #[instrument(skip(self))]
    pub async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version: Option<VersionId>,
    ) -> Result<VersionId> {
        let versioned = self.resolve(bucket, key, version).await?;
        let entry = versioned.entry;
        let object_id = entry.object_id.clone();
        if entry.state == ObjectState::Deleted {
            debug!(object = %object_id, "Already deleted");
            return Ok(object_id.version);
        }

        self.ctx
            .metadata
            .publish(&entry.with_state(ObjectState::Deleted))
            .await?;
        self.ctx.heal_queue.cancel(&object_id);
        self.remove_shards(entry);
        self.ctx.emit(DomainEvent::object_deleted(&object_id)).await;

        info!(object = %object_id, "Object deleted");
        Ok(object_id.version)
    }

    /// Queue `bucket/key@version` for healing by hand.
    pub async fn request_heal(&self, object_id: &ObjectId) -> bool {
        self.ctx.heal_queue.enqueue(object_id, HealReason::Manual).await
    }

    async fn resolve(&self, bucket: &str, key: &str, version: Option<VersionId>) -> Result<VersionedEntry> {
        let resolved = match version {
            Some(version) => self.ctx.metadata.read(&ObjectId::new(bucket, key, version)).await?,
            None => self.ctx.metadata.latest(bucket, key).await?,
        };
        resolved.ok_or_else(|| Error::NotFound(format!("{}/{}", bucket, key)))
    }

    fn remove_shards(&self, entry: MetadataEntry) {
        let ctx = self.ctx.clone();
        let rpc_timeout = self.config.write.rpc_timeout;

        tokio::spawn(async move {
            let view = ctx.registry.snapshot();
            let object_id = &entry.object_id;
            let deletes = entry.placement.iter().map(|placement| {
                let ctx = &ctx;
                let view = &view;
                async move {
                    if !view.is_alive(&placement.node_id) {
                        return;
                    }
                    let service = match ctx.shard_service(view, &placement.node_id) {
                        Ok(service) => service,
                        Err(e) => {
                            warn!(object = %object_id, node = %placement.node_id, "No route for shard delete: {}", e);
                            return;
                        }
                    };
                    let deleted = bounded(
                        rpc_timeout,
                        || format!("delete shard {} on {}", placement.shard_index, placement.node_id),
                        service.delete_shard(object_id, placement.shard_index),
                    )
                    .await;
                    if let Err(e) = deleted {
                        warn!(object = %object_id, shard = placement.shard_index, "Shard delete failed: {}", e);
                    }
                }
            });
            join_all(deletes).await;
            debug!(object = %object_id, "Shard removal finished");
        });
    }
}
