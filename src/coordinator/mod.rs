//! Write and Read Coordinators
//!
//! Per-object operations that fan out to shard stores and the metadata
//! quorum. Both coordinators wait on the first sufficient subset of
//! responses and bound every node RPC with a timeout.

pub mod read;
pub mod write;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::domain::{ClusterView, DomainEvent, EventPublisher, NodeConnector, NodeId, ShardService};
use crate::ec::CodecCache;
use crate::error::{Error, Result};
use crate::heal::HealQueue;
use crate::metadata::MetadataStore;
use crate::placement::PlacementEngine;
use crate::registry::NodeRegistry;

pub use read::{ReadCoordinator, ReadResult};
pub use write::{PutOptions, WriteCoordinator, WriteReceipt, WriteRequest, WriteState};

/// Collaborators shared by the coordinators and the Healing Manager.
#[derive(Clone)]
pub struct ClusterContext {
    pub registry: Arc<NodeRegistry>,
    pub placement: PlacementEngine,
    pub codecs: Arc<CodecCache>,
    pub connector: Arc<dyn NodeConnector>,
    pub metadata: Arc<MetadataStore>,
    pub heal_queue: Arc<HealQueue>,
    pub events: Arc<dyn EventPublisher>,
}

impl ClusterContext {
    /// Shard service of `node_id` as known in `view`.
    pub fn shard_service(&self, view: &ClusterView, node_id: &NodeId) -> Result<Arc<dyn ShardService>> {
        let node = view
            .get(node_id)
            .ok_or_else(|| Error::NodeUnavailable(format!("node {} is not registered", node_id)))?;
        self.connector.shard_service(node)
    }

    /// Publish an event; a failing publisher never fails the operation.
    pub async fn emit(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!("Failed to publish domain event: {}", e);
        }
    }
}

/// Run `fut` with a timeout, mapping expiry to `Error::Timeout`.
pub(crate) async fn bounded<T, F>(limit: Duration, what: impl FnOnce() -> String, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(what())),
    }
}
