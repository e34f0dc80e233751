//! Domain Ports (Port/Adapter Pattern)
//!
//! Trait abstractions for everything the coordinators reach over the
//! network: remote shard stores, metadata replicas, and the event sink.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  ShardService │ MetadataService │ NodeConnector      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  Local (in-process) │ HTTP (reqwest) │ Publishers   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::events::DomainEvent;
use super::types::{MetadataEntry, NodeId, NodeInfo, ObjectId, ProposalNumber, ShardKind, VersionedEntry};
use crate::error::Result;

// =============================================================================
// Shard RPC
// =============================================================================

/// `PutShard` request.
#[derive(Debug, Clone)]
pub struct PutShardRequest {
    pub object_id: ObjectId,
    pub shard_index: usize,
    pub kind: ShardKind,
    pub checksum: String,
    pub payload: Bytes,
}

/// Result of an accepted `PutShard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutOutcome {
    /// Shard written for the first time.
    Stored,
    /// Identical shard already present; nothing changed.
    AlreadyPresent,
    /// Identical checksum over a damaged copy; payload rewritten.
    Repaired,
}

/// Health of one stored shard, without its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardProbe {
    pub exists: bool,
    pub healthy: bool,
    pub checksum: Option<String>,
    pub payload_len: u64,
}

impl ShardProbe {
    pub fn missing() -> Self {
        Self {
            exists: false,
            healthy: false,
            checksum: None,
            payload_len: 0,
        }
    }
}

/// Port for a node's shard store, local or remote.
#[async_trait]
pub trait ShardService: Send + Sync {
    /// Node that owns this store.
    fn node_id(&self) -> &NodeId;

    /// Store a shard. `Conflict` if a different checksum is already stored.
    async fn put_shard(&self, request: PutShardRequest) -> Result<PutOutcome>;

    /// Fetch a verified payload. `NotFound` or `Corrupt` otherwise.
    async fn get_shard(&self, object_id: &ObjectId, shard_index: usize) -> Result<Bytes>;

    /// Remove a shard. Returns whether anything was removed.
    async fn delete_shard(&self, object_id: &ObjectId, shard_index: usize) -> Result<bool>;

    /// Existence check; `deep` also verifies the payload checksum.
    async fn probe_shard(
        &self,
        object_id: &ObjectId,
        shard_index: usize,
        deep: bool,
    ) -> Result<ShardProbe>;
}

// =============================================================================
// Metadata RPC
// =============================================================================

/// Replica answer to `Propose`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProposeOutcome {
    Accepted,
    /// The replica promised a higher proposal number.
    Rejected { promised: ProposalNumber },
}

/// Replica answer to `Commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed,
    /// The replica did not accept this proposal, or has moved past it.
    NotAccepted,
}

/// Filter for replica listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    pub bucket: Option<String>,
    pub key: Option<String>,
}

impl ListFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn key(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: Some(bucket.into()),
            key: Some(key.into()),
        }
    }

    pub fn matches(&self, object_id: &ObjectId) -> bool {
        self.bucket.as_ref().map_or(true, |b| *b == object_id.bucket)
            && self.key.as_ref().map_or(true, |k| *k == object_id.key)
    }
}

/// Port for one metadata replica.
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Node hosting this replica.
    fn replica_id(&self) -> &NodeId;

    async fn propose(
        &self,
        object_id: &ObjectId,
        proposal: &ProposalNumber,
        entry: &MetadataEntry,
    ) -> Result<ProposeOutcome>;

    async fn commit(&self, object_id: &ObjectId, proposal: &ProposalNumber)
        -> Result<CommitOutcome>;

    /// Latest committed entry, if any.
    async fn read(&self, object_id: &ObjectId) -> Result<Option<VersionedEntry>>;

    async fn list(&self, filter: &ListFilter) -> Result<Vec<VersionedEntry>>;
}

// =============================================================================
// Connections
// =============================================================================

/// Resolves a node from a cluster snapshot to its shard service.
pub trait NodeConnector: Send + Sync {
    fn shard_service(&self, node: &NodeInfo) -> Result<Arc<dyn ShardService>>;
}

// =============================================================================
// Events
// =============================================================================

/// Port for publishing domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a domain event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::VersionId;

    #[test]
    fn test_list_filter_matches() {
        let id = ObjectId::new("logs", "2024/01/app.log", VersionId::generate());
        assert!(ListFilter::all().matches(&id));
        assert!(ListFilter::key("logs", "2024/01/app.log").matches(&id));
        assert!(!ListFilter::key("logs", "other").matches(&id));

        let bucket_only = ListFilter {
            bucket: Some("logs".into()),
            key: None,
        };
        assert!(bucket_only.matches(&id));
    }

    #[test]
    fn test_propose_outcome_wire_shape() {
        let rejected = ProposeOutcome::Rejected {
            promised: ProposalNumber::new(7, NodeId::from("n2")),
        };
        let json = serde_json::to_string(&rejected).unwrap();
        assert!(json.contains("\"outcome\":\"rejected\""));
        let back: ProposeOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rejected);
    }
}
