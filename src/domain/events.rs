//! Domain Events
//!
//! Immutable records of significant occurrences in the engine: membership
//! changes, object lifecycle transitions and healing outcomes.
//!
//! # Usage
//!
//! ```ignore
//! let event = DomainEvent::object_deleted(&object_id);
//! event_publisher.publish(event).await?;
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{ErasureScheme, NodeHealth, NodeId, ObjectId};

/// Domain event representing a significant occurrence in the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Membership Events
    // =========================================================================
    /// A node joined the cluster.
    NodeRegistered {
        node_id: String,
        address: String,
        timestamp: DateTime<Utc>,
    },

    /// A node changed health state.
    NodeHealthChanged {
        node_id: String,
        from: NodeHealth,
        to: NodeHealth,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Object Lifecycle Events
    // =========================================================================
    /// An object version became readable.
    ObjectCommitted {
        object: String,
        size_bytes: u64,
        scheme: String,
        acked_shards: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A write ended in the `Failed` state.
    WriteFailed {
        object: String,
        failed_in: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// An object version was logically deleted.
    ObjectDeleted {
        object: String,
        timestamp: DateTime<Utc>,
    },

    /// A read succeeded but met unhealthy shards.
    DegradedRead {
        object: String,
        unhealthy_shards: Vec<usize>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Healing Events
    // =========================================================================
    /// A healing task was accepted by the queue.
    HealQueued {
        object: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Missing shards were rebuilt and the placement list updated.
    ShardsRestored {
        object: String,
        shard_indices: Vec<usize>,
        moved_to: Vec<String>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Some shards could not be restored on this pass.
    HealIncomplete {
        object: String,
        outstanding: Vec<usize>,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Fewer than k healthy shards remain; the object is marked corrupt.
    ObjectCorrupt {
        object: String,
        healthy_shards: usize,
        required: usize,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::NodeRegistered { timestamp, .. } => *timestamp,
            DomainEvent::NodeHealthChanged { timestamp, .. } => *timestamp,
            DomainEvent::ObjectCommitted { timestamp, .. } => *timestamp,
            DomainEvent::WriteFailed { timestamp, .. } => *timestamp,
            DomainEvent::ObjectDeleted { timestamp, .. } => *timestamp,
            DomainEvent::DegradedRead { timestamp, .. } => *timestamp,
            DomainEvent::HealQueued { timestamp, .. } => *timestamp,
            DomainEvent::ShardsRestored { timestamp, .. } => *timestamp,
            DomainEvent::HealIncomplete { timestamp, .. } => *timestamp,
            DomainEvent::ObjectCorrupt { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::NodeRegistered { .. } => "NodeRegistered",
            DomainEvent::NodeHealthChanged { .. } => "NodeHealthChanged",
            DomainEvent::ObjectCommitted { .. } => "ObjectCommitted",
            DomainEvent::WriteFailed { .. } => "WriteFailed",
            DomainEvent::ObjectDeleted { .. } => "ObjectDeleted",
            DomainEvent::DegradedRead { .. } => "DegradedRead",
            DomainEvent::HealQueued { .. } => "HealQueued",
            DomainEvent::ShardsRestored { .. } => "ShardsRestored",
            DomainEvent::HealIncomplete { .. } => "HealIncomplete",
            DomainEvent::ObjectCorrupt { .. } => "ObjectCorrupt",
        }
    }

    /// Get the object this event refers to, if any.
    pub fn object(&self) -> Option<&str> {
        match self {
            DomainEvent::ObjectCommitted { object, .. } => Some(object),
            DomainEvent::WriteFailed { object, .. } => Some(object),
            DomainEvent::ObjectDeleted { object, .. } => Some(object),
            DomainEvent::DegradedRead { object, .. } => Some(object),
            DomainEvent::HealQueued { object, .. } => Some(object),
            DomainEvent::ShardsRestored { object, .. } => Some(object),
            DomainEvent::HealIncomplete { object, .. } => Some(object),
            DomainEvent::ObjectCorrupt { object, .. } => Some(object),
            _ => None,
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl DomainEvent {
    pub fn node_registered(node_id: &NodeId, address: impl Into<String>) -> Self {
        DomainEvent::NodeRegistered {
            node_id: node_id.to_string(),
            address: address.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn node_health_changed(node_id: &NodeId, from: NodeHealth, to: NodeHealth) -> Self {
        DomainEvent::NodeHealthChanged {
            node_id: node_id.to_string(),
            from,
            to,
            timestamp: Utc::now(),
        }
    }

    pub fn object_committed(
        object_id: &ObjectId,
        size_bytes: u64,
        scheme: ErasureScheme,
        acked_shards: usize,
        duration: Duration,
    ) -> Self {
        DomainEvent::ObjectCommitted {
            object: object_id.to_string(),
            size_bytes,
            scheme: scheme.to_string(),
            acked_shards,
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    pub fn write_failed(
        object_id: &ObjectId,
        failed_in: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        DomainEvent::WriteFailed {
            object: object_id.to_string(),
            failed_in: failed_in.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn object_deleted(object_id: &ObjectId) -> Self {
        DomainEvent::ObjectDeleted {
            object: object_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn degraded_read(
        object_id: &ObjectId,
        unhealthy_shards: Vec<usize>,
        duration: Duration,
    ) -> Self {
        DomainEvent::DegradedRead {
            object: object_id.to_string(),
            unhealthy_shards,
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    pub fn heal_queued(object_id: &ObjectId, reason: impl Into<String>) -> Self {
        DomainEvent::HealQueued {
            object: object_id.to_string(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn shards_restored(
        object_id: &ObjectId,
        shard_indices: Vec<usize>,
        moved_to: Vec<NodeId>,
        duration: Duration,
    ) -> Self {
        DomainEvent::ShardsRestored {
            object: object_id.to_string(),
            shard_indices,
            moved_to: moved_to.into_iter().map(|n| n.0).collect(),
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    pub fn heal_incomplete(
        object_id: &ObjectId,
        outstanding: Vec<usize>,
        reason: impl Into<String>,
    ) -> Self {
        DomainEvent::HealIncomplete {
            object: object_id.to_string(),
            outstanding,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn object_corrupt(object_id: &ObjectId, healthy_shards: usize, required: usize) -> Self {
        DomainEvent::ObjectCorrupt {
            object: object_id.to_string(),
            healthy_shards,
            required,
            timestamp: Utc::now(),
        }
    }
}
