//! Domain Layer
//!
//! Value objects, port traits and domain events shared by the engine's
//! components.
//!
//! - **Types** (`types.rs`) - identities, erasure scheme, metadata entries, cluster view
//! - **Ports** (`ports.rs`) - trait abstractions for remote shard stores and metadata replicas
//! - **Events** (`events.rs`) - domain events for audit and decoupling

pub mod events;
pub mod ports;
pub mod types;

pub use events::DomainEvent;
pub use ports::{
    CommitOutcome, EventPublisher, ListFilter, MetadataService, NodeConnector, ProposeOutcome,
    PutOutcome, PutShardRequest, ShardProbe, ShardService,
};
pub use types::{
    content_checksum, Capacity, ClusterView, ErasureScheme, MetadataEntry, NodeHealth, NodeId,
    NodeInfo, ObjectId, ObjectState, PlacementEntry, ProposalNumber, ShardKind, StorageClass,
    VersionId, VersionedEntry,
};
