//! ShardStor - Distributed Erasure-Coded Object Storage Engine
//!
//! The storage core of an S3-compatible object store: objects are split
//! into k data and m parity shards with Reed-Solomon coding, spread over
//! k+m distinct nodes, and tracked by a quorum-replicated metadata store.
//! A background Healing Manager restores redundancy after node loss or
//! bitrot.
//!
//! # Architecture
//!
//! ```text
//!                 put / get / delete
//!                        │
//!                  StorageEngine
//!           ┌────────────┼─────────────┐
//!   WriteCoordinator  ReadCoordinator  HealingManager ◀── HealQueue
//!           │            │             │
//!   PlacementEngine  ErasureCoding  NodeRegistry
//!           │            │             │
//!      ShardService (per node)   MetadataStore (quorum)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - In-process and HTTP transports, event publishers
//! - [`config`] - Typed configuration for every component
//! - [`coordinator`] - Write and Read Coordinators
//! - [`domain`] - Value objects, ports and domain events
//! - [`ec`] - Reed-Solomon encoder/decoder and codec cache
//! - [`engine`] - Gateway-facing facade
//! - [`error`] - Error types
//! - [`heal`] - Heal queue and Healing Manager
//! - [`metadata`] - Metadata replicas and the quorum client
//! - [`placement`] - Rendezvous-hash shard placement
//! - [`registry`] - Node membership, health and heartbeats
//! - [`rpc`] - Node RPC wire format and hyper server
//! - [`shard`] - Per-node on-disk shard store

pub mod adapters;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod ec;
pub mod engine;
pub mod error;
pub mod heal;
pub mod metadata;
pub mod placement;
pub mod registry;
pub mod rpc;
pub mod shard;

// Re-export commonly used types
pub use config::EngineConfig;
pub use coordinator::{PutOptions, ReadResult, WriteReceipt};
pub use domain::{ErasureScheme, MetadataEntry, NodeId, ObjectId, StorageClass, VersionId};
pub use engine::StorageEngine;
pub use error::{Error, Result};
