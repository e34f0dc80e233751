//! Metadata Store
//!
//! Versioned, quorum-replicated record of which objects exist, where their
//! shards live and what state they are in.
//!
//! - **Replica** (`replica.rs`) - acceptor state machine hosted by every node
//! - **Quorum** (`quorum.rs`) - proposer and majority reader used by the coordinators

pub mod quorum;
pub mod replica;

pub use quorum::MetadataStore;
pub use replica::{MetadataReplica, ReplicaRecord};
