//! Shard Store
//!
//! Per-node durable storage of individual shards, addressed by object
//! identity and shard index. Every read verifies the payload checksum;
//! shards are immutable once stored.

pub mod format;
pub mod store;

pub use format::{ShardHeader, FORMAT_VERSION, SHARD_MAGIC};
pub use store::ShardStore;
