//! Infrastructure Adapters
//!
//! Implementations of the domain ports.
//!
//! ```text
//!        ShardService │ MetadataService │ NodeConnector │ EventPublisher
//!                              ▲
//!        ┌─────────────────────┼──────────────────────────┐
//!   local (in-process)    http (reqwest)          event publishers
//! ```
//!
//! - [`local`]: every node inside one process, with fault injection; backs
//!   embedded clusters and the scenario tests.
//! - [`http`]: clients for the node RPC served by [`crate::rpc::NodeServer`].
//! - Event publishers: structured logs, in-memory capture, fan-out.

pub mod http;
pub mod local;

mod event_publisher;

pub use event_publisher::{CompositeEventPublisher, InMemoryEventCollector, LoggingEventPublisher};
pub use http::{HttpConnector, HttpMetadataClient, HttpRegistryClient, HttpShardClient};
pub use local::{FaultMode, LocalCluster, LocalConnector, LocalNode};
