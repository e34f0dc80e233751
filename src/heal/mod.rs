//! Healing
//!
//! A deduplicated work queue fed by degraded reads, write stragglers,
//! periodic scans and node failures, drained by a bounded worker pool that
//! rebuilds lost shards.

mod manager;
mod queue;

pub use manager::{HealOutcome, HealingManager, ScanReport, ShardStatus};
pub use queue::{HealQueue, HealReason, HealTask};
