//! Healing Manager
//!
//! Background repair of under-replicated and corrupt objects.
//!
//! ```text
//!  periodic scan ──┐
//!  node declared   ├──▶ HealQueue (dedup) ──▶ bounded worker pool ──▶ heal_object
//!  dead ───────────┤
//!  degraded reads ─┘
//! ```
//!
//! `heal_object` probes every shard, rebuilds the missing ones from any k
//! healthy shards, stores them (on the original node when it is still
//! alive, otherwise on a fresh node), and only then publishes the updated
//! placement. Objects with fewer than k shards left are marked corrupt.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::queue::{HealReason, HealTask};
use crate::config::HealConfig;
use crate::coordinator::{bounded, ClusterContext};
use crate::domain::{
    ClusterView, DomainEvent, ListFilter, MetadataEntry, NodeHealth, NodeId, ObjectId,
    ObjectState, PutShardRequest,
};
use crate::ec::ShardInput;
use crate::error::{Error, Result};
use crate::registry::{MembershipChange, MembershipEvent};

// =============================================================================
// Shard Assessment
// =============================================================================

/// Health of one shard as seen by a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardStatus {
    Healthy,
    Missing,
    Corrupt,
    /// Node did not answer; the shard may still be fine.
    Unreachable,
    /// Node is dead or unknown to the registry.
    NodeLost,
}

impl ShardStatus {
    /// Known to need a rewrite.
    fn is_lost(&self) -> bool {
        matches!(
            self,
            ShardStatus::Missing | ShardStatus::Corrupt | ShardStatus::NodeLost
        )
    }
}

/// Result of healing one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealOutcome {
    /// Every shard was already healthy.
    Healthy,
    Repaired { restored: Vec<usize> },
    /// Some shards could not be restored on this pass.
    PartiallyRepaired {
        restored: Vec<usize>,
        outstanding: Vec<usize>,
    },
    /// Fewer than k healthy shards remain.
    MarkedCorrupt { healthy: usize },
    /// Object gone, deleted, already corrupt, or the task was cancelled.
    Skipped,
}

/// Counts of one scan pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub examined: usize,
    pub queued: usize,
}

// =============================================================================
// Healing Manager
// =============================================================================

pub struct HealingManager {
    ctx: ClusterContext,
    config: HealConfig,
    workers: Arc<Semaphore>,
    active: DashMap<ObjectId, DateTime<Utc>>,
}

impl HealingManager {
    pub fn new(ctx: ClusterContext, config: HealConfig) -> Arc<Self> {
        Arc::new(Self {
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            ctx,
            config,
            active: DashMap::new(),
        })
    }

    /// Objects currently being healed.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Consume the heal queue, scan periodically and react to nodes being
    /// declared dead, until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting healing manager with {:?}", self.config);

        let mut tick = interval(self.config.scan_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick fires immediately; the first scan waits a full interval
        tick.tick().await;
        let mut membership = self.ctx.registry.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Healing manager shutting down");
                    break;
                }

                _ = tick.tick() => {
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = manager.scan_once().await {
                            error!("Heal scan failed: {}", e);
                        }
                    });
                }

                change = membership.recv() => match change {
                    Ok(event) => self.on_membership_change(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Healing manager missed membership events, scanning");
                        let manager = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = manager.scan_once().await {
                                error!("Heal scan failed: {}", e);
                            }
                        });
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                next = async {
                    let permit = Arc::clone(&self.workers).acquire_owned().await;
                    (permit, self.ctx.heal_queue.recv().await)
                } => match next {
                    (Ok(permit), Some(task)) => {
                        let manager = Arc::clone(&self);
                        tokio::spawn(async move {
                            manager.execute(task).await;
                            drop(permit);
                        });
                    }
                    (Err(e), _) => {
                        error!("Heal worker pool closed: {}", e);
                        break;
                    }
                    (_, None) => break,
                },
            }
        }
    }

    fn on_membership_change(self: &Arc<Self>, event: MembershipEvent) {
        if let MembershipChange::HealthChanged {
            to: NodeHealth::Dead,
            ..
        } = event.change
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = manager.queue_objects_on(&event.node_id).await {
                    error!(node = %event.node_id, "Failed to queue objects of dead node: {}", e);
                }
            });
        }
    }

    /// Queue every committed object that has a shard on `node_id`.
    pub async fn queue_objects_on(&self, node_id: &NodeId) -> Result<usize> {
        let entries = self.ctx.metadata.list(&ListFilter::all()).await?;
        let mut queued = 0;
        for versioned in entries {
            let entry = &versioned.entry;
            if entry.state == ObjectState::Committed
                && entry.placement.iter().any(|p| &p.node_id == node_id)
                && self
                    .ctx
                    .heal_queue
                    .enqueue(&entry.object_id, HealReason::NodeLost)
                    .await
            {
                queued += 1;
            }
        }
        info!(node = %node_id, queued, "Queued objects of lost node");
        Ok(queued)
    }

    /// Probe every committed object once and queue the unhealthy ones.
    #[instrument(skip(self))]
    pub async fn scan_once(&self) -> Result<ScanReport> {
        let entries = self.ctx.metadata.list(&ListFilter::all()).await?;
        let mut report = ScanReport::default();

        for versioned in entries {
            let entry = versioned.entry;
            if entry.state != ObjectState::Committed {
                continue;
            }
            report.examined += 1;

            let view = self.ctx.registry.snapshot();
            let statuses = self.assess(&entry, &view).await;
            if statuses.iter().any(|s| *s != ShardStatus::Healthy)
                && self
                    .ctx
                    .heal_queue
                    .enqueue(&entry.object_id, HealReason::Scan)
                    .await
            {
                report.queued += 1;
            }
            if !self.config.scan_pace.is_zero() {
                sleep(self.config.scan_pace).await;
            }
        }

        info!(examined = report.examined, queued = report.queued, "Heal scan complete");
        Ok(report)
    }

    async fn execute(&self, task: HealTask) {
        if task.is_cancelled() {
            debug!(object = %task.object_id, "Skipping cancelled heal task");
            self.ctx.heal_queue.complete(&task);
            return;
        }

        self.active.insert(task.object_id.clone(), Utc::now());
        let result = timeout(
            self.config.task_deadline,
            self.heal_object(&task.object_id, &task.cancel),
        )
        .await;
        match result {
            Ok(Ok(outcome)) => {
                debug!(object = %task.object_id, reason = %task.reason, ?outcome, "Heal task finished")
            }
            Ok(Err(e)) => error!(object = %task.object_id, reason = %task.reason, "Heal task failed: {}", e),
            Err(_) => error!(object = %task.object_id, "Heal task exceeded its deadline"),
        }
        self.active.remove(&task.object_id);
        self.ctx.heal_queue.complete(&task);
    }

    /// Probe all shards of `entry` in parallel.
    async fn assess(&self, entry: &MetadataEntry, view: &ClusterView) -> Vec<ShardStatus> {
        let deep = self.config.deep_probe;
        let rpc_timeout = self.config.rpc_timeout;
        let probes = (0..entry.scheme.total_shards()).map(|index| async move {
            let Some(node_id) = entry.node_for(index) else {
                return ShardStatus::NodeLost;
            };
            match view.get(node_id).map(|n| n.health) {
                None | Some(NodeHealth::Dead) => return ShardStatus::NodeLost,
                _ => {}
            }
            let service = match self.ctx.shard_service(view, node_id) {
                Ok(service) => service,
                Err(_) => return ShardStatus::Unreachable,
            };
            let probe = bounded(
                rpc_timeout,
                || format!("probe shard {} on {}", index, node_id),
                service.probe_shard(&entry.object_id, index, deep),
            )
            .await;
            match probe {
                Ok(probe) if !probe.exists => ShardStatus::Missing,
                Ok(probe)
                    if probe.healthy
                        && probe.checksum.as_deref() == entry.shard_checksum(index) =>
                {
                    ShardStatus::Healthy
                }
                Ok(_) => ShardStatus::Corrupt,
                Err(Error::NotFound(_)) => ShardStatus::Missing,
                Err(Error::Corrupt(_)) => ShardStatus::Corrupt,
                Err(e) => {
                    debug!(object = %entry.object_id, shard = index, "Probe failed: {}", e);
                    ShardStatus::Unreachable
                }
            }
        });
        join_all(probes).await
    }

    /// Fetch payloads of healthy shards until k verified ones are in hand.
    async fn gather(
        &self,
        entry: &MetadataEntry,
        view: &ClusterView,
        statuses: &[ShardStatus],
    ) -> Vec<ShardInput> {
        let k = entry.scheme.data_shards;
        let rpc_timeout = self.config.rpc_timeout;
        let mut inputs = Vec::with_capacity(k);

        for (index, status) in statuses.iter().enumerate() {
            if inputs.len() >= k {
                break;
            }
            if *status != ShardStatus::Healthy {
                continue;
            }
            let Some(node_id) = entry.node_for(index) else {
                continue;
            };
            let Ok(service) = self.ctx.shard_service(view, node_id) else {
                continue;
            };
            let fetched = bounded(
                rpc_timeout,
                || format!("get shard {} from {}", index, node_id),
                service.get_shard(&entry.object_id, index),
            )
            .await;
            match fetched {
                Ok(payload) => inputs.push(ShardInput::new(index, payload)),
                Err(e) => warn!(object = %entry.object_id, shard = index, "Healthy shard unreadable: {}", e),
            }
        }
        inputs
    }

    /// Restore `object_id` to full redundancy.
    #[instrument(skip(self, cancel), fields(object = %object_id))]
    pub async fn heal_object(
        &self,
        object_id: &ObjectId,
        cancel: &CancellationToken,
    ) -> Result<HealOutcome> {
        let started = Instant::now();
        let Some(versioned) = self.ctx.metadata.read(object_id).await? else {
            return Ok(HealOutcome::Skipped);
        };
        let entry = versioned.entry;
        if entry.state != ObjectState::Committed {
            return Ok(HealOutcome::Skipped);
        }

        let scheme = entry.scheme;
        let k = scheme.data_shards;
        let view = self.ctx.registry.snapshot();
        let statuses = self.assess(&entry, &view).await;

        let healthy = statuses.iter().filter(|s| **s == ShardStatus::Healthy).count();
        if healthy == scheme.total_shards() {
            return Ok(HealOutcome::Healthy);
        }
        let lost: Vec<usize> = statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_lost())
            .map(|(i, _)| i)
            .collect();
        let unreachable: Vec<usize> = statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == ShardStatus::Unreachable)
            .map(|(i, _)| i)
            .collect();

        if healthy < k {
            if healthy + unreachable.len() >= k {
                // not enough evidence of loss; try again on a later pass
                self.ctx
                    .emit(DomainEvent::heal_incomplete(
                        object_id,
                        lost.iter().chain(unreachable.iter()).copied().collect(),
                        "too many shards unreachable",
                    ))
                    .await;
                return Ok(HealOutcome::PartiallyRepaired {
                    restored: Vec::new(),
                    outstanding: lost.into_iter().chain(unreachable).collect(),
                });
            }
            return self.mark_corrupt(&entry, healthy).await;
        }
        if cancel.is_cancelled() {
            return Ok(HealOutcome::Skipped);
        }

        let inputs = self.gather(&entry, &view, &statuses).await;
        if inputs.len() < k {
            let outstanding: Vec<usize> = lost.iter().chain(unreachable.iter()).copied().collect();
            self.ctx
                .emit(DomainEvent::heal_incomplete(
                    object_id,
                    outstanding.clone(),
                    "healthy shards could not be fetched",
                ))
                .await;
            return Ok(HealOutcome::PartiallyRepaired {
                restored: Vec::new(),
                outstanding,
            });
        }

        let decoder = self.ctx.codecs.decoder(scheme)?;
        let rebuilt = match decoder.reconstruct_all(
            &object_id.to_string(),
            inputs,
            &entry.shard_checksums,
        ) {
            Ok(rebuilt) => rebuilt,
            Err(Error::UnrecoverableLoss { available, .. }) => {
                return self.mark_corrupt(&entry, available).await;
            }
            Err(e) => return Err(e),
        };

        let targets = self.choose_targets(&entry, &view, &statuses, &lost);
        if cancel.is_cancelled() {
            return Ok(HealOutcome::Skipped);
        }

        // store first, publish placement second
        let rpc_timeout = self.config.rpc_timeout;
        let view = &view;
        let puts = targets.iter().map(|(index, node_id)| {
            let index = *index;
            let payload = rebuilt[index].clone();
            let checksum = entry.shard_checksums[index].clone();
            async move {
                let result = match self.ctx.shard_service(view, node_id) {
                    Ok(service) => {
                        bounded(
                            rpc_timeout,
                            || format!("put shard {} on {}", index, node_id),
                            service.put_shard(PutShardRequest {
                                object_id: object_id.clone(),
                                shard_index: index,
                                kind: scheme.kind_of(index),
                                checksum,
                                payload,
                            }),
                        )
                        .await
                    }
                    Err(e) => Err(e),
                };
                (index, node_id.clone(), result)
            }
        });

        let mut restored = Vec::new();
        let mut moved: BTreeMap<usize, NodeId> = BTreeMap::new();
        for (index, node_id, result) in join_all(puts).await {
            match result {
                Ok(outcome) => {
                    debug!(shard = index, node = %node_id, ?outcome, "Shard restored");
                    restored.push(index);
                    if entry.node_for(index) != Some(&node_id) {
                        moved.insert(index, node_id);
                    }
                }
                Err(e) => warn!(shard = index, node = %node_id, "Restoring shard failed: {}", e),
            }
        }

        if !moved.is_empty() {
            let mut updated = entry.clone();
            for placement in updated.placement.iter_mut() {
                if let Some(node_id) = moved.get(&placement.shard_index) {
                    placement.node_id = node_id.clone();
                }
            }
            updated.validate_placement()?;
            if cancel.is_cancelled() {
                return Ok(HealOutcome::Skipped);
            }
            self.ctx.metadata.publish(&updated).await?;
            info!(moved = moved.len(), "Placement updated");
        }

        let outstanding: Vec<usize> = lost
            .iter()
            .chain(unreachable.iter())
            .copied()
            .filter(|i| !restored.contains(i))
            .collect();

        if !restored.is_empty() {
            info!(?restored, "Shards restored");
            self.ctx
                .emit(DomainEvent::shards_restored(
                    object_id,
                    restored.clone(),
                    moved.values().cloned().collect(),
                    started.elapsed(),
                ))
                .await;
        }

        if outstanding.is_empty() {
            Ok(HealOutcome::Repaired { restored })
        } else {
            self.ctx
                .emit(DomainEvent::heal_incomplete(
                    object_id,
                    outstanding.clone(),
                    "no eligible node or store failed",
                ))
                .await;
            Ok(HealOutcome::PartiallyRepaired {
                restored,
                outstanding,
            })
        }
    }

    /// Node for every lost shard: the original node when it is alive,
    /// otherwise the best-ranked alive node holding no shard of the object.
    fn choose_targets(
        &self,
        entry: &MetadataEntry,
        view: &ClusterView,
        statuses: &[ShardStatus],
        lost: &[usize],
    ) -> Vec<(usize, NodeId)> {
        let holders: HashSet<NodeId> = entry.placement.iter().map(|p| p.node_id.clone()).collect();
        let relocate: Vec<usize> = lost
            .iter()
            .copied()
            .filter(|i| statuses[*i] == ShardStatus::NodeLost)
            .collect();

        let mut targets: Vec<(usize, NodeId)> = lost
            .iter()
            .copied()
            .filter(|i| statuses[*i] != ShardStatus::NodeLost)
            .filter_map(|i| {
                entry
                    .node_for(i)
                    .filter(|n| view.is_alive(n))
                    .map(|n| (i, n.clone()))
            })
            .collect();

        let replacements =
            self.ctx
                .placement
                .choose_replacements(&entry.object_id, view, &holders, relocate.len());
        if replacements.len() < relocate.len() {
            warn!(
                object = %entry.object_id,
                needed = relocate.len(),
                available = replacements.len(),
                "Not enough spare nodes to relocate lost shards"
            );
        }
        targets.extend(relocate.into_iter().zip(replacements));
        targets
    }

    async fn mark_corrupt(&self, entry: &MetadataEntry, healthy: usize) -> Result<HealOutcome> {
        let k = entry.scheme.data_shards;
        error!(object = %entry.object_id, healthy, required = k, "Object lost redundancy beyond repair");
        self.ctx
            .metadata
            .publish(&entry.with_state(ObjectState::Corrupt))
            .await?;
        self.ctx
            .emit(DomainEvent::object_corrupt(&entry.object_id, healthy, k))
            .await;
        Ok(HealOutcome::MarkedCorrupt { healthy })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lost_statuses() {
        assert!(ShardStatus::Missing.is_lost());
        assert!(ShardStatus::Corrupt.is_lost());
        assert!(ShardStatus::NodeLost.is_lost());
        assert!(!ShardStatus::Unreachable.is_lost());
        assert!(!ShardStatus::Healthy.is_lost());
    }
}
