//! Read Coordinator
//!
//! Resolves an object version through the metadata quorum, then fetches
//! shards in parallel: the k data shards first, then parity shards for
//! every data shard that is missing, corrupt, slow or on a node that is
//! not alive. Shards on suspect nodes are tried last. Decodes as soon as
//! k valid shards are in hand.
//!
//! Running out of shards is `UnrecoverableLoss` only when too few of them
//! could still be intact; when nodes merely failed to answer the read
//! fails with `QuorumNotReached`.
//!
//! Damage seen on the way is never repaired inline; the object is queued
//! for the Healing Manager instead.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::{timeout_at, Instant as TokioInstant};
use tracing::{debug, instrument, warn};

use super::{bounded, ClusterContext};
use crate::config::ReadConfig;
use crate::domain::{
    content_checksum, DomainEvent, MetadataEntry, NodeHealth, ObjectId, ObjectState,
    ProposalNumber, ShardService, VersionId,
};
use crate::ec::ShardInput;
use crate::error::{reduce_errors, Error, ErrorKind, Result};
use crate::heal::HealReason;

/// A successfully read object.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub entry: MetadataEntry,
    pub proposal: ProposalNumber,
    pub data: Bytes,
    /// Whether any shard was found unhealthy.
    pub degraded: bool,
    pub unhealthy_shards: Vec<usize>,
    pub duration: Duration,
}

pub struct ReadCoordinator {
    ctx: ClusterContext,
    config: ReadConfig,
}

impl ReadCoordinator {
    pub fn new(ctx: ClusterContext, config: ReadConfig) -> Self {
        Self { ctx, config }
    }

    /// Read `bucket/key` at `version`, or its latest live version.
    #[instrument(skip(self), fields(version = ?version))]
    pub async fn read(&self, bucket: &str, key: &str, version: Option<VersionId>) -> Result<ReadResult> {
        let started = Instant::now();
        let deadline = TokioInstant::now() + self.config.deadline;

        let resolved = match version {
            Some(version) => {
                let object_id = ObjectId::new(bucket, key, version);
                timeout_at(deadline, self.ctx.metadata.read(&object_id))
                    .await
                    .map_err(|_| Error::DeadlineExceeded(format!("metadata read of {}", object_id)))??
            }
            None => timeout_at(deadline, self.ctx.metadata.latest(bucket, key))
                .await
                .map_err(|_| Error::DeadlineExceeded(format!("latest version of {}/{}", bucket, key)))??,
        };
        let versioned = resolved.ok_or_else(|| Error::NotFound(format!("{}/{}", bucket, key)))?;
        let entry = versioned.entry;

        match entry.state {
            ObjectState::Committed => {}
            ObjectState::Deleted | ObjectState::Pending => {
                return Err(Error::NotFound(entry.object_id.to_string()));
            }
            ObjectState::Corrupt => {
                return Err(Error::UnrecoverableLoss {
                    object: entry.object_id.to_string(),
                    available: 0,
                    required: entry.scheme.data_shards,
                });
            }
        }

        let (data, unhealthy) = self.fetch_and_decode(&entry, deadline).await?;

        let duration = started.elapsed();
        if !unhealthy.is_empty() {
            warn!(object = %entry.object_id, ?unhealthy, "Degraded read");
            self.ctx
                .heal_queue
                .enqueue(&entry.object_id, HealReason::DegradedRead)
                .await;
            self.ctx
                .emit(DomainEvent::degraded_read(
                    &entry.object_id,
                    unhealthy.clone(),
                    duration,
                ))
                .await;
        }

        Ok(ReadResult {
            entry,
            proposal: versioned.proposal,
            data,
            degraded: !unhealthy.is_empty(),
            unhealthy_shards: unhealthy,
            duration,
        })
    }

    /// Collect k valid shards and decode; returns the bytes and the shard
    /// indices found unhealthy.
    async fn fetch_and_decode(
        &self,
        entry: &MetadataEntry,
        deadline: TokioInstant,
    ) -> Result<(Bytes, Vec<usize>)> {
        let object_id = &entry.object_id;
        let k = entry.scheme.data_shards;
        let total = entry.scheme.total_shards();
        let view = self.ctx.registry.snapshot();

        let mut unhealthy = BTreeSet::new();
        // alive holders in index order (data before parity), suspect
        // holders only once those run out
        let mut candidates: VecDeque<(usize, Arc<dyn ShardService>)> = VecDeque::new();
        let mut last_resort: Vec<(usize, Arc<dyn ShardService>)> = Vec::new();
        for index in 0..total {
            let Some(node_id) = entry.node_for(index) else {
                unhealthy.insert(index);
                continue;
            };
            let health = match view.health(node_id) {
                Some(NodeHealth::Dead) | None => {
                    debug!(object = %object_id, shard = index, node = %node_id, "Shard on dead or unknown node");
                    unhealthy.insert(index);
                    continue;
                }
                Some(health) => health,
            };
            match self.ctx.shard_service(&view, node_id) {
                Ok(service) if health.is_alive() => candidates.push_back((index, service)),
                Ok(service) => {
                    debug!(object = %object_id, shard = index, node = %node_id, "Shard on suspect node");
                    unhealthy.insert(index);
                    last_resort.push((index, service));
                }
                Err(e) => {
                    debug!(object = %object_id, shard = index, "No route to shard: {}", e);
                    unhealthy.insert(index);
                }
            }
        }
        candidates.extend(last_resort);

        let rpc_timeout = self.config.rpc_timeout;
        let fetch = |index: usize, service: Arc<dyn ShardService>| {
            let object_id = object_id.clone();
            let expected = entry.shard_checksum(index).map(str::to_string);
            async move {
                let node = service.node_id().clone();
                let result = bounded(
                    rpc_timeout,
                    || format!("get shard {} from {}", index, node),
                    service.get_shard(&object_id, index),
                )
                .await
                .and_then(|payload| match expected {
                    Some(expected) if content_checksum(&payload) == expected => Ok(payload),
                    _ => Err(Error::Corrupt(format!(
                        "shard {} from {} does not match recorded checksum",
                        index, node
                    ))),
                });
                (index, result)
            }
        };

        let mut in_flight = FuturesUnordered::new();
        while in_flight.len() < k {
            match candidates.pop_front() {
                Some((index, service)) => in_flight.push(fetch(index, service)),
                None => break,
            }
        }

        let mut valid: Vec<ShardInput> = Vec::with_capacity(k);
        let mut unreachable = Vec::new();
        while valid.len() < k {
            let next = timeout_at(deadline, in_flight.next()).await.map_err(|_| {
                Error::DeadlineExceeded(format!(
                    "read of {}: {}/{} valid shards",
                    object_id,
                    valid.len(),
                    k
                ))
            })?;
            match next {
                Some((index, Ok(payload))) => valid.push(ShardInput::new(index, payload)),
                Some((index, Err(e))) => {
                    debug!(object = %object_id, shard = index, "Shard unavailable: {}", e);
                    unhealthy.insert(index);
                    if matches!(e.kind(), ErrorKind::Timeout | ErrorKind::Unavailable) {
                        unreachable.push(e);
                    }
                    if let Some((index, service)) = candidates.pop_front() {
                        in_flight.push(fetch(index, service));
                    }
                }
                None => {
                    self.ctx
                        .heal_queue
                        .enqueue(object_id, HealReason::DegradedRead)
                        .await;
                    // shards that only failed to answer may still be intact
                    if valid.len() + unreachable.len() >= k {
                        return Err(Error::QuorumNotReached {
                            operation: format!("read of {}", object_id),
                            acks: valid.len(),
                            required: k,
                            dominant: reduce_errors(&unreachable),
                        });
                    }
                    let unhealthy: Vec<usize> = unhealthy.into_iter().collect();
                    return Err(Error::UnrecoverableLoss {
                        object: format!("{} (unhealthy shards {:?})", object_id, unhealthy),
                        available: valid.len(),
                        required: k,
                    });
                }
            }
        }
        drop(in_flight);

        let decoder = self.ctx.codecs.decoder(entry.scheme)?;
        let data = decoder.decode(
            &object_id.to_string(),
            valid,
            &entry.shard_checksums,
            entry.pad_len,
        )?;

        if data.len() as u64 != entry.size || content_checksum(&data) != entry.checksum {
            return Err(Error::Corrupt(format!(
                "{} decoded to {} bytes that do not match the recorded checksum",
                object_id,
                data.len()
            )));
        }

        Ok((Bytes::from(data), unhealthy.into_iter().collect()))
    }
}
