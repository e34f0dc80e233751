//! Write Coordinator
//!
//! Drives one object write through a state machine:
//!
//! ```text
//! Initiated ─▶ Encoding ─▶ Distributing ─▶ AwaitingQuorumAck ─▶ MetadataCommitted
//!     │            │             │                 │
//!     └────────────┴─────────────┴─────────────────┴──────────▶ Failed
//! ```
//!
//! A write needs `k + ceil(m/2)` shard acks before its metadata is
//! committed. The deadline bounds the wait for those acks; once metadata
//! has been proposed the commit is driven to a decided outcome. On any
//! failure after encoding, pushes are allowed to settle and every shard
//! already written is deleted best-effort. A metadata publish that fails
//! is retracted with a `Deleted` entry first, so a commit that landed on
//! some replicas never exposes the partial write.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant as TokioInstant};
use tracing::{debug, info, instrument, warn};

use super::{bounded, ClusterContext};
use crate::config::{ErasureConfig, WriteConfig};
use crate::domain::{
    DomainEvent, ErasureScheme, MetadataEntry, NodeId, ObjectId, ObjectState, PlacementEntry,
    ProposalNumber, PutOutcome, PutShardRequest, ShardService, StorageClass, VersionId,
};
use crate::ec::EncodedObject;
use crate::error::{reduce_errors, Error, Result};
use crate::heal::HealReason;

// =============================================================================
// State Machine
// =============================================================================

/// States of a single object write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Initiated,
    Encoding,
    Distributing,
    AwaitingQuorumAck,
    MetadataCommitted,
    Failed,
}

impl WriteState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WriteState::MetadataCommitted | WriteState::Failed)
    }

    /// Forward by one step, or to `Failed` from any non-terminal state.
    pub fn can_transition_to(self, next: WriteState) -> bool {
        use WriteState::*;
        match (self, next) {
            (s, Failed) => !s.is_terminal(),
            (Initiated, Encoding)
            | (Encoding, Distributing)
            | (Distributing, AwaitingQuorumAck)
            | (AwaitingQuorumAck, MetadataCommitted) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WriteState::Initiated => "initiated",
            WriteState::Encoding => "encoding",
            WriteState::Distributing => "distributing",
            WriteState::AwaitingQuorumAck => "awaiting_quorum_ack",
            WriteState::MetadataCommitted => "metadata_committed",
            WriteState::Failed => "failed",
        }
    }
}

impl fmt::Display for WriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the state of one write and every state it went through.
#[derive(Debug)]
struct WriteTracker {
    object_id: ObjectId,
    state: WriteState,
    history: Vec<WriteState>,
}

impl WriteTracker {
    fn new(object_id: ObjectId) -> Self {
        Self {
            object_id,
            state: WriteState::Initiated,
            history: vec![WriteState::Initiated],
        }
    }

    fn advance(&mut self, next: WriteState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "write {}: illegal transition {} -> {}",
                self.object_id, self.state, next
            )));
        }
        debug!(object = %self.object_id, from = %self.state, to = %next, "Write state");
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

// =============================================================================
// Requests and Receipts
// =============================================================================

/// Per-object options supplied by the gateway.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutOptions {
    pub storage_class: StorageClass,
    pub content_type: Option<String>,
    pub user_metadata: BTreeMap<String, String>,
}

/// A complete object handed over by the gateway.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub bucket: String,
    pub key: String,
    pub data: Bytes,
    pub options: PutOptions,
}

impl WriteRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            data: data.into(),
            options: PutOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PutOptions) -> Self {
        self.options = options;
        self
    }
}

/// Outcome of a committed write.
#[derive(Debug, Clone)]
pub struct WriteReceipt {
    pub object_id: ObjectId,
    pub proposal: ProposalNumber,
    pub scheme: ErasureScheme,
    pub acked_shards: usize,
    pub history: Vec<WriteState>,
    pub duration: Duration,
}

type ShardResult = (usize, NodeId, Result<PutOutcome>);

// =============================================================================
// Coordinator
// =============================================================================

pub struct WriteCoordinator {
    ctx: ClusterContext,
    erasure: ErasureConfig,
    config: WriteConfig,
}

impl WriteCoordinator {
    pub fn new(ctx: ClusterContext, erasure: ErasureConfig, config: WriteConfig) -> Self {
        Self {
            ctx,
            erasure,
            config,
        }
    }

    /// Write a new object version and return its receipt.
    #[instrument(skip(self, request), fields(bucket = %request.bucket, key = %request.key, size = request.data.len()))]
    pub async fn write(&self, request: WriteRequest) -> Result<WriteReceipt> {
        let started = Instant::now();
        let deadline = TokioInstant::now() + self.config.deadline;
        let object_id = ObjectId::new(&request.bucket, &request.key, VersionId::generate());
        let mut tracker = WriteTracker::new(object_id.clone());

        match self.run(&mut tracker, request, deadline, started).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                let failed_in = tracker.state;
                if !failed_in.is_terminal() {
                    tracker.advance(WriteState::Failed)?;
                }
                warn!(object = %object_id, %failed_in, "Write failed: {}", e);
                self.ctx
                    .emit(DomainEvent::write_failed(&object_id, failed_in.as_str(), e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        tracker: &mut WriteTracker,
        request: WriteRequest,
        deadline: TokioInstant,
        started: Instant,
    ) -> Result<WriteReceipt> {
        let object_id = tracker.object_id.clone();

        // Initiated: identity reserved, placement fixed.
        let scheme = self.erasure.scheme_for(request.options.storage_class)?;
        let view = self.ctx.registry.snapshot();
        let placement = self.ctx.placement.choose_placement(&object_id, scheme, &view)?;
        let services: Vec<Arc<dyn ShardService>> = placement
            .iter()
            .map(|p| self.ctx.shard_service(&view, &p.node_id))
            .collect::<Result<_>>()?;

        tracker.advance(WriteState::Encoding)?;
        let encoded = self.ctx.codecs.encoder(scheme)?.encode(&request.data)?;

        tracker.advance(WriteState::Distributing)?;
        let mut pending = self.distribute(&object_id, &encoded, &placement, &services);

        tracker.advance(WriteState::AwaitingQuorumAck)?;
        let acked = match self.await_quorum(&object_id, scheme, &mut pending, deadline).await {
            Ok(acked) => acked,
            Err(e) => {
                self.abandon(&object_id, &services, pending).await;
                return Err(e);
            }
        };

        let entry = MetadataEntry {
            object_id: object_id.clone(),
            size: request.data.len() as u64,
            checksum: crate::domain::content_checksum(&request.data),
            created_at: Utc::now(),
            scheme,
            shard_size: encoded.shard_size,
            pad_len: encoded.pad_len,
            placement,
            shard_checksums: encoded.shard_checksums(),
            state: ObjectState::Committed,
            storage_class: request.options.storage_class,
            content_type: request.options.content_type,
            user_metadata: request.options.user_metadata,
        };
        if let Err(e) = entry.validate_placement() {
            self.abandon(&object_id, &services, pending).await;
            return Err(e);
        }

        // every metadata RPC is bounded on its own; the write deadline no
        // longer applies once replicas may have accepted the entry
        let proposal = match self.ctx.metadata.publish(&entry).await {
            Ok(proposal) => proposal,
            Err(e) => {
                self.retract(&entry).await;
                self.abandon(&object_id, &services, pending).await;
                return Err(e);
            }
        };
        tracker.advance(WriteState::MetadataCommitted)?;

        self.finish_stragglers(object_id.clone(), pending);

        let duration = started.elapsed();
        info!(
            object = %object_id,
            %scheme,
            acked,
            duration_ms = duration.as_millis() as u64,
            "Object committed"
        );
        self.ctx
            .emit(DomainEvent::object_committed(
                &object_id,
                entry.size,
                scheme,
                acked,
                duration,
            ))
            .await;

        Ok(WriteReceipt {
            object_id,
            proposal,
            scheme,
            acked_shards: acked,
            history: tracker.history.clone(),
            duration,
        })
    }

    /// Push every shard to its node on its own task.
    fn distribute(
        &self,
        object_id: &ObjectId,
        encoded: &EncodedObject,
        placement: &[PlacementEntry],
        services: &[Arc<dyn ShardService>],
    ) -> FuturesUnordered<JoinHandle<ShardResult>> {
        let rpc_timeout = self.config.rpc_timeout;
        encoded
            .shards
            .iter()
            .zip(placement.iter().zip(services.iter()))
            .map(|(shard, (entry, service))| {
                let service = Arc::clone(service);
                let node = entry.node_id.clone();
                let request = PutShardRequest {
                    object_id: object_id.clone(),
                    shard_index: shard.index,
                    kind: shard.kind,
                    checksum: shard.checksum.clone(),
                    payload: shard.payload.clone(),
                };
                let index = shard.index;
                tokio::spawn(async move {
                    let what = {
                        let node = node.clone();
                        move || format!("put shard {} on {}", index, node)
                    };
                    let result = bounded(rpc_timeout, what, service.put_shard(request)).await;
                    (index, node, result)
                })
            })
            .collect()
    }

    /// Count acks until the write quorum is met, failing as soon as it
    /// can no longer be met or the deadline passes.
    async fn await_quorum(
        &self,
        object_id: &ObjectId,
        scheme: ErasureScheme,
        pending: &mut FuturesUnordered<JoinHandle<ShardResult>>,
        deadline: TokioInstant,
    ) -> Result<usize> {
        let required = scheme.write_quorum();
        let total = scheme.total_shards();
        let mut acked = 0;
        let mut errors = Vec::new();

        while acked < required {
            if acked + pending.len() < required {
                return Err(Error::QuorumNotReached {
                    operation: "write".to_string(),
                    acks: acked,
                    required,
                    dominant: reduce_errors(&errors),
                });
            }
            match timeout_at(deadline, pending.next()).await {
                Ok(Some(Ok((index, node, Ok(outcome))))) => {
                    debug!(object = %object_id, shard = index, %node, ?outcome, "Shard acked");
                    acked += 1;
                }
                Ok(Some(Ok((index, node, Err(e))))) => {
                    warn!(object = %object_id, shard = index, %node, "Shard push failed: {}", e);
                    errors.push(e);
                }
                Ok(Some(Err(join))) => {
                    errors.push(Error::Internal(format!("shard push task failed: {}", join)));
                }
                Ok(None) => break,
                Err(_) => {
                    return Err(Error::DeadlineExceeded(format!(
                        "write of {}: {}/{} shard acks of {} shards",
                        object_id, acked, required, total
                    )));
                }
            }
        }

        if acked < required {
            return Err(Error::QuorumNotReached {
                operation: "write".to_string(),
                acks: acked,
                required,
                dominant: reduce_errors(&errors),
            });
        }
        Ok(acked)
    }

    /// Let remaining pushes finish after commit; heal the object if any fails.
    fn finish_stragglers(&self, object_id: ObjectId, mut pending: FuturesUnordered<JoinHandle<ShardResult>>) {
        if pending.is_empty() {
            return;
        }
        let heal_queue = Arc::clone(&self.ctx.heal_queue);
        tokio::spawn(async move {
            let mut failed = 0usize;
            while let Some(joined) = pending.next().await {
                match joined {
                    Ok((_, _, Ok(_))) => {}
                    Ok((index, node, Err(e))) => {
                        debug!(object = %object_id, shard = index, %node, "Straggler failed: {}", e);
                        failed += 1;
                    }
                    Err(_) => failed += 1,
                }
            }
            if failed > 0 {
                heal_queue.enqueue(&object_id, HealReason::WriteStragglers).await;
            }
        });
    }

    /// Supersede an entry that may have been committed on a minority of
    /// replicas, so neither reads nor read repair can surface it.
    async fn retract(&self, entry: &MetadataEntry) {
        let tombstone = entry.with_state(ObjectState::Deleted);
        match self.ctx.metadata.publish(&tombstone).await {
            Ok(proposal) => {
                debug!(object = %entry.object_id, %proposal, "Retracted failed write")
            }
            Err(e) => warn!(object = %entry.object_id, "Failed to retract metadata: {}", e),
        }
    }

    /// Wait for every outstanding push to finish or time out, then delete
    /// whatever was stored. Pushes are bounded by the RPC timeout.
    async fn abandon(
        &self,
        object_id: &ObjectId,
        services: &[Arc<dyn ShardService>],
        mut pending: FuturesUnordered<JoinHandle<ShardResult>>,
    ) {
        while let Some(joined) = pending.next().await {
            if let Ok((index, node, Ok(_))) = joined {
                debug!(object = %object_id, shard = index, %node, "Push landed after failure");
            }
        }
        self.cleanup(object_id, services).await;
    }

    /// Best-effort removal of every shard this write may have stored.
    async fn cleanup(&self, object_id: &ObjectId, services: &[Arc<dyn ShardService>]) {
        let rpc_timeout = self.config.rpc_timeout;
        let mut deletes: FuturesUnordered<_> = services
            .iter()
            .enumerate()
            .map(|(index, service)| {
                let service = Arc::clone(service);
                let object_id = object_id.clone();
                async move {
                    let node = service.node_id().clone();
                    let result = bounded(
                        rpc_timeout,
                        || format!("delete shard {} on {}", index, node),
                        service.delete_shard(&object_id, index),
                    )
                    .await;
                    (index, result)
                }
            })
            .collect();

        while let Some((index, result)) = deletes.next().await {
            if let Err(e) = result {
                warn!(object = %object_id, shard = index, "Cleanup delete failed: {}", e);
            }
        }
        debug!(object = %object_id, "Cleaned up partial write");
    }
}
