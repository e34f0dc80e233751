//! Metadata quorum client (proposer side).
//!
//! Runs the two-phase protocol against every replica in parallel and
//! proceeds as soon as a majority has answered:
//!
//! ```text
//! publish(entry)
//!   ├─ propose(n, entry) ──▶ majority Accepted ──▶ commit(n) ──▶ majority Committed
//!   │        │
//!   │        └─ Rejected{promised} ──▶ round = max(round, promised) + 1, retry
//!   └─ Conflict from any replica ──▶ fail
//! ```
//!
//! Reads ask a majority and return the entry with the highest proposal
//! number; since commits also needed a majority, the two sets intersect
//! and a committed entry is never missed.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::config::MetadataConfig;
use crate::domain::{
    CommitOutcome, ListFilter, MetadataEntry, MetadataService, NodeId, ObjectId, ObjectState,
    ProposalNumber, ProposeOutcome, VersionedEntry,
};
use crate::error::{reduce_errors, Error, Result};

type Pending<T> = FuturesUnordered<JoinHandle<(NodeId, Result<T>)>>;

/// Client view of the replicated Metadata Store.
pub struct MetadataStore {
    proposer: NodeId,
    replicas: Vec<Arc<dyn MetadataService>>,
    config: MetadataConfig,
    round: AtomicU64,
}

impl MetadataStore {
    pub fn new(
        proposer: NodeId,
        replicas: Vec<Arc<dyn MetadataService>>,
        config: MetadataConfig,
    ) -> Self {
        Self {
            proposer,
            replicas,
            config,
            round: AtomicU64::new(0),
        }
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Majority of the replica set.
    pub fn quorum(&self) -> usize {
        self.replicas.len() / 2 + 1
    }

    fn next_proposal(&self) -> ProposalNumber {
        let round = self.round.fetch_add(1, Ordering::SeqCst) + 1;
        ProposalNumber::new(round, self.proposer.clone())
    }

    fn observe(&self, proposal: &ProposalNumber) {
        self.round.fetch_max(proposal.round, Ordering::SeqCst);
    }

    /// Call every replica on its own task. Tasks outlive the caller, so
    /// replicas that answer after the quorum still apply the request.
    fn spawn_all<T, F, Fut>(&self, call: F) -> Pending<T>
    where
        F: Fn(Arc<dyn MetadataService>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let rpc_timeout = self.config.rpc_timeout;
        self.replicas
            .iter()
            .map(|replica| {
                let replica_id = replica.replica_id().clone();
                let fut = call(Arc::clone(replica));
                tokio::spawn(async move {
                    let result = match timeout(rpc_timeout, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout(format!("metadata replica {}", replica_id))),
                    };
                    (replica_id, result)
                })
            })
            .collect()
    }

    fn joined<T>(
        joined: std::result::Result<(NodeId, Result<T>), JoinError>,
    ) -> (Option<NodeId>, Result<T>) {
        match joined {
            Ok((node, result)) => (Some(node), result),
            Err(e) => (None, Err(Error::Internal(format!("replica task failed: {}", e)))),
        }
    }

    fn not_reached(&self, operation: &str, acks: usize, errors: &[Error]) -> Error {
        Error::QuorumNotReached {
            operation: operation.to_string(),
            acks,
            required: self.quorum(),
            dominant: reduce_errors(errors),
        }
    }

    /// Phase one: get `entry` accepted by a majority under a fresh proposal
    /// number. Retries with a higher round when outbid.
    #[instrument(skip(self, entry), fields(object = %entry.object_id, state = ?entry.state))]
    pub async fn propose(&self, entry: &MetadataEntry) -> Result<ProposalNumber> {
        let quorum = self.quorum();
        let mut last_errors = Vec::new();
        let mut last_acks = 0;

        for attempt in 1..=self.config.max_propose_attempts {
            let proposal = self.next_proposal();
            let object_id = entry.object_id.clone();
            let mut pending = {
                let proposal = proposal.clone();
                let entry = entry.clone();
                self.spawn_all(move |replica| {
                    let object_id = object_id.clone();
                    let proposal = proposal.clone();
                    let entry = entry.clone();
                    async move { replica.propose(&object_id, &proposal, &entry).await }
                })
            };

            let mut accepted = 0;
            let mut outbid = false;
            let mut errors = Vec::new();
            while let Some(joined) = pending.next().await {
                let (replica, result) = Self::joined(joined);
                match result {
                    Ok(ProposeOutcome::Accepted) => {
                        accepted += 1;
                        if accepted >= quorum {
                            debug!(%proposal, accepted, "Proposal accepted by quorum");
                            return Ok(proposal);
                        }
                    }
                    Ok(ProposeOutcome::Rejected { promised }) => {
                        debug!(?replica, %promised, "Proposal outbid");
                        self.observe(&promised);
                        outbid = true;
                        errors.push(Error::Conflict(format!("outbid by {}", promised)));
                    }
                    Err(Error::Conflict(reason)) => return Err(Error::Conflict(reason)),
                    Err(e) => {
                        debug!(?replica, "Propose failed: {}", e);
                        errors.push(e);
                    }
                }
            }

            last_acks = accepted;
            last_errors = errors;
            if !outbid {
                break;
            }
            warn!(attempt, %proposal, "Proposal did not reach quorum, retrying with a higher round");
            sleep(self.config.retry_backoff * attempt).await;
        }

        Err(self.not_reached("propose", last_acks, &last_errors))
    }

    /// Phase two: make an accepted proposal visible.
    #[instrument(skip(self), fields(object = %object_id, proposal = %proposal))]
    pub async fn commit(&self, object_id: &ObjectId, proposal: &ProposalNumber) -> Result<()> {
        let quorum = self.quorum();
        let mut pending = {
            let object_id = object_id.clone();
            let proposal = proposal.clone();
            self.spawn_all(move |replica| {
                let object_id = object_id.clone();
                let proposal = proposal.clone();
                async move { replica.commit(&object_id, &proposal).await }
            })
        };

        let mut committed = 0;
        let mut errors = Vec::new();
        while let Some(joined) = pending.next().await {
            match Self::joined(joined).1 {
                Ok(CommitOutcome::Committed) => {
                    committed += 1;
                    if committed >= quorum {
                        return Ok(());
                    }
                }
                Ok(CommitOutcome::NotAccepted) => {
                    errors.push(Error::Conflict(format!("{} not accepted", proposal)));
                }
                Err(e) => errors.push(e),
            }
        }
        Err(self.not_reached("commit", committed, &errors))
    }

    /// Propose and commit `entry`; returns the winning proposal number.
    pub async fn publish(&self, entry: &MetadataEntry) -> Result<ProposalNumber> {
        let mut attempt = 1;
        loop {
            let proposal = self.propose(entry).await?;
            match self.commit(&entry.object_id, &proposal).await {
                Ok(()) => {
                    info!(object = %entry.object_id, state = ?entry.state, %proposal, "Metadata committed");
                    return Ok(proposal);
                }
                // a competing proposer took over between the phases
                Err(Error::QuorumNotReached { .. }) if attempt < self.config.max_propose_attempts => {
                    attempt += 1;
                    sleep(self.config.retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Linearizable read of the latest committed entry.
    #[instrument(skip(self), fields(object = %object_id))]
    pub async fn read(&self, object_id: &ObjectId) -> Result<Option<VersionedEntry>> {
        let quorum = self.quorum();
        let mut pending = {
            let object_id = object_id.clone();
            self.spawn_all(move |replica| {
                let object_id = object_id.clone();
                async move { replica.read(&object_id).await }
            })
        };

        let mut answers: Vec<(NodeId, Option<VersionedEntry>)> = Vec::new();
        let mut errors = Vec::new();
        while let Some(joined) = pending.next().await {
            match Self::joined(joined) {
                (Some(replica), Ok(answer)) => {
                    answers.push((replica, answer));
                    if answers.len() >= quorum {
                        break;
                    }
                }
                (_, Ok(_)) => {}
                (_, Err(e)) => errors.push(e),
            }
        }
        if answers.len() < quorum {
            return Err(self.not_reached("read", answers.len(), &errors));
        }

        let newest = answers
            .iter()
            .filter_map(|(_, a)| a.as_ref())
            .max_by(|a, b| a.proposal.cmp(&b.proposal))
            .cloned();

        if let Some(newest) = &newest {
            self.observe(&newest.proposal);
            if self.config.read_repair {
                let lagging: Vec<NodeId> = answers
                    .iter()
                    .filter(|(_, a)| a.as_ref().map_or(true, |a| a.proposal < newest.proposal))
                    .map(|(replica, _)| replica.clone())
                    .collect();
                self.repair(newest.clone(), lagging);
            }
        }
        Ok(newest)
    }

    /// Push `newest` to lagging replicas in the background.
    fn repair(&self, newest: VersionedEntry, lagging: Vec<NodeId>) {
        if lagging.is_empty() {
            return;
        }
        let targets: Vec<Arc<dyn MetadataService>> = self
            .replicas
            .iter()
            .filter(|r| lagging.contains(r.replica_id()))
            .cloned()
            .collect();
        let rpc_timeout = self.config.rpc_timeout;

        tokio::spawn(async move {
            let object_id = newest.entry.object_id.clone();
            for replica in targets {
                let repaired = timeout(rpc_timeout, async {
                    match replica.propose(&object_id, &newest.proposal, &newest.entry).await? {
                        ProposeOutcome::Accepted => {
                            replica.commit(&object_id, &newest.proposal).await.map(Some)
                        }
                        ProposeOutcome::Rejected { .. } => Ok(None),
                    }
                })
                .await;
                match repaired {
                    Ok(Ok(Some(CommitOutcome::Committed))) => {
                        debug!(replica = %replica.replica_id(), object = %object_id, "Read repair applied")
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(replica = %replica.replica_id(), object = %object_id, "Read repair failed: {}", e),
                    Err(_) => warn!(replica = %replica.replica_id(), object = %object_id, "Read repair timed out"),
                }
            }
        });
    }

    /// Committed entries matching `filter`, merged across a majority by
    /// highest proposal number and ordered by object identity.
    #[instrument(skip(self))]
    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<VersionedEntry>> {
        let quorum = self.quorum();
        let mut pending = {
            let filter = filter.clone();
            self.spawn_all(move |replica| {
                let filter = filter.clone();
                async move { replica.list(&filter).await }
            })
        };

        let mut merged: BTreeMap<ObjectId, VersionedEntry> = BTreeMap::new();
        let mut answered = 0;
        let mut errors = Vec::new();
        while let Some(joined) = pending.next().await {
            match Self::joined(joined).1 {
                Ok(entries) => {
                    answered += 1;
                    for versioned in entries {
                        let id = versioned.entry.object_id.clone();
                        match merged.get(&id) {
                            Some(current) if current.proposal >= versioned.proposal => {}
                            _ => {
                                merged.insert(id, versioned);
                            }
                        }
                    }
                    if answered >= quorum {
                        break;
                    }
                }
                Err(e) => errors.push(e),
            }
        }
        if answered < quorum {
            return Err(self.not_reached("list", answered, &errors));
        }
        Ok(merged.into_values().collect())
    }

    /// Greatest live version of `bucket/key`.
    pub async fn latest(&self, bucket: &str, key: &str) -> Result<Option<VersionedEntry>> {
        let versions = self.list(&ListFilter::key(bucket, key)).await?;
        Ok(versions
            .into_iter()
            .filter(|v| v.entry.state != ObjectState::Deleted && v.entry.state != ObjectState::Pending)
            .max_by(|a, b| a.entry.object_id.version.cmp(&b.entry.object_id.version)))
    }
}
