//! Metadata replica (acceptor side).
//!
//! Keeps, per object identity, the highest proposal number promised, the
//! last accepted entry and the last committed entry. Rules:
//!
//! - `propose(n, e)` is accepted iff `n >= promised` and `n > committed.n`.
//!   A proposal that changes size or checksums of a committed entry, or
//!   revives a deleted one, is a `Conflict`.
//! - `commit(n)` succeeds iff `n` is the accepted proposal, or was
//!   already committed.
//!
//! With a data directory, state lives in
//! `<root>/meta/aa/bb/<blake3(object-id)>.json` and is written before any
//! answer leaves the replica.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    CommitOutcome, ListFilter, MetadataEntry, MetadataService, NodeId, ObjectId, ObjectState,
    ProposalNumber, ProposeOutcome, VersionedEntry,
};
use crate::error::{Error, Result};

/// Persisted acceptor state of one object identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub promised: Option<ProposalNumber>,
    pub accepted: Option<VersionedEntry>,
    pub committed: Option<VersionedEntry>,
}

impl ReplicaRecord {
    fn object_id(&self) -> Option<&ObjectId> {
        self.committed
            .as_ref()
            .or(self.accepted.as_ref())
            .map(|v| &v.entry.object_id)
    }

    /// Decide a proposal; returns the next record when it is accepted.
    fn decide_propose(
        &self,
        proposal: &ProposalNumber,
        entry: &MetadataEntry,
    ) -> Result<(ProposeOutcome, Option<ReplicaRecord>)> {
        if let Some(committed) = &self.committed {
            if committed.proposal == *proposal && committed.entry == *entry {
                return Ok((ProposeOutcome::Accepted, None));
            }
            if *proposal <= committed.proposal {
                let promised = self
                    .promised
                    .clone()
                    .map_or(committed.proposal.clone(), |p| p.max(committed.proposal.clone()));
                return Ok((ProposeOutcome::Rejected { promised }, None));
            }
            if committed.entry.state == ObjectState::Deleted && entry.state != ObjectState::Deleted {
                return Err(Error::Conflict(format!(
                    "{} is deleted; deletion is terminal",
                    entry.object_id
                )));
            }
            if !committed.entry.same_content(entry) {
                return Err(Error::Conflict(format!(
                    "{} is already committed with different content",
                    entry.object_id
                )));
            }
        }
        if let Some(promised) = &self.promised {
            if proposal < promised {
                return Ok((
                    ProposeOutcome::Rejected {
                        promised: promised.clone(),
                    },
                    None,
                ));
            }
        }

        let next = ReplicaRecord {
            promised: Some(proposal.clone()),
            accepted: Some(VersionedEntry {
                proposal: proposal.clone(),
                entry: entry.clone(),
            }),
            committed: self.committed.clone(),
        };
        Ok((ProposeOutcome::Accepted, Some(next)))
    }

    fn decide_commit(&self, proposal: &ProposalNumber) -> (CommitOutcome, Option<ReplicaRecord>) {
        if self
            .committed
            .as_ref()
            .is_some_and(|c| c.proposal == *proposal)
        {
            return (CommitOutcome::Committed, None);
        }
        match &self.accepted {
            Some(accepted) if accepted.proposal == *proposal => {
                let next = ReplicaRecord {
                    committed: Some(accepted.clone()),
                    ..self.clone()
                };
                (CommitOutcome::Committed, Some(next))
            }
            _ => (CommitOutcome::NotAccepted, None),
        }
    }
}

/// One metadata replica, hosted by a storage node.
pub struct MetadataReplica {
    node_id: NodeId,
    root: Option<PathBuf>,
    sync_writes: bool,
    records: DashMap<ObjectId, Arc<Mutex<ReplicaRecord>>>,
}

impl MetadataReplica {
    /// Replica whose state is lost on drop.
    pub fn in_memory(node_id: NodeId) -> Self {
        Self {
            node_id,
            root: None,
            sync_writes: false,
            records: DashMap::new(),
        }
    }

    /// Open or create a persistent replica under `<root>/meta`.
    pub fn open(node_id: NodeId, root: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let meta_dir = root.join("meta");
        std::fs::create_dir_all(&meta_dir)?;

        let records = DashMap::new();
        for record in load_dir(&meta_dir)? {
            if let Some(id) = record.object_id().cloned() {
                records.insert(id, Arc::new(Mutex::new(record)));
            }
        }
        info!(
            node = %node_id,
            path = %meta_dir.display(),
            objects = records.len(),
            "Metadata replica opened"
        );

        Ok(Self {
            node_id,
            root: Some(root),
            sync_writes,
            records,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn record_path(&self, object_id: &ObjectId) -> Option<PathBuf> {
        let digest = object_id.digest();
        self.root.as_ref().map(|root| {
            root.join("meta")
                .join(&digest[0..2])
                .join(&digest[2..4])
                .join(format!("{}.json", digest))
        })
    }

    fn slot(&self, object_id: &ObjectId) -> Arc<Mutex<ReplicaRecord>> {
        Arc::clone(
            self.records
                .entry(object_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(ReplicaRecord::default())))
                .value(),
        )
    }

    async fn persist(&self, object_id: &ObjectId, record: &ReplicaRecord) -> Result<()> {
        let Some(path) = self.record_path(object_id) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(record)?;
        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        if self.sync_writes {
            file.sync_all().await?;
        }
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    #[instrument(skip(self, entry), fields(replica = %self.node_id, object = %object_id, proposal = %proposal))]
    pub async fn propose(
        &self,
        object_id: &ObjectId,
        proposal: &ProposalNumber,
        entry: &MetadataEntry,
    ) -> Result<ProposeOutcome> {
        if entry.object_id != *object_id {
            return Err(Error::Conflict(format!(
                "entry for {} proposed under {}",
                entry.object_id, object_id
            )));
        }

        let slot = self.slot(object_id);
        let mut record = slot.lock().await;
        let (outcome, next) = record.decide_propose(proposal, entry)?;
        if let Some(next) = next {
            self.persist(object_id, &next).await?;
            *record = next;
        }
        debug!(?outcome, "Propose decided");
        Ok(outcome)
    }

    #[instrument(skip(self), fields(replica = %self.node_id, object = %object_id, proposal = %proposal))]
    pub async fn commit(
        &self,
        object_id: &ObjectId,
        proposal: &ProposalNumber,
    ) -> Result<CommitOutcome> {
        let Some(slot) = self.records.get(object_id).map(|s| Arc::clone(s.value())) else {
            return Ok(CommitOutcome::NotAccepted);
        };
        let mut record = slot.lock().await;
        let (outcome, next) = record.decide_commit(proposal);
        if let Some(next) = next {
            self.persist(object_id, &next).await?;
            *record = next;
        }
        debug!(?outcome, "Commit decided");
        Ok(outcome)
    }

    /// Latest committed entry.
    pub async fn read(&self, object_id: &ObjectId) -> Option<VersionedEntry> {
        let slot = self.records.get(object_id).map(|s| Arc::clone(s.value()))?;
        let record = slot.lock().await;
        record.committed.clone()
    }

    /// Committed entries matching `filter`, ordered by object identity.
    pub async fn list(&self, filter: &ListFilter) -> Vec<VersionedEntry> {
        let slots: Vec<Arc<Mutex<ReplicaRecord>>> = self
            .records
            .iter()
            .filter(|r| filter.matches(r.key()))
            .map(|r| Arc::clone(r.value()))
            .collect();

        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(committed) = slot.lock().await.committed.clone() {
                out.push(committed);
            }
        }
        out.sort_by(|a, b| a.entry.object_id.cmp(&b.entry.object_id));
        out
    }
}

#[async_trait]
impl MetadataService for MetadataReplica {
    fn replica_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn propose(
        &self,
        object_id: &ObjectId,
        proposal: &ProposalNumber,
        entry: &MetadataEntry,
    ) -> Result<ProposeOutcome> {
        MetadataReplica::propose(self, object_id, proposal, entry).await
    }

    async fn commit(
        &self,
        object_id: &ObjectId,
        proposal: &ProposalNumber,
    ) -> Result<CommitOutcome> {
        MetadataReplica::commit(self, object_id, proposal).await
    }

    async fn read(&self, object_id: &ObjectId) -> Result<Option<VersionedEntry>> {
        Ok(MetadataReplica::read(self, object_id).await)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<VersionedEntry>> {
        Ok(MetadataReplica::list(self, filter).await)
    }
}

/// Load every record under `dir`, dropping temp files and unreadable records.
fn load_dir(dir: &Path) -> Result<Vec<ReplicaRecord>> {
    let mut records = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
                continue;
            }
            if path.extension().is_some_and(|ext| ext == "tmp") {
                std::fs::remove_file(&path)?;
                continue;
            }
            if path.extension().is_some_and(|ext| ext == "json") {
                let raw = match std::fs::read(&path) {
                    Ok(raw) => raw,
                    Err(e) if e.kind() == IoErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                match serde_json::from_slice::<ReplicaRecord>(&raw) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(path = %path.display(), "Skipping unreadable metadata record: {}", e),
                }
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        content_checksum, ErasureScheme, PlacementEntry, StorageClass, VersionId,
    };
    use assert_matches::assert_matches;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn entry(id: &ObjectId, body: &[u8]) -> MetadataEntry {
        MetadataEntry {
            object_id: id.clone(),
            size: body.len() as u64,
            checksum: content_checksum(body),
            created_at: Utc::now(),
            scheme: ErasureScheme::new(2, 1),
            shard_size: body.len().div_ceil(2),
            pad_len: 0,
            placement: (0..3)
                .map(|i| PlacementEntry {
                    shard_index: i,
                    node_id: NodeId::new(format!("n{}", i)),
                })
                .collect(),
            shard_checksums: vec!["a".into(), "b".into(), "c".into()],
            state: ObjectState::Committed,
            storage_class: StorageClass::Standard,
            content_type: None,
            user_metadata: BTreeMap::new(),
        }
    }

    fn n(round: u64, proposer: &str) -> ProposalNumber {
        ProposalNumber::new(round, NodeId::from(proposer))
    }

    fn object() -> ObjectId {
        ObjectId::new("b", "k", VersionId::generate())
    }

    #[tokio::test]
    async fn test_propose_commit_read() {
        let replica = MetadataReplica::in_memory(NodeId::from("r1"));
        let id = object();
        let e = entry(&id, b"hello");

        assert!(replica.read(&id).await.is_none());
        assert_eq!(
            replica.propose(&id, &n(1, "a"), &e).await.unwrap(),
            ProposeOutcome::Accepted
        );
        // accepted is not visible yet
        assert!(replica.read(&id).await.is_none());

        assert_eq!(
            replica.commit(&id, &n(1, "a")).await.unwrap(),
            CommitOutcome::Committed
        );
        let read = replica.read(&id).await.unwrap();
        assert_eq!(read.proposal, n(1, "a"));
        assert_eq!(read.entry, e);

        // commit is idempotent
        assert_eq!(
            replica.commit(&id, &n(1, "a")).await.unwrap(),
            CommitOutcome::Committed
        );
    }

    #[tokio::test]
    async fn test_lower_proposal_rejected() {
        let replica = MetadataReplica::in_memory(NodeId::from("r1"));
        let id = object();
        let e = entry(&id, b"hello");

        replica.propose(&id, &n(5, "a"), &e).await.unwrap();
        assert_eq!(
            replica.propose(&id, &n(4, "z"), &e).await.unwrap(),
            ProposeOutcome::Rejected {
                promised: n(5, "a")
            }
        );
        // same round, lower proposer id loses the tie
        assert_matches!(
            replica.propose(&id, &n(5, "0"), &e).await.unwrap(),
            ProposeOutcome::Rejected { .. }
        );
        assert_eq!(
            replica.commit(&id, &n(4, "z")).await.unwrap(),
            CommitOutcome::NotAccepted
        );
    }

    #[tokio::test]
    async fn test_superseded_proposal_cannot_commit() {
        let replica = MetadataReplica::in_memory(NodeId::from("r1"));
        let id = object();
        let e = entry(&id, b"hello");

        replica.propose(&id, &n(1, "a"), &e).await.unwrap();
        replica.propose(&id, &n(2, "b"), &e).await.unwrap();
        assert_eq!(
            replica.commit(&id, &n(1, "a")).await.unwrap(),
            CommitOutcome::NotAccepted
        );
        assert_eq!(
            replica.commit(&id, &n(2, "b")).await.unwrap(),
            CommitOutcome::Committed
        );
    }

    #[tokio::test]
    async fn test_committed_content_is_immutable() {
        let replica = MetadataReplica::in_memory(NodeId::from("r1"));
        let id = object();
        replica.propose(&id, &n(1, "a"), &entry(&id, b"one")).await.unwrap();
        replica.commit(&id, &n(1, "a")).await.unwrap();

        assert_matches!(
            replica.propose(&id, &n(2, "a"), &entry(&id, b"two")).await,
            Err(Error::Conflict(_))
        );

        // placement-only change is fine
        let mut moved = entry(&id, b"one");
        moved.placement[0].node_id = NodeId::from("n9");
        assert_eq!(
            replica.propose(&id, &n(2, "a"), &moved).await.unwrap(),
            ProposeOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn test_deletion_is_terminal() {
        let replica = MetadataReplica::in_memory(NodeId::from("r1"));
        let id = object();
        let e = entry(&id, b"one");
        replica.propose(&id, &n(1, "a"), &e).await.unwrap();
        replica.commit(&id, &n(1, "a")).await.unwrap();

        let deleted = e.with_state(ObjectState::Deleted);
        replica.propose(&id, &n(2, "a"), &deleted).await.unwrap();
        replica.commit(&id, &n(2, "a")).await.unwrap();

        assert_matches!(
            replica.propose(&id, &n(3, "a"), &e).await,
            Err(Error::Conflict(_))
        );
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = object();
        let e = entry(&id, b"durable");
        {
            let replica = MetadataReplica::open(NodeId::from("r1"), dir.path(), true).unwrap();
            replica.propose(&id, &n(3, "a"), &e).await.unwrap();
            replica.commit(&id, &n(3, "a")).await.unwrap();
            replica
                .propose(&id, &n(7, "b"), &e.with_state(ObjectState::Deleted))
                .await
                .unwrap();
        }

        let replica = MetadataReplica::open(NodeId::from("r1"), dir.path(), true).unwrap();
        assert_eq!(replica.len(), 1);
        assert_eq!(replica.read(&id).await.unwrap().proposal, n(3, "a"));
        // the promise to round 7 was kept
        assert_matches!(
            replica.propose(&id, &n(6, "z"), &e).await.unwrap(),
            ProposeOutcome::Rejected { .. }
        );
        assert_eq!(
            replica.commit(&id, &n(7, "b")).await.unwrap(),
            CommitOutcome::Committed
        );
    }

    #[tokio::test]
    async fn test_list_filters_by_key() {
        let replica = MetadataReplica::in_memory(NodeId::from("r1"));
        let a = ObjectId::new("b", "a", VersionId::generate());
        let b = ObjectId::new("b", "b", VersionId::generate());
        for id in [&a, &b] {
            replica.propose(id, &n(1, "p"), &entry(id, b"x")).await.unwrap();
            replica.commit(id, &n(1, "p")).await.unwrap();
        }

        assert_eq!(replica.list(&ListFilter::all()).await.len(), 2);
        let only_a = replica.list(&ListFilter::key("b", "a")).await;
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].entry.object_id, a);
    }
}
