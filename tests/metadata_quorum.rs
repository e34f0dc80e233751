//! Metadata Quorum Integration Tests
//!
//! Majority semantics, conflict rules and restart durability of the
//! replicated Metadata Store.

use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use shardstor::config::MetadataConfig;
use shardstor::domain::{
    content_checksum, CommitOutcome, ErasureScheme, ListFilter, MetadataEntry, MetadataService,
    NodeId, ObjectId, ObjectState, PlacementEntry, ProposalNumber, ProposeOutcome, StorageClass,
    VersionId, VersionedEntry,
};
use shardstor::error::ErrorKind;
use shardstor::metadata::{MetadataReplica, MetadataStore};
use shardstor::{Error, Result};

// =============================================================================
// Helpers
// =============================================================================

/// A replica whose node is down.
struct DownReplica(NodeId);

#[async_trait]
impl MetadataService for DownReplica {
    fn replica_id(&self) -> &NodeId {
        &self.0
    }

    async fn propose(&self, _: &ObjectId, _: &ProposalNumber, _: &MetadataEntry) -> Result<ProposeOutcome> {
        Err(Error::NodeUnavailable(self.0.to_string()))
    }

    async fn commit(&self, _: &ObjectId, _: &ProposalNumber) -> Result<CommitOutcome> {
        Err(Error::NodeUnavailable(self.0.to_string()))
    }

    async fn read(&self, _: &ObjectId) -> Result<Option<VersionedEntry>> {
        Err(Error::NodeUnavailable(self.0.to_string()))
    }

    async fn list(&self, _: &ListFilter) -> Result<Vec<VersionedEntry>> {
        Err(Error::NodeUnavailable(self.0.to_string()))
    }
}

fn entry(object_id: &ObjectId, body: &[u8]) -> MetadataEntry {
    let scheme = ErasureScheme::new(2, 1);
    MetadataEntry {
        object_id: object_id.clone(),
        size: body.len() as u64,
        checksum: content_checksum(body),
        created_at: Utc::now(),
        scheme,
        shard_size: body.len().div_ceil(2),
        pad_len: body.len() % 2,
        placement: (0..3)
            .map(|i| PlacementEntry {
                shard_index: i,
                node_id: NodeId::new(format!("node-{}", i)),
            })
            .collect(),
        shard_checksums: (0..3).map(|i| format!("shard-{}", i)).collect(),
        state: ObjectState::Committed,
        storage_class: StorageClass::Standard,
        content_type: Some("text/plain".into()),
        user_metadata: Default::default(),
    }
}

fn in_memory(count: usize) -> Vec<Arc<dyn MetadataService>> {
    (0..count)
        .map(|i| {
            Arc::new(MetadataReplica::in_memory(NodeId::new(format!("replica-{}", i))))
                as Arc<dyn MetadataService>
        })
        .collect()
}

fn store(proposer: &str, replicas: Vec<Arc<dyn MetadataService>>) -> MetadataStore {
    MetadataStore::new(NodeId::from(proposer), replicas, MetadataConfig::default())
}

fn object(key: &str) -> ObjectId {
    ObjectId::new("bucket", key, VersionId::generate())
}

// =============================================================================
// Majority semantics
// =============================================================================

#[tokio::test]
async fn test_publish_then_read() {
    let store = store("coordinator", in_memory(3));
    assert_eq!(store.quorum(), 2);

    let id = object("a");
    let proposal = store.publish(&entry(&id, b"hello")).await.unwrap();

    let read = store.read(&id).await.unwrap().expect("entry committed");
    assert_eq!(read.proposal, proposal);
    assert_eq!(read.entry.checksum, content_checksum(b"hello"));
    assert_eq!(read.entry.state, ObjectState::Committed);
}

#[tokio::test]
async fn test_minority_down_still_commits() {
    let mut replicas = in_memory(2);
    replicas.push(Arc::new(DownReplica(NodeId::from("down"))));
    let store = store("coordinator", replicas);

    let id = object("a");
    store.publish(&entry(&id, b"data")).await.unwrap();
    assert!(store.read(&id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_majority_down_fails() {
    let mut replicas = in_memory(1);
    replicas.push(Arc::new(DownReplica(NodeId::from("down-1"))));
    replicas.push(Arc::new(DownReplica(NodeId::from("down-2"))));
    let store = store("coordinator", replicas);

    let result = store.publish(&entry(&object("a"), b"data")).await;
    assert_matches!(
        result,
        Err(Error::QuorumNotReached {
            acks: 1,
            required: 2,
            dominant: ErrorKind::Unavailable,
            ..
        })
    );
}

#[tokio::test]
async fn test_unknown_object_reads_none() {
    let store = store("coordinator", in_memory(3));
    assert!(store.read(&object("missing")).await.unwrap().is_none());
    assert!(store.latest("bucket", "missing").await.unwrap().is_none());
}

// =============================================================================
// Conflict rules
// =============================================================================

#[tokio::test]
async fn test_same_identity_different_content_conflicts() {
    let store = store("coordinator", in_memory(3));
    let id = object("a");
    store.publish(&entry(&id, b"first")).await.unwrap();

    let result = store.publish(&entry(&id, b"second writer")).await;
    assert_matches!(result, Err(Error::Conflict(_)));

    let read = store.read(&id).await.unwrap().unwrap();
    assert_eq!(read.entry.checksum, content_checksum(b"first"));
}

#[tokio::test]
async fn test_deletion_is_terminal() {
    let store = store("coordinator", in_memory(3));
    let id = object("a");
    let live = entry(&id, b"data");
    store.publish(&live).await.unwrap();
    store.publish(&live.with_state(ObjectState::Deleted)).await.unwrap();

    assert_matches!(store.publish(&live).await, Err(Error::Conflict(_)));
    assert_eq!(
        store.read(&id).await.unwrap().unwrap().entry.state,
        ObjectState::Deleted
    );
    assert!(store.latest("bucket", "a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_placement_update_keeps_content() {
    let store = store("coordinator", in_memory(3));
    let id = object("a");
    let original = entry(&id, b"data");
    let first = store.publish(&original).await.unwrap();

    let mut moved = original.clone();
    moved.placement[1].node_id = NodeId::from("node-9");
    let second = store.publish(&moved).await.unwrap();
    assert!(second > first);

    let read = store.read(&id).await.unwrap().unwrap();
    assert_eq!(read.entry.node_for(1), Some(&NodeId::from("node-9")));
}

#[tokio::test]
async fn test_competing_proposers_agree() {
    let replicas = in_memory(3);
    let a = store("proposer-a", replicas.clone());
    let b = store("proposer-b", replicas);

    let id = object("contended");
    let shared = entry(&id, b"same bytes");
    let (ra, rb) = tokio::join!(a.publish(&shared), b.publish(&shared));

    assert!(ra.is_ok() || rb.is_ok());
    for result in [&ra, &rb] {
        if let Err(e) = result {
            assert_matches!(e, Error::QuorumNotReached { .. });
        }
    }
    let read = a.read(&id).await.unwrap().unwrap();
    assert!(read.entry.same_content(&shared));
}

#[tokio::test]
async fn test_latest_skips_deleted_versions() {
    let store = store("coordinator", in_memory(3));
    let older = ObjectId::new("bucket", "doc", VersionId::generate());
    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    let newer = ObjectId::new("bucket", "doc", VersionId::generate());

    store.publish(&entry(&older, b"v1")).await.unwrap();
    let newest = entry(&newer, b"v2");
    store.publish(&newest).await.unwrap();
    assert_eq!(
        store.latest("bucket", "doc").await.unwrap().unwrap().entry.object_id,
        newer
    );

    store.publish(&newest.with_state(ObjectState::Deleted)).await.unwrap();
    assert_eq!(
        store.latest("bucket", "doc").await.unwrap().unwrap().entry.object_id,
        older
    );
    assert_eq!(store.list(&ListFilter::key("bucket", "doc")).await.unwrap().len(), 2);
}

// =============================================================================
// Durability
// =============================================================================

fn open_replicas(dirs: &[TempDir]) -> Vec<Arc<dyn MetadataService>> {
    dirs.iter()
        .enumerate()
        .map(|(i, dir)| {
            let replica = MetadataReplica::open(NodeId::new(format!("replica-{}", i)), dir.path(), false)
                .expect("open replica");
            Arc::new(replica) as Arc<dyn MetadataService>
        })
        .collect()
}

#[tokio::test]
async fn test_committed_entries_survive_restart() {
    let dirs: Vec<TempDir> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
    let id = object("durable");
    let original = entry(&id, b"persisted");

    {
        let store = store("zz-coordinator", open_replicas(&dirs));
        store.publish(&original).await.unwrap();
    }

    // a restarted cluster with a proposer id that sorts lower must outbid
    // the persisted promises by round
    let store = store("aa-coordinator", open_replicas(&dirs));
    let read = store.read(&id).await.unwrap().expect("survives restart");
    assert!(read.entry.same_content(&original));

    store.publish(&original.with_state(ObjectState::Deleted)).await.unwrap();
    assert_eq!(
        store.read(&id).await.unwrap().unwrap().entry.state,
        ObjectState::Deleted
    );
}
