//! HTTP Transport Tests
//!
//! The reqwest clients against a real hyper `NodeServer` on a loopback
//! port: shard and metadata RPCs, heartbeats, and how node errors come
//! back over the wire.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use chrono::Utc;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use shardstor::adapters::http::build_client;
use shardstor::adapters::{HttpMetadataClient, HttpRegistryClient, HttpShardClient};
use shardstor::config::{MetadataConfig, RegistryConfig, ShardStoreConfig};
use shardstor::domain::{
    content_checksum, Capacity, CommitOutcome, ErasureScheme, ListFilter, MetadataEntry,
    MetadataService, NodeHealth, NodeId, ObjectId, ObjectState, PlacementEntry, ProposalNumber,
    ProposeOutcome, PutOutcome, PutShardRequest, ShardKind, ShardService, StorageClass, VersionId,
};
use shardstor::metadata::{MetadataReplica, MetadataStore};
use shardstor::registry::{HeartbeatSink, NodeRegistry, Ping};
use shardstor::rpc::NodeServer;
use shardstor::shard::ShardStore;
use shardstor::Error;

// =============================================================================
// Helpers
// =============================================================================

struct RunningNode {
    _dir: TempDir,
    id: NodeId,
    address: String,
    shards: Arc<ShardStore>,
    shutdown: CancellationToken,
}

impl Drop for RunningNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn spawn_node(name: &str, registry: Option<Arc<NodeRegistry>>) -> RunningNode {
    let dir = tempfile::tempdir().expect("tempdir");
    let id = NodeId::from(name);
    let shards = Arc::new(
        ShardStore::open(id.clone(), dir.path(), &ShardStoreConfig::default()).expect("shard store"),
    );
    let replica = Arc::new(MetadataReplica::in_memory(id.clone()));

    let mut server = NodeServer::new(id.clone(), Arc::clone(&shards), replica);
    if let Some(registry) = registry {
        server = server.with_registry(registry);
    }
    let listener = NodeServer::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local addr").to_string();
    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::new(server).serve(listener, shutdown.clone()));

    RunningNode {
        _dir: dir,
        id,
        address,
        shards,
        shutdown,
    }
}

fn client() -> reqwest::Client {
    build_client(Duration::from_secs(2)).expect("client")
}

fn shard_request(object_id: &ObjectId, index: usize, payload: &'static [u8]) -> PutShardRequest {
    PutShardRequest {
        object_id: object_id.clone(),
        shard_index: index,
        kind: ShardKind::Data,
        checksum: content_checksum(payload),
        payload: Bytes::from_static(payload),
    }
}

fn entry(object_id: &ObjectId, body: &[u8]) -> MetadataEntry {
    MetadataEntry {
        object_id: object_id.clone(),
        size: body.len() as u64,
        checksum: content_checksum(body),
        created_at: Utc::now(),
        scheme: ErasureScheme::new(2, 1),
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
        content_type: None,
        user_metadata: Default::default(),
    }
}

fn object(key: &str) -> ObjectId {
    ObjectId::new("bucket", key, VersionId::generate())
}

// =============================================================================
// Shard RPC
// =============================================================================

#[tokio::test]
async fn test_shard_rpc_round_trip() {
    let node = spawn_node("node-a", None).await;
    let shards = HttpShardClient::new(node.id.clone(), &node.address, client());
    let id = object("a");

    let stored = assert_ok!(shards.put_shard(shard_request(&id, 0, b"shard zero")).await);
    assert_eq!(stored, PutOutcome::Stored);
    let again = assert_ok!(shards.put_shard(shard_request(&id, 0, b"shard zero")).await);
    assert_eq!(again, PutOutcome::AlreadyPresent);

    let payload = assert_ok!(shards.get_shard(&id, 0).await);
    assert_eq!(&payload[..], b"shard zero");

    let probe = assert_ok!(shards.probe_shard(&id, 0, true).await);
    assert!(probe.exists && probe.healthy);
    assert_eq!(probe.checksum, Some(content_checksum(b"shard zero")));

    assert!(assert_ok!(shards.delete_shard(&id, 0).await));
    assert!(!assert_ok!(shards.delete_shard(&id, 0).await));
    assert!(!assert_ok!(shards.probe_shard(&id, 0, false).await).exists);
}

#[tokio::test]
async fn test_shard_errors_keep_their_kind_over_the_wire() {
    let node = spawn_node("node-a", None).await;
    let shards = HttpShardClient::new(node.id.clone(), &node.address, client());
    let id = object("a");

    // missing
    assert_matches!(shards.get_shard(&id, 1).await, Err(Error::NotFound(_)));

    // different checksum for a committed index
    assert_ok!(shards.put_shard(shard_request(&id, 1, b"first")).await);
    assert_matches!(
        shards.put_shard(shard_request(&id, 1, b"second")).await,
        Err(Error::Conflict(_))
    );

    // payload that does not match the supplied checksum
    let mut mismatched = shard_request(&id, 2, b"payload");
    mismatched.checksum = content_checksum(b"something else");
    assert_matches!(shards.put_shard(mismatched).await, Err(Error::Corrupt(_)));

    // bitrot on disk
    let path = node.shards.shard_path(&id, 1);
    let mut bytes = std::fs::read(&path).expect("read shard file");
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&path, bytes).expect("write shard file");
    assert_matches!(shards.get_shard(&id, 1).await, Err(Error::Corrupt(_)));
}

#[tokio::test]
async fn test_closed_port_is_unavailable() {
    let address = {
        let listener = NodeServer::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("local addr").to_string()
    };
    let shards = HttpShardClient::new(NodeId::from("gone"), &address, client());
    assert_matches!(
        shards.get_shard(&object("a"), 0).await,
        Err(Error::NodeUnavailable(_))
    );
}

// =============================================================================
// Metadata RPC
// =============================================================================

#[tokio::test]
async fn test_metadata_rpc_round_trip() {
    let node = spawn_node("node-a", None).await;
    let replica = HttpMetadataClient::new(node.id.clone(), &node.address, client());
    let id = object("a");
    let live = entry(&id, b"hello");
    let proposal = ProposalNumber::new(1, NodeId::from("coordinator"));

    assert_eq!(assert_ok!(replica.read(&id).await), None);
    assert_eq!(
        assert_ok!(replica.propose(&id, &proposal, &live).await),
        ProposeOutcome::Accepted
    );
    assert_eq!(
        assert_ok!(replica.commit(&id, &proposal).await),
        CommitOutcome::Committed
    );

    let read = assert_ok!(replica.read(&id).await).expect("committed entry");
    assert_eq!(read.proposal, proposal);
    assert_eq!(read.entry, live);
    assert_eq!(assert_ok!(replica.list(&ListFilter::key("bucket", "a")).await).len(), 1);

    // an older round is outbid, changed content conflicts
    let stale = ProposalNumber::new(0, NodeId::from("coordinator"));
    assert_matches!(
        replica.propose(&id, &stale, &live).await,
        Ok(ProposeOutcome::Rejected { .. })
    );
    let newer = ProposalNumber::new(2, NodeId::from("coordinator"));
    assert_matches!(
        replica.propose(&id, &newer, &entry(&id, b"other bytes")).await,
        Err(Error::Conflict(_))
    );
    assert_eq!(
        assert_ok!(replica.commit(&id, &newer).await),
        CommitOutcome::NotAccepted
    );
}

#[tokio::test]
async fn test_quorum_over_http_replicas() {
    let mut nodes = vec![
        spawn_node("node-0", None).await,
        spawn_node("node-1", None).await,
        spawn_node("node-2", None).await,
    ];
    let replicas: Vec<Arc<dyn MetadataService>> = nodes
        .iter()
        .map(|n| {
            Arc::new(HttpMetadataClient::new(n.id.clone(), &n.address, client()))
                as Arc<dyn MetadataService>
        })
        .collect();
    let store = MetadataStore::new(NodeId::from("coordinator"), replicas, MetadataConfig::default());

    let id = object("quorum");
    let live = entry(&id, b"replicated");
    let proposal = assert_ok!(store.publish(&live).await);

    // one node stopped still leaves a majority
    drop(nodes.remove(0));
    let read = assert_ok!(store.read(&id).await).expect("committed entry");
    assert_eq!(read.proposal, proposal);
    assert!(read.entry.same_content(&live));
}

// =============================================================================
// Registry
// =============================================================================

#[tokio::test]
async fn test_heartbeats_over_http() {
    let registry = NodeRegistry::new(RegistryConfig::default());
    let host = spawn_node("registry-host", Some(Arc::clone(&registry))).await;
    let sink = HttpRegistryClient::new(&host.address, client());

    let ping = Ping {
        node_id: NodeId::from("node-7"),
        address: "127.0.0.1:9107".into(),
        capacity: Capacity {
            total_bytes: 1 << 30,
            used_bytes: 0,
        },
    };
    assert_ok!(sink.register(&ping).await);
    assert_ok!(sink.ping(&ping).await);

    let info = registry.get(&ping.node_id).expect("registered");
    assert_eq!(info.health, NodeHealth::Alive);
    assert_eq!(info.address, ping.address);

    // a host without a registry answers NotFound
    let plain = spawn_node("plain", None).await;
    let err = assert_err!(HttpRegistryClient::new(&plain.address, client()).ping(&ping).await);
    assert_matches!(err, Error::NotFound(_));
}
