//! Domain Value Objects
//!
//! Identities, erasure parameters, metadata entries and cluster snapshots
//! shared by every component of the engine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// Checksums
// =============================================================================

/// BLAKE3 checksum of `data`, hex encoded.
pub fn content_checksum(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

// =============================================================================
// Identities
// =============================================================================

/// Stable identifier of a storage node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Version identifier allocated for every write.
///
/// UUIDv7 values sort by creation time, so the greatest committed version
/// of a key is its latest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub Uuid);

impl VersionId {
    /// Allocate a fresh, time-ordered version id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::NotFound(format!("invalid version id '{}': {}", s, e)))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one object version: `(bucket, key, version-id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    pub bucket: String,
    pub key: String,
    pub version: VersionId,
}

impl ObjectId {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, version: VersionId) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version,
        }
    }

    /// Canonical string used for hashing and placement.
    pub fn canonical(&self) -> String {
        format!("{}/{}/{}", self.bucket, self.key, self.version)
    }

    /// Hex BLAKE3 digest of the canonical identity, used for on-disk naming.
    pub fn digest(&self) -> String {
        content_checksum(self.canonical().as_bytes())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.bucket, self.key, self.version)
    }
}

// =============================================================================
// Erasure Parameters
// =============================================================================

/// Reed-Solomon parameters of an object: k data shards, m parity shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErasureScheme {
    pub data_shards: usize,
    pub parity_shards: usize,
}

impl ErasureScheme {
    pub fn new(data_shards: usize, parity_shards: usize) -> Self {
        Self {
            data_shards,
            parity_shards,
        }
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Shard acks required before a write may commit: `k + ceil(m / 2)`.
    pub fn write_quorum(&self) -> usize {
        self.data_shards + self.parity_shards.div_ceil(2)
    }

    pub fn kind_of(&self, shard_index: usize) -> ShardKind {
        if shard_index < self.data_shards {
            ShardKind::Data
        } else {
            ShardKind::Parity
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_shards == 0 {
            return Err(Error::InvalidEcConfig(
                "data_shards must be greater than 0".to_string(),
            ));
        }
        if self.parity_shards == 0 {
            return Err(Error::InvalidEcConfig(
                "parity_shards must be greater than 0".to_string(),
            ));
        }
        if self.total_shards() > 256 {
            return Err(Error::InvalidEcConfig(format!(
                "at most 256 shards supported, got {}",
                self.total_shards()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ErasureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.data_shards, self.parity_shards)
    }
}

/// Whether a shard carries original bytes or parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardKind {
    Data,
    Parity,
}

impl ShardKind {
    pub fn as_u8(self) -> u8 {
        match self {
            ShardKind::Data => 0,
            ShardKind::Parity => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ShardKind::Data),
            1 => Some(ShardKind::Parity),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShardKind::Data => "data",
            ShardKind::Parity => "parity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "data" => Some(ShardKind::Data),
            "parity" => Some(ShardKind::Parity),
            _ => None,
        }
    }
}

/// Redundancy class requested for an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageClass {
    #[default]
    Standard,
    ReducedRedundancy,
}

impl StorageClass {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STANDARD" => Some(StorageClass::Standard),
            "REDUCED_REDUNDANCY" => Some(StorageClass::ReducedRedundancy),
            _ => None,
        }
    }
}

// =============================================================================
// Metadata Entry
// =============================================================================

/// Lifecycle state of an object version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectState {
    Pending,
    Committed,
    Deleted,
    Corrupt,
}

/// One `(shard-index, node-id)` pair of a placement list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlacementEntry {
    pub shard_index: usize,
    pub node_id: NodeId,
}

/// The quorum-replicated record binding an object to its layout and state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub object_id: ObjectId,
    pub size: u64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub scheme: ErasureScheme,
    pub shard_size: usize,
    pub pad_len: usize,
    pub placement: Vec<PlacementEntry>,
    pub shard_checksums: Vec<String>,
    pub state: ObjectState,
    #[serde(default)]
    pub storage_class: StorageClass,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub user_metadata: BTreeMap<String, String>,
}

impl MetadataEntry {
    /// Node currently holding `shard_index`.
    pub fn node_for(&self, shard_index: usize) -> Option<&NodeId> {
        self.placement
            .iter()
            .find(|p| p.shard_index == shard_index)
            .map(|p| &p.node_id)
    }

    /// Expected checksum of `shard_index`.
    pub fn shard_checksum(&self, shard_index: usize) -> Option<&str> {
        self.shard_checksums.get(shard_index).map(String::as_str)
    }

    /// Check the committed-layout invariants: exactly k+m entries, one per
    /// shard index, on pairwise distinct nodes.
    pub fn validate_placement(&self) -> Result<()> {
        let total = self.scheme.total_shards();
        if self.placement.len() != total {
            return Err(Error::Internal(format!(
                "placement for {} has {} entries, expected {}",
                self.object_id,
                self.placement.len(),
                total
            )));
        }
        if self.shard_checksums.len() != total {
            return Err(Error::Internal(format!(
                "{} carries {} shard checksums, expected {}",
                self.object_id,
                self.shard_checksums.len(),
                total
            )));
        }
        let mut seen_nodes = std::collections::HashSet::new();
        let mut seen_indices = vec![false; total];
        for entry in &self.placement {
            if entry.shard_index >= total || seen_indices[entry.shard_index] {
                return Err(Error::Internal(format!(
                    "placement for {} has bad shard index {}",
                    self.object_id, entry.shard_index
                )));
            }
            seen_indices[entry.shard_index] = true;
            if !seen_nodes.insert(&entry.node_id) {
                return Err(Error::Internal(format!(
                    "placement for {} puts two shards on node {}",
                    self.object_id, entry.node_id
                )));
            }
        }
        Ok(())
    }

    /// Same object with the given state.
    pub fn with_state(&self, state: ObjectState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// Whether `other` describes the same immutable content.
    pub fn same_content(&self, other: &MetadataEntry) -> bool {
        self.size == other.size
            && self.checksum == other.checksum
            && self.shard_checksums == other.shard_checksums
    }
}

// =============================================================================
// Proposals
// =============================================================================

/// Proposal number of the metadata consensus protocol.
///
/// Ordered by round first, then by proposer id, so two proposers never
/// produce equal numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProposalNumber {
    pub round: u64,
    pub proposer: NodeId,
}

impl ProposalNumber {
    pub fn new(round: u64, proposer: NodeId) -> Self {
        Self { round, proposer }
    }
}

impl fmt::Display for ProposalNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.round, self.proposer)
    }
}

/// A metadata entry together with the proposal that committed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedEntry {
    pub proposal: ProposalNumber,
    pub entry: MetadataEntry,
}

// =============================================================================
// Nodes and Cluster View
// =============================================================================

/// Health state of a node.
///
/// Transitions: `Alive -> Suspect` on missed heartbeats, `Suspect -> Alive`
/// on a fresh heartbeat, `Suspect -> Dead` after the dead timeout, and
/// `Alive -> Dead` only through an explicit failed probe. `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    Alive,
    Suspect,
    Dead,
}

impl NodeHealth {
    pub fn can_transition_to(self, next: NodeHealth) -> bool {
        use NodeHealth::*;
        matches!(
            (self, next),
            (Alive, Suspect) | (Suspect, Alive) | (Suspect, Dead) | (Alive, Dead)
        )
    }

    pub fn is_alive(self) -> bool {
        self == NodeHealth::Alive
    }
}

impl fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeHealth::Alive => "alive",
            NodeHealth::Suspect => "suspect",
            NodeHealth::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Capacity snapshot reported with each heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capacity {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl Capacity {
    pub fn available_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }
}

/// A registered node as seen by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    pub capacity: Capacity,
    pub health: NodeHealth,
    pub last_heartbeat: DateTime<Utc>,
}

/// Immutable, versioned snapshot of cluster membership.
///
/// Placement and healing decisions are evaluated against one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterView {
    pub epoch: u64,
    pub nodes: Vec<NodeInfo>,
}

impl ClusterView {
    pub fn new(epoch: u64, mut nodes: Vec<NodeInfo>) -> Self {
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Self { epoch, nodes }
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn is_alive(&self, id: &NodeId) -> bool {
        self.get(id).map(|n| n.health.is_alive()).unwrap_or(false)
    }

    /// Health of `id`, or `None` when it is not registered.
    pub fn health(&self, id: &NodeId) -> Option<NodeHealth> {
        self.get(id).map(|n| n.health)
    }

    pub fn alive(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter().filter(|n| n.health.is_alive())
    }

    pub fn alive_count(&self) -> usize {
        self.alive().count()
    }
}
