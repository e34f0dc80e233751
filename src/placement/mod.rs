//! Placement Engine
//!
//! Maps the shards of an object to distinct nodes using rendezvous
//! (highest random weight) hashing over node ids. Each node gets a weight
//! `blake3(object || node)` per object; the k+m heaviest alive nodes hold
//! shards 0..k+m in weight order.
//!
//! A membership change only moves the shards whose node set changed, so
//! roughly `(k+m) / N` of objects are affected by adding or removing one
//! node out of N.
//!
//! Placement is fixed at write time. Existing objects keep their recorded
//! placement; only the Healing Manager relocates shards.

use std::collections::HashSet;

use tracing::debug;

use crate::domain::{ClusterView, ErasureScheme, NodeId, NodeInfo, ObjectId, PlacementEntry};
use crate::error::{Error, Result};

/// Rendezvous weight of `node` for `object`.
pub fn hrw_weight(object: &str, node: &NodeId) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(object.as_bytes());
    hasher.update(node.as_str().as_bytes());
    let hash = hasher.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(first)
}

/// Stateless placement over a cluster snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlacementEngine;

impl PlacementEngine {
    pub fn new() -> Self {
        Self
    }

    /// Alive nodes of `view` ordered by descending weight for `object_id`.
    pub fn rank_candidates<'a>(&self, object_id: &ObjectId, view: &'a ClusterView) -> Vec<&'a NodeInfo> {
        let key = object_id.canonical();
        let mut ranked: Vec<(&NodeInfo, u64)> = view
            .alive()
            .map(|node| (node, hrw_weight(&key, &node.id)))
            .collect();
        // ties are astronomically unlikely but must still be deterministic
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
        ranked.into_iter().map(|(node, _)| node).collect()
    }

    /// Choose one distinct alive node per shard.
    ///
    /// Fails with `InsufficientNodes` when fewer than k+m nodes are alive;
    /// no partial placement is ever returned.
    pub fn choose_placement(
        &self,
        object_id: &ObjectId,
        scheme: ErasureScheme,
        view: &ClusterView,
    ) -> Result<Vec<PlacementEntry>> {
        let required = scheme.total_shards();
        let ranked = self.rank_candidates(object_id, view);
        if ranked.len() < required {
            return Err(Error::InsufficientNodes {
                required,
                available: ranked.len(),
            });
        }

        let placement: Vec<PlacementEntry> = ranked
            .into_iter()
            .take(required)
            .enumerate()
            .map(|(shard_index, node)| PlacementEntry {
                shard_index,
                node_id: node.id.clone(),
            })
            .collect();
        debug!(object = %object_id, epoch = view.epoch, scheme = %scheme, "Placement chosen");
        Ok(placement)
    }

    /// Pick up to `count` alive nodes for relocated shards, best-ranked
    /// first, skipping every node in `exclude`.
    pub fn choose_replacements(
        &self,
        object_id: &ObjectId,
        view: &ClusterView,
        exclude: &HashSet<NodeId>,
        count: usize,
    ) -> Vec<NodeId> {
        self.rank_candidates(object_id, view)
            .into_iter()
            .filter(|node| !exclude.contains(&node.id))
            .take(count)
            .map(|node| node.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Capacity, NodeHealth, VersionId};
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn node(id: &str, health: NodeHealth) -> NodeInfo {
        NodeInfo {
            id: NodeId::from(id),
            address: format!("{}:9000", id),
            capacity: Capacity::default(),
            health,
            last_heartbeat: Utc::now(),
        }
    }

    fn view(n: usize) -> ClusterView {
        ClusterView::new(
            1,
            (0..n)
                .map(|i| node(&format!("node-{:02}", i), NodeHealth::Alive))
                .collect(),
        )
    }

    fn object(key: &str) -> ObjectId {
        ObjectId::new("bucket", key, VersionId::generate())
    }

    #[test]
    fn test_placement_is_deterministic_and_distinct() {
        let engine = PlacementEngine::new();
        let view = view(10);
        let id = object("a");
        let scheme = ErasureScheme::new(4, 2);

        let first = engine.choose_placement(&id, scheme, &view).unwrap();
        let second = engine.choose_placement(&id, scheme, &view).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 6);

        let nodes: HashSet<_> = first.iter().map(|p| &p.node_id).collect();
        assert_eq!(nodes.len(), 6);
        for (i, entry) in first.iter().enumerate() {
            assert_eq!(entry.shard_index, i);
        }
    }

    #[test]
    fn test_insufficient_nodes() {
        let engine = PlacementEngine::new();
        let mut view = view(6);
        view.nodes[0].health = NodeHealth::Dead;

        assert_matches!(
            engine.choose_placement(&object("a"), ErasureScheme::new(4, 2), &view),
            Err(Error::InsufficientNodes {
                required: 6,
                available: 5
            })
        );
    }

    #[test]
    fn test_suspect_and_dead_nodes_are_skipped() {
        let engine = PlacementEngine::new();
        let mut view = view(8);
        view.nodes[1].health = NodeHealth::Suspect;
        view.nodes[2].health = NodeHealth::Dead;

        let placement = engine
            .choose_placement(&object("a"), ErasureScheme::new(4, 2), &view)
            .unwrap();
        assert!(placement
            .iter()
            .all(|p| p.node_id != view.nodes[1].id && p.node_id != view.nodes[2].id));
    }

    #[test]
    fn test_adding_a_node_relocates_a_bounded_fraction() {
        let engine = PlacementEngine::new();
        let scheme = ErasureScheme::new(4, 2);
        let before = view(12);
        let mut after = view(12);
        after.nodes.push(node("node-new", NodeHealth::Alive));

        let objects: Vec<ObjectId> = (0..500).map(|i| object(&format!("k{}", i))).collect();
        let mut moved_shards = 0usize;
        for id in &objects {
            let a = engine.choose_placement(id, scheme, &before).unwrap();
            let b = engine.choose_placement(id, scheme, &after).unwrap();
            let a_nodes: HashSet<_> = a.iter().map(|p| p.node_id.clone()).collect();
            let b_nodes: HashSet<_> = b.iter().map(|p| p.node_id.clone()).collect();
            moved_shards += a_nodes.difference(&b_nodes).count();
        }

        // a new node should take about (k+m)/(N+1) of all shard slots
        let total = objects.len() * scheme.total_shards();
        let fraction = moved_shards as f64 / total as f64;
        assert!(fraction < 0.2, "moved fraction {} too high", fraction);
        assert!(moved_shards > 0);
    }

    #[test]
    fn test_choose_replacements_excludes_holders() {
        let engine = PlacementEngine::new();
        let view = view(8);
        let id = object("a");
        let placement = engine
            .choose_placement(&id, ErasureScheme::new(4, 2), &view)
            .unwrap();
        let holders: HashSet<NodeId> = placement.iter().map(|p| p.node_id.clone()).collect();

        let replacements = engine.choose_replacements(&id, &view, &holders, 3);
        assert_eq!(replacements.len(), 2);
        assert!(replacements.iter().all(|n| !holders.contains(n)));
    }
}
