//! Node Registry
//!
//! Tracks cluster membership, node health and capacity. Health moves only
//! on heartbeats, on the absence of heartbeats, or on explicit failed-probe
//! reports:
//!
//! ```text
//!            missed N heartbeats          silent past dead_after
//!   Alive ───────────────────────▶ Suspect ─────────────────────▶ Dead
//!     ▲                               │                            (terminal)
//!     └──────── heartbeat ────────────┘
//! ```
//!
//! Every change bumps the membership epoch and is broadcast to subscribers.
//! Callers read membership through [`NodeRegistry::snapshot`], an immutable
//! [`ClusterView`].

mod heartbeat;

pub use heartbeat::{HeartbeatSender, HeartbeatSink};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::RegistryConfig;
use crate::domain::{Capacity, ClusterView, DomainEvent, EventPublisher, NodeHealth, NodeId, NodeInfo};
use crate::error::{Error, Result};

// =============================================================================
// Messages
// =============================================================================

/// Heartbeat sent by every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub node_id: NodeId,
    pub address: String,
    pub capacity: Capacity,
}

/// What changed in the membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Registered,
    HealthChanged { from: NodeHealth, to: NodeHealth },
}

/// Broadcast to subscribers on every membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEvent {
    pub epoch: u64,
    pub node_id: NodeId,
    pub change: MembershipChange,
}

impl MembershipEvent {
    fn to_domain_event(&self, address: &str) -> DomainEvent {
        match self.change {
            MembershipChange::Registered => DomainEvent::node_registered(&self.node_id, address),
            MembershipChange::HealthChanged { from, to } => {
                DomainEvent::node_health_changed(&self.node_id, from, to)
            }
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Cluster membership and health tracker.
pub struct NodeRegistry {
    config: RegistryConfig,
    nodes: RwLock<BTreeMap<NodeId, NodeInfo>>,
    epoch: AtomicU64,
    events: broadcast::Sender<MembershipEvent>,
}

impl NodeRegistry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Arc::new(Self {
            config,
            nodes: RwLock::new(BTreeMap::new()),
            epoch: AtomicU64::new(0),
            events,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Current membership epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Receive membership changes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    fn emit(&self, node_id: &NodeId, change: MembershipChange) -> MembershipEvent {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let event = MembershipEvent {
            epoch,
            node_id: node_id.clone(),
            change,
        };
        // no subscribers is fine
        let _ = self.events.send(event.clone());
        event
    }

    fn transition(&self, node: &mut NodeInfo, to: NodeHealth) -> Option<MembershipEvent> {
        let from = node.health;
        if from == to {
            return None;
        }
        if !from.can_transition_to(to) {
            debug!(node = %node.id, %from, %to, "Ignoring invalid health transition");
            return None;
        }
        node.health = to;
        info!(node = %node.id, %from, %to, "Node health changed");
        Some(self.emit(&node.id, MembershipChange::HealthChanged { from, to }))
    }

    /// Add a node, or refresh a live node's address and capacity.
    ///
    /// A dead node id is never revived; the node must come back under a
    /// fresh identity.
    #[instrument(skip(self, ping), fields(node = %ping.node_id))]
    pub fn register(&self, ping: &Ping) -> Result<()> {
        self.register_at(ping, Utc::now())
    }

    pub fn register_at(&self, ping: &Ping, now: DateTime<Utc>) -> Result<()> {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(&ping.node_id) {
            Some(node) if node.health == NodeHealth::Dead => {
                Err(Error::NodeDead(ping.node_id.to_string()))
            }
            Some(node) => {
                node.address = ping.address.clone();
                node.capacity = ping.capacity;
                node.last_heartbeat = now;
                self.transition(node, NodeHealth::Alive);
                Ok(())
            }
            None => {
                nodes.insert(
                    ping.node_id.clone(),
                    NodeInfo {
                        id: ping.node_id.clone(),
                        address: ping.address.clone(),
                        capacity: ping.capacity,
                        health: NodeHealth::Alive,
                        last_heartbeat: now,
                    },
                );
                info!(node = %ping.node_id, address = %ping.address, "Node registered");
                self.emit(&ping.node_id, MembershipChange::Registered);
                Ok(())
            }
        }
    }

    /// Record a heartbeat. Unknown nodes get `NotFound` and should register.
    pub fn heartbeat(&self, ping: &Ping) -> Result<NodeHealth> {
        self.heartbeat_at(ping, Utc::now())
    }

    pub fn heartbeat_at(&self, ping: &Ping, now: DateTime<Utc>) -> Result<NodeHealth> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(&ping.node_id)
            .ok_or_else(|| Error::NotFound(format!("node {}", ping.node_id)))?;
        if node.health == NodeHealth::Dead {
            return Err(Error::NodeDead(ping.node_id.to_string()));
        }
        node.last_heartbeat = now;
        node.capacity = ping.capacity;
        self.transition(node, NodeHealth::Alive);
        Ok(node.health)
    }

    /// Report a failed probe: the node is suspect until it heartbeats again.
    pub fn mark_suspect(&self, node_id: &NodeId) -> Result<()> {
        self.force(node_id, NodeHealth::Suspect)
    }

    /// Declare a node dead. Terminal.
    pub fn mark_dead(&self, node_id: &NodeId) -> Result<()> {
        self.force(node_id, NodeHealth::Dead)
    }

    fn force(&self, node_id: &NodeId, to: NodeHealth) -> Result<()> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::NotFound(format!("node {}", node_id)))?;
        self.transition(node, to);
        Ok(())
    }

    /// Apply heartbeat timeouts as of `now`.
    pub fn evaluate_at(&self, now: DateTime<Utc>) -> Vec<MembershipEvent> {
        let suspect_after = self.config.suspect_after();
        let dead_after = self.config.dead_after;
        let mut changes = Vec::new();

        let mut nodes = self.nodes.write();
        for node in nodes.values_mut() {
            let silence = (now - node.last_heartbeat).to_std().unwrap_or_default();
            if node.health == NodeHealth::Alive && silence >= suspect_after {
                changes.extend(self.transition(node, NodeHealth::Suspect));
            }
            if node.health == NodeHealth::Suspect && silence >= dead_after {
                warn!(node = %node.id, silent_for = ?silence, "Declaring node dead");
                changes.extend(self.transition(node, NodeHealth::Dead));
            }
        }
        changes
    }

    pub fn evaluate(&self) -> Vec<MembershipEvent> {
        self.evaluate_at(Utc::now())
    }

    pub fn get(&self, node_id: &NodeId) -> Option<NodeInfo> {
        self.nodes.read().get(node_id).cloned()
    }

    pub fn list_alive(&self) -> Vec<NodeInfo> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.health.is_alive())
            .cloned()
            .collect()
    }

    /// Immutable view of the current membership.
    pub fn snapshot(&self) -> ClusterView {
        let nodes = self.nodes.read();
        ClusterView::new(self.epoch(), nodes.values().cloned().collect())
    }

    /// Evaluate timeouts periodically and publish membership changes as
    /// domain events until `shutdown` fires.
    pub async fn run(self: Arc<Self>, publisher: Arc<dyn EventPublisher>, shutdown: CancellationToken) {
        info!("Starting node registry with {:?}", self.config);

        let mut tick = interval(self.config.evaluation_interval);
        let mut changes = self.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Node registry shutting down");
                    break;
                }
                _ = tick.tick() => {
                    self.evaluate();
                }
                change = changes.recv() => match change {
                    Ok(event) => {
                        let address = self
                            .get(&event.node_id)
                            .map(|n| n.address)
                            .unwrap_or_default();
                        if let Err(e) = publisher.publish(event.to_domain_event(&address)).await {
                            warn!("Failed to publish membership event: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Membership event publisher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}

#[async_trait]
impl HeartbeatSink for NodeRegistry {
    async fn register(&self, ping: &Ping) -> Result<()> {
        NodeRegistry::register(self, ping)
    }

    async fn ping(&self, ping: &Ping) -> Result<()> {
        self.heartbeat(ping).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn ping(id: &str) -> Ping {
        Ping {
            node_id: NodeId::from(id),
            address: format!("{}.local:9000", id),
            capacity: Capacity {
                total_bytes: 1000,
                used_bytes: 10,
            },
        }
    }

    fn registry() -> Arc<NodeRegistry> {
        NodeRegistry::new(RegistryConfig {
            heartbeat_interval: Duration::from_secs(1),
            suspect_after_missed: 3,
            dead_after: Duration::from_secs(10),
            ..Default::default()
        })
    }

    #[test]
    fn test_register_and_list_alive() {
        let registry = registry();
        registry.register(&ping("n1")).unwrap();
        registry.register(&ping("n2")).unwrap();

        let alive = registry.list_alive();
        assert_eq!(alive.len(), 2);
        assert_eq!(registry.epoch(), 2);

        let view = registry.snapshot();
        assert_eq!(view.epoch, 2);
        assert_eq!(view.nodes[0].id, NodeId::from("n1"));
    }

    #[test]
    fn test_missed_heartbeats_make_node_suspect_then_dead() {
        let registry = registry();
        let t0 = Utc::now();
        registry.register_at(&ping("n1"), t0).unwrap();
        registry.register_at(&ping("n2"), t0).unwrap();

        // two missed heartbeats: still alive
        assert!(registry.evaluate_at(t0 + chrono::Duration::seconds(2)).is_empty());

        // n2 keeps heartbeating, n1 goes quiet
        registry
            .heartbeat_at(&ping("n2"), t0 + chrono::Duration::seconds(3))
            .unwrap();
        let changes = registry.evaluate_at(t0 + chrono::Duration::seconds(3));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].node_id, NodeId::from("n1"));
        assert_eq!(
            registry.get(&NodeId::from("n1")).unwrap().health,
            NodeHealth::Suspect
        );

        registry.evaluate_at(t0 + chrono::Duration::seconds(11));
        assert_eq!(
            registry.get(&NodeId::from("n1")).unwrap().health,
            NodeHealth::Dead
        );
        // n2 is suspect after its own silence, not dead
        assert_eq!(
            registry.get(&NodeId::from("n2")).unwrap().health,
            NodeHealth::Suspect
        );
    }

    #[test]
    fn test_heartbeat_revives_suspect() {
        let registry = registry();
        let t0 = Utc::now();
        registry.register_at(&ping("n1"), t0).unwrap();
        registry.evaluate_at(t0 + chrono::Duration::seconds(5));
        assert!(registry.list_alive().is_empty());

        let health = registry
            .heartbeat_at(&ping("n1"), t0 + chrono::Duration::seconds(6))
            .unwrap();
        assert_eq!(health, NodeHealth::Alive);
        assert_eq!(registry.list_alive().len(), 1);
    }

    #[test]
    fn test_dead_is_terminal() {
        let registry = registry();
        registry.register(&ping("n1")).unwrap();
        registry.mark_dead(&NodeId::from("n1")).unwrap();

        assert_matches!(registry.heartbeat(&ping("n1")), Err(Error::NodeDead(_)));
        assert_matches!(registry.register(&ping("n1")), Err(Error::NodeDead(_)));
        registry.mark_suspect(&NodeId::from("n1")).unwrap();
        assert_eq!(
            registry.get(&NodeId::from("n1")).unwrap().health,
            NodeHealth::Dead
        );

        // fresh identity is fine
        registry.register(&ping("n1-b")).unwrap();
        assert_eq!(registry.list_alive().len(), 1);
    }

    #[test]
    fn test_unknown_heartbeat() {
        let registry = registry();
        assert_matches!(registry.heartbeat(&ping("ghost")), Err(Error::NotFound(_)));
        assert_matches!(
            registry.mark_dead(&NodeId::from("ghost")),
            Err(Error::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let registry = registry();
        let mut rx = registry.subscribe();

        registry.register(&ping("n1")).unwrap();
        registry.mark_suspect(&NodeId::from("n1")).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.change, MembershipChange::Registered);
        let second = rx.recv().await.unwrap();
        assert_eq!(
            second.change,
            MembershipChange::HealthChanged {
                from: NodeHealth::Alive,
                to: NodeHealth::Suspect
            }
        );
        assert!(second.epoch > first.epoch);
    }

    #[tokio::test]
    async fn test_run_publishes_domain_events() {
        use crate::adapters::InMemoryEventCollector;

        let registry = registry();
        let collector = Arc::new(InMemoryEventCollector::new());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&registry).run(collector.clone(), shutdown.clone()));

        // let the loop subscribe before changing membership
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.register(&ping("n1")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(collector.events_of_type("NodeRegistered").len(), 1);
    }
}
