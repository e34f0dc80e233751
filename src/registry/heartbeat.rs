//! Node-side heartbeat loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Ping;
use crate::domain::NodeId;
use crate::error::{Error, Result};
use crate::shard::ShardStore;

/// Where a node sends its registration and heartbeats.
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    async fn register(&self, ping: &Ping) -> Result<()>;

    async fn ping(&self, ping: &Ping) -> Result<()>;
}

/// Periodically reports a node's liveness and capacity to the registry.
pub struct HeartbeatSender {
    node_id: NodeId,
    address: String,
    store: Arc<ShardStore>,
    sink: Arc<dyn HeartbeatSink>,
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(
        node_id: NodeId,
        address: impl Into<String>,
        store: Arc<ShardStore>,
        sink: Arc<dyn HeartbeatSink>,
        interval: Duration,
    ) -> Self {
        Self {
            node_id,
            address: address.into(),
            store,
            sink,
            interval,
        }
    }

    fn ping(&self) -> Ping {
        Ping {
            node_id: self.node_id.clone(),
            address: self.address.clone(),
            capacity: self.store.capacity(),
        }
    }

    /// Send one heartbeat, registering first if the registry does not know us.
    pub async fn beat(&self) -> Result<()> {
        let ping = self.ping();
        let result = timeout(self.interval, self.sink.ping(&ping))
            .await
            .map_err(|_| Error::Timeout(format!("heartbeat from {}", self.node_id)))?;
        match result {
            Err(Error::NotFound(_)) => {
                info!(node = %self.node_id, "Registry does not know this node, registering");
                self.sink.register(&ping).await
            }
            other => other,
        }
    }

    /// Heartbeat until `shutdown` fires. A dead verdict stops the loop.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => match self.beat().await {
                    Ok(()) => debug!(node = %self.node_id, "Heartbeat sent"),
                    Err(Error::NodeDead(_)) => {
                        error!(node = %self.node_id, "Registry declared this node dead; restart with a fresh node id");
                        break;
                    }
                    Err(e) => warn!(node = %self.node_id, "Heartbeat failed: {}", e),
                },
            }
        }
    }
}
