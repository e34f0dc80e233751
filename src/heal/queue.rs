//! Deduplicated healing work queue.
//!
//! At most one task per object identity is queued or running. Each task
//! carries a cancellation token; deleting an object cancels its task.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{DomainEvent, EventPublisher, ObjectId};

/// Why an object was queued for healing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealReason {
    /// A read met missing, corrupt or unreachable shards.
    DegradedRead,
    /// Shard pushes still running after the write quorum failed.
    WriteStragglers,
    /// The periodic scan found the object unhealthy.
    Scan,
    /// A node holding shards left the alive set.
    NodeLost,
    Manual,
}

impl fmt::Display for HealReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealReason::DegradedRead => "degraded_read",
            HealReason::WriteStragglers => "write_stragglers",
            HealReason::Scan => "scan",
            HealReason::NodeLost => "node_lost",
            HealReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// One unit of healing work.
#[derive(Debug, Clone)]
pub struct HealTask {
    pub object_id: ObjectId,
    pub reason: HealReason,
    pub queued_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    ticket: u64,
}

impl HealTask {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Bounded MPSC queue of heal tasks with per-object deduplication.
pub struct HealQueue {
    tx: mpsc::Sender<HealTask>,
    rx: Mutex<mpsc::Receiver<HealTask>>,
    in_flight: DashMap<ObjectId, (u64, CancellationToken)>,
    next_ticket: AtomicU64,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl HealQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            in_flight: DashMap::new(),
            next_ticket: AtomicU64::new(0),
            publisher: None,
        }
    }

    /// Publish a `HealQueued` event for every accepted task.
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Queue `object_id` unless it is already queued or running.
    ///
    /// Never blocks: returns `false` when deduplicated or when the queue is
    /// full (the periodic scan picks the object up later).
    pub async fn enqueue(&self, object_id: &ObjectId, reason: HealReason) -> bool {
        let task = match self.in_flight.entry(object_id.clone()) {
            Entry::Occupied(_) => {
                debug!(object = %object_id, %reason, "Heal already queued");
                return false;
            }
            Entry::Vacant(slot) => {
                let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                let cancel = CancellationToken::new();
                slot.insert((ticket, cancel.clone()));
                HealTask {
                    object_id: object_id.clone(),
                    reason,
                    queued_at: Utc::now(),
                    cancel,
                    ticket,
                }
            }
        };

        let ticket = task.ticket;
        if let Err(e) = self.tx.try_send(task) {
            warn!(object = %object_id, %reason, "Heal queue rejected task: {}", e);
            self.in_flight
                .remove_if(object_id, |_, (t, _)| *t == ticket);
            return false;
        }

        debug!(object = %object_id, %reason, "Heal queued");
        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher
                .publish(DomainEvent::heal_queued(object_id, reason.to_string()))
                .await
            {
                warn!("Failed to publish heal event: {}", e);
            }
        }
        true
    }

    /// Next task, waiting if the queue is empty. `None` once every sender is gone.
    pub async fn recv(&self) -> Option<HealTask> {
        self.rx.lock().await.recv().await
    }

    /// Cancel the queued or running task of `object_id`, if any.
    pub fn cancel(&self, object_id: &ObjectId) -> bool {
        match self.in_flight.remove(object_id) {
            Some((_, (_, token))) => {
                token.cancel();
                debug!(object = %object_id, "Heal cancelled");
                true
            }
            None => false,
        }
    }

    /// Release the dedup slot held by `task`.
    pub fn complete(&self, task: &HealTask) {
        self.in_flight
            .remove_if(&task.object_id, |_, (t, _)| *t == task.ticket);
    }

    pub fn is_queued(&self, object_id: &ObjectId) -> bool {
        self.in_flight.contains_key(object_id)
    }

    /// Objects queued or being healed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
