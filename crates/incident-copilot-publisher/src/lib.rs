#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use incident_copilot_domain::{IncidentId, WorkflowState};
use ulid::Ulid;

const DEFAULT_BUFFER: usize = 256;

/// Fans committed workflow snapshots out to live observers.
///
/// Delivery contract: a new subscriber receives a full snapshot of every
/// run for its incident before any incremental push, and publishing never
/// blocks or fails the engine — a slow subscriber loses deltas (counted),
/// a disconnected one is pruned.
pub struct StatePublisher {
    registry: Mutex<BTreeMap<IncidentId, Vec<SubscriberSlot>>>,
    buffer_size: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

struct SubscriberSlot {
    subscriber_id: Ulid,
    sender: Sender<WorkflowState>,
}

/// A live feed of workflow snapshots for one incident. Dropping the
/// subscription disconnects it; the publisher prunes it on the next push.
pub struct Subscription {
    pub subscriber_id: Ulid,
    receiver: Receiver<WorkflowState>,
}

impl Subscription {
    /// Blocking receive. Returns `None` once the publisher is gone.
    #[must_use]
    pub fn recv(&self) -> Option<WorkflowState> {
        self.receiver.recv().ok()
    }

    #[must_use]
    pub fn try_recv(&self) -> Option<WorkflowState> {
        self.receiver.try_recv().ok()
    }

    /// Drain everything currently buffered without blocking.
    #[must_use]
    pub fn drain(&self) -> Vec<WorkflowState> {
        let mut out = Vec::new();
        while let Ok(state) = self.receiver.try_recv() {
            out.push(state);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct PublisherStats {
    /// Deltas delivered into subscriber buffers.
    pub published: u64,
    /// Deltas lost to full buffers or disconnected subscribers.
    pub dropped: u64,
}

impl Default for StatePublisher {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl StatePublisher {
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        Self {
            registry: Mutex::new(BTreeMap::new()),
            buffer_size: buffer_size.max(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a subscriber for an incident, seeding its channel with the
    /// provided snapshot before registration completes. Seeding and
    /// registration happen under the registry lock, so no delta published
    /// afterwards can be observed ahead of the snapshot.
    #[must_use]
    pub fn subscribe(&self, incident_id: &IncidentId, snapshot: Vec<WorkflowState>) -> Subscription {
        let capacity = self.buffer_size.max(snapshot.len());
        let (sender, receiver) = bounded(capacity);
        let subscriber_id = Ulid::new();

        let mut registry = lock_registry(&self.registry);
        for state in snapshot {
            // Capacity covers the whole snapshot; a failure here means the
            // receiver is already gone, which registration below tolerates.
            let _ = sender.try_send(state);
        }
        registry
            .entry(incident_id.clone())
            .or_default()
            .push(SubscriberSlot {
                subscriber_id,
                sender,
            });

        Subscription {
            subscriber_id,
            receiver,
        }
    }

    /// Remove a subscriber explicitly. Missing ids are ignored.
    pub fn unsubscribe(&self, incident_id: &IncidentId, subscriber_id: Ulid) {
        let mut registry = lock_registry(&self.registry);
        if let Some(slots) = registry.get_mut(incident_id) {
            slots.retain(|slot| slot.subscriber_id != subscriber_id);
            if slots.is_empty() {
                registry.remove(incident_id);
            }
        }
    }

    /// Push a committed snapshot to every subscriber of its incident.
    /// Never blocks: full buffers drop the delta, disconnected
    /// subscribers are pruned.
    pub fn publish(&self, state: &WorkflowState) {
        let mut registry = lock_registry(&self.registry);
        let Some(slots) = registry.get_mut(&state.incident_id) else {
            return;
        };

        let mut disconnected: Vec<Ulid> = Vec::new();
        for slot in slots.iter() {
            match slot.sender.try_send(state.clone()) {
                Ok(()) => {
                    self.published.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        incident_id = %state.incident_id,
                        subscriber_id = %slot.subscriber_id,
                        "subscriber buffer full, dropping state delta"
                    );
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    disconnected.push(slot.subscriber_id);
                }
            }
        }

        if !disconnected.is_empty() {
            slots.retain(|slot| !disconnected.contains(&slot.subscriber_id));
            if slots.is_empty() {
                registry.remove(&state.incident_id);
            }
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, incident_id: &IncidentId) -> usize {
        lock_registry(&self.registry)
            .get(incident_id)
            .map_or(0, Vec::len)
    }

    #[must_use]
    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

fn lock_registry(
    registry: &Mutex<BTreeMap<IncidentId, Vec<SubscriberSlot>>>,
) -> std::sync::MutexGuard<'_, BTreeMap<IncidentId, Vec<SubscriberSlot>>> {
    // A poisoned registry only means another publisher call panicked;
    // the map itself is still structurally sound.
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
