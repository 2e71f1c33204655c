pub mod events;

pub use events::{FleetSummary, ProxyEvent, ServerHealthEvent, StatusSnapshot};

use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Single-producer-many-consumer status bus.
///
/// Built on `tokio::sync::broadcast`: slow subscribers observe `Lagged` and
/// are expected to drop their stream rather than backpressure the producer.
/// New subscribers receive the current snapshot first, then deltas.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
    snapshot: Arc<RwLock<StatusSnapshot>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            snapshot: Arc::new(RwLock::new(StatusSnapshot::default())),
        }
    }

    /// Publish an event, folding state-bearing events into the snapshot.
    /// Publishing never blocks and never fails: with no subscribers the
    /// event only updates the snapshot.
    pub fn publish(&self, event: ProxyEvent) {
        {
            let mut snap = self
                .snapshot
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match &event {
                ProxyEvent::StatusPhase {
                    server_name, phase, ..
                } => {
                    snap.phases.insert(server_name.clone(), phase.clone());
                }
                ProxyEvent::FleetChanged { summary } => {
                    snap.fleet = summary.clone();
                }
                ProxyEvent::ServerHealth(health) => {
                    snap.health
                        .insert(health.server_name.clone(), health.clone());
                }
                _ => {}
            }
        }
        let _ = self.tx.send(event);
    }

    /// Current snapshot plus a receiver for subsequent deltas. Events are
    /// delivered in emission order per subscriber.
    pub fn subscribe(&self) -> (StatusSnapshot, broadcast::Receiver<ProxyEvent>) {
        // Subscribe before reading the snapshot so no delta between the two
        // is lost (a duplicate observation is fine, a gap is not).
        let rx = self.tx.subscribe();
        let snap = self
            .snapshot
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        (snap, rx)
    }

    pub fn remove_server(&self, name: &str) {
        let mut snap = self
            .snapshot
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        snap.phases.remove(name);
        snap.health.remove(name);
    }
}
