use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::HeartbeatConfig;
use crate::events::{Event, EventBus};
use crate::room::Room;

/// What the liveness manager knows about one watched peer.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerMeta {
    pub joined_at: DateTime<Utc>,
    pub last_rtt: Option<Duration>,
    /// Consecutive pings that failed or timed out.
    pub missed: u32,
}

struct Heartbeat {
    generation: u64,
    meta: PeerMeta,
    handle: JoinHandle<()>,
}

type Heartbeats = Arc<parking_lot::Mutex<HashMap<String, Heartbeat>>>;

/// Pings every watched peer of a room on a fixed interval and drops peers
/// that miss `max_missed` pings in a row.
///
/// A peer has metadata exactly while it has a running heartbeat.
#[derive(Clone)]
pub struct LivenessManager {
    room: Room,
    config: HeartbeatConfig,
    bus: EventBus,
    heartbeats: Heartbeats,
    generation: Arc<AtomicU64>,
}

impl LivenessManager {
    pub fn new(room: Room, config: HeartbeatConfig, bus: EventBus) -> Self {
        Self {
            room,
            config,
            bus,
            heartbeats: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start watching `peer_id`, replacing any heartbeat it already had.
    pub fn start_heartbeat(&self, peer_id: &str) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let previous = {
            let mut heartbeats = self.heartbeats.lock();
            let handle = tokio::spawn(heartbeat_loop(
                self.room.clone(),
                peer_id.to_string(),
                generation,
                self.heartbeats.clone(),
                self.config.clone(),
                self.bus.clone(),
            ));
            heartbeats.insert(
                peer_id.to_string(),
                Heartbeat {
                    generation,
                    meta: PeerMeta {
                        joined_at: Utc::now(),
                        last_rtt: None,
                        missed: 0,
                    },
                    handle,
                },
            )
        };
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        tracing::debug!(room = %self.room.id(), %peer_id, "heartbeat started");
    }

    /// Stop watching `peer_id`. Unknown peers are ignored.
    pub fn stop_heartbeat(&self, peer_id: &str) {
        let removed = self.heartbeats.lock().remove(peer_id);
        if let Some(heartbeat) = removed {
            heartbeat.handle.abort();
            tracing::debug!(room = %self.room.id(), %peer_id, "heartbeat stopped");
        }
    }

    /// Stop every heartbeat and disconnect every watched peer.
    pub async fn disconnect_all(&self) {
        let drained: Vec<(String, Heartbeat)> = self.heartbeats.lock().drain().collect();
        for (peer_id, heartbeat) in drained {
            heartbeat.handle.abort();
            self.room.disconnect_peer(&peer_id).await;
        }
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.lock().len()
    }

    pub fn has_heartbeat(&self, peer_id: &str) -> bool {
        self.heartbeats.lock().contains_key(peer_id)
    }

    pub fn peer_meta(&self, peer_id: &str) -> Option<PeerMeta> {
        self.heartbeats.lock().get(peer_id).map(|h| h.meta.clone())
    }
}

async fn heartbeat_loop(
    room: Room,
    peer_id: String,
    generation: u64,
    heartbeats: Heartbeats,
    config: HeartbeatConfig,
    bus: EventBus,
) {
    let mut ticker = tokio::time::interval(config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // the first tick fires immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let outcome = room.ping(&peer_id).await;

        let lost = {
            let mut heartbeats = heartbeats.lock();
            let Some(heartbeat) = heartbeats
                .get_mut(&peer_id)
                .filter(|h| h.generation == generation)
            else {
                return;
            };
            match outcome {
                Ok(rtt) => {
                    heartbeat.meta.last_rtt = Some(rtt);
                    heartbeat.meta.missed = 0;
                }
                Err(error) => {
                    heartbeat.meta.missed += 1;
                    tracing::debug!(room = %room.id(), %peer_id, missed = heartbeat.meta.missed, %error, "heartbeat missed");
                }
            }
            let missed = heartbeat.meta.missed;
            if missed >= config.max_missed.max(1) {
                heartbeats.remove(&peer_id);
                Some(missed)
            } else {
                None
            }
        };

        if let Some(missed) = lost {
            tracing::warn!(room = %room.id(), %peer_id, missed, "peer stopped answering, disconnecting");
            bus.emit(Event::PeerTimedOut {
                room_id: room.id().to_string(),
                peer_id: peer_id.clone(),
                missed,
            });
            bus.emit(Event::ResyncRequested {
                room_id: room.id().to_string(),
                peer_id: peer_id.clone(),
            });
            room.disconnect_peer(&peer_id).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::registry::RoomRegistry;
    use crate::relay::{BrokerTransport, MemoryBroker};

    async fn lone_room() -> Room {
        let transport = Arc::new(BrokerTransport::new(MemoryBroker::new(), EventBus::default()));
        RoomRegistry::with_peer_id("peer-a", transport, MeshConfig::default(), EventBus::default())
            .join("arena")
            .await
            .unwrap()
    }

    fn slow() -> HeartbeatConfig {
        HeartbeatConfig {
            interval_ms: 60_000,
            max_missed: 3,
        }
    }

    #[tokio::test]
    async fn start_then_stop_leaves_no_entry() {
        let liveness = LivenessManager::new(lone_room().await, slow(), EventBus::default());
        liveness.start_heartbeat("peer-b");
        assert!(liveness.has_heartbeat("peer-b"));
        let meta = liveness.peer_meta("peer-b").unwrap();
        assert_eq!(meta.missed, 0);
        assert!(meta.last_rtt.is_none());

        liveness.stop_heartbeat("peer-b");
        liveness.stop_heartbeat("peer-b");
        liveness.stop_heartbeat("never-seen");
        assert_eq!(liveness.heartbeat_count(), 0);
        assert!(liveness.peer_meta("peer-b").is_none());
    }

    #[tokio::test]
    async fn restart_replaces_the_entry() {
        let liveness = LivenessManager::new(lone_room().await, slow(), EventBus::default());
        liveness.start_heartbeat("peer-b");
        liveness.start_heartbeat("peer-b");
        assert_eq!(liveness.heartbeat_count(), 1);
    }

    #[tokio::test]
    async fn disconnect_all_empties_the_map() {
        let liveness = LivenessManager::new(lone_room().await, slow(), EventBus::default());
        for peer in ["peer-b", "peer-c", "peer-d"] {
            liveness.start_heartbeat(peer);
        }
        assert_eq!(liveness.heartbeat_count(), 3);

        liveness.disconnect_all().await;
        assert_eq!(liveness.heartbeat_count(), 0);
        liveness.disconnect_all().await;
    }

    #[tokio::test]
    async fn unreachable_peer_times_out() {
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let config = HeartbeatConfig {
            interval_ms: 10,
            max_missed: 2,
        };
        let liveness = LivenessManager::new(lone_room().await, config, bus);

        // no link to this peer, so every ping fails at once
        liveness.start_heartbeat("peer-ghost");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!liveness.has_heartbeat("peer-ghost"));

        match events.recv().await.unwrap() {
            Event::PeerTimedOut {
                peer_id, missed, ..
            } => {
                assert_eq!(peer_id, "peer-ghost");
                assert_eq!(missed, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::ResyncRequested { .. }
        ));
    }
}
