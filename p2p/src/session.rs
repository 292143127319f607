use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;

use crate::events::{Event, EventBus};
use crate::host::{elect_host, HostAuthority, SharedSimulation};
use crate::liveness::LivenessManager;
use crate::registry::RoomRegistry;
use crate::room::{Room, RoomError};

/// One game played in one room: the room, its host authority and its
/// liveness manager, kept in step with peers joining and leaving.
///
/// The peer with the smallest id hosts. Hosting is re-evaluated whenever a
/// peer joins or leaves, starting or stopping the local game loop.
pub struct GameSession {
    room: Room,
    host: Arc<HostAuthority>,
    liveness: LivenessManager,
    host_id: Arc<parking_lot::Mutex<String>>,
    watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl GameSession {
    /// Join `room_id` through `registry` and start playing.
    pub async fn start(
        registry: &RoomRegistry,
        room_id: &str,
        simulation: SharedSimulation,
    ) -> Result<Self, RoomError> {
        // subscribe first so no join between these lines is missed
        let events = registry.bus().subscribe();
        let room = registry.join(room_id).await?;
        let config = registry.config();

        let host = Arc::new(HostAuthority::new(
            room.clone(),
            simulation,
            &config.sync,
            registry.bus().clone(),
        )?);
        let liveness =
            LivenessManager::new(room.clone(), config.heartbeat.clone(), registry.bus().clone());
        let host_id = Arc::new(parking_lot::Mutex::new(room.self_id().to_string()));

        for peer_id in room.get_peers().await {
            liveness.start_heartbeat(&peer_id);
        }
        reelect(&room, &host, &host_id).await;

        let watcher = tokio::spawn(watch_events(
            events,
            room.clone(),
            host.clone(),
            liveness.clone(),
            host_id.clone(),
            registry.bus().clone(),
        ));

        Ok(Self {
            room,
            host,
            liveness,
            host_id,
            watcher: parking_lot::Mutex::new(Some(watcher)),
        })
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn host(&self) -> &HostAuthority {
        &self.host
    }

    pub fn liveness(&self) -> &LivenessManager {
        &self.liveness
    }

    pub fn host_id(&self) -> String {
        self.host_id.lock().clone()
    }

    pub fn is_host(&self) -> bool {
        *self.host_id.lock() == self.room.self_id()
    }

    /// Route one input to the current host, applying it locally when that is
    /// us.
    pub async fn send_input(&self, input: &[u8]) -> Result<(), RoomError> {
        let host_id = self.host_id();
        if host_id == self.room.self_id() {
            self.host
                .simulation()
                .lock()
                .apply_remote_input(&host_id, input);
            return Ok(());
        }
        self.host.send_input(&host_id, input).await
    }

    /// Stop the loop and every heartbeat, then leave the room. Safe to call
    /// more than once.
    pub async fn shutdown(&self) {
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.host.destroy();
        self.liveness.disconnect_all().await;
        self.room.leave().await;
    }
}

impl Drop for GameSession {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
    }
}

async fn reelect(room: &Room, host: &HostAuthority, host_id: &parking_lot::Mutex<String>) {
    let peers = room.get_peers().await;
    let elected = elect_host(room.self_id(), &peers).to_string();

    let previous = std::mem::replace(&mut *host_id.lock(), elected.clone());
    if previous != elected {
        tracing::info!(room = %room.id(), host = %elected, %previous, "host changed");
    }

    if elected == room.self_id() {
        host.start_game_loop();
    } else {
        host.stop_game_loop();
    }
}

async fn watch_events(
    mut events: Receiver<Event>,
    room: Room,
    host: Arc<HostAuthority>,
    liveness: LivenessManager,
    host_id: Arc<parking_lot::Mutex<String>>,
    bus: EventBus,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(room = %room.id(), skipped, "session lagged behind the event bus");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        if event.room_id() != Some(room.id()) {
            continue;
        }

        match event {
            Event::PeerJoined { peer_id, .. } => {
                liveness.start_heartbeat(&peer_id);
                reelect(&room, &host, &host_id).await;
            }
            Event::PeerLeft { peer_id, .. } => {
                liveness.stop_heartbeat(&peer_id);
                reelect(&room, &host, &host_id).await;
            }
            Event::ResyncRequested { peer_id, .. } => {
                let hosting = *host_id.lock() == room.self_id();
                if hosting {
                    tracing::info!(room = %room.id(), lost = %peer_id, "resync: broadcasting full snapshot");
                    match host.broadcast_snapshot().await {
                        Ok(tick) => {
                            bus.emit(Event::ResyncSent {
                                room_id: room.id().to_string(),
                                lost_peer: peer_id,
                                tick,
                            });
                        }
                        Err(error) => {
                            tracing::warn!(room = %room.id(), %error, "resync snapshot failed");
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::MeshConfig;
    use crate::host::Simulation;
    use crate::relay::{BrokerTransport, MemoryBroker};

    #[derive(Default)]
    struct Tally {
        steps: u64,
        inputs: Vec<Vec<u8>>,
    }

    impl Simulation for Tally {
        fn advance(&mut self, _dt: Duration) {
            self.steps += 1;
        }

        fn snapshot(&self) -> Vec<u8> {
            self.steps.to_le_bytes().to_vec()
        }

        fn apply_remote_input(&mut self, _peer_id: &str, input: &[u8]) {
            self.inputs.push(input.to_vec());
        }

        fn authoritative_seed(&self) -> u64 {
            7
        }
    }

    fn registry() -> RoomRegistry {
        let bus = EventBus::default();
        let transport = Arc::new(BrokerTransport::new(MemoryBroker::new(), bus.clone()));
        RoomRegistry::with_peer_id("peer-a", transport, MeshConfig::default(), bus)
    }

    #[tokio::test]
    async fn lone_peer_hosts() {
        let registry = registry();
        let tally = Arc::new(parking_lot::Mutex::new(Tally::default()));
        let session = GameSession::start(&registry, "arena", tally.clone())
            .await
            .unwrap();

        assert!(session.is_host());
        assert_eq!(session.host_id(), "peer-a");
        assert!(session.host().is_running());

        session.send_input(b"fire").await.unwrap();
        assert_eq!(tally.lock().inputs, vec![b"fire".to_vec()]);

        session.shutdown().await;
        session.shutdown().await;
        assert!(!session.host().is_running());
        assert!(session.room().is_left());
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn membership_events_drive_heartbeats() {
        let registry = registry();
        let tally = Arc::new(parking_lot::Mutex::new(Tally::default()));
        let session = GameSession::start(&registry, "arena", tally).await.unwrap();

        registry.bus().emit(Event::PeerJoined {
            room_id: "arena".into(),
            peer_id: "peer-b".into(),
        });
        // events for other rooms are ignored
        registry.bus().emit(Event::PeerJoined {
            room_id: "lobby".into(),
            peer_id: "peer-c".into(),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.liveness().has_heartbeat("peer-b"));
        assert!(!session.liveness().has_heartbeat("peer-c"));

        registry.bus().emit(Event::PeerLeft {
            room_id: "arena".into(),
            peer_id: "peer-b".into(),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.liveness().heartbeat_count(), 0);
        // still alone, still hosting
        assert!(session.host().is_running());

        session.shutdown().await;
    }
}
