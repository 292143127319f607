use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::action::{BytesCodec, Target};
use crate::config::SyncConfig;
use crate::events::{Event, EventBus};
use crate::room::{Action, Room, RoomError};

/// Action carrying [`StateSnapshot`]s from the host.
pub const SNAPSHOT_ACTION: &str = "snapshot";
/// Action carrying raw inputs to the host.
pub const INPUT_ACTION: &str = "input";

/// The game simulation as the sync layer sees it.
pub trait Simulation: Send + 'static {
    /// Step the simulation by one fixed timestep.
    fn advance(&mut self, dt: Duration);

    /// Serialize the full authoritative state.
    fn snapshot(&self) -> Vec<u8>;

    fn apply_remote_input(&mut self, peer_id: &str, input: &[u8]);

    /// Seed shared with clients so they can reproduce host-side randomness.
    fn authoritative_seed(&self) -> u64;

    /// Replace local state with the host's. Clients only.
    fn apply_snapshot(&mut self, _snapshot: &StateSnapshot) {}
}

pub type SharedSimulation = Arc<parking_lot::Mutex<dyn Simulation>>;

/// Full authoritative state at a given host tick.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub tick: u64,
    pub seed: u64,
    #[serde(with = "crate::action::base64_bytes")]
    pub state: Vec<u8>,
}

/// The host elected among `self_id` and `peers`: the smallest id.
pub fn elect_host<'a>(self_id: &'a str, peers: &'a [String]) -> &'a str {
    peers
        .iter()
        .map(String::as_str)
        .fold(self_id, |host, peer| host.min(peer))
}

/// Runs the authoritative loop when this peer is host: steps the simulation at
/// `update_rate` and broadcasts a snapshot every `ticks_per_snapshot` steps.
///
/// When not running, snapshots received from the host are applied to the
/// local simulation instead.
pub struct HostAuthority {
    room: Room,
    simulation: SharedSimulation,
    update_rate: u32,
    snapshot_rate: u32,
    snapshots: Action<StateSnapshot>,
    inputs: Action<Vec<u8>, BytesCodec>,
    bus: EventBus,
    tick: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HostAuthority {
    pub fn new(
        room: Room,
        simulation: SharedSimulation,
        sync: &SyncConfig,
        bus: EventBus,
    ) -> Result<Self, RoomError> {
        let snapshots: Action<StateSnapshot> = room.make_action(SNAPSHOT_ACTION)?;
        let inputs = room.make_action_with(INPUT_ACTION, BytesCodec)?;
        let running = Arc::new(AtomicBool::new(false));

        {
            let simulation = simulation.clone();
            let running = running.clone();
            snapshots.on_receive(move |snapshot: StateSnapshot, from: &str| {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(peer_id = %from, tick = snapshot.tick, "ignoring snapshot while hosting");
                    return;
                }
                simulation.lock().apply_snapshot(&snapshot);
            });
        }
        {
            let simulation = simulation.clone();
            let running = running.clone();
            inputs.on_receive(move |input: Vec<u8>, from: &str| {
                if !running.load(Ordering::SeqCst) {
                    tracing::debug!(peer_id = %from, "input received while not hosting, dropped");
                    return;
                }
                simulation.lock().apply_remote_input(from, &input);
            });
        }

        Ok(Self {
            room,
            simulation,
            update_rate: sync.update_rate.max(1),
            snapshot_rate: sync.snapshot_rate.max(1),
            snapshots,
            inputs,
            bus,
            tick: Arc::new(AtomicU64::new(0)),
            running,
            handle: parking_lot::Mutex::new(None),
        })
    }

    pub fn update_rate(&self) -> u32 {
        self.update_rate
    }

    pub fn snapshot_rate(&self) -> u32 {
        self.snapshot_rate
    }

    /// Host steps between snapshots; at least one.
    pub fn ticks_per_snapshot(&self) -> u64 {
        u64::from((self.update_rate / self.snapshot_rate).max(1))
    }

    pub fn simulation(&self) -> &SharedSimulation {
        &self.simulation
    }

    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Start the fixed-rate loop. Does nothing if it is already running.
    pub fn start_game_loop(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let dt = Duration::from_secs_f64(1.0 / f64::from(self.update_rate));
        let every = self.ticks_per_snapshot();
        let simulation = self.simulation.clone();
        let snapshots = self.snapshots.clone();
        let tick = self.tick.clone();
        let room_id = self.room.id().to_string();

        self.running.store(true, Ordering::SeqCst);
        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(dt);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let current = tick.fetch_add(1, Ordering::SeqCst) + 1;
                let snapshot = {
                    let mut sim = simulation.lock();
                    sim.advance(dt);
                    (current % every == 0).then(|| StateSnapshot {
                        tick: current,
                        seed: sim.authoritative_seed(),
                        state: sim.snapshot(),
                    })
                };
                if let Some(snapshot) = snapshot {
                    if let Err(error) = snapshots.send(&snapshot, Target::All).await {
                        tracing::debug!(room = %room_id, tick = current, %error, "snapshot broadcast failed");
                    }
                }
            }
        }));
        drop(handle);

        tracing::info!(room = %self.room.id(), update_rate = self.update_rate, every, "host loop started");
        self.bus.emit(Event::HostLoopStarted {
            room_id: self.room.id().to_string(),
        });
    }

    /// Stop the loop. Safe to call when it is not running.
    pub fn stop_game_loop(&self) {
        let handle = self.handle.lock().take();
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = handle {
            handle.abort();
            tracing::info!(room = %self.room.id(), tick = self.tick(), "host loop stopped");
            self.bus.emit(Event::HostLoopStopped {
                room_id: self.room.id().to_string(),
            });
        }
    }

    pub fn destroy(&self) {
        self.stop_game_loop();
    }

    /// Broadcast the current state now, outside the snapshot cadence. Returns
    /// the tick it carried.
    pub async fn broadcast_snapshot(&self) -> Result<u64, RoomError> {
        let snapshot = {
            let sim = self.simulation.lock();
            StateSnapshot {
                tick: self.tick(),
                seed: sim.authoritative_seed(),
                state: sim.snapshot(),
            }
        };
        self.snapshots.send(&snapshot, Target::All).await?;
        Ok(snapshot.tick)
    }

    /// Send one input to the host.
    pub async fn send_input(&self, host_id: &str, input: &[u8]) -> Result<(), RoomError> {
        self.inputs
            .send(&input.to_vec(), Target::Peer(host_id.to_string()))
            .await
    }
}

impl Drop for HostAuthority {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}
