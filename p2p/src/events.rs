use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle events emitted by rooms, transports and the sync layer.
///
/// Rooms keep single-slot callbacks for the presentation layer; the bus is the
/// multi-subscriber view of the same lifecycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    TransportInitialized {
        backend: String,
    },
    PeerJoined {
        room_id: String,
        peer_id: String,
    },
    PeerLeft {
        room_id: String,
        peer_id: String,
    },
    StreamAdded {
        room_id: String,
        peer_id: String,
        stream_id: String,
    },
    TrackAdded {
        room_id: String,
        peer_id: String,
        track_id: String,
    },
    SignalReceived {
        from: String,
        to: String,
    },
    ChannelEstablished {
        from: String,
        to: String,
    },
    PeerTimedOut {
        room_id: String,
        peer_id: String,
        missed: u32,
    },
    ResyncRequested {
        room_id: String,
        peer_id: String,
    },
    /// The host answered a lost peer with a full snapshot at `tick`.
    ResyncSent {
        room_id: String,
        lost_peer: String,
        tick: u64,
    },
    HostLoopStarted {
        room_id: String,
    },
    HostLoopStopped {
        room_id: String,
    },
}

impl Event {
    /// Room the event belongs to, if it is room scoped.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Event::PeerJoined { room_id, .. }
            | Event::PeerLeft { room_id, .. }
            | Event::StreamAdded { room_id, .. }
            | Event::TrackAdded { room_id, .. }
            | Event::PeerTimedOut { room_id, .. }
            | Event::ResyncRequested { room_id, .. }
            | Event::ResyncSent { room_id, .. }
            | Event::HostLoopStarted { room_id }
            | Event::HostLoopStopped { room_id } => Some(room_id),
            Event::TransportInitialized { .. }
            | Event::SignalReceived { .. }
            | Event::ChannelEstablished { .. } => None,
        }
    }
}

const DEFAULT_CAPACITY: usize = 256;

/// Broadcast-based event bus for decoupled mesh components.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Broadcast an event to all subscribers. Returns the number of receivers.
    pub fn emit(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
