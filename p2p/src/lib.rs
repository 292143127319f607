pub mod action;
pub mod cipher;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod events;
pub mod fanout;
pub mod host;
pub mod http_relay;
pub mod link;
pub mod liveness;
pub mod media;
pub mod registry;
pub mod relay;
pub mod room;
pub mod session;
pub mod signal;
pub mod transport;

pub use action::{
    BytesCodec, Codec, CodecError, JsonCodec, Target, CHUNK_PAYLOAD_BYTES, MAX_ACTION_NAME_BYTES,
    MAX_FRAME_BYTES, MAX_MESSAGE_BYTES,
};
pub use cipher::{CipherError, SignalCipher};
pub use config::{
    ConfigError, HeartbeatConfig, IceServer, LoggerConfig, MeshConfig, RtcConfig, SyncConfig,
};
pub use connection::{
    ConnectionEvent, ConnectionHandle, Connector, LinkScope, PeerConnection, TunnelConnector,
};
pub use crypto::{inbox_topic, random_peer_id, room_topic, CryptoError};
pub use events::{Event, EventBus};
pub use fanout::FanoutTransport;
pub use host::{elect_host, HostAuthority, SharedSimulation, Simulation, StateSnapshot};
pub use http_relay::HttpRelayTransport;
pub use link::{LinkError, LinkRole, LinkState, PeerLink};
pub use liveness::{LivenessManager, PeerMeta};
pub use media::{MediaStream, MediaTrack, TrackKind};
pub use registry::RoomRegistry;
pub use relay::{BrokerTransport, MemoryBroker};
pub use room::{Action, Room, RoomError, RoomKey};
pub use session::GameSession;
pub use signal::{IceCandidate, SdpKind, SessionDescription, Signal, SignalError, SignalMessage};
pub use transport::{SignalingTransport, Subscription, TransportError};
