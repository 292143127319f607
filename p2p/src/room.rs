use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use uuid::Uuid;

use crate::action::{
    decode_frame, encode_frames, is_valid_action_name, Codec, CodecError, JsonCodec, Reassembler,
    Target,
};
use crate::cipher::{CipherError, SignalCipher};
use crate::config::MeshConfig;
use crate::connection::{ConnectionEvent, Connector, LinkScope};
use crate::crypto::{inbox_topic, room_topic, CryptoError};
use crate::events::{Event, EventBus};
use crate::link::{LinkError, LinkRole, LinkState, PeerLink};
use crate::media::{MediaNotice, MediaStream, MediaTrack};
use crate::signal::{
    signal_source, signal_target, IceCandidate, SdpKind, SessionDescription, Signal,
    SignalError, SignalMessage,
};
use crate::transport::{SignalingTransport, Subscription, TransportError};

const PING_ACTION: &str = "__ping";
const PONG_ACTION: &str = "__pong";
const MEDIA_ACTION: &str = "__media";

/// Rooms of one registry, by key.
pub(crate) type RoomMap = RwLock<HashMap<RoomKey, Room>>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub app_id: String,
    pub room_id: String,
}

impl RoomKey {
    pub fn new(app_id: &str, room_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            room_id: room_id.to_string(),
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app_id, self.room_id)
    }
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error("invalid action name {0:?}: must be 1-32 bytes and not start with \"__\"")]
    InvalidActionName(String),
    #[error("no link to peer {0}")]
    UnknownPeer(String),
    #[error("no local stream {0}")]
    UnknownStream(String),
    #[error("ping to {peer_id} timed out after {timeout_ms}ms")]
    PingTimeout { peer_id: String, timeout_ms: u64 },
    #[error("room has been left")]
    Left,
}

type PeerHandler = Arc<dyn Fn(&str) + Send + Sync>;
type StreamHandler = Arc<dyn Fn(&str, &MediaStream) + Send + Sync>;
type TrackHandler = Arc<dyn Fn(&str, &MediaTrack, &MediaStream) + Send + Sync>;
type RawHandler = Arc<dyn Fn(&[u8], &str) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    peer_join: Option<PeerHandler>,
    peer_leave: Option<PeerHandler>,
    peer_stream: Option<StreamHandler>,
    peer_track: Option<TrackHandler>,
}

#[derive(Default)]
struct ActionSlot {
    handler: Option<RawHandler>,
}

struct LinkTasks {
    pump: JoinHandle<()>,
    deadline: JoinHandle<()>,
}

impl LinkTasks {
    fn abort(&self) {
        self.pump.abort();
        self.deadline.abort();
    }
}

/// What a room borrows from the registry that creates it.
pub(crate) struct RoomContext {
    pub transport: Arc<dyn SignalingTransport>,
    pub connector: Arc<dyn Connector>,
    pub config: MeshConfig,
    pub bus: EventBus,
    pub registry: Weak<RoomMap>,
}

struct RoomInner {
    key: RoomKey,
    self_id: String,
    topic: String,
    config: MeshConfig,
    transport: Arc<dyn SignalingTransport>,
    connector: Arc<dyn Connector>,
    cipher: Option<SignalCipher>,
    bus: EventBus,
    registry: Weak<RoomMap>,
    span: tracing::Span,

    links: RwLock<HashMap<String, Arc<PeerLink>>>,
    link_tasks: parking_lot::Mutex<HashMap<String, LinkTasks>>,
    joined: parking_lot::Mutex<HashSet<String>>,
    actions: parking_lot::Mutex<HashMap<String, ActionSlot>>,
    callbacks: parking_lot::Mutex<Callbacks>,
    reassembler: parking_lot::Mutex<Reassembler>,
    pings: parking_lot::Mutex<HashMap<String, oneshot::Sender<()>>>,
    local_streams: parking_lot::Mutex<Vec<MediaStream>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    seq: AtomicU64,
    left: AtomicBool,
}

impl Drop for RoomInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        for (_, tasks) in self.link_tasks.get_mut().drain() {
            tasks.abort();
        }
    }
}

/// A joined room: the links to every peer met through its rendezvous topic
/// and the named actions exchanged over them.
///
/// Cheap to clone; every clone is the same room.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("key", &self.inner.key)
            .field("self_id", &self.inner.self_id)
            .finish()
    }
}

impl Room {
    /// Subscribe to the room's topics and announce ourselves.
    pub(crate) async fn join(
        key: RoomKey,
        self_id: &str,
        ctx: RoomContext,
    ) -> Result<Room, RoomError> {
        let password = ctx.config.password.as_deref().filter(|p| !p.is_empty());
        let topic = room_topic(&key.app_id, &key.room_id, password);
        let cipher = password
            .map(|password| SignalCipher::from_password(password, &topic))
            .transpose()?;

        let broadcast = ctx.transport.subscribe(&topic).await?;
        let inbox = ctx.transport.subscribe(&inbox_topic(&topic, self_id)).await?;

        let span = tracing::info_span!(
            "room",
            prefix = %ctx.config.logger.prefix,
            room = %key.room_id,
            peer = %self_id
        );
        let room = Room {
            inner: Arc::new(RoomInner {
                key,
                self_id: self_id.to_string(),
                topic,
                config: ctx.config,
                transport: ctx.transport,
                connector: ctx.connector,
                cipher,
                bus: ctx.bus,
                registry: ctx.registry,
                span: span.clone(),
                links: RwLock::new(HashMap::new()),
                link_tasks: parking_lot::Mutex::new(HashMap::new()),
                joined: parking_lot::Mutex::new(HashSet::new()),
                actions: parking_lot::Mutex::new(HashMap::new()),
                callbacks: parking_lot::Mutex::new(Callbacks::default()),
                reassembler: parking_lot::Mutex::new(Reassembler::default()),
                pings: parking_lot::Mutex::new(HashMap::new()),
                local_streams: parking_lot::Mutex::new(Vec::new()),
                tasks: parking_lot::Mutex::new(Vec::new()),
                seq: AtomicU64::new(0),
                left: AtomicBool::new(false),
            }),
        };

        let weak = Arc::downgrade(&room.inner);
        let pump = tokio::spawn(signal_pump(weak.clone(), broadcast, inbox).instrument(span.clone()));
        room.inner.tasks.lock().push(pump);

        room.announce(&SignalMessage::Presence {
            from: room.inner.self_id.clone(),
        })
        .await?;

        let every = room.inner.config.announce_interval();
        let announcer = tokio::spawn(announce_loop(weak, every).instrument(span.clone()));
        room.inner.tasks.lock().push(announcer);

        tracing::info!(parent: &span, topic = %room.inner.topic, "joined room");
        Ok(room)
    }

    pub fn key(&self) -> &RoomKey {
        &self.inner.key
    }

    pub fn id(&self) -> &str {
        &self.inner.key.room_id
    }

    pub fn self_id(&self) -> &str {
        &self.inner.self_id
    }

    /// The rendezvous topic peers of this room meet on.
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn is_left(&self) -> bool {
        self.inner.left.load(Ordering::SeqCst)
    }

    /// Register (or look up) a JSON-encoded action.
    pub fn make_action<T>(&self, name: &str) -> Result<Action<T>, RoomError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.make_action_with(name, JsonCodec)
    }

    /// Register (or look up) an action with an explicit codec.
    ///
    /// Calling this twice with the same name gives two handles to one slot.
    pub fn make_action_with<T, C>(&self, name: &str, codec: C) -> Result<Action<T, C>, RoomError>
    where
        T: Send + Sync + 'static,
        C: Codec<T>,
    {
        if !is_valid_action_name(name) {
            return Err(RoomError::InvalidActionName(name.to_string()));
        }
        self.inner
            .actions
            .lock()
            .entry(name.to_string())
            .or_default();
        Ok(Action {
            room: self.clone(),
            name: name.to_string(),
            codec: Arc::new(codec),
            _value: PhantomData,
        })
    }

    pub fn on_peer_join<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().peer_join = Some(Arc::new(callback));
    }

    pub fn on_peer_leave<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().peer_leave = Some(Arc::new(callback));
    }

    pub fn on_peer_stream<F>(&self, callback: F)
    where
        F: Fn(&str, &MediaStream) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().peer_stream = Some(Arc::new(callback));
    }

    pub fn on_peer_track<F>(&self, callback: F)
    where
        F: Fn(&str, &MediaTrack, &MediaStream) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().peer_track = Some(Arc::new(callback));
    }

    /// Peers whose link is open, sorted.
    pub async fn get_peers(&self) -> Vec<String> {
        let links: Vec<Arc<PeerLink>> = self.inner.links.read().await.values().cloned().collect();
        let mut peers = Vec::with_capacity(links.len());
        for link in links {
            if link.state().await == LinkState::Open {
                peers.push(link.peer_id().to_string());
            }
        }
        peers.sort();
        peers
    }

    /// Current link to a peer, in any state.
    pub async fn link(&self, peer_id: &str) -> Option<Arc<PeerLink>> {
        self.inner.links.read().await.get(peer_id).cloned()
    }

    /// Round trip to `peer_id` over its data channel.
    pub async fn ping(&self, peer_id: &str) -> Result<Duration, RoomError> {
        let nonce = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pings.lock().insert(nonce.clone(), tx);

        let started = Instant::now();
        let target = Target::Peer(peer_id.to_string());
        if let Err(error) = self.send_raw(PING_ACTION, nonce.as_bytes(), target).await {
            self.inner.pings.lock().remove(&nonce);
            return Err(error);
        }

        let config = &self.inner.config;
        match tokio::time::timeout(config.ping_timeout(), rx).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(RoomError::Left),
            Err(_) => {
                self.inner.pings.lock().remove(&nonce);
                Err(RoomError::PingTimeout {
                    peer_id: peer_id.to_string(),
                    timeout_ms: config.ping_timeout_ms.max(1),
                })
            }
        }
    }

    /// Announce a local stream to peers; it is also announced to peers that
    /// join later.
    pub async fn add_stream(&self, stream: MediaStream, target: Target) -> Result<(), RoomError> {
        {
            let mut streams = self.inner.local_streams.lock();
            streams.retain(|s| s.id != stream.id);
            streams.push(stream.clone());
        }
        self.send_media(&MediaNotice::AddStream { stream }, target).await
    }

    pub async fn remove_stream(&self, stream_id: &str, target: Target) -> Result<(), RoomError> {
        self.inner
            .local_streams
            .lock()
            .retain(|s| s.id != stream_id);
        let notice = MediaNotice::RemoveStream {
            stream_id: stream_id.to_string(),
        };
        self.send_media(&notice, target).await
    }

    pub async fn add_track(
        &self,
        stream_id: &str,
        track: MediaTrack,
        target: Target,
    ) -> Result<(), RoomError> {
        let stream = {
            let mut streams = self.inner.local_streams.lock();
            let stream = streams
                .iter_mut()
                .find(|s| s.id == stream_id)
                .ok_or_else(|| RoomError::UnknownStream(stream_id.to_string()))?;
            stream.add_track(track.clone());
            stream.clone()
        };
        self.send_media(&MediaNotice::AddTrack { stream, track }, target)
            .await
    }

    pub async fn remove_track(
        &self,
        stream_id: &str,
        track_id: &str,
        target: Target,
    ) -> Result<(), RoomError> {
        {
            let mut streams = self.inner.local_streams.lock();
            let stream = streams
                .iter_mut()
                .find(|s| s.id == stream_id)
                .ok_or_else(|| RoomError::UnknownStream(stream_id.to_string()))?;
            stream.remove_track(track_id);
        }
        let notice = MediaNotice::RemoveTrack {
            stream_id: stream_id.to_string(),
            track_id: track_id.to_string(),
        };
        self.send_media(&notice, target).await
    }

    /// Tear down one peer's link. Returns false if there was none.
    pub async fn disconnect_peer(&self, peer_id: &str) -> bool {
        self.remove_link(peer_id, None, "disconnected locally").await
    }

    /// Announce departure and tear everything down. Safe to call repeatedly.
    pub async fn leave(&self) {
        if self.inner.left.swap(true, Ordering::SeqCst) {
            return;
        }
        let span = self.inner.span.clone();
        let leave = SignalMessage::Leave {
            from: self.inner.self_id.clone(),
        };
        if let Err(error) = self.announce(&leave).await {
            tracing::warn!(parent: &span, %error, "leave announcement failed");
        }

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        let links: Vec<(String, Arc<PeerLink>)> =
            self.inner.links.write().await.drain().collect();
        for (peer_id, link) in links {
            link.destroy().await;
            let was_joined = self.inner.joined.lock().remove(&peer_id);
            if was_joined {
                self.peer_left(&peer_id);
            }
        }
        let link_tasks: Vec<LinkTasks> = self
            .inner
            .link_tasks
            .lock()
            .drain()
            .map(|(_, tasks)| tasks)
            .collect();
        for tasks in link_tasks {
            tasks.abort();
        }

        // pending pings resolve with RoomError::Left
        self.inner.pings.lock().clear();
        *self.inner.reassembler.lock() = Reassembler::default();

        if let Some(rooms) = self.inner.registry.upgrade() {
            let mut rooms = rooms.write().await;
            let ours = rooms
                .get(&self.inner.key)
                .is_some_and(|room| Arc::ptr_eq(&room.inner, &self.inner));
            if ours {
                rooms.remove(&self.inner.key);
            }
        }
        tracing::info!(parent: &span, "left room");
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    async fn announce(&self, message: &SignalMessage) -> Result<(), RoomError> {
        let payload = message.encode()?;
        self.inner
            .transport
            .announce(&self.inner.topic, &payload)
            .await?;
        Ok(())
    }

    async fn send_signal(&self, to: &str, message: &SignalMessage) -> Result<(), RoomError> {
        let payload = message.encode()?;
        self.inner
            .transport
            .announce(&inbox_topic(&self.inner.topic, to), &payload)
            .await?;
        Ok(())
    }

    async fn send_description(
        &self,
        to: &str,
        mut description: SessionDescription,
    ) -> Result<(), RoomError> {
        if let Some(cipher) = &self.inner.cipher {
            description.sdp = cipher.seal(&description.sdp)?;
        }
        let message = SignalMessage::Description {
            from: self.inner.self_id.clone(),
            to: to.to_string(),
            description,
        };
        self.send_signal(to, &message).await
    }

    async fn send_media(&self, notice: &MediaNotice, target: Target) -> Result<(), RoomError> {
        let bytes = serde_json::to_vec(notice).map_err(CodecError::from)?;
        self.send_raw(MEDIA_ACTION, &bytes, target).await
    }

    /// Frame `data` as `action` and write it to every targeted link.
    ///
    /// A unicast fails if its link is missing or not open. Broadcasts skip
    /// links that are still negotiating.
    async fn send_raw(&self, action: &str, data: &[u8], target: Target) -> Result<(), RoomError> {
        if self.is_left() {
            return Err(RoomError::Left);
        }

        let recipients: Vec<Arc<PeerLink>> = {
            let links = self.inner.links.read().await;
            match target.unicast() {
                Some(peer_id) => vec![links
                    .get(peer_id)
                    .cloned()
                    .ok_or_else(|| RoomError::UnknownPeer(peer_id.to_string()))?],
                None => links
                    .values()
                    .filter(|link| target.includes(link.peer_id()))
                    .cloned()
                    .collect(),
            }
        };

        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        let frames = encode_frames(action, &self.inner.self_id, target.unicast(), seq, data)?;

        for link in recipients {
            for frame in &frames {
                match link.send_data(frame).await {
                    Ok(()) => {}
                    Err(error) if target.unicast().is_some() => return Err(error.into()),
                    Err(LinkError::ChannelNotOpen { .. }) => break,
                    Err(error) => {
                        tracing::warn!(peer_id = %link.peer_id(), %action, %error, "send to peer failed");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rendezvous
    // -----------------------------------------------------------------------

    async fn handle_signal(&self, payload: &str) {
        let message = match SignalMessage::decode(payload) {
            Ok(message) => message,
            Err(error) => {
                tracing::debug!(%error, "ignoring undecodable signal");
                return;
            }
        };
        let from = signal_source(&message).to_string();
        if from == self.inner.self_id {
            return;
        }
        if let Some(to) = signal_target(&message) {
            if to != self.inner.self_id {
                return;
            }
            self.inner.bus.emit(Event::SignalReceived {
                from: from.clone(),
                to: to.to_string(),
            });
        }

        match message {
            SignalMessage::Presence { .. } => self.on_presence(&from).await,
            SignalMessage::Description { description, .. } => {
                self.on_description(&from, description).await
            }
            SignalMessage::Candidate { candidate, .. } => self.on_candidate(&from, candidate).await,
            SignalMessage::Leave { .. } => {
                self.remove_link(&from, None, "peer left the room").await;
            }
        }
    }

    async fn on_presence(&self, peer_id: &str) {
        if self.inner.links.read().await.contains_key(peer_id) {
            return;
        }
        tracing::debug!(%peer_id, "discovered peer, offering");

        let link = match self.open_link(peer_id, LinkRole::Offerer).await {
            Ok(link) => link,
            Err(error) => {
                tracing::warn!(%peer_id, %error, "could not create link");
                return;
            }
        };
        let offer = match link.start_offer().await {
            Ok(offer) => offer,
            Err(error) => {
                tracing::warn!(%peer_id, %error, "offer failed");
                self.remove_link(peer_id, Some(&link), "offer failed").await;
                return;
            }
        };
        if let Err(error) = self.send_description(peer_id, offer).await {
            tracing::warn!(%peer_id, %error, "offer not delivered");
            self.remove_link(peer_id, Some(&link), "offer not delivered")
                .await;
        }
    }

    async fn on_description(&self, peer_id: &str, mut description: SessionDescription) {
        if let Some(cipher) = &self.inner.cipher {
            match cipher.open(&description.sdp) {
                Ok(sdp) => description.sdp = sdp,
                Err(error) => {
                    tracing::warn!(%peer_id, %error, "description failed to open, ignoring");
                    return;
                }
            }
        }

        let existing = self.link(peer_id).await;
        let link = match (description.kind, existing) {
            (SdpKind::Offer, Some(ours)) if ours.role() == LinkRole::Offerer => {
                // glare: the smaller id keeps its offer
                if self.inner.self_id.as_str() < peer_id {
                    tracing::debug!(%peer_id, "glare, keeping our offer");
                    return;
                }
                tracing::debug!(%peer_id, "glare, yielding to remote offer");
                self.remove_link(peer_id, Some(&ours), "glare").await;
                match self.open_link(peer_id, LinkRole::Answerer).await {
                    Ok(link) => link,
                    Err(error) => {
                        tracing::warn!(%peer_id, %error, "could not create link");
                        return;
                    }
                }
            }
            (SdpKind::Offer, None) => match self.open_link(peer_id, LinkRole::Answerer).await {
                Ok(link) => link,
                Err(error) => {
                    tracing::warn!(%peer_id, %error, "could not create link");
                    return;
                }
            },
            (_, Some(link)) => link,
            (kind, None) => {
                tracing::debug!(%peer_id, ?kind, "description for unknown peer ignored");
                return;
            }
        };

        match link.signal(Signal::Description(description)).await {
            Ok(Some(answer)) => {
                if let Err(error) = self.send_description(peer_id, answer).await {
                    tracing::warn!(%peer_id, %error, "answer not delivered");
                }
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(%peer_id, %error, "negotiation failed");
                self.remove_link(peer_id, Some(&link), "negotiation failed")
                    .await;
            }
        }
    }

    async fn on_candidate(&self, peer_id: &str, candidate: IceCandidate) {
        let Some(link) = self.link(peer_id).await else {
            tracing::debug!(%peer_id, "candidate for unknown peer ignored");
            return;
        };
        if let Err(error) = link.signal(Signal::Candidate(candidate)).await {
            tracing::debug!(%peer_id, %error, "candidate not applied");
        }
    }

    /// Create a link and start pumping its connection events. The link is in
    /// the map before anything is sent to the peer.
    async fn open_link(&self, peer_id: &str, role: LinkRole) -> Result<Arc<PeerLink>, RoomError> {
        let scope = LinkScope {
            local_id: self.inner.self_id.clone(),
            remote_id: peer_id.to_string(),
            room_topic: self.inner.topic.clone(),
            rtc: self.inner.config.rtc_config.clone(),
        };
        let handle = self.inner.connector.connect(scope).await?;
        let link = Arc::new(PeerLink::new(peer_id, role, handle.connection));
        self.inner
            .links
            .write()
            .await
            .insert(peer_id.to_string(), link.clone());

        let weak = Arc::downgrade(&self.inner);
        let span = self.inner.span.clone();
        let pump = tokio::spawn(
            link_pump(weak.clone(), link.clone(), handle.events).instrument(span.clone()),
        );
        let timeout = self.inner.config.negotiation_timeout();
        let deadline =
            tokio::spawn(negotiation_deadline(weak, link.clone(), timeout).instrument(span));

        let previous = self
            .inner
            .link_tasks
            .lock()
            .insert(peer_id.to_string(), LinkTasks { pump, deadline });
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(link)
    }

    /// Remove and destroy a peer's link, firing leave semantics if the peer
    /// had joined. With `only`, nothing happens unless that exact link is
    /// still the current one.
    async fn remove_link(&self, peer_id: &str, only: Option<&Arc<PeerLink>>, reason: &str) -> bool {
        let link = {
            let mut links = self.inner.links.write().await;
            let current = links.get(peer_id).cloned();
            match (current, only) {
                (None, _) => return false,
                (Some(current), Some(expected)) if !Arc::ptr_eq(&current, expected) => return false,
                _ => {}
            }
            links.remove(peer_id)
        };
        let Some(link) = link else {
            return false;
        };

        link.destroy().await;
        self.inner.reassembler.lock().forget_peer(peer_id);
        let was_joined = self.inner.joined.lock().remove(peer_id);
        tracing::debug!(%peer_id, reason, "link removed");
        if was_joined {
            self.peer_left(peer_id);
        }

        // last: the caller may be one of these tasks
        let tasks = self.inner.link_tasks.lock().remove(peer_id);
        if let Some(tasks) = tasks {
            tasks.abort();
        }
        true
    }

    fn peer_left(&self, peer_id: &str) {
        tracing::info!(%peer_id, "peer left");
        self.inner.bus.emit(Event::PeerLeft {
            room_id: self.inner.key.room_id.clone(),
            peer_id: peer_id.to_string(),
        });
        let handler = self.inner.callbacks.lock().peer_leave.clone();
        if let Some(handler) = handler {
            handler(peer_id);
        }
    }

    // -----------------------------------------------------------------------
    // Link events
    // -----------------------------------------------------------------------

    async fn on_channel_open(&self, link: &Arc<PeerLink>) {
        if let Err(error) = link.mark_channel_open().await {
            tracing::debug!(peer_id = %link.peer_id(), %error, "channel open ignored");
            return;
        }
        let peer_id = link.peer_id();
        self.inner.joined.lock().insert(peer_id.to_string());
        let deadline = self
            .inner
            .link_tasks
            .lock()
            .get(peer_id)
            .map(|tasks| tasks.deadline.abort_handle());
        if let Some(deadline) = deadline {
            deadline.abort();
        }

        tracing::info!(%peer_id, role = ?link.role(), "peer joined");
        self.inner.bus.emit(Event::ChannelEstablished {
            from: self.inner.self_id.clone(),
            to: peer_id.to_string(),
        });
        self.inner.bus.emit(Event::PeerJoined {
            room_id: self.inner.key.room_id.clone(),
            peer_id: peer_id.to_string(),
        });
        let handler = self.inner.callbacks.lock().peer_join.clone();
        if let Some(handler) = handler {
            handler(peer_id);
        }

        let streams = self.inner.local_streams.lock().clone();
        for stream in streams {
            let notice = MediaNotice::AddStream { stream };
            if let Err(error) = self.send_media(&notice, Target::Peer(peer_id.to_string())).await {
                tracing::debug!(%peer_id, %error, "stream announcement to new peer failed");
            }
        }
    }

    async fn on_frame(&self, peer_id: &str, frame: &[u8]) {
        let envelope = match decode_frame(frame) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::debug!(%peer_id, %error, "undecodable frame dropped");
                return;
            }
        };
        if envelope.from != peer_id {
            tracing::debug!(%peer_id, claimed = %envelope.from, "frame sender mismatch, dropped");
            return;
        }
        if envelope
            .target
            .as_deref()
            .is_some_and(|target| target != self.inner.self_id)
        {
            return;
        }

        let message = self.inner.reassembler.lock().push(peer_id, envelope);
        let Some(message) = message else {
            return;
        };

        match message.action.as_str() {
            PING_ACTION => {
                let target = Target::Peer(peer_id.to_string());
                if let Err(error) = self.send_raw(PONG_ACTION, &message.data, target).await {
                    tracing::debug!(%peer_id, %error, "pong not sent");
                }
            }
            PONG_ACTION => {
                let Ok(nonce) = String::from_utf8(message.data) else {
                    return;
                };
                let waiter = self.inner.pings.lock().remove(&nonce);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(());
                }
            }
            MEDIA_ACTION => self.on_media(peer_id, &message.data),
            action => {
                let handler = self
                    .inner
                    .actions
                    .lock()
                    .get(action)
                    .and_then(|slot| slot.handler.clone());
                match handler {
                    Some(handler) => handler(&message.data, peer_id),
                    None => tracing::trace!(%peer_id, %action, "no receiver for action"),
                }
            }
        }
    }

    fn on_media(&self, peer_id: &str, data: &[u8]) {
        let notice: MediaNotice = match serde_json::from_slice(data) {
            Ok(notice) => notice,
            Err(error) => {
                tracing::debug!(%peer_id, %error, "malformed media notice dropped");
                return;
            }
        };
        let room_id = self.inner.key.room_id.clone();
        match notice {
            MediaNotice::AddStream { stream } => {
                self.inner.bus.emit(Event::StreamAdded {
                    room_id,
                    peer_id: peer_id.to_string(),
                    stream_id: stream.id.clone(),
                });
                let handler = self.inner.callbacks.lock().peer_stream.clone();
                if let Some(handler) = handler {
                    handler(peer_id, &stream);
                }
            }
            MediaNotice::AddTrack { stream, track } => {
                self.inner.bus.emit(Event::TrackAdded {
                    room_id,
                    peer_id: peer_id.to_string(),
                    track_id: track.id.clone(),
                });
                let handler = self.inner.callbacks.lock().peer_track.clone();
                if let Some(handler) = handler {
                    handler(peer_id, &track, &stream);
                }
            }
            MediaNotice::RemoveStream { stream_id } => {
                tracing::debug!(%peer_id, %stream_id, "peer removed stream");
            }
            MediaNotice::RemoveTrack {
                stream_id,
                track_id,
            } => {
                tracing::debug!(%peer_id, %stream_id, %track_id, "peer removed track");
            }
        }
    }
}

async fn signal_pump(room: Weak<RoomInner>, mut broadcast: Subscription, mut inbox: Subscription) {
    loop {
        let payload = tokio::select! {
            Some(payload) = broadcast.recv() => payload,
            Some(payload) = inbox.recv() => payload,
            else => break,
        };
        let Some(inner) = room.upgrade() else {
            break;
        };
        Room { inner }.handle_signal(&payload).await;
    }
    tracing::debug!("signal pump stopped");
}

async fn announce_loop(room: Weak<RoomInner>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately; presence went out on join
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = room.upgrade() else {
            break;
        };
        let room = Room { inner };
        let presence = SignalMessage::Presence {
            from: room.inner.self_id.clone(),
        };
        if let Err(error) = room.announce(&presence).await {
            tracing::warn!(%error, "presence re-announce failed");
        }
    }
}

async fn link_pump(
    room: Weak<RoomInner>,
    link: Arc<PeerLink>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = room.upgrade() else {
            return;
        };
        let room = Room { inner };
        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                let message = SignalMessage::Candidate {
                    from: room.inner.self_id.clone(),
                    to: link.peer_id().to_string(),
                    candidate,
                };
                if let Err(error) = room.send_signal(link.peer_id(), &message).await {
                    tracing::debug!(peer_id = %link.peer_id(), %error, "candidate not delivered");
                }
            }
            ConnectionEvent::ChannelOpen => room.on_channel_open(&link).await,
            ConnectionEvent::Data(frame) => room.on_frame(link.peer_id(), &frame).await,
            ConnectionEvent::Closed => {
                room.remove_link(link.peer_id(), Some(&link), "remote closed the connection")
                    .await;
                return;
            }
            ConnectionEvent::Failed(reason) => {
                tracing::warn!(peer_id = %link.peer_id(), %reason, "connection failed");
                room.remove_link(link.peer_id(), Some(&link), "connection failed")
                    .await;
                return;
            }
        }
    }
}

async fn negotiation_deadline(room: Weak<RoomInner>, link: Arc<PeerLink>, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if link.state().await == LinkState::Open {
        return;
    }
    let Some(inner) = room.upgrade() else {
        return;
    };
    tracing::warn!(peer_id = %link.peer_id(), ?timeout, "negotiation timed out");
    Room { inner }
        .remove_link(link.peer_id(), Some(&link), "negotiation timed out")
        .await;
}

/// A typed handle to one named action of a room.
pub struct Action<T, C = JsonCodec> {
    room: Room,
    name: String,
    codec: Arc<C>,
    _value: PhantomData<fn() -> T>,
}

impl<T, C> Clone for Action<T, C> {
    fn clone(&self) -> Self {
        Self {
            room: self.room.clone(),
            name: self.name.clone(),
            codec: self.codec.clone(),
            _value: PhantomData,
        }
    }
}

impl<T, C> Action<T, C>
where
    T: Send + Sync + 'static,
    C: Codec<T>,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send(&self, value: &T, target: Target) -> Result<(), RoomError> {
        let bytes = self.codec.encode(value)?;
        self.room.send_raw(&self.name, &bytes, target).await
    }

    /// Set the receive callback, replacing any earlier one for this name.
    /// Payloads that fail to decode are logged and dropped.
    pub fn on_receive<F>(&self, callback: F)
    where
        F: Fn(T, &str) + Send + Sync + 'static,
    {
        let codec = self.codec.clone();
        let name = self.name.clone();
        let handler: RawHandler = Arc::new(move |bytes: &[u8], from: &str| {
            match codec.decode(bytes) {
                Ok(value) => callback(value, from),
                Err(error) => {
                    tracing::warn!(action = %name, peer_id = %from, %error, "undecodable action payload dropped")
                }
            }
        });
        self.room
            .inner
            .actions
            .lock()
            .entry(self.name.clone())
            .or_default()
            .handler = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RoomRegistry;
    use crate::relay::{BrokerTransport, MemoryBroker};

    const REMOTE_OFFER_SDP: &str = "v=0\r\ns=howlmesh\r\na=tunnel:remote-session\r\n";

    async fn joined(broker: &MemoryBroker, peer_id: &str) -> Room {
        let transport = Arc::new(BrokerTransport::new(broker.clone(), EventBus::default()));
        RoomRegistry::with_peer_id(
            peer_id,
            transport,
            MeshConfig::with_app_id("room-tests"),
            EventBus::default(),
        )
        .join("arena")
        .await
        .unwrap()
    }

    fn presence(from: &str) -> String {
        SignalMessage::Presence { from: from.into() }
            .encode()
            .unwrap()
    }

    fn remote_offer(from: &str, to: &str) -> String {
        SignalMessage::Description {
            from: from.into(),
            to: to.into(),
            description: SessionDescription::offer(REMOTE_OFFER_SDP),
        }
        .encode()
        .unwrap()
    }

    async fn next_description(inbox: &mut mpsc::UnboundedReceiver<String>) -> SessionDescription {
        loop {
            let raw = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
                .await
                .unwrap()
                .unwrap();
            if let Ok(SignalMessage::Description { description, .. }) = SignalMessage::decode(&raw) {
                return description;
            }
        }
    }

    #[tokio::test]
    async fn action_names_are_checked_and_shared() {
        let room = joined(&MemoryBroker::new(), "peer-a").await;
        assert!(matches!(
            room.make_action::<u8>(""),
            Err(RoomError::InvalidActionName(_))
        ));
        assert!(room.make_action::<u8>("__ping").is_err());
        assert!(room.make_action::<u8>(&"x".repeat(33)).is_err());

        let first = room.make_action::<u8>("move").unwrap();
        let second = room.make_action::<u8>("move").unwrap();
        assert_eq!(first.name(), second.name());
        assert_eq!(room.inner.actions.lock().len(), 1);
    }

    #[tokio::test]
    async fn presence_gets_an_offer() {
        let broker = MemoryBroker::new();
        let room = joined(&broker, "peer-a").await;
        let mut inbox = broker.subscribe(&inbox_topic(room.topic(), "peer-b")).await;

        room.handle_signal(&presence("peer-b")).await;
        assert_eq!(next_description(&mut inbox).await.kind, SdpKind::Offer);

        let link = room.link("peer-b").await.unwrap();
        assert_eq!(link.role(), LinkRole::Offerer);
        assert_eq!(link.state().await, LinkState::Negotiating);
        assert!(room.get_peers().await.is_empty());

        room.handle_signal(&presence("peer-b")).await;
        assert!(Arc::ptr_eq(&link, &room.link("peer-b").await.unwrap()));
    }

    #[tokio::test]
    async fn glare_smaller_id_keeps_its_offer() {
        let low = joined(&MemoryBroker::new(), "peer-a").await;
        low.handle_signal(&presence("peer-b")).await;
        let ours = low.link("peer-b").await.unwrap();

        low.handle_signal(&remote_offer("peer-b", "peer-a")).await;
        let kept = low.link("peer-b").await.unwrap();
        assert!(Arc::ptr_eq(&ours, &kept));
        assert_eq!(kept.role(), LinkRole::Offerer);
    }

    #[tokio::test]
    async fn glare_larger_id_yields_and_answers() {
        let broker = MemoryBroker::new();
        let high = joined(&broker, "peer-c").await;
        let mut inbox = broker.subscribe(&inbox_topic(high.topic(), "peer-b")).await;

        high.handle_signal(&presence("peer-b")).await;
        assert_eq!(next_description(&mut inbox).await.kind, SdpKind::Offer);

        high.handle_signal(&remote_offer("peer-b", "peer-c")).await;
        let link = high.link("peer-b").await.unwrap();
        assert_eq!(link.role(), LinkRole::Answerer);
        assert_eq!(next_description(&mut inbox).await.kind, SdpKind::Answer);
    }

    #[tokio::test]
    async fn own_and_misaddressed_signals_are_ignored() {
        let room = joined(&MemoryBroker::new(), "peer-a").await;
        room.handle_signal(&presence("peer-a")).await;
        room.handle_signal(&remote_offer("peer-b", "peer-z")).await;
        room.handle_signal("not json").await;
        assert!(room.inner.links.read().await.is_empty());
    }

    #[tokio::test]
    async fn remote_leave_drops_the_link_quietly() {
        let room = joined(&MemoryBroker::new(), "peer-a").await;
        let left = Arc::new(AtomicU64::new(0));
        {
            let left = left.clone();
            room.on_peer_leave(move |_| {
                left.fetch_add(1, Ordering::SeqCst);
            });
        }

        room.handle_signal(&presence("peer-b")).await;
        assert!(room.link("peer-b").await.is_some());

        let leave = SignalMessage::Leave {
            from: "peer-b".into(),
        };
        room.handle_signal(&leave.encode().unwrap()).await;
        assert!(room.link("peer-b").await.is_none());
        // never joined, so no leave callback
        assert_eq!(left.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn leave_is_idempotent_and_final() {
        let room = joined(&MemoryBroker::new(), "peer-a").await;
        room.handle_signal(&presence("peer-b")).await;

        room.leave().await;
        room.leave().await;
        assert!(room.is_left());
        assert!(room.inner.links.read().await.is_empty());
        assert!(room.inner.tasks.lock().is_empty());

        let action = room.make_action::<u8>("move").unwrap();
        assert!(matches!(action.send(&1, Target::All).await, Err(RoomError::Left)));
        assert!(matches!(room.ping("peer-b").await, Err(RoomError::Left)));
    }

    #[test]
    fn key_display() {
        assert_eq!(RoomKey::new("app", "arena").to_string(), "app/arena");
    }
}
