use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::RtcConfig;
use crate::link::LinkError;
use crate::signal::{IceCandidate, SessionDescription};
use crate::transport::{SignalingTransport, Subscription};

/// Things a connection reports asynchronously to the link that owns it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A local candidate to trickle to the remote peer.
    LocalCandidate(IceCandidate),
    /// The application data channel is ready for `send`.
    ChannelOpen,
    /// One message from the remote side of the data channel.
    Data(Vec<u8>),
    /// The remote side closed the connection.
    Closed,
    /// The connection failed and will not recover.
    Failed(String),
}

/// A single connection to one remote peer carrying one reliable, ordered
/// data channel.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError>;

    /// Apply a remote offer and produce the local answer.
    async fn accept_offer(&self, offer: &SessionDescription)
        -> Result<SessionDescription, LinkError>;

    async fn accept_answer(&self, answer: &SessionDescription) -> Result<(), LinkError>;

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), LinkError>;

    async fn send(&self, data: &[u8]) -> Result<(), LinkError>;

    /// Close the connection. Safe to call more than once.
    async fn close(&self);
}

/// A freshly created connection and the stream of its events.
pub struct ConnectionHandle {
    pub connection: Arc<dyn PeerConnection>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// Who a connection is between, and how it should negotiate.
#[derive(Clone, Debug)]
pub struct LinkScope {
    pub local_id: String,
    pub remote_id: String,
    pub room_topic: String,
    pub rtc: RtcConfig,
}

/// Creates connections for a room.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, scope: LinkScope) -> Result<ConnectionHandle, LinkError>;
}

// ---------------------------------------------------------------------------
// Relay-tunnelled data channel
// ---------------------------------------------------------------------------

const TUNNEL_ATTRIBUTE: &str = "a=tunnel:";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FrameKind {
    Open,
    Data,
    Close,
}

#[derive(Debug, Serialize, Deserialize)]
struct TunnelFrame {
    kind: FrameKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    data: String,
}

/// Builds [`TunnelConnection`]s over a signaling transport.
pub struct TunnelConnector {
    transport: Arc<dyn SignalingTransport>,
}

impl TunnelConnector {
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Connector for TunnelConnector {
    async fn connect(&self, scope: LinkScope) -> Result<ConnectionHandle, LinkError> {
        tracing::debug!(
            remote = %scope.remote_id,
            ice_servers = scope.rtc.ice_servers.len(),
            "creating tunnel connection"
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = TunnelConnection {
            transport: self.transport.clone(),
            scope,
            shared: Arc::new(TunnelShared {
                events: tx,
                opened: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            session: parking_lot::Mutex::new(None),
            reader: parking_lot::Mutex::new(None),
        };
        Ok(ConnectionHandle {
            connection: Arc::new(connection),
            events: rx,
        })
    }
}

struct TunnelShared {
    events: mpsc::UnboundedSender<ConnectionEvent>,
    opened: AtomicBool,
    closed: AtomicBool,
}

impl TunnelShared {
    fn emit(&self, event: ConnectionEvent) {
        // the link may already be gone
        let _ = self.events.send(event);
    }
}

/// A data channel carried over the signaling transport itself.
///
/// Each side writes frames to `{room}/tunnel/{session}/{own id}` and reads the
/// remote side's topic. The session id travels in the offer so both sides
/// agree on the topics; the offerer sends `open` once it has the answer.
pub struct TunnelConnection {
    transport: Arc<dyn SignalingTransport>,
    scope: LinkScope,
    shared: Arc<TunnelShared>,
    session: parking_lot::Mutex<Option<String>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TunnelConnection {
    fn topic(&self, session: &str, writer: &str) -> String {
        format!("{}/tunnel/{session}/{writer}", self.scope.room_topic)
    }

    fn session(&self) -> Result<String, LinkError> {
        self.session
            .lock()
            .clone()
            .ok_or_else(|| LinkError::Negotiation("tunnel session not negotiated".into()))
    }

    /// Subscribe to the remote side's frames and start the reader.
    async fn bind(&self, session: &str) -> Result<(), LinkError> {
        let inbound = self.topic(session, &self.scope.remote_id);
        let subscription = self.transport.subscribe(&inbound).await?;
        let reader = tokio::spawn(read_frames(subscription, self.shared.clone()));
        let previous = self.reader.lock().replace(reader);
        if let Some(previous) = previous {
            previous.abort();
        }
        *self.session.lock() = Some(session.to_string());

        self.shared.emit(ConnectionEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:tunnel 1 relay {session}"),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: 0,
        }));
        Ok(())
    }

    async fn write(&self, kind: FrameKind, data: &[u8]) -> Result<(), LinkError> {
        let session = self.session()?;
        let frame = TunnelFrame {
            kind,
            data: if data.is_empty() {
                String::new()
            } else {
                BASE64.encode(data)
            },
        };
        let payload = serde_json::to_string(&frame)
            .map_err(|e| LinkError::Negotiation(e.to_string()))?;
        let topic = self.topic(&session, &self.scope.local_id);
        self.transport.announce(&topic, &payload).await?;
        Ok(())
    }
}

fn tunnel_sdp(session: &str) -> String {
    format!("v=0\r\ns=howlmesh\r\n{TUNNEL_ATTRIBUTE}{session}\r\n")
}

fn parse_session(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix(TUNNEL_ATTRIBUTE))
        .filter(|session| !session.is_empty())
}

async fn read_frames(mut subscription: Subscription, shared: Arc<TunnelShared>) {
    while let Some(raw) = subscription.recv().await {
        let frame: TunnelFrame = match serde_json::from_str(&raw) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::debug!(%error, "dropping malformed tunnel frame");
                continue;
            }
        };
        match frame.kind {
            FrameKind::Open => {
                if !shared.opened.swap(true, Ordering::SeqCst) {
                    shared.emit(ConnectionEvent::ChannelOpen);
                }
            }
            FrameKind::Data => match BASE64.decode(frame.data.as_bytes()) {
                Ok(bytes) => shared.emit(ConnectionEvent::Data(bytes)),
                Err(error) => tracing::debug!(%error, "dropping undecodable tunnel frame"),
            },
            FrameKind::Close => {
                shared.closed.store(true, Ordering::SeqCst);
                shared.emit(ConnectionEvent::Closed);
                return;
            }
        }
    }

    if !shared.closed.load(Ordering::SeqCst) {
        shared.emit(ConnectionEvent::Failed("tunnel subscription ended".into()));
    }
}

#[async_trait]
impl PeerConnection for TunnelConnection {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        let session = Uuid::new_v4().simple().to_string();
        self.bind(&session).await?;
        Ok(SessionDescription::offer(tunnel_sdp(&session)))
    }

    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, LinkError> {
        let session = parse_session(&offer.sdp)
            .ok_or_else(|| LinkError::Negotiation("offer carries no tunnel session".into()))?
            .to_string();
        self.bind(&session).await?;
        Ok(SessionDescription::answer(tunnel_sdp(&session)))
    }

    async fn accept_answer(&self, answer: &SessionDescription) -> Result<(), LinkError> {
        let ours = self.session()?;
        match parse_session(&answer.sdp) {
            Some(theirs) if theirs == ours => {}
            _ => {
                return Err(LinkError::Negotiation(
                    "answer does not match the offered tunnel session".into(),
                ))
            }
        }
        self.write(FrameKind::Open, &[]).await?;
        if !self.shared.opened.swap(true, Ordering::SeqCst) {
            self.shared.emit(ConnectionEvent::ChannelOpen);
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), LinkError> {
        tracing::trace!(candidate = %candidate.candidate, "tunnel ignores remote candidate");
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), LinkError> {
        if self.shared.closed.load(Ordering::SeqCst) || !self.shared.opened.load(Ordering::SeqCst)
        {
            return Err(LinkError::Closed(self.scope.remote_id.clone()));
        }
        self.write(FrameKind::Data, data).await
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let negotiated = self.session.lock().is_some();
        if negotiated {
            if let Err(error) = self.write(FrameKind::Close, &[]).await {
                tracing::debug!(remote = %self.scope.remote_id, %error, "close frame not delivered");
            }
        }
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }
    }
}

impl Drop for TunnelConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::relay::{BrokerTransport, MemoryBroker};
    use std::time::Duration;

    async fn connector(broker: &MemoryBroker) -> TunnelConnector {
        let transport = BrokerTransport::new(broker.clone(), EventBus::default());
        transport.init().await.unwrap();
        TunnelConnector::new(Arc::new(transport))
    }

    fn scope(local: &str, remote: &str) -> LinkScope {
        LinkScope {
            local_id: local.into(),
            remote_id: remote.into(),
            room_topic: "howlmesh/test/abc".into(),
            rtc: RtcConfig::default(),
        }
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for connection event")
            .expect("event stream closed")
    }

    #[test]
    fn session_is_read_from_sdp() {
        assert_eq!(parse_session(&tunnel_sdp("abc123")), Some("abc123"));
        assert_eq!(parse_session("v=0\r\n"), None);
        assert_eq!(parse_session("a=tunnel:\r\n"), None);
    }

    #[tokio::test]
    async fn offer_answer_opens_both_sides_and_carries_data() {
        let broker = MemoryBroker::new();
        let mut alice = connector(&broker).await.connect(scope("alice", "bob")).await.unwrap();
        let mut bob = connector(&broker).await.connect(scope("bob", "alice")).await.unwrap();

        let offer = alice.connection.create_offer().await.unwrap();
        assert!(matches!(next(&mut alice.events).await, ConnectionEvent::LocalCandidate(_)));

        let answer = bob.connection.accept_offer(&offer).await.unwrap();
        assert!(matches!(next(&mut bob.events).await, ConnectionEvent::LocalCandidate(_)));

        alice.connection.accept_answer(&answer).await.unwrap();
        assert_eq!(next(&mut alice.events).await, ConnectionEvent::ChannelOpen);
        assert_eq!(next(&mut bob.events).await, ConnectionEvent::ChannelOpen);

        alice.connection.send(b"ping").await.unwrap();
        bob.connection.send(b"pong").await.unwrap();
        assert_eq!(next(&mut bob.events).await, ConnectionEvent::Data(b"ping".to_vec()));
        assert_eq!(next(&mut alice.events).await, ConnectionEvent::Data(b"pong".to_vec()));

        alice.connection.close().await;
        assert_eq!(next(&mut bob.events).await, ConnectionEvent::Closed);
        assert!(matches!(
            alice.connection.send(b"late").await,
            Err(LinkError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn send_before_open_is_rejected() {
        let broker = MemoryBroker::new();
        let alice = connector(&broker).await.connect(scope("alice", "bob")).await.unwrap();
        alice.connection.create_offer().await.unwrap();
        assert!(alice.connection.send(b"early").await.is_err());
    }

    #[tokio::test]
    async fn mismatched_answer_is_a_negotiation_error() {
        let broker = MemoryBroker::new();
        let alice = connector(&broker).await.connect(scope("alice", "bob")).await.unwrap();
        alice.connection.create_offer().await.unwrap();

        let bogus = SessionDescription::answer(tunnel_sdp("someone-else"));
        assert!(matches!(
            alice.connection.accept_answer(&bogus).await,
            Err(LinkError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn offer_without_session_is_rejected() {
        let broker = MemoryBroker::new();
        let bob = connector(&broker).await.connect(scope("bob", "alice")).await.unwrap();
        let offer = SessionDescription::offer("v=0\r\n");
        assert!(matches!(
            bob.connection.accept_offer(&offer).await,
            Err(LinkError::Negotiation(_))
        ));
    }
}
