use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::connection::PeerConnection;
use crate::signal::{IceCandidate, SdpKind, SessionDescription, Signal};
use crate::transport::TransportError;

/// Where a link is in its lifecycle. Only moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Negotiating,
    Open,
    Closed,
}

impl LinkState {
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Connecting, Negotiating)
                | (Connecting, Closed)
                | (Negotiating, Open)
                | (Negotiating, Closed)
                | (Open, Closed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Connecting => "connecting",
            LinkState::Negotiating => "negotiating",
            LinkState::Open => "open",
            LinkState::Closed => "closed",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the offer/answer exchange this link plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRole {
    Offerer,
    Answerer,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("channel to {peer_id} is not open (state {state}, channel ready: {channel_ready})")]
    ChannelNotOpen {
        peer_id: String,
        state: LinkState,
        channel_ready: bool,
    },
    #[error("link to {0} is closed")]
    Closed(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid link transition {from} -> {to}")]
    InvalidTransition { from: LinkState, to: LinkState },
}

struct Negotiation {
    state: LinkState,
    channel_ready: bool,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
}

impl Negotiation {
    fn transition(&mut self, next: LinkState) -> Result<(), LinkError> {
        if !self.state.can_transition_to(next) {
            return Err(LinkError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// One negotiated connection plus its data channel to exactly one remote peer.
///
/// Remote candidates that arrive before the remote description are queued and
/// applied in arrival order once it is set.
pub struct PeerLink {
    peer_id: String,
    role: LinkRole,
    created_at: DateTime<Utc>,
    connection: Arc<dyn PeerConnection>,
    negotiation: Mutex<Negotiation>,
    dead: AtomicBool,
}

impl PeerLink {
    pub fn new(peer_id: &str, role: LinkRole, connection: Arc<dyn PeerConnection>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            role,
            created_at: Utc::now(),
            connection,
            negotiation: Mutex::new(Negotiation {
                state: LinkState::Connecting,
                channel_ready: false,
                remote_description_set: false,
                pending_candidates: VecDeque::new(),
            }),
            dead: AtomicBool::new(false),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn state(&self) -> LinkState {
        self.negotiation.lock().await.state
    }

    pub async fn channel_ready(&self) -> bool {
        self.negotiation.lock().await.channel_ready
    }

    pub async fn pending_candidates(&self) -> usize {
        self.negotiation.lock().await.pending_candidates.len()
    }

    pub fn is_closed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Create the local offer. Only valid for an offerer that has not started.
    pub async fn start_offer(&self) -> Result<SessionDescription, LinkError> {
        let mut negotiation = self.negotiation.lock().await;
        if self.is_closed() {
            return Err(LinkError::Closed(self.peer_id.clone()));
        }
        if self.role != LinkRole::Offerer || negotiation.state != LinkState::Connecting {
            return Err(LinkError::InvalidTransition {
                from: negotiation.state,
                to: LinkState::Negotiating,
            });
        }

        match self.connection.create_offer().await {
            Ok(offer) => {
                negotiation.transition(LinkState::Negotiating)?;
                Ok(offer)
            }
            Err(error) => {
                drop(negotiation);
                self.fail(&error).await;
                Err(error)
            }
        }
    }

    /// Feed a remote description or candidate into the link.
    ///
    /// Returns the local answer when `signal` was an offer. Offers in the
    /// wrong state, unexpected answers and unsupported description kinds are
    /// logged and ignored.
    pub async fn signal(&self, signal: Signal) -> Result<Option<SessionDescription>, LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed(self.peer_id.clone()));
        }
        match signal {
            Signal::Description(description) => self.apply_description(description).await,
            Signal::Candidate(candidate) => {
                self.apply_candidate(candidate).await;
                Ok(None)
            }
        }
    }

    async fn apply_description(
        &self,
        description: SessionDescription,
    ) -> Result<Option<SessionDescription>, LinkError> {
        let mut negotiation = self.negotiation.lock().await;

        match description.kind {
            SdpKind::Offer => {
                if self.role != LinkRole::Answerer || negotiation.state != LinkState::Connecting {
                    tracing::debug!(
                        peer_id = %self.peer_id,
                        state = %negotiation.state,
                        "ignoring offer in wrong state"
                    );
                    return Ok(None);
                }
                let answer = match self.connection.accept_offer(&description).await {
                    Ok(answer) => answer,
                    Err(error) => {
                        drop(negotiation);
                        self.fail(&error).await;
                        return Err(error);
                    }
                };
                negotiation.transition(LinkState::Negotiating)?;
                negotiation.remote_description_set = true;
                self.flush_candidates(&mut negotiation).await;
                Ok(Some(answer))
            }
            SdpKind::Answer => {
                if self.role != LinkRole::Offerer
                    || negotiation.state != LinkState::Negotiating
                    || negotiation.remote_description_set
                {
                    tracing::debug!(
                        peer_id = %self.peer_id,
                        state = %negotiation.state,
                        "ignoring unexpected answer"
                    );
                    return Ok(None);
                }
                if let Err(error) = self.connection.accept_answer(&description).await {
                    drop(negotiation);
                    self.fail(&error).await;
                    return Err(error);
                }
                negotiation.remote_description_set = true;
                self.flush_candidates(&mut negotiation).await;
                Ok(None)
            }
            SdpKind::Pranswer | SdpKind::Rollback => {
                tracing::warn!(
                    peer_id = %self.peer_id,
                    kind = ?description.kind,
                    "unsupported description kind ignored"
                );
                Ok(None)
            }
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        let mut negotiation = self.negotiation.lock().await;
        if !negotiation.remote_description_set {
            negotiation.pending_candidates.push_back(candidate);
            return;
        }
        if let Err(error) = self.connection.add_candidate(&candidate).await {
            tracing::warn!(peer_id = %self.peer_id, %error, "remote candidate rejected");
        }
    }

    async fn flush_candidates(&self, negotiation: &mut Negotiation) {
        while let Some(candidate) = negotiation.pending_candidates.pop_front() {
            if let Err(error) = self.connection.add_candidate(&candidate).await {
                tracing::warn!(peer_id = %self.peer_id, %error, "queued candidate rejected");
            }
        }
    }

    /// The data channel reported open.
    pub async fn mark_channel_open(&self) -> Result<(), LinkError> {
        let mut negotiation = self.negotiation.lock().await;
        negotiation.transition(LinkState::Open)?;
        negotiation.channel_ready = true;
        tracing::debug!(peer_id = %self.peer_id, role = ?self.role, "link open");
        Ok(())
    }

    /// Write one message to the data channel. Nothing is written unless the
    /// channel is ready.
    pub async fn send_data(&self, data: &[u8]) -> Result<(), LinkError> {
        {
            let negotiation = self.negotiation.lock().await;
            if !negotiation.channel_ready || self.is_closed() {
                return Err(LinkError::ChannelNotOpen {
                    peer_id: self.peer_id.clone(),
                    state: negotiation.state,
                    channel_ready: negotiation.channel_ready,
                });
            }
        }
        self.connection.send(data).await
    }

    /// Close the link and release its connection. Safe to call repeatedly.
    pub async fn destroy(&self) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut negotiation = self.negotiation.lock().await;
            negotiation.state = LinkState::Closed;
            negotiation.channel_ready = false;
            negotiation.pending_candidates.clear();
        }
        self.connection.close().await;
        tracing::debug!(peer_id = %self.peer_id, "link destroyed");
    }

    async fn fail(&self, error: &LinkError) {
        tracing::warn!(peer_id = %self.peer_id, %error, "connection failed during negotiation");
        self.destroy().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingConnection {
        calls: parking_lot::Mutex<Vec<String>>,
        fail_offer: bool,
    }

    impl RecordingConnection {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }
    }

    #[async_trait]
    impl PeerConnection for RecordingConnection {
        async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
            self.record("create_offer");
            Ok(SessionDescription::offer("local-offer"))
        }

        async fn accept_offer(
            &self,
            offer: &SessionDescription,
        ) -> Result<SessionDescription, LinkError> {
            self.record(format!("accept_offer:{}", offer.sdp));
            if self.fail_offer {
                return Err(LinkError::Negotiation("bad offer".into()));
            }
            Ok(SessionDescription::answer("local-answer"))
        }

        async fn accept_answer(&self, answer: &SessionDescription) -> Result<(), LinkError> {
            self.record(format!("accept_answer:{}", answer.sdp));
            Ok(())
        }

        async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), LinkError> {
            self.record(format!("candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn send(&self, data: &[u8]) -> Result<(), LinkError> {
            self.record(format!("send:{}", data.len()));
            Ok(())
        }

        async fn close(&self) {
            self.record("close");
        }
    }

    fn candidate(name: &str) -> Signal {
        Signal::Candidate(IceCandidate {
            candidate: name.into(),
            sdp_mid: None,
            sdp_m_line_index: 0,
        })
    }

    fn link(role: LinkRole) -> (PeerLink, Arc<RecordingConnection>) {
        let connection = Arc::new(RecordingConnection::default());
        (PeerLink::new("peer-b", role, connection.clone()), connection)
    }

    #[test]
    fn transition_table_is_monotonic() {
        use LinkState::*;
        assert!(Connecting.can_transition_to(Negotiating));
        assert!(Negotiating.can_transition_to(Open));
        assert!(Open.can_transition_to(Closed));
        assert!(Connecting.can_transition_to(Closed));
        assert!(!Open.can_transition_to(Negotiating));
        assert!(!Connecting.can_transition_to(Open));
        for next in [Connecting, Negotiating, Open, Closed] {
            assert!(!Closed.can_transition_to(next));
        }
    }

    #[tokio::test]
    async fn send_on_unopened_link_fails_without_writing() {
        let (link, connection) = link(LinkRole::Answerer);
        match link.send_data(b"hello").await {
            Err(LinkError::ChannelNotOpen {
                peer_id,
                state,
                channel_ready,
            }) => {
                assert_eq!(peer_id, "peer-b");
                assert_eq!(state, LinkState::Connecting);
                assert!(!channel_ready);
            }
            other => panic!("expected ChannelNotOpen, got {other:?}"),
        }
        assert!(connection.calls().is_empty());
    }

    #[tokio::test]
    async fn answerer_flow_buffers_candidates_until_offer() {
        let (link, connection) = link(LinkRole::Answerer);
        link.signal(candidate("c1")).await.unwrap();
        link.signal(candidate("c2")).await.unwrap();
        assert_eq!(link.pending_candidates().await, 2);

        let answer = link
            .signal(Signal::Description(SessionDescription::offer("remote-offer")))
            .await
            .unwrap()
            .expect("offer yields an answer");
        assert_eq!(answer.kind, SdpKind::Answer);
        assert_eq!(link.state().await, LinkState::Negotiating);
        assert_eq!(link.pending_candidates().await, 0);

        link.signal(candidate("c3")).await.unwrap();
        assert_eq!(
            connection.calls(),
            vec![
                "accept_offer:remote-offer",
                "candidate:c1",
                "candidate:c2",
                "candidate:c3"
            ]
        );

        link.mark_channel_open().await.unwrap();
        assert!(link.channel_ready().await);
        link.send_data(b"hello").await.unwrap();
        assert_eq!(connection.calls().last().map(String::as_str), Some("send:5"));
    }

    #[tokio::test]
    async fn offerer_flow_completes_on_answer() {
        let (link, connection) = link(LinkRole::Offerer);
        let offer = link.start_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert_eq!(link.state().await, LinkState::Negotiating);

        link.signal(Signal::Description(SessionDescription::answer("remote-answer")))
            .await
            .unwrap();
        // a second answer is ignored
        link.signal(Signal::Description(SessionDescription::answer("again")))
            .await
            .unwrap();
        assert_eq!(
            connection.calls(),
            vec!["create_offer", "accept_answer:remote-answer"]
        );
    }

    #[tokio::test]
    async fn unexpected_descriptions_are_ignored() {
        let (offerer, offerer_conn) = link(LinkRole::Offerer);
        // an offerer does not accept offers
        let out = offerer
            .signal(Signal::Description(SessionDescription::offer("x")))
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(offerer.state().await, LinkState::Connecting);

        let pranswer = SessionDescription {
            kind: SdpKind::Pranswer,
            sdp: "p".into(),
        };
        offerer.signal(Signal::Description(pranswer)).await.unwrap();
        assert!(offerer_conn.calls().is_empty());

        let (answerer, _) = link(LinkRole::Answerer);
        answerer
            .signal(Signal::Description(SessionDescription::answer("early")))
            .await
            .unwrap();
        assert_eq!(answerer.state().await, LinkState::Connecting);
    }

    #[tokio::test]
    async fn negotiation_failure_closes_the_link() {
        let connection = Arc::new(RecordingConnection {
            fail_offer: true,
            ..Default::default()
        });
        let link = PeerLink::new("peer-b", LinkRole::Answerer, connection.clone());
        let result = link
            .signal(Signal::Description(SessionDescription::offer("broken")))
            .await;
        assert!(matches!(result, Err(LinkError::Negotiation(_))));
        assert!(link.is_closed());
        assert_eq!(link.state().await, LinkState::Closed);
        assert_eq!(connection.calls().last().map(String::as_str), Some("close"));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let (link, connection) = link(LinkRole::Offerer);
        link.start_offer().await.unwrap();
        link.destroy().await;
        link.destroy().await;

        assert!(link.is_closed());
        assert_eq!(link.state().await, LinkState::Closed);
        let closes = connection.calls().iter().filter(|c| *c == "close").count();
        assert_eq!(closes, 1);
        assert!(link.send_data(b"x").await.is_err());
        assert!(matches!(
            link.signal(candidate("late")).await,
            Err(LinkError::Closed(_))
        ));
        assert!(link.mark_channel_open().await.is_err());
    }
}
