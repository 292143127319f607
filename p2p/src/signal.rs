use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of a session description, mirroring the browser `RTCSdpType`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// A session description produced by one side of a negotiation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate for NAT traversal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: u32,
}

/// Rendezvous and negotiation messages exchanged over a signaling transport.
///
/// `Presence` and `Leave` go to the room topic; descriptions and candidates go
/// to the target peer's inbox topic.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Presence {
        from: String,
    },
    Description {
        from: String,
        to: String,
        description: SessionDescription,
    },
    Candidate {
        from: String,
        to: String,
        candidate: IceCandidate,
    },
    Leave {
        from: String,
    },
}

impl SignalMessage {
    pub fn encode(&self) -> Result<String, SignalError> {
        serde_json::to_string(self).map_err(SignalError::Encode)
    }

    pub fn decode(payload: &str) -> Result<Self, SignalError> {
        serde_json::from_str(payload).map_err(SignalError::Malformed)
    }
}

/// What a `PeerLink` accepts from the remote side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("malformed signaling message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("failed to encode signaling message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Helper: extract the target peer id from a signal message.
pub fn signal_target(msg: &SignalMessage) -> Option<&str> {
    match msg {
        SignalMessage::Description { to, .. } | SignalMessage::Candidate { to, .. } => Some(to),
        SignalMessage::Presence { .. } | SignalMessage::Leave { .. } => None,
    }
}

/// Helper: extract the source peer id from a signal message.
pub fn signal_source(msg: &SignalMessage) -> &str {
    match msg {
        SignalMessage::Presence { from }
        | SignalMessage::Leave { from }
        | SignalMessage::Description { from, .. }
        | SignalMessage::Candidate { from, .. } => from,
    }
}
