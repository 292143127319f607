use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest slice of a payload carried by one frame.
pub const CHUNK_PAYLOAD_BYTES: usize = 8 * 1024;
/// Largest encoded frame written to a data channel.
pub const MAX_FRAME_BYTES: usize = 16 * 1024;
/// Largest payload a single action message may carry.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;
pub const MAX_ACTION_NAME_BYTES: usize = 32;
/// Action names starting with this are used by the room itself.
pub const RESERVED_PREFIX: &str = "__";

const MAX_PENDING_PER_PEER: usize = 8;
const ASSEMBLY_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("encoded frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),
}

/// Who an action is sent to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    All,
    AllExcept(String),
    Peer(String),
}

impl Target {
    pub fn includes(&self, peer_id: &str) -> bool {
        match self {
            Target::All => true,
            Target::AllExcept(excluded) => excluded != peer_id,
            Target::Peer(only) => only == peer_id,
        }
    }

    /// The single recipient, for unicast targets.
    pub fn unicast(&self) -> Option<&str> {
        match self {
            Target::Peer(peer_id) => Some(peer_id),
            Target::All | Target::AllExcept(_) => None,
        }
    }
}

/// Whether `name` may be registered by application code.
pub fn is_valid_action_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_ACTION_NAME_BYTES && !name.starts_with(RESERVED_PREFIX)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: u32,
    pub total: u32,
}

/// One frame of the action protocol as it travels over a data channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    pub action: String,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkInfo>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Split one action message into data-channel frames.
///
/// Payloads up to [`CHUNK_PAYLOAD_BYTES`] travel as a single frame; larger
/// ones are chunked and tagged with `seq` so the receiver can reassemble them.
pub fn encode_frames(
    action: &str,
    from: &str,
    target: Option<&str>,
    seq: u64,
    data: &[u8],
) -> Result<Vec<Vec<u8>>, CodecError> {
    if data.len() > MAX_MESSAGE_BYTES {
        return Err(CodecError::TooLarge {
            len: data.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }

    let envelope = |data: &[u8], seq: Option<u64>, chunk: Option<ChunkInfo>| ActionEnvelope {
        action: action.to_string(),
        from: from.to_string(),
        target: target.map(String::from),
        seq,
        chunk,
        data: data.to_vec(),
    };

    let envelopes = if data.len() <= CHUNK_PAYLOAD_BYTES {
        vec![envelope(data, None, None)]
    } else {
        let total = data.len().div_ceil(CHUNK_PAYLOAD_BYTES) as u32;
        data.chunks(CHUNK_PAYLOAD_BYTES)
            .enumerate()
            .map(|(index, part)| {
                envelope(
                    part,
                    Some(seq),
                    Some(ChunkInfo {
                        index: index as u32,
                        total,
                    }),
                )
            })
            .collect()
    };

    envelopes
        .iter()
        .map(|envelope| {
            let frame = serde_json::to_vec(envelope)?;
            if frame.len() > MAX_FRAME_BYTES {
                return Err(CodecError::FrameTooLarge(frame.len()));
            }
            Ok(frame)
        })
        .collect()
}

pub fn decode_frame(frame: &[u8]) -> Result<ActionEnvelope, CodecError> {
    Ok(serde_json::from_slice(frame)?)
}

struct Assembly {
    seq: u64,
    action: String,
    total: u32,
    parts: Vec<Option<Vec<u8>>>,
    received: u32,
    bytes: usize,
    started: Instant,
}

/// Rebuilds chunked messages per sending peer.
///
/// Each peer may have a bounded number of messages in flight; the oldest is
/// evicted when another starts. Stale assemblies expire, duplicate chunks are
/// ignored, and a chunk whose `total` disagrees with its assembly restarts it.
pub struct Reassembler {
    pending: HashMap<String, VecDeque<Assembly>>,
    max_pending: usize,
    ttl: Duration,
    max_bytes: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::with_limits(MAX_PENDING_PER_PEER, ASSEMBLY_TTL, MAX_MESSAGE_BYTES)
    }
}

impl Reassembler {
    pub fn with_limits(max_pending: usize, ttl: Duration, max_bytes: usize) -> Self {
        Self {
            pending: HashMap::new(),
            max_pending: max_pending.max(1),
            ttl,
            max_bytes,
        }
    }

    /// Feed one frame from `peer_id`. Returns the whole message once every
    /// chunk has arrived; unchunked frames pass straight through.
    pub fn push(&mut self, peer_id: &str, envelope: ActionEnvelope) -> Option<ActionEnvelope> {
        let Some(chunk) = envelope.chunk else {
            return Some(envelope);
        };
        let Some(seq) = envelope.seq else {
            tracing::debug!(%peer_id, "chunk without seq dropped");
            return None;
        };
        let max_chunks = self.max_bytes.div_ceil(CHUNK_PAYLOAD_BYTES).max(1);
        if chunk.total == 0 || chunk.index >= chunk.total || chunk.total as usize > max_chunks {
            tracing::debug!(%peer_id, index = chunk.index, total = chunk.total, "invalid chunk dropped");
            return None;
        }

        let ttl = self.ttl;
        let queue = self.pending.entry(peer_id.to_string()).or_default();
        queue.retain(|assembly| assembly.started.elapsed() < ttl);

        let position = queue.iter().position(|a| a.seq == seq);
        let position = match position {
            Some(i) if queue[i].total == chunk.total && queue[i].action == envelope.action => i,
            stale => {
                if let Some(i) = stale {
                    tracing::debug!(%peer_id, seq, "chunk total changed, restarting assembly");
                    queue.remove(i);
                }
                if queue.len() >= self.max_pending {
                    if let Some(evicted) = queue.pop_front() {
                        tracing::debug!(%peer_id, seq = evicted.seq, "evicting oldest pending assembly");
                    }
                }
                queue.push_back(Assembly {
                    seq,
                    action: envelope.action.clone(),
                    total: chunk.total,
                    parts: vec![None; chunk.total as usize],
                    received: 0,
                    bytes: 0,
                    started: Instant::now(),
                });
                queue.len() - 1
            }
        };

        let assembly = &mut queue[position];
        let slot = &mut assembly.parts[chunk.index as usize];
        if slot.is_some() {
            return None;
        }
        assembly.bytes += envelope.data.len();
        if assembly.bytes > self.max_bytes {
            tracing::warn!(%peer_id, seq, bytes = assembly.bytes, "chunked message over size cap dropped");
            queue.remove(position);
            return None;
        }
        *slot = Some(envelope.data);
        assembly.received += 1;
        if assembly.received < assembly.total {
            return None;
        }

        let assembly = queue.remove(position)?;
        if queue.is_empty() {
            self.pending.remove(peer_id);
        }
        let data = assembly.parts.into_iter().flatten().flatten().collect();
        Some(ActionEnvelope {
            action: assembly.action,
            from: envelope.from,
            target: envelope.target,
            seq: Some(seq),
            chunk: None,
            data,
        })
    }

    /// Drop everything buffered for a peer.
    pub fn forget_peer(&mut self, peer_id: &str) {
        self.pending.remove(peer_id);
    }

    pub fn pending(&self, peer_id: &str) -> usize {
        self.pending.get(peer_id).map_or(0, VecDeque::len)
    }
}

/// Turns action values into bytes and back.
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// The default codec: values travel as JSON.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Raw bytes, untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>, CodecError> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn frames(data: &[u8], seq: u64) -> Vec<ActionEnvelope> {
        encode_frames("move", "peer-a", None, seq, data)
            .unwrap()
            .iter()
            .map(|f| decode_frame(f).unwrap())
            .collect()
    }

    #[test]
    fn action_names() {
        assert!(is_valid_action_name("move"));
        assert!(is_valid_action_name(&"x".repeat(32)));
        assert!(!is_valid_action_name(""));
        assert!(!is_valid_action_name(&"x".repeat(33)));
        assert!(!is_valid_action_name("__ping"));
    }

    #[test]
    fn targets() {
        assert!(Target::All.includes("a"));
        assert!(!Target::AllExcept("a".into()).includes("a"));
        assert!(Target::AllExcept("a".into()).includes("b"));
        assert!(Target::Peer("b".into()).includes("b"));
        assert_eq!(Target::Peer("b".into()).unicast(), Some("b"));
        assert_eq!(Target::All.unicast(), None);
    }

    #[test]
    fn small_payload_is_one_unchunked_frame() {
        let raw = encode_frames("move", "peer-a", Some("peer-b"), 7, b"{}").unwrap();
        assert_eq!(raw.len(), 1);
        let json: serde_json::Value = serde_json::from_slice(&raw[0]).unwrap();
        assert_eq!(json["action"], "move");
        assert_eq!(json["target"], "peer-b");
        assert_eq!(json["data"], "e30=");
        assert!(json.get("chunk").is_none());
        assert!(json.get("seq").is_none());
    }

    #[test]
    fn large_payload_frames_stay_under_limit() {
        let data = payload(CHUNK_PAYLOAD_BYTES * 3 + 17);
        let raw = encode_frames("move", "peer-a", Some("peer-bbbbbbbbbbbbbbbb"), 1, &data).unwrap();
        assert_eq!(raw.len(), 4);
        assert!(raw.iter().all(|f| f.len() <= MAX_FRAME_BYTES));
    }

    #[test]
    fn oversized_message_is_rejected() {
        let data = vec![0u8; MAX_MESSAGE_BYTES + 1];
        assert!(matches!(
            encode_frames("move", "peer-a", None, 1, &data),
            Err(CodecError::TooLarge { .. })
        ));
    }

    #[test]
    fn out_of_order_chunks_reassemble_once() {
        let data = payload(CHUNK_PAYLOAD_BYTES * 2 + 5);
        let mut parts = frames(&data, 3);
        parts.reverse();

        let mut reassembler = Reassembler::default();
        let mut delivered = Vec::new();
        for part in parts.iter().cloned() {
            delivered.extend(reassembler.push("peer-a", part));
        }
        // a replayed chunk after completion starts a fresh assembly, not a delivery
        assert!(reassembler.push("peer-a", parts[0].clone()).is_none());

        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].data, data);
        assert_eq!(delivered[0].action, "move");
        assert!(delivered[0].chunk.is_none());
    }

    #[test]
    fn duplicate_chunks_are_ignored() {
        let data = payload(CHUNK_PAYLOAD_BYTES + 1);
        let parts = frames(&data, 9);
        let mut reassembler = Reassembler::default();

        assert!(reassembler.push("peer-a", parts[0].clone()).is_none());
        assert!(reassembler.push("peer-a", parts[0].clone()).is_none());
        let whole = reassembler.push("peer-a", parts[1].clone()).unwrap();
        assert_eq!(whole.data, data);
        assert_eq!(reassembler.pending("peer-a"), 0);
    }

    #[test]
    fn peers_do_not_share_assemblies() {
        let data = payload(CHUNK_PAYLOAD_BYTES + 1);
        let parts = frames(&data, 1);
        let mut reassembler = Reassembler::default();

        assert!(reassembler.push("peer-a", parts[0].clone()).is_none());
        assert!(reassembler.push("peer-b", parts[1].clone()).is_none());
        assert_eq!(reassembler.pending("peer-a"), 1);
        assert_eq!(reassembler.pending("peer-b"), 1);

        reassembler.forget_peer("peer-a");
        assert_eq!(reassembler.pending("peer-a"), 0);
    }

    #[test]
    fn oldest_assembly_is_evicted() {
        let mut reassembler = Reassembler::with_limits(2, ASSEMBLY_TTL, MAX_MESSAGE_BYTES);
        let data = payload(CHUNK_PAYLOAD_BYTES + 1);
        for seq in 0..3 {
            let first = frames(&data, seq).remove(0);
            reassembler.push("peer-a", first);
        }
        assert_eq!(reassembler.pending("peer-a"), 2);

        // seq 0 was evicted, so its second chunk starts over instead of completing
        let late = frames(&data, 0).remove(1);
        assert!(reassembler.push("peer-a", late).is_none());
    }

    #[test]
    fn stale_assemblies_expire() {
        let mut reassembler =
            Reassembler::with_limits(8, Duration::from_millis(10), MAX_MESSAGE_BYTES);
        let data = payload(CHUNK_PAYLOAD_BYTES + 1);
        let parts = frames(&data, 1);

        reassembler.push("peer-a", parts[0].clone());
        std::thread::sleep(Duration::from_millis(30));
        assert!(reassembler.push("peer-a", parts[1].clone()).is_none());
    }

    #[test]
    fn size_cap_drops_assembly() {
        let mut reassembler = Reassembler::with_limits(8, ASSEMBLY_TTL, CHUNK_PAYLOAD_BYTES);
        let data = payload(CHUNK_PAYLOAD_BYTES * 2);
        let parts = frames(&data, 1);

        assert!(reassembler.push("peer-a", parts[0].clone()).is_none());
        assert!(reassembler.push("peer-a", parts[1].clone()).is_none());
        assert_eq!(reassembler.pending("peer-a"), 0);
    }

    #[test]
    fn mismatched_total_restarts() {
        let mut reassembler = Reassembler::default();
        let long = frames(&payload(CHUNK_PAYLOAD_BYTES * 2 + 1), 5);
        let short = frames(&payload(CHUNK_PAYLOAD_BYTES + 1), 5);

        reassembler.push("peer-a", long[0].clone());
        assert!(reassembler.push("peer-a", short[0].clone()).is_none());
        let whole = reassembler.push("peer-a", short[1].clone()).unwrap();
        assert_eq!(whole.data.len(), CHUNK_PAYLOAD_BYTES + 1);
    }

    #[test]
    fn codecs() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Move {
            x: i32,
        }
        let bytes = JsonCodec.encode(&Move { x: 3 }).unwrap();
        assert_eq!(Codec::<Move>::decode(&JsonCodec, &bytes).unwrap(), Move { x: 3 });
        assert!(Codec::<Move>::decode(&JsonCodec, b"nope").is_err());

        assert_eq!(BytesCodec.encode(&vec![1u8, 2]).unwrap(), vec![1u8, 2]);
    }
}
