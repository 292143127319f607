use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ring::digest::{self, SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// Namespace every rendezvous topic lives under.
pub const TOPIC_NAMESPACE: &str = "howlmesh";

const PEER_ID_BYTES: usize = 15;
const TOPIC_HASH_CHARS: usize = 40;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("system random source failed")]
    Random,
}

/// Generate `len` cryptographically-secure random bytes.
pub fn random_bytes(len: usize) -> Result<Vec<u8>, CryptoError> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf).map_err(|_| CryptoError::Random)?;
    Ok(buf)
}

/// A fresh 20-character, topic-safe peer id.
pub fn random_peer_id() -> Result<String, CryptoError> {
    Ok(URL_SAFE_NO_PAD.encode(random_bytes(PEER_ID_BYTES)?))
}

/// Derive the rendezvous topic for a room.
///
/// The room id and optional password are hashed so relays never see either in
/// the clear, and peers with different passwords never meet.
pub fn room_topic(app_id: &str, room_id: &str, password: Option<&str>) -> String {
    let mut ctx = digest::Context::new(&SHA256);
    ctx.update(app_id.as_bytes());
    ctx.update(&[0]);
    ctx.update(room_id.as_bytes());
    ctx.update(&[0]);
    ctx.update(password.unwrap_or_default().as_bytes());
    let hash = hex(ctx.finish().as_ref());
    format!("{TOPIC_NAMESPACE}/{app_id}/{}", &hash[..TOPIC_HASH_CHARS])
}

/// Inbox topic a peer receives directed signaling on.
pub fn inbox_topic(room_topic: &str, peer_id: &str) -> String {
    format!("{room_topic}/{peer_id}")
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
