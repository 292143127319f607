use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::transport::{SignalingTransport, Subscription, TransportError};

/// Outbound topics that keep their own sequence counter.
const STREAM_CAPACITY: usize = 1024;
/// How long a gap in a stream is waited on before it is skipped.
pub const DEFAULT_HOLD_BACK: Duration = Duration::from_millis(300);
/// Inbound streams with nothing pending are forgotten after this long.
const STREAM_IDLE: Duration = Duration::from_secs(60);

/// What actually travels over each relay. `stream` names one sender's
/// sequence on one topic, so copies can be dropped and gaps put back in order.
#[derive(Debug, Serialize, Deserialize)]
struct FanoutFrame {
    stream: Uuid,
    seq: u64,
    payload: String,
}

/// Per-topic sequence counters for what this transport announces. Bounded;
/// an evicted topic restarts under a fresh stream id.
#[derive(Default)]
struct OutboundStreams {
    order: VecDeque<String>,
    counters: HashMap<String, (Uuid, u64)>,
}

impl OutboundStreams {
    fn next(&mut self, topic: &str) -> (Uuid, u64) {
        if !self.counters.contains_key(topic) {
            self.order.push_back(topic.to_string());
            if self.order.len() > STREAM_CAPACITY {
                if let Some(oldest) = self.order.pop_front() {
                    self.counters.remove(&oldest);
                }
            }
        }
        let entry = self
            .counters
            .entry(topic.to_string())
            .or_insert_with(|| (Uuid::new_v4(), 0));
        entry.1 += 1;
        *entry
    }
}

struct InboundStream {
    next: Option<u64>,
    pending: BTreeMap<u64, String>,
    held_since: Option<Instant>,
    last_seen: Instant,
}

impl InboundStream {
    fn new(now: Instant) -> Self {
        Self {
            next: None,
            pending: BTreeMap::new(),
            held_since: None,
            last_seen: now,
        }
    }

    fn release(&mut self, out: &mut Vec<String>) {
        while let Some(next) = self.next {
            match self.pending.remove(&next) {
                Some(payload) => {
                    out.push(payload);
                    self.next = Some(next + 1);
                }
                None => break,
            }
        }
    }

    /// Restart the gap timer whenever the stream made progress.
    fn settle(&mut self, progressed: bool, now: Instant) {
        if self.pending.is_empty() {
            self.held_since = None;
        } else if progressed || self.held_since.is_none() {
            self.held_since = Some(now);
        }
    }
}

/// Merges the copies every relay delivers into one stream per sender,
/// released in sequence order.
///
/// Frames past a gap are held until the missing one shows up on some relay or
/// `hold_back` expires, at which point the gap is skipped. A stream first seen
/// mid-sequence is held the same way, since an earlier frame may still be in
/// flight on a slower relay.
struct Reorder {
    hold_back: Duration,
    streams: HashMap<Uuid, InboundStream>,
}

impl Reorder {
    fn new(hold_back: Duration) -> Self {
        Self {
            hold_back,
            streams: HashMap::new(),
        }
    }

    fn accept(&mut self, frame: FanoutFrame, now: Instant) -> Vec<String> {
        self.streams
            .retain(|_, s| !s.pending.is_empty() || now.duration_since(s.last_seen) < STREAM_IDLE);

        let stream = self
            .streams
            .entry(frame.stream)
            .or_insert_with(|| InboundStream::new(now));
        stream.last_seen = now;

        let mut out = Vec::new();
        match stream.next {
            // a copy of something delivered or skipped already
            Some(next) if frame.seq < next => return out,
            None if frame.seq == 1 => stream.next = Some(1),
            _ => {}
        }
        stream.pending.entry(frame.seq).or_insert(frame.payload);
        stream.release(&mut out);
        stream.settle(!out.is_empty(), now);
        out
    }

    /// Skip gaps that have been held for `hold_back`.
    fn expire(&mut self, now: Instant) -> Vec<String> {
        let mut out = Vec::new();
        for stream in self.streams.values_mut() {
            let Some(since) = stream.held_since else {
                continue;
            };
            if now.duration_since(since) < self.hold_back {
                continue;
            }
            if let Some(&first) = stream.pending.keys().next() {
                tracing::debug!(expected = ?stream.next, resumed_at = first, "skipping fanout gap");
                stream.next = Some(first);
            }
            stream.release(&mut out);
            stream.settle(true, now);
        }
        out
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.streams
            .values()
            .filter_map(|s| s.held_since)
            .min()
            .map(|since| since + self.hold_back)
    }

    /// Everything still held, in sequence order per stream.
    fn drain(&mut self) -> Vec<String> {
        self.streams
            .values_mut()
            .flat_map(|s| std::mem::take(&mut s.pending).into_values())
            .collect()
    }
}

/// Uses several relays at once: every announce goes to all of them and each
/// payload is delivered once, in the order its sender announced it, no matter
/// how many relays carried it.
pub struct FanoutTransport {
    relays: Vec<Arc<dyn SignalingTransport>>,
    ready: RwLock<Vec<Arc<dyn SignalingTransport>>>,
    outbound: Mutex<OutboundStreams>,
    hold_back: Duration,
}

impl FanoutTransport {
    pub fn new(relays: Vec<Arc<dyn SignalingTransport>>) -> Self {
        Self {
            relays,
            ready: RwLock::new(Vec::new()),
            outbound: Mutex::new(OutboundStreams::default()),
            hold_back: DEFAULT_HOLD_BACK,
        }
    }

    /// How long a subscription waits for a missing frame before skipping it.
    pub fn with_hold_back(mut self, hold_back: Duration) -> Self {
        self.hold_back = hold_back;
        self
    }

    /// Relays that initialized successfully.
    pub async fn ready_count(&self) -> usize {
        self.ready.read().await.len()
    }

    async fn ready_relays(&self) -> Result<Vec<Arc<dyn SignalingTransport>>, TransportError> {
        let ready = self.ready.read().await;
        if ready.is_empty() {
            return Err(TransportError::NotInitialized(self.backend().to_string()));
        }
        Ok(ready.clone())
    }
}

async fn merge_loop(
    mut frames: mpsc::UnboundedReceiver<FanoutFrame>,
    out: mpsc::UnboundedSender<String>,
    mut reorder: Reorder,
) {
    loop {
        let deadline = reorder.next_deadline();
        let released = tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => reorder.accept(frame, Instant::now()),
                None => break,
            },
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => reorder.expire(Instant::now()),
        };
        for payload in released {
            if out.send(payload).is_err() {
                return;
            }
        }
    }
    for payload in reorder.drain() {
        let _ = out.send(payload);
    }
}

#[async_trait]
impl SignalingTransport for FanoutTransport {
    fn backend(&self) -> &str {
        "fanout"
    }

    async fn init(&self) -> Result<(), TransportError> {
        let mut ready = Vec::new();
        let mut failures = Vec::new();

        for relay in &self.relays {
            match relay.init().await {
                Ok(()) => ready.push(relay.clone()),
                Err(error) => {
                    tracing::warn!(backend = relay.backend(), %error, "relay unavailable, continuing without it");
                    failures.push(error.to_string());
                }
            }
        }

        if ready.is_empty() {
            return Err(TransportError::Init {
                backend: self.backend().to_string(),
                reason: failures.join("; "),
            });
        }

        tracing::info!(ready = ready.len(), total = self.relays.len(), "fanout transport ready");
        *self.ready.write().await = ready;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        let relays = self.ready_relays().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let mut merged = Subscription::new(topic, rx);
        let mut subscribed = 0;

        for relay in relays {
            let mut upstream = match relay.subscribe(topic).await {
                Ok(sub) => sub,
                Err(error) => {
                    tracing::warn!(backend = relay.backend(), %topic, %error, "relay subscribe failed");
                    continue;
                }
            };
            subscribed += 1;

            let frames_tx = frames_tx.clone();
            let feeder = tokio::spawn(async move {
                while let Some(raw) = upstream.recv().await {
                    let frame: FanoutFrame = match serde_json::from_str(&raw) {
                        Ok(frame) => frame,
                        Err(error) => {
                            tracing::debug!(%error, "dropping non-fanout payload");
                            continue;
                        }
                    };
                    if frames_tx.send(frame).is_err() {
                        break;
                    }
                }
            });
            merged = merged.with_feeder(feeder);
        }
        drop(frames_tx);

        if subscribed == 0 {
            return Err(TransportError::Request(format!(
                "no relay accepted a subscription to {topic}"
            )));
        }
        let merger = tokio::spawn(merge_loop(frames_rx, tx, Reorder::new(self.hold_back)));
        Ok(merged.with_feeder(merger))
    }

    async fn announce(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
        let relays = self.ready_relays().await?;
        let (stream, seq) = self.outbound.lock().next(topic);
        let frame = serde_json::to_string(&FanoutFrame {
            stream,
            seq,
            payload: payload.to_string(),
        })
        .map_err(|e| TransportError::Request(e.to_string()))?;

        let mut delivered = 0;
        let mut last_error = None;
        for relay in relays {
            match relay.announce(topic, &frame).await {
                Ok(()) => delivered += 1,
                Err(error) => {
                    tracing::warn!(backend = relay.backend(), %topic, %error, "relay announce failed");
                    last_error = Some(error);
                }
            }
        }

        match (delivered, last_error) {
            (0, Some(error)) => Err(error),
            _ => Ok(()),
        }
    }
}
