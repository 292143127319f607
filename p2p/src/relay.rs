use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::events::{Event, EventBus};
use crate::transport::{SignalingTransport, Subscription, TransportError};

const DEFAULT_HISTORY: usize = 256;
/// Topics nobody listens on are dropped once their last publish is this old.
const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(60);

/// A payload retained in a topic's history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMessage {
    pub seq: u64,
    pub payload: String,
}

struct TopicLog {
    subscribers: Vec<mpsc::UnboundedSender<String>>,
    history: VecDeque<TopicMessage>,
    last_seq: u64,
    /// Every waiting poll holds a clone.
    notify: Arc<Notify>,
    touched: Instant,
}

impl TopicLog {
    fn new(now: Instant) -> Self {
        Self {
            subscribers: Vec::new(),
            history: VecDeque::new(),
            last_seq: 0,
            notify: Arc::new(Notify::new()),
            touched: now,
        }
    }

    fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        self.subscribers.iter().all(|tx| tx.is_closed())
            && Arc::strong_count(&self.notify) == 1
            && (self.history.is_empty() || now.duration_since(self.touched) >= ttl)
    }
}

/// An in-process publish/subscribe broker that routes rendezvous payloads
/// between peers.
///
/// Live subscribers get every payload pushed to them. Each topic also keeps a
/// bounded history so pollers (the HTTP relay) can ask for everything after a
/// cursor. Sequence numbers are shared by all topics, so a cursor stays valid
/// when an idle topic is pruned and later comes back.
#[derive(Clone)]
pub struct MemoryBroker {
    topics: Arc<RwLock<HashMap<String, TopicLog>>>,
    seq: Arc<AtomicU64>,
    history: usize,
    idle_ttl: Duration,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    pub fn with_history(history: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            seq: Arc::new(AtomicU64::new(0)),
            history: history.max(1),
            idle_ttl: DEFAULT_IDLE_TTL,
        }
    }

    /// How long an unwatched topic keeps its history before `prune` drops it.
    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    /// Publish a payload to a topic. Returns its sequence number.
    pub async fn publish(&self, topic: &str, payload: &str) -> u64 {
        let now = Instant::now();
        let mut topics = self.topics.write().await;
        let log = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::new(now));

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        log.last_seq = seq;
        log.touched = now;
        log.history.push_back(TopicMessage {
            seq,
            payload: payload.to_string(),
        });
        while log.history.len() > self.history {
            log.history.pop_front();
        }

        log.subscribers
            .retain(|tx| tx.send(payload.to_string()).is_ok());
        log.notify.notify_waiters();

        tracing::trace!(%topic, seq, subscribers = log.subscribers.len(), "published");
        seq
    }

    /// Register a live subscriber for a topic.
    pub async fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let mut topics = self.topics.write().await;
        let log = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::new(now));
        log.subscribers.push(tx);
        log.touched = now;
        tracing::debug!(%topic, "subscriber registered with broker");
        rx
    }

    /// Sequence number of the latest payload on a topic. A topic with nothing
    /// retained reports the broker-wide sequence, so polling from it starts
    /// from now.
    pub async fn cursor(&self, topic: &str) -> u64 {
        let topics = self.topics.read().await;
        match topics.get(topic) {
            Some(log) if log.last_seq > 0 => log.last_seq,
            _ => self.seq.load(Ordering::SeqCst),
        }
    }

    /// Retained payloads with `seq > after`, waiting up to `wait` for one to
    /// arrive if there are none yet.
    pub async fn poll(&self, topic: &str, after: u64, wait: Duration) -> Vec<TopicMessage> {
        let ready = self.messages_after(topic, after).await;
        if !ready.is_empty() || wait.is_zero() {
            return ready;
        }

        let notify = {
            let now = Instant::now();
            let mut topics = self.topics.write().await;
            topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicLog::new(now))
                .notify
                .clone()
        };

        let ready = {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = self.messages_after(topic, after).await;
            if ready.is_empty() {
                let _ = tokio::time::timeout(wait, notified).await;
                self.messages_after(topic, after).await
            } else {
                ready
            }
        };
        drop(notify);

        // a poll on a topic nobody used leaves nothing behind
        let mut topics = self.topics.write().await;
        if topics
            .get(topic)
            .is_some_and(|log| log.history.is_empty() && log.is_idle(Instant::now(), self.idle_ttl))
        {
            topics.remove(topic);
        }
        ready
    }

    async fn messages_after(&self, topic: &str, after: u64) -> Vec<TopicMessage> {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|log| {
                log.history
                    .iter()
                    .filter(|m| m.seq > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop topics with no live subscribers, no waiting polls, and no
    /// publish within the idle ttl. Returns how many were removed.
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let mut topics = self.topics.write().await;
        let before = topics.len();
        topics.retain(|_, log| !log.is_idle(now, self.idle_ttl));
        let removed = before - topics.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = topics.len(), "pruned idle topics");
        }
        removed
    }

    /// Prune every `every` until the returned task is aborted.
    pub fn spawn_pruner(&self, every: Duration) -> JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                broker.prune().await;
            }
        })
    }

    /// Number of topics currently tracked.
    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    /// Live subscribers on a topic, not counting dropped ones not yet pruned.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|log| log.subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Idle ttl this broker prunes with.
    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// The reference `SignalingTransport`: a client of a shared [`MemoryBroker`].
pub struct BrokerTransport {
    broker: MemoryBroker,
    bus: EventBus,
    initialized: AtomicBool,
    init_calls: AtomicUsize,
    failing_inits: AtomicUsize,
}

impl BrokerTransport {
    pub fn new(broker: MemoryBroker, bus: EventBus) -> Self {
        Self {
            broker,
            bus,
            initialized: AtomicBool::new(false),
            init_calls: AtomicUsize::new(0),
            failing_inits: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` calls to `init()` fail, simulating an unreachable broker.
    pub fn fail_next_inits(&self, count: usize) {
        self.failing_inits.store(count, Ordering::SeqCst);
    }

    /// How many times `init()` has been called, successful or not.
    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn ensure_initialized(&self) -> Result<(), TransportError> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotInitialized(self.backend().to_string()))
        }
    }
}

#[async_trait]
impl SignalingTransport for BrokerTransport {
    fn backend(&self) -> &str {
        "broker"
    }

    async fn init(&self) -> Result<(), TransportError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_inits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(TransportError::Init {
                backend: self.backend().to_string(),
                reason: "broker unreachable".into(),
            });
        }

        self.initialized.store(true, Ordering::SeqCst);
        self.bus.emit(Event::TransportInitialized {
            backend: self.backend().to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        self.ensure_initialized()?;
        let rx = self.broker.subscribe(topic).await;
        Ok(Subscription::new(topic, rx))
    }

    async fn announce(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
        self.ensure_initialized()?;
        self.broker.publish(topic, payload).await;
        Ok(())
    }
}
