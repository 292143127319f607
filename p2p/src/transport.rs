use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::MeshConfig;
use crate::fanout::FanoutTransport;
use crate::http_relay::HttpRelayTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport `{backend}` failed to initialize: {reason}")]
    Init { backend: String, reason: String },
    #[error("transport `{0}` used before init()")]
    NotInitialized(String),
    #[error("relay request failed: {0}")]
    Request(String),
    #[error("no relay urls configured")]
    NoRelays,
}

/// A live subscription to one topic.
///
/// Payloads arrive in publish order. Dropping the subscription unsubscribes
/// and stops any background poller feeding it.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<String>,
    feeders: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(topic: &str, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            topic: topic.to_string(),
            rx,
            feeders: Vec::new(),
        }
    }

    /// Attach a background task that feeds this subscription; it is aborted on drop.
    pub fn with_feeder(mut self, feeder: JoinHandle<()>) -> Self {
        self.feeders.push(feeder);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next payload, or `None` once the backend closed the subscription.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for feeder in &self.feeders {
            feeder.abort();
        }
    }
}

/// A rendezvous backend: anything that can carry small payloads between
/// peers subscribed to the same topic.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &str;

    /// Backend bootstrap. Called once by the owning registry before any room
    /// uses the transport; failures leave the transport uninitialized.
    async fn init(&self) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError>;

    async fn announce(&self, topic: &str, payload: &str) -> Result<(), TransportError>;
}

/// Pick the backend described by `config`: one HTTP relay, or a fan-out over
/// `relay_redundancy` of them.
pub fn from_config(config: &MeshConfig) -> Result<Arc<dyn SignalingTransport>, TransportError> {
    let relays = config.selected_relays();
    match relays {
        [] => Err(TransportError::NoRelays),
        [single] => Ok(Arc::new(HttpRelayTransport::new(single)?)),
        many => {
            let backends = many
                .iter()
                .map(|url| {
                    HttpRelayTransport::new(url)
                        .map(|t| Arc::new(t) as Arc<dyn SignalingTransport>)
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Arc::new(FanoutTransport::new(backends)))
        }
    }
}
