use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use url::Url;

use crate::relay::TopicMessage;
use crate::transport::{SignalingTransport, Subscription, TransportError};

const DEFAULT_POLL_WAIT: Duration = Duration::from_secs(20);
const DEFAULT_INIT_ATTEMPTS: u32 = 4;
const DEFAULT_INIT_BACKOFF: Duration = Duration::from_millis(250);
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(5);

/// Body of `POST /v0/topics/{topic}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishRequest {
    pub payload: String,
}

/// Response of `POST /v0/topics/{topic}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub seq: u64,
}

/// Response of `GET /v0/topics/{topic}`.
///
/// `cursor` is the sequence number to pass as `after` on the next poll.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PollResponse {
    pub messages: Vec<TopicMessage>,
    pub cursor: u64,
}

/// Signaling over a `howlmesh-relay` HTTP server, using long polls for
/// subscriptions.
pub struct HttpRelayTransport {
    base: Url,
    client: reqwest::Client,
    poll_wait: Duration,
    init_attempts: u32,
    init_backoff: Duration,
    initialized: AtomicBool,
}

impl HttpRelayTransport {
    pub fn new(base: &str) -> Result<Self, TransportError> {
        Self::with_poll_wait(base, DEFAULT_POLL_WAIT)
    }

    pub fn with_poll_wait(base: &str, poll_wait: Duration) -> Result<Self, TransportError> {
        let base = Url::parse(base)
            .map_err(|e| TransportError::Request(format!("invalid relay url {base}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(poll_wait + Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self {
            base,
            client,
            poll_wait,
            init_attempts: DEFAULT_INIT_ATTEMPTS,
            init_backoff: DEFAULT_INIT_BACKOFF,
            initialized: AtomicBool::new(false),
        })
    }

    /// How many health probes `init()` makes and the first delay between them
    /// (doubled after each failure).
    pub fn with_init_policy(mut self, attempts: u32, backoff: Duration) -> Self {
        self.init_attempts = attempts.max(1);
        self.init_backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        let base = self.base.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}{path}")).map_err(|e| TransportError::Request(e.to_string()))
    }

    fn topic_url(&self, topic: &str) -> Result<Url, TransportError> {
        let encoded: String = url::form_urlencoded::byte_serialize(topic.as_bytes()).collect();
        self.endpoint(&format!("/v0/topics/{encoded}"))
    }

    fn ensure_initialized(&self) -> Result<(), TransportError> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotInitialized(self.backend().to_string()))
        }
    }

    async fn probe(&self) -> Result<(), TransportError> {
        self.client
            .get(self.endpoint("/healthz")?)
            .send()
            .await
            .map_err(request_error)?
            .error_for_status()
            .map_err(request_error)?;
        Ok(())
    }
}

fn request_error(err: reqwest::Error) -> TransportError {
    TransportError::Request(err.to_string())
}

async fn fetch(
    client: &reqwest::Client,
    mut url: Url,
    after: Option<u64>,
    wait: Duration,
) -> Result<PollResponse, reqwest::Error> {
    if let Some(after) = after {
        url.query_pairs_mut()
            .append_pair("after", &after.to_string())
            .append_pair("wait_ms", &wait.as_millis().to_string());
    }
    client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}

async fn poll_loop(
    client: reqwest::Client,
    url: Url,
    mut cursor: u64,
    wait: Duration,
    tx: mpsc::UnboundedSender<String>,
) {
    let mut backoff = DEFAULT_INIT_BACKOFF;
    while !tx.is_closed() {
        match fetch(&client, url.clone(), Some(cursor), wait).await {
            Ok(batch) => {
                backoff = DEFAULT_INIT_BACKOFF;
                if let Some(first) = batch.messages.first() {
                    if first.seq > cursor + 1 {
                        tracing::warn!(
                            %url,
                            missed = first.seq - cursor - 1,
                            "relay history rolled past our cursor"
                        );
                    }
                }
                for message in batch.messages {
                    if tx.send(message.payload).is_err() {
                        return;
                    }
                }
                // a restarted relay reports a lower cursor; follow it
                cursor = batch.cursor;
            }
            Err(error) => {
                tracing::warn!(%url, %error, "relay poll failed, backing off");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_POLL_BACKOFF);
            }
        }
    }
}

#[async_trait]
impl SignalingTransport for HttpRelayTransport {
    fn backend(&self) -> &str {
        "http-relay"
    }

    async fn init(&self) -> Result<(), TransportError> {
        let mut delay = self.init_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.init_attempts {
            match self.probe().await {
                Ok(()) => {
                    self.initialized.store(true, Ordering::SeqCst);
                    tracing::info!(relay = %self.base, attempt, "relay reachable");
                    return Ok(());
                }
                Err(error) => {
                    tracing::warn!(relay = %self.base, attempt, %error, "relay health probe failed");
                    last_error = error.to_string();
                    if attempt < self.init_attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(TransportError::Init {
            backend: self.backend().to_string(),
            reason: format!("{}: {last_error}", self.base),
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        self.ensure_initialized()?;
        let url = self.topic_url(topic)?;

        // No `after`: the relay answers immediately with its current cursor,
        // so the subscription starts from now like a live broker subscription.
        let start = fetch(&self.client, url.clone(), None, self.poll_wait)
            .await
            .map_err(request_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let feeder = tokio::spawn(poll_loop(
            self.client.clone(),
            url,
            start.cursor,
            self.poll_wait,
            tx,
        ));
        Ok(Subscription::new(topic, rx).with_feeder(feeder))
    }

    async fn announce(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
        self.ensure_initialized()?;
        let url = self.topic_url(topic)?;
        let response: PublishResponse = self
            .client
            .post(url)
            .json(&PublishRequest {
                payload: payload.to_string(),
            })
            .send()
            .await
            .map_err(request_error)?
            .error_for_status()
            .map_err(request_error)?
            .json()
            .await
            .map_err(request_error)?;
        tracing::trace!(%topic, seq = response.seq, "announced via relay");
        Ok(())
    }
}
