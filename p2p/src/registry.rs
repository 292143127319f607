use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OnceCell, RwLock};

use crate::config::MeshConfig;
use crate::connection::{Connector, TunnelConnector};
use crate::crypto::random_peer_id;
use crate::events::EventBus;
use crate::room::{Room, RoomContext, RoomError, RoomKey, RoomMap};
use crate::transport::{self, SignalingTransport};

/// Owns a signaling transport and at most one [`Room`] per `(app_id, room_id)`.
///
/// The transport is initialized lazily by the first room request and never
/// again; a failed `init()` is retried by the next request.
#[derive(Clone)]
pub struct RoomRegistry {
    self_id: String,
    config: MeshConfig,
    transport: Arc<dyn SignalingTransport>,
    connector: Arc<dyn Connector>,
    initialized: Arc<OnceCell<()>>,
    rooms: Arc<RoomMap>,
    /// Joins in flight, one cell per key.
    joining: Arc<Mutex<HashMap<RoomKey, Arc<OnceCell<Room>>>>>,
    bus: EventBus,
}

impl RoomRegistry {
    /// A registry with a fresh random peer id.
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        config: MeshConfig,
        bus: EventBus,
    ) -> Result<Self, RoomError> {
        Ok(Self::with_peer_id(&random_peer_id()?, transport, config, bus))
    }

    pub fn with_peer_id(
        peer_id: &str,
        transport: Arc<dyn SignalingTransport>,
        config: MeshConfig,
        bus: EventBus,
    ) -> Self {
        let connector = Arc::new(TunnelConnector::new(transport.clone()));
        Self {
            self_id: peer_id.to_string(),
            config,
            transport,
            connector,
            initialized: Arc::new(OnceCell::new()),
            rooms: Arc::new(RwLock::new(HashMap::new())),
            joining: Arc::new(Mutex::new(HashMap::new())),
            bus,
        }
    }

    /// Build the transport `config` describes (`relay_urls`, `relay_redundancy`).
    pub fn from_config(config: MeshConfig, bus: EventBus) -> Result<Self, RoomError> {
        let transport = transport::from_config(&config)?;
        Self::new(transport, config, bus)
    }

    /// Use a different connection factory for rooms created from now on.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn transport(&self) -> &Arc<dyn SignalingTransport> {
        &self.transport
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    /// The room for this key, joining it first if needed.
    ///
    /// Concurrent calls for one key wait on a single join and share its room;
    /// joins for other keys go ahead in parallel.
    pub async fn get_or_create_room(&self, app_id: &str, room_id: &str) -> Result<Room, RoomError> {
        let key = RoomKey::new(app_id, room_id);
        if let Some(room) = self.rooms.read().await.get(&key) {
            return Ok(room.clone());
        }

        let cell = self.joining.lock().entry(key.clone()).or_default().clone();
        let joined = cell
            .get_or_try_init(|| self.create_room(&key))
            .await
            .cloned();

        let mut joining = self.joining.lock();
        if joining.get(&key).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
            joining.remove(&key);
        }
        joined
    }

    async fn create_room(&self, key: &RoomKey) -> Result<Room, RoomError> {
        self.ensure_initialized().await?;

        // a join for this key may have finished since the first lookup
        if let Some(room) = self.rooms.read().await.get(key) {
            return Ok(room.clone());
        }

        let ctx = RoomContext {
            transport: self.transport.clone(),
            connector: self.connector.clone(),
            config: self.config.clone(),
            bus: self.bus.clone(),
            registry: Arc::downgrade(&self.rooms),
        };
        let room = Room::join(key.clone(), &self.self_id, ctx).await?;
        self.rooms.write().await.insert(key.clone(), room.clone());
        Ok(room)
    }

    /// Join `room_id` under the configured app id.
    pub async fn join(&self, room_id: &str) -> Result<Room, RoomError> {
        let app_id = self.config.app_id.clone();
        self.get_or_create_room(&app_id, room_id).await
    }

    pub async fn room(&self, app_id: &str, room_id: &str) -> Option<Room> {
        self.rooms
            .read()
            .await
            .get(&RoomKey::new(app_id, room_id))
            .cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Leave every room this registry holds.
    pub async fn leave_all(&self) {
        let rooms: Vec<Room> = self.rooms.read().await.values().cloned().collect();
        for room in rooms {
            room.leave().await;
        }
    }

    async fn ensure_initialized(&self) -> Result<(), RoomError> {
        self.initialized
            .get_or_try_init(|| async {
                tracing::debug!(backend = self.transport.backend(), "initializing transport");
                self.transport.init().await
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use crate::relay::{BrokerTransport, MemoryBroker};
    use crate::transport::{Subscription, TransportError};

    /// Broker client whose first subscribe after `arm` waits for `release`.
    struct GatedTransport {
        inner: BrokerTransport,
        armed: AtomicBool,
        parked: AtomicBool,
        gate: Semaphore,
    }

    impl GatedTransport {
        fn new() -> Self {
            Self {
                inner: BrokerTransport::new(MemoryBroker::new(), EventBus::default()),
                armed: AtomicBool::new(false),
                parked: AtomicBool::new(false),
                gate: Semaphore::new(0),
            }
        }

        fn arm(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }

        fn release(&self) {
            self.gate.add_permits(1);
        }
    }

    #[async_trait]
    impl SignalingTransport for GatedTransport {
        fn backend(&self) -> &str {
            "gated"
        }

        async fn init(&self) -> Result<(), TransportError> {
            self.inner.init().await
        }

        async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.parked.store(true, Ordering::SeqCst);
                let _permit = self.gate.acquire().await;
            }
            self.inner.subscribe(topic).await
        }

        async fn announce(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
            self.inner.announce(topic, payload).await
        }
    }

    fn registry(transport: Arc<BrokerTransport>) -> RoomRegistry {
        RoomRegistry::with_peer_id(
            "peer-a",
            transport,
            MeshConfig::with_app_id("app1"),
            EventBus::default(),
        )
    }

    fn broker_transport() -> Arc<BrokerTransport> {
        Arc::new(BrokerTransport::new(MemoryBroker::new(), EventBus::default()))
    }

    #[tokio::test]
    async fn same_key_same_room_single_init() {
        let transport = broker_transport();
        let registry = registry(transport.clone());
        assert!(!registry.is_initialized());

        let first = registry.get_or_create_room("app1", "r1").await.unwrap();
        let second = registry.get_or_create_room("app1", "r1").await.unwrap();
        assert_eq!(first.topic(), second.topic());
        assert_eq!(registry.room_count().await, 1);

        let other = registry.get_or_create_room("app1", "r2").await.unwrap();
        assert_ne!(first.topic(), other.topic());
        assert_eq!(registry.room_count().await, 2);

        assert_eq!(transport.init_calls(), 1);
        assert!(registry.is_initialized());
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_room() {
        let transport = broker_transport();
        let registry = registry(transport.clone());

        let (a, b) = tokio::join!(
            registry.get_or_create_room("app1", "r1"),
            registry.get_or_create_room("app1", "r1")
        );
        assert_eq!(a.unwrap().topic(), b.unwrap().topic());
        assert_eq!(registry.room_count().await, 1);
        assert_eq!(transport.init_calls(), 1);
    }

    #[tokio::test]
    async fn failed_init_is_retried() {
        let transport = broker_transport();
        transport.fail_next_inits(1);
        let registry = registry(transport.clone());

        let err = registry.join("r1").await.unwrap_err();
        assert!(matches!(err, RoomError::Transport(TransportError::Init { .. })));
        assert!(!registry.is_initialized());
        assert_eq!(registry.room_count().await, 0);

        registry.join("r1").await.unwrap();
        assert_eq!(transport.init_calls(), 2);
        assert!(registry.is_initialized());
    }

    #[tokio::test]
    async fn leave_removes_room_from_registry() {
        let registry = registry(broker_transport());
        let room = registry.join("r1").await.unwrap();
        assert!(registry.room("app1", "r1").await.is_some());

        room.leave().await;
        room.leave().await;
        assert!(registry.room("app1", "r1").await.is_none());
        assert!(room.is_left());

        // joining again creates a fresh room without another init
        let again = registry.join("r1").await.unwrap();
        assert!(!again.is_left());
    }

    #[tokio::test]
    async fn leave_all_empties_registry() {
        let registry = registry(broker_transport());
        registry.join("r1").await.unwrap();
        registry.join("r2").await.unwrap();
        registry.leave_all().await;
        assert_eq!(registry.room_count().await, 0);
    }

    #[test]
    fn random_ids_differ() {
        let transport = broker_transport();
        let a = RoomRegistry::new(transport.clone(), MeshConfig::default(), EventBus::default())
            .unwrap();
        let b = RoomRegistry::new(transport, MeshConfig::default(), EventBus::default()).unwrap();
        assert_ne!(a.self_id(), b.self_id());
    }

    #[tokio::test]
    async fn slow_join_does_not_block_other_keys() {
        let gated = Arc::new(GatedTransport::new());
        let registry = RoomRegistry::with_peer_id(
            "peer-a",
            gated.clone(),
            MeshConfig::with_app_id("app1"),
            EventBus::default(),
        );
        let earlier = registry.join("r0").await.unwrap();

        gated.arm();
        let slow = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.join("slow").await })
        };
        tokio::time::timeout(Duration::from_secs(2), async {
            while !gated.parked.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let wait = Duration::from_secs(1);
        tokio::time::timeout(wait, registry.join("fast"))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(wait, earlier.leave()).await.unwrap();
        assert!(registry.room("app1", "r0").await.is_none());
        assert!(registry.room("app1", "slow").await.is_none());

        gated.release();
        let slow = slow.await.unwrap().unwrap();
        let again = registry.join("slow").await.unwrap();
        assert_eq!(slow.topic(), again.topic());
        assert_eq!(registry.room_count().await, 2);
        assert_eq!(gated.inner.init_calls(), 1);
    }
}
