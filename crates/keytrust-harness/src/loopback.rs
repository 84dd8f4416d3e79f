//! Loopback Transport
//!
//! Every device registered on a [`LoopbackNetwork`] gets a
//! [`DeviceTransport`] implementing the verification transport seam. Sends
//! are delivered straight into the recipient's subscription, optionally after
//! a delay, a random drop or a rewrite by a test hook.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use keytrust_core::{
    errors::TransportError, DeviceId, DeviceIdentity, InboundEvent, KeysQueryResponse,
    MessageType, OwnDevice, Result, Subscription, UserId, VerificationTransport, VerifyError,
    WhoAmI,
};
use serde_json::Value;
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    time::{sleep, Duration},
};
use tracing::{debug, trace};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Delivery behaviour of the loopback network
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Delay before each delivery
    pub latency: Duration,
    /// Probability that a message is silently lost
    pub packet_loss_rate: f64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            packet_loss_rate: 0.0,
        }
    }
}

impl LoopbackConfig {
    /// Immediate, lossless delivery
    pub fn ideal() -> Self {
        Self::default()
    }

    pub fn lossy(packet_loss_rate: f64) -> Self {
        Self {
            packet_loss_rate,
            ..Self::default()
        }
    }
}

/// Delivery counters
#[derive(Debug, Default)]
pub struct LoopbackStats {
    pub messages_sent: AtomicU64,
    pub messages_delivered: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub key_queries: AtomicU64,
}

/// A message as it left the sender
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub from: DeviceId,
    pub to: DeviceIdentity,
    pub message_type: MessageType,
    pub content: Value,
}

/// Rewrites a message in flight; returning false drops it
pub type TamperHook = Box<dyn FnMut(&SentMessage, &mut Value) -> bool + Send>;

// ----------------------------------------------------------------------------
// Network
// ----------------------------------------------------------------------------

struct NetworkState {
    user_id: UserId,
    config: LoopbackConfig,
    sinks: DashMap<DeviceId, mpsc::UnboundedSender<InboundEvent>>,
    devices: RwLock<Vec<OwnDevice>>,
    directory: RwLock<KeysQueryResponse>,
    log: Mutex<Vec<SentMessage>>,
    tamper: Mutex<Option<TamperHook>>,
    fail_sends: AtomicBool,
    fail_key_queries: AtomicBool,
    fail_device_list: AtomicBool,
    stats: LoopbackStats,
}

/// Shared medium for one account's devices
#[derive(Clone)]
pub struct LoopbackNetwork {
    state: Arc<NetworkState>,
}

impl LoopbackNetwork {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self::with_config(user_id, LoopbackConfig::ideal())
    }

    pub fn with_config(user_id: impl Into<UserId>, config: LoopbackConfig) -> Self {
        Self {
            state: Arc::new(NetworkState {
                user_id: user_id.into(),
                config,
                sinks: DashMap::new(),
                devices: RwLock::new(Vec::new()),
                directory: RwLock::new(KeysQueryResponse::default()),
                log: Mutex::new(Vec::new()),
                tamper: Mutex::new(None),
                fail_sends: AtomicBool::new(false),
                fail_key_queries: AtomicBool::new(false),
                fail_device_list: AtomicBool::new(false),
                stats: LoopbackStats::default(),
            }),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.state.user_id
    }

    /// Register a device with an ed25519 key in the directory
    pub async fn add_device(&self, device_id: &str, last_seen_ts: Option<u64>) -> DeviceTransport {
        let device_id = DeviceId::from(device_id);
        self.state.devices.write().await.push(OwnDevice {
            device_id: device_id.clone(),
            last_seen_ts,
        });
        {
            let mut directory = self.state.directory.write().await;
            *directory = std::mem::take(&mut *directory).with_device_key(
                &self.state.user_id,
                &device_id,
                format!("ed25519:{device_id}"),
                format!("ed25519-public-{device_id}"),
            );
        }
        self.transport(device_id)
    }

    /// Transport for a device id, registered or not
    pub fn transport(&self, device_id: impl Into<DeviceId>) -> DeviceTransport {
        DeviceTransport {
            device_id: Some(device_id.into()),
            state: Arc::clone(&self.state),
        }
    }

    /// Transport whose identity lookup cannot name a device
    pub fn anonymous_transport(&self) -> DeviceTransport {
        DeviceTransport {
            device_id: None,
            state: Arc::clone(&self.state),
        }
    }

    pub async fn set_master_key(&self, key_id: &str, value: &str) {
        let mut directory = self.state.directory.write().await;
        *directory = std::mem::take(&mut *directory).with_master_key(&self.state.user_id, key_id, value);
    }

    pub async fn clear_directory(&self) {
        *self.state.directory.write().await = KeysQueryResponse::default();
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_key_queries(&self, fail: bool) {
        self.state.fail_key_queries.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_device_list(&self, fail: bool) {
        self.state.fail_device_list.store(fail, Ordering::SeqCst);
    }

    pub async fn set_tamper<F>(&self, hook: F)
    where
        F: FnMut(&SentMessage, &mut Value) -> bool + Send + 'static,
    {
        *self.state.tamper.lock().await = Some(Box::new(hook));
    }

    /// Push a raw event to a device as if it came from `sender`
    pub fn inject(&self, to: &str, sender: impl Into<UserId>, event_type: &str, content: Value) -> bool {
        match self.state.sinks.get(&DeviceId::from(to)) {
            Some(sink) => sink
                .send(InboundEvent {
                    event_type: event_type.to_string(),
                    sender: sender.into(),
                    content,
                })
                .is_ok(),
            None => false,
        }
    }

    pub async fn sent_messages(&self) -> Vec<SentMessage> {
        self.state.log.lock().await.clone()
    }

    pub fn is_subscribed(&self, device_id: &str) -> bool {
        self.state.sinks.contains_key(&DeviceId::from(device_id))
    }

    pub fn stats(&self) -> &LoopbackStats {
        &self.state.stats
    }
}

// ----------------------------------------------------------------------------
// Device Transport
// ----------------------------------------------------------------------------

/// One device's view of the loopback network
#[derive(Clone)]
pub struct DeviceTransport {
    device_id: Option<DeviceId>,
    state: Arc<NetworkState>,
}

impl DeviceTransport {
    fn own_device(&self) -> Result<&DeviceId> {
        self.device_id
            .as_ref()
            .ok_or_else(|| VerifyError::identity_unavailable("device id unknown"))
    }
}

#[async_trait]
impl VerificationTransport for DeviceTransport {
    async fn send_to_device(
        &self,
        message_type: MessageType,
        to: &DeviceIdentity,
        content: Value,
    ) -> Result<()> {
        let from = self.own_device()?.clone();
        if self.state.fail_sends.load(Ordering::SeqCst) {
            return Err(VerifyError::send_failed(
                to.user_id.as_str(),
                to.device_id.as_str(),
                "loopback configured to fail sends",
            ));
        }
        self.state.stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        let sent = SentMessage {
            from,
            to: to.clone(),
            message_type,
            content,
        };
        self.state.log.lock().await.push(sent.clone());

        let mut content = sent.content.clone();
        if let Some(hook) = self.state.tamper.lock().await.as_mut() {
            if !hook(&sent, &mut content) {
                self.state.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Tamper hook dropped {} to {}", message_type.event_type(), to);
                return Ok(());
            }
        }
        if self.state.config.packet_loss_rate > 0.0
            && fastrand::f64() < self.state.config.packet_loss_rate
        {
            self.state.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Dropped {} to {}", message_type.event_type(), to);
            return Ok(());
        }

        let Some(sink) = self.state.sinks.get(&to.device_id).map(|s| s.clone()) else {
            self.state.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            trace!("No subscriber for {}", to);
            return Ok(());
        };
        let event = InboundEvent {
            event_type: message_type.event_type().to_string(),
            sender: self.state.user_id.clone(),
            content,
        };
        let latency = self.state.config.latency;
        let state = Arc::clone(&self.state);
        if latency.is_zero() {
            if sink.send(event).is_ok() {
                state.stats.messages_delivered.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            tokio::spawn(async move {
                sleep(latency).await;
                if sink.send(event).is_ok() {
                    state.stats.messages_delivered.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
        Ok(())
    }

    async fn who_am_i(&self) -> Result<WhoAmI> {
        Ok(WhoAmI {
            user_id: self.state.user_id.clone(),
            device_id: self.device_id.clone(),
        })
    }

    async fn list_own_devices(&self) -> Result<Vec<OwnDevice>> {
        if self.state.fail_device_list.load(Ordering::SeqCst) {
            return Err(VerifyError::device_list_failed(
                "loopback configured to fail device listing",
            ));
        }
        Ok(self.state.devices.read().await.clone())
    }

    async fn query_keys(&self, user_id: &UserId) -> Result<KeysQueryResponse> {
        self.state.stats.key_queries.fetch_add(1, Ordering::Relaxed);
        if self.state.fail_key_queries.load(Ordering::SeqCst) {
            return Err(VerifyError::key_query_failed(
                user_id.as_str(),
                "loopback configured to fail key queries",
            ));
        }
        Ok(self.state.directory.read().await.clone())
    }

    fn subscribe(&self, sink: mpsc::UnboundedSender<InboundEvent>) -> Result<Subscription> {
        let device_id = self.device_id.clone().ok_or_else(|| {
            VerifyError::Transport(TransportError::SubscriptionFailed {
                reason: "device id unknown".to_string(),
            })
        })?;
        self.state.sinks.insert(device_id.clone(), sink);
        let state = Arc::downgrade(&self.state);
        Ok(Subscription::new(move || {
            if let Some(state) = state.upgrade() {
                state.sinks.remove(&device_id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_delivers_to_subscriber() {
        let network = LoopbackNetwork::new("@alice:example.org");
        let a = network.add_device("DEVA", Some(1)).await;
        let b = network.add_device("DEVB", Some(2)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = b.subscribe(tx).unwrap();
        let to = DeviceIdentity::new("@alice:example.org", "DEVB");
        a.send_to_device(MessageType::Done, &to, json!({"transaction_id": "t"}))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "m.key.verification.done");
        assert_eq!(event.sender.as_str(), "@alice:example.org");
        assert_eq!(network.sent_messages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let network = LoopbackNetwork::new("@alice:example.org");
        let b = network.add_device("DEVB", None).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sub = b.subscribe(tx).unwrap();
        assert!(network.is_subscribed("DEVB"));
        sub.unsubscribe();
        assert!(!network.is_subscribed("DEVB"));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let network = LoopbackNetwork::new("@alice:example.org");
        let a = network.add_device("DEVA", None).await;
        network.set_fail_sends(true);
        network.set_fail_key_queries(true);
        network.set_fail_device_list(true);

        let to = DeviceIdentity::new("@alice:example.org", "DEVB");
        assert!(a.send_to_device(MessageType::Done, &to, json!({})).await.is_err());
        assert!(a.query_keys(&"@alice:example.org".into()).await.is_err());
        assert!(a.list_own_devices().await.is_err());
        assert!(network.anonymous_transport().subscribe(mpsc::unbounded_channel().0).is_err());
    }

    #[tokio::test]
    async fn test_directory_has_device_keys() {
        let network = LoopbackNetwork::new("@alice:example.org");
        let a = network.add_device("DEVA", None).await;
        network.add_device("DEVB", None).await;
        let directory = a.query_keys(&"@alice:example.org".into()).await.unwrap();
        let keys = directory.keys_to_mac(network.user_id(), &"DEVB".into());
        assert_eq!(keys[0].key_id, "ed25519:DEVB");
    }
}
