//! Verification manager
//!
//! Owns the engine for one connection and executes the effects it returns:
//! sends through the transport, arms and disarms session timers, persists the
//! verified record and publishes notices. The engine lock is only held for
//! the synchronous engine call, never across transport I/O.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex as StdMutex,
};

use dashmap::DashMap;
use keytrust_core::{
    CancelCode, DeviceId, DeviceIdentity, Effect, KeysQueryResponse, Notice, NoticeLevel,
    OwnDevice, Result, SessionState, Subscription, SystemTimeSource, Timestamp, TransactionId,
    UserId, VerificationConfig, VerificationEngine, VerificationMessage, VerificationTransport,
    VerifyError,
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::{AbortHandle, JoinHandle},
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::cache::KeyDirectoryCache;
use crate::dispatch::{enqueue, run_dispatcher, Job};
use crate::store::VerifiedStateStore;

/// Capacity of the notice broadcast channel
const NOTICE_CHANNEL_CAPACITY: usize = 64;

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

/// State reachable from the dispatcher, workers and timers
pub(crate) struct Shared {
    transport: Arc<dyn VerificationTransport>,
    store: Arc<dyn VerifiedStateStore>,
    config: VerificationConfig,
    engine: Mutex<Option<VerificationEngine<SystemTimeSource>>>,
    cache: KeyDirectoryCache,
    pub(crate) workers: DashMap<TransactionId, mpsc::UnboundedSender<Job>>,
    timers: DashMap<TransactionId, AbortHandle>,
    notices: broadcast::Sender<Notice>,
    disposed: AtomicBool,
}

impl Shared {
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) async fn has_session(&self, transaction_id: &TransactionId) -> bool {
        self.engine
            .lock()
            .await
            .as_ref()
            .is_some_and(|engine| engine.session(transaction_id).is_some())
    }

    /// Run one job through the engine and execute the result
    pub(crate) async fn process(self: &Arc<Self>, job: Job) {
        let effects = match job {
            Job::Message { sender, message } => {
                let needs_directory = match self.engine.lock().await.as_ref() {
                    Some(engine) => engine.directory_for(&message),
                    None => return,
                };
                let directory = match needs_directory {
                    Some(user_id) => self.directory(&user_id).await,
                    None => None,
                };
                match self.engine.lock().await.as_mut() {
                    Some(engine) => engine.handle(&sender, message, directory.as_ref()),
                    None => return,
                }
            }
            Job::Malformed {
                sender,
                message_type,
                transaction_id,
                from_device,
                error,
            } => {
                debug!(
                    "Malformed {} for {}: {}",
                    message_type.event_type(),
                    transaction_id,
                    error
                );
                match self.engine.lock().await.as_mut() {
                    Some(engine) => engine.handle_malformed(
                        &sender,
                        message_type,
                        transaction_id,
                        from_device,
                        &error,
                    ),
                    None => return,
                }
            }
            Job::Timeout {
                transaction_id,
                generation,
            } => match self.engine.lock().await.as_mut() {
                Some(engine) => engine.handle_timeout(&transaction_id, generation),
                None => return,
            },
        };
        self.execute(effects).await;
    }

    async fn directory(&self, user_id: &UserId) -> Option<KeysQueryResponse> {
        match self.cache.get_or_fetch(user_id, self.transport.as_ref()).await {
            Ok(directory) => Some(directory),
            Err(err) => {
                warn!("Key query for {} failed: {}", user_id, err);
                None
            }
        }
    }

    // ------------------------------------------------------------------------
    // Effect Execution
    // ------------------------------------------------------------------------

    pub(crate) async fn execute(self: &Arc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { to, message } => {
                    if let Err(err) = self.deliver(&to, &message).await {
                        if matches!(message, VerificationMessage::Cancel(_)) {
                            debug!("Best-effort cancel to {} failed: {}", to, err);
                        } else {
                            warn!(
                                "Failed to send {} to {}: {}",
                                message.message_type().event_type(),
                                to,
                                err
                            );
                        }
                    }
                }
                Effect::SessionOpened {
                    transaction_id,
                    generation,
                } => self.arm_timer(transaction_id, generation),
                Effect::SessionClosed { transaction_id } => {
                    if let Some((_, timer)) = self.timers.remove(&transaction_id) {
                        timer.abort();
                    }
                }
                Effect::PersistVerified(record) => {
                    if let Err(err) = self.store.save(&record).await {
                        warn!("Failed to persist verified state: {}", err);
                    }
                }
                Effect::Notify(notice) => self.publish(notice),
            }
        }
    }

    async fn deliver(&self, to: &DeviceIdentity, message: &VerificationMessage) -> Result<()> {
        let content = message.to_content()?;
        self.transport
            .send_to_device(message.message_type(), to, content)
            .await
    }

    /// One timer per session, fired after the configured hard timeout
    fn arm_timer(self: &Arc<Self>, transaction_id: TransactionId, generation: u64) {
        let timeout = self.config.session_timeout;
        let weak = Arc::downgrade(self);
        let txn = transaction_id.clone();
        let handle = tokio::spawn(async move {
            sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                enqueue(
                    &shared,
                    txn.clone(),
                    Job::Timeout {
                        transaction_id: txn,
                        generation,
                    },
                );
            }
        });
        if let Some(previous) = self.timers.insert(transaction_id, handle.abort_handle()) {
            previous.abort();
        }
    }

    fn publish(&self, notice: Notice) {
        match notice.level() {
            NoticeLevel::Debug => debug!("{}", notice),
            NoticeLevel::Info => info!("{}", notice),
            NoticeLevel::Warn => warn!("{}", notice),
        }
        // No receivers is fine
        let _ = self.notices.send(notice);
    }
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

/// Drives SAS verification for one connection
pub struct VerificationManager {
    shared: Arc<Shared>,
    local: StdMutex<Option<DeviceIdentity>>,
    subscription: StdMutex<Option<Subscription>>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
}

impl VerificationManager {
    pub fn new(
        transport: Arc<dyn VerificationTransport>,
        store: Arc<dyn VerifiedStateStore>,
        config: VerificationConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                store,
                cache: KeyDirectoryCache::new(config.key_cache_ttl),
                config,
                engine: Mutex::new(None),
                workers: DashMap::new(),
                timers: DashMap::new(),
                notices,
                disposed: AtomicBool::new(false),
            }),
            local: StdMutex::new(None),
            subscription: StdMutex::new(None),
            dispatcher: StdMutex::new(None),
        })
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.shared.config
    }

    /// This device, once [`start`](Self::start) has resolved it
    pub fn local_device(&self) -> Option<DeviceIdentity> {
        lock(&self.local).clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.dispatcher).is_some() && !self.shared.is_disposed()
    }

    /// Resolve identity, subscribe and optionally bootstrap
    ///
    /// Without a device id the manager stays idle and this returns `Ok`.
    pub async fn start(&self) -> Result<()> {
        if self.shared.is_disposed() {
            return Err(VerifyError::disposed());
        }
        if self.is_running() {
            return Ok(());
        }

        let who = self.shared.transport.who_am_i().await?;
        let Some(device_id) = who.device_id else {
            warn!("Device id unavailable for {}; verification disabled", who.user_id);
            return Ok(());
        };
        let local = DeviceIdentity::new(who.user_id, device_id);
        *self.shared.engine.lock().await = Some(VerificationEngine::new(
            local.clone(),
            &self.shared.config,
            SystemTimeSource::new(),
        ));
        *lock(&self.local) = Some(local.clone());

        let (sink, inbound) = mpsc::unbounded_channel();
        let subscription = self.shared.transport.subscribe(sink)?;
        *lock(&self.subscription) = Some(subscription);
        let handle = tokio::spawn(run_dispatcher(
            Arc::clone(&self.shared),
            local.clone(),
            inbound,
        ));
        *lock(&self.dispatcher) = Some(handle);
        info!("Verification manager started for {}", local);

        if self.shared.config.bootstrap_on_start {
            if let Err(err) = self.bootstrap().await {
                warn!("Verification bootstrap failed: {}", err);
            }
        }
        Ok(())
    }

    /// Ask another own device to verify, unless already verified
    ///
    /// Picks the most recently seen device other than this one.
    pub async fn bootstrap(&self) -> Result<Option<TransactionId>> {
        let Some(local) = self.local_device() else {
            return Err(VerifyError::identity_unavailable("manager not started"));
        };
        if self.shared.store.load().await?.verified {
            info!("Device {} already verified; skipping bootstrap", local.device_id);
            return Ok(None);
        }
        let devices = self.shared.transport.list_own_devices().await?;
        let Some(target) = bootstrap_target(&devices, &local.device_id) else {
            info!("No other device to verify with");
            return Ok(None);
        };
        self.request_verification(target).await.map(Some)
    }

    /// Send a `request` to one of the account's other devices
    ///
    /// If the request cannot be delivered the session is discarded.
    pub async fn request_verification(&self, device_id: DeviceId) -> Result<TransactionId> {
        if self.shared.is_disposed() {
            return Err(VerifyError::disposed());
        }
        let transaction_id = TransactionId::generate(Timestamp::now());
        let effects = {
            let mut engine = self.shared.engine.lock().await;
            let engine = engine
                .as_mut()
                .ok_or_else(|| VerifyError::identity_unavailable("manager not started"))?;
            engine.begin_request(device_id, transaction_id.clone())?
        };

        for effect in effects {
            match effect {
                Effect::Send { to, message } => {
                    if let Err(err) = self.shared.deliver(&to, &message).await {
                        warn!("Verification request to {} failed: {}", to, err);
                        let discarded = match self.shared.engine.lock().await.as_mut() {
                            Some(engine) => engine.discard(&transaction_id),
                            None => Vec::new(),
                        };
                        self.shared.execute(discarded).await;
                        return Err(err);
                    }
                }
                other => self.shared.execute(vec![other]).await,
            }
        }
        Ok(transaction_id)
    }

    /// Cancel a session from this side with `m.user`
    pub async fn cancel(&self, transaction_id: &TransactionId) -> bool {
        let effects = match self.shared.engine.lock().await.as_mut() {
            Some(engine) => engine.cancel(transaction_id, CancelCode::User, "Cancelled by user"),
            None => return false,
        };
        let cancelled = !effects.is_empty();
        self.shared.execute(effects).await;
        cancelled
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.shared.notices.subscribe()
    }

    pub async fn active_sessions(&self) -> Vec<TransactionId> {
        self.shared
            .engine
            .lock()
            .await
            .as_ref()
            .map(|engine| engine.active_sessions())
            .unwrap_or_default()
    }

    pub async fn session_state(&self, transaction_id: &TransactionId) -> Option<SessionState> {
        self.shared
            .engine
            .lock()
            .await
            .as_ref()
            .and_then(|engine| engine.session_state(transaction_id))
    }

    /// Stop everything; the manager cannot be restarted
    pub async fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut subscription) = lock(&self.subscription).take() {
            subscription.unsubscribe();
        }
        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
        for timer in self.shared.timers.iter() {
            timer.value().abort();
        }
        self.shared.timers.clear();
        self.shared.workers.clear();
        self.shared.cache.clear().await;
        if let Some(engine) = self.shared.engine.lock().await.as_mut() {
            engine.clear();
        }
        info!("Verification manager disposed");
    }
}

impl Drop for VerificationManager {
    fn drop(&mut self) {
        self.shared.disposed.store(true, Ordering::SeqCst);
        for timer in self.shared.timers.iter() {
            timer.value().abort();
        }
        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
        self.shared.workers.clear();
        if let Ok(mut engine) = self.shared.engine.try_lock() {
            if let Some(engine) = engine.as_mut() {
                engine.clear();
            }
        }
    }
}

/// Most recently seen device that is not `own`
pub fn bootstrap_target(devices: &[OwnDevice], own: &DeviceId) -> Option<DeviceId> {
    devices
        .iter()
        .filter(|device| &device.device_id != own)
        .max_by_key(|device| device.last_seen_ts.unwrap_or(0))
        .map(|device| device.device_id.clone())
}

/// Poisoning only follows a panic elsewhere; the guarded values stay usable
fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, last_seen: Option<u64>) -> OwnDevice {
        OwnDevice {
            device_id: id.into(),
            last_seen_ts: last_seen,
        }
    }

    #[test]
    fn test_bootstrap_target_prefers_recent_devices() {
        let devices = [
            device("DEVA", Some(900)),
            device("DEVB", Some(100)),
            device("DEVC", Some(500)),
            device("DEVD", None),
        ];
        assert_eq!(bootstrap_target(&devices, &"DEVA".into()), Some("DEVC".into()));
        assert_eq!(bootstrap_target(&devices[..1], &"DEVA".into()), None);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let network = keytrust_harness::LoopbackNetwork::new("@alice:example.org");
        let config = VerificationConfig {
            max_concurrent_sessions: 0,
            ..VerificationConfig::testing()
        };
        let result = VerificationManager::new(
            Arc::new(network.anonymous_transport()),
            Arc::new(crate::store::MemoryStateStore::new()),
            config,
        );
        assert!(result.is_err());
    }
}
