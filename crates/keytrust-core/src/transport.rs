//! Transport adapter seam
//!
//! The verification core never talks to a homeserver itself. Message
//! delivery, identity discovery and key directory lookups come from an
//! implementation of [`VerificationTransport`].

use core::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::directory::KeysQueryResponse;
use crate::errors::Result;
use crate::protocol::MessageType;
use crate::types::{DeviceId, DeviceIdentity, OwnDevice, UserId};

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// Everything the verification manager needs from the messaging layer
#[async_trait]
pub trait VerificationTransport: Send + Sync {
    /// Deliver a verification message to one device
    async fn send_to_device(
        &self,
        message_type: MessageType,
        to: &DeviceIdentity,
        content: Value,
    ) -> Result<()>;

    /// Resolve this connection's account and device
    async fn who_am_i(&self) -> Result<WhoAmI>;

    /// List the account's devices
    async fn list_own_devices(&self) -> Result<Vec<OwnDevice>>;

    /// Fetch device and cross-signing keys for an account
    async fn query_keys(&self, user_id: &UserId) -> Result<KeysQueryResponse>;

    /// Start forwarding inbound to-device events into `sink`
    fn subscribe(&self, sink: mpsc::UnboundedSender<InboundEvent>) -> Result<Subscription>;
}

/// Identity reported by the transport; the device id may be unknown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoAmI {
    pub user_id: UserId,
    pub device_id: Option<DeviceId>,
}

/// A raw to-device event
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub event_type: String,
    pub sender: UserId,
    pub content: Value,
}

// ----------------------------------------------------------------------------
// Subscription Handle
// ----------------------------------------------------------------------------

/// Handle for an inbound event subscription
///
/// Unsubscribing is idempotent and also happens on drop.
pub struct Subscription {
    on_unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new<F>(on_unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            on_unsubscribe: Some(Box::new(on_unsubscribe)),
        }
    }

    /// A subscription with nothing to release
    pub fn noop() -> Self {
        Self {
            on_unsubscribe: None,
        }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(release) = self.on_unsubscribe.take() {
            release();
        }
    }

    pub fn is_active(&self) -> bool {
        self.on_unsubscribe.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
