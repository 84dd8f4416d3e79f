//! One verification manager per connection
//!
//! Concurrent `ensure_started` calls for the same connection share a single
//! start; a failed start leaves the slot empty so the next call retries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use keytrust_core::Result;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::manager::VerificationManager;

type Slot = Arc<OnceCell<Arc<VerificationManager>>>;

#[derive(Default)]
pub struct ManagerRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The running manager for `connection_id`, built and started on first use
    pub async fn ensure_started<F, Fut>(
        &self,
        connection_id: &str,
        factory: F,
    ) -> Result<Arc<VerificationManager>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<VerificationManager>>,
    {
        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(slots.entry(connection_id.to_string()).or_default())
        };
        let manager = slot
            .get_or_try_init(|| async {
                let manager = Arc::new(factory().await?);
                if let Err(err) = manager.start().await {
                    warn!("Verification manager for {} failed to start: {}", connection_id, err);
                    manager.dispose().await;
                    return Err(err);
                }
                debug!("Verification manager registered for {}", connection_id);
                Ok::<_, keytrust_core::VerifyError>(manager)
            })
            .await?;
        Ok(Arc::clone(manager))
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<VerificationManager>> {
        let slots = self.slots.lock().await;
        slots.get(connection_id).and_then(|slot| slot.get().cloned())
    }

    /// Dispose and forget the manager for `connection_id`
    pub async fn stop(&self, connection_id: &str) -> bool {
        let slot = self.slots.lock().await.remove(connection_id);
        match slot.and_then(|slot| slot.get().cloned()) {
            Some(manager) => {
                manager.dispose().await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let slots: Vec<Slot> = self.slots.lock().await.drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Some(manager) = slot.get() {
                manager.dispose().await;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }
}
