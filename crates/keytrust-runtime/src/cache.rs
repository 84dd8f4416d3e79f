//! Short-lived key directory cache
//!
//! A verification looks up the same account's keys twice in quick
//! succession (our MAC, then theirs). Snapshots are reused for a short TTL.

use std::collections::HashMap;

use keytrust_core::{KeysQueryResponse, Result, UserId, VerificationTransport};
use tokio::{
    sync::Mutex,
    time::{Duration, Instant},
};
use tracing::trace;

#[derive(Debug)]
struct CachedDirectory {
    fetched_at: Instant,
    response: KeysQueryResponse,
}

/// Key query results per account, expiring after `ttl`
#[derive(Debug)]
pub struct KeyDirectoryCache {
    ttl: Duration,
    entries: Mutex<HashMap<UserId, CachedDirectory>>,
}

impl KeyDirectoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached snapshot, or a fresh query when absent or expired
    ///
    /// The lock is released while the transport is queried; concurrent
    /// misses may both query and the later result wins.
    pub async fn get_or_fetch(
        &self,
        user_id: &UserId,
        transport: &dyn VerificationTransport,
    ) -> Result<KeysQueryResponse> {
        {
            let entries = self.entries.lock().await;
            if let Some(cached) = entries.get(user_id) {
                if cached.fetched_at.elapsed() < self.ttl {
                    trace!("Key directory cache hit for {}", user_id);
                    return Ok(cached.response.clone());
                }
            }
        }

        let response = transport.query_keys(user_id).await?;
        self.entries.lock().await.insert(
            user_id.clone(),
            CachedDirectory {
                fetched_at: Instant::now(),
                response: response.clone(),
            },
        );
        Ok(response)
    }

    pub async fn invalidate(&self, user_id: &UserId) {
        self.entries.lock().await.remove(user_id);
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}
