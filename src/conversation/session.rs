use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tokio::sync::Mutex;
use tracing::info;

use super::state::ConversationSession;

pub type SharedSession = Arc<Mutex<ConversationSession>>;

/// Per-user dialogue state. Sessions idle longer than the timeout are dropped
/// and the user starts again from the main menu.
#[derive(Clone)]
pub struct SessionStore {
    cache: Cache<i64, SharedSession>,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration) -> Self {
        let cache = Cache::builder()
            .time_to_idle(idle_timeout)
            .eviction_listener(|user: Arc<i64>, _session: SharedSession, cause| {
                info!("Session expired: user={}, cause={:?}", user, cause);
            })
            .build();
        Self { cache }
    }

    pub async fn get(&self, user_id: i64) -> Option<SharedSession> {
        self.cache.get(&user_id).await
    }

    pub async fn get_or_create(&self, user_id: i64) -> SharedSession {
        self.cache
            .get_with(user_id, async { Arc::new(Mutex::new(ConversationSession::new())) })
            .await
    }

    pub async fn remove(&self, user_id: i64) {
        self.cache.invalidate(&user_id).await;
    }

    /// Drops every session (shutdown and tests).
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}
