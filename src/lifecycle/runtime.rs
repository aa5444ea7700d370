use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tenant_plugin::RunnableUnit;

/// A live tenant program. Present exactly while the tenant is Running.
pub struct RuntimeHandle {
    pub token: String,
    pub route_id: String,
    pub unit: Arc<dyn RunnableUnit>,
    pub started_at: DateTime<Utc>,
}

impl RuntimeHandle {
    pub fn new(
        token: impl Into<String>,
        route_id: impl Into<String>,
        unit: Arc<dyn RunnableUnit>,
    ) -> Self {
        Self {
            token: token.into(),
            route_id: route_id.into(),
            unit,
            started_at: Utc::now(),
        }
    }
}

/// Active runtimes keyed by credential, with a route identity index.
/// Only the lifecycle manager writes; the webhook reads concurrently.
#[derive(Default)]
pub struct RuntimeRegistry {
    by_token: DashMap<String, Arc<RuntimeHandle>>,
    by_route: DashMap<String, String>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle it replaced, if any.
    pub fn insert(&self, handle: RuntimeHandle) -> Option<Arc<RuntimeHandle>> {
        let handle = Arc::new(handle);
        self.by_route.insert(handle.route_id.clone(), handle.token.clone());
        self.by_token.insert(handle.token.clone(), handle)
    }

    pub fn remove(&self, token: &str) -> Option<Arc<RuntimeHandle>> {
        let (_, handle) = self.by_token.remove(token)?;
        self.by_route.remove_if(&handle.route_id, |_, t| t == token);
        Some(handle)
    }

    pub fn get(&self, token: &str) -> Option<Arc<RuntimeHandle>> {
        self.by_token.get(token).map(|h| h.value().clone())
    }

    pub fn by_route(&self, route_id: &str) -> Option<Arc<RuntimeHandle>> {
        let token = self.by_route.get(route_id)?.value().clone();
        self.get(&token)
    }

    pub fn tokens(&self) -> Vec<String> {
        self.by_token.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tenant_plugin::{OutboundAction, PluginError, TenantEvent, UnitState};

    struct Idle;

    #[async_trait]
    impl RunnableUnit for Idle {
        fn name(&self) -> String {
            "idle".into()
        }
        fn state(&self) -> UnitState {
            UnitState::Running
        }
        async fn start(&self) -> Result<(), PluginError> {
            Ok(())
        }
        async fn stop(&self) -> Result<(), PluginError> {
            Ok(())
        }
        async fn deliver(&self, _event: TenantEvent) -> Result<Vec<OutboundAction>, PluginError> {
            Ok(vec![])
        }
    }

    #[test]
    fn route_index_follows_inserts_and_removes() {
        let reg = RuntimeRegistry::new();
        assert!(reg.insert(RuntimeHandle::new("1:a", "route_a", Arc::new(Idle))).is_none());
        assert_eq!(reg.by_route("route_a").unwrap().token, "1:a");
        assert_eq!(reg.len(), 1);

        assert!(reg.remove("1:a").is_some());
        assert!(reg.by_route("route_a").is_none());
        assert!(reg.is_empty());
        assert!(reg.remove("1:a").is_none());
    }
}
