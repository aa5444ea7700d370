//! Per-tenant state machine and the set of live runtimes.
//!
//! ```text
//! Stopped/Error --start--> Starting --ok--> Running
//!                                  \--fail--> Error
//! Running --stop--> Stopped      any --block--> Blocked --unblock--> Stopped
//! ```
//!
//! Every operation on one tenant holds that tenant's lock for its whole
//! duration; operations on different tenants run concurrently.

pub mod runtime;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use tenant_plugin::{ExecutionHost, LoadRequest};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::artifacts::ArtifactStore;
use crate::deps::DependencyResolver;
use crate::error::{PlatformError, PlatformResult};
use crate::logger::Telemetry;
use crate::provider::MessagingProvider;
use crate::registry::{LifecycleStatus, TenantBot, TenantRegistry};

pub use runtime::{RuntimeHandle, RuntimeRegistry};

/// How many persisted tenants are brought up at once during restore.
const RESTORE_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Public base URL; callbacks go to `{base}/bot/{short_id}`.
    pub webhook_base: String,
    pub restart_settle: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub attempted: usize,
    pub restored: usize,
    /// `(short_id, diagnostic)` per tenant that did not come back.
    pub failed: Vec<(String, String)>,
}

pub struct LifecycleManager {
    registry: Arc<dyn TenantRegistry>,
    artifacts: ArtifactStore,
    resolver: Arc<DependencyResolver>,
    host: Arc<dyn ExecutionHost>,
    provider: Arc<dyn MessagingProvider>,
    settings: LifecycleSettings,
    telemetry: Telemetry,
    runtimes: RuntimeRegistry,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<dyn TenantRegistry>,
        artifacts: ArtifactStore,
        resolver: Arc<DependencyResolver>,
        host: Arc<dyn ExecutionHost>,
        provider: Arc<dyn MessagingProvider>,
        settings: LifecycleSettings,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            registry,
            artifacts,
            resolver,
            host,
            provider,
            settings,
            telemetry,
            runtimes: RuntimeRegistry::new(),
            locks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn TenantRegistry> {
        &self.registry
    }

    pub fn host(&self) -> &Arc<dyn ExecutionHost> {
        &self.host
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn webhook_url(&self, route_id: &str) -> String {
        format!("{}/bot/{route_id}", self.settings.webhook_base.trim_end_matches('/'))
    }

    fn lock_for(&self, token: &str) -> Arc<Mutex<()>> {
        self.locks.entry(token.to_string()).or_default().clone()
    }

    async fn load_bot(&self, token: &str) -> PlatformResult<TenantBot> {
        self.registry
            .get_by_token(token)
            .await?
            .ok_or_else(|| PlatformError::NotFound("bot".into()))
    }

    /// Live runtime for a route identity.
    pub fn route(&self, route_id: &str) -> Option<Arc<RuntimeHandle>> {
        self.runtimes.by_route(route_id)
    }

    pub fn is_running(&self, token: &str) -> bool {
        self.runtimes.get(token).is_some()
    }

    pub fn running_count(&self) -> usize {
        self.runtimes.len()
    }

    pub async fn start(&self, token: &str) -> PlatformResult<()> {
        let lock = self.lock_for(token);
        let _guard = lock.lock().await;
        self.start_locked(token).await
    }

    pub async fn stop(&self, token: &str) -> PlatformResult<()> {
        let lock = self.lock_for(token);
        let _guard = lock.lock().await;

        let bot = self.load_bot(token).await?;
        self.tear_down(&bot).await;
        if bot.status != LifecycleStatus::Blocked {
            self.registry
                .update_status(token, LifecycleStatus::Stopped, None)
                .await?;
        }
        info!(bot = %bot.short_id, "stopped");
        Ok(())
    }

    /// Stop, wait for the provider to settle, start. One critical section.
    pub async fn restart(&self, token: &str) -> PlatformResult<()> {
        let lock = self.lock_for(token);
        let _guard = lock.lock().await;

        let bot = self.load_bot(token).await?;
        if bot.status == LifecycleStatus::Blocked {
            return Err(PlatformError::Blocked);
        }
        self.tear_down(&bot).await;
        self.registry
            .update_status(token, LifecycleStatus::Stopped, None)
            .await?;
        tokio::time::sleep(self.settings.restart_settle).await;
        self.start_locked(token).await
    }

    pub async fn block(&self, token: &str) -> PlatformResult<()> {
        let lock = self.lock_for(token);
        let _guard = lock.lock().await;

        let bot = self.load_bot(token).await?;
        self.tear_down(&bot).await;
        self.registry
            .update_status(token, LifecycleStatus::Blocked, None)
            .await?;
        warn!(bot = %bot.short_id, owner = bot.owner_id, "blocked");
        Ok(())
    }

    /// Back to Stopped. The tenant has to be started explicitly.
    pub async fn unblock(&self, token: &str) -> PlatformResult<()> {
        let lock = self.lock_for(token);
        let _guard = lock.lock().await;

        let bot = self.load_bot(token).await?;
        if bot.status == LifecycleStatus::Blocked {
            self.registry
                .update_status(token, LifecycleStatus::Stopped, None)
                .await?;
            info!(bot = %bot.short_id, "unblocked");
        }
        Ok(())
    }

    pub async fn delete(&self, token: &str) -> PlatformResult<()> {
        let lock = self.lock_for(token);
        let _guard = lock.lock().await;

        let bot = self.load_bot(token).await?;
        self.tear_down(&bot).await;
        self.registry.delete(token).await?;
        self.artifacts.remove(&bot.code_location).await;
        // Drop the lock entry only if nobody else is queued on it: the map
        // and this call hold the only references.
        self.locks
            .remove_if(token, |_, l| Arc::ptr_eq(l, &lock) && Arc::strong_count(l) == 2);
        info!(bot = %bot.short_id, "deleted");
        Ok(())
    }

    /// Bring back everything persisted as Running. Tenants caught mid-start
    /// by the last shutdown are marked Error.
    pub async fn restore_all(&self) -> PlatformResult<RestoreReport> {
        for bot in self.registry.list_by_status(LifecycleStatus::Starting).await? {
            warn!(bot = %bot.short_id, "was starting at shutdown, marking as error");
            self.registry
                .update_status(
                    &bot.token,
                    LifecycleStatus::Error,
                    Some("interrupted while starting".into()),
                )
                .await?;
        }

        let bots = self.registry.list_by_status(LifecycleStatus::Running).await?;
        let mut report = RestoreReport {
            attempted: bots.len(),
            ..Default::default()
        };

        let outcomes: Vec<_> = futures::stream::iter(bots)
            .map(|bot| async move {
                let result = self.start(&bot.token).await;
                (bot.short_id, result)
            })
            .buffer_unordered(RESTORE_CONCURRENCY)
            .collect()
            .await;

        for (short_id, result) in outcomes {
            match result {
                Ok(()) => report.restored += 1,
                Err(e) => report.failed.push((short_id, e.diagnostic())),
            }
        }
        info!(
            "restored {}/{} bots ({} failed)",
            report.restored,
            report.attempted,
            report.failed.len()
        );
        Ok(report)
    }

    /// Stop every live unit without touching persisted status, so the next
    /// boot restores the same set.
    pub async fn shutdown(&self) {
        for token in self.runtimes.tokens() {
            let lock = self.lock_for(&token);
            let _guard = lock.lock().await;
            if let Some(handle) = self.runtimes.remove(&token) {
                if let Err(e) = handle.unit.stop().await {
                    warn!(route = %handle.route_id, "unit did not stop cleanly: {e}");
                }
            }
        }
        info!("all tenant runtimes stopped");
    }

    async fn start_locked(&self, token: &str) -> PlatformResult<()> {
        let bot = self.load_bot(token).await?;
        match bot.status {
            LifecycleStatus::Blocked => return Err(PlatformError::Blocked),
            LifecycleStatus::Running if self.runtimes.get(token).is_some() => return Ok(()),
            _ => {}
        }

        self.registry
            .update_status(token, LifecycleStatus::Starting, None)
            .await?;

        match self.bring_up(&bot).await {
            Ok(handle) => {
                if let Err(err) = self
                    .registry
                    .update_status(token, LifecycleStatus::Running, None)
                    .await
                {
                    let _ = self.provider.delete_webhook(token).await;
                    if let Err(e) = handle.unit.stop().await {
                        warn!(bot = %bot.short_id, "unit did not stop cleanly: {e}");
                    }
                    return Err(err);
                }
                if let Some(replaced) = self.runtimes.insert(handle) {
                    warn!(bot = %bot.short_id, "replacing a live unit");
                    if let Err(e) = replaced.unit.stop().await {
                        warn!(bot = %bot.short_id, "replaced unit did not stop cleanly: {e}");
                    }
                }
                info!(bot = %bot.short_id, owner = bot.owner_id, "running");
                Ok(())
            }
            Err(err) => {
                let diagnostic = err.diagnostic();
                warn!(bot = %bot.short_id, "start failed: {diagnostic}");
                self.telemetry.lifecycle_failures.add(1, &[]);
                self.registry
                    .update_status(token, LifecycleStatus::Error, Some(diagnostic))
                    .await?;
                Err(err)
            }
        }
    }

    async fn bring_up(&self, bot: &TenantBot) -> PlatformResult<RuntimeHandle> {
        let source = self.artifacts.read(&bot.code_location).await?;
        self.resolver.ensure(&source).await?;

        let unit = self
            .host
            .load(LoadRequest {
                route_id: bot.short_id.clone(),
                source,
            })
            .await
            .map_err(|e| PlatformError::CodeLoad(e.to_string()))?;

        let activated: PlatformResult<()> = async {
            self.provider.get_me(&bot.token).await?;
            unit.start()
                .await
                .map_err(|e| PlatformError::CodeLoad(e.to_string()))?;
            self.provider
                .set_webhook(&bot.token, &self.webhook_url(&bot.short_id))
                .await?;
            Ok(())
        }
        .await;

        if let Err(err) = activated {
            let _ = unit.stop().await;
            return Err(err);
        }
        Ok(RuntimeHandle::new(bot.token.clone(), bot.short_id.clone(), unit))
    }

    /// Best-effort callback deregistration, then drop the live unit.
    async fn tear_down(&self, bot: &TenantBot) {
        if let Err(e) = self.provider.delete_webhook(&bot.token).await {
            warn!(bot = %bot.short_id, "webhook deregistration failed: {e}");
        }
        if let Some(handle) = self.runtimes.remove(&bot.token) {
            if let Err(e) = handle.unit.stop().await {
                warn!(bot = %bot.short_id, "unit did not stop cleanly: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests;
