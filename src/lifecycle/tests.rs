use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::tempdir;
use tenant_plugin::UnitState;

use super::*;
use crate::registry::{NewTenant, PlatformStats, SqliteRegistry, User};
use crate::test_util::{
    MockHost, MockInstaller, MockProvider, StaticPackages, TestPlatform, WEBHOOK_BASE,
    tenant_token,
};

const ECHO: &str = "fn on_update(update) { @@echo }";

#[tokio::test]
async fn start_registers_webhook_and_runtime() {
    let dir = tempdir().unwrap();
    let p = TestPlatform::new(dir.path());
    let token = tenant_token(1);
    let bot = p.seed_bot(7, &token, "echo_bot", ECHO).await;

    p.lifecycle.start(&token).await.unwrap();

    assert_eq!(p.bot(&token).await.status, LifecycleStatus::Running);
    assert!(p.lifecycle.route(&bot.short_id).is_some());
    assert_eq!(
        p.provider.webhook(&token),
        Some(format!("{WEBHOOK_BASE}/bot/{}", bot.short_id))
    );
    assert_eq!(p.lifecycle.running_count(), 1);
}

#[tokio::test]
async fn starting_a_running_tenant_is_a_no_op() {
    let dir = tempdir().unwrap();
    let p = TestPlatform::new(dir.path());
    let token = tenant_token(1);
    p.seed_bot(7, &token, "echo_bot", ECHO).await;

    p.lifecycle.start(&token).await.unwrap();
    p.lifecycle.start(&token).await.unwrap();

    assert_eq!(p.host.load_count(), 1);
    assert_eq!(p.lifecycle.running_count(), 1);
}

#[tokio::test]
async fn failing_program_ends_in_error_with_diagnostic() {
    let dir = tempdir().unwrap();
    let p = TestPlatform::new(dir.path());
    let token = tenant_token(1);
    let bot = p
        .seed_bot(7, &token, "broken_bot", "fn on_update(u) {} @@init_fail")
        .await;

    let err = p.lifecycle.start(&token).await.unwrap_err();
    assert!(matches!(err, PlatformError::CodeLoad(_)));

    let stored = p.bot(&token).await;
    assert_eq!(stored.status, LifecycleStatus::Error);
    assert!(stored.last_error.unwrap().contains("boom at load"));
    assert!(p.lifecycle.route(&bot.short_id).is_none());
    assert!(p.provider.webhook(&token).is_none());
}

#[tokio::test]
async fn revoked_credential_stops_the_new_unit() {
    let dir = tempdir().unwrap();
    let p = TestPlatform::new(dir.path());
    let token = tenant_token(1);
    p.seed_bot(7, &token, "echo_bot", ECHO).await;
    p.provider.revoke(&token);

    let err = p.lifecycle.start(&token).await.unwrap_err();
    assert!(matches!(err, PlatformError::Validation(_)));
    assert_eq!(p.bot(&token).await.status, LifecycleStatus::Error);
    assert!(!p.lifecycle.is_running(&token));
}

#[tokio::test]
async fn dependency_failure_aborts_start() {
    let dir = tempdir().unwrap();
    let p = TestPlatform::builder()
        .installer(MockInstaller::failing("no such package: requests"))
        .build(dir.path());
    let token = tenant_token(1);
    p.seed_bot(
        7,
        &token,
        "deps_bot",
        "import \"requests\" as r;\nimport \"json\" as j;\nfn on_update(u) {}",
    )
    .await;

    let err = p.lifecycle.start(&token).await.unwrap_err();
    assert!(matches!(err, PlatformError::DependencyInstall(_)));
    assert_eq!(p.installer.calls().await, vec![vec!["requests".to_string()]]);

    let stored = p.bot(&token).await;
    assert_eq!(stored.status, LifecycleStatus::Error);
    assert!(stored.last_error.unwrap().contains("no such package"));
    assert_eq!(p.host.load_count(), 0);
}

#[tokio::test]
async fn installed_dependencies_are_not_reinstalled() {
    let dir = tempdir().unwrap();
    let p = TestPlatform::builder().installed("requests").build(dir.path());
    let token = tenant_token(1);
    p.seed_bot(7, &token, "deps_bot", "import \"requests\" as r;\nfn on_update(u) {}")
        .await;

    p.lifecycle.start(&token).await.unwrap();
    assert!(p.installer.calls().await.is_empty());
}

#[tokio::test]
async fn stop_removes_runtime_and_webhook() {
    let dir = tempdir().unwrap();
    let p = TestPlatform::new(dir.path());
    let token = tenant_token(1);
    let bot = p.seed_bot(7, &token, "echo_bot", ECHO).await;
    p.lifecycle.start(&token).await.unwrap();

    p.lifecycle.stop(&token).await.unwrap();

    assert_eq!(p.bot(&token).await.status, LifecycleStatus::Stopped);
    assert!(p.lifecycle.route(&bot.short_id).is_none());
    assert!(p.provider.webhook(&token).is_none());
}

#[tokio::test]
async fn restart_loads_the_program_again() {
    let dir = tempdir().unwrap();
    let p = TestPlatform::new(dir.path());
    let token = tenant_token(1);
    p.seed_bot(7, &token, "echo_bot", ECHO).await;
    p.lifecycle.start(&token).await.unwrap();

    p.lifecycle.restart(&token).await.unwrap();

    assert_eq!(p.host.load_count(), 2);
    assert_eq!(p.bot(&token).await.status, LifecycleStatus::Running);
    assert_eq!(p.lifecycle.running_count(), 1);
}

#[tokio::test]
async fn blocked_tenant_cannot_start_until_unblocked() {
    let dir = tempdir().unwrap();
    let p = TestPlatform::new(dir.path());
    let token = tenant_token(1);
    p.seed_bot(7, &token, "echo_bot", ECHO).await;
    p.lifecycle.start(&token).await.unwrap();

    p.lifecycle.block(&token).await.unwrap();
    assert_eq!(p.bot(&token).await.status, LifecycleStatus::Blocked);
    assert!(!p.lifecycle.is_running(&token));

    assert!(matches!(p.lifecycle.start(&token).await, Err(PlatformError::Blocked)));
    assert!(matches!(p.lifecycle.restart(&token).await, Err(PlatformError::Blocked)));
    p.lifecycle.stop(&token).await.unwrap();
    assert_eq!(p.bot(&token).await.status, LifecycleStatus::Blocked);

    p.lifecycle.unblock(&token).await.unwrap();
    assert_eq!(p.bot(&token).await.status, LifecycleStatus::Stopped);
    p.lifecycle.start(&token).await.unwrap();
    assert!(p.lifecycle.is_running(&token));
}

#[tokio::test]
async fn delete_removes_record_and_artifact() {
    let dir = tempdir().unwrap();
    let p = TestPlatform::new(dir.path());
    let token = tenant_token(1);
    let bot = p.seed_bot(7, &token, "echo_bot", ECHO).await;
    p.lifecycle.start(&token).await.unwrap();

    p.lifecycle.delete(&token).await.unwrap();

    assert!(p.registry.get_by_token(&token).await.unwrap().is_none());
    assert!(!p.artifacts.exists(&bot.code_location).await);
    assert!(!p.lifecycle.is_running(&token));
    assert!(matches!(
        p.lifecycle.delete(&token).await,
        Err(PlatformError::NotFound(_))
    ));
}

#[tokio::test]
async fn unknown_token_is_not_found() {
    let dir = tempdir().unwrap();
    let p = TestPlatform::new(dir.path());
    assert!(matches!(
        p.lifecycle.start(&tenant_token(99)).await,
        Err(PlatformError::NotFound(_))
    ));
}

#[tokio::test]
async fn restore_brings_back_running_tenants_only() {
    let dir = tempdir().unwrap();
    let p = TestPlatform::new(dir.path());

    let good = tenant_token(1);
    let broken = tenant_token(2);
    let idle = tenant_token(3);
    let interrupted = tenant_token(4);
    p.seed_bot(7, &good, "good_bot", ECHO).await;
    let broken_bot = p
        .seed_bot(7, &broken, "broken_bot", "fn on_update(u) {} @@init_fail")
        .await;
    p.seed_bot(7, &idle, "idle_bot", ECHO).await;
    p.seed_bot(7, &interrupted, "half_bot", ECHO).await;

    for token in [&good, &broken] {
        p.registry
            .update_status(token, LifecycleStatus::Running, None)
            .await
            .unwrap();
    }
    p.registry
        .update_status(&interrupted, LifecycleStatus::Starting, None)
        .await
        .unwrap();

    let report = p.lifecycle.restore_all().await.unwrap();

    assert_eq!(report.attempted, 2);
    assert_eq!(report.restored, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, broken_bot.short_id);
    assert!(p.lifecycle.is_running(&good));
    assert!(!p.lifecycle.is_running(&idle));
    assert_eq!(p.bot(&broken).await.status, LifecycleStatus::Error);
    assert_eq!(p.bot(&idle).await.status, LifecycleStatus::Stopped);
    assert_eq!(p.bot(&interrupted).await.status, LifecycleStatus::Error);
}

#[tokio::test]
async fn shutdown_keeps_persisted_status_for_next_boot() {
    let dir = tempdir().unwrap();
    let p = TestPlatform::new(dir.path());
    let token = tenant_token(1);
    p.seed_bot(7, &token, "echo_bot", ECHO).await;
    p.lifecycle.start(&token).await.unwrap();

    p.lifecycle.shutdown().await;

    assert_eq!(p.lifecycle.running_count(), 0);
    assert_eq!(p.bot(&token).await.status, LifecycleStatus::Running);
}

#[tokio::test]
async fn concurrent_operations_on_one_tenant_stay_consistent() {
    let dir = tempdir().unwrap();
    let p = Arc::new(TestPlatform::new(dir.path()));
    let token = tenant_token(1);
    p.seed_bot(7, &token, "echo_bot", ECHO).await;

    let mut tasks = Vec::new();
    for i in 0..10 {
        let p = p.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                p.lifecycle.start(&token).await
            } else {
                p.lifecycle.stop(&token).await
            }
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let status = p.bot(&token).await.status;
    let running = p.lifecycle.is_running(&token);
    match status {
        LifecycleStatus::Running => assert!(running),
        LifecycleStatus::Stopped => assert!(!running),
        other => panic!("unexpected status {other}"),
    }
    assert!(p.lifecycle.running_count() <= 1);
}

#[tokio::test]
async fn restore_fails_only_the_tenant_whose_program_is_gone() {
    let dir = tempdir().unwrap();
    let p = TestPlatform::new(dir.path());
    let good = tenant_token(1);
    let gone = tenant_token(2);
    p.seed_bot(7, &good, "good_bot", ECHO).await;
    let gone_bot = p.seed_bot(8, &gone, "gone_bot", ECHO).await;
    for token in [&good, &gone] {
        p.registry
            .update_status(token, LifecycleStatus::Running, None)
            .await
            .unwrap();
    }
    p.artifacts.remove(&gone_bot.code_location).await;

    let report = p.lifecycle.restore_all().await.unwrap();

    assert_eq!(report.attempted, 2);
    assert_eq!(report.restored, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, gone_bot.short_id);
    assert!(p.lifecycle.is_running(&good));
    assert!(!p.lifecycle.is_running(&gone));

    let stored = p.bot(&gone).await;
    assert_eq!(stored.status, LifecycleStatus::Error);
    let diagnostic = stored.last_error.unwrap();
    assert!(diagnostic.contains("not found"));
    assert!(!diagnostic.contains(&dir.path().display().to_string()));
}

#[tokio::test]
async fn starting_over_a_stale_handle_stops_the_old_unit() {
    let dir = tempdir().unwrap();
    let p = TestPlatform::new(dir.path());
    let token = tenant_token(1);
    let bot = p.seed_bot(7, &token, "echo_bot", ECHO).await;
    p.lifecycle.start(&token).await.unwrap();
    let first = p.lifecycle.route(&bot.short_id).unwrap();

    // persisted status out of step with the live map
    p.registry
        .update_status(&token, LifecycleStatus::Stopped, None)
        .await
        .unwrap();
    p.lifecycle.start(&token).await.unwrap();

    let second = p.lifecycle.route(&bot.short_id).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(first.unit.state(), UnitState::Stopped);
    assert_eq!(second.unit.state(), UnitState::Running);
    assert_eq!(p.lifecycle.running_count(), 1);
}

#[tokio::test]
async fn delete_keeps_the_lock_while_others_wait_on_it() {
    let dir = tempdir().unwrap();
    let p = TestPlatform::new(dir.path());
    let token = tenant_token(1);
    p.seed_bot(7, &token, "echo_bot", ECHO).await;

    let queued = p.lifecycle.lock_for(&token);
    p.lifecycle.delete(&token).await.unwrap();
    assert!(Arc::ptr_eq(&queued, &p.lifecycle.lock_for(&token)));
    drop(queued);

    p.seed_bot(7, &token, "echo_bot", ECHO).await;
    p.lifecycle.delete(&token).await.unwrap();
    assert!(!p.lifecycle.locks.contains_key(&token));
}

/// Delegates to SQLite but refuses to persist `Running`.
struct RunningNotPersisted(SqliteRegistry);

#[async_trait]
impl TenantRegistry for RunningNotPersisted {
    async fn upsert_user(
        &self,
        id: i64,
        handle: Option<&str>,
        display_name: &str,
    ) -> PlatformResult<User> {
        self.0.upsert_user(id, handle, display_name).await
    }

    async fn get_user(&self, id: i64) -> PlatformResult<Option<User>> {
        self.0.get_user(id).await
    }

    async fn list_users(&self, limit: usize) -> PlatformResult<Vec<User>> {
        self.0.list_users(limit).await
    }

    async fn all_user_ids(&self) -> PlatformResult<Vec<i64>> {
        self.0.all_user_ids().await
    }

    async fn upsert(&self, tenant: NewTenant) -> PlatformResult<TenantBot> {
        self.0.upsert(tenant).await
    }

    async fn get_by_token(&self, token: &str) -> PlatformResult<Option<TenantBot>> {
        self.0.get_by_token(token).await
    }

    async fn find_by_short_id(&self, short_id: &str) -> PlatformResult<Option<TenantBot>> {
        self.0.find_by_short_id(short_id).await
    }

    async fn find_by_token_prefix(&self, prefix: &str) -> PlatformResult<Option<TenantBot>> {
        self.0.find_by_token_prefix(prefix).await
    }

    async fn list_by_owner(&self, owner_id: i64) -> PlatformResult<Vec<TenantBot>> {
        self.0.list_by_owner(owner_id).await
    }

    async fn list_bots(&self, limit: usize) -> PlatformResult<Vec<TenantBot>> {
        self.0.list_bots(limit).await
    }

    async fn list_by_status(&self, status: LifecycleStatus) -> PlatformResult<Vec<TenantBot>> {
        self.0.list_by_status(status).await
    }

    async fn update_status(
        &self,
        token: &str,
        status: LifecycleStatus,
        error: Option<String>,
    ) -> PlatformResult<()> {
        if status == LifecycleStatus::Running {
            return Err(PlatformError::Persistence("disk full".into()));
        }
        self.0.update_status(token, status, error).await
    }

    async fn increment_event_count(&self, token: &str) -> PlatformResult<()> {
        self.0.increment_event_count(token).await
    }

    async fn delete(&self, token: &str) -> PlatformResult<bool> {
        self.0.delete(token).await
    }

    async fn aggregate_stats(&self) -> PlatformResult<PlatformStats> {
        self.0.aggregate_stats().await
    }
}

#[tokio::test]
async fn unpersisted_start_leaves_no_live_unit() {
    let dir = tempdir().unwrap();
    let registry: Arc<dyn TenantRegistry> =
        Arc::new(RunningNotPersisted(SqliteRegistry::open_in_memory().unwrap()));
    let artifacts = ArtifactStore::new(dir.path());
    let provider = Arc::new(MockProvider::new());
    let host = Arc::new(MockHost::new());
    let lifecycle = LifecycleManager::new(
        registry.clone(),
        artifacts.clone(),
        Arc::new(DependencyResolver::new(
            BTreeMap::new(),
            Arc::new(StaticPackages(HashSet::new())),
            Arc::new(MockInstaller::new()),
        )),
        host,
        provider.clone(),
        LifecycleSettings {
            webhook_base: WEBHOOK_BASE.to_string(),
            restart_settle: Duration::from_millis(10),
        },
        Telemetry::detached(),
    );
    let token = tenant_token(1);
    provider.accept(&token, "echo_bot");
    let location = artifacts.store(7, "echo_bot", "rhai", ECHO).await.unwrap();
    let bot = registry
        .upsert(NewTenant {
            owner_id: 7,
            token: token.clone(),
            code_location: location,
            creation_type: crate::registry::CreationType::Uploaded,
            public_handle: "echo_bot".into(),
        })
        .await
        .unwrap();

    let err = lifecycle.start(&token).await.unwrap_err();

    assert!(matches!(err, PlatformError::Persistence(_)));
    assert!(!lifecycle.is_running(&token));
    assert!(lifecycle.route(&bot.short_id).is_none());
    assert!(provider.webhook(&token).is_none());
}
