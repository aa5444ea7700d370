use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::admin::AdminConsole;
use crate::artifacts::ArtifactStore;
use crate::config::PlatformConfig;
use crate::conversation::{ConversationEngine, ConversationSettings};
use crate::deps::installer::{CommandInstaller, ModuleDirectoryIndex};
use crate::deps::DependencyResolver;
use crate::generation::OpenAiGenerator;
use crate::host::RhaiHost;
use crate::lifecycle::{LifecycleManager, LifecycleSettings, RestoreReport};
use crate::logger::Telemetry;
use crate::provider::{MessagingProvider, TelegramClient};
use crate::registry::SqliteRegistry;
use crate::webhook::{self, IncomingHandler, WebhookState};

/// The wired platform: registry, lifecycle, conversation engine and the
/// HTTP ingress in front of them.
pub struct App {
    config: PlatformConfig,
    telemetry: Telemetry,
    provider: Arc<dyn MessagingProvider>,
    lifecycle: Arc<LifecycleManager>,
    engine: Arc<ConversationEngine>,
    shutdown: CancellationToken,
    server: Option<JoinHandle<Result<()>>>,
}

impl App {
    /// Build every component from configuration. Nothing is started yet.
    pub async fn bootstrap(config: PlatformConfig, telemetry: Telemetry) -> Result<Self> {
        let registry = Arc::new(
            SqliteRegistry::open(&config.database_path)
                .with_context(|| {
                    format!("opening registry at {}", config.database_path.display())
                })?,
        );
        let provider: Arc<dyn MessagingProvider> = Arc::new(
            TelegramClient::new(&config.telegram_api_url, config.provider_timeout)
                .context("building the messaging provider client")?,
        );

        let installer = CommandInstaller::new(&config.install_command, config.install_timeout)
            .in_dir(&config.modules_dir);
        let resolver = Arc::new(DependencyResolver::new(
            config.dependency_aliases.clone(),
            Arc::new(ModuleDirectoryIndex::new(&config.modules_dir)),
            Arc::new(installer),
        ));
        let host = Arc::new(RhaiHost::new(config.script_max_operations, &config.modules_dir));

        let lifecycle = Arc::new(LifecycleManager::new(
            registry,
            ArtifactStore::new(&config.bots_dir),
            resolver,
            host,
            provider.clone(),
            LifecycleSettings {
                webhook_base: config.public_base_url.to_string(),
                restart_settle: config.restart_settle,
            },
            telemetry.clone(),
        ));

        let admin = Arc::new(AdminConsole::new(
            config.admin_ids.clone(),
            config.platform_token.clone(),
            lifecycle.clone(),
            provider.clone(),
            config.broadcast_delay,
        ));

        if config.ai_api_key.is_none() {
            warn!("AI_API_KEY is not set, AI bot creation will report an error");
        }
        let generator = Arc::new(
            OpenAiGenerator::new(
                config.ai_base_url.clone(),
                config.ai_api_key.clone(),
                config.ai_model.clone(),
                config.ai_timeout,
            )
            .context("building the AI client")?,
        );

        let engine = Arc::new(ConversationEngine::new(
            config.platform_token.clone(),
            provider.clone(),
            lifecycle.clone(),
            generator,
            admin,
            ConversationSettings {
                session_timeout: config.session_timeout,
                ..ConversationSettings::default()
            },
        ));

        Ok(Self {
            config,
            telemetry,
            provider,
            lifecycle,
            engine,
            shutdown: CancellationToken::new(),
            server: None,
        })
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn router(&self) -> Router {
        let control_plane: Arc<dyn IncomingHandler> = self.engine.clone();
        webhook::router(WebhookState {
            platform_route: self.config.platform_route_id.clone(),
            control_plane,
            lifecycle: self.lifecycle.clone(),
            provider: self.provider.clone(),
            telemetry: self.telemetry.clone(),
        })
    }

    /// Bind, point the platform bot at us, restore tenants that were running
    /// and start serving.
    pub async fn start(&mut self) -> Result<(SocketAddr, RestoreReport)> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("binding {}", self.config.bind_addr))?;
        let addr = listener.local_addr()?;

        let platform_url = self.config.webhook_url(&self.config.platform_route_id);
        self.provider
            .set_webhook(&self.config.platform_token, &platform_url)
            .await
            .context("registering the platform webhook")?;
        info!("platform webhook registered at {platform_url}");

        let report = self.lifecycle.restore_all().await?;
        for (short_id, diagnostic) in &report.failed {
            warn!(bot = %short_id, "not restored: {diagnostic}");
        }

        let router = self.router();
        let token = self.shutdown.clone();
        self.server = Some(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
                .context("webhook server")
        }));
        info!("listening on {addr}");
        Ok((addr, report))
    }

    /// Stop accepting updates, then stop every tenant. Persisted statuses are
    /// kept so the next start restores the same set.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(server) = self.server.take() {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("server stopped with error: {e:#}"),
                Err(e) => error!("server task failed: {e}"),
            }
        }
        self.engine.sessions().clear();
        self.lifecycle.shutdown().await;
        self.telemetry.shutdown();
    }
}
