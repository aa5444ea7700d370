//! In-process doubles for the provider, execution host, package manager and
//! AI service, plus a fully wired platform on top of them.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tenant_plugin::{
    ExecutionHost, LoadRequest, OutboundAction, PluginError, RunnableUnit, TenantEvent, UnitState,
};
use tokio::sync::Mutex;

use crate::admin::AdminConsole;
use crate::artifacts::ArtifactStore;
use crate::conversation::{ConversationEngine, ConversationSettings};
use crate::deps::{DependencyResolver, InstallError, InstalledPackages, PackageInstaller};
use crate::generation::{Clarification, GenerationClient, GenerationError, QaTurn};
use crate::lifecycle::{LifecycleManager, LifecycleSettings};
use crate::logger::Telemetry;
use crate::provider::{BotIdentity, MessagingProvider, OutboundMessage, ProviderError, Update};
use crate::registry::{CreationType, NewTenant, SqliteRegistry, TenantBot, TenantRegistry};
use crate::webhook::{IncomingHandler, WebhookState};

pub const PLATFORM_TOKEN: &str = "1000:PLATFORMxPLATFORMxPLATFORMxPLATFORMx";
pub const PLATFORM_ROUTE: &str = "platform";
pub const ADMIN_ID: i64 = 900;
pub const WEBHOOK_BASE: &str = "https://host.example.com";

/// A credential that passes the token format check.
pub fn tenant_token(n: u32) -> String {
    format!("{n}:{}", "A".repeat(35))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentDocument {
    pub chat_id: i64,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub caption: Option<String>,
}

/// Records every call. Only tokens registered with [`accept`](Self::accept)
/// pass `get_me` and `set_webhook`.
#[derive(Default)]
pub struct MockProvider {
    identities: DashMap<String, BotIdentity>,
    files: DashMap<String, Vec<u8>>,
    webhooks: DashMap<String, String>,
    sent: Mutex<Vec<(String, OutboundMessage)>>,
    documents: Mutex<Vec<SentDocument>>,
    callbacks: Mutex<Vec<(String, Option<String>)>>,
    unreachable: DashMap<i64, ()>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self, token: &str, username: &str) {
        self.identities.insert(
            token.to_string(),
            BotIdentity {
                id: self.identities.len() as i64 + 1,
                username: Some(username.to_string()),
                first_name: username.to_string(),
            },
        );
    }

    /// Later `get_me`/`set_webhook` calls with `token` are rejected.
    pub fn revoke(&self, token: &str) {
        self.identities.remove(token);
    }

    pub fn add_file(&self, file_id: &str, bytes: impl Into<Vec<u8>>) {
        self.files.insert(file_id.to_string(), bytes.into());
    }

    /// Messages to `chat_id` fail from now on.
    pub fn make_unreachable(&self, chat_id: i64) {
        self.unreachable.insert(chat_id, ());
    }

    pub fn webhook(&self, token: &str) -> Option<String> {
        self.webhooks.get(token).map(|url| url.clone())
    }

    pub async fn sent_messages(&self) -> Vec<(String, OutboundMessage)> {
        self.sent.lock().await.clone()
    }

    /// Texts sent to `chat_id`, oldest first.
    pub async fn texts_to(&self, chat_id: i64) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(_, m)| m.chat_id == chat_id)
            .map(|(_, m)| m.text.clone())
            .collect()
    }

    pub async fn last_to(&self, chat_id: i64) -> Option<OutboundMessage> {
        self.sent
            .lock()
            .await
            .iter()
            .rev()
            .find(|(_, m)| m.chat_id == chat_id)
            .map(|(_, m)| m.clone())
    }

    pub async fn documents(&self) -> Vec<SentDocument> {
        self.documents.lock().await.clone()
    }

    pub async fn answered_callbacks(&self) -> Vec<(String, Option<String>)> {
        self.callbacks.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.sent.lock().await.clear();
        self.documents.lock().await.clear();
        self.callbacks.lock().await.clear();
    }

    fn unauthorized() -> ProviderError {
        ProviderError::Rejected {
            code: 401,
            description: "Unauthorized".into(),
        }
    }
}

#[async_trait]
impl MessagingProvider for MockProvider {
    async fn get_me(&self, token: &str) -> Result<BotIdentity, ProviderError> {
        self.identities
            .get(token)
            .map(|i| i.clone())
            .ok_or_else(Self::unauthorized)
    }

    async fn set_webhook(&self, token: &str, url: &str) -> Result<(), ProviderError> {
        if !self.identities.contains_key(token) {
            return Err(Self::unauthorized());
        }
        self.webhooks.insert(token.to_string(), url.to_string());
        Ok(())
    }

    async fn delete_webhook(&self, token: &str) -> Result<(), ProviderError> {
        self.webhooks.remove(token);
        Ok(())
    }

    async fn send_message(
        &self,
        token: &str,
        message: OutboundMessage,
    ) -> Result<(), ProviderError> {
        if self.unreachable.contains_key(&message.chat_id) {
            return Err(ProviderError::Rejected {
                code: 403,
                description: "Forbidden: bot was blocked by the user".into(),
            });
        }
        self.sent.lock().await.push((token.to_string(), message));
        Ok(())
    }

    async fn send_document(
        &self,
        _token: &str,
        chat_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
        caption: Option<String>,
    ) -> Result<(), ProviderError> {
        self.documents.lock().await.push(SentDocument {
            chat_id,
            file_name: file_name.to_string(),
            bytes,
            caption,
        });
        Ok(())
    }

    async fn download_file(&self, _token: &str, file_id: &str) -> Result<Vec<u8>, ProviderError> {
        self.files
            .get(file_id)
            .map(|f| f.clone())
            .ok_or_else(|| ProviderError::Rejected {
                code: 400,
                description: "Bad Request: invalid file_id".into(),
            })
    }

    async fn answer_callback(
        &self,
        _token: &str,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), ProviderError> {
        self.callbacks
            .lock()
            .await
            .push((callback_id.to_string(), text.map(str::to_string)));
        Ok(())
    }
}

/// Host whose programs are steered by markers in their source:
/// `@@syntax` fails validation, `@@init_fail` fails loading, `@@echo`
/// replies with the message text, `@@panic` panics on delivery and
/// `@@fail` returns a runtime error. A program without `on_update` lacks
/// its entry point.
#[derive(Default)]
pub struct MockHost {
    loads: AtomicUsize,
    deliveries: Arc<AtomicUsize>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionHost for MockHost {
    fn program_extension(&self) -> &'static str {
        "rhai"
    }

    fn validate(&self, source: &str) -> Result<(), PluginError> {
        if source.contains("@@syntax") {
            return Err(PluginError::Syntax("unexpected token (line 1, position 1)".into()));
        }
        if !source.contains("on_update") {
            return Err(PluginError::MissingEntryPoint("on_update".into()));
        }
        Ok(())
    }

    async fn load(&self, request: LoadRequest) -> Result<Arc<dyn RunnableUnit>, PluginError> {
        self.validate(&request.source)?;
        self.loads.fetch_add(1, Ordering::SeqCst);
        if request.source.contains("@@init_fail") {
            return Err(PluginError::Init("boom at load".into()));
        }
        Ok(Arc::new(MockUnit {
            route_id: request.route_id,
            source: request.source,
            state: std::sync::Mutex::new(UnitState::Loaded),
            deliveries: self.deliveries.clone(),
        }))
    }
}

pub struct MockUnit {
    route_id: String,
    source: String,
    state: std::sync::Mutex<UnitState>,
    deliveries: Arc<AtomicUsize>,
}

impl MockUnit {
    fn set_state(&self, state: UnitState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }
}

#[async_trait]
impl RunnableUnit for MockUnit {
    fn name(&self) -> String {
        self.route_id.clone()
    }

    fn state(&self) -> UnitState {
        self.state.lock().map(|s| *s).unwrap_or(UnitState::Stopped)
    }

    async fn start(&self) -> Result<(), PluginError> {
        match self.state() {
            UnitState::Loaded => {
                self.set_state(UnitState::Running);
                Ok(())
            }
            _ => Err(PluginError::InvalidState),
        }
    }

    async fn stop(&self) -> Result<(), PluginError> {
        self.set_state(UnitState::Stopped);
        Ok(())
    }

    async fn deliver(&self, event: TenantEvent) -> Result<Vec<OutboundAction>, PluginError> {
        if self.state() != UnitState::Running {
            return Err(PluginError::InvalidState);
        }
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        if self.source.contains("@@panic") {
            panic!("tenant program panicked");
        }
        if self.source.contains("@@fail") {
            return Err(PluginError::Runtime("handler raised".into()));
        }
        if self.source.contains("@@echo") {
            let text = event
                .payload
                .pointer("/message/text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string();
            if let Some(chat_id) = event.chat_id() {
                return Ok(vec![OutboundAction::Reply { chat_id, text }]);
            }
        }
        Ok(vec![])
    }
}

#[derive(Default)]
pub struct MockInstaller {
    calls: Mutex<Vec<Vec<String>>>,
    failure: Option<String>,
}

impl MockInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(stderr: &str) -> Self {
        Self {
            failure: Some(stderr.to_string()),
            ..Self::default()
        }
    }

    pub async fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl PackageInstaller for MockInstaller {
    async fn install(&self, distributions: &[String]) -> Result<(), InstallError> {
        self.calls.lock().await.push(distributions.to_vec());
        match &self.failure {
            Some(stderr) => Err(InstallError::Failed {
                code: Some(1),
                stderr: stderr.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// A fixed set of installed distributions.
#[derive(Default)]
pub struct StaticPackages(pub HashSet<String>);

#[async_trait]
impl InstalledPackages for StaticPackages {
    async fn is_installed(&self, distribution: &str) -> bool {
        self.0.contains(distribution)
    }
}

/// Asks "Question n?" with options Yes/No and returns a fixed program.
pub struct MockGenerator {
    program: Result<String, GenerationError>,
    clarify_failure: Option<GenerationError>,
    clarify_calls: AtomicUsize,
    summaries: Mutex<VecDeque<String>>,
}

impl MockGenerator {
    pub fn new(program: &str) -> Self {
        Self {
            program: Ok(program.to_string()),
            clarify_failure: None,
            clarify_calls: AtomicUsize::new(0),
            summaries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn failing_clarify(mut self, err: GenerationError) -> Self {
        self.clarify_failure = Some(err);
        self
    }

    pub fn failing_synthesis(mut self, err: GenerationError) -> Self {
        self.program = Err(err);
        self
    }

    pub fn clarify_calls(&self) -> usize {
        self.clarify_calls.load(Ordering::SeqCst)
    }

    /// Summaries passed to `synthesize`, oldest first.
    pub async fn synthesized(&self) -> Vec<String> {
        self.summaries.lock().await.iter().cloned().collect()
    }
}

#[async_trait]
impl GenerationClient for MockGenerator {
    async fn clarify(
        &self,
        summary: &str,
        history: &[QaTurn],
    ) -> Result<Clarification, GenerationError> {
        self.clarify_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.clarify_failure {
            return Err(err.clone());
        }
        Ok(Clarification {
            question: format!("Question {}?", history.len() + 1),
            options: vec!["Yes".into(), "No".into()],
            refined_summary: summary.to_string(),
        })
    }

    async fn synthesize(&self, summary: &str) -> Result<String, GenerationError> {
        self.summaries.lock().await.push_back(summary.to_string());
        self.program.clone()
    }
}

/// Everything wired together over the doubles, with the registry in memory
/// and artifacts under a caller-provided directory.
pub struct TestPlatform {
    pub provider: Arc<MockProvider>,
    pub host: Arc<MockHost>,
    pub installer: Arc<MockInstaller>,
    pub generator: Arc<MockGenerator>,
    pub registry: Arc<dyn TenantRegistry>,
    pub artifacts: ArtifactStore,
    pub lifecycle: Arc<LifecycleManager>,
    pub admin: Arc<AdminConsole>,
    pub engine: Arc<ConversationEngine>,
}

pub struct TestPlatformBuilder {
    generator: MockGenerator,
    installer: MockInstaller,
    installed: HashSet<String>,
    session_timeout: Duration,
}

impl Default for TestPlatformBuilder {
    fn default() -> Self {
        Self {
            generator: MockGenerator::new("fn on_update(update) { @@echo }"),
            installer: MockInstaller::new(),
            installed: HashSet::new(),
            session_timeout: Duration::from_secs(60),
        }
    }
}

impl TestPlatformBuilder {
    pub fn generator(mut self, generator: MockGenerator) -> Self {
        self.generator = generator;
        self
    }

    pub fn installer(mut self, installer: MockInstaller) -> Self {
        self.installer = installer;
        self
    }

    pub fn installed(mut self, distribution: &str) -> Self {
        self.installed.insert(distribution.to_string());
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn build(self, artifact_dir: &Path) -> TestPlatform {
        let provider = Arc::new(MockProvider::new());
        provider.accept(PLATFORM_TOKEN, "host_platform_bot");
        let host = Arc::new(MockHost::new());
        let installer = Arc::new(self.installer);
        let generator = Arc::new(self.generator);
        let registry: Arc<dyn TenantRegistry> = match SqliteRegistry::open_in_memory() {
            Ok(registry) => Arc::new(registry),
            Err(e) => panic!("in-memory registry: {e}"),
        };
        let artifacts = ArtifactStore::new(artifact_dir);
        let resolver = Arc::new(DependencyResolver::new(
            BTreeMap::new(),
            Arc::new(StaticPackages(self.installed)),
            installer.clone(),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            registry.clone(),
            artifacts.clone(),
            resolver,
            host.clone(),
            provider.clone(),
            LifecycleSettings {
                webhook_base: WEBHOOK_BASE.to_string(),
                restart_settle: Duration::from_millis(10),
            },
            Telemetry::detached(),
        ));
        let admin = Arc::new(AdminConsole::new(
            HashSet::from([ADMIN_ID]),
            PLATFORM_TOKEN,
            lifecycle.clone(),
            provider.clone(),
            Duration::from_millis(1),
        ));
        let engine = Arc::new(ConversationEngine::new(
            PLATFORM_TOKEN,
            provider.clone(),
            lifecycle.clone(),
            generator.clone(),
            admin.clone(),
            ConversationSettings {
                session_timeout: self.session_timeout,
                ..ConversationSettings::default()
            },
        ));
        TestPlatform {
            provider,
            host,
            installer,
            generator,
            registry,
            artifacts,
            lifecycle,
            admin,
            engine,
        }
    }
}

impl TestPlatform {
    pub fn builder() -> TestPlatformBuilder {
        TestPlatformBuilder::default()
    }

    pub fn new(artifact_dir: &Path) -> Self {
        Self::builder().build(artifact_dir)
    }

    pub fn webhook_state(&self) -> WebhookState {
        let control_plane: Arc<dyn IncomingHandler> = self.engine.clone();
        WebhookState {
            platform_route: PLATFORM_ROUTE.to_string(),
            control_plane,
            lifecycle: self.lifecycle.clone(),
            provider: self.provider.clone(),
            telemetry: Telemetry::detached(),
        }
    }

    /// Store `source` and register a Stopped tenant for it. The provider
    /// accepts the token.
    pub async fn seed_bot(&self, owner: i64, token: &str, handle: &str, source: &str) -> TenantBot {
        self.provider.accept(token, handle);
        let location = self
            .artifacts
            .store(owner, handle, "rhai", source)
            .await
            .unwrap_or_else(|e| panic!("store artifact: {e}"));
        self.registry
            .upsert(NewTenant {
                owner_id: owner,
                token: token.to_string(),
                code_location: location,
                creation_type: CreationType::Uploaded,
                public_handle: handle.to_string(),
            })
            .await
            .unwrap_or_else(|e| panic!("register tenant: {e}"))
    }

    pub async fn bot(&self, token: &str) -> TenantBot {
        match self.registry.get_by_token(token).await {
            Ok(Some(bot)) => bot,
            other => panic!("tenant {token} not found: {other:?}"),
        }
    }

    pub async fn send(&self, update: Update) {
        self.engine.handle_incoming(update).await;
    }
}

fn user_json(user_id: i64) -> serde_json::Value {
    json!({
        "id": user_id,
        "is_bot": false,
        "first_name": format!("User{user_id}"),
        "username": format!("user{user_id}"),
    })
}

pub fn text_update(user_id: i64, text: &str) -> Update {
    parse_update(json!({
        "update_id": 1,
        "message": {
            "message_id": 1,
            "from": user_json(user_id),
            "chat": {"id": user_id, "type": "private"},
            "date": 0,
            "text": text,
        }
    }))
}

pub fn document_update(user_id: i64, file_id: &str, file_name: &str, file_size: u64) -> Update {
    parse_update(json!({
        "update_id": 1,
        "message": {
            "message_id": 1,
            "from": user_json(user_id),
            "chat": {"id": user_id, "type": "private"},
            "date": 0,
            "document": {"file_id": file_id, "file_name": file_name, "file_size": file_size},
        }
    }))
}

pub fn callback_update(user_id: i64, data: &str) -> Update {
    parse_update(json!({
        "update_id": 1,
        "callback_query": {
            "id": format!("cb-{data}"),
            "from": user_json(user_id),
            "message": {"message_id": 2, "chat": {"id": user_id, "type": "private"}, "date": 0},
            "data": data,
        }
    }))
}

fn parse_update(value: serde_json::Value) -> Update {
    serde_json::from_value(value).unwrap_or_else(|e| panic!("fixture update: {e}"))
}
