//! The platform bot: onboarding, hosting, AI-assisted creation, tenant
//! management, help and the admin console, driven one update at a time.

pub mod menu;
pub mod session;
pub mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::admin::{AdminCommand, AdminConsole, CommandOutcome};
use crate::error::{PlatformError, PlatformResult};
use crate::generation::{GenerationClient, QaTurn, fold_history};
use crate::lifecycle::LifecycleManager;
use crate::provider::types::{Message, User};
use crate::provider::{Keyboard, MessagingProvider, OutboundMessage, Update};
use crate::registry::{CreationType, NewTenant, TenantBot, TenantRegistry};
use crate::webhook::IncomingHandler;

use menu::{Callback, escape_html};
use session::SessionStore;
use state::{AdminStep, ConversationSession, CreateStep, DialogState, Flow, HelpStep, HostStep};

static TOKEN_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+:[A-Za-z0-9_-]{35,}$").unwrap());

const GENERIC_ERROR: &str = "⚠️ An error occurred. Please try again or use /start to restart.";
const STILL_WORKING: &str = "⏳ Still working on your previous request, please wait...";
const NEXT_STEP: &str = "What would you like to do next?";
const RETRY_HINT: &str = "\n\nThis is usually temporary, please try again in a moment.";

#[derive(Debug, Clone)]
pub struct ConversationSettings {
    pub max_rounds: u8,
    pub max_program_bytes: u64,
    pub min_idea_chars: usize,
    pub session_timeout: Duration,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            max_program_bytes: 512 * 1024,
            min_idea_chars: 10,
            session_timeout: Duration::from_secs(1800),
        }
    }
}

pub fn is_valid_token(token: &str) -> bool {
    TOKEN_PATTERN.is_match(token)
}

/// Who the current update came from and where answers go.
struct Turn<'a> {
    user: &'a User,
    chat_id: i64,
}

pub struct ConversationEngine {
    platform_token: String,
    provider: Arc<dyn MessagingProvider>,
    lifecycle: Arc<LifecycleManager>,
    generator: Arc<dyn GenerationClient>,
    admin: Arc<AdminConsole>,
    sessions: SessionStore,
    settings: ConversationSettings,
}

impl ConversationEngine {
    pub fn new(
        platform_token: impl Into<String>,
        provider: Arc<dyn MessagingProvider>,
        lifecycle: Arc<LifecycleManager>,
        generator: Arc<dyn GenerationClient>,
        admin: Arc<AdminConsole>,
        settings: ConversationSettings,
    ) -> Self {
        Self {
            platform_token: platform_token.into(),
            provider,
            lifecycle,
            generator,
            admin,
            sessions: SessionStore::new(settings.session_timeout),
            settings,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    fn registry(&self) -> &Arc<dyn TenantRegistry> {
        self.lifecycle.registry()
    }

    async fn send(&self, chat_id: i64, text: impl Into<String>, keyboard: Option<Keyboard>) {
        let mut msg = OutboundMessage::text(chat_id, text).html();
        if let Some(keyboard) = keyboard {
            msg = msg.with_keyboard(keyboard);
        }
        if let Err(e) = self.provider.send_message(&self.platform_token, msg).await {
            warn!(chat = chat_id, "platform message not delivered: {e}");
        }
    }

    async fn handle(&self, update: Update) {
        let (Some(user), Some(chat_id)) = (update.sender().cloned(), update.chat_id()) else {
            debug!(update = update.update_id, "update without sender or chat ignored");
            return;
        };
        if let Err(e) = self
            .registry()
            .upsert_user(user.id, user.username.as_deref(), &user.display_name())
            .await
        {
            warn!(user = user.id, "user record not refreshed: {e}");
        }

        let session = self.sessions.get_or_create(user.id).await;
        // Held for the whole turn, including a build. Home signals are not
        // cancellation: they get the notice too and the running turn finishes.
        let Ok(mut session) = session.try_lock_owned() else {
            if let Some(query) = &update.callback_query {
                let _ = self
                    .provider
                    .answer_callback(&self.platform_token, &query.id, Some(STILL_WORKING))
                    .await;
            } else {
                self.send(chat_id, STILL_WORKING, None).await;
            }
            return;
        };

        let turn = Turn { user: &user, chat_id };
        let result = if let Some(query) = &update.callback_query {
            if let Err(e) = self
                .provider
                .answer_callback(&self.platform_token, &query.id, None)
                .await
            {
                debug!("callback not acknowledged: {e}");
            }
            match query.data.as_deref().and_then(Callback::parse) {
                Some(cb) => self.on_callback(&turn, &mut session, cb).await,
                None => Ok(()),
            }
        } else if let Some(message) = update.message.as_ref() {
            self.on_message(&turn, &mut session, message).await
        } else {
            Ok(())
        };

        if let Err(e) = result {
            error!(user = user.id, "conversation failed: {e}");
            session.reset();
            self.send(chat_id, GENERIC_ERROR, Some(menu::main_menu())).await;
        }
    }

    async fn on_message(
        &self,
        turn: &Turn<'_>,
        session: &mut ConversationSession,
        message: &Message,
    ) -> PlatformResult<()> {
        let text = message.text.as_deref().map(str::trim);

        if let Some(text) = text {
            if menu::is_home(text) {
                session.reset();
                return match text {
                    "/cancel" => {
                        self.send(turn.chat_id, "❌ Cancelled", Some(menu::main_menu())).await;
                        Ok(())
                    }
                    _ => self.welcome(turn).await,
                };
            }
            if text == menu::BACK {
                let state = session.back();
                return self.prompt(turn, state).await;
            }
            if let Some(command) = AdminCommand::parse(text) {
                return self.on_admin_command(turn, session, command).await;
            }
        }

        match session.state() {
            DialogState::MainMenu => {
                self.on_menu_choice(turn, session, text.unwrap_or_default()).await
            }
            DialogState::Host(HostStep::AwaitToken)
            | DialogState::Create(CreateStep::AwaitToken) => {
                self.on_token(turn, session, text).await
            }
            DialogState::Host(HostStep::AwaitCode) => self.on_upload(turn, session, message).await,
            DialogState::Create(CreateStep::AwaitIdea) => self.on_idea(turn, session, text).await,
            DialogState::Create(CreateStep::Consultation { .. }) => match text {
                Some(answer) if !answer.is_empty() => {
                    self.on_answer(turn, session, answer.to_string()).await
                }
                _ => {
                    self.send(turn.chat_id, "✍️ Pick an option or type your answer.", None)
                        .await;
                    Ok(())
                }
            },
            DialogState::Create(CreateStep::Building) => {
                self.send(turn.chat_id, STILL_WORKING, None).await;
                Ok(())
            }
            DialogState::Help(HelpStep::AwaitMessage) => {
                self.on_help_message(turn, session, text).await
            }
            DialogState::Admin(step) => self.on_admin_input(turn, session, step, text).await,
        }
    }

    async fn welcome(&self, turn: &Turn<'_>) -> PlatformResult<()> {
        let text = format!(
            "👋 Welcome <b>{}</b>!\n\nI can host your Telegram bots or build a new one for you with AI.\n\nChoose an option below:",
            escape_html(&turn.user.first_name)
        );
        self.send(turn.chat_id, text, Some(menu::main_menu())).await;
        Ok(())
    }

    /// Re-ask whatever `state` is waiting for.
    async fn prompt(&self, turn: &Turn<'_>, state: DialogState) -> PlatformResult<()> {
        let (text, keyboard) = match state {
            DialogState::MainMenu => ("Choose an option below:".to_string(), menu::main_menu()),
            DialogState::Host(HostStep::AwaitToken) => (
                "📤 <b>Host Your Bot</b>\n\nStep 1: Send me your Bot Token from @BotFather".to_string(),
                menu::back_menu(),
            ),
            DialogState::Create(CreateStep::AwaitToken) => (
                "✨ <b>Create New Bot</b>\n\nStep 1: Create a bot with @BotFather and send me its token.".to_string(),
                menu::back_menu(),
            ),
            DialogState::Host(HostStep::AwaitCode) => (
                format!(
                    "Step 2: Upload your bot code as a <b>.{}</b> file.\nIt must define <code>fn on_update(update)</code>.",
                    self.lifecycle.host().program_extension()
                ),
                menu::back_menu(),
            ),
            DialogState::Create(CreateStep::AwaitIdea) => (
                "Step 2: Describe the bot you want. What should it do?".to_string(),
                menu::back_menu(),
            ),
            DialogState::Help(HelpStep::AwaitMessage) => (
                "🆘 <b>Help Center</b>\n\nHaving trouble? Our team will reply here.\n\nSend your question below:"
                    .to_string(),
                menu::back_menu(),
            ),
            DialogState::Admin(AdminStep::Broadcast) => (
                "📢 Send the announcement to broadcast to every user:".to_string(),
                menu::back_menu(),
            ),
            DialogState::Admin(AdminStep::ReplyToUser { user_id }) => (
                format!("✍️ Type your reply to user <code>{user_id}</code>:"),
                menu::back_menu(),
            ),
            DialogState::Create(CreateStep::Consultation { .. })
            | DialogState::Create(CreateStep::Building) => {
                (STILL_WORKING.to_string(), menu::back_menu())
            }
        };
        self.send(turn.chat_id, text, Some(keyboard)).await;
        Ok(())
    }

    async fn on_menu_choice(
        &self,
        turn: &Turn<'_>,
        session: &mut ConversationSession,
        text: &str,
    ) -> PlatformResult<()> {
        let next = match text {
            menu::HOST_BOT => DialogState::Host(HostStep::AwaitToken),
            menu::CREATE_BOT => DialogState::Create(CreateStep::AwaitToken),
            menu::HELP => DialogState::Help(HelpStep::AwaitMessage),
            menu::MY_BOTS => return self.show_bots(turn).await,
            _ => return self.prompt(turn, DialogState::MainMenu).await,
        };
        session.advance(next);
        self.prompt(turn, next).await
    }

    async fn on_token(
        &self,
        turn: &Turn<'_>,
        session: &mut ConversationSession,
        text: Option<&str>,
    ) -> PlatformResult<()> {
        let token = text.unwrap_or_default();
        if !is_valid_token(token) {
            self.send(
                turn.chat_id,
                "❌ Invalid token format!\n\nA token looks like <code>123456789:ABCdefGhIJKlmNoPQRsTUVwxyZ</code>. Please send it again.",
                None,
            )
            .await;
            return Ok(());
        }
        if let Some(existing) = self.registry().get_by_token(token).await? {
            if existing.owner_id != turn.user.id {
                warn!(user = turn.user.id, bot = %existing.short_id, "token owned by another user");
                self.send(turn.chat_id, "❌ This bot is already hosted by another account.", None)
                    .await;
                return Ok(());
            }
        }

        self.send(turn.chat_id, "🔍 Verifying token...", None).await;
        let identity = match self.provider.get_me(token).await {
            Ok(identity) => identity,
            Err(e) => {
                info!(user = turn.user.id, "token verification failed: {e}");
                self.send(
                    turn.chat_id,
                    format!(
                        "❌ Token verification failed: {}\n\nPlease check the token and send it again.",
                        escape_html(&e.to_string())
                    ),
                    None,
                )
                .await;
                return Ok(());
            }
        };

        let handle = identity.handle();
        session.draft.token = Some(token.to_string());
        session.draft.public_handle = Some(handle.clone());
        let next = match session.state().flow() {
            Flow::Create => DialogState::Create(CreateStep::AwaitIdea),
            _ => DialogState::Host(HostStep::AwaitCode),
        };
        session.advance(next);
        self.send(
            turn.chat_id,
            format!("✅ Token verified!\n\n🤖 Bot: @{}", escape_html(&handle)),
            None,
        )
        .await;
        self.prompt(turn, next).await
    }

    async fn on_upload(
        &self,
        turn: &Turn<'_>,
        session: &mut ConversationSession,
        message: &Message,
    ) -> PlatformResult<()> {
        let extension = self.lifecycle.host().program_extension();
        let Some(document) = &message.document else {
            self.send(
                turn.chat_id,
                format!("❌ Please upload a .{extension} file, not text!"),
                None,
            )
            .await;
            return Ok(());
        };
        let name = document.file_name.clone().unwrap_or_default();
        if !name.to_ascii_lowercase().ends_with(&format!(".{extension}")) {
            self.send(turn.chat_id, format!("❌ Only .{extension} files are accepted."), None)
                .await;
            return Ok(());
        }
        let too_large = format!(
            "❌ File too large. The limit is {} KB.",
            self.settings.max_program_bytes / 1024
        );
        if document.file_size.unwrap_or(0) > self.settings.max_program_bytes {
            self.send(turn.chat_id, too_large, None).await;
            return Ok(());
        }

        self.send(turn.chat_id, "📥 Downloading...", None).await;
        let bytes = match self
            .provider
            .download_file(&self.platform_token, &document.file_id)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(user = turn.user.id, "download failed: {e}");
                self.send(turn.chat_id, "❌ Download failed. Please upload the file again.", None)
                    .await;
                return Ok(());
            }
        };
        if bytes.len() as u64 > self.settings.max_program_bytes {
            self.send(turn.chat_id, too_large, None).await;
            return Ok(());
        }
        let Ok(source) = String::from_utf8(bytes) else {
            self.send(turn.chat_id, "❌ The file is not valid UTF-8 text.", None).await;
            return Ok(());
        };

        let (token, handle) = verified(session)?;
        let location = match self.store_validated(turn.user.id, &handle, &source).await {
            Ok(location) => location,
            Err(PlatformError::Validation(diagnostic)) => {
                self.send(
                    turn.chat_id,
                    format!(
                        "❌ Code Error:\n<code>{}</code>\n\nFix it and upload again.",
                        escape_html(&diagnostic)
                    ),
                    None,
                )
                .await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.send(turn.chat_id, "⚙️ Deploying your bot...", None).await;
        let outcome = self
            .register_and_start(turn.user.id, &token, &handle, location, CreationType::Uploaded)
            .await;
        session.reset();
        match outcome {
            Ok(bot) => {
                self.send(
                    turn.chat_id,
                    format!(
                        "🚀 <b>Bot Deployed Successfully!</b>\n\n🤖 @{}\n🆔 <code>{}</code>\n\nYour bot is live. Manage it from 📊 My Bots.",
                        escape_html(&bot.public_handle),
                        bot.short_id
                    ),
                    None,
                )
                .await;
            }
            Err(e) => self.report_deploy_failure(turn, &e).await,
        }
        self.send(turn.chat_id, NEXT_STEP, Some(menu::main_menu())).await;
        Ok(())
    }

    /// Persist the program and check it loads. A rejected program is removed
    /// again and reported as `Validation`.
    async fn store_validated(
        &self,
        owner: i64,
        handle: &str,
        source: &str,
    ) -> PlatformResult<PathBuf> {
        let host = self.lifecycle.host();
        let artifacts = self.lifecycle.artifacts();
        let location = artifacts
            .store(owner, handle, host.program_extension(), source)
            .await?;
        if let Err(e) = host.validate(source) {
            artifacts.remove(&location).await;
            debug!(owner, "program rejected: {e}");
            return Err(PlatformError::Validation(e.to_string()));
        }
        Ok(location)
    }

    /// Upsert the tenant and bring it up with the new program. A tenant that
    /// was already live is restarted so the new code takes over.
    async fn register_and_start(
        &self,
        owner: i64,
        token: &str,
        handle: &str,
        location: PathBuf,
        creation_type: CreationType,
    ) -> PlatformResult<TenantBot> {
        let previous = self.registry().get_by_token(token).await?;
        let bot = self
            .registry()
            .upsert(NewTenant {
                owner_id: owner,
                token: token.to_string(),
                code_location: location,
                creation_type,
                public_handle: handle.to_string(),
            })
            .await?;
        if let Some(previous) = previous.filter(|p| p.code_location != bot.code_location) {
            self.lifecycle.artifacts().remove(&previous.code_location).await;
        }

        if self.lifecycle.is_running(token) {
            self.lifecycle.restart(token).await?;
        } else {
            self.lifecycle.start(token).await?;
        }
        info!(owner, bot = %bot.short_id, "tenant deployed");
        Ok(bot)
    }

    async fn report_deploy_failure(&self, turn: &Turn<'_>, err: &PlatformError) {
        let text = match err {
            PlatformError::Blocked => "⛔ This bot has been blocked by an admin.".to_string(),
            other => failure_text("❌ Deployment Failed", other),
        };
        self.send(turn.chat_id, text, None).await;
    }

    async fn on_idea(
        &self,
        turn: &Turn<'_>,
        session: &mut ConversationSession,
        text: Option<&str>,
    ) -> PlatformResult<()> {
        let idea = text.unwrap_or_default();
        if idea.chars().count() < self.settings.min_idea_chars {
            self.send(
                turn.chat_id,
                format!(
                    "📝 Please provide more details (at least {} characters)",
                    self.settings.min_idea_chars
                ),
                None,
            )
            .await;
            return Ok(());
        }
        session.draft.summary = Some(idea.to_string());
        session.draft.history.clear();
        self.consult(turn, session, 1).await
    }

    /// Ask clarification round `round`. If the assistant cannot come up with
    /// a question, build with what is known.
    async fn consult(
        &self,
        turn: &Turn<'_>,
        session: &mut ConversationSession,
        round: u8,
    ) -> PlatformResult<()> {
        let summary = session.draft.summary.clone().unwrap_or_default();
        self.send(turn.chat_id, "🤔 Thinking about your idea...", None).await;

        match self.generator.clarify(&summary, &session.draft.history).await {
            Ok(clarification) => {
                let text = format!(
                    "❓ <b>Question {round}/{}</b>\n\n{}\n\n<i>Pick an option or type your own answer.</i>",
                    self.settings.max_rounds,
                    escape_html(&clarification.question)
                );
                let keyboard = menu::consultation(&clarification.options);
                session.draft.summary = Some(clarification.refined_summary.clone());
                session.draft.pending = Some(clarification);
                session.advance(DialogState::Create(CreateStep::Consultation { round }));
                self.send(turn.chat_id, text, Some(keyboard)).await;
                Ok(())
            }
            Err(e) => {
                warn!(user = turn.user.id, round, "clarification failed: {e}");
                self.send(
                    turn.chat_id,
                    "⚠️ I could not think of another question, building with what we have.",
                    None,
                )
                .await;
                self.build(turn, session).await
            }
        }
    }

    async fn on_answer(
        &self,
        turn: &Turn<'_>,
        session: &mut ConversationSession,
        answer: String,
    ) -> PlatformResult<()> {
        let DialogState::Create(CreateStep::Consultation { round }) = session.state() else {
            return Ok(());
        };
        if let Some(pending) = session.draft.pending.take() {
            session.draft.history.push(QaTurn {
                question: pending.question,
                answer,
            });
        }
        if round >= self.settings.max_rounds {
            self.build(turn, session).await
        } else {
            self.consult(turn, session, round + 1).await
        }
    }

    async fn build(
        &self,
        turn: &Turn<'_>,
        session: &mut ConversationSession,
    ) -> PlatformResult<()> {
        session.advance(DialogState::Create(CreateStep::Building));
        let (token, handle) = verified(session)?;
        let summary = fold_history(
            session.draft.summary.as_deref().unwrap_or_default(),
            &session.draft.history,
        );
        self.send(turn.chat_id, "🏗️ Building your bot... this can take a minute.", None)
            .await;

        let outcome = self.generate_and_deploy(turn.user.id, &token, &handle, &summary).await;
        session.reset();
        match outcome {
            Ok((bot, source)) => {
                self.send(
                    turn.chat_id,
                    format!(
                        "🎉 <b>Your Bot is LIVE!</b>\n\n🤖 @{}\n🆔 <code>{}</code>\n\nTry it now and manage it from 📊 My Bots.",
                        escape_html(&bot.public_handle),
                        bot.short_id
                    ),
                    None,
                )
                .await;
                let extension = self.lifecycle.host().program_extension();
                let file_name = format!("{}_code.{extension}", bot.public_handle);
                if let Err(e) = self
                    .provider
                    .send_document(
                        &self.platform_token,
                        turn.chat_id,
                        &file_name,
                        source.into_bytes(),
                        Some("📄 Here is your bot source code!".into()),
                    )
                    .await
                {
                    warn!(user = turn.user.id, "source document not delivered: {e}");
                }
            }
            Err(e @ PlatformError::Generation(_)) => {
                self.send(turn.chat_id, failure_text("❌ Generation Failed", &e), None)
                    .await;
            }
            Err(e) => self.report_deploy_failure(turn, &e).await,
        }
        self.send(turn.chat_id, NEXT_STEP, Some(menu::main_menu())).await;
        Ok(())
    }

    async fn generate_and_deploy(
        &self,
        owner: i64,
        token: &str,
        handle: &str,
        summary: &str,
    ) -> PlatformResult<(TenantBot, String)> {
        let source = self.generator.synthesize(summary).await?;
        let location = self
            .store_validated(owner, handle, &source)
            .await
            .map_err(|e| match e {
                PlatformError::Validation(diagnostic) => PlatformError::Generation(diagnostic),
                other => other,
            })?;
        let bot = self
            .register_and_start(owner, token, handle, location, CreationType::AiGenerated)
            .await?;
        Ok((bot, source))
    }

    async fn show_bots(&self, turn: &Turn<'_>) -> PlatformResult<()> {
        let bots = self.registry().list_by_owner(turn.user.id).await?;
        if bots.is_empty() {
            self.send(
                turn.chat_id,
                "📭 You have not hosted any bots yet.\n\nUse 📤 Host My Bot or ✨ Create New Bot to get started.",
                Some(menu::main_menu()),
            )
            .await;
        } else {
            self.send(turn.chat_id, menu::bot_overview(&bots), Some(menu::bot_list(&bots)))
                .await;
        }
        Ok(())
    }

    /// The tenant behind `short_id`, if the user owns it.
    async fn owned_bot(
        &self,
        turn: &Turn<'_>,
        short_id: &str,
    ) -> PlatformResult<Option<TenantBot>> {
        let bot = self.registry().find_by_short_id(short_id).await?;
        Ok(bot.filter(|b| b.owner_id == turn.user.id))
    }

    async fn on_callback(
        &self,
        turn: &Turn<'_>,
        session: &mut ConversationSession,
        callback: Callback,
    ) -> PlatformResult<()> {
        match callback {
            Callback::BotList => self.show_bots(turn).await,
            Callback::Option(index) => {
                let option = match session.state() {
                    DialogState::Create(CreateStep::Consultation { .. }) => session
                        .draft
                        .pending
                        .as_ref()
                        .and_then(|p| p.options.get(index).cloned()),
                    _ => None,
                };
                match option {
                    Some(answer) => self.on_answer(turn, session, answer).await,
                    None => {
                        self.send(turn.chat_id, "⌛ This question has expired.", None).await;
                        Ok(())
                    }
                }
            }
            Callback::Finish => {
                if matches!(session.state(), DialogState::Create(CreateStep::Consultation { .. })) {
                    self.build(turn, session).await
                } else {
                    Ok(())
                }
            }
            Callback::ReplyTo(user_id) => {
                if let Err(e) = self.admin.ensure_admin(turn.user.id) {
                    self.send(turn.chat_id, format!("⛔ {e}"), None).await;
                    return Ok(());
                }
                let next = DialogState::Admin(AdminStep::ReplyToUser { user_id });
                session.advance(next);
                self.prompt(turn, next).await
            }
            Callback::View(short_id) => match self.owned_bot(turn, &short_id).await? {
                Some(bot) => {
                    self.send(turn.chat_id, menu::bot_details(&bot), Some(menu::bot_actions(&bot)))
                        .await;
                    Ok(())
                }
                None => self.bot_not_found(turn).await,
            },
            Callback::Start(short_id) => self.manage(turn, &short_id, ManageAction::Start).await,
            Callback::Stop(short_id) => self.manage(turn, &short_id, ManageAction::Stop).await,
            Callback::Restart(short_id) => {
                self.manage(turn, &short_id, ManageAction::Restart).await
            }
            Callback::Delete(short_id) => self.manage(turn, &short_id, ManageAction::Delete).await,
        }
    }

    async fn bot_not_found(&self, turn: &Turn<'_>) -> PlatformResult<()> {
        self.send(turn.chat_id, "❌ Bot not found", None).await;
        Ok(())
    }

    async fn manage(
        &self,
        turn: &Turn<'_>,
        short_id: &str,
        action: ManageAction,
    ) -> PlatformResult<()> {
        let Some(bot) = self.owned_bot(turn, short_id).await? else {
            return self.bot_not_found(turn).await;
        };
        let token = bot.token.as_str();
        let result = match action {
            ManageAction::Start => self.lifecycle.start(token).await,
            ManageAction::Stop => self.lifecycle.stop(token).await,
            ManageAction::Restart => self.lifecycle.restart(token).await,
            ManageAction::Delete => self.lifecycle.delete(token).await,
        };
        let text = match result {
            Ok(()) => format!("✅ Bot {}!", action.past_tense()),
            Err(PlatformError::Blocked) => "⛔ This bot has been blocked by an admin.".to_string(),
            Err(PlatformError::Persistence(e)) => return Err(PlatformError::Persistence(e)),
            Err(e) => failure_text("❌ Action failed", &e),
        };
        info!(user = turn.user.id, bot = %bot.short_id, "{action:?} requested");
        self.send(turn.chat_id, text, None).await;
        Ok(())
    }

    async fn on_help_message(
        &self,
        turn: &Turn<'_>,
        session: &mut ConversationSession,
        text: Option<&str>,
    ) -> PlatformResult<()> {
        let Some(text) = text.filter(|t| !t.is_empty()) else {
            self.send(turn.chat_id, "✍️ Please describe your problem in a text message.", None)
                .await;
            return Ok(());
        };
        let delivered = self.admin.forward_support(turn.user, text).await;
        session.reset();
        let reply = if delivered > 0 {
            "✅ Message sent! We will get back to you soon."
        } else {
            "⚠️ Support is unavailable right now. Please try again later."
        };
        self.send(turn.chat_id, reply, Some(menu::main_menu())).await;
        Ok(())
    }

    async fn on_admin_command(
        &self,
        turn: &Turn<'_>,
        session: &mut ConversationSession,
        command: PlatformResult<AdminCommand>,
    ) -> PlatformResult<()> {
        let outcome = match command {
            Ok(command) => self.admin.execute(turn.user.id, command).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(CommandOutcome::Reply(text)) => self.send(turn.chat_id, text, None).await,
            Ok(CommandOutcome::AwaitBroadcast) => {
                let next = DialogState::Admin(AdminStep::Broadcast);
                session.advance(next);
                self.prompt(turn, next).await?;
            }
            Ok(CommandOutcome::AwaitReply(user_id)) => {
                let next = DialogState::Admin(AdminStep::ReplyToUser { user_id });
                session.advance(next);
                self.prompt(turn, next).await?;
            }
            Err(e) => self.report_admin_error(turn, e).await?,
        }
        Ok(())
    }

    async fn on_admin_input(
        &self,
        turn: &Turn<'_>,
        session: &mut ConversationSession,
        step: AdminStep,
        text: Option<&str>,
    ) -> PlatformResult<()> {
        let Some(text) = text.filter(|t| !t.is_empty()) else {
            return self.prompt(turn, session.state()).await;
        };
        let result = match step {
            AdminStep::Broadcast => self
                .admin
                .broadcast(turn.user.id, text)
                .await
                .map(|r| format!("📢 Broadcast finished: {} sent, {} failed.", r.sent, r.failed)),
            AdminStep::ReplyToUser { user_id } => self
                .admin
                .reply_to_user(turn.user.id, user_id, text)
                .await
                .map(|()| "✅ Reply sent.".to_string()),
        };
        session.reset();
        match result {
            Ok(text) => self.send(turn.chat_id, text, Some(menu::main_menu())).await,
            Err(e) => self.report_admin_error(turn, e).await?,
        }
        Ok(())
    }

    /// Expected refusals go back to the admin; anything else is unexpected.
    async fn report_admin_error(&self, turn: &Turn<'_>, err: PlatformError) -> PlatformResult<()> {
        let text = match &err {
            PlatformError::Permission(_) => "⛔ Admin only.".to_string(),
            PlatformError::Validation(_)
            | PlatformError::NotFound(_)
            | PlatformError::TransientProvider(_) => {
                format!("❌ {}", escape_html(&err.to_string()))
            }
            _ => return Err(err),
        };
        self.send(turn.chat_id, text, None).await;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum ManageAction {
    Start,
    Stop,
    Restart,
    Delete,
}

impl ManageAction {
    fn past_tense(&self) -> &'static str {
        match self {
            ManageAction::Start => "started",
            ManageAction::Stop => "stopped",
            ManageAction::Restart => "restarted",
            ManageAction::Delete => "deleted",
        }
    }
}

/// Title plus the bounded diagnostic, with a retry hint for transient causes.
fn failure_text(title: &str, err: &PlatformError) -> String {
    let mut text = format!("{title}:\n<code>{}</code>", escape_html(&err.diagnostic()));
    if err.is_retryable() {
        text.push_str(RETRY_HINT);
    }
    text
}

/// Credential and handle collected by the token step.
fn verified(session: &ConversationSession) -> PlatformResult<(String, String)> {
    match (&session.draft.token, &session.draft.public_handle) {
        (Some(token), Some(handle)) => Ok((token.clone(), handle.clone())),
        _ => Err(PlatformError::NotFound("verified token in session".into())),
    }
}

#[async_trait]
impl IncomingHandler for ConversationEngine {
    async fn handle_incoming(&self, update: Update) {
        self.handle(update).await
    }
}
