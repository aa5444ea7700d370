//! Operator commands. Every entry point names the acting user and checks it
//! against the configured admin set before doing anything.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::conversation::menu::{escape_html, reply_to};
use crate::error::{PlatformError, PlatformResult};
use crate::lifecycle::LifecycleManager;
use crate::provider::{MessagingProvider, OutboundMessage, types};
use crate::registry::{LifecycleStatus, PlatformStats, TenantBot, TenantRegistry, User};

/// Telegram refuses messages above 4096 characters.
const MAX_MESSAGE_CHARS: usize = 4000;
const LIST_LIMIT: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub sent: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantInspection {
    pub short_id: String,
    pub public_handle: String,
    pub owner_id: i64,
    pub masked_token: String,
    pub status: LifecycleStatus,
    pub last_error: Option<String>,
    pub event_count: u64,
    pub running: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub stored: PlatformStats,
    pub live_runtimes: usize,
}

/// A chat command typed by an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Stats,
    Users,
    Bots,
    Block(String),
    Unblock(String),
    Inspect(String),
    Broadcast(Option<String>),
    Reply { user_id: i64, text: Option<String> },
}

impl AdminCommand {
    /// `None` when `text` is not an admin command at all; malformed
    /// arguments are a validation error.
    pub fn parse(text: &str) -> Option<PlatformResult<Self>> {
        let text = text.trim();
        let (head, rest) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
        let rest = rest.trim();
        let arg = || -> PlatformResult<String> {
            match rest.split_whitespace().next() {
                Some(id) => Ok(id.to_string()),
                None => Err(PlatformError::Validation(format!("usage: {head} <bot id>"))),
            }
        };
        let cmd = match head {
            "/stats" => Ok(AdminCommand::Stats),
            "/users" => Ok(AdminCommand::Users),
            "/bots" => Ok(AdminCommand::Bots),
            "/block" => arg().map(AdminCommand::Block),
            "/unblock" => arg().map(AdminCommand::Unblock),
            "/inspect" => arg().map(AdminCommand::Inspect),
            "/broadcast" => Ok(AdminCommand::Broadcast(
                Some(rest.to_string()).filter(|r| !r.is_empty()),
            )),
            "/reply" => {
                let (id, message) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                id.parse::<i64>()
                    .map(|user_id| AdminCommand::Reply {
                        user_id,
                        text: Some(message.trim().to_string()).filter(|m| !m.is_empty()),
                    })
                    .map_err(|_| {
                        PlatformError::Validation("usage: /reply <user id> [message]".into())
                    })
            }
            _ => return None,
        };
        Some(cmd)
    }
}

/// What the conversation layer should do after a command ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Reply(String),
    AwaitBroadcast,
    AwaitReply(i64),
}

pub struct AdminConsole {
    admins: HashSet<i64>,
    platform_token: String,
    lifecycle: Arc<LifecycleManager>,
    provider: Arc<dyn MessagingProvider>,
    broadcast_delay: Duration,
}

impl AdminConsole {
    pub fn new(
        admins: HashSet<i64>,
        platform_token: impl Into<String>,
        lifecycle: Arc<LifecycleManager>,
        provider: Arc<dyn MessagingProvider>,
        broadcast_delay: Duration,
    ) -> Self {
        Self {
            admins,
            platform_token: platform_token.into(),
            lifecycle,
            provider,
            broadcast_delay,
        }
    }

    fn registry(&self) -> &Arc<dyn TenantRegistry> {
        self.lifecycle.registry()
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admins.contains(&user_id)
    }

    pub fn ensure_admin(&self, actor: i64) -> PlatformResult<()> {
        if self.is_admin(actor) {
            Ok(())
        } else {
            warn!(user = actor, "admin operation refused");
            Err(PlatformError::Permission(format!("user {actor} is not an admin")))
        }
    }

    /// Short id first, then the full credential, then a credential prefix.
    async fn resolve(&self, reference: &str) -> PlatformResult<TenantBot> {
        let registry = self.registry();
        if let Some(bot) = registry.find_by_short_id(reference).await? {
            return Ok(bot);
        }
        if let Some(bot) = registry.get_by_token(reference).await? {
            return Ok(bot);
        }
        registry
            .find_by_token_prefix(reference)
            .await?
            .ok_or_else(|| PlatformError::NotFound(format!("bot {reference}")))
    }

    pub async fn block(&self, actor: i64, reference: &str) -> PlatformResult<TenantBot> {
        self.ensure_admin(actor)?;
        let bot = self.resolve(reference).await?;
        self.lifecycle.block(&bot.token).await?;
        info!(admin = actor, bot = %bot.short_id, "bot blocked");
        Ok(bot)
    }

    pub async fn unblock(&self, actor: i64, reference: &str) -> PlatformResult<TenantBot> {
        self.ensure_admin(actor)?;
        let bot = self.resolve(reference).await?;
        self.lifecycle.unblock(&bot.token).await?;
        info!(admin = actor, bot = %bot.short_id, "bot unblocked");
        Ok(bot)
    }

    /// Send `message` to every known user, pausing between sends. Failures
    /// are counted, never fatal.
    pub async fn broadcast(&self, actor: i64, message: &str) -> PlatformResult<BroadcastReport> {
        self.ensure_admin(actor)?;
        let mut report = BroadcastReport::default();
        for user_id in self.registry().all_user_ids().await? {
            let text = format!("📢 <b>Announcement</b>\n\n{}", escape_html(message));
            let msg = OutboundMessage::text(user_id, text).html();
            match self.provider.send_message(&self.platform_token, msg).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    warn!(user = user_id, "broadcast delivery failed: {e}");
                    report.failed += 1;
                }
            }
            tokio::time::sleep(self.broadcast_delay).await;
        }
        info!(admin = actor, "broadcast finished: {} sent, {} failed", report.sent, report.failed);
        Ok(report)
    }

    pub async fn inspect(&self, actor: i64, reference: &str) -> PlatformResult<TenantInspection> {
        self.ensure_admin(actor)?;
        let bot = self.resolve(reference).await?;
        Ok(TenantInspection {
            running: self.lifecycle.is_running(&bot.token),
            masked_token: bot.masked_token(),
            short_id: bot.short_id,
            public_handle: bot.public_handle,
            owner_id: bot.owner_id,
            status: bot.status,
            last_error: bot.last_error,
            event_count: bot.event_count,
            created_at: bot.created_at,
        })
    }

    pub async fn stats(&self, actor: i64) -> PlatformResult<StatsSnapshot> {
        self.ensure_admin(actor)?;
        Ok(StatsSnapshot {
            stored: self.registry().aggregate_stats().await?,
            live_runtimes: self.lifecycle.running_count(),
        })
    }

    pub async fn recent_users(&self, actor: i64, limit: usize) -> PlatformResult<Vec<User>> {
        self.ensure_admin(actor)?;
        self.registry().list_users(limit).await
    }

    pub async fn recent_bots(&self, actor: i64, limit: usize) -> PlatformResult<Vec<TenantBot>> {
        self.ensure_admin(actor)?;
        self.registry().list_bots(limit).await
    }

    pub async fn reply_to_user(&self, actor: i64, user_id: i64, text: &str) -> PlatformResult<()> {
        self.ensure_admin(actor)?;
        let text = format!("💬 <b>Support reply</b>\n\n{}", escape_html(text));
        let msg = OutboundMessage::text(user_id, text).html();
        self.provider.send_message(&self.platform_token, msg).await?;
        info!(admin = actor, user = user_id, "support reply sent");
        Ok(())
    }

    /// Forward a help request to every admin with a reply button. Returns how
    /// many admins received it.
    pub async fn forward_support(&self, from: &types::User, text: &str) -> usize {
        let body = format!(
            "🆘 <b>Support Request</b>\n\n👤 {} (@{})\n🆔 <code>{}</code>\n\n📝 {}",
            escape_html(&from.display_name()),
            escape_html(from.username.as_deref().unwrap_or("none")),
            from.id,
            escape_html(text),
        );
        let mut delivered = 0;
        for admin in &self.admins {
            let msg = OutboundMessage::text(*admin, body.clone())
                .html()
                .with_keyboard(reply_to(from.id));
            match self.provider.send_message(&self.platform_token, msg).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(admin = *admin, "support forward failed: {e}"),
            }
        }
        delivered
    }

    pub async fn execute(
        &self,
        actor: i64,
        command: AdminCommand,
    ) -> PlatformResult<CommandOutcome> {
        self.ensure_admin(actor)?;
        let text = match command {
            AdminCommand::Stats => render_stats(&self.stats(actor).await?),
            AdminCommand::Users => render_users(&self.recent_users(actor, LIST_LIMIT).await?),
            AdminCommand::Bots => render_bots(&self.recent_bots(actor, LIST_LIMIT).await?),
            AdminCommand::Block(reference) => {
                let bot = self.block(actor, &reference).await?;
                format!("⛔ @{} blocked.", escape_html(&bot.public_handle))
            }
            AdminCommand::Unblock(reference) => {
                let bot = self.unblock(actor, &reference).await?;
                format!(
                    "✅ @{} unblocked. The owner can start it again.",
                    escape_html(&bot.public_handle)
                )
            }
            AdminCommand::Inspect(reference) => {
                render_inspection(&self.inspect(actor, &reference).await?)
            }
            AdminCommand::Broadcast(Some(message)) => {
                let report = self.broadcast(actor, &message).await?;
                format!("📢 Broadcast finished: {} sent, {} failed.", report.sent, report.failed)
            }
            AdminCommand::Broadcast(None) => return Ok(CommandOutcome::AwaitBroadcast),
            AdminCommand::Reply { user_id, text: Some(message) } => {
                self.reply_to_user(actor, user_id, &message).await?;
                "✅ Reply sent.".to_string()
            }
            AdminCommand::Reply { user_id, text: None } => {
                return Ok(CommandOutcome::AwaitReply(user_id));
            }
        };
        Ok(CommandOutcome::Reply(text))
    }
}

pub fn render_stats(stats: &StatsSnapshot) -> String {
    let s = &stats.stored;
    format!(
        "👑 <b>Admin Stats</b>\n\n👥 Users: {}\n🤖 Bots: {}\n🟢 Running: {} ({} live)\n⚪ Stopped: {}\n🟡 Starting: {}\n🔴 Error: {}\n⛔ Blocked: {}\n📨 Events: {}",
        s.users,
        s.bots,
        s.running,
        stats.live_runtimes,
        s.stopped,
        s.starting,
        s.error,
        s.blocked,
        s.total_events
    )
}

fn render_users(users: &[User]) -> String {
    let mut out = String::from("👥 <b>Recent Users:</b>\n\n");
    for user in users {
        let line = format!(
            "• {} (@{}) <code>{}</code>\n",
            escape_html(&user.display_name),
            escape_html(user.handle.as_deref().unwrap_or("none")),
            user.id
        );
        if out.chars().count() + line.chars().count() > MAX_MESSAGE_CHARS {
            break;
        }
        out.push_str(&line);
    }
    out
}

fn render_bots(bots: &[TenantBot]) -> String {
    let mut out = String::from("🤖 <b>Recent Bots:</b>\n\n");
    for bot in bots {
        let line = format!(
            "{} @{} <code>{}</code> owner <code>{}</code>\n",
            bot.status.emoji(),
            escape_html(&bot.public_handle),
            bot.short_id,
            bot.owner_id
        );
        if out.chars().count() + line.chars().count() > MAX_MESSAGE_CHARS {
            break;
        }
        out.push_str(&line);
    }
    out
}

fn render_inspection(i: &TenantInspection) -> String {
    let mut out = format!(
        "🔎 <b>@{}</b>\n\n🆔 <code>{}</code>\n🔑 <code>{}</code>\n👤 Owner: <code>{}</code>\n📊 Status: {} {}\n⚙️ Runtime: {}\n📨 Events: {}\n📅 Created: {}",
        escape_html(&i.public_handle),
        i.short_id,
        escape_html(&i.masked_token),
        i.owner_id,
        i.status.emoji(),
        i.status,
        if i.running { "live" } else { "not running" },
        i.event_count,
        i.created_at.format("%Y-%m-%d %H:%M"),
    );
    if let Some(err) = &i.last_error {
        out.push_str(&format!("\n\n⚠️ <code>{}</code>", escape_html(err)));
    }
    out
}
