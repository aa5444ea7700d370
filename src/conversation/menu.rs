//! Button labels, keyboards and callback payloads of the platform bot.

use crate::provider::{InlineButton, Keyboard};
use crate::registry::TenantBot;

pub const HOST_BOT: &str = "📤 Host My Bot";
pub const CREATE_BOT: &str = "✨ Create New Bot";
pub const MY_BOTS: &str = "📊 My Bots";
pub const HELP: &str = "🆘 Help";
pub const BACK: &str = "🔙 Back";
pub const MAIN_MENU: &str = "🏠 Main Menu";

pub fn main_menu() -> Keyboard {
    Keyboard::Reply(vec![
        vec![HOST_BOT.to_string(), CREATE_BOT.to_string()],
        vec![MY_BOTS.to_string(), HELP.to_string()],
    ])
}

pub fn back_menu() -> Keyboard {
    Keyboard::Reply(vec![vec![BACK.to_string(), MAIN_MENU.to_string()]])
}

/// `/start`, `/cancel` and the main menu button all clear the session.
pub fn is_home(text: &str) -> bool {
    matches!(text, "/start" | "/cancel" | MAIN_MENU)
}

/// Inline button payloads. Tenants are referenced by short id only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    View(String),
    Start(String),
    Stop(String),
    Restart(String),
    Delete(String),
    BotList,
    Option(usize),
    Finish,
    ReplyTo(i64),
}

impl Callback {
    pub fn parse(data: &str) -> Option<Self> {
        match data {
            "list" => return Some(Callback::BotList),
            "finish" => return Some(Callback::Finish),
            _ => {}
        }
        let (kind, arg) = data.split_once('_')?;
        if arg.is_empty() {
            return None;
        }
        let cb = match kind {
            "view" => Callback::View(arg.to_string()),
            "start" => Callback::Start(arg.to_string()),
            "stop" => Callback::Stop(arg.to_string()),
            "restart" => Callback::Restart(arg.to_string()),
            "delete" => Callback::Delete(arg.to_string()),
            "opt" => Callback::Option(arg.parse().ok()?),
            "reply" => Callback::ReplyTo(arg.parse().ok()?),
            _ => return None,
        };
        Some(cb)
    }

    pub fn data(&self) -> String {
        match self {
            Callback::View(id) => format!("view_{id}"),
            Callback::Start(id) => format!("start_{id}"),
            Callback::Stop(id) => format!("stop_{id}"),
            Callback::Restart(id) => format!("restart_{id}"),
            Callback::Delete(id) => format!("delete_{id}"),
            Callback::BotList => "list".to_string(),
            Callback::Option(i) => format!("opt_{i}"),
            Callback::Finish => "finish".to_string(),
            Callback::ReplyTo(user) => format!("reply_{user}"),
        }
    }

    fn button(self, label: impl Into<String>) -> InlineButton {
        InlineButton::new(label, self.data())
    }
}

pub fn bot_list(bots: &[TenantBot]) -> Keyboard {
    Keyboard::Inline(
        bots.iter()
            .map(|b| {
                vec![Callback::View(b.short_id.clone())
                    .button(format!("{} @{}", b.status.emoji(), b.public_handle))]
            })
            .collect(),
    )
}

pub fn bot_actions(bot: &TenantBot) -> Keyboard {
    let id = &bot.short_id;
    Keyboard::Inline(vec![
        vec![
            Callback::Start(id.clone()).button("▶️ Start"),
            Callback::Stop(id.clone()).button("⏹ Stop"),
        ],
        vec![
            Callback::Restart(id.clone()).button("🔄 Restart"),
            Callback::Delete(id.clone()).button("🗑 Delete"),
        ],
        vec![Callback::BotList.button("🔙 Back to list")],
    ])
}

pub fn consultation(options: &[String]) -> Keyboard {
    let mut rows: Vec<Vec<InlineButton>> = options
        .iter()
        .enumerate()
        .map(|(i, option)| vec![Callback::Option(i).button(option.clone())])
        .collect();
    rows.push(vec![Callback::Finish.button("✅ Finish now & build")]);
    Keyboard::Inline(rows)
}

pub fn reply_to(user_id: i64) -> Keyboard {
    Keyboard::Inline(vec![vec![Callback::ReplyTo(user_id).button("↩️ Reply")]])
}

/// Messages go out with HTML parse mode; user-provided text must be escaped.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub fn bot_overview(bots: &[TenantBot]) -> String {
    let mut out = String::from("📊 <b>Your Hosted Bots:</b>\n\n");
    for bot in bots {
        out.push_str(&format!(
            "{} @{} ({})\n",
            bot.status.emoji(),
            escape_html(&bot.public_handle),
            bot.status
        ));
    }
    out.push_str("\nSelect a bot to manage it:");
    out
}

pub fn bot_details(bot: &TenantBot) -> String {
    let mut out = format!(
        "⚙️ <b>Manage Bot</b>\n\n🤖 @{}\n📊 Status: {} {}\n📨 Events: {}\n📅 Created: {}\n🆔 <code>{}</code>",
        escape_html(&bot.public_handle),
        bot.status.emoji(),
        bot.status,
        bot.event_count,
        bot.created_at.format("%Y-%m-%d %H:%M"),
        bot.short_id,
    );
    if let Some(err) = &bot.last_error {
        out.push_str(&format!("\n\n⚠️ Last error:\n<code>{}</code>", escape_html(err)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callbacks_parse_their_own_payloads() {
        let all = [
            Callback::View("ab12".into()),
            Callback::Start("ab12".into()),
            Callback::Stop("ab12".into()),
            Callback::Restart("ab12".into()),
            Callback::Delete("ab12".into()),
            Callback::BotList,
            Callback::Option(3),
            Callback::Finish,
            Callback::ReplyTo(42),
        ];
        for cb in all {
            assert_eq!(Callback::parse(&cb.data()), Some(cb));
        }
    }

    #[test]
    fn garbage_callbacks_are_ignored() {
        assert_eq!(Callback::parse("view_"), None);
        assert_eq!(Callback::parse("opt_x"), None);
        assert_eq!(Callback::parse("launch_ab12"), None);
        assert_eq!(Callback::parse(""), None);
    }

    #[test]
    fn consultation_keyboard_ends_with_finish() {
        let Keyboard::Inline(rows) = consultation(&["A".into(), "B".into()]) else {
            panic!("expected inline keyboard");
        };
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1][0].callback_data, "opt_1");
        assert_eq!(rows[2][0].callback_data, "finish");
    }

    #[test]
    fn html_is_escaped() {
        assert_eq!(escape_html("<b>&"), "&lt;b&gt;&amp;");
    }
}
