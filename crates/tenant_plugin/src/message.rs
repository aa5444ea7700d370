use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An inbound provider update addressed to one hosted tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantEvent {
    pub route_id: String,                // Non-secret route identity of the tenant
    pub received_at: DateTime<Utc>,      // When the webhook accepted it
    pub payload: Value,                  // Raw provider update envelope
}

impl TenantEvent {
    pub fn new(route_id: impl Into<String>, payload: Value) -> Self {
        Self {
            route_id: route_id.into(),
            received_at: Utc::now(),
            payload,
        }
    }

    /// Chat the update came from, when the envelope carries one.
    pub fn chat_id(&self) -> Option<i64> {
        self.payload
            .pointer("/message/chat/id")
            .or_else(|| self.payload.pointer("/edited_message/chat/id"))
            .or_else(|| self.payload.pointer("/callback_query/message/chat/id"))
            .and_then(Value::as_i64)
    }
}

/// Something a tenant asked the host to send on its behalf.
/// The host delivers these with the tenant's own credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum OutboundAction {
    Reply {
        chat_id: i64,
        text: String,
    },
    ReplyWithButtons {
        chat_id: i64,
        text: String,
        buttons: Vec<String>,
    },
    AnswerCallback {
        callback_id: String,
        text: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_id_from_message_update() {
        let ev = TenantEvent::new("abc", json!({"update_id": 1, "message": {"chat": {"id": 42}}}));
        assert_eq!(ev.chat_id(), Some(42));
    }

    #[test]
    fn chat_id_from_callback_update() {
        let ev = TenantEvent::new(
            "abc",
            json!({"update_id": 2, "callback_query": {"id": "q", "message": {"chat": {"id": -7}}}}),
        );
        assert_eq!(ev.chat_id(), Some(-7));
    }

    #[test]
    fn chat_id_missing() {
        let ev = TenantEvent::new("abc", json!({"update_id": 3}));
        assert_eq!(ev.chat_id(), None);
    }
}
