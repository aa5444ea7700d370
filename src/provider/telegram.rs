use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, error};

use super::types::{BotIdentity, Keyboard, OutboundMessage};
use super::{MessagingProvider, ProviderError};

#[derive(Debug, serde::Deserialize)]
struct ApiResponse<R> {
    ok: bool,
    #[serde(default = "Option::default")]
    result: Option<R>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<Value>,
}

#[derive(Debug, serde::Deserialize)]
struct FileInfo {
    #[serde(default)]
    file_path: Option<String>,
}

fn reply_markup(keyboard: &Keyboard) -> Value {
    match keyboard {
        Keyboard::Reply(rows) => json!({
            "keyboard": rows
                .iter()
                .map(|row| row.iter().map(|label| json!({ "text": label })).collect::<Vec<_>>())
                .collect::<Vec<_>>(),
            "resize_keyboard": true,
        }),
        Keyboard::Inline(rows) => json!({ "inline_keyboard": rows }),
        Keyboard::Remove => json!({ "remove_keyboard": true }),
    }
}

/// reqwest errors carry the URL, and the URL carries the token.
fn transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(err.without_url().to_string())
    }
}

/// Telegram Bot API over HTTPS.
#[derive(Debug, Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
}

impl TelegramClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(transport)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn method_url(&self, token: &str, method: &str) -> String {
        format!("{}/bot{token}/{method}", self.base_url)
    }

    async fn decode<R: DeserializeOwned>(
        method: &str,
        response: reqwest::Response,
    ) -> Result<R, ProviderError> {
        let status = response.status();
        let body: ApiResponse<R> = response.json().await.map_err(transport)?;
        if !body.ok {
            let description = body
                .description
                .unwrap_or_else(|| "Unknown Telegram API error".to_string());
            error!("Telegram {method} failed: {description}");
            return Err(ProviderError::Rejected {
                code: body.error_code.unwrap_or(status.as_u16() as i64),
                description,
            });
        }
        body.result
            .ok_or_else(|| ProviderError::Transport(format!("{method}: response without result")))
    }

    async fn call<P: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        token: &str,
        method: &str,
        payload: &P,
    ) -> Result<R, ProviderError> {
        let response = self
            .http
            .post(self.method_url(token, method))
            .json(payload)
            .send()
            .await
            .map_err(transport)?;
        Self::decode(method, response).await
    }
}

#[async_trait]
impl MessagingProvider for TelegramClient {
    async fn get_me(&self, token: &str) -> Result<BotIdentity, ProviderError> {
        self.call(token, "getMe", &json!({})).await
    }

    async fn set_webhook(&self, token: &str, url: &str) -> Result<(), ProviderError> {
        let _: Value = self
            .call(token, "setWebhook", &json!({ "url": url }))
            .await?;
        debug!("webhook set to {url}");
        Ok(())
    }

    async fn delete_webhook(&self, token: &str) -> Result<(), ProviderError> {
        let _: Value = self.call(token, "deleteWebhook", &json!({})).await?;
        Ok(())
    }

    async fn send_message(
        &self,
        token: &str,
        message: OutboundMessage,
    ) -> Result<(), ProviderError> {
        let payload = SendMessage {
            chat_id: message.chat_id,
            text: &message.text,
            parse_mode: message.parse_mode.as_deref(),
            reply_markup: message.keyboard.as_ref().map(reply_markup),
        };
        let _: Value = self.call(token, "sendMessage", &payload).await?;
        Ok(())
    }

    async fn send_document(
        &self,
        token: &str,
        chat_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
        caption: Option<String>,
    ) -> Result<(), ProviderError> {
        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("document", Part::bytes(bytes).file_name(file_name.to_string()));
        if let Some(caption) = caption {
            form = form.text("caption", caption);
        }
        let response = self
            .http
            .post(self.method_url(token, "sendDocument"))
            .multipart(form)
            .send()
            .await
            .map_err(transport)?;
        let _: Value = Self::decode("sendDocument", response).await?;
        Ok(())
    }

    async fn download_file(&self, token: &str, file_id: &str) -> Result<Vec<u8>, ProviderError> {
        let info: FileInfo = self.call(token, "getFile", &json!({ "file_id": file_id })).await?;
        let path = info
            .file_path
            .ok_or_else(|| ProviderError::Transport("getFile: no file_path".into()))?;
        let response = self
            .http
            .get(format!("{}/file/bot{token}/{path}", self.base_url))
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(ProviderError::Rejected {
                code: response.status().as_u16() as i64,
                description: "file download failed".into(),
            });
        }
        Ok(response.bytes().await.map_err(transport)?.to_vec())
    }

    async fn answer_callback(
        &self,
        token: &str,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), ProviderError> {
        let mut payload = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            payload["text"] = json!(text);
        }
        let _: Value = self.call(token, "answerCallbackQuery", &payload).await?;
        Ok(())
    }
}
