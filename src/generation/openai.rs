use std::time::Duration;

use async_trait::async_trait;
use handlebars::Handlebars;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, error};

use super::{Clarification, GenerationClient, GenerationError, QaTurn};
use crate::error::bounded;

const MAX_OPTIONS: usize = 4;

const CLARIFY_SYSTEM: &str = r#"You help non-programmers design Telegram bots.
Ask exactly one short clarifying question about the idea and offer up to four short answer options.
Reply with a JSON object: {"question": string, "options": [string], "refined_summary": string}.
refined_summary restates the whole idea including every answer so far."#;

const SYNTHESIZE_SYSTEM: &str = r#"You write Telegram bots as Rhai scripts.
The script must define `fn on_update(update)`; `update` is the Telegram update as an object map.
Send messages with `reply(chat_id, text)` and `reply_buttons(chat_id, text, ["a", "b"])`.
Host modules: import "json", "time", "text", "math", "platform", "os" inside functions.
Return only the script, no explanations."#;

const CLARIFY_TEMPLATE: &str = "Idea: {{summary}}
{{#if history}}Answered so far:
{{#each history}}- {{this.question}} => {{this.answer}}
{{/each}}{{/if}}";

const SYNTHESIZE_TEMPLATE: &str = "Write the bot described here:
{{summary}}";

/// OpenAI-compatible chat completions client.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    prompts: Handlebars<'static>,
}

impl OpenAiGenerator {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        let mut prompts = Handlebars::new();
        prompts.register_escape_fn(handlebars::no_escape);
        prompts
            .register_template_string("clarify", CLARIFY_TEMPLATE)
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;
        prompts
            .register_template_string("synthesize", SYNTHESIZE_TEMPLATE)
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            prompts,
        })
    }

    fn render(&self, template: &str, data: &Value) -> Result<String, GenerationError> {
        self.prompts
            .render(template, data)
            .map_err(|e| GenerationError::Malformed(format!("prompt template: {e}")))
    }

    async fn complete(
        &self,
        system: &str,
        user: String,
        json_mode: bool,
    ) -> Result<String, GenerationError> {
        let api_key = self.api_key.as_deref().ok_or(GenerationError::NotConfigured)?;

        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        if json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::Timeout
                } else {
                    GenerationError::Transport(e.without_url().to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".into());
            error!("AI service error {status}: {text}");
            return Err(GenerationError::Transport(bounded(&format!("{status}: {text}"), 200)));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;
        extract_content(&json)
    }
}

fn extract_content(json: &Value) -> Result<String, GenerationError> {
    if json.pointer("/choices/0/finish_reason").and_then(Value::as_str) == Some("content_filter") {
        return Err(GenerationError::Refused("content filter".into()));
    }
    if let Some(refusal) = json.pointer("/choices/0/message/refusal").and_then(Value::as_str) {
        return Err(GenerationError::Refused(bounded(refusal, 200)));
    }
    match json.pointer("/choices/0/message/content") {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::Array(parts)) => {
            let joined = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            if joined.trim().is_empty() {
                Err(GenerationError::Malformed("empty message content".into()))
            } else {
                Ok(joined)
            }
        }
        _ => Err(GenerationError::Malformed("response missing message content".into())),
    }
}

/// Models like to wrap code in markdown fences even when told not to.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // drop the info string (`rhai`, `rust`, ...)
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end().trim_end_matches("```").trim().to_string()
}

#[async_trait]
impl GenerationClient for OpenAiGenerator {
    async fn clarify(
        &self,
        summary: &str,
        history: &[QaTurn],
    ) -> Result<Clarification, GenerationError> {
        let user = self.render("clarify", &json!({ "summary": summary, "history": history }))?;
        let content = self.complete(CLARIFY_SYSTEM, user, true).await?;

        let mut clarification: Clarification =
            serde_json::from_str(strip_code_fences(&content).as_str())
                .map_err(|e| GenerationError::Malformed(e.to_string()))?;
        if clarification.question.trim().is_empty() {
            return Err(GenerationError::Malformed("empty question".into()));
        }
        if clarification.refined_summary.trim().is_empty() {
            clarification.refined_summary = summary.to_string();
        }
        clarification.options.retain(|o| !o.trim().is_empty());
        clarification.options.truncate(MAX_OPTIONS);
        debug!("clarification: {}", clarification.question);
        Ok(clarification)
    }

    async fn synthesize(&self, summary: &str) -> Result<String, GenerationError> {
        let user = self.render("synthesize", &json!({ "summary": summary }))?;
        let content = self.complete(SYNTHESIZE_SYSTEM, user, false).await?;
        let code = strip_code_fences(&content);
        if code.is_empty() {
            return Err(GenerationError::Malformed("empty program".into()));
        }
        Ok(code)
    }
}
