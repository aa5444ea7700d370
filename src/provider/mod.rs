//! Messaging provider client. Every call names the credential it acts with,
//! so the same client serves the platform bot and every tenant.

pub mod telegram;
pub mod types;

use async_trait::async_trait;
use thiserror::Error;

pub use telegram::TelegramClient;
pub use types::{BotIdentity, InlineButton, Keyboard, OutboundMessage, Update};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    /// The provider answered and refused the call.
    #[error("provider rejected the call ({code}): {description}")]
    Rejected { code: i64, description: String },
    #[error("provider call timed out")]
    Timeout,
}

#[async_trait]
pub trait MessagingProvider: Send + Sync {
    /// Credential liveness check.
    async fn get_me(&self, token: &str) -> Result<BotIdentity, ProviderError>;

    async fn set_webhook(&self, token: &str, url: &str) -> Result<(), ProviderError>;

    async fn delete_webhook(&self, token: &str) -> Result<(), ProviderError>;

    async fn send_message(
        &self,
        token: &str,
        message: OutboundMessage,
    ) -> Result<(), ProviderError>;

    async fn send_document(
        &self,
        token: &str,
        chat_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
        caption: Option<String>,
    ) -> Result<(), ProviderError>;

    async fn download_file(&self, token: &str, file_id: &str) -> Result<Vec<u8>, ProviderError>;

    async fn answer_callback(
        &self,
        token: &str,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), ProviderError>;
}
