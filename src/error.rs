use tenant_plugin::PluginError;
use thiserror::Error;

use crate::generation::GenerationError;
use crate::provider::ProviderError;

/// Longest diagnostic stored on a tenant row.
pub const MAX_DIAGNOSTIC_LEN: usize = 300;

pub type PlatformResult<T> = Result<T, PlatformError>;

#[derive(Debug, Error)]
pub enum PlatformError {
    /// Malformed input. Local to the caller, re-prompt, no state change.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Network or timeout trouble with the messaging or AI provider.
    #[error("provider unavailable: {0}")]
    TransientProvider(String),

    #[error("dependency installation failed: {0}")]
    DependencyInstall(String),

    #[error("code failed to load: {0}")]
    CodeLoad(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("tenant is blocked")]
    Blocked,

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl PlatformError {
    /// True for failures worth retrying by the user later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlatformError::TransientProvider(_) | PlatformError::Generation(_))
    }

    /// The message stored as a tenant's `last_error`.
    pub fn diagnostic(&self) -> String {
        bounded(&self.to_string(), MAX_DIAGNOSTIC_LEN)
    }
}

/// Truncate to at most `max` characters, marking the cut.
pub fn bounded(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

impl From<rusqlite::Error> for PlatformError {
    fn from(err: rusqlite::Error) -> Self {
        PlatformError::Persistence(err.to_string())
    }
}

impl From<std::io::Error> for PlatformError {
    fn from(err: std::io::Error) -> Self {
        PlatformError::Persistence(err.to_string())
    }
}

impl From<ProviderError> for PlatformError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Rejected { description, .. } => PlatformError::Validation(description),
            other => PlatformError::TransientProvider(other.to_string()),
        }
    }
}

impl From<PluginError> for PlatformError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::Syntax(_) | PluginError::MissingEntryPoint(_) => {
                PlatformError::Validation(err.to_string())
            }
            other => PlatformError::CodeLoad(other.to_string()),
        }
    }
}

impl From<GenerationError> for PlatformError {
    fn from(err: GenerationError) -> Self {
        PlatformError::Generation(err.to_string())
    }
}
