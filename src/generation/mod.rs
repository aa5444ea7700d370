//! AI assistant that asks clarifying questions about a bot idea and then
//! writes the program.

pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use openai::OpenAiGenerator;

/// One answered clarification round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaTurn {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clarification {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub refined_summary: String,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GenerationError {
    #[error("AI generation is not configured")]
    NotConfigured,
    #[error("AI service unreachable: {0}")]
    Transport(String),
    #[error("AI service timed out")]
    Timeout,
    #[error("AI response was malformed: {0}")]
    Malformed(String),
    /// Refusals and content-filter stops.
    #[error("AI service declined: {0}")]
    Refused(String),
}

#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn clarify(
        &self,
        summary: &str,
        history: &[QaTurn],
    ) -> Result<Clarification, GenerationError>;

    /// Complete program source for the summarised idea.
    async fn synthesize(&self, summary: &str) -> Result<String, GenerationError>;
}

/// Summary plus every answer so far, used when clarification stops early.
pub fn fold_history(summary: &str, history: &[QaTurn]) -> String {
    let mut out = summary.to_string();
    for turn in history {
        out.push_str(&format!("\n- {}: {}", turn.question, turn.answer));
    }
    out
}
