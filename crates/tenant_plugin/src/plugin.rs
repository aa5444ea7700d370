use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{OutboundAction, TenantEvent};

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum UnitState {
    #[default]
    Loaded,
    Running,
    Stopped,
}

/// Everything a host needs to turn a stored program into a runnable unit.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Non-secret identity used in logs and event routing.
    pub route_id: String,
    /// Program source text.
    pub source: String,
}

/// A loaded tenant program.
///
/// Units are created by an [`ExecutionHost`], started once by the lifecycle
/// supervisor and then receive events until they are stopped. A stopped unit
/// is never restarted; the supervisor loads a fresh one instead.
#[async_trait]
pub trait RunnableUnit: Send + Sync {
    /// The route identity this unit was loaded for.
    fn name(&self) -> String;

    fn state(&self) -> UnitState;

    /// Begin accepting events.
    async fn start(&self) -> Result<(), PluginError>;

    /// Stop accepting events. Calling it twice is not an error.
    async fn stop(&self) -> Result<(), PluginError>;

    /// Hand one inbound event to the program and collect what it wants sent.
    async fn deliver(&self, event: TenantEvent) -> Result<Vec<OutboundAction>, PluginError>;
}

/// Loads and validates tenant programs.
#[async_trait]
pub trait ExecutionHost: Send + Sync {
    /// File extension accepted for uploaded programs, without the dot.
    fn program_extension(&self) -> &'static str;

    /// Static check: syntax and the required entry point. Never runs the program.
    fn validate(&self, source: &str) -> Result<(), PluginError>;

    /// Compile and initialise a program.
    async fn load(&self, request: LoadRequest) -> Result<Arc<dyn RunnableUnit>, PluginError>;
}

/// Errors that an execution host or unit can return.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    /// The program does not parse.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// The program parses but lacks the entry point.
    #[error("missing entry point `{0}`")]
    MissingEntryPoint(String),

    /// Top-level code failed while the program was being loaded.
    #[error("initialisation failed: {0}")]
    Init(String),

    /// The program raised an error while handling an event.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The unit is not in a state where this operation is valid.
    #[error("invalid state for this operation")]
    InvalidState,

    #[error("plugin error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> PluginError {
        PluginError::Other(err.to_string())
    }
}

impl From<anyhow::Error> for PluginError {
    fn from(err: anyhow::Error) -> PluginError {
        PluginError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_descriptive() {
        assert_eq!(
            PluginError::MissingEntryPoint("on_update".into()).to_string(),
            "missing entry point `on_update`"
        );
        assert_eq!(PluginError::InvalidState.to_string(), "invalid state for this operation");
    }

    #[test]
    fn anyhow_converts_to_other() {
        let err: PluginError = anyhow::anyhow!("boom").into();
        assert_eq!(err, PluginError::Other("boom".into()));
    }
}
