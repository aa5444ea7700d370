pub mod message;
pub mod plugin;

pub use message::{OutboundAction, TenantEvent};
pub use plugin::{ExecutionHost, LoadRequest, PluginError, RunnableUnit, UnitState};
