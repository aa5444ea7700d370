pub mod rhai_host;
mod stdlib;

pub use rhai_host::{RhaiHost, RhaiUnit};

/// Function every tenant program must define; it receives one update.
pub const ENTRY_POINT: &str = "on_update";
