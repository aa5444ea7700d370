pub mod admin;
pub mod apps;
pub mod artifacts;
pub mod config;
pub mod conversation;
pub mod deps;
pub mod error;
pub mod generation;
pub mod host;
pub mod lifecycle;
pub mod logger;
pub mod provider;
pub mod registry;
pub mod webhook;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_util;
