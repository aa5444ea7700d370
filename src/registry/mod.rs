//! Persistent records of platform users and hosted tenant bots.

pub mod sqlite;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PlatformResult;

pub use sqlite::SqliteRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub handle: Option<String>,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleStatus {
    Stopped,
    Starting,
    Running,
    Error,
    Blocked,
}

impl LifecycleStatus {
    pub const ALL: [LifecycleStatus; 5] = [
        LifecycleStatus::Stopped,
        LifecycleStatus::Starting,
        LifecycleStatus::Running,
        LifecycleStatus::Error,
        LifecycleStatus::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stopped" => Some(Self::Stopped),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "error" => Some(Self::Error),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Running => "🟢",
            Self::Starting => "🟡",
            Self::Stopped => "⚪",
            Self::Error => "🔴",
            Self::Blocked => "⛔",
        }
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreationType {
    Uploaded,
    AiGenerated,
}

impl CreationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::AiGenerated => "ai_generated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "uploaded" => Some(Self::Uploaded),
            "ai_generated" => Some(Self::AiGenerated),
            _ => None,
        }
    }
}

/// A hosted bot. `token` is the provider credential and must never be shown
/// in full; `short_id` is the public handle used for routing and buttons.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantBot {
    pub id: i64,
    pub short_id: String,
    pub owner_id: i64,
    pub token: String,
    pub public_handle: String,
    pub code_location: PathBuf,
    pub status: LifecycleStatus,
    pub creation_type: CreationType,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub event_count: u64,
}

impl TenantBot {
    /// First characters of the token, enough to recognise it in logs.
    pub fn masked_token(&self) -> String {
        mask_token(&self.token)
    }
}

pub fn mask_token(token: &str) -> String {
    let head: String = token.chars().take(10).collect();
    format!("{head}…")
}

impl fmt::Debug for TenantBot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantBot")
            .field("id", &self.id)
            .field("short_id", &self.short_id)
            .field("owner_id", &self.owner_id)
            .field("token", &self.masked_token())
            .field("public_handle", &self.public_handle)
            .field("status", &self.status)
            .field("last_error", &self.last_error)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct NewTenant {
    pub owner_id: i64,
    pub token: String,
    pub code_location: PathBuf,
    pub creation_type: CreationType,
    pub public_handle: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlatformStats {
    pub users: u64,
    pub bots: u64,
    pub running: u64,
    pub stopped: u64,
    pub starting: u64,
    pub error: u64,
    pub blocked: u64,
    pub total_events: u64,
}

impl PlatformStats {
    pub fn count(&mut self, status: LifecycleStatus, n: u64) {
        match status {
            LifecycleStatus::Running => self.running += n,
            LifecycleStatus::Stopped => self.stopped += n,
            LifecycleStatus::Starting => self.starting += n,
            LifecycleStatus::Error => self.error += n,
            LifecycleStatus::Blocked => self.blocked += n,
        }
    }
}

#[async_trait]
pub trait TenantRegistry: Send + Sync {
    /// Create the user on first contact, refresh handle and activity otherwise.
    async fn upsert_user(
        &self,
        id: i64,
        handle: Option<&str>,
        display_name: &str,
    ) -> PlatformResult<User>;

    async fn get_user(&self, id: i64) -> PlatformResult<Option<User>>;

    /// Most recently active first.
    async fn list_users(&self, limit: usize) -> PlatformResult<Vec<User>>;

    async fn all_user_ids(&self) -> PlatformResult<Vec<i64>>;

    /// Insert, or on an existing token refresh code location, handle and
    /// creation type. Identity, owner and status of an existing row are kept.
    async fn upsert(&self, tenant: NewTenant) -> PlatformResult<TenantBot>;

    async fn get_by_token(&self, token: &str) -> PlatformResult<Option<TenantBot>>;

    async fn find_by_short_id(&self, short_id: &str) -> PlatformResult<Option<TenantBot>>;

    /// Unique tenant whose token starts with `prefix`. Ambiguity is an error.
    async fn find_by_token_prefix(&self, prefix: &str) -> PlatformResult<Option<TenantBot>>;

    async fn list_by_owner(&self, owner_id: i64) -> PlatformResult<Vec<TenantBot>>;

    /// Newest first.
    async fn list_bots(&self, limit: usize) -> PlatformResult<Vec<TenantBot>>;

    async fn list_by_status(&self, status: LifecycleStatus) -> PlatformResult<Vec<TenantBot>>;

    async fn update_status(
        &self,
        token: &str,
        status: LifecycleStatus,
        error: Option<String>,
    ) -> PlatformResult<()>;

    async fn increment_event_count(&self, token: &str) -> PlatformResult<()>;

    /// Returns whether a row was removed.
    async fn delete(&self, token: &str) -> PlatformResult<bool>;

    async fn aggregate_stats(&self) -> PlatformResult<PlatformStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_round_trip() {
        for status in LifecycleStatus::ALL {
            assert_eq!(LifecycleStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(LifecycleStatus::parse("paused"), None);
    }

    #[test]
    fn debug_never_prints_full_token() {
        let bot = TenantBot {
            id: 1,
            short_id: "abcdef012345".into(),
            owner_id: 9,
            token: "123456:SECRETSECRETSECRETSECRETSECRETSECRET".into(),
            public_handle: "demo_bot".into(),
            code_location: PathBuf::from("x.rhai"),
            status: LifecycleStatus::Stopped,
            creation_type: CreationType::Uploaded,
            created_at: Utc::now(),
            last_error: None,
            event_count: 0,
        };
        let printed = format!("{bot:?}");
        assert!(!printed.contains("SECRETSECRET"));
        assert!(printed.contains("123456:SEC"));
    }
}
