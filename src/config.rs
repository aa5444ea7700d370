use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::{env, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Reads the process environment after loading an optional `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("Loaded .env from {}", env_file.display());
        } else {
            warn!("no .env at {}, using the process environment", env_file.display())
        }

        Box::new(Self { env_file })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, _value: &str) -> Result<(), String> {
        Err(format!(
            "cannot set {key}: environment configuration from {} is read-only",
            self.env_file.display()
        ))
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "EnvConfigManager".to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            map: DashMap::new(),
        })
    }

    pub fn with(entries: &[(&str, &str)]) -> Box<Self> {
        let mgr = Self::new();
        for (k, v) in entries {
            mgr.map.insert(k.to_string(), v.to_string());
        }
        mgr
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Import names whose installable distribution is named differently.
const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("telegram", "rhai-telegram"),
    ("http", "rhai-http"),
    ("yaml", "rhai-yaml"),
    ("dates", "rhai-chrono"),
];

/// Typed platform settings resolved from a [`ConfigManager`].
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub platform_token: String,
    pub public_base_url: Url,
    pub admin_ids: HashSet<i64>,
    pub platform_route_id: String,
    pub bind_addr: SocketAddr,
    pub database_path: PathBuf,
    pub bots_dir: PathBuf,
    pub modules_dir: PathBuf,
    /// Program plus leading arguments; package names are appended.
    pub install_command: Vec<String>,
    pub install_timeout: Duration,
    pub dependency_aliases: BTreeMap<String, String>,
    pub telegram_api_url: String,
    pub provider_timeout: Duration,
    pub ai_api_key: Option<String>,
    pub ai_base_url: String,
    pub ai_model: String,
    pub ai_timeout: Duration,
    pub session_timeout: Duration,
    pub restart_settle: Duration,
    pub broadcast_delay: Duration,
    pub script_max_operations: u64,
}

impl PlatformConfig {
    pub async fn load(cm: &ConfigManager) -> Result<Self, ConfigError> {
        let src = &cm.0;

        let platform_token = required(src.as_ref(), "PLATFORM_BOT_TOKEN").await?;
        let base = required(src.as_ref(), "PUBLIC_BASE_URL").await?;
        let public_base_url = Url::parse(&base).map_err(|e| ConfigError::Invalid {
            key: "PUBLIC_BASE_URL",
            reason: e.to_string(),
        })?;

        let admin_ids = match src.get("ADMIN_IDS").await {
            Some(raw) => parse_admin_ids(&raw)?,
            None => HashSet::new(),
        };
        if admin_ids.is_empty() {
            warn!("ADMIN_IDS is empty, the admin console is unreachable");
        }

        let bind_addr = match (src.get("BIND_ADDR").await, src.get("PORT").await) {
            (Some(addr), _) => addr.parse().map_err(|_| ConfigError::Invalid {
                key: "BIND_ADDR",
                reason: format!("`{addr}` is not a socket address"),
            })?,
            (None, Some(port)) => {
                let port: u16 = port.parse().map_err(|_| ConfigError::Invalid {
                    key: "PORT",
                    reason: format!("`{port}` is not a port"),
                })?;
                SocketAddr::from(([0, 0, 0, 0], port))
            }
            (None, None) => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };

        let install_command = match src.get("PACKAGE_INSTALL_CMD").await {
            Some(cmd) => cmd.split_whitespace().map(str::to_string).collect(),
            None => vec!["rhai-pkg".to_string(), "install".to_string()],
        };
        if install_command.is_empty() {
            return Err(ConfigError::Invalid {
                key: "PACKAGE_INSTALL_CMD",
                reason: "empty command".into(),
            });
        }

        let mut dependency_aliases: BTreeMap<String, String> = DEFAULT_ALIASES
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if let Some(raw) = src.get("DEPENDENCY_ALIASES").await {
            dependency_aliases.extend(parse_aliases(&raw)?);
        }

        Ok(Self {
            platform_token,
            public_base_url,
            admin_ids,
            platform_route_id: or_default(src.as_ref(), "PLATFORM_ROUTE_ID", "platform").await,
            bind_addr,
            database_path: database_path(cm).await,
            bots_dir: or_default(src.as_ref(), "BOTS_DIR", "user_bots").await.into(),
            modules_dir: or_default(src.as_ref(), "MODULES_DIR", "modules").await.into(),
            install_command,
            install_timeout: Duration::from_secs(
                number(src.as_ref(), "INSTALL_TIMEOUT_SECS", 120).await?,
            ),
            dependency_aliases,
            telegram_api_url: or_default(
                src.as_ref(),
                "TELEGRAM_API_URL",
                "https://api.telegram.org",
            )
            .await,
            provider_timeout: Duration::from_secs(
                number(src.as_ref(), "PROVIDER_TIMEOUT_SECS", 10).await?,
            ),
            ai_api_key: src.get("AI_API_KEY").await.filter(|k| !k.is_empty()),
            ai_base_url: or_default(src.as_ref(), "AI_BASE_URL", "https://api.openai.com/v1").await,
            ai_model: or_default(src.as_ref(), "AI_MODEL", "gpt-4o-mini").await,
            ai_timeout: Duration::from_secs(number(src.as_ref(), "AI_TIMEOUT_SECS", 60).await?),
            session_timeout: Duration::from_secs(
                number(src.as_ref(), "SESSION_TIMEOUT_SECS", 1800).await?,
            ),
            restart_settle: Duration::from_millis(
                number(src.as_ref(), "RESTART_SETTLE_MS", 1000).await?,
            ),
            broadcast_delay: Duration::from_millis(
                number(src.as_ref(), "BROADCAST_DELAY_MS", 50).await?,
            ),
            script_max_operations: number(src.as_ref(), "SCRIPT_MAX_OPERATIONS", 1_000_000).await?,
        })
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }

    /// Callback address a provider should post updates for `route_id` to.
    pub fn webhook_url(&self, route_id: &str) -> String {
        let base = self.public_base_url.as_str().trim_end_matches('/');
        format!("{base}/bot/{route_id}")
    }
}

/// Registry location, also needed by the offline CLI commands.
pub async fn database_path(cm: &ConfigManager) -> PathBuf {
    or_default(cm.0.as_ref(), "DATABASE_PATH", "bot_platform.db").await.into()
}

async fn required(src: &dyn ConfigManagerType, key: &'static str) -> Result<String, ConfigError> {
    match src.get(key).await {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ConfigError::Missing(key)),
    }
}

async fn or_default(src: &dyn ConfigManagerType, key: &str, default: &str) -> String {
    src.get(key)
        .await
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

async fn number(
    src: &dyn ConfigManagerType,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match src.get(key).await {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            reason: format!("`{raw}` is not a non-negative integer"),
        }),
        None => Ok(default),
    }
}

fn parse_admin_ids(raw: &str) -> Result<HashSet<i64>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>().map_err(|_| ConfigError::Invalid {
                key: "ADMIN_IDS",
                reason: format!("`{s}` is not a user id"),
            })
        })
        .collect()
}

/// `name=dist,name2=dist2`
fn parse_aliases(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut out = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (k, v) = pair.split_once('=').ok_or_else(|| ConfigError::Invalid {
            key: "DEPENDENCY_ALIASES",
            reason: format!("`{pair}` is not name=distribution"),
        })?;
        out.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    fn minimal() -> Vec<(&'static str, &'static str)> {
        vec![
            ("PLATFORM_BOT_TOKEN", "1:platform"),
            ("PUBLIC_BASE_URL", "https://bots.example.com/"),
        ]
    }

    #[tokio::test]
    async fn test_map_config_manager_basic() {
        let mgr = MapConfigManager::new();

        mgr.set("foo", "bar").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("bar".to_string()));

        mgr.set("foo", "baz").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));

        let keys = mgr.keys().await;
        assert_eq!(keys, vec!["foo".to_string()]);
    }

    #[tokio::test]
    async fn test_map_config_manager_as_vec() {
        let mgr = MapConfigManager::with(&[("a", "1"), ("b", "2")]);
        let mut config = mgr.as_vec().await;
        config.sort();
        assert_eq!(
            config,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_env_config_manager_with_temp_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "BOTHOST_TEST_ONLY_KEY=abc123\n").unwrap();

        let mgr = EnvConfigManager::new(env_path);
        assert_eq!(mgr.get("BOTHOST_TEST_ONLY_KEY").await, Some("abc123".to_string()));
        assert!(mgr.set("BOTHOST_TEST_ONLY_KEY", "x").await.is_err());
    }

    #[tokio::test]
    async fn defaults_apply_when_only_required_keys_are_set() {
        let cm = ConfigManager(MapConfigManager::with(&minimal()));
        let cfg = PlatformConfig::load(&cm).await.unwrap();

        assert_eq!(cfg.platform_route_id, "platform");
        assert_eq!(cfg.bind_addr.port(), 8080);
        assert_eq!(cfg.install_timeout, Duration::from_secs(120));
        assert_eq!(cfg.provider_timeout, Duration::from_secs(10));
        assert_eq!(cfg.ai_timeout, Duration::from_secs(60));
        assert_eq!(cfg.session_timeout, Duration::from_secs(1800));
        assert_eq!(cfg.restart_settle, Duration::from_millis(1000));
        assert_eq!(cfg.broadcast_delay, Duration::from_millis(50));
        assert!(cfg.admin_ids.is_empty());
        assert_eq!(cfg.webhook_url("abc"), "https://bots.example.com/bot/abc");
    }

    #[tokio::test]
    async fn missing_token_is_reported() {
        let cm = ConfigManager(MapConfigManager::with(&[("PUBLIC_BASE_URL", "https://x")]));
        let err = PlatformConfig::load(&cm).await.unwrap_err();
        assert_eq!(err, ConfigError::Missing("PLATFORM_BOT_TOKEN"));
    }

    #[tokio::test]
    async fn admin_ids_port_and_aliases_are_parsed() {
        let mut entries = minimal();
        entries.push(("ADMIN_IDS", "42, 7"));
        entries.push(("PORT", "9000"));
        entries.push(("DEPENDENCY_ALIASES", "yaml=my-yaml, extra=extra-dist"));
        let cm = ConfigManager(MapConfigManager::with(&entries));
        let cfg = PlatformConfig::load(&cm).await.unwrap();

        assert!(cfg.is_admin(42) && cfg.is_admin(7));
        assert!(!cfg.is_admin(1));
        assert_eq!(cfg.bind_addr.port(), 9000);
        assert_eq!(cfg.dependency_aliases["yaml"], "my-yaml");
        assert_eq!(cfg.dependency_aliases["extra"], "extra-dist");
        assert_eq!(cfg.dependency_aliases["http"], "rhai-http");
    }

    #[tokio::test]
    async fn bad_number_is_invalid() {
        let mut entries = minimal();
        entries.push(("INSTALL_TIMEOUT_SECS", "soon"));
        let cm = ConfigManager(MapConfigManager::with(&entries));
        assert!(matches!(
            PlatformConfig::load(&cm).await,
            Err(ConfigError::Invalid { key: "INSTALL_TIMEOUT_SECS", .. })
        ));
    }
}
