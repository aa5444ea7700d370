use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::info;
use uuid::Uuid;

use super::{
    CreationType, LifecycleStatus, NewTenant, PlatformStats, TenantBot, TenantRegistry, User,
};
use crate::error::{PlatformError, PlatformResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY,
    handle        TEXT,
    display_name  TEXT NOT NULL,
    joined_at     TEXT NOT NULL,
    last_active   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS bots (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    short_id          TEXT NOT NULL UNIQUE,
    owner_id          INTEGER NOT NULL,
    credential_token  TEXT NOT NULL UNIQUE,
    public_handle     TEXT NOT NULL,
    code_location     TEXT NOT NULL,
    status            TEXT NOT NULL DEFAULT 'stopped',
    creation_type     TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    last_error        TEXT,
    is_blocked        INTEGER NOT NULL DEFAULT 0,
    event_count       INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_bots_owner ON bots(owner_id);
CREATE INDEX IF NOT EXISTS idx_bots_status ON bots(status);
";

const BOT_COLUMNS: &str = "id, short_id, owner_id, credential_token, public_handle, code_location, \
     status, creation_type, created_at, last_error, event_count";

/// SQLite-backed [`TenantRegistry`]. One connection behind a mutex; every
/// query runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRegistry {
    pub fn open(path: impl AsRef<Path>) -> PlatformResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        info!("registry database at {}", path.display());
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> PlatformResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> PlatformResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> PlatformResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> PlatformResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| PlatformError::Persistence("registry lock poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| PlatformError::Persistence(format!("registry task join error: {e}")))?
    }
}

fn new_short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        handle: row.get(1)?,
        display_name: row.get(2)?,
        joined_at: parse_ts(3, row.get(3)?)?,
        last_active: parse_ts(4, row.get(4)?)?,
    })
}

fn bot_from_row(row: &Row<'_>) -> rusqlite::Result<TenantBot> {
    let status: String = row.get(6)?;
    let status = LifecycleStatus::parse(&status).ok_or_else(|| {
        let reason = format!("unknown status `{status}`");
        rusqlite::Error::FromSqlConversionFailure(6, Type::Text, reason.into())
    })?;
    let creation: String = row.get(7)?;
    let creation_type = CreationType::parse(&creation).ok_or_else(|| {
        let reason = format!("unknown creation type `{creation}`");
        rusqlite::Error::FromSqlConversionFailure(7, Type::Text, reason.into())
    })?;
    let code_location: String = row.get(5)?;
    let event_count: i64 = row.get(10)?;

    Ok(TenantBot {
        id: row.get(0)?,
        short_id: row.get(1)?,
        owner_id: row.get(2)?,
        token: row.get(3)?,
        public_handle: row.get(4)?,
        code_location: PathBuf::from(code_location),
        status,
        creation_type,
        created_at: parse_ts(8, row.get(8)?)?,
        last_error: row.get(9)?,
        event_count: event_count.max(0) as u64,
    })
}

fn query_bots(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> PlatformResult<Vec<TenantBot>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, bot_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn bot_by_token(conn: &Connection, token: &str) -> PlatformResult<Option<TenantBot>> {
    let sql = format!("SELECT {BOT_COLUMNS} FROM bots WHERE credential_token = ?1");
    Ok(conn.query_row(&sql, params![token], bot_from_row).optional()?)
}

#[async_trait]
impl TenantRegistry for SqliteRegistry {
    async fn upsert_user(
        &self,
        id: i64,
        handle: Option<&str>,
        display_name: &str,
    ) -> PlatformResult<User> {
        let handle = handle.map(str::to_string);
        let display_name = display_name.to_string();
        self.call(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO users (id, handle, display_name, joined_at, last_active)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    handle = excluded.handle,
                    display_name = excluded.display_name,
                    last_active = excluded.last_active",
                params![id, handle, display_name, now],
            )?;
            Ok(conn.query_row(
                "SELECT id, handle, display_name, joined_at, last_active FROM users WHERE id = ?1",
                params![id],
                user_from_row,
            )?)
        })
        .await
    }

    async fn get_user(&self, id: i64) -> PlatformResult<Option<User>> {
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, handle, display_name, joined_at, last_active FROM users WHERE id = ?1",
                    params![id],
                    user_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn list_users(&self, limit: usize) -> PlatformResult<Vec<User>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, handle, display_name, joined_at, last_active
                 FROM users ORDER BY last_active DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], user_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn all_user_ids(&self) -> PlatformResult<Vec<i64>> {
        self.call(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM users ORDER BY id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<Result<Vec<i64>, _>>()?)
        })
        .await
    }

    async fn upsert(&self, tenant: NewTenant) -> PlatformResult<TenantBot> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO bots (short_id, owner_id, credential_token, public_handle,
                                   code_location, status, creation_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'stopped', ?6, ?7)
                 ON CONFLICT(credential_token) DO UPDATE SET
                    public_handle = excluded.public_handle,
                    code_location = excluded.code_location,
                    creation_type = excluded.creation_type",
                params![
                    new_short_id(),
                    tenant.owner_id,
                    tenant.token,
                    tenant.public_handle,
                    tenant.code_location.to_string_lossy(),
                    tenant.creation_type.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            bot_by_token(conn, &tenant.token)?
                .ok_or_else(|| PlatformError::Persistence("bot row vanished after upsert".into()))
        })
        .await
    }

    async fn get_by_token(&self, token: &str) -> PlatformResult<Option<TenantBot>> {
        let token = token.to_string();
        self.call(move |conn| bot_by_token(conn, &token)).await
    }

    async fn find_by_short_id(&self, short_id: &str) -> PlatformResult<Option<TenantBot>> {
        let short_id = short_id.trim().to_ascii_lowercase();
        self.call(move |conn| {
            let sql = format!("SELECT {BOT_COLUMNS} FROM bots WHERE short_id = ?1");
            Ok(conn.query_row(&sql, params![short_id], bot_from_row).optional()?)
        })
        .await
    }

    async fn find_by_token_prefix(&self, prefix: &str) -> PlatformResult<Option<TenantBot>> {
        if prefix.is_empty() {
            return Err(PlatformError::Validation("empty token prefix".into()));
        }
        let prefix = prefix.to_string();
        self.call(move |conn| {
            // substr comparison, not LIKE: tokens contain `_`
            let sql = format!(
                "SELECT {BOT_COLUMNS} FROM bots
                 WHERE substr(credential_token, 1, length(?1)) = ?1 LIMIT 2"
            );
            let mut found = query_bots(conn, &sql, params![prefix])?;
            match found.len() {
                0 => Ok(None),
                1 => Ok(found.pop()),
                _ => Err(PlatformError::Validation(
                    "token prefix matches more than one bot".into(),
                )),
            }
        })
        .await
    }

    async fn list_by_owner(&self, owner_id: i64) -> PlatformResult<Vec<TenantBot>> {
        self.call(move |conn| {
            let sql = format!("SELECT {BOT_COLUMNS} FROM bots WHERE owner_id = ?1 ORDER BY id");
            query_bots(conn, &sql, params![owner_id])
        })
        .await
    }

    async fn list_bots(&self, limit: usize) -> PlatformResult<Vec<TenantBot>> {
        self.call(move |conn| {
            let sql = format!("SELECT {BOT_COLUMNS} FROM bots ORDER BY id DESC LIMIT ?1");
            query_bots(conn, &sql, params![limit as i64])
        })
        .await
    }

    async fn list_by_status(&self, status: LifecycleStatus) -> PlatformResult<Vec<TenantBot>> {
        self.call(move |conn| {
            let sql = format!("SELECT {BOT_COLUMNS} FROM bots WHERE status = ?1 ORDER BY id");
            query_bots(conn, &sql, params![status.as_str()])
        })
        .await
    }

    async fn update_status(
        &self,
        token: &str,
        status: LifecycleStatus,
        error: Option<String>,
    ) -> PlatformResult<()> {
        let token = token.to_string();
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE bots SET status = ?2, last_error = ?3, is_blocked = ?4
                 WHERE credential_token = ?1",
                params![
                    token,
                    status.as_str(),
                    error,
                    (status == LifecycleStatus::Blocked) as i64
                ],
            )?;
            if changed == 0 {
                return Err(PlatformError::NotFound("bot".into()));
            }
            Ok(())
        })
        .await
    }

    async fn increment_event_count(&self, token: &str) -> PlatformResult<()> {
        let token = token.to_string();
        self.call(move |conn| {
            conn.execute(
                "UPDATE bots SET event_count = event_count + 1 WHERE credential_token = ?1",
                params![token],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, token: &str) -> PlatformResult<bool> {
        let token = token.to_string();
        self.call(move |conn| {
            let removed =
                conn.execute("DELETE FROM bots WHERE credential_token = ?1", params![token])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn aggregate_stats(&self) -> PlatformResult<PlatformStats> {
        self.call(|conn| {
            let mut stats = PlatformStats {
                users: conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get::<_, i64>(0))?
                    as u64,
                ..Default::default()
            };
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*), COALESCE(SUM(event_count), 0) FROM bots GROUP BY status",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
            })?;
            for row in rows {
                let (status, count, events) = row?;
                stats.bots += count as u64;
                stats.total_events += events as u64;
                if let Some(status) = LifecycleStatus::parse(&status) {
                    stats.count(status, count as u64);
                }
            }
            Ok(stats)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(owner: i64, token: &str) -> NewTenant {
        NewTenant {
            owner_id: owner,
            token: token.to_string(),
            code_location: PathBuf::from(format!("user_bots/{owner}.rhai")),
            creation_type: CreationType::Uploaded,
            public_handle: format!("bot_{owner}"),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_token() {
        let reg = SqliteRegistry::open_in_memory().unwrap();
        let first = reg.upsert(tenant(1, "111:aaa")).await.unwrap();
        reg.update_status("111:aaa", LifecycleStatus::Running, None).await.unwrap();

        let mut again = tenant(2, "111:aaa");
        again.code_location = PathBuf::from("user_bots/new.rhai");
        again.creation_type = CreationType::AiGenerated;
        let second = reg.upsert(again).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.short_id, second.short_id);
        assert_eq!(second.owner_id, 1);
        assert_eq!(second.status, LifecycleStatus::Running);
        assert_eq!(second.code_location, PathBuf::from("user_bots/new.rhai"));
        assert_eq!(second.creation_type, CreationType::AiGenerated);
        assert_eq!(reg.list_bots(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn new_rows_start_stopped_with_short_id() {
        let reg = SqliteRegistry::open_in_memory().unwrap();
        let bot = reg.upsert(tenant(1, "111:aaa")).await.unwrap();
        assert_eq!(bot.status, LifecycleStatus::Stopped);
        assert_eq!(bot.short_id.len(), 12);
        let found = reg.find_by_short_id(&bot.short_id).await.unwrap().unwrap();
        assert_eq!(found.token, "111:aaa");
    }

    #[tokio::test]
    async fn token_prefix_lookup_reports_collisions() {
        let reg = SqliteRegistry::open_in_memory().unwrap();
        reg.upsert(tenant(1, "123456:abc_one")).await.unwrap();
        reg.upsert(tenant(1, "123456:abc_two")).await.unwrap();

        assert!(matches!(
            reg.find_by_token_prefix("123456:abc").await,
            Err(PlatformError::Validation(_))
        ));
        let one = reg.find_by_token_prefix("123456:abc_o").await.unwrap().unwrap();
        assert_eq!(one.token, "123456:abc_one");
        assert!(reg.find_by_token_prefix("999").await.unwrap().is_none());
        assert!(matches!(
            reg.find_by_token_prefix("").await,
            Err(PlatformError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn underscore_in_prefix_is_literal() {
        let reg = SqliteRegistry::open_in_memory().unwrap();
        reg.upsert(tenant(1, "1:aXb")).await.unwrap();
        assert!(reg.find_by_token_prefix("1:a_b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_updates_and_stats() {
        let reg = SqliteRegistry::open_in_memory().unwrap();
        reg.upsert_user(1, Some("alice"), "Alice").await.unwrap();
        reg.upsert_user(2, None, "Bob").await.unwrap();
        reg.upsert(tenant(1, "1:a")).await.unwrap();
        reg.upsert(tenant(1, "1:b")).await.unwrap();
        reg.upsert(tenant(2, "2:a")).await.unwrap();

        reg.update_status("1:a", LifecycleStatus::Running, None).await.unwrap();
        reg.update_status("1:b", LifecycleStatus::Error, Some("boom".into())).await.unwrap();
        reg.update_status("2:a", LifecycleStatus::Blocked, None).await.unwrap();
        reg.increment_event_count("1:a").await.unwrap();
        reg.increment_event_count("1:a").await.unwrap();

        let stats = reg.aggregate_stats().await.unwrap();
        assert_eq!(stats.users, 2);
        assert_eq!(stats.bots, 3);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.error, 1);
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.total_events, 2);

        let errored = reg.get_by_token("1:b").await.unwrap().unwrap();
        assert_eq!(errored.last_error.as_deref(), Some("boom"));
        assert_eq!(reg.list_by_owner(1).await.unwrap().len(), 2);
        assert_eq!(reg.list_by_status(LifecycleStatus::Running).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_unknown_token_is_not_found() {
        let reg = SqliteRegistry::open_in_memory().unwrap();
        assert!(matches!(
            reg.update_status("nope", LifecycleStatus::Running, None).await,
            Err(PlatformError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let reg = SqliteRegistry::open_in_memory().unwrap();
        reg.upsert(tenant(1, "1:a")).await.unwrap();
        assert!(reg.delete("1:a").await.unwrap());
        assert!(!reg.delete("1:a").await.unwrap());
        assert!(reg.get_by_token("1:a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn users_keep_join_date_on_update() {
        let reg = SqliteRegistry::open_in_memory().unwrap();
        let first = reg.upsert_user(5, Some("old"), "Old").await.unwrap();
        let second = reg.upsert_user(5, Some("new"), "New").await.unwrap();
        assert_eq!(first.joined_at, second.joined_at);
        assert_eq!(second.handle.as_deref(), Some("new"));
        assert_eq!(reg.all_user_ids().await.unwrap(), vec![5]);
        assert_eq!(reg.list_users(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_database_persists_between_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("platform.db");
        {
            let reg = SqliteRegistry::open(&path).unwrap();
            reg.upsert(tenant(1, "1:a")).await.unwrap();
        }
        let reg = SqliteRegistry::open(&path).unwrap();
        assert!(reg.get_by_token("1:a").await.unwrap().is_some());
    }
}
