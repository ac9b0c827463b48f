// ABOUTME: SQLite persistence for users, sessions, sandbox records and the capacity counter
// ABOUTME: Every state change is a conditional statement so concurrent callers cannot double-apply it

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Record already exists: {0}")]
    Conflict(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Provisioning,
    Active,
    Terminated,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "provisioning" => Ok(Self::Provisioning),
            "active" => Ok(Self::Active),
            "terminated" => Ok(Self::Terminated),
            "failed" => Ok(Self::Failed),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub thread_id: String,
    pub sandbox_name: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub termination_reason: Option<String>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Time since creation, frozen once the session was terminated
    pub fn duration(&self) -> chrono::Duration {
        let end = self.terminated_at.unwrap_or_else(Utc::now);
        end - self.created_at
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Pending,
    Running,
    Terminated,
    Failed,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "terminated" => Ok(Self::Terminated),
            "failed" => Ok(Self::Failed),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub namespace: String,
    pub cpu_cores: f64,
    pub memory_mb: i64,
    pub container_id: Option<String>,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityUsage {
    pub current: i64,
    pub max: i64,
}

impl CapacityUsage {
    pub fn remaining(&self) -> i64 {
        (self.max - self.current).max(0)
    }

    pub fn has_room(&self) -> bool {
        self.current < self.max
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Owner => "owner",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "owner" => Ok(Self::Owner),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn new_session_id() -> String {
    format!("ses_{}", uuid::Uuid::new_v4().to_string().replace('-', ""))
}

pub fn new_sandbox_id() -> String {
    format!("sbx_{}", uuid::Uuid::new_v4().to_string().replace('-', ""))
}

/// Fixed-width RFC3339 so textual ordering matches chronological ordering
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidTimestamp(raw.to_string()))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn map_unique(err: sqlx::Error, what: &str) -> StorageError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            StorageError::Conflict(what.to_string())
        }
        _ => StorageError::Database(err),
    }
}

#[derive(Clone)]
pub struct SandboxStorage {
    pool: SqlitePool,
}

impl SandboxStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `database_url` and run migrations.
    /// In-memory URLs get a single pinned connection so every caller sees the same database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");

        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(30))
                .connect_with(options)
                .await?
        };

        debug!("Connected to database: {}", database_url);

        MIGRATOR.run(&pool).await?;

        debug!("Database migrations completed");

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========================================================================
    // SESSION OPERATIONS
    // ========================================================================

    pub async fn insert_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, user_id, thread_id, sandbox_name, status,
                created_at, updated_at, terminated_at, termination_reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.thread_id)
        .bind(&session.sandbox_name)
        .bind(session.status.as_str())
        .bind(ts(&session.created_at))
        .bind(ts(&session.updated_at))
        .bind(session.terminated_at.as_ref().map(ts))
        .bind(&session.termination_reason)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, &session.thread_id))?;

        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, thread_id, sandbox_name, status,
                   created_at, updated_at, terminated_at, termination_reason
            FROM sessions
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_session).transpose()
    }

    /// Most recent session for a thread, whatever its status
    pub async fn latest_session_for_thread(&self, thread_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, thread_id, sandbox_name, status,
                   created_at, updated_at, terminated_at, termination_reason
            FROM sessions
            WHERE thread_id = ?1
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_session).transpose()
    }

    pub async fn list_sessions(&self, statuses: &[SessionStatus]) -> Result<Vec<Session>> {
        let mut query = String::from(
            r#"
            SELECT id, user_id, thread_id, sandbox_name, status,
                   created_at, updated_at, terminated_at, termination_reason
            FROM sessions
            "#,
        );
        if !statuses.is_empty() {
            query.push_str(&format!(" WHERE status IN ({})", placeholders(1, statuses.len())));
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query(&query);
        for status in statuses {
            q = q.bind(status.as_str());
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_session).collect()
    }

    /// Move a session to `to` only if it is currently in one of `from`.
    /// Returns whether the row changed.
    pub async fn transition_session(
        &self,
        id: &str,
        from: &[SessionStatus],
        to: SessionStatus,
        reason: Option<&str>,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }

        let query = format!(
            r#"
            UPDATE sessions
            SET status = ?1,
                updated_at = ?2,
                terminated_at = CASE WHEN ?1 IN ('terminated', 'failed') THEN ?2 ELSE terminated_at END,
                termination_reason = COALESCE(?3, termination_reason)
            WHERE id = ?4 AND status IN ({})
            "#,
            placeholders(5, from.len())
        );

        let mut q = sqlx::query(&query)
            .bind(to.as_str())
            .bind(ts(&Utc::now()))
            .bind(reason)
            .bind(id);
        for status in from {
            q = q.bind(status.as_str());
        }

        let result = q.execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    // ========================================================================
    // SANDBOX RECORD OPERATIONS
    // ========================================================================

    pub async fn insert_sandbox(&self, sandbox: &SandboxRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sandboxes (
                id, session_id, name, namespace, cpu_cores, memory_mb,
                container_id, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&sandbox.id)
        .bind(&sandbox.session_id)
        .bind(&sandbox.name)
        .bind(&sandbox.namespace)
        .bind(sandbox.cpu_cores)
        .bind(sandbox.memory_mb)
        .bind(&sandbox.container_id)
        .bind(sandbox.status.as_str())
        .bind(ts(&sandbox.created_at))
        .bind(ts(&sandbox.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, &sandbox.id))?;

        Ok(())
    }

    pub async fn sandbox_for_session(&self, session_id: &str) -> Result<Option<SandboxRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, session_id, name, namespace, cpu_cores, memory_mb,
                   container_id, status, created_at, updated_at
            FROM sandboxes
            WHERE session_id = ?1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_sandbox).transpose()
    }

    pub async fn list_sandboxes(&self, status: Option<SandboxStatus>) -> Result<Vec<SandboxRecord>> {
        let mut query = String::from(
            r#"
            SELECT id, session_id, name, namespace, cpu_cores, memory_mb,
                   container_id, status, created_at, updated_at
            FROM sandboxes
            "#,
        );
        if status.is_some() {
            query.push_str(" WHERE status = ?1");
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query(&query);
        if let Some(s) = status {
            q = q.bind(s.as_str());
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_sandbox).collect()
    }

    pub async fn update_sandbox_status(
        &self,
        id: &str,
        status: SandboxStatus,
        container_id: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET status = ?1,
                container_id = COALESCE(?2, container_id),
                updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(status.as_str())
        .bind(container_id)
        .bind(ts(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }

        Ok(())
    }

    // ========================================================================
    // CAPACITY COUNTER
    // ========================================================================

    /// Conditional increment: succeeds only while `current_count < max_count`
    pub async fn try_increment_usage(&self) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sandbox_usage
            SET current_count = current_count + 1, updated_at = ?1
            WHERE id = 1 AND current_count < max_count
            "#,
        )
        .bind(ts(&Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Decrement floored at zero
    pub async fn decrement_usage(&self) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sandbox_usage
            SET current_count = MAX(current_count - 1, 0), updated_at = ?1
            WHERE id = 1
            "#,
        )
        .bind(ts(&Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_usage(&self) -> Result<CapacityUsage> {
        let row = sqlx::query("SELECT current_count, max_count FROM sandbox_usage WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound("sandbox_usage".to_string()))?;

        Ok(CapacityUsage {
            current: row.get("current_count"),
            max: row.get("max_count"),
        })
    }

    pub async fn set_max_usage(&self, max: i64) -> Result<()> {
        sqlx::query("UPDATE sandbox_usage SET max_count = ?1, updated_at = ?2 WHERE id = 1")
            .bind(max)
            .bind(ts(&Utc::now()))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ========================================================================
    // USER OPERATIONS
    // ========================================================================

    pub async fn insert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, role, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(user.role.as_str())
        .bind(ts(&user.created_at))
        .bind(ts(&user.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, &user.id))?;

        Ok(())
    }

    /// Insert an owner only while no owner exists, in one statement
    pub async fn insert_first_owner(&self, id: &str, username: &str) -> Result<bool> {
        let now = ts(&Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO users (id, username, role, created_at, updated_at)
            SELECT ?1, ?2, 'owner', ?3, ?3
            WHERE NOT EXISTS (SELECT 1 FROM users WHERE role = 'owner')
            "#,
        )
        .bind(id)
        .bind(username)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, id))?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, username, role, created_at, updated_at FROM users WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_user).transpose()
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query(
            "SELECT id, username, role, created_at, updated_at FROM users ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_user).collect()
    }

    pub async fn update_user_role(&self, id: &str, role: Role) -> Result<()> {
        let result = sqlx::query("UPDATE users SET role = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(role.as_str())
            .bind(ts(&Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }

        Ok(())
    }

    pub async fn delete_user(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }

        Ok(())
    }
}

/// `?start, ?start+1, ...` for `count` parameters
fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_to_session(row: SqliteRow) -> Result<Session> {
    Ok(Session {
        id: row.get("id"),
        user_id: row.get("user_id"),
        thread_id: row.get("thread_id"),
        sandbox_name: row.get("sandbox_name"),
        status: SessionStatus::from_str(&row.get::<String, _>("status"))?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
        terminated_at: parse_opt_ts(row.get("terminated_at"))?,
        termination_reason: row.get("termination_reason"),
    })
}

fn row_to_sandbox(row: SqliteRow) -> Result<SandboxRecord> {
    Ok(SandboxRecord {
        id: row.get("id"),
        session_id: row.get("session_id"),
        name: row.get("name"),
        namespace: row.get("namespace"),
        cpu_cores: row.get("cpu_cores"),
        memory_mb: row.get("memory_mb"),
        container_id: row.get("container_id"),
        status: SandboxStatus::from_str(&row.get::<String, _>("status"))?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

fn row_to_user(row: SqliteRow) -> Result<User> {
    Ok(User {
        id: row.get("id"),
        username: row.get("username"),
        role: Role::from_str(&row.get::<String, _>("role"))?,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}
