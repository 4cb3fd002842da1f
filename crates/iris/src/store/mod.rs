// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable session table.
//!
//! Single SQLite table keyed by `(from_team, to_team)`. All mutations
//! funnel through the engine's serialised write path; the journal is
//! write-ahead so readers never block on writers.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::error::IrisError;
use crate::protocol::epoch_ms;

const MIGRATE: &str = r#"
CREATE TABLE IF NOT EXISTS team_sessions (
    id              INTEGER PRIMARY KEY,
    from_team       TEXT    NOT NULL,
    to_team         TEXT    NOT NULL,
    session_id      TEXT    NOT NULL UNIQUE,
    created_at      INTEGER NOT NULL,
    last_used_at    INTEGER NOT NULL,
    message_count   INTEGER NOT NULL DEFAULT 0,
    status          TEXT    NOT NULL DEFAULT 'active',
    process_state   TEXT    NOT NULL DEFAULT 'stopped',
    current_cache_session_id TEXT,
    last_response_at INTEGER,
    launch_command  TEXT,
    team_config_snapshot TEXT,
    UNIQUE(from_team, to_team)
);

CREATE INDEX IF NOT EXISTS idx_team_sessions_pair ON team_sessions(from_team, to_team);
CREATE INDEX IF NOT EXISTS idx_team_sessions_sid ON team_sessions(session_id);
CREATE INDEX IF NOT EXISTS idx_team_sessions_status ON team_sessions(status);
"#;

/// Archival status of a session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// Persisted intent about the session's agent process. The pool is
/// authoritative about whether a process actually exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Spawning,
    Idle,
    Processing,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Spawning => "spawning",
            Self::Idle => "idle",
            Self::Processing => "processing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(Self::Stopped),
            "spawning" => Some(Self::Spawning),
            "idle" => Some(Self::Idle),
            "processing" => Some(Self::Processing),
            _ => None,
        }
    }
}

/// One persisted session row.
#[derive(Debug, Clone, Serialize)]
pub struct TeamSession {
    pub id: i64,
    pub from_team: String,
    pub to_team: String,
    pub session_id: String,
    pub created_at: i64,
    pub last_used_at: i64,
    pub message_count: i64,
    pub status: SessionStatus,
    pub process_state: ProcessState,
    pub current_cache_session_id: Option<String>,
    pub last_response_at: Option<i64>,
    pub launch_command: Option<String>,
    pub team_config_snapshot: Option<String>,
}

impl TeamSession {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status_str: String = row.try_get("status")?;
        let status = SessionStatus::parse(&status_str).ok_or_else(|| {
            sqlx::Error::ColumnDecode {
                index: "status".into(),
                source: format!("unknown session status {status_str:?}").into(),
            }
        })?;
        let state_str: String = row.try_get("process_state")?;
        let process_state = ProcessState::parse(&state_str).ok_or_else(|| {
            sqlx::Error::ColumnDecode {
                index: "process_state".into(),
                source: format!("unknown process state {state_str:?}").into(),
            }
        })?;
        Ok(Self {
            id: row.try_get("id")?,
            from_team: row.try_get("from_team")?,
            to_team: row.try_get("to_team")?,
            session_id: row.try_get("session_id")?,
            created_at: row.try_get("created_at")?,
            last_used_at: row.try_get("last_used_at")?,
            message_count: row.try_get("message_count")?,
            status,
            process_state,
            current_cache_session_id: row.try_get("current_cache_session_id")?,
            last_response_at: row.try_get("last_response_at")?,
            launch_command: row.try_get("launch_command")?,
            team_config_snapshot: row.try_get("team_config_snapshot")?,
        })
    }
}

/// Filter for [`SessionStore::list`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub process_state: Option<ProcessState>,
}

/// Handle to the session table.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Open (creating if missing) the store at `path` in WAL mode.
    pub async fn open(path: &Path) -> Result<Self, IrisError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;
        sqlx::raw_sql(MIGRATE).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// INSERT a fresh row for the pair. Unique violations (pair or
    /// session id) are errors.
    pub async fn create(
        &self,
        from_team: &str,
        to_team: &str,
        session_id: &str,
        launch_command: Option<&str>,
        team_config_snapshot: Option<&str>,
    ) -> Result<TeamSession, IrisError> {
        let now = epoch_ms() as i64;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO team_sessions \
             (from_team, to_team, session_id, created_at, last_used_at, \
              launch_command, team_config_snapshot) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(from_team)
        .bind(to_team)
        .bind(session_id)
        .bind(now)
        .bind(now)
        .bind(launch_command)
        .bind(team_config_snapshot)
        .execute(&mut *tx)
        .await?;
        let row = sqlx::query("SELECT * FROM team_sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(TeamSession::from_row(&row)?)
    }

    pub async fn get_by_pair(
        &self,
        from_team: &str,
        to_team: &str,
    ) -> Result<Option<TeamSession>, IrisError> {
        let row = sqlx::query(
            "SELECT * FROM team_sessions WHERE from_team = ? AND to_team = ?",
        )
        .bind(from_team)
        .bind(to_team)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(TeamSession::from_row).transpose().map_err(Into::into)
    }

    pub async fn get_by_session_id(
        &self,
        session_id: &str,
    ) -> Result<Option<TeamSession>, IrisError> {
        let row = sqlx::query("SELECT * FROM team_sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(TeamSession::from_row).transpose().map_err(Into::into)
    }

    pub async fn list(&self, filter: SessionFilter) -> Result<Vec<TeamSession>, IrisError> {
        let rows = sqlx::query(
            "SELECT * FROM team_sessions \
             WHERE (? IS NULL OR status = ?) AND (? IS NULL OR process_state = ?) \
             ORDER BY id",
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.process_state.map(|s| s.as_str()))
        .bind(filter.process_state.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| TeamSession::from_row(r).map_err(Into::into)).collect()
    }

    pub async fn update_last_used(&self, session_id: &str) -> Result<(), IrisError> {
        sqlx::query("UPDATE team_sessions SET last_used_at = ? WHERE session_id = ?")
            .bind(epoch_ms() as i64)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn increment_message_count(
        &self,
        session_id: &str,
        delta: i64,
    ) -> Result<(), IrisError> {
        sqlx::query(
            "UPDATE team_sessions SET message_count = message_count + ? WHERE session_id = ?",
        )
        .bind(delta)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), IrisError> {
        sqlx::query("UPDATE team_sessions SET status = ? WHERE session_id = ?")
            .bind(status.as_str())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_process_state(
        &self,
        session_id: &str,
        state: ProcessState,
    ) -> Result<(), IrisError> {
        sqlx::query("UPDATE team_sessions SET process_state = ? WHERE session_id = ?")
            .bind(state.as_str())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_current_cache_session_id(
        &self,
        session_id: &str,
        cache_session_id: Option<&str>,
    ) -> Result<(), IrisError> {
        sqlx::query(
            "UPDATE team_sessions SET current_cache_session_id = ? WHERE session_id = ?",
        )
        .bind(cache_session_id)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_last_response(
        &self,
        session_id: &str,
        at_epoch_ms: i64,
    ) -> Result<(), IrisError> {
        sqlx::query("UPDATE team_sessions SET last_response_at = ? WHERE session_id = ?")
            .bind(at_epoch_ms)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the exact command line and config snapshot used at spawn.
    pub async fn update_debug_info(
        &self,
        session_id: &str,
        launch_command: &str,
        team_config_snapshot: &str,
    ) -> Result<(), IrisError> {
        sqlx::query(
            "UPDATE team_sessions SET launch_command = ?, team_config_snapshot = ? \
             WHERE session_id = ?",
        )
        .bind(launch_command)
        .bind(team_config_snapshot)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Force every non-stopped row back to `stopped` and clear runtime
    /// cache ids. Invoked exactly once at boot, before the pool accepts
    /// work.
    pub async fn reset_all_process_states(&self) -> Result<u64, IrisError> {
        let result = sqlx::query(
            "UPDATE team_sessions \
             SET process_state = 'stopped', current_cache_session_id = NULL \
             WHERE process_state != 'stopped' OR current_cache_session_id IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Begin an atomic batch over the store. Dropping the transaction
    /// without committing rolls it back.
    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>, IrisError> {
        Ok(self.pool.begin().await?)
    }

    /// Remove the row. The next get-or-create for the pair mints a fresh
    /// session id.
    pub async fn delete(&self, session_id: &str) -> Result<bool, IrisError> {
        let result = sqlx::query("DELETE FROM team_sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
