//! Modification History Database
//!
//! SQLite-backed append-only history of every modification the engine
//! has processed, plus hot-reload attempts. Uses rusqlite for
//! synchronous, single-process access.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::{Modification, ModificationStatistics, ReloadAttempt};

use super::schema::{CREATE_TABLES, SCHEMA_VERSION};

/// The engine's SQLite database handle.
///
/// Terminal modifications move here from the active set; rows are never
/// updated except by the caller-requested rollback path.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database at `db_path` and apply the schema.
    pub fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create db directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database: {db_path}"))?;

        // WAL mode for better concurrent read performance
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(CREATE_TABLES)
            .context("failed to create tables")?;

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
            params![SCHEMA_VERSION],
        )
        .context("failed to update schema version")?;

        Ok(Self { conn })
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(CREATE_TABLES)
            .context("failed to create tables")?;
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
            params![SCHEMA_VERSION],
        )?;
        Ok(Self { conn })
    }

    // ─── Modifications ───────────────────────────────────────────

    /// Append a terminal modification to the history.
    pub fn insert_modification(&self, modification: &Modification) -> Result<()> {
        let record = serde_json::to_string(modification)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO modifications
             (id, created_at, completed_at, classification, state, change_count,
              error, rollback_failed, rollback_duration_ms, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                modification.id,
                modification.created_at,
                modification.completed_at,
                modification.classification.as_str(),
                modification.state.as_str(),
                modification.changes.len() as i64,
                modification.error,
                modification.rollback_failed as i32,
                modification.rollback_duration_ms.map(|d| d as i64),
                record,
            ],
        )?;
        Ok(())
    }

    pub fn get_modification(&self, id: &str) -> Result<Option<Modification>> {
        let record: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM modifications WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match record {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("failed to decode modification record")?,
            )),
            None => Ok(None),
        }
    }

    /// Most recent `limit` modifications, newest first.
    pub fn get_history(&self, limit: i64) -> Result<Vec<Modification>> {
        let mut stmt = self.conn.prepare(
            "SELECT record FROM modifications ORDER BY created_at DESC LIMIT ?1",
        )?;
        let records: Vec<String> = stmt
            .query_map(params![limit], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut mods = Vec::with_capacity(records.len());
        for json in records {
            mods.push(serde_json::from_str(&json).context("failed to decode history record")?);
        }
        Ok(mods)
    }

    /// Count modifications created since the RFC3339 timestamp `since`.
    /// Feeds the rolling-hour rate limiter.
    pub fn count_since(&self, since: &str) -> Result<u32> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM modifications WHERE created_at > ?1",
            params![since],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    // ─── Statistics ──────────────────────────────────────────────

    pub fn get_statistics(&self) -> Result<ModificationStatistics> {
        let total: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM modifications", [], |row| row.get(0))?;
        let committed: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM modifications WHERE state = 'committed'",
            [],
            |row| row.get(0),
        )?;
        let failed: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM modifications WHERE state = 'failed'",
            [],
            |row| row.get(0),
        )?;
        let avg_changes: f64 = self.conn.query_row(
            "SELECT COALESCE(AVG(change_count), 0.0) FROM modifications",
            [],
            |row| row.get(0),
        )?;
        let avg_rollback: Option<f64> = self
            .conn
            .query_row(
                "SELECT AVG(rollback_duration_ms) FROM modifications
                 WHERE rollback_duration_ms IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        let mut stmt = self.conn.prepare(
            "SELECT classification, COUNT(*) AS n FROM modifications
             GROUP BY classification ORDER BY n DESC",
        )?;
        let most_common_types: Vec<(String, u64)> = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(ModificationStatistics {
            total: total as u64,
            committed: committed as u64,
            failed: failed as u64,
            active: 0,
            avg_changes_per_modification: avg_changes,
            most_common_types,
            avg_rollback_duration_ms: avg_rollback,
        })
    }

    // ─── Reload attempts ─────────────────────────────────────────

    pub fn insert_reload_attempt(&self, attempt: &ReloadAttempt) -> Result<()> {
        self.conn.execute(
            "INSERT INTO reload_attempts (timestamp, module_path, success, error)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                attempt.timestamp,
                attempt.module_path,
                attempt.success as i32,
                attempt.error,
            ],
        )?;
        Ok(())
    }

    pub fn get_recent_reload_attempts(&self, limit: i64) -> Result<Vec<ReloadAttempt>> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, module_path, success, error
             FROM reload_attempts ORDER BY id DESC LIMIT ?1",
        )?;
        let attempts = stmt
            .query_map(params![limit], |row| {
                Ok(ReloadAttempt {
                    timestamp: row.get(0)?,
                    module_path: row.get(1)?,
                    success: row.get::<_, i32>(2)? != 0,
                    error: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(attempts)
    }

    // ─── Close ───────────────────────────────────────────────────

    /// Explicitly close the database connection. Also handled on drop;
    /// calling this surfaces any close error.
    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| anyhow::anyhow!("failed to close database: {e}"))?;
        Ok(())
    }
}
