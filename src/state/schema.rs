//! History Database Schema
//!
//! Append-only modification history plus hot-reload attempts.
//! Indexed columns carry what the statistics queries need; the full
//! modification record is stored as JSON alongside.

pub const SCHEMA_VERSION: i64 = 1;

pub const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS modifications (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    classification TEXT NOT NULL,
    state TEXT NOT NULL,
    change_count INTEGER NOT NULL,
    error TEXT,
    rollback_failed INTEGER NOT NULL DEFAULT 0,
    rollback_duration_ms INTEGER,
    record TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_modifications_created
    ON modifications (created_at);
CREATE INDEX IF NOT EXISTS idx_modifications_state
    ON modifications (state);

CREATE TABLE IF NOT EXISTS reload_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    module_path TEXT NOT NULL,
    success INTEGER NOT NULL,
    error TEXT
);
";
