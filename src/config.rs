//! Engine Configuration
//!
//! Loads and saves the engine's configuration from `~/.metamorph/config.json`.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Config file name within the metamorph directory.
const CONFIG_FILENAME: &str = "config.json";

/// Returns the metamorph state directory: `~/.metamorph`.
pub fn get_metamorph_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".metamorph")
}

/// Returns the full path to the config file: `~/.metamorph/config.json`.
pub fn get_config_path() -> PathBuf {
    get_metamorph_dir().join(CONFIG_FILENAME)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Root of the source tree the engine is allowed to modify.
    pub workspace_root: String,
    /// Where per-modification snapshots live.
    pub backup_root: String,
    /// SQLite history database path.
    pub db_path: String,
    /// Bounded number of concurrent modification pipelines.
    pub max_concurrent: usize,
    /// Compiler/type-checker subprocess.
    pub compile_command: String,
    pub compile_args: Vec<String>,
    /// Test-runner subprocess.
    pub test_command: String,
    pub test_args: Vec<String>,
    /// Hard wall-clock timeout for compiler and test-runner invocations.
    pub subprocess_timeout_secs: u64,
    /// Keep backups after a successful rollback instead of deleting them.
    pub retain_backups: bool,
    /// Rolling-hour cap on submitted modifications.
    pub max_modifications_per_hour: u32,
    /// Per-change new-text size ceiling in bytes.
    pub max_change_bytes: usize,
    pub log_level: String,
}

/// Returns a default `EngineConfig` rooted under `~/.metamorph`.
pub fn default_config() -> EngineConfig {
    let dir = get_metamorph_dir();
    EngineConfig {
        workspace_root: ".".to_string(),
        backup_root: dir.join("backups").to_string_lossy().to_string(),
        db_path: dir.join("history.db").to_string_lossy().to_string(),
        max_concurrent: 3,
        compile_command: "cargo".to_string(),
        compile_args: vec!["check".to_string(), "--quiet".to_string()],
        test_command: "cargo".to_string(),
        test_args: vec!["test".to_string(), "--quiet".to_string()],
        subprocess_timeout_secs: 300,
        retain_backups: false,
        max_modifications_per_hour: 20,
        max_change_bytes: 100_000,
        log_level: "info".to_string(),
    }
}

/// Load the engine config from disk.
///
/// Missing or empty fields are merged with defaults. Returns `None` if the
/// config file does not exist or cannot be parsed.
pub fn load_config() -> Option<EngineConfig> {
    let config_path = get_config_path();
    if !config_path.exists() {
        return None;
    }

    let contents = fs::read_to_string(&config_path).ok()?;
    let mut config: EngineConfig = serde_json::from_str(&contents).ok()?;

    let defaults = default_config();

    if config.workspace_root.is_empty() {
        config.workspace_root = defaults.workspace_root;
    }
    if config.backup_root.is_empty() {
        config.backup_root = defaults.backup_root;
    }
    if config.db_path.is_empty() {
        config.db_path = defaults.db_path;
    }
    if config.max_concurrent == 0 {
        config.max_concurrent = defaults.max_concurrent;
    }
    if config.compile_command.is_empty() {
        config.compile_command = defaults.compile_command;
        config.compile_args = defaults.compile_args;
    }
    if config.test_command.is_empty() {
        config.test_command = defaults.test_command;
        config.test_args = defaults.test_args;
    }
    if config.subprocess_timeout_secs == 0 {
        config.subprocess_timeout_secs = defaults.subprocess_timeout_secs;
    }
    if config.max_modifications_per_hour == 0 {
        config.max_modifications_per_hour = defaults.max_modifications_per_hour;
    }
    if config.max_change_bytes == 0 {
        config.max_change_bytes = defaults.max_change_bytes;
    }
    if config.log_level.is_empty() {
        config.log_level = defaults.log_level;
    }

    Some(config)
}

/// Persist the config to `~/.metamorph/config.json`.
pub fn save_config(config: &EngineConfig) -> Result<()> {
    let config_path = get_config_path();
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config dir: {}", parent.display()))?;
    }

    let contents = serde_json::to_string_pretty(config)?;
    fs::write(&config_path, contents)
        .with_context(|| format!("failed to write config: {}", config_path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_sane() {
        let config = default_config();
        assert_eq!(config.max_concurrent, 3);
        assert!(config.backup_root.contains(".metamorph"));
        assert_eq!(config.compile_command, "cargo");
    }

    #[test]
    fn test_merge_fills_empty_fields() {
        let raw = r#"{
            "workspaceRoot": "/tmp/ws",
            "backupRoot": "",
            "dbPath": "",
            "maxConcurrent": 0,
            "compileCommand": "",
            "compileArgs": [],
            "testCommand": "",
            "testArgs": [],
            "subprocessTimeoutSecs": 0,
            "retainBackups": false,
            "maxModificationsPerHour": 0,
            "maxChangeBytes": 0,
            "logLevel": ""
        }"#;
        let mut config: EngineConfig = serde_json::from_str(raw).unwrap();
        let defaults = default_config();
        // Same merge the loader performs.
        if config.max_concurrent == 0 {
            config.max_concurrent = defaults.max_concurrent;
        }
        assert_eq!(config.workspace_root, "/tmp/ws");
        assert_eq!(config.max_concurrent, 3);
    }
}
