//! Hot Reload
//!
//! Best-effort reload of committed modules: registered handlers are
//! keyed by path suffix, and every attempt lands in a bounded history.
//! A reload failure never fails the modification that triggered it; the
//! committed state stands and the attempt is recorded.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::types::ReloadAttempt;

const HISTORY_CAPACITY: usize = 100;

pub type ReloadHandler = Box<dyn Fn(&Path, &str) -> Result<()> + Send + Sync>;

pub struct HotReloader {
    /// (path suffix, handler), first match wins.
    handlers: Vec<(String, ReloadHandler)>,
    history: VecDeque<ReloadAttempt>,
}

impl Default for HotReloader {
    fn default() -> Self {
        Self::new()
    }
}

impl HotReloader {
    /// A reloader with the stock handler for Rust sources: the module is
    /// re-read and must still parse.
    pub fn new() -> Self {
        let mut reloader = Self {
            handlers: Vec::new(),
            history: VecDeque::new(),
        };
        reloader.register(".rs", |path, text| {
            syn::parse_file(text)
                .map(|_| ())
                .with_context(|| format!("{} no longer parses", path.display()))
        });
        reloader
    }

    pub fn register<F>(&mut self, suffix: &str, handler: F)
    where
        F: Fn(&Path, &str) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.push((suffix.to_string(), Box::new(handler)));
    }

    /// Reload one module. The attempt is recorded whether or not it
    /// succeeds; a path with no registered handler is a successful no-op
    /// that is not recorded.
    pub fn reload(&mut self, path: &Path) -> Option<ReloadAttempt> {
        let path_str = path.to_string_lossy();
        let handler = self
            .handlers
            .iter()
            .find(|(suffix, _)| path_str.ends_with(suffix.as_str()))?;

        let result = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))
            .and_then(|text| (handler.1)(path, &text));

        let attempt = ReloadAttempt {
            timestamp: Utc::now().to_rfc3339(),
            module_path: path_str.to_string(),
            success: result.is_ok(),
            error: result.err().map(|e| format!("{e:#}")),
        };
        match attempt.success {
            true => debug!("reloaded {}", attempt.module_path),
            false => warn!(
                "reload of {} failed: {}",
                attempt.module_path,
                attempt.error.as_deref().unwrap_or("unknown")
            ),
        }

        self.history.push_back(attempt.clone());
        while self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }
        Some(attempt)
    }

    /// Most recent `limit` attempts, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ReloadAttempt> {
        self.history.iter().rev().take(limit).cloned().collect()
    }
}
