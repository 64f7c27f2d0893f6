//! Mutation Engine
//!
//! The façade over the whole pipeline: submission guards, the bounded
//! concurrency gate, transformation-to-change-list plumbing, history
//! persistence, backup retention, manual rollback, and post-commit hot
//! reload.

pub mod apply;
pub mod events;
pub mod pipeline;
pub mod rollback;
pub mod toolchain;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, Semaphore};
use tracing::{info, warn};

use crate::backup::BackupStore;
use crate::config::EngineConfig;
use crate::error::MutationError;
use crate::reload::HotReloader;
use crate::state::Database;
use crate::tree::{transform, RejectedDirective, TransformSummary, TreeArena};
use crate::types::{
    ApplyOptions, ApplyOutcome, Change, LifecycleEvent, LifecycleEventKind, Modification,
    ModificationState, ModificationStatistics, TransformDirective,
};
use crate::validate::{is_protected_file, BLOCKED_DIRECTORY_PATTERNS};

pub use events::LifecycleBus;
pub use toolchain::{
    CompileOutcome, Compiler, SubprocessCompiler, SubprocessTestRunner, TestRunner,
};

/// Result of a transform-and-apply submission: what got applied, plus
/// the directives the transformer declined.
pub struct TransformApplication {
    pub outcome: ApplyOutcome,
    pub rejected: Vec<RejectedDirective>,
    pub summary: TransformSummary,
}

pub struct MutationEngine {
    config: EngineConfig,
    db: Mutex<Database>,
    backups: BackupStore,
    compiler: Box<dyn Compiler>,
    tests: Box<dyn TestRunner>,
    bus: LifecycleBus,
    gate: Semaphore,
    active: RwLock<HashMap<String, Modification>>,
    reloader: Mutex<HotReloader>,
}

impl MutationEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let db = Database::open(&config.db_path)?;
        let compiler = Box::new(SubprocessCompiler::from_config(&config));
        let tests = Box::new(SubprocessTestRunner::from_config(&config));
        Ok(Self::with_toolchain(config, db, compiler, tests))
    }

    /// Assemble an engine around explicit collaborators. This is the
    /// seam the compiler and test-runner are substituted through.
    pub fn with_toolchain(
        config: EngineConfig,
        db: Database,
        compiler: Box<dyn Compiler>,
        tests: Box<dyn TestRunner>,
    ) -> Self {
        let backups = BackupStore::new(config.backup_root.clone());
        let gate = Semaphore::new(config.max_concurrent.max(1));
        Self {
            config,
            db: Mutex::new(db),
            backups,
            compiler,
            tests,
            bus: LifecycleBus::new(),
            gate,
            active: RwLock::new(HashMap::new()),
            reloader: Mutex::new(HotReloader::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.bus.subscribe()
    }

    // ─── Submission ──────────────────────────────────────────────

    /// Submit a change batch and drive it to a terminal state.
    pub async fn apply_modification(
        &self,
        changes: Vec<Change>,
        options: ApplyOptions,
    ) -> Result<ApplyOutcome> {
        self.check_submission(&changes, &options)?;

        let mut modification =
            pipeline::create_modification(changes, options.metadata.clone().unwrap_or_default());
        let id = modification.id.clone();
        self.active_write()?.insert(id.clone(), modification.clone());

        let _permit = self
            .gate
            .acquire()
            .await
            .context("engine concurrency gate closed")?;

        // Mirror every state transition into the active map so readers
        // see in-flight progress, not the submission-time snapshot.
        let progress = |m: &Modification| {
            if let Ok(mut active) = self.active.write() {
                if let Some(entry) = active.get_mut(&m.id) {
                    *entry = m.clone();
                }
            }
        };
        let ctx = pipeline::PipelineContext {
            workspace: PathBuf::from(&self.config.workspace_root),
            backups: &self.backups,
            compiler: self.compiler.as_ref(),
            tests: self.tests.as_ref(),
            bus: &self.bus,
            dry_run: options.dry_run,
            skip_validation: options.skip_validation,
            skip_backup: options.skip_backup,
            progress: Some(&progress),
        };
        pipeline::run(&ctx, &mut modification).await;
        drop(_permit);

        self.db()?.insert_modification(&modification)?;
        self.active_write()?.remove(&id);
        self.apply_retention(&modification);

        if modification.state == ModificationState::Committed {
            self.hot_reload(&modification);
        }

        Ok(ApplyOutcome {
            modification_id: id,
            state: modification.state,
            error: modification.error,
        })
    }

    /// Run the tree transformer over the targeted sources and submit the
    /// resulting change-list as one modification.
    pub async fn transform_and_apply(
        &self,
        directives: &[TransformDirective],
        fail_fast: bool,
        options: ApplyOptions,
    ) -> Result<TransformApplication> {
        let mut arena = self.load_arena(directives)?;
        let outcome = transform(&mut arena, directives, fail_fast)
            .map_err(anyhow::Error::new)?;

        if outcome.changes.is_empty() {
            let reasons: Vec<String> = outcome
                .rejected
                .iter()
                .map(|r| format!("{} {}: {}", r.kind, r.target, r.reason))
                .collect();
            bail!("no applicable changes; rejected: {}", reasons.join("; "));
        }

        let applied = self.apply_modification(outcome.changes, options).await?;
        Ok(TransformApplication {
            outcome: applied,
            rejected: outcome.rejected,
            summary: outcome.summary,
        })
    }

    /// Pre-flight guards, checked before a modification record exists.
    fn check_submission(&self, changes: &[Change], options: &ApplyOptions) -> Result<()> {
        if changes.is_empty() {
            bail!("empty change batch");
        }
        for change in changes {
            if let Some(new_code) = &change.new_code {
                if new_code.len() > self.config.max_change_bytes {
                    return Err(anyhow::Error::new(MutationError::ValidationFailed(
                        format!(
                            "{}: change size {} exceeds maximum {} bytes",
                            change.file_path,
                            new_code.len(),
                            self.config.max_change_bytes
                        ),
                    )));
                }
            }
            if is_protected_file(&change.file_path) {
                return Err(anyhow::Error::new(MutationError::ValidationFailed(
                    format!("cannot modify protected file: {}", change.file_path),
                )));
            }
            if let Some(pattern) = BLOCKED_DIRECTORY_PATTERNS
                .iter()
                .find(|p| change.file_path.contains(*p))
            {
                return Err(anyhow::Error::new(MutationError::ValidationFailed(
                    format!(
                        "{}: path falls inside blocked directory pattern `{pattern}`",
                        change.file_path
                    ),
                )));
            }
        }

        if !options.force {
            let one_hour_ago = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
            let count = self.db()?.count_since(&one_hour_ago)?;
            if count >= self.config.max_modifications_per_hour {
                return Err(anyhow::Error::new(MutationError::ValidationFailed(
                    format!(
                        "rate limited: {count} modifications in the last hour (max {})",
                        self.config.max_modifications_per_hour
                    ),
                )));
            }
        }
        Ok(())
    }

    // ─── Rollback on request ─────────────────────────────────────

    /// Roll a committed modification back from its retained snapshot.
    pub async fn rollback_modification(&self, id: &str) -> Result<ApplyOutcome> {
        let mut modification = self
            .db()?
            .get_modification(id)?
            .ok_or_else(|| MutationError::ModificationNotFound(id.to_string()))?;

        if modification.state != ModificationState::Committed {
            bail!(
                "modification {id} is {}, only committed modifications can be rolled back",
                modification.state.as_str()
            );
        }
        if !self.backups.exists(id) {
            return Err(anyhow::Error::new(MutationError::RollbackFailure(
                format!("no snapshot retained for {id}"),
            )));
        }

        self.bus
            .emit(id, LifecycleEventKind::RollbackStarted, None);
        match rollback::execute_rollback(&self.backups, id, &modification.rollback_plan) {
            Ok(duration_ms) => {
                modification.state = ModificationState::Failed;
                modification.error = Some("rolled back by operator request".to_string());
                modification.rollback_duration_ms = Some(duration_ms);
                modification.completed_at = Some(Utc::now().to_rfc3339());
                self.db()?.insert_modification(&modification)?;
                self.apply_retention(&modification);
                self.bus.emit(
                    id,
                    LifecycleEventKind::RollbackCompleted,
                    Some(format!("{duration_ms}ms")),
                );
                info!("modification {id} rolled back on request");
                Ok(ApplyOutcome {
                    modification_id: id.to_string(),
                    state: modification.state,
                    error: modification.error,
                })
            }
            Err(e) => {
                modification.rollback_failed = true;
                self.db()?.insert_modification(&modification)?;
                Err(anyhow::Error::new(e))
            }
        }
    }

    // ─── Queries ─────────────────────────────────────────────────

    pub fn get_modification(&self, id: &str) -> Result<Option<Modification>> {
        if let Some(active) = self.active_read()?.get(id) {
            return Ok(Some(active.clone()));
        }
        self.db()?.get_modification(id)
    }

    /// Modifications currently in flight, at their latest state.
    pub fn get_active_modifications(&self) -> Result<Vec<Modification>> {
        Ok(self.active_read()?.values().cloned().collect())
    }

    pub fn get_history(&self, limit: i64) -> Result<Vec<Modification>> {
        self.db()?.get_history(limit)
    }

    pub fn get_statistics(&self) -> Result<ModificationStatistics> {
        let mut stats = self.db()?.get_statistics()?;
        stats.active = self.active_read()?.len() as u64;
        Ok(stats)
    }

    /// Generate a human-readable audit report summarising recent activity.
    pub fn generate_audit_report(&self) -> Result<String> {
        let history = self.get_history(50)?;
        if history.is_empty() {
            return Ok("No modifications recorded.".to_string());
        }

        let mut report = String::from("=== Modification Audit Report ===\n\n");
        report.push_str(&format!("Total entries shown: {}\n\n", history.len()));

        let mut type_counts: HashMap<&str, u32> = HashMap::new();
        for m in &history {
            *type_counts.entry(m.classification.as_str()).or_insert(0) += 1;
        }
        report.push_str("Breakdown by classification:\n");
        for (classification, count) in &type_counts {
            report.push_str(&format!("  {classification}: {count}\n"));
        }
        report.push('\n');

        report.push_str("Recent entries:\n");
        for m in &history {
            report.push_str(&format!(
                "  [{}] {} - {} ({} change(s))\n",
                m.created_at,
                m.classification.as_str(),
                m.state.as_str(),
                m.changes.len()
            ));
            for file in &m.targets.files {
                report.push_str(&format!("    file: {file}\n"));
            }
            if let Some(error) = &m.error {
                report.push_str(&format!("    error: {error}\n"));
            }
        }
        Ok(report)
    }

    // ─── Internals ───────────────────────────────────────────────

    /// Drop the snapshot once nothing can need it: committed, rolled
    /// back cleanly, or failed before any write. A failed rollback
    /// always keeps the snapshot for manual recovery.
    fn apply_retention(&self, modification: &Modification) {
        if self.config.retain_backups || modification.rollback_failed {
            return;
        }
        let keep = modification.state == ModificationState::Committed;
        if !keep && self.backups.exists(&modification.id) {
            if let Err(e) = self.backups.remove(&modification.id) {
                warn!("failed to remove backup for {}: {e:#}", modification.id);
            }
        }
    }

    fn hot_reload(&self, modification: &Modification) {
        let Ok(mut reloader) = self.reloader.lock() else {
            warn!("hot reloader lock poisoned, skipping reload");
            return;
        };
        for file in &modification.targets.files {
            let path = self.resolve(file);
            let Some(attempt) = reloader.reload(&path) else {
                continue;
            };
            if attempt.success {
                self.bus.emit(
                    &modification.id,
                    LifecycleEventKind::HotReloaded,
                    Some(attempt.module_path.clone()),
                );
            }
            match self.db() {
                Ok(db) => {
                    if let Err(e) = db.insert_reload_attempt(&attempt) {
                        warn!("failed to record reload attempt: {e:#}");
                    }
                }
                Err(e) => warn!("failed to record reload attempt: {e:#}"),
            }
        }
    }

    /// Load every source a directive batch can touch into a fresh arena.
    fn load_arena(&self, directives: &[TransformDirective]) -> Result<TreeArena> {
        let workspace = PathBuf::from(&self.config.workspace_root);
        let mut arena = TreeArena::new();
        let mut need_full_scan = false;

        for directive in directives {
            match directive.target().split_once(':') {
                Some((file, _)) => {
                    arena.load(&self.resolve_in(&workspace, file))?;
                }
                None => need_full_scan = true,
            }
        }
        if need_full_scan {
            for path in collect_rs_files(&workspace)? {
                arena.load(&path)?;
            }
        }
        Ok(arena)
    }

    fn resolve(&self, file_path: &str) -> PathBuf {
        self.resolve_in(Path::new(&self.config.workspace_root), file_path)
    }

    fn resolve_in(&self, workspace: &Path, file_path: &str) -> PathBuf {
        let p = Path::new(file_path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            workspace.join(p)
        }
    }

    fn db(&self) -> Result<std::sync::MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| anyhow::anyhow!("history database lock poisoned"))
    }

    fn active_read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Modification>>> {
        self.active
            .read()
            .map_err(|_| anyhow::anyhow!("active set lock poisoned"))
    }

    fn active_write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Modification>>> {
        self.active
            .write()
            .map_err(|_| anyhow::anyhow!("active set lock poisoned"))
    }
}

/// Recursively collect `.rs` files under `root`, skipping version
/// control and build output directories.
fn collect_rs_files(root: &Path) -> Result<Vec<PathBuf>> {
    const SKIP: &[&str] = &[".git", "target", "node_modules", ".metamorph", "backups"];
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() {
                if !SKIP.contains(&name.as_str()) {
                    stack.push(path);
                }
            } else if name.ends_with(".rs") {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeType, ReportStatus, RiskTier, TestingReport};
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct OkCompiler;

    #[async_trait]
    impl Compiler for OkCompiler {
        async fn check(&self, _workspace: &Path) -> Result<CompileOutcome> {
            Ok(CompileOutcome {
                success: true,
                output: String::new(),
            })
        }
    }

    struct OkRunner;

    #[async_trait]
    impl TestRunner for OkRunner {
        async fn run(&self, _workspace: &Path, _filters: &[String]) -> Result<TestingReport> {
            Ok(TestingReport::empty_pass())
        }
    }

    /// Records the peak number of concurrently running pipelines.
    struct GaugeRunner {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TestRunner for GaugeRunner {
        async fn run(&self, _workspace: &Path, _filters: &[String]) -> Result<TestingReport> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(TestingReport::empty_pass())
        }
    }

    fn change(file: &str, line: usize, original: &str, new: &str) -> Change {
        Change {
            id: uuid::Uuid::new_v4().to_string(),
            change_type: ChangeType::Modify,
            file_path: file.into(),
            line,
            column: 1,
            enclosing_function: None,
            enclosing_type: None,
            original_code: Some(original.into()),
            new_code: Some(new.into()),
            description: String::new(),
            rationale: String::new(),
            risk: RiskTier::Low,
        }
    }

    fn engine_in(
        tmp: &tempfile::TempDir,
        tests: Box<dyn TestRunner>,
        max_concurrent: usize,
    ) -> MutationEngine {
        let mut config = crate::config::default_config();
        config.workspace_root = tmp.path().to_string_lossy().to_string();
        config.backup_root = tmp.path().join("backups").to_string_lossy().to_string();
        config.max_concurrent = max_concurrent;
        MutationEngine::with_toolchain(
            config,
            Database::open_in_memory().unwrap(),
            Box::new(OkCompiler),
            tests,
        )
    }

    #[tokio::test]
    async fn test_submit_and_commit() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("lib.rs"), "fn f() -> i32 {\n    10\n}\n").unwrap();
        let engine = engine_in(&tmp, Box::new(OkRunner), 2);

        let outcome = engine
            .apply_modification(
                vec![change("lib.rs", 2, "10", "11")],
                ApplyOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.state, ModificationState::Committed);

        let stored = engine
            .get_modification(&outcome.modification_id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, ModificationState::Committed);
        assert!(engine.get_statistics().unwrap().committed == 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_capped() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..5 {
            fs::write(
                tmp.path().join(format!("f{i}.rs")),
                "fn f() -> i32 {\n    10\n}\n",
            )
            .unwrap();
        }
        let gauge = Arc::new(GaugeRunner {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        struct Shared(Arc<GaugeRunner>);
        #[async_trait]
        impl TestRunner for Shared {
            async fn run(&self, w: &Path, f: &[String]) -> Result<TestingReport> {
                self.0.run(w, f).await
            }
        }

        let engine = Arc::new(engine_in(&tmp, Box::new(Shared(gauge.clone())), 2));
        let mut handles = Vec::new();
        for i in 0..5 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .apply_modification(
                        vec![change(&format!("f{i}.rs"), 2, "10", "11")],
                        ApplyOptions {
                            force: true,
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().state, ModificationState::Committed);
        }
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_rate_limit_blocks_and_force_bypasses() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("lib.rs"), "fn f() -> i32 {\n    10\n}\n").unwrap();
        let mut engine = engine_in(&tmp, Box::new(OkRunner), 2);
        // Recreate with a cap of one per hour.
        engine.config.max_modifications_per_hour = 1;

        engine
            .apply_modification(
                vec![change("lib.rs", 2, "10", "11")],
                ApplyOptions::default(),
            )
            .await
            .unwrap();

        let err = engine
            .apply_modification(
                vec![change("lib.rs", 2, "11", "12")],
                ApplyOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rate limited"));

        let forced = engine
            .apply_modification(
                vec![change("lib.rs", 2, "11", "12")],
                ApplyOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(forced.state, ModificationState::Committed);
    }

    #[tokio::test]
    async fn test_oversized_change_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("lib.rs"), "fn f() -> i32 {\n    10\n}\n").unwrap();
        let mut engine = engine_in(&tmp, Box::new(OkRunner), 2);
        engine.config.max_change_bytes = 8;

        let err = engine
            .apply_modification(
                vec![change("lib.rs", 2, "10", "1111111111")],
                ApplyOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn test_manual_rollback_of_committed_modification() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("lib.rs");
        fs::write(&file, "fn f() -> i32 {\n    10\n}\n").unwrap();
        let mut engine = engine_in(&tmp, Box::new(OkRunner), 2);
        engine.config.retain_backups = true;

        let outcome = engine
            .apply_modification(
                vec![change("lib.rs", 2, "10", "11")],
                ApplyOptions::default(),
            )
            .await
            .unwrap();
        assert!(fs::read_to_string(&file).unwrap().contains("11"));

        engine
            .rollback_modification(&outcome.modification_id)
            .await
            .unwrap();
        assert_eq!(
            fs::read_to_string(&file).unwrap(),
            "fn f() -> i32 {\n    10\n}\n"
        );

        let err = engine.rollback_modification("missing").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MutationError>(),
            Some(MutationError::ModificationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_committed_snapshot_is_retained() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("lib.rs"), "fn f() -> i32 {\n    10\n}\n").unwrap();
        let engine = engine_in(&tmp, Box::new(OkRunner), 2);

        let outcome = engine
            .apply_modification(
                vec![change("lib.rs", 2, "10", "11")],
                ApplyOptions::default(),
            )
            .await
            .unwrap();
        // Committed snapshots are kept for operator rollback.
        assert!(engine.backups.exists(&outcome.modification_id));
    }

    #[tokio::test]
    async fn test_transform_and_apply_renames_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("math.rs");
        fs::write(
            &file,
            "fn add_one(x: i32) -> i32 {\n    x + 1\n}\n\nfn use_it() -> i32 {\n    add_one(1)\n}\n",
        )
        .unwrap();
        let engine = engine_in(&tmp, Box::new(OkRunner), 2);

        let directives = vec![TransformDirective::Rename {
            target: "math.rs:add_one".into(),
            new_name: "increment".into(),
            rationale: None,
        }];
        let result = engine
            .transform_and_apply(&directives, false, ApplyOptions::default())
            .await
            .unwrap();
        assert_eq!(result.outcome.state, ModificationState::Committed);
        assert_eq!(result.summary.applied, 1);

        let text = fs::read_to_string(&file).unwrap();
        assert!(text.contains("fn increment"));
        assert!(!text.contains("add_one"));
    }

    #[tokio::test]
    async fn test_transform_and_apply_chained_directives_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("math.rs");
        fs::write(
            &file,
            "fn work(a: i32, b: i32) -> i32 {\n    let mut acc = 0;\n    acc += a * 2;\n    acc += b * 3;\n    acc\n}\n",
        )
        .unwrap();
        let engine = engine_in(&tmp, Box::new(OkRunner), 2);

        // The rename targets the function the extract introduces.
        let directives = vec![
            TransformDirective::Extract {
                target: "math.rs:work".into(),
                start_line: 3,
                end_line: 4,
                new_name: "accumulate".into(),
                rationale: None,
            },
            TransformDirective::Rename {
                target: "math.rs:accumulate".into(),
                new_name: "fold_terms".into(),
                rationale: None,
            },
        ];
        let result = engine
            .transform_and_apply(&directives, false, ApplyOptions::default())
            .await
            .unwrap();
        assert_eq!(result.outcome.state, ModificationState::Committed);
        assert!(result.rejected.is_empty());

        let text = fs::read_to_string(&file).unwrap();
        assert!(text.contains("fn fold_terms"));
        assert!(!text.contains("accumulate"));
        syn::parse_file(&text).unwrap();
    }

    #[tokio::test]
    async fn test_active_record_reflects_in_flight_state() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("lib.rs"), "fn f() -> i32 {\n    10\n}\n").unwrap();

        struct SlowRunner;
        #[async_trait]
        impl TestRunner for SlowRunner {
            async fn run(&self, _workspace: &Path, _filters: &[String]) -> Result<TestingReport> {
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
                Ok(TestingReport::empty_pass())
            }
        }

        let engine = Arc::new(engine_in(&tmp, Box::new(SlowRunner), 2));
        let worker = engine.clone();
        let handle = tokio::spawn(async move {
            worker
                .apply_modification(
                    vec![change("lib.rs", 2, "10", "11")],
                    ApplyOptions::default(),
                )
                .await
                .unwrap()
        });

        // Poll the active set until the in-flight record shows it
        // reached the testing stage.
        let mut observed_testing = false;
        for _ in 0..200 {
            let active = engine.get_active_modifications().unwrap();
            if active
                .iter()
                .any(|m| m.state == ModificationState::Testing)
            {
                observed_testing = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(observed_testing);

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.state, ModificationState::Committed);
        assert!(engine.get_active_modifications().unwrap().is_empty());
        let stored = engine
            .get_modification(&outcome.modification_id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, ModificationState::Committed);
    }

    #[tokio::test]
    async fn test_audit_report_lists_recent_activity() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("lib.rs"), "fn f() -> i32 {\n    10\n}\n").unwrap();
        let engine = engine_in(&tmp, Box::new(OkRunner), 2);

        assert_eq!(
            engine.generate_audit_report().unwrap(),
            "No modifications recorded."
        );

        engine
            .apply_modification(
                vec![change("lib.rs", 2, "10", "11")],
                ApplyOptions::default(),
            )
            .await
            .unwrap();
        let report = engine.generate_audit_report().unwrap();
        assert!(report.contains("modify: 1"));
        assert!(report.contains("committed"));
    }
}
