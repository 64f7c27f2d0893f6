//! Modification Pipeline
//!
//! Drives one modification through its lifecycle:
//! created, validating, backing_up, applying, re_validating, testing,
//! verifying, committed. Any failure after files were touched routes
//! through rolling_back to failed; a dry run terminates after the
//! backup stage with nothing written.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backup::BackupStore;
use crate::error::MutationError;
use crate::types::{
    Change, LifecycleEventKind, Modification, ModificationMetadata, ModificationState,
    TargetSummary,
};
use crate::validate::{self, Phase};

use super::apply;
use super::events::LifecycleBus;
use super::rollback;
use super::toolchain::{Compiler, TestRunner};

/// Everything a pipeline run needs besides the modification itself.
pub struct PipelineContext<'a> {
    pub workspace: PathBuf,
    pub backups: &'a BackupStore,
    pub compiler: &'a dyn Compiler,
    pub tests: &'a dyn TestRunner,
    pub bus: &'a LifecycleBus,
    pub dry_run: bool,
    pub skip_validation: bool,
    pub skip_backup: bool,
    /// Called with the current record after every state transition, so
    /// the owner can expose in-flight progress to readers.
    pub progress: Option<&'a (dyn Fn(&Modification) + Send + Sync)>,
}

/// Build a fresh modification record for a submitted batch.
pub fn create_modification(changes: Vec<Change>, metadata: ModificationMetadata) -> Modification {
    Modification {
        id: Uuid::new_v4().to_string(),
        created_at: Utc::now().to_rfc3339(),
        completed_at: None,
        classification: Change::classify(&changes),
        state: ModificationState::Created,
        targets: TargetSummary::from_changes(&changes),
        rollback_plan: rollback::build_rollback_plan(&changes),
        changes,
        validation: Default::default(),
        testing: Default::default(),
        metadata,
        diff: None,
        error: None,
        rollback_failed: false,
        rollback_duration_ms: None,
    }
}

/// Run the modification to a terminal state. The record is mutated in
/// place; the caller persists it afterwards.
pub async fn run(ctx: &PipelineContext<'_>, modification: &mut Modification) {
    ctx.bus
        .emit(&modification.id, LifecycleEventKind::Started, None);

    // ── Validating ──
    set_state(ctx, modification, ModificationState::Validating);
    if !ctx.skip_validation {
        let report = validate::validate(&modification.changes, &ctx.workspace, Phase::PreApply);
        let valid = report.is_valid();
        let issues = report.blocking_issues.join("; ");
        modification.validation = report;
        if !valid {
            fail(ctx, modification, MutationError::ValidationFailed(issues), false);
            return;
        }
    }

    // ── Backing up ──
    set_state(ctx, modification, ModificationState::BackingUp);
    let mut backup_taken = false;
    if !ctx.skip_backup && !ctx.dry_run {
        let files: Vec<PathBuf> = modification
            .targets
            .files
            .iter()
            .map(|f| resolve(&ctx.workspace, f))
            .collect();
        if let Err(e) = ctx.backups.create(&modification.id, &files) {
            fail(
                ctx,
                modification,
                MutationError::ValidationFailed(format!("backup failed: {e:#}")),
                false,
            );
            return;
        }
        backup_taken = true;
    }

    // A dry run stops here: everything before this point is read-only.
    if ctx.dry_run {
        modification.state = ModificationState::DryRun;
        modification.completed_at = Some(Utc::now().to_rfc3339());
        notify(ctx, modification);
        ctx.bus
            .emit(&modification.id, LifecycleEventKind::DryRun, None);
        info!("dry run {} completed, nothing written", modification.id);
        return;
    }

    // ── Applying ──
    set_state(ctx, modification, ModificationState::Applying);
    match apply::apply_changes(&ctx.workspace, &modification.changes) {
        Ok(result) => {
            modification.diff = Some(result.diff);
        }
        Err(e) => {
            // A mismatch is detected before the first write, so there is
            // nothing to roll back.
            let error = match e.downcast::<MutationError>() {
                Ok(m) => m,
                Err(other) => MutationError::VerificationFailure(format!("{other:#}")),
            };
            let mismatch = matches!(error, MutationError::OriginalTextMismatch { .. });
            fail(ctx, modification, error, backup_taken && !mismatch);
            return;
        }
    }

    // ── Re-validating ──
    set_state(ctx, modification, ModificationState::Revalidating);
    if !ctx.skip_validation {
        let report = validate::validate(&modification.changes, &ctx.workspace, Phase::PostApply);
        let valid = report.is_valid();
        let issues = report.blocking_issues.join("; ");
        modification.validation = report;
        if !valid {
            fail(ctx, modification, MutationError::ValidationFailed(issues), backup_taken);
            return;
        }
    }

    // ── Testing ──
    set_state(ctx, modification, ModificationState::Testing);
    match ctx.tests.run(&ctx.workspace, &modification.targets.functions).await {
        Ok(report) => {
            let passed = report.status == crate::types::ReportStatus::Passed;
            let failed = report.failed;
            modification.testing = report;
            if !passed {
                fail(
                    ctx,
                    modification,
                    MutationError::TestFailure(format!("{failed} test(s) failed")),
                    backup_taken,
                );
                return;
            }
        }
        Err(e) => {
            fail(
                ctx,
                modification,
                MutationError::TestFailure(format!("test runner error: {e:#}")),
                backup_taken,
            );
            return;
        }
    }

    // ── Verifying ──
    set_state(ctx, modification, ModificationState::Verifying);
    if let Err(e) = apply::verify_applied(&ctx.workspace, &modification.changes) {
        let error = match e.downcast::<MutationError>() {
            Ok(m) => m,
            Err(other) => MutationError::VerificationFailure(format!("{other:#}")),
        };
        fail(ctx, modification, error, backup_taken);
        return;
    }
    match ctx.compiler.check(&ctx.workspace).await {
        Ok(outcome) if !outcome.success => {
            fail(
                ctx,
                modification,
                MutationError::VerificationFailure(format!(
                    "compile check failed: {}",
                    first_line(&outcome.output)
                )),
                backup_taken,
            );
            return;
        }
        Ok(_) => {}
        Err(e) => {
            fail(
                ctx,
                modification,
                MutationError::VerificationFailure(format!("compile check error: {e:#}")),
                backup_taken,
            );
            return;
        }
    }

    // ── Committed ──
    modification.state = ModificationState::Committed;
    modification.completed_at = Some(Utc::now().to_rfc3339());
    notify(ctx, modification);
    ctx.bus
        .emit(&modification.id, LifecycleEventKind::Completed, None);
    info!(
        "modification {} committed ({} change(s))",
        modification.id,
        modification.changes.len()
    );
}

/// Route a pipeline failure to the terminal `failed` state, rolling back
/// first when files were touched and a snapshot exists.
fn fail(
    ctx: &PipelineContext<'_>,
    modification: &mut Modification,
    error: MutationError,
    rollback_needed: bool,
) {
    warn!("modification {} failed: {error}", modification.id);

    if rollback_needed {
        set_state(ctx, modification, ModificationState::RollingBack);
        ctx.bus
            .emit(&modification.id, LifecycleEventKind::RollbackStarted, None);
        match rollback::execute_rollback(ctx.backups, &modification.id, &modification.rollback_plan)
        {
            Ok(duration_ms) => {
                modification.rollback_duration_ms = Some(duration_ms);
                ctx.bus.emit(
                    &modification.id,
                    LifecycleEventKind::RollbackCompleted,
                    Some(format!("{duration_ms}ms")),
                );
            }
            Err(rollback_error) => {
                modification.rollback_failed = true;
                modification.error = Some(format!("{error}; {rollback_error}"));
            }
        }
    }

    if modification.error.is_none() {
        modification.error = Some(error.to_string());
    }
    modification.state = ModificationState::Failed;
    modification.completed_at = Some(Utc::now().to_rfc3339());
    notify(ctx, modification);
    ctx.bus.emit(
        &modification.id,
        LifecycleEventKind::Failed,
        modification.error.clone(),
    );
}

fn set_state(ctx: &PipelineContext<'_>, modification: &mut Modification, state: ModificationState) {
    modification.state = state;
    notify(ctx, modification);
    ctx.bus.emit(
        &modification.id,
        LifecycleEventKind::StateChanged,
        Some(state.as_str().to_string()),
    );
}

fn notify(ctx: &PipelineContext<'_>, modification: &Modification) {
    if let Some(progress) = ctx.progress {
        progress(modification);
    }
}

fn resolve(workspace: &Path, file_path: &str) -> PathBuf {
    let p = Path::new(file_path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        workspace.join(p)
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::toolchain::CompileOutcome;
    use crate::types::{ChangeType, ReportStatus, RiskTier, TestingReport};
    use async_trait::async_trait;
    use std::fs;

    struct FixedCompiler(bool);

    #[async_trait]
    impl Compiler for FixedCompiler {
        async fn check(&self, _workspace: &Path) -> anyhow::Result<CompileOutcome> {
            Ok(CompileOutcome {
                success: self.0,
                output: if self.0 { String::new() } else { "error[E0308]".into() },
            })
        }
    }

    struct FixedRunner(bool);

    #[async_trait]
    impl TestRunner for FixedRunner {
        async fn run(
            &self,
            _workspace: &Path,
            _filters: &[String],
        ) -> anyhow::Result<TestingReport> {
            let mut report = TestingReport::empty_pass();
            if !self.0 {
                report.status = ReportStatus::Failed;
                report.failed = 1;
            }
            Ok(report)
        }
    }

    fn change(line: usize, original: &str, new: &str) -> Change {
        Change {
            id: Uuid::new_v4().to_string(),
            change_type: ChangeType::Modify,
            file_path: "lib.rs".into(),
            line,
            column: 1,
            enclosing_function: Some("compute".into()),
            enclosing_type: None,
            original_code: Some(original.into()),
            new_code: Some(new.into()),
            description: "adjust increment".into(),
            rationale: "test".into(),
            risk: RiskTier::Low,
        }
    }

    struct Fixture {
        tmp: tempfile::TempDir,
        backups: BackupStore,
        bus: LifecycleBus,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            fs::write(
                tmp.path().join("lib.rs"),
                "fn compute(x: i32) -> i32 {\n    x + 1\n}\n",
            )
            .unwrap();
            let backups = BackupStore::new(tmp.path().join("backups"));
            Self {
                tmp,
                backups,
                bus: LifecycleBus::new(),
            }
        }

        fn ctx<'a>(
            &'a self,
            compiler: &'a dyn Compiler,
            tests: &'a dyn TestRunner,
            dry_run: bool,
        ) -> PipelineContext<'a> {
            PipelineContext {
                workspace: self.tmp.path().to_path_buf(),
                backups: &self.backups,
                compiler,
                tests,
                bus: &self.bus,
                dry_run,
                skip_validation: false,
                skip_backup: false,
                progress: None,
            }
        }

        fn source(&self) -> String {
            fs::read_to_string(self.tmp.path().join("lib.rs")).unwrap()
        }
    }

    #[tokio::test]
    async fn test_happy_path_commits() {
        let fx = Fixture::new();
        let compiler = FixedCompiler(true);
        let runner = FixedRunner(true);
        let mut m = create_modification(vec![change(2, "x + 1", "x + 2")], Default::default());

        run(&fx.ctx(&compiler, &runner, false), &mut m).await;

        assert_eq!(m.state, ModificationState::Committed);
        assert!(m.error.is_none());
        assert!(m.completed_at.is_some());
        assert!(m.diff.as_deref().unwrap().contains("+    x + 2"));
        assert!(fx.source().contains("x + 2"));
    }

    #[tokio::test]
    async fn test_mismatch_fails_without_rollback() {
        let fx = Fixture::new();
        let compiler = FixedCompiler(true);
        let runner = FixedRunner(true);
        let before = fx.source();
        let mut m = create_modification(vec![change(2, "x + 5", "x + 2")], Default::default());

        run(&fx.ctx(&compiler, &runner, false), &mut m).await;

        assert_eq!(m.state, ModificationState::Failed);
        assert!(m.error.as_deref().unwrap().contains("mismatch"));
        // Nothing was written, so nothing was rolled back.
        assert!(m.rollback_duration_ms.is_none());
        assert!(!m.rollback_failed);
        assert_eq!(fx.source(), before);
    }

    #[tokio::test]
    async fn test_test_failure_rolls_back_byte_identical() {
        let fx = Fixture::new();
        let compiler = FixedCompiler(true);
        let runner = FixedRunner(false);
        let before = fx.source();
        let mut m = create_modification(vec![change(2, "x + 1", "x + 2")], Default::default());

        run(&fx.ctx(&compiler, &runner, false), &mut m).await;

        assert_eq!(m.state, ModificationState::Failed);
        assert!(m.error.as_deref().unwrap().contains("test"));
        assert!(m.rollback_duration_ms.is_some());
        assert_eq!(fx.source(), before);
    }

    #[tokio::test]
    async fn test_compile_failure_rolls_back() {
        let fx = Fixture::new();
        let compiler = FixedCompiler(false);
        let runner = FixedRunner(true);
        let before = fx.source();
        let mut m = create_modification(vec![change(2, "x + 1", "x + 2")], Default::default());

        run(&fx.ctx(&compiler, &runner, false), &mut m).await;

        assert_eq!(m.state, ModificationState::Failed);
        assert!(m.error.as_deref().unwrap().contains("compile check failed"));
        assert_eq!(fx.source(), before);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing_and_is_repeatable() {
        let fx = Fixture::new();
        let compiler = FixedCompiler(true);
        let runner = FixedRunner(true);
        let before = fx.source();

        for _ in 0..2 {
            let mut m =
                create_modification(vec![change(2, "x + 1", "x + 2")], Default::default());
            run(&fx.ctx(&compiler, &runner, true), &mut m).await;
            assert_eq!(m.state, ModificationState::DryRun);
            assert_eq!(fx.source(), before);
        }
    }

    #[tokio::test]
    async fn test_validation_failure_stops_before_backup() {
        let fx = Fixture::new();
        let compiler = FixedCompiler(true);
        let runner = FixedRunner(true);
        let mut m = create_modification(
            vec![change(2, "x + 1", "let broken = ;{")],
            Default::default(),
        );

        run(&fx.ctx(&compiler, &runner, false), &mut m).await;

        assert_eq!(m.state, ModificationState::Failed);
        assert_eq!(m.validation.status, ReportStatus::Failed);
        assert!(!fx.backups.exists(&m.id));
    }

    #[tokio::test]
    async fn test_progress_callback_sees_each_state() {
        let fx = Fixture::new();
        let compiler = FixedCompiler(true);
        let runner = FixedRunner(true);
        let seen = std::sync::Mutex::new(Vec::new());
        let record = |m: &Modification| seen.lock().unwrap().push(m.state);

        let mut ctx = fx.ctx(&compiler, &runner, false);
        ctx.progress = Some(&record);
        let mut m = create_modification(vec![change(2, "x + 1", "x + 2")], Default::default());
        run(&ctx, &mut m).await;

        let seen = seen.lock().unwrap();
        for state in [
            ModificationState::Validating,
            ModificationState::BackingUp,
            ModificationState::Applying,
            ModificationState::Testing,
            ModificationState::Verifying,
            ModificationState::Committed,
        ] {
            assert!(seen.contains(&state), "missing {state:?} in {seen:?}");
        }
        assert_eq!(seen.last(), Some(&ModificationState::Committed));
    }

    #[tokio::test]
    async fn test_lifecycle_events_trace_the_run() {
        let fx = Fixture::new();
        let compiler = FixedCompiler(true);
        let runner = FixedRunner(true);
        let mut rx = fx.bus.subscribe();
        let mut m = create_modification(vec![change(2, "x + 1", "x + 2")], Default::default());

        run(&fx.ctx(&compiler, &runner, false), &mut m).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(kinds.first(), Some(&LifecycleEventKind::Started));
        assert_eq!(kinds.last(), Some(&LifecycleEventKind::Completed));
        assert!(kinds.contains(&LifecycleEventKind::StateChanged));
    }
}
