//! Metamorph - Type Definitions
//!
//! All shared types for the runtime self-modification engine:
//! modifications, changes, reports, rollback plans, backup manifests,
//! and lifecycle events.

use serde::{Deserialize, Serialize};

// ─── Changes ─────────────────────────────────────────────────────

/// Classification of a change (and, derived, of a whole modification).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Add,
    Modify,
    Delete,
    Refactor,
    Optimize,
    Enhance,
    Fix,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Add => "add",
            ChangeType::Modify => "modify",
            ChangeType::Delete => "delete",
            ChangeType::Refactor => "refactor",
            ChangeType::Optimize => "optimize",
            ChangeType::Enhance => "enhance",
            ChangeType::Fix => "fix",
        }
    }
}

/// Coarse risk tier attached to every change.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

/// One atomic, location-addressed text edit.
///
/// For `Modify`/`Delete` changes `original_code` must still be present at
/// the recorded location at apply-time; the apply step fails rather than
/// silently overwriting unrelated text.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub id: String,
    pub change_type: ChangeType,
    pub file_path: String,
    /// 1-based line of the edit location.
    pub line: usize,
    /// 1-based column of the edit location.
    pub column: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enclosing_function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enclosing_type: Option<String>,
    /// Exact text expected at the location. `None` for pure insertions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_code: Option<String>,
    /// Replacement text. `None` for pure deletions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_code: Option<String>,
    pub description: String,
    pub rationale: String,
    pub risk: RiskTier,
}

impl Change {
    /// Derive the overall classification for a batch of changes: the most
    /// frequent change type, falling back to `Modify` on a tie.
    pub fn classify(changes: &[Change]) -> ChangeType {
        let mut counts: std::collections::HashMap<ChangeType, usize> =
            std::collections::HashMap::new();
        for c in changes {
            *counts.entry(c.change_type).or_insert(0) += 1;
        }
        let max = counts.values().copied().max().unwrap_or(0);
        let mut top: Vec<ChangeType> = counts
            .into_iter()
            .filter(|(_, n)| *n == max)
            .map(|(t, _)| t)
            .collect();
        if top.len() == 1 {
            top.pop().unwrap()
        } else {
            ChangeType::Modify
        }
    }
}

/// Derived set of everything a modification touches.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSummary {
    pub files: Vec<String>,
    pub functions: Vec<String>,
    pub types: Vec<String>,
    pub modules: Vec<String>,
}

impl TargetSummary {
    pub fn from_changes(changes: &[Change]) -> Self {
        let mut summary = TargetSummary::default();
        for c in changes {
            if !summary.files.contains(&c.file_path) {
                summary.files.push(c.file_path.clone());
            }
            if let Some(f) = &c.enclosing_function {
                if !summary.functions.contains(f) {
                    summary.functions.push(f.clone());
                }
            }
            if let Some(t) = &c.enclosing_type {
                if !summary.types.contains(t) {
                    summary.types.push(t.clone());
                }
            }
            let module = std::path::Path::new(&c.file_path)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            if !module.is_empty() && !summary.modules.contains(&module) {
                summary.modules.push(module);
            }
        }
        summary
    }
}

// ─── Reports ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Passed,
    Failed,
}

/// Outcome of one named validator check.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Result of running the modification validator. Produced twice per
/// modification (pre- and post-apply) and overwritten in place.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub status: ReportStatus,
    pub checks: Vec<CheckResult>,
    /// Passed checks over total checks, as a percentage.
    pub score: f64,
    pub blocking_issues: Vec<String>,
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self {
            status: ReportStatus::Pending,
            checks: Vec::new(),
            score: 0.0,
            blocking_issues: Vec::new(),
        }
    }
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.status == ReportStatus::Passed
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub name: String,
    pub status: TestStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageSummary {
    pub line_percent: f64,
    pub branch_percent: f64,
}

/// Result of running the affected-test subset after apply.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestingReport {
    pub status: ReportStatus,
    pub results: Vec<TestResult>,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageSummary>,
}

impl Default for TestingReport {
    fn default() -> Self {
        Self {
            status: ReportStatus::Pending,
            results: Vec::new(),
            passed: 0,
            failed: 0,
            skipped: 0,
            duration_ms: 0,
            coverage: None,
        }
    }
}

impl TestingReport {
    /// A trivially-passing report for the no-relevant-tests case.
    pub fn empty_pass() -> Self {
        Self {
            status: ReportStatus::Passed,
            ..Default::default()
        }
    }
}

// ─── Rollback ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RollbackComplexity {
    Low,
    Moderate,
    High,
}

/// One reversal step: restore a file and confirm the condition holds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackStep {
    pub order: usize,
    pub change_id: String,
    pub file_path: String,
    /// Human-readable condition that must hold once the step is applied.
    pub verification: String,
}

/// Ordered reversal plan, built at submission time and executed only on
/// failure. Steps run in reverse-apply order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackPlan {
    pub steps: Vec<RollbackStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity: Option<RollbackComplexity>,
}

// ─── Backups ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupFileEntry {
    pub original_path: String,
    pub backup_path: String,
    pub size_bytes: u64,
    /// Sha3-256 of the file content, hex-encoded.
    pub checksum: String,
}

/// Manifest describing one modification's snapshot. Written before any
/// file is mutated, consumed only during rollback, never mutated after
/// creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub modification_id: String,
    pub created_at: String,
    pub files: Vec<BackupFileEntry>,
    pub total_bytes: u64,
    /// Sha3-256 over the concatenated per-file checksums.
    pub checksum: String,
}

// ─── Modification lifecycle ──────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModificationState {
    Created,
    Validating,
    BackingUp,
    Applying,
    Revalidating,
    Testing,
    Verifying,
    Committed,
    RollingBack,
    Failed,
    DryRun,
}

impl ModificationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ModificationState::Committed | ModificationState::Failed | ModificationState::DryRun
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModificationState::Created => "created",
            ModificationState::Validating => "validating",
            ModificationState::BackingUp => "backing_up",
            ModificationState::Applying => "applying",
            ModificationState::Revalidating => "re_validating",
            ModificationState::Testing => "testing",
            ModificationState::Verifying => "verifying",
            ModificationState::Committed => "committed",
            ModificationState::RollingBack => "rolling_back",
            ModificationState::Failed => "failed",
            ModificationState::DryRun => "dry_run",
        }
    }
}

/// Free-form metadata attached by the submitter.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModificationMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_status: Option<String>,
}

/// A submitted batch of changes tracked through validation, backup,
/// apply, test, and verify stages.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Modification {
    pub id: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub classification: ChangeType,
    pub state: ModificationState,
    pub targets: TargetSummary,
    pub changes: Vec<Change>,
    pub validation: ValidationReport,
    pub testing: TestingReport,
    pub rollback_plan: RollbackPlan,
    pub metadata: ModificationMetadata,
    /// Truncated unified-style diff of everything applied, for the audit trail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub rollback_failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_duration_ms: Option<u64>,
}

// ─── Submission API ──────────────────────────────────────────────

/// Options accepted by `apply_modification`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOptions {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub skip_validation: bool,
    #[serde(default)]
    pub skip_backup: bool,
    /// Bypass the rate limiter.
    #[serde(default)]
    pub force: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    pub metadata: Option<ModificationMetadata>,
}

/// What the caller gets back from a submission: the id plus the terminal
/// state and, when the pipeline failed, the populated error field.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub modification_id: String,
    pub state: ModificationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregates over the modification history.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModificationStatistics {
    pub total: u64,
    pub committed: u64,
    pub failed: u64,
    pub active: u64,
    pub avg_changes_per_modification: f64,
    /// Classification name and count, most frequent first.
    pub most_common_types: Vec<(String, u64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_rollback_duration_ms: Option<f64>,
}

// ─── Lifecycle events ────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    Started,
    StateChanged,
    DryRun,
    Completed,
    Failed,
    RollbackStarted,
    RollbackCompleted,
    HotReloaded,
}

/// Typed lifecycle notification, keyed by modification id. Callers
/// subscribe to a stream of these instead of an ad-hoc event emitter.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub modification_id: String,
    pub kind: LifecycleEventKind,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ─── Hot reload ──────────────────────────────────────────────────

/// One recorded reload attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadAttempt {
    pub timestamp: String,
    pub module_path: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── Transformation directives ───────────────────────────────────

/// Named text-level rewrite from the fixed optimize/refactor catalogue.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RewriteOp {
    RemoveUnusedVariables,
    SimplifyConditionals,
    ReduceNesting,
    ConstantFolding,
    DeadCodeElimination,
    ExtractMethod,
    SplitFunction,
    RenameVariables { from: String, to: String },
    ConvertClosureToFn,
    DestructureParameters,
}

/// A transformation directive for the tree transformer.
///
/// Closed tagged union: unknown types are rejected at the serde boundary
/// rather than duck-typed through optional fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TransformDirective {
    /// Replace every occurrence of the target's declared name within its
    /// lexical scope. Target: `file.rs:name`, `name`, or `file.rs:fn.local`.
    Rename {
        target: String,
        new_name: String,
        #[serde(default)]
        rationale: Option<String>,
    },
    /// Lift a line span of the target function into a new top-level
    /// function taking its free variables as parameters.
    Extract {
        target: String,
        start_line: usize,
        end_line: usize,
        new_name: String,
        #[serde(default)]
        rationale: Option<String>,
    },
    /// Replace call-sites of the target function with its body.
    Inline {
        target: String,
        #[serde(default)]
        rationale: Option<String>,
    },
    /// Apply catalogue rewrites to the rendered text of the target subtree.
    Optimize {
        target: String,
        operations: Vec<RewriteOp>,
        #[serde(default)]
        rationale: Option<String>,
    },
    /// Same catalogue as `Optimize`; classified as a refactor.
    Refactor {
        target: String,
        operations: Vec<RewriteOp>,
        #[serde(default)]
        rationale: Option<String>,
    },
}

impl TransformDirective {
    pub fn target(&self) -> &str {
        match self {
            TransformDirective::Rename { target, .. }
            | TransformDirective::Extract { target, .. }
            | TransformDirective::Inline { target, .. }
            | TransformDirective::Optimize { target, .. }
            | TransformDirective::Refactor { target, .. } => target,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransformDirective::Rename { .. } => "rename",
            TransformDirective::Extract { .. } => "extract",
            TransformDirective::Inline { .. } => "inline",
            TransformDirective::Optimize { .. } => "optimize",
            TransformDirective::Refactor { .. } => "refactor",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(change_type: ChangeType, file: &str) -> Change {
        Change {
            id: "c1".into(),
            change_type,
            file_path: file.into(),
            line: 1,
            column: 1,
            enclosing_function: None,
            enclosing_type: None,
            original_code: None,
            new_code: Some("x".into()),
            description: String::new(),
            rationale: String::new(),
            risk: RiskTier::Low,
        }
    }

    #[test]
    fn test_classify_uniform_batch() {
        let changes = vec![
            change(ChangeType::Optimize, "a.rs"),
            change(ChangeType::Optimize, "b.rs"),
        ];
        assert_eq!(Change::classify(&changes), ChangeType::Optimize);
    }

    #[test]
    fn test_classify_tie_falls_back_to_modify() {
        let changes = vec![
            change(ChangeType::Add, "a.rs"),
            change(ChangeType::Delete, "b.rs"),
        ];
        assert_eq!(Change::classify(&changes), ChangeType::Modify);
    }

    #[test]
    fn test_target_summary_dedupes() {
        let changes = vec![change(ChangeType::Add, "src/a.rs"), change(ChangeType::Add, "src/a.rs")];
        let summary = TargetSummary::from_changes(&changes);
        assert_eq!(summary.files, vec!["src/a.rs"]);
        assert_eq!(summary.modules, vec!["a"]);
    }

    #[test]
    fn test_directive_rejects_unknown_type() {
        let raw = r#"{"type": "teleport", "target": "f"}"#;
        assert!(serde_json::from_str::<TransformDirective>(raw).is_err());
    }

    #[test]
    fn test_directive_roundtrip() {
        let raw = r#"{"type": "rename", "target": "src/a.rs:foo", "newName": "bar"}"#;
        let d: TransformDirective = serde_json::from_str(raw).unwrap();
        assert_eq!(d.kind(), "rename");
        assert_eq!(d.target(), "src/a.rs:foo");
    }
}
