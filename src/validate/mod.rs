//! Modification Validator
//!
//! Static checks against a proposed change-list, run once before
//! backup/apply and once after apply. The result is valid iff no check
//! reports an error; warnings never block.

pub mod checks;

use std::path::Path;

use tracing::debug;

use crate::types::{Change, CheckResult, ReportStatus, ValidationReport};

pub use checks::{is_protected_file, BLOCKED_DIRECTORY_PATTERNS, PROTECTED_FILES};

/// Which side of the apply step is being validated. Pre-apply inspects
/// the proposed fragments; post-apply inspects the mutated files, which
/// catches interaction effects between changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    PreApply,
    PostApply,
}

/// Run all four checks against the change-list.
pub fn validate(changes: &[Change], workspace: &Path, phase: Phase) -> ValidationReport {
    let results: Vec<CheckResult> = vec![
        checks::syntax_check(changes, workspace, phase == Phase::PostApply),
        checks::security_check(changes),
        checks::performance_check(changes),
        checks::compatibility_check(changes),
    ];

    let total = results.len();
    let passed = results.iter().filter(|c| c.passed).count();
    let blocking_issues: Vec<String> = results
        .iter()
        .flat_map(|c| c.errors.iter().cloned())
        .collect();

    let status = if blocking_issues.is_empty() {
        ReportStatus::Passed
    } else {
        ReportStatus::Failed
    };
    debug!(
        "validation ({phase:?}): {passed}/{total} checks passed, {} blocking issue(s)",
        blocking_issues.len()
    );

    ValidationReport {
        status,
        checks: results,
        score: passed as f64 / total as f64 * 100.0,
        blocking_issues,
    }
}
