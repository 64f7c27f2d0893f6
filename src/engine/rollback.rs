//! Rollback Planning and Execution
//!
//! The reversal plan is built at submission time, before anything is
//! touched, so a failed pipeline never has to improvise. Execution
//! restores the snapshot and reports how long restoration took.

use std::time::Instant;

use tracing::{error, info};

use crate::backup::BackupStore;
use crate::error::MutationError;
use crate::types::{Change, RiskTier, RollbackComplexity, RollbackPlan, RollbackStep};

/// Build the ordered reversal plan for a batch: steps in reverse-apply
/// order, each naming the condition that must hold after it runs.
pub fn build_rollback_plan(changes: &[Change]) -> RollbackPlan {
    let steps = changes
        .iter()
        .rev()
        .enumerate()
        .map(|(order, change)| RollbackStep {
            order,
            change_id: change.id.clone(),
            file_path: change.file_path.clone(),
            verification: format!(
                "{} line {}: pre-modification text restored",
                change.file_path, change.line
            ),
        })
        .collect();

    RollbackPlan {
        steps,
        complexity: Some(assess_complexity(changes)),
    }
}

fn assess_complexity(changes: &[Change]) -> RollbackComplexity {
    let files: std::collections::HashSet<&str> =
        changes.iter().map(|c| c.file_path.as_str()).collect();
    let any_high = changes.iter().any(|c| c.risk == RiskTier::High);

    if any_high || changes.len() > 10 {
        RollbackComplexity::High
    } else if files.len() > 1 || changes.len() > 3 {
        RollbackComplexity::Moderate
    } else {
        RollbackComplexity::Low
    }
}

/// Restore the modification's snapshot. Returns the wall-clock duration
/// of the restore in milliseconds.
///
/// A failure here is the most severe outcome the engine has: the tree
/// may be left mid-restore. It is reported, never auto-retried.
pub fn execute_rollback(
    store: &BackupStore,
    modification_id: &str,
    plan: &RollbackPlan,
) -> Result<u64, MutationError> {
    info!(
        "rolling back {modification_id}: {} step(s), complexity {:?}",
        plan.steps.len(),
        plan.complexity
    );
    let started = Instant::now();

    store.restore(modification_id).map_err(|e| {
        error!("rollback of {modification_id} failed: {e:#}");
        MutationError::RollbackFailure(format!("{e:#}"))
    })?;

    reverify_restored(store, modification_id)?;

    let duration_ms = started.elapsed().as_millis() as u64;
    info!("rollback of {modification_id} completed in {duration_ms}ms");
    Ok(duration_ms)
}

/// Confirm every restored Rust source parses cleanly again.
fn reverify_restored(store: &BackupStore, modification_id: &str) -> Result<(), MutationError> {
    let manifest = store
        .load_manifest(modification_id)
        .map_err(|e| MutationError::RollbackFailure(format!("{e:#}")))?;
    for entry in &manifest.files {
        if !entry.original_path.ends_with(".rs") || entry.backup_path.is_empty() {
            continue;
        }
        let text = std::fs::read_to_string(&entry.original_path).map_err(|e| {
            MutationError::RollbackFailure(format!("{}: unreadable after restore: {e}", entry.original_path))
        })?;
        if let Err(e) = syn::parse_file(&text) {
            return Err(MutationError::RollbackFailure(format!(
                "{}: does not parse after restore: {e}",
                entry.original_path
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeType;
    use std::fs;

    fn change(file: &str, risk: RiskTier) -> Change {
        Change {
            id: uuid::Uuid::new_v4().to_string(),
            change_type: ChangeType::Modify,
            file_path: file.into(),
            line: 1,
            column: 1,
            enclosing_function: None,
            enclosing_type: None,
            original_code: Some("a".into()),
            new_code: Some("b".into()),
            description: String::new(),
            rationale: String::new(),
            risk,
        }
    }

    #[test]
    fn test_plan_reverses_apply_order() {
        let changes = vec![change("a.rs", RiskTier::Low), change("b.rs", RiskTier::Low)];
        let plan = build_rollback_plan(&changes);
        assert_eq!(plan.steps[0].file_path, "b.rs");
        assert_eq!(plan.steps[1].file_path, "a.rs");
        assert_eq!(plan.steps[0].order, 0);
    }

    #[test]
    fn test_complexity_tiers() {
        let low = build_rollback_plan(&[change("a.rs", RiskTier::Low)]);
        assert_eq!(low.complexity, Some(RollbackComplexity::Low));

        let moderate =
            build_rollback_plan(&[change("a.rs", RiskTier::Low), change("b.rs", RiskTier::Low)]);
        assert_eq!(moderate.complexity, Some(RollbackComplexity::Moderate));

        let high = build_rollback_plan(&[change("a.rs", RiskTier::High)]);
        assert_eq!(high.complexity, Some(RollbackComplexity::High));
    }

    #[test]
    fn test_execute_rollback_restores_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.rs");
        fs::write(&file, "fn a() {}\n").unwrap();

        let store = BackupStore::new(tmp.path().join("backups"));
        store.create("m-1", &[file.clone()]).unwrap();
        fs::write(&file, "fn a() { mutated }\n").unwrap();

        let plan = build_rollback_plan(&[change(file.to_str().unwrap(), RiskTier::Low)]);
        execute_rollback(&store, "m-1", &plan).unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "fn a() {}\n");
    }

    #[test]
    fn test_execute_rollback_without_backup_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackupStore::new(tmp.path().join("backups"));
        let plan = build_rollback_plan(&[change("a.rs", RiskTier::Low)]);
        let err = execute_rollback(&store, "missing", &plan).unwrap_err();
        assert!(matches!(err, MutationError::RollbackFailure(_)));
    }
}
