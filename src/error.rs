//! Pipeline Error Taxonomy
//!
//! Typed failures the mutation pipeline can surface. Callers match on
//! these; everything else travels as `anyhow::Error` context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MutationError {
    /// The transformer could not resolve a directive's target node.
    /// Local to one directive batch; aborts the whole transform call
    /// before any mutation.
    #[error("transform target not found: {0}")]
    TargetNotFound(String),

    /// A blocking finding from the modification validator.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The file content at a recorded location no longer matches the
    /// expected before-text. Treated as a concurrent-modification hazard;
    /// never silently overwritten.
    #[error("original text mismatch in {file} near line {line}")]
    OriginalTextMismatch { file: String, line: usize },

    /// Post-apply tests failed.
    #[error("tests failed: {0}")]
    TestFailure(String),

    /// Applied text does not match the expected after-text, or the
    /// whole-project check failed post-apply.
    #[error("verification failed: {0}")]
    VerificationFailure(String),

    /// Restoration itself failed. The most severe case: the tree may be
    /// in a worse state than before. Never auto-retried.
    #[error("rollback failed: {0}")]
    RollbackFailure(String),

    /// Unknown modification id.
    #[error("modification not found: {0}")]
    ModificationNotFound(String),
}

impl MutationError {
    /// Whether this failure is raised after files were touched and
    /// therefore requires a rollback.
    pub fn requires_rollback(&self) -> bool {
        matches!(
            self,
            MutationError::TestFailure(_)
                | MutationError::VerificationFailure(_)
                | MutationError::OriginalTextMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_location() {
        let err = MutationError::OriginalTextMismatch {
            file: "src/a.rs".into(),
            line: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("src/a.rs"));
        assert!(msg.contains("10"));
    }

    #[test]
    fn test_rollback_requirement() {
        assert!(MutationError::TestFailure("t".into()).requires_rollback());
        assert!(!MutationError::ValidationFailed("v".into()).requires_rollback());
    }
}
