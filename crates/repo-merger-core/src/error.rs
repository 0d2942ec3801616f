//! Error taxonomy for the consolidation engine.
//!
//! Per-fragment errors (`UnreadableFile`, `EmptyManifest`,
//! `WorktreeCreationFailed`, `MergeConflict`, `UnimplementedScenario`) are
//! recorded against the fragment and never abort a batch. Workspace-level
//! and report-integrity errors (`WorkspaceConflict`, `IdempotencyViolation`,
//! `UnknownFragment`) are fatal for the run. Every message names the
//! affected identifier or fragment and how to recover.

use std::path::PathBuf;
use thiserror::Error;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(
        "workspace '{identifier}' conflicts with existing data at {}: {detail}. \
         Rerun with --force to recreate it",
        path.display()
    )]
    WorkspaceConflict {
        identifier: String,
        path: PathBuf,
        detail: String,
    },

    #[error("cannot read {path}: {reason}")]
    UnreadableFile { path: String, reason: String },

    #[error(
        "fragment '{fragment_id}' has no files; recovery needs at least one file. \
         Check the fragment source or drop it from the run"
    )]
    EmptyManifest { fragment_id: String },

    #[error(
        "fragment '{fragment_id}': history comparison with golden is ambiguous ({detail}); \
         recorded as diverged for manual review"
    )]
    ClassificationAmbiguous { fragment_id: String, detail: String },

    #[error(
        "fragment '{fragment_id}' conflicted in {}: {paths}. Resolve the conflicts in that \
         worktree, then rerun with --resume-from {fragment_id}",
        worktree.display()
    )]
    MergeConflict {
        fragment_id: String,
        worktree: PathBuf,
        paths: String,
    },

    #[error(
        "could not create worktree for fragment '{fragment_id}' at {}: {reason}",
        path.display()
    )]
    WorktreeCreationFailed {
        fragment_id: String,
        path: PathBuf,
        reason: String,
    },

    #[error(
        "refusing to write {}: updating section '{section}' would alter section '{clobbered}'. \
         The report was left untouched; inspect or restore it before rescanning",
        path.display()
    )]
    IdempotencyViolation {
        path: PathBuf,
        section: String,
        clobbered: String,
    },

    #[error(
        "no handler implemented for scenario '{kind}' (fragment '{fragment_id}'); \
         the fragment was recorded and skipped for this step"
    )]
    UnimplementedScenario { kind: String, fragment_id: String },

    #[error(
        "fragment '{fragment_id}' is not part of workspace '{identifier}'. \
         Check analysis.json for valid --resume-from values"
    )]
    UnknownFragment {
        identifier: String,
        fragment_id: String,
    },

    #[error("git {args} failed in {}: {stderr}", dir.display())]
    Git {
        args: String,
        dir: PathBuf,
        stderr: String,
    },
}

impl EngineError {
    /// Whether the error is isolated to a single fragment.
    pub fn is_per_fragment(&self) -> bool {
        matches!(
            self,
            EngineError::UnreadableFile { .. }
                | EngineError::EmptyManifest { .. }
                | EngineError::ClassificationAmbiguous { .. }
                | EngineError::MergeConflict { .. }
                | EngineError::WorktreeCreationFailed { .. }
                | EngineError::UnimplementedScenario { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_conflict_names_remediation() {
        let err = EngineError::WorkspaceConflict {
            identifier: "acme-widgets".to_string(),
            path: PathBuf::from("/ws/acme-widgets/golden"),
            detail: "HEAD differs".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("acme-widgets"));
        assert!(msg.contains("--force"));
        assert!(!err.is_per_fragment());
    }

    #[test]
    fn merge_conflict_points_at_resume() {
        let err = EngineError::MergeConflict {
            fragment_id: "frag-1a2b".to_string(),
            worktree: PathBuf::from("/ws/x/worktrees/frag-1a2b"),
            paths: "app.txt".to_string(),
        };
        assert!(err.to_string().contains("--resume-from frag-1a2b"));
        assert!(err.is_per_fragment());
    }
}
