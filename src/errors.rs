//! Typed error taxonomy for the relay coordinator.
//!
//! One enum covers the whole pipeline: every variant carries the run id,
//! workspace id, and phase name that apply, so a caller can act on the
//! error without re-querying the store.

use std::path::PathBuf;

use thiserror::Error;

use crate::phase::Phase;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid {what}: {detail}")]
    Validation { what: &'static str, detail: String },

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Workspace {workspace_id} not found in run {run_id}")]
    WorkspaceNotFound {
        run_id: String,
        workspace_id: String,
    },

    #[error("Variant {variant_id} already exists in run {run_id}")]
    WorkspaceConflict { run_id: String, variant_id: u32 },

    #[error("Workspace {workspace_id} is locked by an in-flight phase or sample (run {run_id})")]
    WorkspaceBusy {
        run_id: String,
        workspace_id: String,
    },

    #[error(
        "Merging workspace {workspace_id} into {branch} conflicts in {} path(s) (run {run_id})",
        paths.len()
    )]
    MergeConflict {
        run_id: String,
        workspace_id: String,
        branch: String,
        paths: Vec<PathBuf>,
    },

    #[error("Run {run_id} already promoted workspace {workspace_id}")]
    AlreadyPromoted {
        run_id: String,
        workspace_id: String,
    },

    #[error("Phase {phase} failed in workspace {workspace_id} (run {run_id}): {diagnostics}")]
    PhaseFailure {
        run_id: String,
        workspace_id: String,
        phase: Phase,
        diagnostics: String,
    },

    #[error(
        "Phase {phase} exceeded its {limit_secs}s bound in workspace {workspace_id} (run {run_id})"
    )]
    Timeout {
        run_id: String,
        workspace_id: String,
        phase: Phase,
        limit_secs: u64,
    },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {op} failed: {detail}")]
    Vcs { op: &'static str, detail: String },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed run record at {}: {source}", path.display())]
    Store {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl RelayError {
    pub fn validation(what: &'static str, detail: impl Into<String>) -> Self {
        RelayError::Validation {
            what,
            detail: detail.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RelayError::Io {
            path: path.into(),
            source,
        }
    }
}
