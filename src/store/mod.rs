//! Durable run, workspace and phase records.
//!
//! Every workflow run is one JSON document under `.relay/runs/`, keyed by
//! run id and replaced whole on each persist. Workspaces own their phase
//! sequences; the run-level status and phase list are rollups recomputed
//! whenever the record is written.

pub mod json;

pub use json::{RunStore, StatusScan};

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::{Phase, PhaseStatus, RunStatus};

/// Lifecycle state of one workspace replica. A workspace moves from active
/// to promoted or destroyed, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    Active,
    Promoted,
    Destroyed,
}

impl WorkspaceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceState::Active => "active",
            WorkspaceState::Promoted => "promoted",
            WorkspaceState::Destroyed => "destroyed",
        }
    }
}

impl std::fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of the configured test command for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pass,
    Fail,
    NotApplicable,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pass => "pass",
            TestStatus::Fail => "fail",
            TestStatus::NotApplicable => "not_applicable",
        }
    }

    /// Sort precedence when ranking workspaces: pass before fail before
    /// not applicable.
    pub fn precedence(&self) -> u8 {
        match self {
            TestStatus::Pass => 0,
            TestStatus::Fail => 1,
            TestStatus::NotApplicable => 2,
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time diff and test measurements for one workspace. Snapshots
/// are recomputable from workspace contents and only trusted within the
/// configured freshness window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub workspace_id: String,
    pub files_changed: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub test_status: TestStatus,
    pub test_reason: Option<String>,
    pub last_commit_subject: Option<String>,
    pub last_commit_at: Option<DateTime<Utc>>,
    pub sampled_at: DateTime<Utc>,
}

impl MetricSnapshot {
    pub fn total_changed_lines(&self) -> u64 {
        self.lines_added + self.lines_removed
    }

    /// Whether the snapshot is recent enough to reuse without resampling.
    /// A timestamp in the future counts as fresh.
    pub fn is_fresh(&self, window: Duration) -> bool {
        Utc::now()
            .signed_duration_since(self.sampled_at)
            .to_std()
            .map(|age| age <= window)
            .unwrap_or(true)
    }
}

/// One phase attempt inside a workspace's pipeline. Artifacts are opaque
/// path references; content is never inspected by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub input_artifact: Option<PathBuf>,
    pub output_artifact: Option<PathBuf>,
    pub failure_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PhaseRecord {
    pub fn pending(phase: Phase) -> Self {
        Self {
            phase,
            status: PhaseStatus::Pending,
            input_artifact: None,
            output_artifact: None,
            failure_reason: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// One isolated attempt at a run's task: a dedicated branch plus a
/// filesystem replica, with its own phase sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub id: String,
    pub run_id: String,
    pub variant_id: u32,
    pub branch: String,
    pub path: PathBuf,
    #[serde(rename = "status")]
    pub state: WorkspaceState,
    pub pipeline_status: RunStatus,
    pub phases: Vec<PhaseRecord>,
    pub created_at: DateTime<Utc>,
    pub promoted_at: Option<DateTime<Utc>>,
    /// Cached metrics from the most recent sample, reused only within the
    /// freshness window.
    pub snapshot: Option<MetricSnapshot>,
}

impl WorkspaceRecord {
    pub fn new(run_id: &str, variant_id: u32, branch: String, path: PathBuf) -> Self {
        Self {
            id: workspace_id(run_id, variant_id),
            run_id: run_id.to_string(),
            variant_id,
            branch,
            path,
            state: WorkspaceState::Active,
            pipeline_status: RunStatus::Pending,
            phases: Phase::ALL.iter().map(|p| PhaseRecord::pending(*p)).collect(),
            created_at: Utc::now(),
            promoted_at: None,
            snapshot: None,
        }
    }

    pub fn phase_record(&self, phase: Phase) -> Option<&PhaseRecord> {
        self.phases.iter().find(|r| r.phase == phase)
    }

    pub fn phase_record_mut(&mut self, phase: Phase) -> Option<&mut PhaseRecord> {
        self.phases.iter_mut().find(|r| r.phase == phase)
    }

    /// The phase the pipeline works on next: the first one that has not
    /// succeeded. A failed phase is returned again, since resumption
    /// re-enters the same phase. None once every phase has succeeded.
    pub fn next_phase(&self) -> Option<Phase> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| self.phase_record(*p).map(|r| r.status) != Some(PhaseStatus::Succeeded))
    }

    pub fn is_active(&self) -> bool {
        self.state == WorkspaceState::Active
    }
}

/// One end-to-end task execution spanning all phases and all parallel
/// attempts. `status` and `phases` are rollups over the workspaces,
/// refreshed on every persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub task: String,
    pub docs: Vec<PathBuf>,
    pub parallelism: u32,
    pub status: RunStatus,
    pub phases: Vec<PhaseRecord>,
    pub integration_branch: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub workspaces: Vec<WorkspaceRecord>,
}

impl WorkflowRun {
    pub fn new(
        id: String,
        task: String,
        docs: Vec<PathBuf>,
        parallelism: u32,
        integration_branch: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            task,
            docs,
            parallelism,
            status: RunStatus::Pending,
            phases: Phase::ALL.iter().map(|p| PhaseRecord::pending(*p)).collect(),
            integration_branch,
            created_at: now,
            updated_at: now,
            workspaces: Vec::new(),
        }
    }

    pub fn workspace(&self, workspace_id: &str) -> Option<&WorkspaceRecord> {
        self.workspaces.iter().find(|w| w.id == workspace_id)
    }

    pub fn workspace_mut(&mut self, workspace_id: &str) -> Option<&mut WorkspaceRecord> {
        self.workspaces.iter_mut().find(|w| w.id == workspace_id)
    }

    pub fn variant(&self, variant_id: u32) -> Option<&WorkspaceRecord> {
        self.workspaces.iter().find(|w| w.variant_id == variant_id)
    }

    pub fn promoted_workspace(&self) -> Option<&WorkspaceRecord> {
        self.workspaces
            .iter()
            .find(|w| w.state == WorkspaceState::Promoted)
    }

    /// Recompute the run-level rollups from the workspace records and bump
    /// the update timestamp. Called by the store on every persist.
    pub fn refresh(&mut self) {
        self.status = rollup_status(&self.workspaces);
        self.phases = rollup_phases(&self.workspaces);
        self.updated_at = Utc::now();
    }
}

/// Overall run status from the per-workspace pipelines. A promotion settles
/// the run outright. While any pipeline is still active the run reports the
/// least-advanced active stage; once all are terminal, one finished pipeline
/// is enough to call the run done.
fn rollup_status(workspaces: &[WorkspaceRecord]) -> RunStatus {
    if workspaces
        .iter()
        .any(|w| w.state == WorkspaceState::Promoted)
    {
        return RunStatus::Done;
    }

    let pipelines: Vec<RunStatus> = workspaces
        .iter()
        .filter(|w| w.state != WorkspaceState::Destroyed)
        .map(|w| w.pipeline_status)
        .collect();

    if pipelines.is_empty() {
        return RunStatus::Pending;
    }

    if let Some(least) = pipelines
        .iter()
        .filter(|s| !s.is_terminal())
        .min_by_key(|s| s.progress())
    {
        return *least;
    }

    if pipelines.contains(&RunStatus::Done) {
        RunStatus::Done
    } else if pipelines.iter().all(|s| *s == RunStatus::Aborted) {
        RunStatus::Aborted
    } else {
        RunStatus::Failed
    }
}

/// Per-phase rollup across workspaces: running dominates, then failed;
/// succeeded only when every attempt has succeeded. The artifact shown is
/// the lowest variant's successful output.
fn rollup_phases(workspaces: &[WorkspaceRecord]) -> Vec<PhaseRecord> {
    Phase::ALL
        .iter()
        .map(|phase| {
            let mut rollup = PhaseRecord::pending(*phase);
            let records: Vec<&PhaseRecord> = workspaces
                .iter()
                .filter(|w| w.state != WorkspaceState::Destroyed)
                .filter_map(|w| w.phase_record(*phase))
                .collect();

            if records.is_empty() {
                return rollup;
            }

            rollup.status = if records.iter().any(|r| r.status == PhaseStatus::Running) {
                PhaseStatus::Running
            } else if records.iter().any(|r| r.status == PhaseStatus::Failed) {
                PhaseStatus::Failed
            } else if records.iter().all(|r| r.status == PhaseStatus::Succeeded) {
                PhaseStatus::Succeeded
            } else {
                PhaseStatus::Pending
            };
            rollup.output_artifact = records
                .iter()
                .find(|r| r.status == PhaseStatus::Succeeded)
                .and_then(|r| r.output_artifact.clone());
            rollup.started_at = records.iter().filter_map(|r| r.started_at).min();
            rollup.finished_at = records.iter().filter_map(|r| r.finished_at).max();
            rollup
        })
        .collect()
}

/// Canonical workspace id: `<run_id>-v<variant_id>`.
pub fn workspace_id(run_id: &str, variant_id: u32) -> String {
    format!("{}-v{}", run_id, variant_id)
}

/// Split a workspace id back into run id and variant id. None when the id
/// does not end in a `-v<digits>` suffix.
pub fn parse_workspace_id(id: &str) -> Option<(&str, u32)> {
    let split = id.rfind("-v")?;
    let (run_id, suffix) = (&id[..split], &id[split + 2..]);
    if run_id.is_empty() || suffix.is_empty() {
        return None;
    }
    let variant_id = suffix.parse().ok()?;
    Some((run_id, variant_id))
}
