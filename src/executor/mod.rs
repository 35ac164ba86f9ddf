//! Drives one workspace's pipeline through its phase state machine.
//!
//! Each phase delegates to an external tool through the command seam; the
//! executor validates the input artifact reference, records transitions in
//! the run store, and hands the tool's output artifact to the next phase.
//! Failures persist as FAILED with diagnostics and are never retried
//! automatically; resumption is an explicit re-entry into the same phase
//! with the same input.

pub mod tool;

pub use tool::{ToolSet, ToolVerdict};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use crate::errors::RelayError;
use crate::exec::CommandRunner;
use crate::phase::{Phase, PhaseStatus, RunStatus};
use crate::store::{PhaseRecord, RunStore, WorkflowRun, WorkspaceRecord};
use crate::workspace::{abort_marker_path, lock, workspace_lock_path};

/// One run record shared by every in-process pipeline working on it, so
/// parallel variants never clobber each other's persisted state.
pub type SharedRun = Arc<Mutex<WorkflowRun>>;

const ABORT_POLL: Duration = Duration::from_millis(200);

/// Cooperative whole-workspace cancellation. The pipeline and the abort
/// path hold clones of the same channel; partial-phase cancellation does
/// not exist.
#[derive(Clone)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    async fn aborted(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Input artifact for re-entering the workspace's next phase: the input it
/// already ran with if it has one, otherwise the previous phase's output.
/// None when the pipeline is complete or has not produced anything yet.
pub fn resume_input(workspace: &WorkspaceRecord) -> Option<PathBuf> {
    let next = workspace.next_phase()?;
    if let Some(record) = workspace.phase_record(next)
        && let Some(input) = &record.input_artifact
    {
        return Some(input.clone());
    }
    Phase::ALL
        .iter()
        .take_while(|p| **p != next)
        .last()
        .and_then(|prev| workspace.phase_record(*prev))
        .and_then(|r| r.output_artifact.clone())
}

enum PhaseOutcome {
    Succeeded(PathBuf),
    Failed(String),
    Aborted,
}

pub struct PhaseExecutor {
    store: RunStore,
    runner: Arc<dyn CommandRunner>,
    tools: ToolSet,
}

impl PhaseExecutor {
    pub fn new(store: RunStore, runner: Arc<dyn CommandRunner>, tools: ToolSet) -> Self {
        Self {
            store,
            runner,
            tools,
        }
    }

    /// Execute the workspace's next pending phase by delegating to its
    /// external tool with a validated input artifact reference. Transitions
    /// are persisted before and after the tool runs; the workspace lock is
    /// held for the duration so destroy fails busy instead of racing.
    pub async fn advance(
        &self,
        run: &SharedRun,
        workspace_id: &str,
        input: &Path,
        signal: &AbortSignal,
    ) -> Result<PhaseRecord, RelayError> {
        let (run_id, phase, replica) = {
            let guard = run.lock().await;
            let ws = guard.workspace(workspace_id).ok_or_else(|| {
                RelayError::WorkspaceNotFound {
                    run_id: guard.id.clone(),
                    workspace_id: workspace_id.to_string(),
                }
            })?;
            let phase = ws.next_phase().ok_or_else(|| {
                RelayError::validation(
                    "pipeline",
                    format!("{} already completed every phase", workspace_id),
                )
            })?;
            (guard.id.clone(), phase, ws.path.clone())
        };

        if !input.exists() {
            return Err(RelayError::validation(
                "input artifact",
                format!("{} does not exist", input.display()),
            ));
        }
        let request = self.tools.request(phase, &replica, input)?;

        let lock_path = workspace_lock_path(&replica);
        let Some(_ws_lock) = lock::try_lock_exclusive(&lock_path)? else {
            return Err(RelayError::WorkspaceBusy {
                run_id,
                workspace_id: workspace_id.to_string(),
            });
        };

        self.mark_running(run, workspace_id, phase, input).await?;
        info!(workspace_id, phase = %phase, input = %input.display(), "phase started");

        let marker = abort_marker_path(&replica);
        let outcome = tokio::select! {
            result = self.runner.run(&request) => Some(result),
            _ = wait_for_abort(signal, &marker) => None,
        };

        match outcome {
            None => {
                warn!(workspace_id, phase = %phase, "phase aborted");
                self.finish(run, workspace_id, phase, PhaseOutcome::Aborted)
                    .await?;
                Err(RelayError::PhaseFailure {
                    run_id,
                    workspace_id: workspace_id.to_string(),
                    phase,
                    diagnostics: "aborted".to_string(),
                })
            }
            Some(Err(err)) => {
                warn!(workspace_id, phase = %phase, "phase tool failed to launch");
                let diagnostics = err.to_string();
                self.finish(
                    run,
                    workspace_id,
                    phase,
                    PhaseOutcome::Failed(diagnostics.clone()),
                )
                .await?;
                Err(RelayError::PhaseFailure {
                    run_id,
                    workspace_id: workspace_id.to_string(),
                    phase,
                    diagnostics,
                })
            }
            Some(Ok(output)) => match tool::interpret(&output, &replica) {
                ToolVerdict::Output(artifact) => {
                    let record = self
                        .finish(
                            run,
                            workspace_id,
                            phase,
                            PhaseOutcome::Succeeded(artifact.clone()),
                        )
                        .await?;
                    info!(workspace_id, phase = %phase, artifact = %artifact.display(), "phase succeeded");
                    Ok(record)
                }
                ToolVerdict::Failed(diagnostics) => {
                    warn!(workspace_id, phase = %phase, "phase failed");
                    self.finish(
                        run,
                        workspace_id,
                        phase,
                        PhaseOutcome::Failed(diagnostics.clone()),
                    )
                    .await?;
                    Err(RelayError::PhaseFailure {
                        run_id,
                        workspace_id: workspace_id.to_string(),
                        phase,
                        diagnostics,
                    })
                }
                ToolVerdict::TimedOut => {
                    warn!(workspace_id, phase = %phase, "phase timed out");
                    self.finish(
                        run,
                        workspace_id,
                        phase,
                        PhaseOutcome::Failed("timeout".to_string()),
                    )
                    .await?;
                    Err(RelayError::Timeout {
                        run_id,
                        workspace_id: workspace_id.to_string(),
                        phase,
                        limit_secs: self.tools.timeout().map(|d| d.as_secs()).unwrap_or(0),
                    })
                }
            },
        }
    }

    /// Drive every remaining phase in order, feeding each phase's output
    /// artifact into the next. Stops at the first failure or abort.
    pub async fn run_pipeline(
        &self,
        run: SharedRun,
        workspace_id: &str,
        first_input: PathBuf,
        signal: AbortSignal,
    ) -> Result<(), RelayError> {
        let mut input = first_input;
        loop {
            let (run_id, next, marker) = {
                let guard = run.lock().await;
                let ws = guard.workspace(workspace_id).ok_or_else(|| {
                    RelayError::WorkspaceNotFound {
                        run_id: guard.id.clone(),
                        workspace_id: workspace_id.to_string(),
                    }
                })?;
                (guard.id.clone(), ws.next_phase(), abort_marker_path(&ws.path))
            };
            let Some(phase) = next else {
                info!(workspace_id, "pipeline complete");
                return Ok(());
            };

            if signal.is_aborted() || marker.exists() {
                self.finish(&run, workspace_id, phase, PhaseOutcome::Aborted)
                    .await?;
                return Err(RelayError::PhaseFailure {
                    run_id,
                    workspace_id: workspace_id.to_string(),
                    phase,
                    diagnostics: "aborted".to_string(),
                });
            }

            let record = self.advance(&run, workspace_id, &input, &signal).await?;
            input = record.output_artifact.ok_or_else(|| {
                RelayError::validation(
                    "phase result",
                    format!("{} succeeded without an output artifact", phase),
                )
            })?;
        }
    }

    async fn mark_running(
        &self,
        run: &SharedRun,
        workspace_id: &str,
        phase: Phase,
        input: &Path,
    ) -> Result<(), RelayError> {
        let mut guard = run.lock().await;
        let run_id = guard.id.clone();
        let Some(ws) = guard.workspace_mut(workspace_id) else {
            return Err(RelayError::WorkspaceNotFound {
                run_id,
                workspace_id: workspace_id.to_string(),
            });
        };
        ws.pipeline_status = phase.active_status();
        if let Some(record) = ws.phase_record_mut(phase) {
            record.status = PhaseStatus::Running;
            record.input_artifact = Some(input.to_path_buf());
            record.output_artifact = None;
            record.failure_reason = None;
            record.started_at = Some(Utc::now());
            record.finished_at = None;
        }
        self.persist_workspace(&mut guard, workspace_id)
    }

    async fn finish(
        &self,
        run: &SharedRun,
        workspace_id: &str,
        phase: Phase,
        outcome: PhaseOutcome,
    ) -> Result<PhaseRecord, RelayError> {
        let mut guard = run.lock().await;
        let run_id = guard.id.clone();
        let Some(ws) = guard.workspace_mut(workspace_id) else {
            return Err(RelayError::WorkspaceNotFound {
                run_id,
                workspace_id: workspace_id.to_string(),
            });
        };
        let now = Utc::now();
        match outcome {
            PhaseOutcome::Succeeded(artifact) => {
                if let Some(record) = ws.phase_record_mut(phase) {
                    record.status = PhaseStatus::Succeeded;
                    record.output_artifact = Some(artifact);
                    record.failure_reason = None;
                    record.finished_at = Some(now);
                }
                if phase.next().is_none() {
                    ws.pipeline_status = RunStatus::Done;
                }
            }
            PhaseOutcome::Failed(reason) => {
                if let Some(record) = ws.phase_record_mut(phase) {
                    record.status = PhaseStatus::Failed;
                    record.failure_reason = Some(reason);
                    record.finished_at = Some(now);
                }
                ws.pipeline_status = RunStatus::Failed;
            }
            PhaseOutcome::Aborted => {
                if let Some(record) = ws.phase_record_mut(phase) {
                    record.status = PhaseStatus::Failed;
                    record.failure_reason = Some("aborted".to_string());
                    record.finished_at = Some(now);
                }
                ws.pipeline_status = RunStatus::Aborted;
            }
        }
        let record = ws
            .phase_record(phase)
            .cloned()
            .unwrap_or_else(|| PhaseRecord::pending(phase));
        self.persist_workspace(&mut guard, workspace_id)?;
        Ok(record)
    }

    /// Write this workspace's state through a fresh load of the record.
    /// Another process may have rewritten the run since this copy was
    /// loaded (`relay promote` in particular); grafting onto the reload
    /// keeps those writes instead of reverting them.
    fn persist_workspace(
        &self,
        guard: &mut WorkflowRun,
        workspace_id: &str,
    ) -> Result<(), RelayError> {
        let Some(ws) = guard.workspace(workspace_id).cloned() else {
            return Err(RelayError::WorkspaceNotFound {
                run_id: guard.id.clone(),
                workspace_id: workspace_id.to_string(),
            });
        };
        let mut fresh = self.store.load(&guard.id)?;
        match fresh.workspace_mut(workspace_id) {
            Some(slot) => *slot = ws,
            None => fresh.workspaces.push(ws),
        }
        self.store.persist(&mut fresh)?;
        *guard = fresh;
        Ok(())
    }
}

async fn wait_for_abort(signal: &AbortSignal, marker: &Path) {
    let mut tick = tokio::time::interval(ABORT_POLL);
    loop {
        tokio::select! {
            _ = signal.aborted() => return,
            _ = tick.tick() => {
                if marker.exists() {
                    return;
                }
            }
        }
    }
}
