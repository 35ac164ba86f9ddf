//! Ranking and reporting across a run's workspaces.
//!
//! The comparator turns per-workspace metric snapshots into a ranked
//! table: passing tests beat failing ones, fewer changed lines beat more,
//! and a more recent tip breaks what remains. Rendering is a pure function
//! of the snapshots, so a re-run over unchanged workspaces prints the
//! same report.

use std::cmp::Ordering;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::Config;
use crate::errors::RelayError;
use crate::exec::CommandRunner;
use crate::metrics::MetricsCollector;
use crate::store::{MetricSnapshot, RunStore, TestStatus, WorkspaceState};

pub struct Comparator {
    store: RunStore,
    metrics: MetricsCollector,
    freshness: Duration,
}

impl Comparator {
    pub fn new(config: &Config, store: RunStore, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            store,
            metrics: MetricsCollector::new(config, runner),
            freshness: config.freshness_window(),
        }
    }

    /// Compare every live workspace of a run. Snapshots sampled within the
    /// freshness window are reused from the record; anything older is
    /// re-sampled and the refreshed snapshot written back.
    pub async fn report(&self, run_id: &str) -> Result<ComparisonReport, RelayError> {
        let run = self.store.load(run_id)?;
        let base = run.integration_branch.clone();

        let mut snapshots = Vec::new();
        let mut resampled = Vec::new();
        for workspace in &run.workspaces {
            if workspace.state == WorkspaceState::Destroyed {
                continue;
            }
            if let Some(cached) = &workspace.snapshot
                && cached.is_fresh(self.freshness)
            {
                debug!(workspace_id = %workspace.id, "reusing cached snapshot");
                snapshots.push(cached.clone());
                continue;
            }
            let snapshot = self.metrics.sample(workspace, &base).await?;
            resampled.push((workspace.id.clone(), snapshot.clone()));
            snapshots.push(snapshot);
        }
        self.write_back(run_id, resampled)?;

        Ok(ComparisonReport {
            run_id: run.id,
            task: run.task,
            integration_branch: run.integration_branch,
            ranked: rank(snapshots),
        })
    }

    /// Cache refreshed snapshots onto a reload of the record. Sampling
    /// takes long enough that another process may have rewritten the run
    /// since this comparison loaded it.
    fn write_back(
        &self,
        run_id: &str,
        resampled: Vec<(String, MetricSnapshot)>,
    ) -> Result<(), RelayError> {
        if resampled.is_empty() {
            return Ok(());
        }
        let mut fresh = self.store.load(run_id)?;
        for (workspace_id, snapshot) in resampled {
            if let Some(ws) = fresh.workspace_mut(&workspace_id) {
                ws.snapshot = Some(snapshot);
            }
        }
        self.store.persist(&mut fresh)
    }
}

/// Order snapshots best-first: test status, then fewest changed lines,
/// then the more recently committed tip. Any remaining tie goes to the
/// lexically lowest workspace id, so the order is total.
pub fn rank(mut snapshots: Vec<MetricSnapshot>) -> Vec<MetricSnapshot> {
    snapshots.sort_by(|a, b| {
        a.test_status
            .precedence()
            .cmp(&b.test_status.precedence())
            .then_with(|| a.total_changed_lines().cmp(&b.total_changed_lines()))
            .then_with(|| cmp_recency(a, b))
            .then_with(|| a.workspace_id.cmp(&b.workspace_id))
    });
    snapshots
}

// More recent tips rank first; a workspace with no commits ranks last.
fn cmp_recency(a: &MetricSnapshot, b: &MetricSnapshot) -> Ordering {
    match (a.last_commit_at, b.last_commit_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub struct ComparisonReport {
    pub run_id: String,
    pub task: String,
    pub integration_branch: String,
    pub ranked: Vec<MetricSnapshot>,
}

impl ComparisonReport {
    /// The top-ranked workspace, if the run has any left to compare.
    pub fn recommended(&self) -> Option<&MetricSnapshot> {
        self.ranked.first()
    }

    pub fn any_passing(&self) -> bool {
        self.ranked
            .iter()
            .any(|s| s.test_status == TestStatus::Pass)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Comparison for run {} ({})", self.run_id, self.task);
        let _ = writeln!(out, "Base branch: {}", self.integration_branch);
        let _ = writeln!(out);

        if self.ranked.is_empty() {
            let _ = writeln!(out, "No workspaces to compare.");
            return out;
        }

        let _ = writeln!(
            out,
            "{:<6} {:<28} {:<22} {:<12} Last commit",
            "Rank", "Workspace", "Tests", "Changed"
        );
        let _ = writeln!(
            out,
            "{:<6} {:<28} {:<22} {:<12} -----------",
            "----", "---------------------------", "-----", "-------"
        );
        for (idx, snap) in self.ranked.iter().enumerate() {
            let _ = writeln!(
                out,
                "{:<6} {:<28} {:<22} {:<12} {}",
                idx + 1,
                snap.workspace_id,
                test_cell(snap),
                format!("+{}/-{}", snap.lines_added, snap.lines_removed),
                snap.last_commit_subject.as_deref().unwrap_or("-"),
            );
        }

        let _ = writeln!(out);
        for snap in &self.ranked {
            let _ = writeln!(
                out,
                "{}: {} files changed, {} insertions(+), {} deletions(-)",
                snap.workspace_id, snap.files_changed, snap.lines_added, snap.lines_removed
            );
        }

        let _ = writeln!(out);
        match self.recommended() {
            Some(best) => {
                let _ = writeln!(out, "Recommended: {}", best.workspace_id);
            }
            None => {
                let _ = writeln!(out, "No workspaces to compare.");
            }
        }
        out
    }
}

fn test_cell(snap: &MetricSnapshot) -> String {
    match &snap.test_reason {
        Some(reason) => format!("{} ({})", snap.test_status, reason),
        None => snap.test_status.to_string(),
    }
}
