//! Diff and test measurements for one workspace.
//!
//! `sample` computes files and lines changed versus the run's base branch
//! and runs the configured test command inside the replica, everything
//! through the command seam. Sampling is read-only with respect to tracked
//! content: a fingerprint is taken before and after, and a mismatch fails
//! the sample.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::RelayError;
use crate::exec::{CommandRequest, CommandRunner};
use crate::store::{MetricSnapshot, TestStatus, WorkspaceRecord};
use crate::workspace::{Git, lock, workspace_lock_path};

pub struct MetricsCollector {
    git: Git,
    runner: Arc<dyn CommandRunner>,
    test_command: Option<Vec<String>>,
    test_timeout: Duration,
}

impl MetricsCollector {
    pub fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            git: Git::new(runner.clone()),
            runner,
            test_command: config.test_command(),
            test_timeout: config.test_timeout(),
        }
    }

    /// Measure one workspace. Holds the workspace lock shared so destroy
    /// cannot pull files out from under the sample; safely repeatable.
    pub async fn sample(
        &self,
        workspace: &WorkspaceRecord,
        base_branch: &str,
    ) -> Result<MetricSnapshot, RelayError> {
        let replica = workspace.path.as_path();
        let lock_path = workspace_lock_path(replica);
        let Some(_guard) = lock::try_lock_shared(&lock_path)? else {
            return Err(RelayError::WorkspaceBusy {
                run_id: workspace.run_id.clone(),
                workspace_id: workspace.id.clone(),
            });
        };

        let before = self.git.content_fingerprint(replica).await?;

        let stat = self.git.diff_stat(replica, base_branch).await?;
        let last = self.git.last_commit(replica).await?;
        let (test_status, test_reason) = self.run_tests(replica).await?;

        let after = self.git.content_fingerprint(replica).await?;
        if before != after {
            return Err(RelayError::validation(
                "sample",
                format!("tracked content of {} changed during sampling", workspace.id),
            ));
        }

        let (last_commit_at, last_commit_subject) = match last {
            Some((when, subject)) => (Some(when), Some(subject)),
            None => (None, None),
        };
        debug!(
            workspace_id = %workspace.id,
            files = stat.files_changed,
            test = %test_status,
            "sampled workspace"
        );
        Ok(MetricSnapshot {
            workspace_id: workspace.id.clone(),
            files_changed: stat.files_changed,
            lines_added: stat.lines_added,
            lines_removed: stat.lines_removed,
            test_status,
            test_reason,
            last_commit_subject,
            last_commit_at,
            sampled_at: Utc::now(),
        })
    }

    /// Run the configured test command. No command means not applicable.
    /// Nonzero exit and timeout both map to fail; timeout is recorded as
    /// the reason rather than failing the sampling call.
    async fn run_tests(&self, replica: &Path) -> Result<(TestStatus, Option<String>), RelayError> {
        let Some(command) = &self.test_command else {
            return Ok((TestStatus::NotApplicable, None));
        };
        let request = CommandRequest::new(command, replica)?.with_timeout(Some(self.test_timeout));
        let output = self.runner.run(&request).await?;
        if output.timed_out {
            warn!(replica = %replica.display(), "test command timed out");
            return Ok((TestStatus::Fail, Some("timeout".to_string())));
        }
        if output.success() {
            Ok((TestStatus::Pass, None))
        } else {
            Ok((
                TestStatus::Fail,
                Some(format!("exit code {}", output.exit_code)),
            ))
        }
    }
}
