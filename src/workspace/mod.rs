//! Workspace lifecycle: spawn, destroy, promote.
//!
//! Each parallel attempt gets a dedicated branch plus a filesystem replica
//! of the project, so attempts share nothing mutable. Promotion merges one
//! chosen replica back into the integration branch, at most once per run.

pub mod git;
pub mod lock;

pub use git::{DiffStat, Git, MergeOutcome};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::Config;
use crate::errors::RelayError;
use crate::exec::CommandRunner;
use crate::store::{RunStore, WorkflowRun, WorkspaceRecord, WorkspaceState, parse_workspace_id};
use crate::util::slugify;

/// Branch a variant works on, derived from the task so parallel attempts
/// read as `feature-<task>-1`, `feature-<task>-2`, ...
pub fn branch_name(task: &str, variant_id: u32) -> String {
    format!("feature-{}-{}", slugify(task, 48), variant_id)
}

/// Advisory lock file guarding a replica, kept beside it so the replica's
/// own contents stay untouched.
pub fn workspace_lock_path(replica: &Path) -> PathBuf {
    replica.with_extension("lock")
}

/// Marker requesting abort of the replica's in-flight pipeline.
pub fn abort_marker_path(replica: &Path) -> PathBuf {
    replica.with_extension("abort")
}

pub struct WorkspaceManager {
    project_dir: PathBuf,
    work_dir: PathBuf,
    integration_branch: String,
    store: RunStore,
    git: Git,
}

impl WorkspaceManager {
    pub fn new(config: &Config, store: RunStore, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            project_dir: config.project_dir.clone(),
            work_dir: config.work_dir.clone(),
            integration_branch: config.integration_branch().to_string(),
            store,
            git: Git::new(runner),
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.work_dir.join(run_id)
    }

    pub fn replica_dir(&self, run_id: &str, variant_id: u32) -> PathBuf {
        self.run_dir(run_id).join(format!("v{}", variant_id))
    }

    /// Create an isolated workspace for `variant_id`: a replica copy of the
    /// project with a dedicated branch checked out inside it.
    pub async fn spawn(
        &self,
        run: &mut WorkflowRun,
        variant_id: u32,
    ) -> Result<WorkspaceRecord, RelayError> {
        if run.variant(variant_id).is_some() {
            return Err(RelayError::WorkspaceConflict {
                run_id: run.id.clone(),
                variant_id,
            });
        }
        let replica = self.replica_dir(&run.id, variant_id);
        if replica.exists() {
            return Err(RelayError::WorkspaceConflict {
                run_id: run.id.clone(),
                variant_id,
            });
        }

        let copied = copy_replica(&self.project_dir, &replica)?;
        debug!(files = copied, replica = %replica.display(), "copied project replica");

        let branch = branch_name(&run.task, variant_id);
        self.git.checkout_new_branch(&replica, &branch).await?;

        let record = WorkspaceRecord::new(&run.id, variant_id, branch, replica);
        run.workspaces.push(record.clone());
        self.store.persist(run)?;
        info!(workspace_id = %record.id, branch = %record.branch, "spawned workspace");
        Ok(record)
    }

    /// Remove a workspace's files and its branch (which lives inside the
    /// replica's repository). Fails fast with WorkspaceBusy while a phase
    /// or sample holds the workspace lock, leaving files intact.
    pub fn destroy(&self, run: &mut WorkflowRun, workspace_id: &str) -> Result<(), RelayError> {
        let (state, replica) = match run.workspace(workspace_id) {
            Some(ws) => (ws.state, ws.path.clone()),
            None => {
                return Err(RelayError::WorkspaceNotFound {
                    run_id: run.id.clone(),
                    workspace_id: workspace_id.to_string(),
                });
            }
        };
        match state {
            WorkspaceState::Destroyed => return Ok(()),
            WorkspaceState::Promoted => {
                return Err(RelayError::validation(
                    "workspace",
                    format!("{} is promoted and cannot be destroyed", workspace_id),
                ));
            }
            WorkspaceState::Active => {}
        }

        let lock_path = workspace_lock_path(&replica);
        let Some(guard) = lock::try_lock_exclusive(&lock_path)? else {
            return Err(RelayError::WorkspaceBusy {
                run_id: run.id.clone(),
                workspace_id: workspace_id.to_string(),
            });
        };

        if replica.exists() {
            std::fs::remove_dir_all(&replica)
                .map_err(|source| RelayError::io(&replica, source))?;
        }
        let _ = std::fs::remove_file(abort_marker_path(&replica));

        drop(guard);
        let _ = std::fs::remove_file(&lock_path);

        // Record it on a reload; pipelines of sibling workspaces persist
        // concurrently from their own copies of the run.
        let mut fresh = self.store.load(&run.id)?;
        if let Some(ws) = fresh.workspace_mut(workspace_id) {
            ws.state = WorkspaceState::Destroyed;
            ws.snapshot = None;
        }
        self.store.persist(&mut fresh)?;
        *run = fresh;
        info!(workspace_id, "destroyed workspace");
        Ok(())
    }

    /// Merge the chosen workspace into the integration branch. Promotion
    /// is serialized per run on an advisory lock; the record is reloaded
    /// after acquisition so a racing winner is always observed. Conflicts
    /// leave both run and workspace state unchanged.
    pub async fn promote(&self, workspace_id: &str) -> Result<WorkflowRun, RelayError> {
        let (run_id, _) = parse_workspace_id(workspace_id).ok_or_else(|| {
            RelayError::validation(
                "workspace id",
                format!("{} is not of the form <run>-v<N>", workspace_id),
            )
        })?;

        let promote_lock = self.run_dir(run_id).join("promote.lock");
        let _guard = lock::lock_exclusive_async(promote_lock).await?;

        let mut run = self.store.load(run_id)?;
        if let Some(winner) = run.promoted_workspace() {
            return Err(RelayError::AlreadyPromoted {
                run_id: run.id.clone(),
                workspace_id: winner.id.clone(),
            });
        }
        let (branch, replica) = match run.workspace(workspace_id) {
            Some(ws) if ws.state == WorkspaceState::Destroyed => {
                return Err(RelayError::validation(
                    "workspace",
                    format!("{} is destroyed and cannot be promoted", workspace_id),
                ));
            }
            Some(ws) => (ws.branch.clone(), ws.path.clone()),
            None => {
                return Err(RelayError::WorkspaceNotFound {
                    run_id: run.id.clone(),
                    workspace_id: workspace_id.to_string(),
                });
            }
        };

        self.git
            .fetch_branch(&self.project_dir, &replica, &branch)
            .await?;
        self.git
            .checkout(&self.project_dir, &self.integration_branch)
            .await?;
        let message = format!("Merge {} into {}", branch, self.integration_branch);
        match self
            .git
            .merge(&self.project_dir, "FETCH_HEAD", &message)
            .await?
        {
            MergeOutcome::Clean => {}
            MergeOutcome::Conflicted(paths) => {
                return Err(RelayError::MergeConflict {
                    run_id: run.id.clone(),
                    workspace_id: workspace_id.to_string(),
                    branch: self.integration_branch.clone(),
                    paths,
                });
            }
        }

        if let Some(ws) = run.workspace_mut(workspace_id) {
            ws.state = WorkspaceState::Promoted;
            ws.promoted_at = Some(Utc::now());
        }
        self.store.persist(&mut run)?;
        info!(workspace_id, branch = %self.integration_branch, "promoted workspace");
        Ok(run)
    }
}

/// Copy the project into a replica directory, skipping relay's own state
/// directory. Returns the number of files copied.
fn copy_replica(src: &Path, dest: &Path) -> Result<u64, RelayError> {
    let mut copied = 0;
    let walk = WalkDir::new(src)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".relay");
    for entry in walk {
        let entry = entry.map_err(|err| {
            let path = err
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| src.to_path_buf());
            match err.into_io_error() {
                Some(io) => RelayError::io(path, io),
                None => RelayError::io(path, std::io::Error::other("walk failed")),
            }
        })?;
        let rel = entry.path().strip_prefix(src).map_err(|_| {
            RelayError::validation(
                "workspace copy",
                format!("{} escapes {}", entry.path().display(), src.display()),
            )
        })?;
        let target = if rel.as_os_str().is_empty() {
            dest.to_path_buf()
        } else {
            dest.join(rel)
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(|source| RelayError::io(&target, source))?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|source| RelayError::io(parent, source))?;
            }
            std::fs::copy(entry.path(), &target)
                .map_err(|source| RelayError::io(&target, source))?;
            copied += 1;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            {
                let link = std::fs::read_link(entry.path())
                    .map_err(|source| RelayError::io(entry.path(), source))?;
                std::os::unix::fs::symlink(link, &target)
                    .map_err(|source| RelayError::io(&target, source))?;
            }
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use crate::phase::RunStatus;
    use std::fs;
    use tempfile::tempdir;

    struct Fixture {
        _root: tempfile::TempDir,
        manager: WorkspaceManager,
        store: RunStore,
        runner: Arc<FakeRunner>,
    }

    fn fixture() -> Fixture {
        let root = tempdir().unwrap();
        fs::write(root.path().join("app.rs"), "fn main() {}").unwrap();
        fs::create_dir_all(root.path().join("src/deep")).unwrap();
        fs::write(root.path().join("src/deep/lib.rs"), "pub fn f() {}").unwrap();
        fs::create_dir_all(root.path().join(".relay/runs")).unwrap();
        fs::write(root.path().join(".relay/private.json"), "{}").unwrap();

        let config = Config::new(root.path().to_path_buf(), None, false).unwrap();
        config.ensure_directories().unwrap();
        let store = RunStore::new(config.runs_dir.clone());
        let runner = Arc::new(FakeRunner::new());
        let manager = WorkspaceManager::new(&config, store.clone(), runner.clone());
        Fixture {
            _root: root,
            manager,
            store,
            runner,
        }
    }

    fn seeded_run(fx: &Fixture, id: &str, task: &str, parallelism: u32) -> WorkflowRun {
        let mut run = WorkflowRun::new(
            id.to_string(),
            task.to_string(),
            Vec::new(),
            parallelism,
            "main".to_string(),
        );
        fx.store.persist(&mut run).unwrap();
        run
    }

    #[test]
    fn branch_names_follow_the_task_slug() {
        assert_eq!(branch_name("add dark mode", 1), "feature-add-dark-mode-1");
        assert_eq!(branch_name("Add Dark Mode!", 3), "feature-add-dark-mode-3");
    }

    #[tokio::test]
    async fn spawn_copies_the_project_and_checks_out_a_branch() {
        let fx = fixture();
        let mut run = seeded_run(&fx, "dark-1a2b3c4d", "add dark mode", 3);
        fx.runner.push_ok("Switched to a new branch");

        let record = fx.manager.spawn(&mut run, 1).await.unwrap();

        assert_eq!(record.id, "dark-1a2b3c4d-v1");
        assert_eq!(record.branch, "feature-add-dark-mode-1");
        assert!(record.path.join("app.rs").exists());
        assert!(record.path.join("src/deep/lib.rs").exists());
        assert!(!record.path.join(".relay").exists());
        assert_eq!(
            fx.runner.invocations(),
            vec!["git checkout -b feature-add-dark-mode-1".to_string()]
        );

        let loaded = fx.store.load("dark-1a2b3c4d").unwrap();
        assert_eq!(loaded.workspaces.len(), 1);
        assert_eq!(loaded.workspaces[0].variant_id, 1);
    }

    #[tokio::test]
    async fn spawn_rejects_duplicate_variants() {
        let fx = fixture();
        let mut run = seeded_run(&fx, "dup-run", "some task", 2);
        fx.runner.push_ok("");
        fx.manager.spawn(&mut run, 1).await.unwrap();

        let err = fx.manager.spawn(&mut run, 1).await.unwrap_err();
        match err {
            RelayError::WorkspaceConflict { run_id, variant_id } => {
                assert_eq!(run_id, "dup-run");
                assert_eq!(variant_id, 1);
            }
            other => panic!("Expected WorkspaceConflict, got {other:?}"),
        }
        // The duplicate never reached git.
        assert_eq!(fx.runner.invocations().len(), 1);
    }

    #[tokio::test]
    async fn spawned_variants_are_distinct_across_parallelism() {
        let fx = fixture();
        let mut run = seeded_run(&fx, "par-run", "add dark mode", 3);
        for variant in 1..=3 {
            fx.runner.push_ok("");
            fx.manager.spawn(&mut run, variant).await.unwrap();
        }

        let loaded = fx.store.load("par-run").unwrap();
        let mut variants: Vec<u32> = loaded.workspaces.iter().map(|w| w.variant_id).collect();
        variants.sort_unstable();
        assert_eq!(variants, vec![1, 2, 3]);
        let branches: Vec<&str> = loaded.workspaces.iter().map(|w| w.branch.as_str()).collect();
        assert!(branches.contains(&"feature-add-dark-mode-2"));
    }

    #[tokio::test]
    async fn destroy_fails_busy_while_lock_held_and_leaves_files() {
        let fx = fixture();
        let mut run = seeded_run(&fx, "busy-run", "task", 1);
        fx.runner.push_ok("");
        let record = fx.manager.spawn(&mut run, 1).await.unwrap();

        let held = lock::lock_exclusive(&workspace_lock_path(&record.path)).unwrap();
        let err = fx.manager.destroy(&mut run, &record.id).unwrap_err();
        assert!(matches!(err, RelayError::WorkspaceBusy { .. }));
        assert!(record.path.join("app.rs").exists());

        drop(held);
        fx.manager.destroy(&mut run, &record.id).unwrap();
        assert!(!record.path.exists());
        let loaded = fx.store.load("busy-run").unwrap();
        assert_eq!(loaded.workspaces[0].state, WorkspaceState::Destroyed);

        // Destroy is idempotent once the workspace is gone.
        fx.manager.destroy(&mut run, &record.id).unwrap();
    }

    #[tokio::test]
    async fn destroy_does_not_revert_concurrent_pipeline_progress() {
        use crate::phase::{Phase, PhaseStatus};

        let fx = fixture();
        let mut run = seeded_run(&fx, "graft-run", "task", 2);
        fx.runner.push_ok("");
        fx.runner.push_ok("");
        fx.manager.spawn(&mut run, 1).await.unwrap();
        fx.manager.spawn(&mut run, 2).await.unwrap();

        // v2's pipeline finishes a phase in another process while this
        // copy of the run is held.
        let mut external = fx.store.load("graft-run").unwrap();
        external
            .workspace_mut("graft-run-v2")
            .unwrap()
            .phase_record_mut(Phase::Scout)
            .unwrap()
            .status = PhaseStatus::Succeeded;
        fx.store.persist(&mut external).unwrap();

        fx.manager.destroy(&mut run, "graft-run-v1").unwrap();

        let loaded = fx.store.load("graft-run").unwrap();
        assert_eq!(loaded.workspaces[0].state, WorkspaceState::Destroyed);
        assert_eq!(
            loaded
                .workspace("graft-run-v2")
                .unwrap()
                .phase_record(Phase::Scout)
                .unwrap()
                .status,
            PhaseStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn destroy_refuses_promoted_and_unknown_workspaces() {
        let fx = fixture();
        let mut run = seeded_run(&fx, "guard-run", "task", 1);
        fx.runner.push_ok("");
        let record = fx.manager.spawn(&mut run, 1).await.unwrap();

        run.workspace_mut(&record.id).unwrap().state = WorkspaceState::Promoted;
        assert!(matches!(
            fx.manager.destroy(&mut run, &record.id),
            Err(RelayError::Validation { .. })
        ));

        assert!(matches!(
            fx.manager.destroy(&mut run, "guard-run-v9"),
            Err(RelayError::WorkspaceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn promote_merges_once_then_reports_already_promoted() {
        let fx = fixture();
        let mut run = seeded_run(&fx, "win-run", "task", 2);
        fx.runner.push_ok("");
        fx.runner.push_ok("");
        fx.manager.spawn(&mut run, 1).await.unwrap();
        fx.manager.spawn(&mut run, 2).await.unwrap();

        // fetch, checkout, merge
        fx.runner.push_ok("");
        fx.runner.push_ok("");
        fx.runner.push_ok("Merge made by the 'ort' strategy.");

        let promoted = fx.manager.promote("win-run-v1").await.unwrap();
        let winner = promoted.promoted_workspace().unwrap();
        assert_eq!(winner.id, "win-run-v1");
        assert!(winner.promoted_at.is_some());

        let err = fx.manager.promote("win-run-v2").await.unwrap_err();
        match err {
            RelayError::AlreadyPromoted {
                run_id,
                workspace_id,
            } => {
                assert_eq!(run_id, "win-run");
                assert_eq!(workspace_id, "win-run-v1");
            }
            other => panic!("Expected AlreadyPromoted, got {other:?}"),
        }

        let calls = fx.runner.invocations();
        let fetches = calls.iter().filter(|c| c.starts_with("git fetch")).count();
        assert_eq!(fetches, 1);
    }

    #[tokio::test]
    async fn promote_conflict_leaves_state_unchanged() {
        let fx = fixture();
        let mut run = seeded_run(&fx, "cfl-run", "task", 1);
        fx.runner.push_ok("");
        fx.manager.spawn(&mut run, 1).await.unwrap();

        fx.runner.push_ok(""); // fetch
        fx.runner.push_ok(""); // checkout
        fx.runner.push_exit(1, "CONFLICT (content)"); // merge
        fx.runner.push_ok("src/theme.rs\n"); // conflicting paths
        fx.runner.push_ok(""); // merge --abort

        let err = fx.manager.promote("cfl-run-v1").await.unwrap_err();
        match err {
            RelayError::MergeConflict { paths, branch, .. } => {
                assert_eq!(paths, vec![PathBuf::from("src/theme.rs")]);
                assert_eq!(branch, "main");
            }
            other => panic!("Expected MergeConflict, got {other:?}"),
        }

        let loaded = fx.store.load("cfl-run").unwrap();
        assert!(loaded.promoted_workspace().is_none());
        assert_eq!(loaded.workspaces[0].state, WorkspaceState::Active);
        assert_eq!(loaded.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn concurrent_promotes_let_exactly_one_win() {
        let fx = fixture();
        let mut run = seeded_run(&fx, "race-run", "task", 2);
        fx.runner.push_ok("");
        fx.runner.push_ok("");
        fx.manager.spawn(&mut run, 1).await.unwrap();
        fx.manager.spawn(&mut run, 2).await.unwrap();

        // Only the first promote past the lock reaches git. Stall its merge
        // long enough for the loser to be waiting on the lock.
        fx.runner.push_ok("");
        fx.runner.push_ok("");
        fx.runner
            .push_ok_after("Merge made.", std::time::Duration::from_millis(100));

        let manager = Arc::new(fx.manager);
        let first = {
            let m = manager.clone();
            tokio::spawn(async move { m.promote("race-run-v1").await })
        };
        let second = {
            let m = manager.clone();
            tokio::spawn(async move { m.promote("race-run-v2").await })
        };

        let results = [first.await.unwrap(), second.await.unwrap()];
        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1);
        let losses = results
            .iter()
            .filter(|r| matches!(r, Err(RelayError::AlreadyPromoted { .. })))
            .count();
        assert_eq!(losses, 1);

        let loaded = fx.store.load("race-run").unwrap();
        assert!(loaded.promoted_workspace().is_some());
    }

    #[test]
    fn replica_copy_skips_relay_state() {
        let src = tempdir().unwrap();
        fs::write(src.path().join("keep.txt"), "x").unwrap();
        fs::create_dir_all(src.path().join(".relay/work")).unwrap();
        fs::write(src.path().join(".relay/work/secret"), "y").unwrap();
        fs::create_dir_all(src.path().join(".git/refs")).unwrap();
        fs::write(src.path().join(".git/HEAD"), "ref: refs/heads/main").unwrap();

        let dest = tempdir().unwrap();
        let target = dest.path().join("replica");
        let copied = copy_replica(src.path(), &target).unwrap();

        assert!(target.join("keep.txt").exists());
        assert!(target.join(".git/HEAD").exists());
        assert!(!target.join(".relay").exists());
        assert_eq!(copied, 2);
    }
}
