//! Pipeline orchestration — `relay start`, `relay run` and `relay abort`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use relay::config::Config;
use relay::exec::{CommandRunner, ProcessRunner};
use relay::executor::{AbortSignal, PhaseExecutor, SharedRun, ToolSet};
use relay::store::{RunStore, WorkflowRun};

use super::super::Cli;

const MAX_PARALLELISM: u32 = 16;

/// Launch a new run: one workspace per variant, then every pipeline to
/// completion. Returns once all variants have finished or failed.
pub async fn cmd_start(
    cli: &Cli,
    project_dir: PathBuf,
    task: &str,
    docs: &[PathBuf],
    parallel: u32,
) -> Result<()> {
    use relay::errors::RelayError;
    use relay::util::{short_suffix, slugify};
    use relay::workspace::WorkspaceManager;

    if task.trim().is_empty() {
        return Err(RelayError::validation("task", "task description is empty").into());
    }
    let slug = slugify(task, 32);
    if slug.is_empty() {
        return Err(RelayError::validation(
            "task",
            "task description needs at least one alphanumeric character",
        )
        .into());
    }
    if parallel == 0 || parallel > MAX_PARALLELISM {
        return Err(RelayError::validation(
            "parallelism",
            format!("must be between 1 and {}", MAX_PARALLELISM),
        )
        .into());
    }
    for doc in docs {
        if !doc.is_file() {
            return Err(
                RelayError::validation("docs", format!("{} is not a file", doc.display())).into(),
            );
        }
    }

    let config = Config::new(project_dir, cli.config.clone(), cli.verbose)?;
    config.ensure_directories()?;
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    check_start_prerequisites(&config, runner.clone()).await?;

    let store = RunStore::new(config.runs_dir.clone());
    let run_id = format!("{}-{}", slug, short_suffix());
    let mut run = WorkflowRun::new(
        run_id.clone(),
        task.to_string(),
        docs.to_vec(),
        parallel,
        config.integration_branch().to_string(),
    );

    let task_file = write_task_artifact(&config, &run_id, task, docs)?;
    store.persist(&mut run)?;

    println!("Run {} created for task: {}", run_id, task);

    let manager = WorkspaceManager::new(&config, store.clone(), runner.clone());
    let mut targets = Vec::new();
    for variant in 1..=parallel {
        let workspace = manager.spawn(&mut run, variant).await?;
        println!("  {} on branch {}", workspace.id, workspace.branch);
        targets.push((workspace.id, task_file.clone()));
    }
    println!();

    execute_pipelines(&config, store, runner, run, targets).await?;
    println!();
    println!("Next: `relay compare {}` to rank the variants", run_id);
    Ok(())
}

/// Re-enter an existing run: each targeted workspace picks up at its first
/// unfinished phase with the same input it had before. A standing abort
/// request is cleared by an explicit re-entry.
pub async fn cmd_run(
    cli: &Cli,
    project_dir: PathBuf,
    run_id: &str,
    variant: Option<u32>,
) -> Result<()> {
    use relay::errors::RelayError;
    use relay::executor::resume_input;
    use relay::store::WorkspaceState;
    use relay::workspace::abort_marker_path;

    let config = Config::new(project_dir, cli.config.clone(), cli.verbose)?;
    config.ensure_directories()?;
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    check_start_prerequisites(&config, runner.clone()).await?;

    let store = RunStore::new(config.runs_dir.clone());
    let run_id = store.resolve(run_id)?;
    let run = store.load(&run_id)?;
    let task_file = config.work_dir.join(&run_id).join("task.md");

    let mut targets = Vec::new();
    for workspace in &run.workspaces {
        if let Some(wanted) = variant
            && workspace.variant_id != wanted
        {
            continue;
        }
        if workspace.state != WorkspaceState::Active {
            continue;
        }
        if workspace.next_phase().is_none() {
            println!("  {} already completed every phase", workspace.id);
            continue;
        }
        let marker = abort_marker_path(&workspace.path);
        if marker.exists() {
            std::fs::remove_file(&marker)
                .map_err(|source| RelayError::io(&marker, source))?;
        }
        let input = resume_input(workspace).unwrap_or_else(|| task_file.clone());
        targets.push((workspace.id.clone(), input));
    }

    if targets.is_empty() {
        match variant {
            Some(v) => println!("No workspace for variant {} needs to run.", v),
            None => println!("No workspace of run {} needs to run.", run_id),
        }
        return Ok(());
    }

    println!("Resuming {} workspace(s) of run {}", targets.len(), run_id);
    execute_pipelines(&config, store, runner, run, targets).await
}

/// Request cancellation of a workspace. A running pipeline notices the
/// marker and stops; an idle one is marked aborted here directly.
pub fn cmd_abort(cli: &Cli, project_dir: PathBuf, workspace_id: &str) -> Result<()> {
    use chrono::Utc;
    use relay::errors::RelayError;
    use relay::phase::{PhaseStatus, RunStatus};
    use relay::store::{WorkspaceState, parse_workspace_id};
    use relay::workspace::{abort_marker_path, lock, workspace_lock_path};

    let config = Config::new(project_dir, cli.config.clone(), cli.verbose)?;
    let store = RunStore::new(config.runs_dir.clone());

    let (run_id, _) = parse_workspace_id(workspace_id).ok_or_else(|| {
        RelayError::validation(
            "workspace id",
            format!("{} is not of the form <run>-v<N>", workspace_id),
        )
    })?;
    let run = store.load(run_id)?;
    let (replica, pipeline_status, state) = match run.workspace(workspace_id) {
        Some(ws) => (ws.path.clone(), ws.pipeline_status, ws.state),
        None => {
            return Err(RelayError::WorkspaceNotFound {
                run_id: run_id.to_string(),
                workspace_id: workspace_id.to_string(),
            }
            .into());
        }
    };
    if state == WorkspaceState::Destroyed {
        println!("{} is destroyed; nothing to abort.", workspace_id);
        return Ok(());
    }
    if pipeline_status.is_terminal() {
        println!(
            "{} already finished ({}); nothing to abort.",
            workspace_id, pipeline_status
        );
        return Ok(());
    }

    let marker = abort_marker_path(&replica);
    std::fs::write(&marker, b"abort requested\n")
        .map_err(|source| RelayError::io(&marker, source))?;

    match lock::try_lock_exclusive(&workspace_lock_path(&replica))? {
        None => {
            // A pipeline holds the lock; it polls the marker and records
            // the aborted phase itself.
            println!(
                "Abort requested for {}; the running phase will stop shortly.",
                workspace_id
            );
        }
        Some(_guard) => {
            // Edit a reload, not the copy from above: pipelines of other
            // workspaces persist concurrently from their own copies.
            let mut run = store.load(run_id)?;
            if let Some(workspace) = run.workspace_mut(workspace_id) {
                if let Some(phase) = workspace.next_phase()
                    && let Some(record) = workspace.phase_record_mut(phase)
                    && record.status == PhaseStatus::Running
                {
                    record.status = PhaseStatus::Failed;
                    record.failure_reason = Some("aborted".to_string());
                    record.finished_at = Some(Utc::now());
                }
                workspace.pipeline_status = RunStatus::Aborted;
            }
            store.persist(&mut run)?;
            let _ = std::fs::remove_file(&marker);
            println!("{} aborted.", workspace_id);
        }
    }
    Ok(())
}

/// Every phase needs a configured tool and the project must be a git
/// repository; fail fast before any state is created.
async fn check_start_prerequisites(config: &Config, runner: Arc<dyn CommandRunner>) -> Result<()> {
    use relay::phase::Phase;
    use relay::workspace::Git;

    let tools = ToolSet::from_config(config);
    for phase in Phase::ALL {
        if tools.command_for(phase).is_none() {
            anyhow::bail!(
                "No tool configured for phase '{}'. Add it under [tools] in {}.",
                phase,
                config.relay_dir.join("relay.toml").display()
            );
        }
    }

    let git = Git::new(runner);
    if !git.is_repo(&config.project_dir).await? {
        anyhow::bail!(
            "{} is not a git repository. Relay needs one to branch and merge workspaces.",
            config.project_dir.display()
        );
    }
    Ok(())
}

/// The first phase's input artifact: the task description plus any
/// attached documents, inlined so tools see one self-contained file.
fn write_task_artifact(
    config: &Config,
    run_id: &str,
    task: &str,
    docs: &[PathBuf],
) -> Result<PathBuf> {
    let run_dir = config.work_dir.join(run_id);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

    let mut body = format!("# Task\n\n{}\n", task.trim());
    for doc in docs {
        let content = std::fs::read_to_string(doc)
            .with_context(|| format!("Failed to read attached doc: {}", doc.display()))?;
        body.push_str(&format!("\n## Context: {}\n\n{}\n", doc.display(), content));
    }

    let task_file = run_dir.join("task.md");
    std::fs::write(&task_file, body)
        .with_context(|| format!("Failed to write task artifact: {}", task_file.display()))?;
    Ok(task_file)
}

/// Drive the given workspaces concurrently over one shared run record.
/// Individual pipeline failures are reported, not propagated; the command
/// fails only when no variant survives.
async fn execute_pipelines(
    config: &Config,
    store: RunStore,
    runner: Arc<dyn CommandRunner>,
    run: WorkflowRun,
    targets: Vec<(String, PathBuf)>,
) -> Result<()> {
    let executor = Arc::new(PhaseExecutor::new(
        store,
        runner,
        ToolSet::from_config(config),
    ));
    let shared: SharedRun = Arc::new(tokio::sync::Mutex::new(run));
    let signal = AbortSignal::new();

    // Ctrl-C becomes an abort request instead of an instant kill.
    let interrupt = signal.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nAbort requested; stopping running phases...");
            interrupt.abort();
        }
    });

    let mut handles = Vec::new();
    for (workspace_id, input) in targets {
        let executor = executor.clone();
        let shared = shared.clone();
        let signal = signal.clone();
        handles.push(tokio::spawn(async move {
            let outcome = executor
                .run_pipeline(shared, &workspace_id, input, signal)
                .await;
            (workspace_id, outcome)
        }));
    }

    let total = handles.len();
    let mut completed = 0;
    for handle in handles {
        let (workspace_id, outcome) = handle.await.context("pipeline task panicked")?;
        match outcome {
            Ok(()) => {
                completed += 1;
                println!(
                    "  {} {}",
                    workspace_id,
                    console::style("completed all phases").green()
                );
            }
            Err(err) => {
                println!("  {} {}: {}", workspace_id, console::style("failed").red(), err);
            }
        }
    }

    println!();
    println!("{}/{} variant(s) completed the pipeline", completed, total);
    if completed == 0 {
        anyhow::bail!("every variant failed; see the phase records for details");
    }
    Ok(())
}
