//! Run inspection — `relay status` and `relay list`.

use anyhow::Result;
use std::path::PathBuf;

use super::super::Cli;

pub fn cmd_status(cli: &Cli, project_dir: PathBuf, run_id: &str) -> Result<()> {
    use relay::config::Config;
    use relay::phase::PhaseStatus;
    use relay::store::RunStore;

    let config = Config::new(project_dir, cli.config.clone(), cli.verbose)?;
    let store = RunStore::new(config.runs_dir.clone());
    let run_id = store.resolve(run_id)?;
    let run = store.load(&run_id)?;

    println!();
    println!("Run {} ({})", run.id, run.status.as_str());
    println!("Task: {}", run.task);
    println!("Base branch: {}", run.integration_branch);
    println!(
        "Created: {}",
        run.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!();

    if run.workspaces.is_empty() {
        println!("No workspaces spawned yet.");
        println!();
        return Ok(());
    }

    println!(
        "{:<28} {:<10} {:<10} Phases",
        "Workspace", "State", "Pipeline"
    );
    println!(
        "{:<28} {:<10} {:<10} ------",
        "---------", "-----", "--------"
    );
    for workspace in &run.workspaces {
        let succeeded = workspace
            .phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Succeeded)
            .count();
        println!(
            "{:<28} {:<10} {:<10} {}/{}",
            workspace.id,
            workspace.state.as_str(),
            workspace.pipeline_status.as_str(),
            succeeded,
            workspace.phases.len()
        );
    }
    println!();

    for workspace in &run.workspaces {
        for record in &workspace.phases {
            if record.status == PhaseStatus::Failed
                && let Some(reason) = &record.failure_reason
            {
                println!(
                    "  {} {} {}: {}",
                    workspace.id,
                    record.phase.as_str(),
                    console::style("failed").red(),
                    reason
                );
            }
        }
        if let Some(snapshot) = &workspace.snapshot {
            println!(
                "  {} last sample: {} (+{}/-{}), {}",
                workspace.id,
                snapshot.test_status.as_str(),
                snapshot.lines_added,
                snapshot.lines_removed,
                console::style(format!("sampled {}", snapshot.sampled_at.format("%H:%M:%S")))
                    .dim()
            );
        }
    }

    if cli.verbose {
        println!();
        for workspace in &run.workspaces {
            println!("{} phases:", workspace.id);
            for record in &workspace.phases {
                let artifact = record
                    .output_artifact
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {:<8} {:<10} {}",
                    record.phase.as_str(),
                    record.status.as_str(),
                    artifact
                );
            }
        }
    }
    println!();
    Ok(())
}

pub fn cmd_list(cli: &Cli, project_dir: PathBuf, status: Option<&str>) -> Result<()> {
    use relay::config::Config;
    use relay::errors::RelayError;
    use relay::phase::RunStatus;
    use relay::store::{RunStore, WorkflowRun};

    let config = Config::new(project_dir, cli.config.clone(), cli.verbose)?;
    let store = RunStore::new(config.runs_dir.clone());

    let mut runs: Vec<WorkflowRun> = Vec::new();
    match status {
        Some(raw) => {
            let wanted: RunStatus = raw
                .parse()
                .map_err(|detail: String| RelayError::validation("status", detail))?;
            for entry in store.list_by_status(wanted)? {
                runs.push(entry?);
            }
        }
        None => {
            for id in store.list_ids()? {
                runs.push(store.load(&id)?);
            }
        }
    }
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    println!();
    if runs.is_empty() {
        match status {
            Some(raw) => println!("No runs with status '{}'.", raw),
            None => println!("No runs found. Start one with `relay start \"<task>\"`."),
        }
        println!();
        return Ok(());
    }

    println!(
        "{:<36} {:<10} {:<17} Task",
        "Run", "Status", "Created"
    );
    println!(
        "{:<36} {:<10} {:<17} ----",
        "---", "------", "-------"
    );
    for run in &runs {
        println!(
            "{:<36} {:<10} {:<17} {:.48}",
            run.id,
            run.status.as_str(),
            run.created_at.format("%Y-%m-%d %H:%M").to_string(),
            run.task
        );
    }
    println!();
    println!("{} run(s)", runs.len());
    println!();
    Ok(())
}
