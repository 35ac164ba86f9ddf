//! Workspace lifecycle — `relay promote` and `relay destroy`.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use super::super::Cli;

pub async fn cmd_promote(cli: &Cli, project_dir: PathBuf, workspace_id: &str) -> Result<()> {
    use relay::config::Config;
    use relay::errors::RelayError;
    use relay::exec::ProcessRunner;
    use relay::store::RunStore;
    use relay::workspace::WorkspaceManager;

    let config = Config::new(project_dir, cli.config.clone(), cli.verbose)?;
    let store = RunStore::new(config.runs_dir.clone());
    let manager = WorkspaceManager::new(&config, store, Arc::new(ProcessRunner));

    let err = match manager.promote(workspace_id).await {
        Ok(run) => {
            println!(
                "Promoted {} into {}",
                workspace_id, run.integration_branch
            );
            return Ok(());
        }
        Err(err) => err,
    };
    if let RelayError::MergeConflict { paths, .. } = &err {
        println!("Merge conflicts; the integration branch was left unchanged:");
        for path in paths {
            println!("  {}", path.display());
        }
    }
    Err(err.into())
}

pub fn cmd_destroy(cli: &Cli, project_dir: PathBuf, workspace_id: &str) -> Result<()> {
    use relay::config::Config;
    use relay::errors::RelayError;
    use relay::exec::ProcessRunner;
    use relay::store::{RunStore, parse_workspace_id};
    use relay::workspace::WorkspaceManager;

    let config = Config::new(project_dir, cli.config.clone(), cli.verbose)?;
    let store = RunStore::new(config.runs_dir.clone());

    let (run_id, _) = parse_workspace_id(workspace_id).ok_or_else(|| {
        RelayError::validation(
            "workspace id",
            format!("{} is not of the form <run>-v<N>", workspace_id),
        )
    })?;
    let mut run = store.load(run_id)?;
    let manager = WorkspaceManager::new(&config, store.clone(), Arc::new(ProcessRunner));
    manager.destroy(&mut run, workspace_id)?;

    println!("Destroyed {} (replica removed, record kept)", workspace_id);
    Ok(())
}
