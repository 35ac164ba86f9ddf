//! Variant comparison — `relay compare`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::super::Cli;

/// Print the ranked comparison for a run. Exits nonzero when no workspace
/// passed its tests, so scripts can gate promotion on it.
pub async fn cmd_compare(
    cli: &Cli,
    project_dir: PathBuf,
    run_id: &str,
    report_path: Option<&Path>,
) -> Result<()> {
    use relay::compare::Comparator;
    use relay::config::Config;
    use relay::exec::ProcessRunner;
    use relay::store::RunStore;

    let config = Config::new(project_dir, cli.config.clone(), cli.verbose)?;
    let store = RunStore::new(config.runs_dir.clone());
    let run_id = store.resolve(run_id)?;
    let comparator = Comparator::new(&config, store, Arc::new(ProcessRunner));

    let report = comparator.report(&run_id).await?;
    let rendered = report.render();
    print!("{}", rendered);

    if let Some(path) = report_path {
        std::fs::write(path, &rendered)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        println!("Report written to {}", path.display());
    }

    if !report.any_passing() {
        anyhow::bail!("no workspace passed its tests");
    }
    Ok(())
}
