//! Project initialization.

use anyhow::Result;
use std::path::Path;

pub fn cmd_init(project_dir: &Path, config_file: Option<&Path>) -> Result<()> {
    use relay::config::Config;

    let config = Config::new(
        project_dir.to_path_buf(),
        config_file.map(Path::to_path_buf),
        false,
    )?;
    let already = config.relay_dir.exists();
    config.ensure_directories()?;
    let wrote_toml = Config::write_starter_toml(&config.relay_dir)?;

    if !already || wrote_toml {
        println!("Initialized relay project at {}", config.relay_dir.display());
        println!();
        println!("Created directory structure:");
        println!("  .relay/");
        println!("  ├── relay.toml    # Phase tools and test command");
        println!("  ├── runs/         # Workflow run records");
        println!("  └── work/         # Workspace replicas");
        println!();
        println!("Next steps:");
        println!("  1. Edit .relay/relay.toml to point each phase at a tool");
        println!("  2. Run `relay start \"<task>\" --parallel 3` to launch attempts");
        println!("  3. Run `relay compare <run>` to rank them and pick a winner");
    } else {
        println!(
            "Relay project already initialized at {}",
            config.relay_dir.display()
        );
        println!("Directory structure verified.");
    }

    Ok(())
}
