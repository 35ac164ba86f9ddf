use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "relay")]
#[command(
    version,
    about = "Run parallel attempts at a task in isolated workspaces and promote the winner"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to relay.toml. If not provided, .relay/relay.toml is used
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the .relay directory and a starter relay.toml
    Init,
    /// Start a run: spawn one workspace per variant and execute every pipeline
    Start {
        /// Task description
        task: String,

        /// Reference documents inlined into the task artifact
        #[arg(long)]
        docs: Vec<PathBuf>,

        /// Number of parallel variants to attempt
        #[arg(short, long, default_value = "1")]
        parallel: u32,
    },
    /// Re-enter an existing run at its first unfinished phase
    Run {
        /// Run id, as printed by `relay start`
        run: String,

        /// Restrict to a single variant
        #[arg(long)]
        variant: Option<u32>,
    },
    /// Rank a run's workspaces by test outcome, diff size and recency
    Compare {
        /// Run id
        run: String,

        /// Also write the rendered report to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Merge a workspace's branch into the integration branch
    Promote {
        /// Workspace id, e.g. <run>-v2
        workspace: String,
    },
    /// Show one run in detail
    Status {
        /// Run id
        run: String,
    },
    /// List runs, optionally filtered by status
    List {
        /// Only runs with this status (pending, building, done, failed, ...)
        #[arg(long)]
        status: Option<String>,
    },
    /// Cancel a workspace's in-flight pipeline
    Abort {
        /// Workspace id
        workspace: String,
    },
    /// Remove a workspace's replica from disk, keeping its record
    Destroy {
        /// Workspace id
        workspace: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => {
            cmd::cmd_init(&project_dir, cli.config.as_deref())?;
        }
        Commands::Start {
            task,
            docs,
            parallel,
        } => {
            cmd::cmd_start(&cli, project_dir, task, docs, *parallel).await?;
        }
        Commands::Run { run, variant } => {
            cmd::cmd_run(&cli, project_dir, run, *variant).await?;
        }
        Commands::Compare { run, report } => {
            cmd::cmd_compare(&cli, project_dir, run, report.as_deref()).await?;
        }
        Commands::Promote { workspace } => {
            cmd::cmd_promote(&cli, project_dir, workspace).await?;
        }
        Commands::Status { run } => cmd::cmd_status(&cli, project_dir, run)?,
        Commands::List { status } => cmd::cmd_list(&cli, project_dir, status.as_deref())?,
        Commands::Abort { workspace } => cmd::cmd_abort(&cli, project_dir, workspace)?,
        Commands::Destroy { workspace } => cmd::cmd_destroy(&cli, project_dir, workspace)?,
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "relay=debug" } else { "relay=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}
