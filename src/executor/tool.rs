//! Phase tool resolution and the invocation contract.
//!
//! Each phase delegates to an external command line from the `[tools]`
//! section. The coordinator appends the input artifact path as the final
//! argument and runs the tool inside the workspace replica. A tool reports
//! success by exiting 0 and printing its output artifact path as the last
//! non-empty stdout line; nonzero exit is a phase failure with stderr
//! (falling back to stdout) as the diagnostics. Artifact content is never
//! inspected here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Config;
use crate::errors::RelayError;
use crate::exec::{CommandOutput, CommandRequest};
use crate::phase::Phase;

/// External command lines for the four phases, resolved once from config.
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    scout: Option<Vec<String>>,
    plan: Option<Vec<String>>,
    build: Option<Vec<String>>,
    review: Option<Vec<String>>,
    timeout: Option<Duration>,
}

impl ToolSet {
    pub fn from_config(config: &Config) -> Self {
        Self {
            scout: config.tool_command(Phase::Scout),
            plan: config.tool_command(Phase::Plan),
            build: config.tool_command(Phase::Build),
            review: config.tool_command(Phase::Review),
            timeout: config.tool_timeout(),
        }
    }

    /// One command for every phase, for tests that drive the executor with
    /// a scripted runner.
    #[cfg(test)]
    pub(crate) fn uniform(command: &[&str], timeout: Option<Duration>) -> Self {
        let argv: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        Self {
            scout: Some(argv.clone()),
            plan: Some(argv.clone()),
            build: Some(argv.clone()),
            review: Some(argv),
            timeout,
        }
    }

    pub fn command_for(&self, phase: Phase) -> Option<&[String]> {
        match phase {
            Phase::Scout => self.scout.as_deref(),
            Phase::Plan => self.plan.as_deref(),
            Phase::Build => self.build.as_deref(),
            Phase::Review => self.review.as_deref(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Build the invocation for one phase: the tool argv plus the input
    /// artifact as final argument, run inside the workspace.
    pub fn request(
        &self,
        phase: Phase,
        workspace_dir: &Path,
        input: &Path,
    ) -> Result<CommandRequest, RelayError> {
        let Some(command) = self.command_for(phase) else {
            return Err(RelayError::validation(
                "tool",
                format!("no tool configured for phase {}", phase),
            ));
        };
        let mut argv = command.to_vec();
        argv.push(input.to_string_lossy().into_owned());
        Ok(CommandRequest::new(&argv, workspace_dir)?.with_timeout(self.timeout))
    }
}

/// What a finished tool invocation means for its phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolVerdict {
    /// Exit 0 with an artifact path on the last stdout line.
    Output(PathBuf),
    /// Nonzero exit, or exit 0 without an artifact path. Carries the
    /// tool's diagnostics.
    Failed(String),
    TimedOut,
}

pub fn interpret(output: &CommandOutput, workspace_dir: &Path) -> ToolVerdict {
    if output.timed_out {
        return ToolVerdict::TimedOut;
    }
    if !output.success() {
        let stderr = output.stderr.trim();
        let detail = if !stderr.is_empty() {
            stderr.to_string()
        } else if let Some(line) = output.last_stdout_line() {
            line.to_string()
        } else {
            format!("exit code {}", output.exit_code)
        };
        return ToolVerdict::Failed(detail);
    }
    match output.last_stdout_line() {
        Some(line) => {
            let path = PathBuf::from(line);
            let path = if path.is_absolute() {
                path
            } else {
                workspace_dir.join(path)
            };
            ToolVerdict::Output(path)
        }
        None => ToolVerdict::Failed("tool reported no output artifact path".to_string()),
    }
}
