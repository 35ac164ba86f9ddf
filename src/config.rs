//! Runtime configuration for relay.
//!
//! Settings are read from `.relay/relay.toml` inside the project under
//! coordination. Every section is optional; a missing file yields defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! integration_branch = "main"
//!
//! [tools]
//! scout = "relay-scout"
//! plan = "relay-plan"
//! build = "relay-build --max-iterations 3"
//! review = "relay-review"
//! timeout_secs = 0          # 0 = no bound
//!
//! [tests]
//! command = "cargo test"
//! timeout_secs = 600
//!
//! [compare]
//! freshness_secs = 300
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::phase::Phase;
use crate::util::split_command;

/// `[project]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Branch that promoted work merges into.
    #[serde(default = "default_integration_branch")]
    pub integration_branch: String,
}

fn default_integration_branch() -> String {
    "main".to_string()
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            integration_branch: default_integration_branch(),
        }
    }
}

/// `[tools]` section. One command line per phase; the coordinator appends
/// the input artifact path as the final argument.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsSection {
    #[serde(default)]
    pub scout: Option<String>,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub review: Option<String>,
    /// Per-invocation bound in seconds. 0 means unbounded.
    #[serde(default)]
    pub timeout_secs: u64,
}

/// `[tests]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestsSection {
    /// Command run inside a workspace to judge it. Absent means test status
    /// is reported as not applicable.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_test_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_test_timeout_secs() -> u64 {
    600
}

impl Default for TestsSection {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_test_timeout_secs(),
        }
    }
}

/// `[compare]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareSection {
    /// How long a cached metric snapshot stays fresh, in seconds.
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,
}

fn default_freshness_secs() -> u64 {
    300
}

impl Default for CompareSection {
    fn default() -> Self {
        Self {
            freshness_secs: default_freshness_secs(),
        }
    }
}

/// Parsed `relay.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub tests: TestsSection,
    #[serde(default)]
    pub compare: CompareSection,
}

impl RelayToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse relay.toml")
    }

    /// Load configuration from the default location (.relay/relay.toml).
    /// Returns default configuration if the file doesn't exist.
    pub fn load_or_default(relay_dir: &Path) -> Result<Self> {
        let config_path = relay_dir.join("relay.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Resolved runtime configuration: canonical project paths plus the parsed
/// settings file.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub relay_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub work_dir: PathBuf,
    pub verbose: bool,
    toml: RelayToml,
}

impl Config {
    pub fn new(project_dir: PathBuf, config_file: Option<PathBuf>, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let relay_dir = project_dir.join(".relay");
        let runs_dir = relay_dir.join("runs");
        let work_dir = relay_dir.join("work");

        let toml = match config_file {
            Some(path) => RelayToml::load(&path)?,
            None => RelayToml::load_or_default(&relay_dir)?,
        };

        Ok(Self {
            project_dir,
            relay_dir,
            runs_dir,
            work_dir,
            verbose,
            toml,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.runs_dir).context("Failed to create runs directory")?;
        std::fs::create_dir_all(&self.work_dir).context("Failed to create work directory")?;
        Ok(())
    }

    pub fn integration_branch(&self) -> &str {
        &self.toml.project.integration_branch
    }

    /// Command line for a phase tool, split into argv. None when the phase
    /// has no tool configured.
    pub fn tool_command(&self, phase: Phase) -> Option<Vec<String>> {
        let raw = match phase {
            Phase::Scout => self.toml.tools.scout.as_deref(),
            Phase::Plan => self.toml.tools.plan.as_deref(),
            Phase::Build => self.toml.tools.build.as_deref(),
            Phase::Review => self.toml.tools.review.as_deref(),
        }?;
        let argv = split_command(raw);
        if argv.is_empty() { None } else { Some(argv) }
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        match self.toml.tools.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn test_command(&self) -> Option<Vec<String>> {
        let raw = self.toml.tests.command.as_deref()?;
        let argv = split_command(raw);
        if argv.is_empty() { None } else { Some(argv) }
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.tests.timeout_secs)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.toml.compare.freshness_secs)
    }

    /// Write a starter relay.toml if none exists yet. Returns whether a file
    /// was created.
    pub fn write_starter_toml(relay_dir: &Path) -> Result<bool> {
        let path = relay_dir.join("relay.toml");
        if path.exists() {
            return Ok(false);
        }
        std::fs::create_dir_all(relay_dir).context("Failed to create .relay directory")?;
        std::fs::write(&path, STARTER_TOML)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(true)
    }
}

const STARTER_TOML: &str = r#"# relay configuration

[project]
integration_branch = "main"

[tools]
# Command line per phase. The input artifact path is appended as the final
# argument; the tool prints its output artifact path as the last stdout line.
# scout = "relay-scout"
# plan = "relay-plan"
# build = "relay-build"
# review = "relay-review"
timeout_secs = 0

[tests]
# command = "cargo test"
timeout_secs = 600

[compare]
freshness_secs = 300
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn empty_toml_yields_defaults() {
        let parsed = RelayToml::parse("").unwrap();
        assert_eq!(parsed.project.integration_branch, "main");
        assert!(parsed.tools.scout.is_none());
        assert_eq!(parsed.tools.timeout_secs, 0);
        assert!(parsed.tests.command.is_none());
        assert_eq!(parsed.tests.timeout_secs, 600);
        assert_eq!(parsed.compare.freshness_secs, 300);
    }

    #[test]
    fn full_toml_round_trips_every_section() {
        let parsed = RelayToml::parse(
            r#"
            [project]
            integration_branch = "develop"

            [tools]
            scout = "scout-tool --fast"
            plan = "plan-tool"
            build = "build-tool"
            review = "review-tool"
            timeout_secs = 90

            [tests]
            command = "cargo test --all"
            timeout_secs = 120

            [compare]
            freshness_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(parsed.project.integration_branch, "develop");
        assert_eq!(parsed.tools.scout.as_deref(), Some("scout-tool --fast"));
        assert_eq!(parsed.tools.timeout_secs, 90);
        assert_eq!(parsed.tests.timeout_secs, 120);
        assert_eq!(parsed.compare.freshness_secs, 30);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(RelayToml::parse("[tools\nscout = ").is_err());
    }

    #[test]
    fn config_resolves_paths_under_relay_dir() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), None, false).unwrap();
        let root = dir.path().canonicalize().unwrap();

        assert_eq!(config.relay_dir, root.join(".relay"));
        assert_eq!(config.runs_dir, root.join(".relay/runs"));
        assert_eq!(config.work_dir, root.join(".relay/work"));
    }

    #[test]
    fn tool_command_splits_into_argv_and_appends_nothing() {
        let dir = tempdir().unwrap();
        let relay_dir = dir.path().join(".relay");
        fs::create_dir_all(&relay_dir).unwrap();
        fs::write(
            relay_dir.join("relay.toml"),
            "[tools]\nbuild = \"build-tool --flag value\"\ntimeout_secs = 45\n",
        )
        .unwrap();

        let config = Config::new(dir.path().to_path_buf(), None, false).unwrap();
        assert_eq!(
            config.tool_command(Phase::Build),
            Some(vec![
                "build-tool".to_string(),
                "--flag".to_string(),
                "value".to_string()
            ])
        );
        assert_eq!(config.tool_command(Phase::Scout), None);
        assert_eq!(config.tool_timeout(), Some(Duration::from_secs(45)));
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), None, false).unwrap();
        assert_eq!(config.tool_timeout(), None);
        assert_eq!(config.test_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn explicit_config_file_must_exist() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let result = Config::new(dir.path().to_path_buf(), Some(missing), false);
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    fn ensure_directories_creates_runs_and_work() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), None, false).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.runs_dir.exists());
        assert!(config.work_dir.exists());
    }

    #[test]
    fn starter_toml_is_written_once_and_parses() {
        let dir = tempdir().unwrap();
        let relay_dir = dir.path().join(".relay");

        assert!(Config::write_starter_toml(&relay_dir).unwrap());
        assert!(!Config::write_starter_toml(&relay_dir).unwrap());

        let parsed = RelayToml::load(&relay_dir.join("relay.toml")).unwrap();
        assert_eq!(parsed.project.integration_branch, "main");
        assert_eq!(parsed.tests.timeout_secs, 600);
    }
}
