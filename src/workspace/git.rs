//! Git plumbing over the command-runner seam.
//!
//! Version control is an opaque collaborator: every operation here shells
//! out through a `CommandRunner` and parses only counts, path lists and
//! exit status from the output. Nothing links against git itself, and
//! tests drive these helpers with a scripted runner.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::errors::RelayError;
use crate::exec::{CommandOutput, CommandRequest, CommandRunner};

/// Diff statistics versus the run's base branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffStat {
    pub files_changed: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
}

/// Result of a merge attempt. Conflicts carry the offending paths; the
/// merge itself has already been aborted by the time this is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Clean,
    Conflicted(Vec<PathBuf>),
}

#[derive(Clone)]
pub struct Git {
    runner: Arc<dyn CommandRunner>,
}

impl Git {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<CommandOutput, RelayError> {
        let mut argv = vec!["git".to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        let request = CommandRequest::new(&argv, cwd)?;
        self.runner.run(&request).await
    }

    /// Run a git command that must succeed; nonzero exit becomes a Vcs
    /// error carrying the captured stderr.
    async fn git_ok(
        &self,
        op: &'static str,
        cwd: &Path,
        args: &[&str],
    ) -> Result<CommandOutput, RelayError> {
        let output = self.git(cwd, args).await?;
        if !output.success() {
            return Err(RelayError::Vcs {
                op,
                detail: vcs_detail(&output),
            });
        }
        Ok(output)
    }

    pub async fn is_repo(&self, cwd: &Path) -> Result<bool, RelayError> {
        let output = self
            .git(cwd, &["rev-parse", "--is-inside-work-tree"])
            .await?;
        Ok(output.success())
    }

    /// Create `branch` at the current HEAD and switch to it.
    pub async fn checkout_new_branch(&self, cwd: &Path, branch: &str) -> Result<(), RelayError> {
        self.git_ok("checkout", cwd, &["checkout", "-b", branch])
            .await?;
        Ok(())
    }

    pub async fn checkout(&self, cwd: &Path, branch: &str) -> Result<(), RelayError> {
        self.git_ok("checkout", cwd, &["checkout", branch]).await?;
        Ok(())
    }

    /// Fetch `branch` from another local repository into FETCH_HEAD.
    pub async fn fetch_branch(
        &self,
        cwd: &Path,
        remote: &Path,
        branch: &str,
    ) -> Result<(), RelayError> {
        let remote = remote.to_string_lossy();
        self.git_ok("fetch", cwd, &["fetch", remote.as_ref(), branch])
            .await?;
        Ok(())
    }

    /// Merge `committish` into the current branch. On conflict the merge is
    /// aborted, the working tree restored, and the conflicting paths
    /// returned; the caller decides how to surface them.
    pub async fn merge(
        &self,
        cwd: &Path,
        committish: &str,
        message: &str,
    ) -> Result<MergeOutcome, RelayError> {
        let output = self
            .git(cwd, &["merge", "--no-ff", "-m", message, committish])
            .await?;
        if output.success() {
            return Ok(MergeOutcome::Clean);
        }

        let conflicts = self
            .git_ok(
                "diff",
                cwd,
                &["diff", "--name-only", "--diff-filter=U"],
            )
            .await?;
        let paths: Vec<PathBuf> = conflicts
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect();

        // Best effort: when the merge never started (dirty worktree, say)
        // there is no MERGE_HEAD to abort, and the useful diagnostic is
        // the merge output itself.
        let _ = self.git(cwd, &["merge", "--abort"]).await;

        if paths.is_empty() {
            // Nonzero merge with nothing unmerged is not a content
            // conflict; surface the original failure.
            return Err(RelayError::Vcs {
                op: "merge",
                detail: vcs_detail(&output),
            });
        }
        Ok(MergeOutcome::Conflicted(paths))
    }

    /// Diff statistics for work on the current branch since it diverged
    /// from `base`.
    pub async fn diff_stat(&self, cwd: &Path, base: &str) -> Result<DiffStat, RelayError> {
        let range = format!("{}...HEAD", base);
        let output = self
            .git_ok("diff", cwd, &["diff", "--numstat", &range])
            .await?;
        Ok(parse_numstat(&output.stdout))
    }

    /// Subject and committer time of the branch tip. None when the
    /// repository has no commits yet.
    pub async fn last_commit(
        &self,
        cwd: &Path,
    ) -> Result<Option<(DateTime<Utc>, String)>, RelayError> {
        let output = self.git(cwd, &["log", "-1", "--format=%cI%n%s"]).await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(parse_last_commit(&output.stdout))
    }

    /// A digest of the tracked content: HEAD plus the full diff against it,
    /// staged or not. Untracked files stay out of the hash so transient
    /// test artifacts do not register as mutations.
    pub async fn content_fingerprint(&self, cwd: &Path) -> Result<String, RelayError> {
        use sha2::{Digest, Sha256};

        let head = self.git(cwd, &["rev-parse", "HEAD"]).await?;
        let diff = self.git_ok("diff", cwd, &["diff", "HEAD"]).await?;

        let mut hasher = Sha256::new();
        hasher.update(head.stdout.as_bytes());
        hasher.update(diff.stdout.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

fn vcs_detail(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        format!("exit code {}", output.exit_code)
    } else {
        stderr.to_string()
    }
}

/// Parse `git diff --numstat` output. Binary files report `-` for both
/// counts and contribute to files_changed only.
pub(crate) fn parse_numstat(stdout: &str) -> DiffStat {
    let mut stat = DiffStat::default();
    for line in stdout.lines() {
        let mut fields = line.split_whitespace();
        let (Some(added), Some(removed), Some(_path)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        stat.files_changed += 1;
        stat.lines_added += added.parse::<u64>().unwrap_or(0);
        stat.lines_removed += removed.parse::<u64>().unwrap_or(0);
    }
    stat
}

pub(crate) fn parse_last_commit(stdout: &str) -> Option<(DateTime<Utc>, String)> {
    let mut lines = stdout.lines();
    let when = DateTime::parse_from_rfc3339(lines.next()?.trim()).ok()?;
    let subject = lines.next().unwrap_or("").trim().to_string();
    Some((when.with_timezone(&Utc), subject))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;

    #[test]
    fn numstat_counts_and_skips_binary_line_totals() {
        let stat = parse_numstat("120\t30\tsrc/theme.rs\n-\t-\tassets/logo.png\n0\t5\tREADME.md\n");
        assert_eq!(stat.files_changed, 3);
        assert_eq!(stat.lines_added, 120);
        assert_eq!(stat.lines_removed, 35);
    }

    #[test]
    fn numstat_of_empty_diff_is_zero() {
        assert_eq!(parse_numstat(""), DiffStat::default());
        assert_eq!(parse_numstat("\n\n"), DiffStat::default());
    }

    #[test]
    fn last_commit_parses_timestamp_and_subject() {
        let parsed = parse_last_commit("2026-03-01T10:20:30+02:00\nAdd dark mode toggle\n");
        let (when, subject) = parsed.unwrap();
        assert_eq!(subject, "Add dark mode toggle");
        assert_eq!(when, "2026-03-01T08:20:30Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn last_commit_with_garbage_timestamp_is_none() {
        assert_eq!(parse_last_commit("yesterday\nfix\n"), None);
        assert_eq!(parse_last_commit(""), None);
    }

    #[tokio::test]
    async fn merge_conflict_collects_paths_and_aborts() {
        let runner = Arc::new(FakeRunner::new());
        runner.push_exit(1, "CONFLICT (content): merge conflict in src/theme.rs");
        runner.push_ok("src/theme.rs\nsrc/ui.rs\n");
        runner.push_ok("");

        let git = Git::new(runner.clone());
        let outcome = git
            .merge(Path::new("/repo"), "FETCH_HEAD", "Merge branch")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            MergeOutcome::Conflicted(vec![
                PathBuf::from("src/theme.rs"),
                PathBuf::from("src/ui.rs"),
            ])
        );
        let calls = runner.invocations();
        assert!(calls[0].starts_with("git merge --no-ff"));
        assert_eq!(calls[1], "git diff --name-only --diff-filter=U");
        assert_eq!(calls[2], "git merge --abort");
    }

    #[tokio::test]
    async fn clean_merge_runs_a_single_command() {
        let runner = Arc::new(FakeRunner::new());
        runner.push_ok("Merge made by the 'ort' strategy.");

        let git = Git::new(runner.clone());
        let outcome = git
            .merge(Path::new("/repo"), "FETCH_HEAD", "Merge branch")
            .await
            .unwrap();

        assert_eq!(outcome, MergeOutcome::Clean);
        assert_eq!(runner.invocations().len(), 1);
    }

    #[tokio::test]
    async fn failed_merge_without_conflicts_is_a_vcs_error() {
        let runner = Arc::new(FakeRunner::new());
        runner.push_exit(128, "fatal: refusing to merge unrelated histories");
        runner.push_ok("");
        runner.push_ok("");

        let git = Git::new(runner);
        let err = git
            .merge(Path::new("/repo"), "FETCH_HEAD", "Merge branch")
            .await
            .unwrap_err();
        match err {
            RelayError::Vcs { op, detail } => {
                assert_eq!(op, "merge");
                assert!(detail.contains("unrelated histories"));
            }
            other => panic!("Expected Vcs, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn merge_refused_before_starting_keeps_its_own_diagnostics() {
        let runner = Arc::new(FakeRunner::new());
        runner.push_exit(
            1,
            "error: Your local changes to the following files would be overwritten by merge:\n  src/app.txt",
        );
        runner.push_ok("");
        // No merge in progress, so the cleanup abort itself fails.
        runner.push_exit(128, "fatal: There is no merge to abort (MERGE_HEAD missing).");

        let git = Git::new(runner);
        let err = git
            .merge(Path::new("/repo"), "FETCH_HEAD", "Merge branch")
            .await
            .unwrap_err();
        match err {
            RelayError::Vcs { op, detail } => {
                assert_eq!(op, "merge");
                assert!(detail.contains("local changes"), "got: {detail}");
            }
            other => panic!("Expected Vcs, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn diff_stat_issues_a_merge_base_range() {
        let runner = Arc::new(FakeRunner::new());
        runner.push_ok("10\t2\tsrc/a.rs\n");

        let git = Git::new(runner.clone());
        let stat = git.diff_stat(Path::new("/repo"), "main").await.unwrap();

        assert_eq!(stat.files_changed, 1);
        assert_eq!(runner.invocations()[0], "git diff --numstat main...HEAD");
    }

    #[tokio::test]
    async fn fingerprint_is_stable_for_identical_output() {
        let outputs = ["abc123\n", "diff --git a b\n"];
        let mut digests = Vec::new();
        for _ in 0..2 {
            let runner = Arc::new(FakeRunner::new());
            for out in outputs {
                runner.push_ok(out);
            }
            let git = Git::new(runner);
            digests.push(git.content_fingerprint(Path::new("/repo")).await.unwrap());
        }
        assert_eq!(digests[0], digests[1]);
        assert_eq!(digests[0].len(), 64);
    }
}
