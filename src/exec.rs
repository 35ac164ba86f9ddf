//! Opaque command execution.
//!
//! Every external collaborator (git, the test runner, phase tools) is
//! invoked through the `CommandRunner` seam and comes back as
//! (stdout, stderr, exit code, duration). Callers parse counts, path lists
//! and exit status only; tests inject a scripted fake instead of spawning
//! processes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::errors::RelayError;

/// One external invocation: argv, working directory, optional time bound.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new(argv: &[String], cwd: impl Into<PathBuf>) -> Result<Self, RelayError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| RelayError::validation("command", "empty command line"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            cwd: cwd.into(),
            timeout: None,
        })
    }

    pub fn with_timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    /// argv rendered as one line, for logs and fake-runner assertions.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Captured outcome of one invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Last non-empty stdout line. Phase tools report their output artifact
    /// path on this channel.
    pub fn last_stdout_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: &CommandRequest) -> Result<CommandOutput, RelayError>;
}

/// Real runner: tokio subprocess with piped stdio. Children are spawned
/// kill-on-drop, so an abandoned invocation (timeout expiry or an aborted
/// pipeline dropping the future) does not outlive its caller.
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, request: &CommandRequest) -> Result<CommandOutput, RelayError> {
        debug!(command = %request.display(), cwd = %request.cwd.display(), "running command");
        let started = Instant::now();

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| RelayError::Spawn {
            program: request.program.clone(),
            source,
        })?;

        let waited = match request.timeout {
            Some(limit) => match timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => {
                    // The elapsed future owned the child; dropping it here
                    // kills the process via kill_on_drop.
                    return Ok(CommandOutput {
                        stdout: String::new(),
                        stderr: String::new(),
                        exit_code: -1,
                        duration: started.elapsed(),
                        timed_out: true,
                    });
                }
            },
            None => child.wait_with_output().await,
        };
        let output = waited.map_err(|source| RelayError::Spawn {
            program: request.program.clone(),
            source,
        })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
            duration: started.elapsed(),
            timed_out: false,
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted runner for unit tests: queued responses served in order,
    //! every invocation recorded for assertion.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    struct FakeResponse {
        delay: Option<Duration>,
        output: Result<CommandOutput, RelayError>,
    }

    pub struct FakeRunner {
        queue: Mutex<VecDeque<FakeResponse>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self {
                queue: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn push(&self, delay: Option<Duration>, output: CommandOutput) {
            self.queue.lock().unwrap().push_back(FakeResponse {
                delay,
                output: Ok(output),
            });
        }

        /// Spawn failure, as if the program were not installed.
        pub fn push_spawn_error(&self, program: &str) {
            self.queue.lock().unwrap().push_back(FakeResponse {
                delay: None,
                output: Err(RelayError::Spawn {
                    program: program.to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                }),
            });
        }

        pub fn push_ok(&self, stdout: &str) {
            self.push(None, ok_output(stdout));
        }

        /// Success that only materializes after `delay`, for abort tests.
        pub fn push_ok_after(&self, stdout: &str, delay: Duration) {
            self.push(Some(delay), ok_output(stdout));
        }

        pub fn push_exit(&self, exit_code: i32, stderr: &str) {
            self.push(
                None,
                CommandOutput {
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                    exit_code,
                    duration: Duration::from_millis(1),
                    timed_out: false,
                },
            );
        }

        pub fn push_timeout(&self) {
            self.push(
                None,
                CommandOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: -1,
                    duration: Duration::from_millis(1),
                    timed_out: true,
                },
            );
        }

        pub fn invocations(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn ok_output(stdout: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
            duration: Duration::from_millis(1),
            timed_out: false,
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, request: &CommandRequest) -> Result<CommandOutput, RelayError> {
            self.calls.lock().unwrap().push(request.display());
            let response = self
                .queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected command: {}", request.display()));
            if let Some(delay) = response.delay {
                tokio::time::sleep(delay).await;
            }
            response.output
        }
    }
}
