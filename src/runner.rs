//! External command execution.
//!
//! Every workflow talks to the outside world (docker, make, gpg, apt) through
//! [`CommandRunner`], so tests can substitute a recording runner.

use std::io::{self, Read};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const TIMED_OUT_MESSAGE: &str = "Command timed out";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub capture: bool,
    pub timeout: Option<Duration>,
}

impl Invocation {
    /// An interactive invocation: inherits the terminal, no timeout.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            capture: false,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn captured(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn render(&self) -> String {
        fn shell_quote(part: &str) -> String {
            if part.is_empty() {
                return "\"\"".to_string();
            }
            if part.chars().any(|c| c.is_whitespace()) {
                return format!("\"{}\"", part.replace('"', "\\\""));
            }
            part.to_string()
        }
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|arg| shell_quote(arg)));
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0 && !self.timed_out
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

pub trait CommandRunner {
    fn run(&self, invocation: &Invocation, cwd: &Path) -> Result<CommandOutput, io::Error>;
}

pub struct SystemRunner;

fn status_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(if status.success() { 0 } else { 1 })
}

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation, cwd: &Path) -> Result<CommandOutput, io::Error> {
        tracing::debug!(command = %invocation.render(), cwd = %cwd.display(), "running command");
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args).current_dir(cwd);
        if invocation.capture {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }

        let Some(timeout) = invocation.timeout else {
            if invocation.capture {
                let output = cmd.output()?;
                return Ok(CommandOutput {
                    status_code: status_code(output.status),
                    stdout: output.stdout,
                    stderr: output.stderr,
                    timed_out: false,
                });
            }
            let status = cmd.status()?;
            return Ok(CommandOutput {
                status_code: status_code(status),
                ..CommandOutput::default()
            });
        };

        let mut child = cmd.spawn()?;
        let stdout_reader = child.stdout.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });

        let start = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if start.elapsed() >= timeout {
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            thread::sleep(POLL_INTERVAL);
        };

        let Some(status) = status else {
            // Grandchildren may still hold the pipes open; leave the readers detached.
            tracing::debug!(command = %invocation.render(), ?timeout, "command timed out");
            return Ok(CommandOutput {
                status_code: -1,
                timed_out: true,
                ..CommandOutput::default()
            });
        };
        let stdout = stdout_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        Ok(CommandOutput {
            status_code: status_code(status),
            stdout,
            stderr,
            timed_out: false,
        })
    }
}

/// Success flag plus a message: captured stdout on success, the best
/// available explanation otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    pub output: String,
}

pub fn run_check<R: CommandRunner + ?Sized>(
    runner: &R,
    cwd: &Path,
    invocation: &Invocation,
) -> CommandOutcome {
    match runner.run(invocation, cwd) {
        Ok(output) if output.timed_out => CommandOutcome {
            success: false,
            output: TIMED_OUT_MESSAGE.to_string(),
        },
        Ok(output) => {
            let success = output.success();
            let mut text = output.stdout_text();
            if !success && text.is_empty() {
                text = output.stderr_text();
            }
            CommandOutcome {
                success,
                output: text,
            }
        }
        Err(err) => {
            tracing::debug!(command = %invocation.render(), error = %err, "failed to spawn command");
            CommandOutcome {
                success: false,
                output: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Records invocations and replays queued outputs; anything unqueued
    /// succeeds with empty output.
    #[derive(Default)]
    pub struct MockRunner {
        calls: RefCell<Vec<Invocation>>,
        outputs: RefCell<VecDeque<Result<CommandOutput, io::ErrorKind>>>,
    }

    impl MockRunner {
        pub fn push_stdout(&self, status_code: i32, stdout: &str) {
            self.outputs.borrow_mut().push_back(Ok(CommandOutput {
                status_code,
                stdout: stdout.as_bytes().to_vec(),
                ..CommandOutput::default()
            }));
        }

        pub fn push_output(&self, output: CommandOutput) {
            self.outputs.borrow_mut().push_back(Ok(output));
        }

        pub fn push_spawn_error(&self, kind: io::ErrorKind) {
            self.outputs.borrow_mut().push_back(Err(kind));
        }

        pub fn calls(&self) -> Vec<Invocation> {
            self.calls.borrow().clone()
        }

        pub fn rendered_calls(&self) -> Vec<String> {
            self.calls.borrow().iter().map(Invocation::render).collect()
        }
    }

    impl CommandRunner for MockRunner {
        fn run(&self, invocation: &Invocation, _cwd: &Path) -> Result<CommandOutput, io::Error> {
            self.calls.borrow_mut().push(invocation.clone());
            match self.outputs.borrow_mut().pop_front() {
                Some(Ok(output)) => Ok(output),
                Some(Err(kind)) => Err(io::Error::new(kind, "mock spawn failure")),
                None => Ok(CommandOutput::default()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockRunner;
    use super::*;

    #[test]
    fn render_quotes_whitespace() {
        let inv = Invocation::new("docker")
            .args(["inspect", "--format", "{{.Config.Image}} x"])
            .captured();
        assert_eq!(inv.render(), "docker inspect --format \"{{.Config.Image}} x\"");
    }

    #[test]
    fn non_zero_exit_is_a_failed_outcome_not_an_error() {
        let runner = MockRunner::default();
        runner.push_output(CommandOutput {
            status_code: 2,
            stderr: b"permission denied".to_vec(),
            ..CommandOutput::default()
        });
        let outcome = run_check(&runner, Path::new("."), &Invocation::new("docker").arg("ps"));
        assert!(!outcome.success);
        assert_eq!(outcome.output, "permission denied");
    }

    #[test]
    fn spawn_failure_is_reported_as_failure() {
        let runner = MockRunner::default();
        runner.push_spawn_error(io::ErrorKind::NotFound);
        let outcome = run_check(&runner, Path::new("."), &Invocation::new("nope"));
        assert!(!outcome.success);
        assert!(outcome.output.contains("mock spawn failure"));
    }

    #[test]
    fn success_returns_trimmed_stdout() {
        let runner = MockRunner::default();
        runner.push_stdout(0, "  Docker version 27.0.1\n");
        let outcome = run_check(&runner, Path::new("."), &Invocation::new("docker"));
        assert_eq!(
            outcome,
            CommandOutcome {
                success: true,
                output: "Docker version 27.0.1".to_string()
            }
        );
    }

    #[test]
    fn missing_program_fails_without_panicking() {
        let outcome = run_check(
            &SystemRunner,
            Path::new("."),
            &Invocation::new("dkdeploy-definitely-missing-binary").captured(),
        );
        assert!(!outcome.success);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_slow_command() {
        let inv = Invocation::new("sleep")
            .arg("5")
            .captured()
            .timeout(Duration::from_millis(200));
        let started = Instant::now();
        let outcome = run_check(&SystemRunner, Path::new("."), &inv);
        assert!(!outcome.success);
        assert_eq!(outcome.output, TIMED_OUT_MESSAGE);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn captured_output_with_timeout_is_collected() {
        let inv = Invocation::new("echo")
            .arg("hello")
            .captured()
            .timeout(Duration::from_secs(5));
        let outcome = run_check(&SystemRunner, Path::new("."), &inv);
        assert!(outcome.success);
        assert_eq!(outcome.output, "hello");
    }
}
