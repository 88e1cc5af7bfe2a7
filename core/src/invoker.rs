//! The single choke point through which every privileged external command
//! runs: the bootstrap tool, the machine manager, the firewall tool, and
//! ad-hoc file-oriented helpers. Concentrating execution behind one trait is
//! what lets the Provisioning Pipeline, Lifecycle Controller, and
//! Port-Forward Rule Store all be exercised against a recording test double
//! instead of a real subprocess.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{OrchestratorError, Result};

/// The outcome of a single external command. Never implies success or
/// failure on its own — callers inspect `exit_code`.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Process exit code, or `-1` if the process was killed by a signal.
    pub exit_code: i32,
    /// Captured stdout, lossily decoded as UTF-8.
    pub stdout: String,
    /// Captured stderr, lossily decoded as UTF-8.
    pub stderr: String,
    /// Wall-clock time the call took, including process teardown.
    pub duration: Duration,
}

impl CommandOutcome {
    /// Build a synthetic successful outcome, for use in tests.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            duration: Duration::default(),
        }
    }

    /// Build a synthetic failed outcome, for use in tests.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            duration: Duration::default(),
        }
    }

    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The last `max_lines` lines of stderr, for inclusion in an error
    /// message. Never the full stderr, to keep stage errors readable.
    pub fn stderr_tail(&self, max_lines: usize) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

/// Runs external privileged commands with an explicit timeout and captured
/// output. Never raises on a non-zero exit — the caller decides what a
/// failing exit code means for its own stage.
#[async_trait]
pub trait HostInvoker: Send + Sync {
    /// Run `argv[0]` with `argv[1..]` as arguments, optionally feeding
    /// `stdin`, killing the child and returning `Err(Timeout)` if it has not
    /// exited after `call_timeout`.
    async fn run(
        &self,
        argv: &[&str],
        stdin: Option<&[u8]>,
        call_timeout: Duration,
        env: Option<&HashMap<String, String>>,
    ) -> Result<CommandOutcome>;
}

/// The real `HostInvoker`, backed by `tokio::process::Command`.
#[derive(Debug, Default)]
pub struct ProcessInvoker;

#[async_trait]
impl HostInvoker for ProcessInvoker {
    async fn run(
        &self,
        argv: &[&str],
        stdin: Option<&[u8]>,
        call_timeout: Duration,
        env: Option<&HashMap<String, String>>,
    ) -> Result<CommandOutcome> {
        let (exe, args) = argv
            .split_first()
            .ok_or_else(|| OrchestratorError::ValidationError("empty argv".to_string()))?;

        let mut cmd = Command::new(exe);
        cmd.args(args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        if let Some(env) = env {
            cmd.envs(env);
        }

        tracing::debug!(argv = ?argv, timeout = ?call_timeout, "exec");
        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| OrchestratorError::HostError(format!("spawning {exe}: {e}")))?;

        if let Some(data) = stdin {
            if let Some(mut si) = child.stdin.take() {
                use tokio::io::AsyncWriteExt;
                let _ = si.write_all(data).await;
            }
        } else {
            drop(child.stdin.take());
        }

        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout_pipe.read_to_end(&mut buf).await.map(|_| buf)
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr_pipe.read_to_end(&mut buf).await.map(|_| buf)
        });

        let status = match timeout(call_timeout, child.wait()).await {
            Ok(status) => {
                status.map_err(|e| OrchestratorError::HostError(format!("waiting on {exe}: {e}")))?
            }
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(OrchestratorError::Timeout(call_timeout));
            }
        };

        let duration = start.elapsed();
        let stdout = stdout_task
            .await
            .map_err(|e| OrchestratorError::HostError(e.to_string()))?
            .map_err(|e| OrchestratorError::HostError(e.to_string()))?;
        let stderr = stderr_task
            .await
            .map_err(|e| OrchestratorError::HostError(e.to_string()))?
            .map_err(|e| OrchestratorError::HostError(e.to_string()))?;
        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        let exit_code = status.code().unwrap_or(-1);

        if !status.success() {
            tracing::warn!(exit_code, stderr_tail = %{
                let outcome = CommandOutcome { exit_code, stdout: String::new(), stderr: stderr.clone(), duration };
                outcome.stderr_tail(20)
            }, "command failed");
        }

        Ok(CommandOutcome {
            exit_code,
            stdout,
            stderr,
            duration,
        })
    }
}

/// A single recorded `run()` invocation, captured by [`RecordingInvoker`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// The argv the call was made with.
    pub argv: Vec<String>,
    /// The timeout the call was made with.
    pub timeout: Duration,
}

/// A test double that records every call and replays scripted outcomes in
/// FIFO order. Pushing fewer outcomes than calls made is a test bug and
/// surfaces as a `HostError`, not a panic, so pipeline error-path tests stay
/// representative of what a real exhausted-retry caller would see.
#[derive(Debug, Default)]
pub struct RecordingInvoker {
    calls: std::sync::Mutex<Vec<RecordedCall>>,
    scripted: std::sync::Mutex<std::collections::VecDeque<CommandOutcome>>,
}

impl RecordingInvoker {
    /// Create an empty recorder with no scripted outcomes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next outcome to return, in call order.
    pub fn push_outcome(&self, outcome: CommandOutcome) {
        self.scripted.lock().unwrap().push_back(outcome);
    }

    /// Snapshot of every call made so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostInvoker for RecordingInvoker {
    async fn run(
        &self,
        argv: &[&str],
        _stdin: Option<&[u8]>,
        call_timeout: Duration,
        _env: Option<&HashMap<String, String>>,
    ) -> Result<CommandOutcome> {
        self.calls.lock().unwrap().push(RecordedCall {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            timeout: call_timeout,
        });
        self.scripted.lock().unwrap().pop_front().ok_or_else(|| {
            OrchestratorError::HostError("RecordingInvoker: no scripted outcome queued".into())
        })
    }
}
