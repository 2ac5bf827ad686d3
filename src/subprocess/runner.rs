use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use super::error::ProcessError;

#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Timeout,
    Signal(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Success => Some(0),
            ExitStatus::Error(code) => Some(*code),
            _ => None,
        }
    }
}

pub type StatusFuture = BoxFuture<'static, Result<ExitStatus, ProcessError>>;

/// A tracked child process.
///
/// The PID is available immediately so the scheduler can register it for
/// cancellation and crash recovery. Stdout and stderr arrive merged,
/// line-buffered, on `lines`; `status` resolves once the child exits.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub lines: mpsc::Receiver<String>,
    pub status: StatusFuture,
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion and capture the full output.
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError>;

    /// Spawn a tracked child with streaming output.
    async fn spawn(&self, command: ProcessCommand) -> Result<SpawnedProcess, ProcessError>;
}

fn map_exit(status: std::process::ExitStatus) -> ExitStatus {
    if status.success() {
        return ExitStatus::Success;
    }
    if let Some(code) = status.code() {
        return ExitStatus::Error(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitStatus::Signal(signal);
        }
    }
    ExitStatus::Error(1)
}

fn base_command(command: &ProcessCommand) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(&command.program);
    cmd.args(&command.args);
    for (key, value) in &command.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &command.working_dir {
        cmd.current_dir(dir);
    }
    cmd
}

pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        let start = std::time::Instant::now();

        tracing::debug!(
            "Executing subprocess: {} {}",
            command.program,
            command.args.join(" ")
        );

        let mut cmd = base_command(&command);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::CommandNotFound(command.program.clone())
            } else {
                ProcessError::Io(e)
            }
        })?;

        let output = if let Some(timeout_duration) = command.timeout {
            match tokio::time::timeout(timeout_duration, child.wait_with_output()).await {
                Ok(result) => result.map_err(ProcessError::Io)?,
                Err(_) => return Err(ProcessError::Timeout(timeout_duration)),
            }
        } else {
            child.wait_with_output().await.map_err(ProcessError::Io)?
        };

        let duration = start.elapsed();
        let status = map_exit(output.status);

        if let ExitStatus::Error(code) = &status {
            tracing::debug!(
                "Subprocess failed with exit code {} in {:?}: {} {}",
                code,
                duration,
                command.program,
                command.args.join(" ")
            );
        }

        Ok(ProcessOutput {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration,
        })
    }

    async fn spawn(&self, command: ProcessCommand) -> Result<SpawnedProcess, ProcessError> {
        tracing::debug!(
            "Spawning subprocess: {} {}",
            command.program,
            command.args.join(" ")
        );

        let mut cmd = base_command(&command);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        // Own process group so cancellation can reach grandchildren.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::CommandNotFound(command.program.clone())
            } else {
                ProcessError::Io(e)
            }
        })?;

        let pid = child.id();
        let (tx, rx) = mpsc::channel::<String>(256);

        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }

        let timeout = command.timeout;
        let status: StatusFuture = Box::pin(async move {
            let wait = child.wait();
            let status = if let Some(limit) = timeout {
                match tokio::time::timeout(limit, wait).await {
                    Ok(result) => result.map_err(ProcessError::Io)?,
                    Err(_) => {
                        let _ = child.kill().await;
                        return Err(ProcessError::Timeout(limit));
                    }
                }
            } else {
                wait.await.map_err(ProcessError::Io)?
            };
            Ok(map_exit(status))
        });

        Ok(SpawnedProcess {
            pid,
            lines: rx,
            status,
        })
    }
}
