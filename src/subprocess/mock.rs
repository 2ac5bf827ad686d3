use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::error::ProcessError;
use super::runner::{ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner, SpawnedProcess};

/// Expectation-based process runner for tests.
///
/// Expectations are matched in registration order by program name and an
/// optional argument predicate; `spawn` reuses the same expectations,
/// streaming the canned stdout line by line under a synthetic PID.
#[derive(Clone)]
pub struct MockProcessRunner {
    expectations: Arc<Mutex<Vec<MockExpectation>>>,
    call_history: Arc<Mutex<Vec<ProcessCommand>>>,
    next_pid: Arc<AtomicU32>,
}

struct MockExpectation {
    program: String,
    #[allow(clippy::type_complexity)]
    args_matcher: Option<Box<dyn Fn(&[String]) -> bool + Send + Sync>>,
    response: ProcessOutput,
    times_called: usize,
    expected_times: Option<usize>,
}

pub struct MockCommandConfig {
    runner: MockProcessRunner,
    expectation: MockExpectation,
}

impl MockProcessRunner {
    pub fn new() -> Self {
        Self {
            expectations: Arc::new(Mutex::new(Vec::new())),
            call_history: Arc::new(Mutex::new(Vec::new())),
            next_pid: Arc::new(AtomicU32::new(40_000)),
        }
    }

    pub fn expect_command(&self, program: &str) -> MockCommandConfig {
        MockCommandConfig {
            runner: self.clone(),
            expectation: MockExpectation {
                program: program.to_string(),
                args_matcher: None,
                response: ProcessOutput {
                    status: ExitStatus::Success,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: Duration::from_millis(10),
                },
                times_called: 0,
                expected_times: None,
            },
        }
    }

    /// Convenience: expect `program` with exactly `args`, returning `stdout`
    /// on success.
    pub fn expect_success(&self, program: &str, args: &[&str], stdout: &str) {
        let expected: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.expect_command(program)
            .with_args(move |actual| actual == expected.as_slice())
            .returns_stdout(stdout)
            .finish();
    }

    pub fn verify_called(&self, program: &str, times: usize) -> bool {
        let history = self.call_history.lock().unwrap();
        let count = history.iter().filter(|cmd| cmd.program == program).count();
        count == times
    }

    pub fn call_history(&self) -> Vec<ProcessCommand> {
        self.call_history.lock().unwrap().clone()
    }

    pub fn reset(&self) {
        self.expectations.lock().unwrap().clear();
        self.call_history.lock().unwrap().clear();
    }

    fn match_expectation(&self, command: &ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        self.call_history.lock().unwrap().push(command.clone());

        let mut expectations = self.expectations.lock().unwrap();
        for expectation in expectations.iter_mut() {
            if expectation.program != command.program {
                continue;
            }
            if let Some(ref args_matcher) = expectation.args_matcher {
                if !(args_matcher)(&command.args) {
                    continue;
                }
            }
            if let Some(expected) = expectation.expected_times {
                // Exhausted expectations yield to later registrations so a
                // test can script successive responses for the same probe.
                if expectation.times_called >= expected {
                    continue;
                }
            }
            expectation.times_called += 1;
            return Ok(expectation.response.clone());
        }

        Err(ProcessError::MockExpectationNotMet(format!(
            "No expectation found for command: {} {:?}",
            command.program, command.args
        )))
    }
}

#[async_trait]
impl ProcessRunner for MockProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        self.match_expectation(&command)
    }

    async fn spawn(&self, command: ProcessCommand) -> Result<SpawnedProcess, ProcessError> {
        let response = self.match_expectation(&command)?;
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel::<String>(256);
        let stdout = response.stdout.clone();
        tokio::spawn(async move {
            for line in stdout.lines() {
                if tx.send(line.to_string()).await.is_err() {
                    break;
                }
            }
        });

        let status = response.status;
        Ok(SpawnedProcess {
            pid: Some(pid),
            lines: rx,
            status: Box::pin(async move { Ok(status) }),
        })
    }
}

impl MockCommandConfig {
    pub fn with_args<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.expectation.args_matcher = Some(Box::new(matcher));
        self
    }

    pub fn returns_stdout(mut self, stdout: &str) -> Self {
        self.expectation.response.stdout = stdout.to_string();
        self
    }

    pub fn returns_stderr(mut self, stderr: &str) -> Self {
        self.expectation.response.stderr = stderr.to_string();
        self
    }

    pub fn returns_exit_code(mut self, code: i32) -> Self {
        self.expectation.response.status = if code == 0 {
            ExitStatus::Success
        } else {
            ExitStatus::Error(code)
        };
        self
    }

    pub fn times(mut self, n: usize) -> Self {
        self.expectation.expected_times = Some(n);
        self
    }

    pub fn finish(self) {
        self.runner
            .expectations
            .lock()
            .unwrap()
            .push(self.expectation);
    }
}

impl Default for MockProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}
