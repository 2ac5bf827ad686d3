use super::*;

#[tokio::test]
async fn run_captures_stdout() {
    let runner = TokioProcessRunner;
    let command = ProcessCommandBuilder::new("echo").arg("hello").build();
    let output = runner.run(command).await.unwrap();
    assert!(output.status.success());
    assert_eq!(output.stdout.trim(), "hello");
}

#[tokio::test]
async fn run_reports_exit_code() {
    let runner = TokioProcessRunner;
    let command = ProcessCommandBuilder::new("sh")
        .args(["-c", "exit 3"])
        .build();
    let output = runner.run(command).await.unwrap();
    assert_eq!(output.status, ExitStatus::Error(3));
    assert_eq!(output.status.code(), Some(3));
}

#[tokio::test]
async fn run_missing_program_is_command_not_found() {
    let runner = TokioProcessRunner;
    let command = ProcessCommandBuilder::new("definitely-not-a-real-binary-xyz").build();
    let err = runner.run(command).await.unwrap_err();
    assert!(matches!(err, ProcessError::CommandNotFound(_)));
}

#[tokio::test]
async fn spawn_streams_lines_and_exposes_pid() {
    let runner = TokioProcessRunner;
    let command = ProcessCommandBuilder::new("sh")
        .args(["-c", "echo one; echo two"])
        .build();
    let mut spawned = runner.spawn(command).await.unwrap();
    assert!(spawned.pid.is_some());

    let mut lines = Vec::new();
    while let Some(line) = spawned.lines.recv().await {
        lines.push(line);
    }
    assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    assert!(spawned.status.await.unwrap().success());
}

#[tokio::test]
async fn mock_matches_by_args() {
    let (subprocess, mock) = SubprocessManager::mock();
    mock.expect_success("git", &["status", "--porcelain"], " M file.rs");
    mock.expect_command("git")
        .with_args(|args| args.first().map(String::as_str) == Some("push"))
        .returns_exit_code(128)
        .finish();

    let runner = subprocess.runner();
    let ok = runner
        .run(
            ProcessCommandBuilder::new("git")
                .args(["status", "--porcelain"])
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(ok.stdout, " M file.rs");

    let failed = runner
        .run(ProcessCommandBuilder::new("git").arg("push").build())
        .await
        .unwrap();
    assert_eq!(failed.status, ExitStatus::Error(128));
}

#[tokio::test]
async fn mock_unexpected_command_errors() {
    let (subprocess, _mock) = SubprocessManager::mock();
    let err = subprocess
        .runner()
        .run(ProcessCommandBuilder::new("git").arg("status").build())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::MockExpectationNotMet(_)));
}

#[tokio::test]
async fn mock_spawn_streams_canned_output() {
    let (subprocess, mock) = SubprocessManager::mock();
    mock.expect_command("agent")
        .returns_stdout("line a\nline b")
        .finish();

    let mut spawned = subprocess
        .runner()
        .spawn(ProcessCommandBuilder::new("agent").build())
        .await
        .unwrap();
    assert!(spawned.pid.is_some());
    let mut lines = Vec::new();
    while let Some(line) = spawned.lines.recv().await {
        lines.push(line);
    }
    assert_eq!(lines, vec!["line a", "line b"]);
    assert!(spawned.status.await.unwrap().success());
}
