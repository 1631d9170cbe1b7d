#![cfg(unix)]

use std::time::Duration;
use zkhydra::exec::{ExecutionPlan, ExitPolicy, Invocation, OutputStatus, TIMEOUT_SENTINEL, execute};

fn sh(script: &str) -> Invocation {
    Invocation::new("sh").args(["-c", script])
}

async fn run(step: Invocation, secs: u64) -> zkhydra::exec::ToolOutput {
    execute(&ExecutionPlan::single(step), Duration::from_secs(secs), &ExitPolicy::default()).await
}

#[tokio::test]
async fn clean_exit_combines_both_streams() {
    let out = run(sh("echo found; echo noisy 1>&2"), 10).await;
    assert_eq!(out.status, OutputStatus::Success);
    assert_eq!(out.return_code, 0);
    assert_eq!(out.stdout, "found\n");
    assert_eq!(out.message, "stdout:\nfound\n\nstderr:\nnoisy\n");
    assert!(out.execution_time >= 0.0);
}

#[tokio::test]
async fn disallowed_exit_code_is_a_failure() {
    let out = run(sh("echo partial; exit 2"), 10).await;
    assert_eq!(out.status, OutputStatus::Fail);
    assert_eq!(out.return_code, 2);
    assert!(out.message.contains("partial"));
}

#[tokio::test]
async fn other_nonzero_codes_are_tool_signal() {
    let out = run(sh("exit 3"), 10).await;
    assert_eq!(out.status, OutputStatus::Success);

    let plan = ExecutionPlan::single(sh("echo warnings; exit 1"));
    let out = execute(&plan, Duration::from_secs(10), &ExitPolicy::default().without(1)).await;
    assert_eq!(out.status, OutputStatus::Success);
}

#[tokio::test]
async fn killed_by_signal_maps_into_disallowed_set() {
    let out = run(sh("kill -9 $$"), 10).await;
    assert_eq!(out.return_code, 137);
    assert_eq!(out.status, OutputStatus::Fail);
}

#[tokio::test]
async fn timeout_keeps_partial_output() {
    let out = run(sh("echo halfway; exec sleep 30"), 1).await;
    assert_eq!(out.status, OutputStatus::Timeout);
    assert!(out.message.starts_with(TIMEOUT_SENTINEL));
    assert!(out.message.contains("Partial stdout:\nhalfway"));
    assert!(out.execution_time < 10.0);
}

#[tokio::test]
async fn report_file_replaces_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("out.log");
    let step = Invocation::new("sh")
        .args(["-c", "echo console; echo '** result: CONSTRAINED' > \"$1\"", "sh"])
        .arg(&report)
        .report_file(&report);
    let out = run(step, 10).await;
    assert_eq!(out.status, OutputStatus::Success);
    assert_eq!(out.message, "** result: CONSTRAINED\n");
}

#[tokio::test]
async fn missing_input_never_spawns() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("spawned");
    let step = sh(&format!("touch {}", marker.display())).requires(dir.path().join("circuit.circom"));
    let out = run(step, 10).await;
    assert_eq!(out.status, OutputStatus::Fail);
    assert!(out.message.contains("Input not found"));
    assert!(!marker.exists());
}

#[tokio::test]
async fn later_step_checks_inputs_produced_earlier() {
    let dir = tempfile::tempdir().unwrap();
    let r1cs = dir.path().join("circuit.r1cs");
    let plan = ExecutionPlan::single(sh("true"))
        .then(sh("echo analyzed").requires(&r1cs));
    let out = execute(&plan, Duration::from_secs(10), &ExitPolicy::default()).await;
    assert_eq!(out.status, OutputStatus::Fail);
    assert!(out.message.contains("Input not found"));

    let plan = ExecutionPlan::single(sh(&format!("touch {}", r1cs.display())))
        .then(sh("echo analyzed").requires(&r1cs))
        .cleanup(&r1cs);
    let out = execute(&plan, Duration::from_secs(10), &ExitPolicy::default()).await;
    assert_eq!(out.status, OutputStatus::Success);
    assert!(out.message.contains("analyzed"));
    assert!(!r1cs.exists(), "scratch files are removed");
}
