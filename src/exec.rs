//! Execution controller: runs one analyzer plan under a wall-clock budget and
//! classifies the outcome as success, failure or timeout.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Literal placed at the start of the combined message of a timed-out run.
/// Parsers treat its presence as authoritative.
pub const TIMEOUT_SENTINEL: &str = "[Timed out]";

/// Exit codes that mean the tool itself broke rather than reported something.
pub const DEFAULT_DISALLOWED_EXIT_CODES: [i32; 10] = [1, 2, 126, 127, 128, 130, 137, 139, 143, 255];

/// How long to keep draining pipes after a timed-out child was killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

pub fn is_timed_out(raw: &str) -> bool {
    raw.contains(TIMEOUT_SENTINEL)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputStatus {
    Success,
    Fail,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub status: OutputStatus,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub message: String,
    /// Seconds, wall clock, across every step of the plan.
    pub execution_time: f64,
}

impl ToolOutput {
    fn not_spawned(message: String) -> Self {
        Self {
            status: OutputStatus::Fail,
            stdout: String::new(),
            stderr: String::new(),
            return_code: -1,
            message,
            execution_time: 0.0,
        }
    }

    /// Text handed to the parser.
    pub fn raw(&self) -> &str {
        &self.message
    }
}

fn combine(stdout: &str, stderr: &str) -> String {
    format!("stdout:\n{stdout}\nstderr:\n{stderr}")
}

fn timeout_message(stdout: &str, stderr: &str) -> String {
    if stdout.is_empty() && stderr.is_empty() {
        TIMEOUT_SENTINEL.to_string()
    } else {
        format!("{TIMEOUT_SENTINEL}\nPartial stdout:\n{stdout}\nPartial stderr:\n{stderr}")
    }
}

/// Exit codes treated as infrastructure failure for one tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitPolicy {
    disallowed: BTreeSet<i32>,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            disallowed: DEFAULT_DISALLOWED_EXIT_CODES.into_iter().collect(),
        }
    }
}

impl ExitPolicy {
    /// Narrow the set, for tools that use `code` to signal findings.
    pub fn without(mut self, code: i32) -> Self {
        self.disallowed.remove(&code);
        self
    }

    pub fn classify(&self, code: i32) -> OutputStatus {
        if code == 0 || !self.disallowed.contains(&code) {
            OutputStatus::Success
        } else {
            OutputStatus::Fail
        }
    }
}

/// One process launch within a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Files that must exist right before this step starts.
    pub required_inputs: Vec<PathBuf>,
    /// File the tool writes its report to; replaces stdout as parser input.
    pub report_file: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            required_inputs: Vec::new(),
            report_file: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.args.extend(
            args.into_iter()
                .map(|a| a.as_ref().to_string_lossy().into_owned()),
        );
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn requires(mut self, path: impl Into<PathBuf>) -> Self {
        self.required_inputs.push(path.into());
        self
    }

    pub fn report_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_file = Some(path.into());
        self
    }
}

/// Ordered steps sharing one timeout, plus scratch files removed afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub steps: Vec<Invocation>,
    pub cleanup: Vec<PathBuf>,
}

impl ExecutionPlan {
    pub fn single(step: Invocation) -> Self {
        Self {
            steps: vec![step],
            cleanup: Vec::new(),
        }
    }

    pub fn then(mut self, step: Invocation) -> Self {
        self.steps.push(step);
        self
    }

    pub fn cleanup(mut self, path: impl Into<PathBuf>) -> Self {
        self.cleanup.push(path.into());
        self
    }
}

/// Resolve a program name against `PATH`. Names containing a path separator
/// are checked as given.
pub fn find_binary(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

/// Resolve every step's program and check the first step's inputs, without
/// spawning anything. Later steps' inputs are produced by earlier steps and are
/// checked when their turn comes.
pub fn preflight(plan: &ExecutionPlan) -> Result<Vec<PathBuf>> {
    if let Some(first) = plan.steps.first() {
        if let Some(missing) = first.required_inputs.iter().find(|p| !p.exists()) {
            return Err(Error::input_not_found(missing));
        }
    }
    plan.steps
        .iter()
        .map(|step| find_binary(&step.program).ok_or_else(|| Error::binary_not_found(&step.program)))
        .collect()
}

/// Run every step of `plan` in order. Never errors: every problem becomes a
/// `Fail` or `Timeout` output.
pub async fn execute(plan: &ExecutionPlan, timeout: Duration, policy: &ExitPolicy) -> ToolOutput {
    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + timeout;

    let programs = match preflight(plan) {
        Ok(programs) => programs,
        Err(e) => return ToolOutput::not_spawned(format!("[{e}]")),
    };

    let mut last = ToolOutput::not_spawned("[Empty execution plan]".to_string());
    for (step, program) in plan.steps.iter().zip(programs) {
        last = run_step(step, &program, deadline, timeout, policy).await;
        if last.status != OutputStatus::Success {
            break;
        }
    }

    for path in &plan.cleanup {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "could not remove scratch file");
            }
        }
    }

    last.execution_time = started.elapsed().as_secs_f64();
    last
}

async fn run_step(
    step: &Invocation,
    program: &Path,
    deadline: tokio::time::Instant,
    budget: Duration,
    policy: &ExitPolicy,
) -> ToolOutput {
    if let Some(missing) = step.required_inputs.iter().find(|p| !p.exists()) {
        return ToolOutput::not_spawned(format!("[{}]", Error::input_not_found(missing)));
    }

    let mut cmd = Command::new(program);
    cmd.args(&step.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &step.cwd {
        cmd.current_dir(dir);
    }
    debug!(program = %program.display(), args = ?step.args, "spawning");

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ToolOutput::not_spawned(format!("[Failed to start {}: {e}]", step.program));
        }
    };

    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let mut readers = Vec::new();
    if let Some(pipe) = child.stdout.take() {
        readers.push(tokio::spawn(drain(pipe, Arc::clone(&stdout_buf))));
    }
    if let Some(pipe) = child.stderr.take() {
        readers.push(tokio::spawn(drain(pipe, Arc::clone(&stderr_buf))));
    }

    let waited = tokio::time::timeout_at(deadline, child.wait()).await;
    let timed_out = waited.is_err();
    if timed_out {
        if let Err(e) = child.kill().await {
            warn!(program = %step.program, error = %e, "failed to kill timed-out process");
        }
    }
    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(DRAIN_GRACE, reader).await.is_err() {
            abort.abort();
        }
    }

    let stdout = String::from_utf8_lossy(&stdout_buf.lock().await).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_buf.lock().await).into_owned();

    let status = match waited {
        Err(_) => {
            warn!(program = %step.program, budget_secs = budget.as_secs(), "timed out");
            return ToolOutput {
                status: OutputStatus::Timeout,
                message: timeout_message(&stdout, &stderr),
                stdout,
                stderr,
                return_code: -1,
                execution_time: 0.0,
            };
        }
        Ok(Err(e)) => {
            return ToolOutput {
                status: OutputStatus::Fail,
                message: format!("[Failed waiting for {}: {e}]\n{}", step.program, combine(&stdout, &stderr)),
                stdout,
                stderr,
                return_code: -1,
                execution_time: 0.0,
            };
        }
        Ok(Ok(status)) => status,
    };

    let return_code = exit_code(status);
    let classified = policy.classify(return_code);
    let mut message = combine(&stdout, &stderr);

    if classified == OutputStatus::Success {
        if let Some(report) = &step.report_file {
            match std::fs::read_to_string(report) {
                Ok(text) => message = text,
                Err(e) => {
                    return ToolOutput {
                        status: OutputStatus::Fail,
                        message: format!("[Report not readable: {}: {e}]\n{message}", report.display()),
                        stdout,
                        stderr,
                        return_code,
                        execution_time: 0.0,
                    };
                }
            }
        }
    } else {
        debug!(program = %step.program, return_code, "disallowed exit code");
    }

    ToolOutput {
        status: classified,
        stdout,
        stderr,
        return_code,
        message,
        execution_time: 0.0,
    }
}

async fn drain<R: AsyncRead + Unpin>(mut pipe: R, buf: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.lock().await.extend_from_slice(&chunk[..n]),
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
