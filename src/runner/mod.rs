//! Run orchestration: drives analyzers over one circuit or a bug dataset,
//! one subprocess at a time, and persists every intermediate artifact.

use crate::error::{Error, Result as CrateResult};
use crate::evaluation::EvaluationResult;
use crate::exec::{self, OutputStatus, ToolOutput};
use crate::ground_truth::{BugEntry, GroundTruth, discover_bugs};
use crate::output::{self, AnalyzeSummary, RunSummary};
use crate::tools::{
    AnalysisStatus, Analyzer, Artifacts, CircuitInput, ParseScope, ToolRegistry, ToolResult, ToolStatus,
};
use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

pub const RAW_FILE: &str = "raw.txt";
pub const TOOL_OUTPUT_FILE: &str = "tool_output.json";
pub const PARSED_FILE: &str = "parsed.json";
pub const RESULTS_FILE: &str = "results.json";
pub const EVALUATION_FILE: &str = "evaluation.json";
pub const GROUND_TRUTH_FILE: &str = "ground_truth.json";
pub const SUMMARY_FILE: &str = "summary.json";

/// Shared by every mode that spawns analyzers.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Parent of the timestamped run directory.
    pub output: PathBuf,
    pub timeout: Duration,
}

impl RunSettings {
    fn run_dir(&self, mode: &str) -> Result<PathBuf> {
        let name = format!("{mode}_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let dir = std::path::absolute(self.output.join(name))?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating run directory {}", dir.display()))?;
        Ok(dir)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> CrateResult<()> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn absolute_input(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        return Err(Error::input_not_found(path).into());
    }
    Ok(std::path::absolute(path)?)
}

// -- One tool, one circuit --

/// Execute `analyzer` on `circuit` and leave `raw.txt`, `tool_output.json`,
/// `parsed.json` and `results.json` in `tool_dir`. Never fails: problems
/// become a `Failed` or `Timeout` result.
pub async fn run_tool(
    analyzer: &dyn Analyzer,
    circuit: &Path,
    tool_dir: &Path,
    scope: &ParseScope,
    timeout: Duration,
) -> ToolResult {
    let name = analyzer.name();
    if let Err(e) = std::fs::create_dir_all(tool_dir) {
        return ToolResult::failed(name, "Could not create tool output directory", e.to_string(), 0.0);
    }

    info!(tool = name, circuit = %circuit.display(), "running");
    let input = CircuitInput::new(circuit, tool_dir);
    let output = exec::execute(&analyzer.plan(&input), timeout, &analyzer.exit_policy()).await;
    info!(tool = name, status = ?output.status, elapsed = output.execution_time, "finished");

    let mut artifacts = Artifacts::default();
    let raw = tool_dir.join(RAW_FILE);
    match std::fs::write(&raw, output.raw()) {
        Ok(()) => artifacts.raw = Some(raw),
        Err(e) => warn!(tool = name, error = %e, "could not write raw output"),
    }
    let stored = tool_dir.join(TOOL_OUTPUT_FILE);
    match write_json(&stored, &output) {
        Ok(()) => artifacts.tool_output = Some(stored),
        Err(e) => warn!(tool = name, error = %e, "could not write tool output"),
    }

    process_output(analyzer, &output, tool_dir, scope, artifacts)
}

/// Parse and normalize a stored execution, writing `parsed.json` and
/// `results.json`. Shared by fresh runs and `reprocess`.
pub fn process_output(
    analyzer: &dyn Analyzer,
    output: &ToolOutput,
    tool_dir: &Path,
    scope: &ParseScope,
    mut artifacts: Artifacts,
) -> ToolResult {
    let name = analyzer.name();
    let mut result = classify(analyzer, output, tool_dir, scope, &mut artifacts);
    let results = tool_dir.join(RESULTS_FILE);
    result.artifacts = artifacts;
    result.artifacts.results = Some(results.clone());
    if let Err(e) = write_json(&results, &result) {
        warn!(tool = name, error = %e, "could not write results");
        result.artifacts.results = None;
    }
    result
}

fn classify(
    analyzer: &dyn Analyzer,
    output: &ToolOutput,
    tool_dir: &Path,
    scope: &ParseScope,
    artifacts: &mut Artifacts,
) -> ToolResult {
    let name = analyzer.name();
    let elapsed = output.execution_time;

    if output.status == OutputStatus::Fail {
        let detail = first_line(&output.message);
        let error = Error::process(name, format!("exit code {}: {detail}", output.return_code));
        warn!(tool = name, error = %error, "tool failed");
        return ToolResult::failed(name, "Tool did not complete", error.to_string(), elapsed);
    }

    let parsed = match analyzer.parse(output.raw(), scope) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(tool = name, error = %e, "could not parse output");
            return ToolResult::failed(name, "Output could not be parsed", e.to_string(), elapsed);
        }
    };
    let parsed_path = tool_dir.join(PARSED_FILE);
    match write_json(&parsed_path, &parsed) {
        Ok(()) => artifacts.parsed = Some(parsed_path),
        Err(e) => warn!(tool = name, error = %e, "could not write parsed output"),
    }

    let normalized = match analyzer.normalize(&parsed) {
        Ok(normalized) => normalized,
        Err(e) => {
            warn!(tool = name, error = %e, "could not normalize output");
            return ToolResult::failed(name, "Output could not be normalized", e.to_string(), elapsed);
        }
    };

    let timed_out = output.status == OutputStatus::Timeout || normalized.status == AnalysisStatus::Timeout;
    let (status, message, error) = if timed_out {
        let secs = elapsed.round() as u64;
        (ToolStatus::Timeout, exec::TIMEOUT_SENTINEL.to_string(), Some(Error::Timeout(secs).to_string()))
    } else {
        match normalized.status {
            AnalysisStatus::Error => {
                let detail = normalized.error.clone().unwrap_or_else(|| "tool reported an error".into());
                (ToolStatus::Failed, "Tool reported an error".to_string(), Some(Error::process(name, detail).to_string()))
            }
            AnalysisStatus::BugsFound => (
                ToolStatus::Success,
                format!("Found {} issue(s)", normalized.findings.len()),
                None,
            ),
            _ => (ToolStatus::Success, "No issues found".to_string(), None),
        }
    };

    ToolResult {
        tool: name.to_string(),
        status,
        analysis_status: Some(if timed_out { AnalysisStatus::Timeout } else { normalized.status }),
        message,
        execution_time: elapsed,
        findings: normalized.findings,
        error,
        artifacts: Artifacts::default(),
    }
}

fn first_line(message: &str) -> &str {
    message
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && *l != "stdout:" && *l != "stderr:")
        .unwrap_or("no output")
}

/// Write `evaluation.json` unless a reviewer has already settled the item.
/// Returns whichever evaluation is now on disk.
pub fn write_evaluation(tool_dir: &Path, evaluation: EvaluationResult) -> CrateResult<EvaluationResult> {
    let path = tool_dir.join(EVALUATION_FILE);
    if let Ok(text) = std::fs::read_to_string(&path) {
        match serde_json::from_str::<EvaluationResult>(&text) {
            Ok(existing) if existing.is_reviewed() => {
                info!(path = %path.display(), "keeping reviewed evaluation");
                return Ok(existing);
            }
            Ok(_) => {}
            Err(e) => debug!(path = %path.display(), error = %e, "replacing unreadable evaluation"),
        }
    }
    write_json(&path, &evaluation)?;
    Ok(evaluation)
}

// -- Modes --

/// Run every tool on one circuit with no ground truth.
pub async fn analyze(tools: &[Arc<dyn Analyzer>], circuit: &Path, settings: &RunSettings) -> Result<AnalyzeSummary> {
    let circuit = absolute_input(circuit)?;
    let run_dir = settings.run_dir("analyze")?;
    info!(circuit = %circuit.display(), tools = tools.len(), run_dir = %run_dir.display(), "analyzing");

    let mut results = Vec::with_capacity(tools.len());
    for tool in tools {
        let tool_dir = run_dir.join(tool.name());
        results.push(run_tool(tool.as_ref(), &circuit, &tool_dir, &ParseScope::default(), settings.timeout).await);
    }

    let summary = AnalyzeSummary::new(Some(circuit), &results);
    summary.save(&run_dir)?;
    info!(path = %run_dir.display(), "analysis written");
    Ok(summary)
}

/// Run every tool on one bug and judge each completed run against its
/// ground truth. `bug_dir` receives `ground_truth.json` and one directory
/// per tool.
pub async fn evaluate_bug(
    tools: &[Arc<dyn Analyzer>],
    entry: &BugEntry,
    bug_dir: &Path,
    timeout: Duration,
) -> CrateResult<Vec<ToolResult>> {
    let ground_truth = GroundTruth::from_bug_config(&entry.config_path)?;
    let circuit = entry
        .circuit
        .clone()
        .ok_or_else(|| Error::input_not_found(entry.dir.join("circuits").join("circuit.circom")))?;
    let circuit = std::path::absolute(circuit)?;

    std::fs::create_dir_all(bug_dir)?;
    ground_truth.save(&bug_dir.join(GROUND_TRUTH_FILE))?;
    let scope = ground_truth.function().map(ParseScope::function).unwrap_or_default();

    let mut results = Vec::with_capacity(tools.len());
    for tool in tools {
        let tool_dir = bug_dir.join(tool.name());
        let result = run_tool(tool.as_ref(), &circuit, &tool_dir, &scope, timeout).await;
        if result.status == ToolStatus::Success {
            let evaluation = write_evaluation(&tool_dir, tool.evaluate(&ground_truth, &result))?;
            info!(tool = tool.name(), bug = %ground_truth.bug_name, verdict = ?evaluation.status, "evaluated");
        }
        results.push(result);
    }
    Ok(results)
}

/// Evaluate a single bug directory or `zkbugs_config.json`.
pub async fn evaluate(tools: &[Arc<dyn Analyzer>], input: &Path, settings: &RunSettings) -> Result<RunSummary> {
    let entry = BugEntry::locate(input)?;
    let run_dir = settings.run_dir("evaluate")?;
    evaluate_bug(tools, &entry, &run_dir.join(&entry.name), settings.timeout)
        .await
        .with_context(|| format!("evaluating {}", entry.dir.display()))?;
    output::rebuild(&run_dir)
}

/// Evaluate every bug under `dataset`. One bug's failure is logged and the
/// run moves on.
pub async fn zkbugs(tools: &[Arc<dyn Analyzer>], dataset: &Path, settings: &RunSettings) -> Result<RunSummary> {
    let bugs = discover_bugs(dataset);
    if bugs.is_empty() {
        bail!("No bug configs found under {}", dataset.display());
    }
    let run_dir = settings.run_dir("zkbugs")?;
    info!(bugs = bugs.len(), dataset = %dataset.display(), run_dir = %run_dir.display(), "evaluating dataset");

    let mut failed = 0usize;
    for (i, entry) in bugs.iter().enumerate() {
        if entry.circuit.is_none() {
            warn!(bug = %entry.name, "no circuits/circuit.circom, skipping");
            continue;
        }
        let relative = entry.dir.strip_prefix(dataset).unwrap_or(&entry.dir);
        let bug_dir = run_dir.join(relative);
        info!(bug = %entry.name, progress = %format!("{}/{}", i + 1, bugs.len()), "bug");
        if let Err(e) = evaluate_bug(tools, entry, &bug_dir, settings.timeout).await {
            failed += 1;
            error!(bug = %entry.name, error = %e, "bug evaluation failed");
        }
    }
    if failed > 0 {
        warn!(failed, "some bugs could not be evaluated");
    }
    output::rebuild(&run_dir)
}

/// Re-parse every stored `tool_output.json` under `run_dir` with the current
/// adapters. With `reevaluate`, bugs with a `ground_truth.json` are judged
/// again (reviewed evaluations stay untouched).
pub fn reprocess(registry: &ToolRegistry, run_dir: &Path, reevaluate: bool) -> Result<RunSummary> {
    if !run_dir.is_dir() {
        return Err(Error::input_not_found(run_dir).into());
    }
    let mut stored: Vec<PathBuf> = WalkDir::new(run_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == TOOL_OUTPUT_FILE)
        .map(|e| e.into_path())
        .collect();
    stored.sort();
    if stored.is_empty() {
        bail!("No {TOOL_OUTPUT_FILE} files under {}", run_dir.display());
    }

    for path in &stored {
        let Some(tool_dir) = path.parent() else { continue };
        let Some(tool_name) = tool_dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let Some(analyzer) = registry.get(&tool_name) else {
            warn!(tool = %tool_name, path = %path.display(), "no adapter for stored output, skipping");
            continue;
        };
        if let Err(e) = reprocess_one(analyzer.as_ref(), path, tool_dir, reevaluate) {
            error!(tool = %tool_name, path = %path.display(), error = %e, "reprocessing failed");
        }
    }
    output::rebuild(run_dir)
}

fn reprocess_one(analyzer: &dyn Analyzer, stored: &Path, tool_dir: &Path, reevaluate: bool) -> CrateResult<()> {
    let output: ToolOutput = serde_json::from_str(&std::fs::read_to_string(stored)?)?;
    let ground_truth_path = tool_dir.parent().map(|bug| bug.join(GROUND_TRUTH_FILE));
    let ground_truth = match ground_truth_path {
        Some(path) if path.is_file() => Some(GroundTruth::load(&path)?),
        _ => None,
    };
    let scope = ground_truth
        .as_ref()
        .and_then(GroundTruth::function)
        .map(ParseScope::function)
        .unwrap_or_default();

    let artifacts = Artifacts {
        raw: Some(tool_dir.join(RAW_FILE)).filter(|p| p.is_file()),
        tool_output: Some(stored.to_path_buf()),
        ..Artifacts::default()
    };
    let result = process_output(analyzer, &output, tool_dir, &scope, artifacts);
    debug!(tool = analyzer.name(), status = ?result.status, "reprocessed");

    if let (true, Some(ground_truth)) = (reevaluate, ground_truth) {
        if result.status == ToolStatus::Success {
            write_evaluation(tool_dir, analyzer.evaluate(&ground_truth, &result))?;
        } else {
            discard_evaluation(tool_dir)?;
        }
    }
    Ok(())
}

/// Drops an unreviewed evaluation left over from an earlier successful run.
fn discard_evaluation(tool_dir: &Path) -> CrateResult<()> {
    let path = tool_dir.join(EVALUATION_FILE);
    let Ok(text) = std::fs::read_to_string(&path) else {
        return Ok(());
    };
    if let Ok(existing) = serde_json::from_str::<EvaluationResult>(&text) {
        if existing.is_reviewed() {
            info!(path = %path.display(), "keeping reviewed evaluation");
            return Ok(());
        }
    }
    debug!(path = %path.display(), "removing stale evaluation");
    std::fs::remove_file(&path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::{ManualAnalysis, Verdict};

    #[test]
    fn reviewed_evaluation_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let mut reviewed = EvaluationResult::undecided("circuit-level finding");
        reviewed.status = Verdict::TruePositive;
        reviewed.manual_analysis = ManualAnalysis::Done;
        reviewed.manual_analysis_reasoning = "counterexample hits the missing check".into();
        write_json(&dir.path().join(EVALUATION_FILE), &reviewed).unwrap();

        let kept = write_evaluation(dir.path(), EvaluationResult::undecided("again")).unwrap();
        assert_eq!(kept, reviewed);
        let on_disk: EvaluationResult =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(EVALUATION_FILE)).unwrap()).unwrap();
        assert_eq!(on_disk.status, Verdict::TruePositive);
    }

    #[test]
    fn pending_evaluation_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        write_evaluation(dir.path(), EvaluationResult::undecided("first")).unwrap();
        let now = write_evaluation(dir.path(), EvaluationResult::false_negative("second")).unwrap();
        assert_eq!(now.status, Verdict::FalseNegative);
    }

    #[test]
    fn stale_evaluation_is_discarded_unless_reviewed() {
        let dir = tempfile::tempdir().unwrap();
        write_evaluation(dir.path(), EvaluationResult::undecided("unsound")).unwrap();
        discard_evaluation(dir.path()).unwrap();
        assert!(!dir.path().join(EVALUATION_FILE).exists());

        let mut reviewed = EvaluationResult::undecided("unsound");
        reviewed.manual_analysis = ManualAnalysis::Done;
        write_evaluation(dir.path(), reviewed).unwrap();
        discard_evaluation(dir.path()).unwrap();
        assert!(dir.path().join(EVALUATION_FILE).exists());

        discard_evaluation(tempfile::tempdir().unwrap().path()).unwrap();
    }

    #[test]
    fn failure_detail_skips_stream_headers() {
        assert_eq!(first_line("stdout:\n\nstderr:\nsegfault\n"), "segfault");
        assert_eq!(first_line("stdout:\n\nstderr:\n"), "no output");
    }
}
