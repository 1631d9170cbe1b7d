use crate::error::Result;
use crate::evaluation::{EvaluationResult, Verdict};
use crate::runner::{EVALUATION_FILE, GROUND_TRUTH_FILE, RESULTS_FILE, SUMMARY_FILE};
use crate::tools::{AnalysisStatus, ToolResult, ToolStatus};
use askama::Template;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const MANUAL_REVIEW_FILE: &str = "manual_review_todo.md";

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

// -- Analyze runs --

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub total_tools: usize,
    pub success: usize,
    pub failed: usize,
    pub timeout: usize,
}

impl RunStatistics {
    pub fn from_results(results: &[ToolResult]) -> Self {
        let count = |status| results.iter().filter(|r| r.status == status).count();
        Self {
            total_tools: results.len(),
            success: count(ToolStatus::Success),
            failed: count(ToolStatus::Failed),
            timeout: count(ToolStatus::Timeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSummary {
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_status: Option<AnalysisStatus>,
    pub findings: usize,
    pub execution_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeSummary {
    pub circuit: Option<PathBuf>,
    pub generated_at: String,
    pub tools: BTreeMap<String, ToolSummary>,
    pub statistics: RunStatistics,
}

impl AnalyzeSummary {
    pub fn new(circuit: Option<PathBuf>, results: &[ToolResult]) -> Self {
        let tools = results
            .iter()
            .map(|r| {
                let summary = ToolSummary {
                    status: r.status,
                    analysis_status: r.analysis_status,
                    findings: r.findings.len(),
                    execution_time: r.execution_time,
                    error: r.error.clone(),
                };
                (r.tool.clone(), summary)
            })
            .collect();
        Self {
            circuit,
            generated_at: Utc::now().to_rfc3339(),
            tools,
            statistics: RunStatistics::from_results(results),
        }
    }

    pub fn save(&self, run_dir: &Path) -> Result<()> {
        write_json(&run_dir.join(SUMMARY_FILE), self)
    }
}

// -- Evaluation runs --

/// One (bug, tool) pair as found on disk.
#[derive(Debug, Clone)]
pub struct EvaluatedRun {
    pub bug: String,
    pub tool_dir: PathBuf,
    pub result: ToolResult,
    pub evaluation: Option<EvaluationResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolTally {
    #[serde(rename = "TruePositive")]
    pub true_positive: usize,
    #[serde(rename = "FalseNegative")]
    pub false_negative: usize,
    #[serde(rename = "Undecided")]
    pub undecided: usize,
    #[serde(rename = "Timeouts")]
    pub timeouts: usize,
    #[serde(rename = "Errors")]
    pub errors: usize,
    /// Items whose verdict came from a human reviewer.
    pub reviewed: usize,
    /// Seconds, over runs that completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub median_execution_time: Option<f64>,
}

impl ToolTally {
    fn add(&mut self, run: &EvaluatedRun) {
        match (run.result.status, &run.evaluation) {
            (ToolStatus::Timeout, _) => self.timeouts += 1,
            (ToolStatus::Failed, _) => self.errors += 1,
            (ToolStatus::Success, Some(evaluation)) => {
                match evaluation.status {
                    Verdict::TruePositive => self.true_positive += 1,
                    Verdict::FalseNegative => self.false_negative += 1,
                    Verdict::Undecided => self.undecided += 1,
                }
                if evaluation.is_reviewed() {
                    self.reviewed += 1;
                }
            }
            (ToolStatus::Success, None) => {
                debug!(bug = %run.bug, tool = %run.result.tool, "completed run has no evaluation")
            }
        }
    }

    fn merge(&mut self, other: &ToolTally) {
        self.true_positive += other.true_positive;
        self.false_negative += other.false_negative;
        self.undecided += other.undecided;
        self.timeouts += other.timeouts;
        self.errors += other.errors;
        self.reviewed += other.reviewed;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub bug: String,
    pub tool: String,
    pub status: Verdict,
    pub reason: String,
    pub evaluation: PathBuf,
    pub reviewed: bool,
    pub manual_analysis_reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub generated_at: String,
    pub bugs: usize,
    pub tools: BTreeMap<String, ToolTally>,
    pub totals: ToolTally,
    pub manual_review: Vec<ReviewItem>,
}

impl EvaluationSummary {
    pub fn from_runs(runs: &[EvaluatedRun]) -> Self {
        let mut tools: BTreeMap<String, ToolTally> = BTreeMap::new();
        let mut times: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut bugs: Vec<&str> = Vec::new();
        let mut manual_review = Vec::new();

        for run in runs {
            let tool = run.result.tool.clone();
            tools.entry(tool.clone()).or_default().add(run);
            if run.result.status == ToolStatus::Success {
                times.entry(tool.clone()).or_default().push(run.result.execution_time);
            }
            if !bugs.contains(&run.bug.as_str()) {
                bugs.push(&run.bug);
            }
            let evaluation = match run.result.status {
                ToolStatus::Success => run.evaluation.as_ref(),
                _ => None,
            };
            if let Some(evaluation) = evaluation.filter(|e| e.need_manual_analysis) {
                manual_review.push(ReviewItem {
                    bug: run.bug.clone(),
                    tool,
                    status: evaluation.status,
                    reason: evaluation.reason.clone(),
                    evaluation: run.tool_dir.join(EVALUATION_FILE),
                    reviewed: evaluation.is_reviewed(),
                    manual_analysis_reasoning: evaluation.manual_analysis_reasoning.clone(),
                });
            }
        }

        for (tool, tally) in &mut tools {
            tally.median_execution_time = times.get_mut(tool).and_then(|t| median(t));
        }
        let mut totals = ToolTally::default();
        for tally in tools.values() {
            totals.merge(tally);
        }

        Self {
            generated_at: Utc::now().to_rfc3339(),
            bugs: bugs.len(),
            tools,
            totals,
            manual_review,
        }
    }

    pub fn pending_reviews(&self) -> usize {
        self.manual_review.iter().filter(|i| !i.reviewed).count()
    }

    pub fn save(&self, run_dir: &Path) -> Result<()> {
        write_json(&run_dir.join(SUMMARY_FILE), self)?;
        std::fs::write(run_dir.join(MANUAL_REVIEW_FILE), render_manual_review(self, run_dir)?)?;
        Ok(())
    }
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

// -- Manual review list --

#[derive(Template)]
#[template(path = "manual_review_todo.md", escape = "none")]
struct ManualReviewTodo {
    generated_at: String,
    run_dir: String,
    pending: usize,
    reviewed: usize,
    items: Vec<ReviewView>,
}

#[allow(dead_code)] // fields used by Askama template
struct ReviewView {
    bug: String,
    tool: String,
    status: String,
    reason: String,
    path: String,
    reviewed: bool,
    reasoning: String,
}

fn verdict_label(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::TruePositive => "TruePositive",
        Verdict::FalseNegative => "FalseNegative",
        Verdict::Undecided => "Undecided",
    }
}

pub fn render_manual_review(summary: &EvaluationSummary, run_dir: &Path) -> Result<String> {
    let items: Vec<ReviewView> = summary
        .manual_review
        .iter()
        .map(|item| ReviewView {
            bug: item.bug.clone(),
            tool: item.tool.clone(),
            status: verdict_label(item.status).to_string(),
            reason: item.reason.clone(),
            path: item
                .evaluation
                .strip_prefix(run_dir)
                .unwrap_or(&item.evaluation)
                .display()
                .to_string(),
            reviewed: item.reviewed,
            reasoning: item.manual_analysis_reasoning.clone(),
        })
        .collect();
    let pending = summary.pending_reviews();
    let todo = ManualReviewTodo {
        generated_at: Utc::now().format("%Y-%m-%d %H:%M UTC").to_string(),
        run_dir: run_dir.display().to_string(),
        pending,
        reviewed: items.len() - pending,
        items,
    };
    todo.render()
        .map_err(|e| crate::error::Error::template(e.to_string()))
}

// -- Rebuilding from disk --

pub enum RunSummary {
    Analyze(AnalyzeSummary),
    Evaluation(EvaluationSummary),
}

/// Every `results.json` under `run_dir`, with the evaluation next to it.
/// The bug is the tool directory's parent, relative to `run_dir`.
pub fn collect_runs(run_dir: &Path) -> Vec<EvaluatedRun> {
    let mut paths: Vec<PathBuf> = WalkDir::new(run_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == RESULTS_FILE)
        .map(|e| e.into_path())
        .collect();
    paths.sort();

    let mut runs = Vec::new();
    for path in paths {
        let Some(tool_dir) = path.parent() else { continue };
        let result: ToolResult = match read_json(&path) {
            Ok(result) => result,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable results");
                continue;
            }
        };
        let evaluation_path = tool_dir.join(EVALUATION_FILE);
        let evaluation = if evaluation_path.is_file() {
            match read_json(&evaluation_path) {
                Ok(evaluation) => Some(evaluation),
                Err(e) => {
                    warn!(path = %evaluation_path.display(), error = %e, "skipping unreadable evaluation");
                    None
                }
            }
        } else {
            None
        };
        let bug = tool_dir
            .parent()
            .and_then(|b| b.strip_prefix(run_dir).ok())
            .map(|b| b.display().to_string())
            .unwrap_or_default();
        runs.push(EvaluatedRun {
            bug,
            tool_dir: tool_dir.to_path_buf(),
            result,
            evaluation,
        });
    }
    runs
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
}

fn is_evaluation_run(run_dir: &Path) -> bool {
    WalkDir::new(run_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .any(|e| e.file_type().is_file() && e.file_name() == GROUND_TRUTH_FILE)
}

/// Recompute `summary.json` (and, for evaluation runs,
/// `manual_review_todo.md`) from the artifacts under `run_dir`.
pub fn rebuild(run_dir: &Path) -> anyhow::Result<RunSummary> {
    let runs = collect_runs(run_dir);
    if runs.is_empty() {
        anyhow::bail!("No {RESULTS_FILE} files under {}", run_dir.display());
    }

    if is_evaluation_run(run_dir) {
        let summary = EvaluationSummary::from_runs(&runs);
        summary.save(run_dir)?;
        info!(
            path = %run_dir.display(),
            bugs = summary.bugs,
            pending_reviews = summary.pending_reviews(),
            "evaluation summary written"
        );
        return Ok(RunSummary::Evaluation(summary));
    }

    let previous: Option<AnalyzeSummary> = read_json(&run_dir.join(SUMMARY_FILE)).ok();
    let results: Vec<ToolResult> = runs.into_iter().map(|r| r.result).collect();
    let summary = AnalyzeSummary::new(previous.and_then(|p| p.circuit), &results);
    summary.save(run_dir)?;
    info!(path = %run_dir.display(), "analysis summary written");
    Ok(RunSummary::Analyze(summary))
}

// -- Console tables --

fn status_label(status: ToolStatus) -> &'static str {
    match status {
        ToolStatus::Success => "success",
        ToolStatus::Failed => "failed",
        ToolStatus::Timeout => "timeout",
    }
}

pub fn print_analyze(summary: &AnalyzeSummary) {
    if let Some(circuit) = &summary.circuit {
        println!("Circuit: {}", circuit.display());
    }
    println!("{:<14} {:<8} {:>8} {:>10}", "Tool", "Status", "Findings", "Time (s)");
    for (tool, s) in &summary.tools {
        println!(
            "{:<14} {:<8} {:>8} {:>10.2}",
            tool,
            status_label(s.status),
            s.findings,
            s.execution_time
        );
    }
    let stats = &summary.statistics;
    println!(
        "{} tools: {} success, {} failed, {} timeout",
        stats.total_tools, stats.success, stats.failed, stats.timeout
    );
}

pub fn print_evaluation(summary: &EvaluationSummary) {
    println!("{} bug(s) evaluated", summary.bugs);
    println!(
        "{:<14} {:>4} {:>4} {:>9} {:>8} {:>6} {:>10}",
        "Tool", "TP", "FN", "Undecided", "Timeouts", "Errors", "Median (s)"
    );
    let row = |name: &str, t: &ToolTally| {
        let median = t
            .median_execution_time
            .map(|m| format!("{m:.2}"))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<14} {:>4} {:>4} {:>9} {:>8} {:>6} {:>10}",
            name, t.true_positive, t.false_negative, t.undecided, t.timeouts, t.errors, median
        );
    };
    for (tool, tally) in &summary.tools {
        row(tool, tally);
    }
    row("total", &summary.totals);
    let pending = summary.pending_reviews();
    if pending > 0 {
        println!("{pending} item(s) need manual review, see {MANUAL_REVIEW_FILE}");
    }
}

pub fn print_summary(summary: &RunSummary) {
    match summary {
        RunSummary::Analyze(s) => print_analyze(s),
        RunSummary::Evaluation(s) => print_evaluation(s),
    }
}
