//! Ground-truth evaluation: turns a tool's findings into a verdict about one
//! known bug without ever claiming more confidence than the tool can back.

use crate::error::{Error, Result};
use crate::ground_truth::{GroundTruth, LineSpans};
use crate::tools::{Finding, MatchPolicy, Position, ToolResult, fold};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    TruePositive,
    FalseNegative,
    Undecided,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManualAnalysis {
    Pending,
    Done,
    #[serde(rename = "N/A")]
    NotApplicable,
}

const NOT_APPLICABLE: &str = "N/A";
const AWAITING_REVIEW: &str = "Awaiting review";

/// Written as `evaluation.json`. A reviewer settles an `Undecided` item by
/// editing `status`, setting `manual_analysis` to `Done` and filling in the
/// reasoning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub status: Verdict,
    pub reason: String,
    pub need_manual_analysis: bool,
    pub manual_analysis: ManualAnalysis,
    pub manual_analysis_reasoning: String,
}

impl EvaluationResult {
    pub fn true_positive(reason: impl Into<String>) -> Self {
        Self::settled(Verdict::TruePositive, reason)
    }

    pub fn false_negative(reason: impl Into<String>) -> Self {
        Self::settled(Verdict::FalseNegative, reason)
    }

    pub fn undecided(reason: impl Into<String>) -> Self {
        Self {
            status: Verdict::Undecided,
            reason: reason.into(),
            need_manual_analysis: true,
            manual_analysis: ManualAnalysis::Pending,
            manual_analysis_reasoning: AWAITING_REVIEW.into(),
        }
    }

    fn settled(status: Verdict, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            need_manual_analysis: false,
            manual_analysis: ManualAnalysis::NotApplicable,
            manual_analysis_reasoning: NOT_APPLICABLE.into(),
        }
    }

    /// A human has already ruled on this item.
    pub fn is_reviewed(&self) -> bool {
        self.manual_analysis == ManualAnalysis::Done
    }

    /// Still waiting for a human.
    pub fn awaits_review(&self) -> bool {
        self.need_manual_analysis && !self.is_reviewed()
    }
}

/// Judge one tool result. Ground truth that cannot be compared produces an
/// `Undecided` verdict instead of an error so a dataset run keeps going.
pub fn evaluate(policy: MatchPolicy, ground_truth: &GroundTruth, result: &ToolResult) -> EvaluationResult {
    match judge(policy, ground_truth, &result.findings) {
        Ok(evaluation) => evaluation,
        Err(e) => {
            warn!(tool = %result.tool, bug = %ground_truth.bug_name, error = %e, "comparison failed");
            EvaluationResult::undecided(format!("Cannot compare against ground truth: {e}"))
        }
    }
}

pub fn judge(policy: MatchPolicy, ground_truth: &GroundTruth, findings: &[Finding]) -> Result<EvaluationResult> {
    let vulnerability = ground_truth.require_vulnerability()?;
    if findings.is_empty() {
        return Ok(EvaluationResult::false_negative(format!(
            "Tool found no issues; expected {vulnerability}"
        )));
    }
    match policy {
        MatchPolicy::LocationPrecise => location_precise(ground_truth, vulnerability, findings),
        MatchPolicy::CircuitLevel => Ok(EvaluationResult::undecided(format!(
            "Tool reported {} circuit-level issue(s) but cannot say which bug; expected {vulnerability}",
            findings.len()
        ))),
        MatchPolicy::FuzzyDescription => Ok(fuzzy(vulnerability, findings)),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Placement {
    /// At least one reported field agrees and none disagree.
    Inside,
    Outside(String),
    /// Nothing reported that could agree or disagree.
    Unknown,
}

fn placement(position: &Position, function: Option<&str>, spans: Option<&LineSpans>) -> Placement {
    let mut agreeing = 0;
    if let Some(function) = function {
        let expected = fold(function);
        for (label, name) in [("template", &position.template), ("component", &position.component)] {
            if let Some(name) = name {
                if fold(name) == expected {
                    agreeing += 1;
                } else {
                    return Placement::Outside(format!("{label} {name} is not {function}"));
                }
            }
        }
    }
    if let (Some(spans), Some(line)) = (spans, position.line) {
        if spans.contains(line) {
            agreeing += 1;
        } else {
            return Placement::Outside(format!("line {line} is outside the known location"));
        }
    }
    if agreeing > 0 {
        Placement::Inside
    } else {
        Placement::Unknown
    }
}

fn location_precise(
    ground_truth: &GroundTruth,
    vulnerability: &str,
    findings: &[Finding],
) -> Result<EvaluationResult> {
    let function = ground_truth.function();
    let spans = ground_truth.line_spans()?;
    if function.is_none() && spans.is_none() {
        return Err(Error::comparison(format!(
            "{}: ground truth location has neither function nor line",
            ground_truth.bug_name
        )));
    }
    let expected = ground_truth.expected_category();

    let mut reasons = Vec::new();
    for finding in findings {
        let type_ok = expected == Some(finding.unified_bug_title);
        match placement(&finding.position, function, spans.as_ref()) {
            Placement::Inside if type_ok => {
                return Ok(EvaluationResult::true_positive(format!(
                    "Found {vulnerability} ({}) at the known location",
                    finding.bug_title
                )));
            }
            Placement::Inside => reasons.push(format!(
                "{} at the known location is {}, not {vulnerability}",
                finding.bug_title, finding.unified_bug_title
            )),
            Placement::Outside(why) if type_ok => {
                reasons.push(format!("{} matches the type but {why}", finding.bug_title))
            }
            Placement::Outside(why) => reasons.push(format!(
                "{} is {} and {why}",
                finding.bug_title, finding.unified_bug_title
            )),
            Placement::Unknown => reasons.push(format!(
                "{} ({}) carries no comparable location",
                finding.bug_title, finding.unified_bug_title
            )),
        }
    }
    reasons.dedup();
    Ok(EvaluationResult::undecided(format!(
        "Tool found {} issue(s) but none match {vulnerability} at the known location: {}",
        findings.len(),
        reasons.join("; ")
    )))
}

fn fuzzy(vulnerability: &str, findings: &[Finding]) -> EvaluationResult {
    let needle = fold(vulnerability);
    let hit = !needle.is_empty()
        && findings
            .iter()
            .any(|f| fold(&f.bug_title).contains(&needle));
    if hit {
        EvaluationResult::true_positive(format!("Found {vulnerability}"))
    } else {
        EvaluationResult::undecided(format!(
            "Tool found {} issue(s) but none mention {vulnerability}",
            findings.len()
        ))
    }
}
