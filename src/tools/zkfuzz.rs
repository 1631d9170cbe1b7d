//! zkFuzz: mutation fuzzer that prints a boxed counter example naming the
//! kind of violation it triggered.

use super::{
    Analyzer, BugCategory, CircuitInput, Finding, MatchPolicy, Normalized, ParseScope, ParsedOutput, Pattern,
    Position, captures, fold, foreign_record, group,
};
use crate::error::{Error, Result};
use crate::exec::{ExecutionPlan, Invocation, is_timed_out};
use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static EXPECTED_SIGNAL: Pattern = LazyLock::new(|| Regex::new(r"`([^`]+)`\s+is expected to be"));
static TARGET_SIGNAL: Pattern = LazyLock::new(|| Regex::new(r"signal `([^`]+)`"));
static TARGET_TEMPLATE: Pattern = LazyLock::new(|| Regex::new(r"template `([^`]+)`"));

const FINISHED: &str = "Everything went okay";
const PREVIOUS_ERRORS: &str = "previous errors were found";
const NO_COUNTER_EXAMPLE: &str = "No Counter Example Found";
const COUNTER_EXAMPLE: &str = "Counter Example";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZkfuzzOutcome {
    BugFound,
    NoBug,
    /// The circuit failed to compile inside zkFuzz.
    PreviousErrors,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZkfuzzReport {
    pub outcome: ZkfuzzOutcome,
    pub vulnerability: Option<String>,
    pub signal: Option<String>,
    pub template: Option<String>,
}

/// Keep the text between the first and last letter or parenthesis, which
/// drops box-drawing characters and emoji around the violation name.
fn strip_decoration(line: &str) -> &str {
    let keep = |c: char| c.is_ascii_alphabetic() || c == '(' || c == ')';
    line.trim_start_matches(|c: char| !keep(c))
        .trim_end_matches(|c: char| !keep(c))
}

pub fn parse_report(raw: &str) -> Result<ZkfuzzReport> {
    let lines: Vec<&str> = raw.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

    let mut report = ZkfuzzReport {
        outcome: ZkfuzzOutcome::NoBug,
        vulnerability: None,
        signal: None,
        template: None,
    };

    if lines.iter().any(|l| l.contains(PREVIOUS_ERRORS)) {
        report.outcome = ZkfuzzOutcome::PreviousErrors;
        return Ok(report);
    }

    let verdict = lines
        .iter()
        .position(|l| l.contains(NO_COUNTER_EXAMPLE) || l.contains(COUNTER_EXAMPLE));
    let Some(at) = verdict else {
        let reason = if lines.iter().any(|l| l.contains(FINISHED)) {
            "zkFuzz finished without a counter example verdict"
        } else {
            "zkFuzz output has no verdict and no completion marker"
        };
        return Err(Error::parse(reason));
    };

    if lines[at].contains(NO_COUNTER_EXAMPLE) {
        return Ok(report);
    }

    report.outcome = ZkfuzzOutcome::BugFound;
    report.vulnerability = lines
        .get(at + 1)
        .map(|next| strip_decoration(next))
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    for line in &lines[at..] {
        if report.signal.is_none() {
            if let Some(caps) = captures(&EXPECTED_SIGNAL, line)? {
                report.signal = group(&caps, 1).map(str::to_string);
            }
        }
    }
    if let Some(target) = lines.iter().find(|l| l.contains("Target") && l.contains("signal")) {
        if let Some(caps) = captures(&TARGET_SIGNAL, target)? {
            report.signal = group(&caps, 1).map(str::to_string);
        }
        if let Some(caps) = captures(&TARGET_TEMPLATE, target)? {
            report.template = group(&caps, 1).map(str::to_string);
        }
    }
    Ok(report)
}

/// Total keyword mapping from zkFuzz's violation names.
pub fn classify(vulnerability: &str) -> BugCategory {
    let key = fold(vulnerability);
    if key.contains("underconstrained") {
        BugCategory::UnderConstrained
    } else if key.contains("overconstrained") {
        BugCategory::OverConstrained
    } else {
        BugCategory::Warning
    }
}

pub struct ZkFuzz {
    binary: String,
}

impl ZkFuzz {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Analyzer for ZkFuzz {
    fn name(&self) -> &'static str {
        "zkfuzz"
    }

    fn policy(&self) -> MatchPolicy {
        MatchPolicy::FuzzyDescription
    }

    fn plan(&self, input: &CircuitInput) -> ExecutionPlan {
        ExecutionPlan::single(
            Invocation::new(&self.binary)
                .arg(&input.circuit_file)
                .current_dir(input.circuit_dir())
                .requires(&input.circuit_file),
        )
    }

    fn parse(&self, raw: &str, _scope: &ParseScope) -> Result<ParsedOutput> {
        if is_timed_out(raw) {
            return Ok(ParsedOutput::TimedOut);
        }
        parse_report(raw).map(ParsedOutput::Zkfuzz)
    }

    fn normalize(&self, parsed: &ParsedOutput) -> Result<Normalized> {
        let report = match parsed {
            ParsedOutput::TimedOut => return Ok(Normalized::timed_out()),
            ParsedOutput::Zkfuzz(report) => report,
            other => return Err(foreign_record(self.name(), other)),
        };
        match report.outcome {
            ZkfuzzOutcome::PreviousErrors => Ok(Normalized::tool_error("zkFuzz: previous errors were found")),
            ZkfuzzOutcome::NoBug => Ok(Normalized::from_findings(Vec::new())),
            ZkfuzzOutcome::BugFound => {
                let title = report.vulnerability.clone().unwrap_or_else(|| "CounterExample".into());
                let description = match (&report.signal, &report.template) {
                    (Some(signal), Some(template)) => {
                        format!("Counter example found for signal `{signal}` in template `{template}`")
                    }
                    (Some(signal), None) => format!("Counter example found for signal `{signal}`"),
                    _ => "Circuit is not safe".to_string(),
                };
                let finding = Finding::new(&title, classify(&title), description).with_position(Position {
                    signal: report.signal.clone(),
                    template: report.template.clone(),
                    ..Position::default()
                });
                Ok(Normalized::from_findings(vec![finding]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::AnalysisStatus;

    const BUG: &str = "stdout:
╔══════════════════════════════════════════════════════════════╗
║ 🚨 Counter Example:                                           ║
║    🔥 UnderConstrained (Non-Deterministic) 🔥                 ║
║    🔍 Assignment Details:                                     ║
║           ➡️ `main.a` = 2                                      ║
║           ➡️ `main.c` is expected to be `0`                    ║
╚══════════════════════════════════════════════════════════════╝
Everything went okay
stderr:
";

    #[test]
    fn counter_example_names_the_violation() {
        let report = parse_report(BUG).unwrap();
        assert_eq!(report.outcome, ZkfuzzOutcome::BugFound);
        assert_eq!(report.vulnerability.as_deref(), Some("UnderConstrained (Non-Deterministic)"));
        assert_eq!(report.signal.as_deref(), Some("main.c"));
    }

    #[test]
    fn target_line_supplies_template() {
        let raw = "Counter Example:\nUnderConstrained\n💣 Target: signal `out` in template `Multiplier`\nEverything went okay";
        let report = parse_report(raw).unwrap();
        assert_eq!(report.signal.as_deref(), Some("out"));
        assert_eq!(report.template.as_deref(), Some("Multiplier"));
    }

    #[test]
    fn no_counter_example_is_clean() {
        let tool = ZkFuzz::new("zkfuzz");
        let raw = "🆗 No Counter Example Found\nEverything went okay\n";
        let normalized = tool.normalize(&tool.parse(raw, &ParseScope::default()).unwrap()).unwrap();
        assert_eq!(normalized.status, AnalysisStatus::NoBugs);
    }

    #[test]
    fn compile_errors_are_tool_errors() {
        let tool = ZkFuzz::new("zkfuzz");
        let raw = "error[T2021]: undeclared symbol\nprevious errors were found\n";
        let normalized = tool.normalize(&tool.parse(raw, &ParseScope::default()).unwrap()).unwrap();
        assert_eq!(normalized.status, AnalysisStatus::Error);
        assert!(normalized.error.is_some());
    }

    #[test]
    fn missing_verdict_is_a_parse_error() {
        assert!(matches!(parse_report("stdout:\nthread panicked\nstderr:\n"), Err(Error::Parse(_))));
    }

    #[test]
    fn bug_finding_keeps_raw_violation_text() {
        let tool = ZkFuzz::new("zkfuzz");
        let normalized = tool.normalize(&tool.parse(BUG, &ParseScope::default()).unwrap()).unwrap();
        let f = &normalized.findings[0];
        assert_eq!(f.bug_title, "UnderConstrained (Non-Deterministic)");
        assert_eq!(f.unified_bug_title, BugCategory::UnderConstrained);
        assert_eq!(f.position.signal.as_deref(), Some("main.c"));
    }

    #[test]
    fn classification_defaults_to_warning() {
        assert_eq!(classify("OverConstrained"), BugCategory::OverConstrained);
        assert_eq!(classify("Assertion Failure"), BugCategory::Warning);
    }
}
