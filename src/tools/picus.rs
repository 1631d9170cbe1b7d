//! picus: constraint-solver that proves a circuit properly constrained or
//! returns a counterexample with two output assignments for one input.

use super::{
    Analyzer, BugCategory, CircuitInput, Finding, MatchPolicy, Normalized, ParseScope, ParsedOutput, Pattern,
    Position, captures, foreign_record, group,
};
use crate::error::{Error, Result};
use crate::exec::{ExecutionPlan, Invocation, is_timed_out};
use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;

static SIGNAL_VALUE: Pattern = LazyLock::new(|| Regex::new(r"^([A-Za-z_][\w.\[\]]*)\s*:\s*(\S+)$"));

const UNDERCONSTRAINED: &str = "The circuit is underconstrained";
const PROPERLY_CONSTRAINED: &str = "The circuit is properly constrained";
const UNKNOWN: &str = "Cannot determine whether the circuit is properly constrained";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PicusVerdict {
    Underconstrained,
    ProperlyConstrained,
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterexample {
    pub inputs: BTreeMap<String, String>,
    pub first_outputs: BTreeMap<String, String>,
    pub second_outputs: BTreeMap<String, String>,
}

impl Counterexample {
    /// Signals whose value differs between the two solutions, or that only
    /// one solution assigns. Sorted by name.
    pub fn differing_signals(&self) -> Vec<(&str, Option<&str>, Option<&str>)> {
        let mut names: Vec<&String> = self.first_outputs.keys().chain(self.second_outputs.keys()).collect();
        names.sort();
        names.dedup();
        names
            .into_iter()
            .filter_map(|name| {
                let first = self.first_outputs.get(name).map(String::as_str);
                let second = self.second_outputs.get(name).map(String::as_str);
                (first != second).then_some((name.as_str(), first, second))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PicusReport {
    pub verdict: PicusVerdict,
    pub counterexample: Option<Counterexample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Inputs,
    First,
    Second,
}

fn section_header(line: &str) -> Option<Section> {
    match line.trim_end_matches(':').trim().to_ascii_lowercase().as_str() {
        "inputs" => Some(Section::Inputs),
        "first possible outputs" => Some(Section::First),
        "second possible outputs" => Some(Section::Second),
        _ => None,
    }
}

/// Verdict line first, then a section tracker over `signal: value` lines
/// that stops at "internal variables".
pub fn parse_report(raw: &str) -> Result<PicusReport> {
    let lines: Vec<&str> = raw.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

    let verdict = if lines.contains(&UNDERCONSTRAINED) {
        PicusVerdict::Underconstrained
    } else if lines.contains(&PROPERLY_CONSTRAINED) {
        PicusVerdict::ProperlyConstrained
    } else if lines.contains(&UNKNOWN) {
        PicusVerdict::Unknown
    } else {
        return Err(Error::parse("picus output has no verdict line"));
    };

    if verdict != PicusVerdict::Underconstrained {
        return Ok(PicusReport {
            verdict,
            counterexample: None,
        });
    }

    let mut cex = Counterexample::default();
    let mut seen = [false; 3];
    let mut section = None;
    for line in &lines {
        if line.to_ascii_lowercase().contains("internal variables") {
            break;
        }
        if let Some(header) = section_header(line) {
            seen[header as usize] = true;
            section = Some(header);
            continue;
        }
        let Some(current) = section else { continue };
        let Some(caps) = captures(&SIGNAL_VALUE, line)? else {
            continue;
        };
        let (Some(name), Some(value)) = (group(&caps, 1), group(&caps, 2)) else {
            continue;
        };
        let target = match current {
            Section::Inputs => &mut cex.inputs,
            Section::First => &mut cex.first_outputs,
            Section::Second => &mut cex.second_outputs,
        };
        target.insert(name.to_string(), value.to_string());
    }

    let counterexample = match seen {
        [false, false, false] => None,
        [_, true, true] => Some(cex),
        _ => {
            return Err(Error::parse(
                "picus counterexample is missing one of its output sections",
            ));
        }
    };
    Ok(PicusReport { verdict, counterexample })
}

pub struct Picus {
    tool_dir: PathBuf,
}

impl Picus {
    pub fn new(tool_dir: impl Into<PathBuf>) -> Self {
        Self { tool_dir: tool_dir.into() }
    }
}

impl Analyzer for Picus {
    fn name(&self) -> &'static str {
        "picus"
    }

    fn policy(&self) -> MatchPolicy {
        MatchPolicy::CircuitLevel
    }

    fn plan(&self, input: &CircuitInput) -> ExecutionPlan {
        let script = self.tool_dir.join("run-picus");
        ExecutionPlan::single(
            Invocation::new(script.to_string_lossy())
                .arg(&input.circuit_file)
                .current_dir(&self.tool_dir)
                .requires(&input.circuit_file),
        )
    }

    fn parse(&self, raw: &str, _scope: &ParseScope) -> Result<ParsedOutput> {
        if is_timed_out(raw) {
            return Ok(ParsedOutput::TimedOut);
        }
        parse_report(raw).map(ParsedOutput::Picus)
    }

    fn normalize(&self, parsed: &ParsedOutput) -> Result<Normalized> {
        let report = match parsed {
            ParsedOutput::TimedOut => return Ok(Normalized::timed_out()),
            ParsedOutput::Picus(report) => report,
            other => return Err(foreign_record(self.name(), other)),
        };
        if report.verdict != PicusVerdict::Underconstrained {
            return Ok(Normalized::from_findings(Vec::new()));
        }

        let whole_circuit = || {
            Finding::new(
                "Underconstrained",
                BugCategory::UnderConstrained,
                "Picus reports the circuit as underconstrained",
            )
        };
        let Some(cex) = &report.counterexample else {
            return Ok(Normalized::from_findings(vec![whole_circuit()]));
        };

        let mut findings: Vec<Finding> = cex
            .differing_signals()
            .into_iter()
            .map(|(signal, first, second)| {
                Finding::new(
                    "Underconstrained",
                    BugCategory::UnderConstrained,
                    format!(
                        "Signal {signal} takes two values for the same inputs: {} and {}",
                        first.unwrap_or("unassigned"),
                        second.unwrap_or("unassigned")
                    ),
                )
                .with_position(Position {
                    signal: Some(signal.to_string()),
                    ..Position::default()
                })
                .with_meta("first_value", first)
                .with_meta("second_value", second)
                .with_meta("inputs", serde_json::to_value(&cex.inputs).unwrap_or_default())
            })
            .collect();
        if findings.is_empty() {
            findings.push(whole_circuit());
        }
        Ok(Normalized::from_findings(findings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::AnalysisStatus;

    const CEX: &str = "stdout:
# [picus] solving...
The circuit is underconstrained
Counter-example:
  inputs:
    main.a: 1
    main.b: 1
  first possible outputs:
    main.c: 0
    main.d: 5
  second possible outputs:
    main.c: 1
    main.d: 5
  internal variables:
    main.x: 9
stderr:
";

    #[test]
    fn differing_outputs_become_findings() {
        let tool = Picus::new("tools/picus");
        let normalized = tool.normalize(&tool.parse(CEX, &ParseScope::default()).unwrap()).unwrap();
        assert_eq!(normalized.status, AnalysisStatus::BugsFound);
        assert_eq!(normalized.findings.len(), 1, "main.d agrees in both solutions");
        let f = &normalized.findings[0];
        assert_eq!(f.unified_bug_title, BugCategory::UnderConstrained);
        assert_eq!(f.position.signal.as_deref(), Some("main.c"));
        assert_eq!(f.metadata["first_value"], "0");
        assert_eq!(f.metadata["second_value"], "1");
    }

    #[test]
    fn internal_variables_are_not_read() {
        let report = parse_report(CEX).unwrap();
        let cex = report.counterexample.unwrap();
        assert_eq!(cex.inputs.len(), 2);
        assert!(!cex.second_outputs.contains_key("main.x"));
    }

    #[test]
    fn one_sided_signal_is_a_difference() {
        let mut cex = Counterexample::default();
        cex.first_outputs.insert("main.o".into(), "3".into());
        assert_eq!(cex.differing_signals(), [("main.o", Some("3"), None)]);
    }

    #[test]
    fn verdict_without_counterexample_is_circuit_wide() {
        let tool = Picus::new("tools/picus");
        let raw = "The circuit is underconstrained\n";
        let normalized = tool.normalize(&tool.parse(raw, &ParseScope::default()).unwrap()).unwrap();
        assert_eq!(normalized.findings.len(), 1);
        assert!(normalized.findings[0].position.is_empty());
    }

    #[test]
    fn truncated_counterexample_is_a_parse_error() {
        let raw = "The circuit is underconstrained\ninputs:\n main.a: 1\nfirst possible outputs:\n main.c: 0\n";
        assert!(matches!(parse_report(raw), Err(Error::Parse(_))));
    }

    #[test]
    fn clean_and_unknown_verdicts_have_no_findings() {
        let tool = Picus::new("tools/picus");
        for raw in [PROPERLY_CONSTRAINED, UNKNOWN] {
            let normalized = tool.normalize(&tool.parse(raw, &ParseScope::default()).unwrap()).unwrap();
            assert_eq!(normalized.status, AnalysisStatus::NoBugs);
        }
    }

    #[test]
    fn missing_verdict_is_a_parse_error() {
        assert!(parse_report("stdout:\nracket: cannot open module\nstderr:\n").is_err());
    }

    #[test]
    fn plan_runs_script_from_its_directory() {
        let plan = Picus::new("/opt/picus").plan(&CircuitInput::new("/b/c.circom", "/out"));
        assert_eq!(plan.steps[0].program, "/opt/picus/run-picus");
        assert_eq!(plan.steps[0].cwd.as_deref(), Some(std::path::Path::new("/opt/picus")));
    }
}
