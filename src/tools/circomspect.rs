//! circomspect: lint-style static analyzer. Output is a sequence of
//! "analyzing template 'X'" blocks, each holding zero or more diagnostics
//! followed by a `file:line:col` trailer.

use super::{
    Analyzer, BugCategory, CircuitInput, Finding, MatchPolicy, Normalized, ParseScope, ParsedOutput, Pattern,
    Position, captures, foreign_record, group,
};
use crate::error::{Error, Result};
use crate::exec::{ExecutionPlan, ExitPolicy, Invocation, is_timed_out};
use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::debug;

static BLOCK_MARKER: Pattern =
    LazyLock::new(|| Regex::new(r"^circomspect: analyzing (function|template) '([^']+)'"));
static DIAGNOSTIC: Pattern = LazyLock::new(|| Regex::new(r"^(warning|error|note)\[([A-Za-z]+\d+)\]:\s*(.*)$"));
static TRAILER: Pattern = LazyLock::new(|| Regex::new(r"(\S+):(\d+):(\d+)"));

/// Native code, circomspect's own name for it, and our category.
const CODES: &[(&str, &str, BugCategory)] = &[
    ("CS0001", "ShadowingVariable", BugCategory::Warning),
    ("CS0002", "ParameterNameCollision", BugCategory::Warning),
    ("CS0003", "FieldElementComparison", BugCategory::ComputationalIssue),
    ("CS0004", "FieldElementArithmetic", BugCategory::ComputationalIssue),
    ("CS0005", "SignalAssignmentStatement", BugCategory::Warning),
    ("CS0006", "UnusedVariableValue", BugCategory::Warning),
    ("CS0007", "UnusedParameterValue", BugCategory::Warning),
    ("CS0008", "VariableWithoutSideEffect", BugCategory::Warning),
    ("CS0009", "ConstantBranchCondition", BugCategory::Warning),
    ("CS0010", "NonStrictBinaryConversion", BugCategory::Warning),
    ("CS0011", "CyclomaticComplexity", BugCategory::Warning),
    ("CS0012", "TooManyArguments", BugCategory::Warning),
    ("CS0013", "UnnecessarySignalAssignment", BugCategory::Warning),
    ("CS0014", "UnconstrainedLessThan", BugCategory::UnderConstrained),
    ("CS0015", "UnconstrainedDivision", BugCategory::UnderConstrained),
    ("CS0016", "Bn254SpecificCircuit", BugCategory::Warning),
    ("CS0017", "UnderConstrainedSignal", BugCategory::UnderConstrained),
    ("CS0018", "UnusedOutputSignal", BugCategory::Warning),
    ("CA01", "UnconstrainedSignal", BugCategory::UnderConstrained),
];

/// Total over every code: anything unlisted is a plain warning.
pub fn classify(code: &str) -> (&str, BugCategory) {
    CODES
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, name, category)| (*name, *category))
        .unwrap_or((code, BugCategory::Warning))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    pub level: String,
    pub message: String,
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
    /// Name of the block the diagnostic appeared in.
    pub template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircomspectReport {
    pub scope: Option<String>,
    /// Whether the scoped block was present. Always true when unscoped.
    pub block_found: bool,
    pub warnings: Vec<Diagnostic>,
}

/// Walk the output block by block. With a scope, only the block analyzing
/// that function or template is read and everything after the next marker is
/// ignored. A diagnostic without a location trailer on the next non-blank line
/// is dropped.
pub fn parse_report(raw: &str, scope: &ParseScope) -> Result<CircomspectReport> {
    let lines: Vec<&str> = raw.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let wanted = scope.function.as_deref();

    let mut saw_marker = false;
    let mut block_found = wanted.is_none();
    let mut current: Option<String> = None;
    let mut inside = wanted.is_none();
    let mut warnings = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        i += 1;

        if let Some(caps) = captures(&BLOCK_MARKER, line)? {
            saw_marker = true;
            let name = group(&caps, 2).unwrap_or_default();
            match wanted {
                Some(_) if block_found => break,
                Some(target) => {
                    inside = name == target;
                    block_found = inside;
                }
                None => {}
            }
            current = Some(name.to_string());
            continue;
        }
        if !inside {
            continue;
        }

        let Some(caps) = captures(&DIAGNOSTIC, line)? else {
            continue;
        };
        let level = group(&caps, 1).unwrap_or_default().to_string();
        let code = group(&caps, 2).unwrap_or_default().to_string();
        let message = group(&caps, 3).unwrap_or_default().to_string();

        let trailer = match lines.get(i) {
            Some(next) => captures(&TRAILER, next)?,
            None => None,
        };
        let Some(trailer) = trailer else {
            debug!(%code, "diagnostic without location, dropped");
            continue;
        };
        i += 1;
        let file = group(&trailer, 1)
            .map(|f| f.trim_start_matches(['┌', '─']).to_string())
            .filter(|f| !f.is_empty());
        let line_no = number(group(&trailer, 2))?;
        let column = number(group(&trailer, 3))?;

        warnings.push(Diagnostic {
            code,
            level,
            message,
            file,
            line: line_no,
            column,
            template: current.clone(),
        });
    }

    if !saw_marker {
        return Err(Error::parse("circomspect output has no analysis blocks"));
    }
    Ok(CircomspectReport {
        scope: wanted.map(str::to_string),
        block_found,
        warnings,
    })
}

fn number(text: Option<&str>) -> Result<u32> {
    let text = text.unwrap_or_default();
    text.parse()
        .map_err(|_| Error::parse(format!("circomspect location '{text}' is not a number")))
}

pub struct Circomspect {
    binary: String,
}

impl Circomspect {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Analyzer for Circomspect {
    fn name(&self) -> &'static str {
        "circomspect"
    }

    fn policy(&self) -> MatchPolicy {
        MatchPolicy::LocationPrecise
    }

    /// Exit code 1 means "warnings were emitted".
    fn exit_policy(&self) -> ExitPolicy {
        ExitPolicy::default().without(1)
    }

    fn plan(&self, input: &CircuitInput) -> ExecutionPlan {
        ExecutionPlan::single(
            Invocation::new(&self.binary)
                .arg(&input.circuit_file)
                .args(["-l", "INFO", "-v"])
                .current_dir(input.circuit_dir())
                .requires(&input.circuit_file),
        )
    }

    fn parse(&self, raw: &str, scope: &ParseScope) -> Result<ParsedOutput> {
        if is_timed_out(raw) {
            return Ok(ParsedOutput::TimedOut);
        }
        parse_report(raw, scope).map(ParsedOutput::Circomspect)
    }

    fn normalize(&self, parsed: &ParsedOutput) -> Result<Normalized> {
        let report = match parsed {
            ParsedOutput::TimedOut => return Ok(Normalized::timed_out()),
            ParsedOutput::Circomspect(report) => report,
            other => return Err(foreign_record(self.name(), other)),
        };
        let findings = report
            .warnings
            .iter()
            .map(|w| {
                let (name, category) = classify(&w.code);
                Finding::new(name, category, &w.message)
                    .with_file(w.file.clone())
                    .with_position(Position {
                        line: Some(w.line),
                        column: Some(w.column),
                        template: w.template.clone(),
                        ..Position::default()
                    })
                    .with_meta("code", w.code.as_str())
                    .with_meta("level", w.level.as_str())
            })
            .collect();
        Ok(Normalized::from_findings(findings))
    }
}
