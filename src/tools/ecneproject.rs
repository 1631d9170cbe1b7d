//! EcneProject: checks whether every R1CS variable is uniquely determined.
//! Needs the circuit compiled to R1CS and a symbol table first.

use super::{
    Analyzer, BugCategory, CircuitInput, Finding, MatchPolicy, Normalized, ParseScope, ParsedOutput, Position,
    foreign_record,
};
use crate::error::{Error, Result};
use crate::exec::{ExecutionPlan, Invocation, is_timed_out};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

const UNSOUND: &str = "R1CS function circuit has potentially unsound constraints";
const SOUND: &str = "R1CS function circuit has sound constraints";
const TOOL_ERROR: &str = "Error while running";
const BAD_CONSTRAINTS: &str = "------ Bad Constraints ------";
const ALL_VARIABLES: &str = "------ All Variables ------";
const UNDETERMINED: &str = "Uniquely Determined: false";

/// Variables listed in one finding's description before eliding the rest.
const LISTED_VARIABLES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EcneVerdict {
    Sound,
    PotentiallyUnsound,
    ToolError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndeterminedVariable {
    pub variable: String,
    pub constraint: Option<String>,
    pub constraint_expr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcneReport {
    pub verdict: EcneVerdict,
    /// Keyed by the prefix before the first `.` of the variable name.
    pub undetermined: BTreeMap<String, Vec<UndeterminedVariable>>,
}

/// Inside the "Bad Constraints" section, `constraint #N` starts a constraint
/// whose expression is the next line; a variable name followed by
/// "Uniquely Determined: false" is recorded against it.
pub fn parse_report(raw: &str) -> Result<EcneReport> {
    let verdict = if raw.contains(TOOL_ERROR) {
        EcneVerdict::ToolError
    } else if raw.contains(UNSOUND) {
        EcneVerdict::PotentiallyUnsound
    } else if raw.contains(SOUND) {
        EcneVerdict::Sound
    } else {
        return Err(Error::parse("EcneProject output has no soundness verdict"));
    };

    let mut undetermined: BTreeMap<String, Vec<UndeterminedVariable>> = BTreeMap::new();
    if verdict == EcneVerdict::PotentiallyUnsound {
        let lines: Vec<&str> = raw.lines().map(str::trim).collect();
        let mut inside = false;
        let mut constraint: Option<String> = None;
        let mut expr: Option<String> = None;

        for (i, line) in lines.iter().enumerate() {
            match *line {
                BAD_CONSTRAINTS => {
                    inside = true;
                    continue;
                }
                ALL_VARIABLES => break,
                _ if !inside => continue,
                _ => {}
            }
            if line.starts_with("constraint #") {
                constraint = Some(line.to_string());
                expr = lines.get(i + 1).map(|e| e.to_string()).filter(|e| !e.is_empty());
                continue;
            }
            if !line.starts_with(UNDETERMINED) || i == 0 {
                continue;
            }
            let variable = lines[i - 1];
            if variable.is_empty() || variable.starts_with("Uniquely") || variable.starts_with("Bounds") {
                continue;
            }
            let group = variable.split_once('.').map_or("unknown", |(prefix, _)| prefix);
            let entries = undetermined.entry(group.to_string()).or_default();
            if entries.iter().all(|v| v.variable != variable) {
                entries.push(UndeterminedVariable {
                    variable: variable.to_string(),
                    constraint: constraint.clone(),
                    constraint_expr: expr.clone(),
                });
            }
        }
    }

    Ok(EcneReport { verdict, undetermined })
}

pub struct EcneProject {
    circom: String,
    julia: String,
    tool_dir: PathBuf,
}

impl EcneProject {
    pub fn new(circom: impl Into<String>, julia: impl Into<String>, tool_dir: impl Into<PathBuf>) -> Self {
        Self {
            circom: circom.into(),
            julia: julia.into(),
            tool_dir: tool_dir.into(),
        }
    }
}

impl Analyzer for EcneProject {
    fn name(&self) -> &'static str {
        "ecneproject"
    }

    fn policy(&self) -> MatchPolicy {
        MatchPolicy::CircuitLevel
    }

    fn plan(&self, input: &CircuitInput) -> ExecutionPlan {
        let stem = input.circuit_stem();
        let r1cs = input.work_dir.join(format!("{stem}.r1cs"));
        let sym = input.work_dir.join(format!("{stem}.sym"));
        let entry = self.tool_dir.join("src").join("Ecne.jl");

        ExecutionPlan::single(
            Invocation::new(&self.circom)
                .arg(&input.circuit_file)
                .args(["--r1cs", "--sym", "--output"])
                .arg(&input.work_dir)
                .current_dir(input.circuit_dir())
                .requires(&input.circuit_file),
        )
        .then(
            Invocation::new(&self.julia)
                .arg(format!("--project={}", self.tool_dir.display()))
                .arg(&entry)
                .arg("--r1cs")
                .arg(&r1cs)
                .args(["--name", "circuit", "--sym"])
                .arg(&sym)
                .current_dir(&self.tool_dir)
                .requires(&entry)
                .requires(&r1cs)
                .requires(&sym),
        )
        .cleanup(r1cs)
        .cleanup(sym)
    }

    fn parse(&self, raw: &str, _scope: &ParseScope) -> Result<ParsedOutput> {
        if is_timed_out(raw) {
            return Ok(ParsedOutput::TimedOut);
        }
        parse_report(raw).map(ParsedOutput::Ecneproject)
    }

    fn normalize(&self, parsed: &ParsedOutput) -> Result<Normalized> {
        let report = match parsed {
            ParsedOutput::TimedOut => return Ok(Normalized::timed_out()),
            ParsedOutput::Ecneproject(report) => report,
            other => return Err(foreign_record(self.name(), other)),
        };
        match report.verdict {
            EcneVerdict::ToolError => return Ok(Normalized::tool_error("EcneProject reported an error while running")),
            EcneVerdict::Sound => return Ok(Normalized::from_findings(Vec::new())),
            EcneVerdict::PotentiallyUnsound => {}
        }

        let mut findings: Vec<Finding> = report
            .undetermined
            .iter()
            .map(|(group, vars)| {
                let names: Vec<&str> = vars.iter().map(|v| v.variable.as_str()).collect();
                let description = if names.len() == 1 {
                    format!("Component `{group}` has under-constrained variable: {}", names[0])
                } else {
                    let mut listed = names
                        .iter()
                        .take(LISTED_VARIABLES)
                        .copied()
                        .collect::<Vec<_>>()
                        .join(", ");
                    if names.len() > LISTED_VARIABLES {
                        listed.push_str(&format!(", ... ({} total)", names.len()));
                    }
                    format!(
                        "Component `{group}` has {} under-constrained variables: {listed}",
                        names.len()
                    )
                };
                Finding::new("PotentiallyUnsound", BugCategory::UnderConstrained, description)
                    .with_position(Position {
                        component: Some(group.clone()),
                        ..Position::default()
                    })
                    .with_meta("variable_count", names.len())
                    .with_meta("undetermined_variables", serde_json::to_value(vars).unwrap_or_default())
            })
            .collect();

        if findings.is_empty() {
            findings.push(Finding::new(
                "PotentiallyUnsound",
                BugCategory::UnderConstrained,
                "Circuit has potentially unsound constraints",
            ));
        }
        Ok(Normalized::from_findings(findings))
    }
}
