//! circom_civer: formal weak-safety checker. Output lists components under
//! section headers (unsafe, timed out, safe) followed by summary counters.

use super::{
    Analyzer, BugCategory, CircuitInput, Finding, MatchPolicy, Normalized, ParseScope, ParsedOutput, Pattern,
    Position, captures, foreign_record, group,
};
use crate::error::{Error, Result};
use crate::exec::{ExecutionPlan, Invocation, is_timed_out};
use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static COMPONENT: Pattern = LazyLock::new(|| Regex::new(r"^-\s*([A-Za-z0-9_]+)\(([\d,\s]*)\)"));
static TRAILING_COUNT: Pattern = LazyLock::new(|| Regex::new(r"(\d+)\s*$"));

const VERIFICATION_TIMEOUT_MS: &str = "500000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Unsafe,
    TimedOut,
    Safe,
    Failed,
}

fn section_header(line: &str) -> Option<Section> {
    if line.starts_with("Components that do not satisfy weak safety") {
        Some(Section::Unsafe)
    } else if line.starts_with("Components timeout when checking weak-safety") {
        Some(Section::TimedOut)
    } else if line.starts_with("Components that satisfy weak safety") {
        Some(Section::Safe)
    } else if line.starts_with("Components that failed verification") {
        Some(Section::Failed)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub params: Vec<u64>,
}

impl Component {
    fn label(&self) -> String {
        if self.params.is_empty() {
            self.name.clone()
        } else {
            let params: Vec<String> = self.params.iter().map(u64::to_string).collect();
            format!("{}({})", self.name, params.join(", "))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiverStats {
    pub verified: Option<u32>,
    pub failed: Option<u32>,
    pub timeout: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiverReport {
    pub stats: CiverStats,
    pub buggy_components: Vec<Component>,
    pub timed_out_components: Vec<Component>,
    pub verified_components: Vec<Component>,
    pub failed_components: Vec<Component>,
}

/// Section tracker: a header opens a section, `- Name(params)` lines are
/// filed under it, and counters, `*` banners or `----` rules close it.
pub fn parse_report(raw: &str) -> Result<CiverReport> {
    let mut report = CiverReport::default();
    let mut section: Option<Section> = None;
    let mut recognized = false;

    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(header) = section_header(line) {
            section = Some(header);
            recognized = true;
            continue;
        }

        let counter = if line.contains("Number of verified components") {
            Some(&mut report.stats.verified)
        } else if line.contains("Number of failed components") {
            Some(&mut report.stats.failed)
        } else if line.contains("Number of timeout components") {
            Some(&mut report.stats.timeout)
        } else {
            None
        };
        if let Some(slot) = counter {
            recognized = true;
            section = None;
            *slot = match captures(&TRAILING_COUNT, line)? {
                Some(caps) => group(&caps, 1).and_then(|n| n.parse().ok()),
                None => None,
            };
            continue;
        }

        if line.starts_with('*') || line.contains("----") {
            section = None;
            continue;
        }
        if line.contains("weak safety") || line.contains("weak-safety") {
            recognized = true;
        }

        let Some(current) = section else { continue };
        let Some(caps) = captures(&COMPONENT, line)? else {
            continue;
        };
        let component = Component {
            name: group(&caps, 1).unwrap_or_default().to_string(),
            params: group(&caps, 2)
                .unwrap_or_default()
                .split(',')
                .filter_map(|n| n.trim().parse().ok())
                .collect(),
        };
        match current {
            Section::Unsafe => report.buggy_components.push(component),
            Section::TimedOut => report.timed_out_components.push(component),
            Section::Safe => report.verified_components.push(component),
            Section::Failed => report.failed_components.push(component),
        }
    }

    if !recognized {
        return Err(Error::parse("circom_civer output has no weak-safety report"));
    }
    Ok(report)
}

pub struct CircomCiver {
    binary: String,
}

impl CircomCiver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Analyzer for CircomCiver {
    fn name(&self) -> &'static str {
        "circom_civer"
    }

    fn policy(&self) -> MatchPolicy {
        MatchPolicy::LocationPrecise
    }

    fn plan(&self, input: &CircuitInput) -> ExecutionPlan {
        ExecutionPlan::single(
            Invocation::new(&self.binary)
                .arg(&input.circuit_file)
                .args(["--check_safety", "--verbose", "--verification_timeout", VERIFICATION_TIMEOUT_MS, "--O0"])
                .current_dir(input.circuit_dir())
                .requires(&input.circuit_file),
        )
    }

    fn parse(&self, raw: &str, _scope: &ParseScope) -> Result<ParsedOutput> {
        if is_timed_out(raw) {
            return Ok(ParsedOutput::TimedOut);
        }
        parse_report(raw).map(ParsedOutput::CircomCiver)
    }

    fn normalize(&self, parsed: &ParsedOutput) -> Result<Normalized> {
        let report = match parsed {
            ParsedOutput::TimedOut => return Ok(Normalized::timed_out()),
            ParsedOutput::CircomCiver(report) => report,
            other => return Err(foreign_record(self.name(), other)),
        };

        let mut findings: Vec<Finding> = report
            .buggy_components
            .iter()
            .map(|c| {
                Finding::new(
                    "WeakSafetyViolation",
                    BugCategory::UnderConstrained,
                    format!("Component {} does not satisfy weak safety", c.label()),
                )
                .with_position(Position {
                    template: Some(c.name.clone()),
                    component: Some(c.name.clone()),
                    ..Position::default()
                })
                .with_meta("params", c.params.clone())
            })
            .collect();

        let failed = report.stats.failed.unwrap_or(0);
        if findings.is_empty() && failed > 0 {
            findings.push(Finding::new(
                "WeakSafetyViolation",
                BugCategory::UnderConstrained,
                format!("{failed} component(s) failed weak safety verification"),
            ));
        }

        let timed_out = !report.timed_out_components.is_empty() || report.stats.timeout.unwrap_or(0) > 0;
        if findings.is_empty() && timed_out {
            return Ok(Normalized::timed_out());
        }
        Ok(Normalized::from_findings(findings))
    }
}
