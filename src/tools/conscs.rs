//! ConsCS: per-template constraint solver over R1CS. Results go to a log
//! file of `** key: value` records rather than stdout.

use super::{
    Analyzer, BugCategory, CircuitInput, Finding, MatchPolicy, Normalized, ParseScope, ParsedOutput, Position,
    foreign_record,
};
use crate::error::{Error, Result};
use crate::exec::{ExecutionPlan, Invocation, is_timed_out};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// SIMPLIFICATION, BPG and ASSUMPTION all enabled.
const FEATURE_FLAGS: &str = "111";
const MAX_DEPTH: &str = "4";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsCsRecord {
    /// As printed, e.g. `Edwards2Montgomery@montgomery.circom`.
    pub filename: String,
    pub template: Option<String>,
    pub file: Option<String>,
    /// Verdict with any trailing `!` removed.
    pub result: String,
    pub time: Option<f64>,
    pub counterexample: Option<String>,
}

impl ConsCsRecord {
    fn is_constrained(&self) -> bool {
        self.result.eq_ignore_ascii_case("CONSTRAINED")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsCsReport {
    pub records: Vec<ConsCsRecord>,
    pub total_time: f64,
}

fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.strip_prefix("** ")
        .and_then(|rest| rest.strip_prefix(key))
        .and_then(|rest| rest.strip_prefix(':'))
        .map(str::trim)
}

/// A record opens at `** filename:` and closes at the next filename, at
/// `** contribution counts:` or at a `******` banner.
pub fn parse_report(raw: &str) -> Result<ConsCsReport> {
    let mut records = Vec::new();
    let mut open: Option<ConsCsRecord> = None;

    let mut close = |open: &mut Option<ConsCsRecord>| {
        if let Some(record) = open.take().filter(|r| !r.result.is_empty()) {
            records.push(record);
        }
    };

    for line in raw.lines().map(str::trim) {
        if let Some(name) = field(line, "filename") {
            close(&mut open);
            let (template, file) = match name.split_once('@') {
                Some((t, f)) => (Some(t.to_string()), Some(f.to_string())),
                None => (Some(name.to_string()), None),
            };
            open = Some(ConsCsRecord {
                filename: name.to_string(),
                template,
                file,
                result: String::new(),
                time: None,
                counterexample: None,
            });
            continue;
        }
        if field(line, "contribution counts").is_some() || line.starts_with("******") {
            close(&mut open);
            continue;
        }
        let Some(record) = open.as_mut() else { continue };
        if let Some(result) = field(line, "result") {
            record.result = result.trim_end_matches('!').trim().to_string();
        } else if let Some(time) = field(line, "time") {
            record.time = time.parse().ok();
        } else if let Some(cex) = field(line, "counterexample") {
            record.counterexample = Some(cex.to_string()).filter(|c| !c.is_empty());
        }
    }
    close(&mut open);

    if records.is_empty() {
        return Err(Error::parse("ConsCS log has no result records"));
    }
    let total_time = records.iter().filter_map(|r| r.time).sum();
    Ok(ConsCsReport { records, total_time })
}

/// Total over ConsCS verdicts.
pub fn classify(result: &str) -> (&'static str, BugCategory) {
    let upper = result.to_ascii_uppercase();
    if upper.contains("UNDER") {
        ("UnderConstrained", BugCategory::UnderConstrained)
    } else if upper.contains("OVER") {
        ("OverConstrained", BugCategory::OverConstrained)
    } else if upper.contains("NOT SURE") {
        ("NotSure", BugCategory::Warning)
    } else if upper.contains("TIMEOUT") {
        ("TemplateTimeout", BugCategory::Warning)
    } else {
        ("Other", BugCategory::Warning)
    }
}

pub struct ConsCs {
    circom: String,
    python: String,
    tool_dir: PathBuf,
}

impl ConsCs {
    pub fn new(circom: impl Into<String>, python: impl Into<String>, tool_dir: impl Into<PathBuf>) -> Self {
        Self {
            circom: circom.into(),
            python: python.into(),
            tool_dir: tool_dir.into(),
        }
    }
}

impl Analyzer for ConsCs {
    fn name(&self) -> &'static str {
        "conscs"
    }

    fn policy(&self) -> MatchPolicy {
        MatchPolicy::LocationPrecise
    }

    fn plan(&self, input: &CircuitInput) -> ExecutionPlan {
        let stem = input.circuit_stem();
        let r1cs = input.work_dir.join(format!("{stem}.r1cs"));
        let log = input.work_dir.join(format!("{stem}_conscs.log"));
        let contributions = input.work_dir.join(format!("{stem}_conscs_contributions.log"));
        let script = self.tool_dir.join("analyze_circuit.py");

        ExecutionPlan::single(
            Invocation::new(&self.circom)
                .arg(&input.circuit_file)
                .args(["--r1cs", "-o"])
                .arg(&input.work_dir)
                .current_dir(input.circuit_dir())
                .requires(&input.circuit_file),
        )
        .then(
            Invocation::new(&self.python)
                .arg(&script)
                .arg(&r1cs)
                .arg(&log)
                .arg(&contributions)
                .args([FEATURE_FLAGS, MAX_DEPTH])
                .current_dir(&self.tool_dir)
                .requires(&script)
                .requires(&r1cs)
                .report_file(&log),
        )
        .cleanup(r1cs)
        .cleanup(log)
        .cleanup(contributions)
    }

    fn parse(&self, raw: &str, _scope: &ParseScope) -> Result<ParsedOutput> {
        if is_timed_out(raw) {
            return Ok(ParsedOutput::TimedOut);
        }
        parse_report(raw).map(ParsedOutput::Conscs)
    }

    fn normalize(&self, parsed: &ParsedOutput) -> Result<Normalized> {
        let report = match parsed {
            ParsedOutput::TimedOut => return Ok(Normalized::timed_out()),
            ParsedOutput::Conscs(report) => report,
            other => return Err(foreign_record(self.name(), other)),
        };
        let findings = report
            .records
            .iter()
            .filter(|r| !r.is_constrained())
            .map(|r| {
                let (title, category) = classify(&r.result);
                let mut finding = Finding::new(title, category, format!("{}: {}", r.result, r.filename))
                    .with_file(r.file.clone())
                    .with_position(Position {
                        template: r.template.clone(),
                        ..Position::default()
                    });
                if let Some(time) = r.time {
                    finding = finding.with_meta("time", time);
                }
                if let Some(cex) = &r.counterexample {
                    finding = finding.with_meta("counterexample", cex.as_str());
                }
                finding
            })
            .collect();
        Ok(Normalized::from_findings(findings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::AnalysisStatus;

    const LOG: &str = "\
** filename: Edwards2Montgomery@montgomery.circom
** result: UNDER-CONSTRAINED!
** time: 1.5
** counterexample: {'main.out[0]': 3}
** contribution counts: 4
** filename: IsZero@comparators.circom
** result: CONSTRAINED!
** time: 0.25
******
** filename: BigMod@bigint.circom
** result: NOT SURE
";

    #[test]
    fn records_split_on_filename_and_banners() {
        let report = parse_report(LOG).unwrap();
        assert_eq!(report.records.len(), 3);
        let first = &report.records[0];
        assert_eq!(first.template.as_deref(), Some("Edwards2Montgomery"));
        assert_eq!(first.file.as_deref(), Some("montgomery.circom"));
        assert_eq!(first.result, "UNDER-CONSTRAINED");
        assert_eq!(first.counterexample.as_deref(), Some("{'main.out[0]': 3}"));
        assert!((report.total_time - 1.75).abs() < f64::EPSILON);
    }

    #[test]
    fn constrained_templates_are_not_findings() {
        let tool = ConsCs::new("circom", "python3", "tools/conscs");
        let normalized = tool.normalize(&tool.parse(LOG, &ParseScope::default()).unwrap()).unwrap();
        assert_eq!(normalized.status, AnalysisStatus::BugsFound);
        assert_eq!(normalized.findings.len(), 2);
        assert_eq!(normalized.findings[0].unified_bug_title, BugCategory::UnderConstrained);
        assert_eq!(normalized.findings[0].position.template.as_deref(), Some("Edwards2Montgomery"));
        assert_eq!(normalized.findings[1].unified_bug_title, BugCategory::Warning);
    }

    #[test]
    fn empty_log_is_a_parse_error() {
        assert!(matches!(parse_report("Traceback (most recent call last):"), Err(Error::Parse(_))));
    }

    #[test]
    fn plan_reads_report_from_log() {
        let tool = ConsCs::new("circom", "python3", "/opt/conscs");
        let plan = tool.plan(&CircuitInput::new("/b/circuits/circuit.circom", "/out/conscs"));
        let report = plan.steps[1].report_file.as_ref().unwrap();
        assert!(report.ends_with("circuit_conscs.log"));
        assert_eq!(plan.steps[1].args[1], "/out/conscs/circuit.r1cs");
        assert_eq!(&plan.steps[1].args[4..], ["111", "4"]);
    }
}
