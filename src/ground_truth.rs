//! Known-bug records from a zkbugs-style dataset.

use crate::error::{Error, Result};
use crate::tools::{BugCategory, fold};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const BUG_CONFIG_FILE: &str = "zkbugs_config.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, alias = "Path")]
    pub file: Option<String>,
    /// Template or function the bug lives in.
    #[serde(default, alias = "Function")]
    pub function: Option<String>,
    /// "42", "40-45" or "12, 40-45".
    #[serde(default, alias = "Line", deserialize_with = "line_text")]
    pub line: Option<String>,
}

fn line_text<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }
    Ok(Option::<Raw>::deserialize(d)?.and_then(|raw| match raw {
        Raw::Text(s) if s.trim().is_empty() => None,
        Raw::Text(s) => Some(s),
        Raw::Number(n) => Some(n.to_string()),
    }))
}

/// One entry of a bug config file, keyed the way the dataset writes it.
#[derive(Debug, Deserialize)]
struct BugRecord {
    #[serde(rename = "Vulnerability")]
    vulnerability: Option<String>,
    #[serde(rename = "Impact")]
    impact: Option<String>,
    #[serde(rename = "Root Cause")]
    root_cause: Option<String>,
    #[serde(rename = "Location", default)]
    location: Location,
    #[serde(rename = "DSL")]
    dsl: Option<String>,
    #[serde(rename = "Project")]
    project: Option<String>,
    #[serde(rename = "Commit")]
    commit: Option<String>,
    #[serde(rename = "Fix Commit")]
    fix_commit: Option<String>,
    #[serde(rename = "Reproduced")]
    reproduced: Option<bool>,
    #[serde(rename = "Short Description of the Vulnerability")]
    short_description: Option<String>,
    #[serde(rename = "Proposed Mitigation")]
    proposed_mitigation: Option<String>,
    #[serde(rename = "Source")]
    source: Option<serde_json::Value>,
}

/// Expert-authored description of the bug a circuit is known to contain.
/// Written as `ground_truth.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
    pub bug_name: String,
    pub vulnerability: Option<String>,
    pub impact: Option<String>,
    pub root_cause: Option<String>,
    #[serde(default)]
    pub location: Location,
    pub dsl: Option<String>,
    pub project: Option<String>,
    pub commit: Option<String>,
    pub fix_commit: Option<String>,
    pub reproduced: Option<bool>,
    pub short_description: Option<String>,
    pub proposed_mitigation: Option<String>,
    pub source: Option<serde_json::Value>,
}

impl GroundTruth {
    /// Read a bug config file. The file holds one object keyed by bug name.
    pub fn from_bug_config(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_bug_config_str(&text)
    }

    pub fn from_bug_config_str(text: &str) -> Result<Self> {
        let records: BTreeMap<String, BugRecord> = serde_json::from_str(text)?;
        if records.len() > 1 {
            warn!(entries = records.len(), "bug config holds several bugs, using the first");
        }
        let (bug_name, r) = records
            .into_iter()
            .next()
            .ok_or_else(|| Error::parse("bug config is empty"))?;
        Ok(Self {
            bug_name,
            vulnerability: r.vulnerability,
            impact: r.impact,
            root_cause: r.root_cause,
            location: r.location,
            dsl: r.dsl,
            project: r.project,
            commit: r.commit,
            fix_commit: r.fix_commit,
            reproduced: r.reproduced,
            short_description: r.short_description,
            proposed_mitigation: r.proposed_mitigation,
            source: r.source,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// The vulnerability name, or a comparison error when the record has none.
    pub fn require_vulnerability(&self) -> Result<&str> {
        self.vulnerability
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::comparison(format!("{}: ground truth has no vulnerability", self.bug_name)))
    }

    /// Category a correct finding must carry. Dataset labels such as
    /// "Computational/Hints Error" fold onto the closest category.
    pub fn expected_category(&self) -> Option<BugCategory> {
        let label = self.vulnerability.as_deref()?;
        BugCategory::from_label(label).or_else(|| {
            let key = fold(label);
            if key.contains("underconstrain") {
                Some(BugCategory::UnderConstrained)
            } else if key.contains("overconstrain") {
                Some(BugCategory::OverConstrained)
            } else if key.contains("computational") || key.contains("hint") {
                Some(BugCategory::ComputationalIssue)
            } else {
                None
            }
        })
    }

    pub fn function(&self) -> Option<&str> {
        self.location
            .function
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
    }

    /// Parsed line spans, `None` when the record carries no line.
    pub fn line_spans(&self) -> Result<Option<LineSpans>> {
        self.location.line.as_deref().map(LineSpans::parse).transpose()
    }
}

/// Set of inclusive line ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSpans(Vec<RangeInclusive<u32>>);

impl LineSpans {
    pub fn parse(text: &str) -> Result<Self> {
        let mut spans = Vec::new();
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let span = match part.split_once('-') {
                Some((start, end)) => {
                    let (start, end) = (line_number(start)?, line_number(end)?);
                    if start > end {
                        return Err(Error::comparison(format!("inverted line range '{part}'")));
                    }
                    start..=end
                }
                None => {
                    let line = line_number(part)?;
                    line..=line
                }
            };
            spans.push(span);
        }
        if spans.is_empty() {
            return Err(Error::comparison(format!("no line numbers in '{text}'")));
        }
        Ok(Self(spans))
    }

    pub fn contains(&self, line: u32) -> bool {
        self.0.iter().any(|span| span.contains(&line))
    }
}

fn line_number(text: &str) -> Result<u32> {
    text.trim()
        .parse()
        .map_err(|_| Error::comparison(format!("'{}' is not a line number", text.trim())))
}

/// One bug directory in a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugEntry {
    pub name: String,
    pub dir: PathBuf,
    pub config_path: PathBuf,
    /// `circuits/circuit.circom`, when present.
    pub circuit: Option<PathBuf>,
}

impl BugEntry {
    pub fn from_config(config_path: &Path) -> Self {
        let dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bug".into());
        let circuit = dir.join("circuits").join("circuit.circom");
        Self {
            name,
            config_path: config_path.to_path_buf(),
            circuit: circuit.is_file().then_some(circuit),
            dir,
        }
    }

    /// Accepts a bug directory or its config file.
    pub fn locate(input: &Path) -> Result<Self> {
        let config = if input.is_dir() {
            input.join(BUG_CONFIG_FILE)
        } else {
            input.to_path_buf()
        };
        if !config.is_file() {
            return Err(Error::input_not_found(config));
        }
        Ok(Self::from_config(&config))
    }
}

/// Every bug config under `dataset`, sorted by path.
pub fn discover_bugs(dataset: &Path) -> Vec<BugEntry> {
    let mut configs: Vec<PathBuf> = WalkDir::new(dataset)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == BUG_CONFIG_FILE)
        .map(|e| e.into_path())
        .collect();
    configs.sort();
    debug!(count = configs.len(), dataset = %dataset.display(), "bug configs found");
    configs.iter().map(|c| BugEntry::from_config(c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "Circom-Pairing: Missing Output Check": {
            "Id": "circom-pairing/1",
            "Project": "https://github.com/yi-sun/circom-pairing",
            "Commit": "c686f0011f8d18e0c11bd87e0a109e9478eb9e61",
            "Fix Commit": "",
            "DSL": "Circom",
            "Vulnerability": "Under-Constrained",
            "Impact": "Soundness",
            "Root Cause": "Missing Output Check Constraint",
            "Reproduced": true,
            "Location": {
                "Path": "circuits/bigint.circom",
                "Function": "BigLessThan",
                "Line": "40-45"
            },
            "Source": {"Audit Report": {"Source Link": "https://example.org"}}
        }
    }"#;

    #[test]
    fn bug_config_maps_to_snake_case() {
        let gt = GroundTruth::from_bug_config_str(CONFIG).unwrap();
        assert_eq!(gt.bug_name, "Circom-Pairing: Missing Output Check");
        assert_eq!(gt.vulnerability.as_deref(), Some("Under-Constrained"));
        assert_eq!(gt.root_cause.as_deref(), Some("Missing Output Check Constraint"));
        assert_eq!(gt.function(), Some("BigLessThan"));
        assert_eq!(gt.location.file.as_deref(), Some("circuits/bigint.circom"));
        assert_eq!(gt.reproduced, Some(true));

        let json = serde_json::to_value(&gt).unwrap();
        assert_eq!(json["location"]["line"], "40-45");
        assert_eq!(json["root_cause"], "Missing Output Check Constraint");
    }

    #[test]
    fn numeric_line_is_accepted() {
        let gt = GroundTruth::from_bug_config_str(
            r#"{"b": {"Vulnerability": "Under-Constrained", "Location": {"Line": 42}}}"#,
        )
        .unwrap();
        assert_eq!(gt.location.line.as_deref(), Some("42"));
    }

    #[test]
    fn empty_config_is_an_error() {
        assert!(GroundTruth::from_bug_config_str("{}").is_err());
    }

    #[test]
    fn line_spans_parse_ranges_and_lists() {
        let spans = LineSpans::parse("40-45").unwrap();
        assert!(spans.contains(40) && spans.contains(42) && spans.contains(45));
        assert!(!spans.contains(46));

        let spans = LineSpans::parse("12, 40-41").unwrap();
        assert!(spans.contains(12) && spans.contains(41));
        assert!(!spans.contains(13));
    }

    #[test]
    fn bad_line_spans_are_comparison_errors() {
        assert!(matches!(LineSpans::parse("abc"), Err(Error::Comparison(_))));
        assert!(matches!(LineSpans::parse("9-3"), Err(Error::Comparison(_))));
        assert!(matches!(LineSpans::parse(" , "), Err(Error::Comparison(_))));
    }

    #[test]
    fn missing_vulnerability_is_a_comparison_error() {
        let gt = GroundTruth::from_bug_config_str(r#"{"b": {"Impact": "Soundness"}}"#).unwrap();
        assert!(matches!(gt.require_vulnerability(), Err(Error::Comparison(_))));
        assert_eq!(gt.expected_category(), None);
    }

    #[test]
    fn dataset_labels_fold_onto_categories() {
        let mut gt = GroundTruth::from_bug_config_str(CONFIG).unwrap();
        assert_eq!(gt.expected_category(), Some(BugCategory::UnderConstrained));
        gt.vulnerability = Some("Computational/Hints Error".into());
        assert_eq!(gt.expected_category(), Some(BugCategory::ComputationalIssue));
    }

    #[test]
    fn discovery_finds_nested_configs() {
        let dir = tempfile::tempdir().unwrap();
        let with_circuit = dir.path().join("proj/bug_a");
        let without = dir.path().join("proj/bug_b");
        std::fs::create_dir_all(with_circuit.join("circuits")).unwrap();
        std::fs::create_dir_all(&without).unwrap();
        std::fs::write(with_circuit.join(BUG_CONFIG_FILE), CONFIG).unwrap();
        std::fs::write(with_circuit.join("circuits/circuit.circom"), "").unwrap();
        std::fs::write(without.join(BUG_CONFIG_FILE), CONFIG).unwrap();

        let bugs = discover_bugs(dir.path());
        assert_eq!(bugs.len(), 2);
        assert_eq!(bugs[0].name, "bug_a");
        assert!(bugs[0].circuit.is_some());
        assert!(bugs[1].circuit.is_none());
    }
}
