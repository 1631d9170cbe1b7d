//! Adapter contract every analyzer implements, the shared finding vocabulary,
//! and the name-to-adapter registry.

pub mod circomspect;
pub mod civer;
pub mod conscs;
pub mod ecneproject;
pub mod picus;
pub mod zkfuzz;

use crate::config::ToolsConfig;
use crate::error::{Error, Result};
use crate::evaluation::{self, EvaluationResult};
use crate::exec::{ExecutionPlan, ExitPolicy};
use crate::ground_truth::GroundTruth;
use fancy_regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::warn;

// -- Shared vocabulary --

/// The closed set every native diagnostic is mapped into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BugCategory {
    #[serde(rename = "Under-Constrained")]
    UnderConstrained,
    #[serde(rename = "Over-Constrained")]
    OverConstrained,
    #[serde(rename = "Computational-Issue")]
    ComputationalIssue,
    Warning,
}

impl BugCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnderConstrained => "Under-Constrained",
            Self::OverConstrained => "Over-Constrained",
            Self::ComputationalIssue => "Computational-Issue",
            Self::Warning => "Warning",
        }
    }

    /// Lenient lookup: "under constrained", "UnderConstrained" and
    /// "Under-Constrained" all resolve to the same category.
    pub fn from_label(label: &str) -> Option<Self> {
        let key = fold(label);
        [
            Self::UnderConstrained,
            Self::OverConstrained,
            Self::ComputationalIssue,
            Self::Warning,
        ]
        .into_iter()
        .find(|c| fold(c.as_str()) == key)
    }
}

impl fmt::Display for BugCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercase and drop everything that is not a letter or digit.
pub fn fold(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Where a tool says the problem is. Tools fill in only what they know.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

impl Position {
    pub fn is_empty(&self) -> bool {
        self.line.is_none()
            && self.column.is_none()
            && self.template.is_none()
            && self.component.is_none()
            && self.signal.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub bug_title: String,
    pub unified_bug_title: BugCategory,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default)]
    pub position: Position,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Finding {
    pub fn new(bug_title: impl Into<String>, category: BugCategory, description: impl Into<String>) -> Self {
        Self {
            bug_title: bug_title.into(),
            unified_bug_title: category,
            description: description.into(),
            file: None,
            position: Position::default(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn with_file(mut self, file: Option<String>) -> Self {
        self.file = file;
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// The tool's own verdict, independent of any ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AnalysisStatus {
    BugsFound,
    NoBugs,
    Timeout,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub status: AnalysisStatus,
    pub findings: Vec<Finding>,
    pub error: Option<String>,
}

impl Normalized {
    pub fn from_findings(findings: Vec<Finding>) -> Self {
        let status = if findings.is_empty() {
            AnalysisStatus::NoBugs
        } else {
            AnalysisStatus::BugsFound
        };
        Self {
            status,
            findings,
            error: None,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            status: AnalysisStatus::Timeout,
            findings: Vec::new(),
            error: None,
        }
    }

    pub fn tool_error(msg: impl Into<String>) -> Self {
        Self {
            status: AnalysisStatus::Error,
            findings: Vec::new(),
            error: Some(msg.into()),
        }
    }
}

/// How a tool's findings may be compared against a known bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchPolicy {
    /// Reports a template, component or line that can be checked.
    LocationPrecise,
    /// Says only whether the whole circuit is sound.
    CircuitLevel,
    /// Reports a free-text vulnerability name.
    FuzzyDescription,
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LocationPrecise => "location-precise",
            Self::CircuitLevel => "circuit-level",
            Self::FuzzyDescription => "fuzzy-description",
        })
    }
}

/// Tool-specific structured record, stored as `parsed.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedOutput {
    /// Raw output carried the timeout sentinel; nothing else was read.
    TimedOut,
    Circomspect(circomspect::CircomspectReport),
    CircomCiver(civer::CiverReport),
    Picus(picus::PicusReport),
    Ecneproject(ecneproject::EcneReport),
    Zkfuzz(zkfuzz::ZkfuzzReport),
    Conscs(conscs::ConsCsReport),
}

impl ParsedOutput {
    fn kind(&self) -> &'static str {
        match self {
            Self::TimedOut => "timed_out",
            Self::Circomspect(_) => "circomspect",
            Self::CircomCiver(_) => "circom_civer",
            Self::Picus(_) => "picus",
            Self::Ecneproject(_) => "ecneproject",
            Self::Zkfuzz(_) => "zkfuzz",
            Self::Conscs(_) => "conscs",
        }
    }
}

pub(crate) fn foreign_record(tool: &str, parsed: &ParsedOutput) -> Error {
    Error::parse(format!("{tool} cannot normalize a {} record", parsed.kind()))
}

// -- Adapter inputs --

/// One circuit to analyze and the directory this tool may write into.
#[derive(Debug, Clone)]
pub struct CircuitInput {
    pub circuit_file: PathBuf,
    pub work_dir: PathBuf,
}

impl CircuitInput {
    pub fn new(circuit_file: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            circuit_file: circuit_file.into(),
            work_dir: work_dir.into(),
        }
    }

    pub fn circuit_dir(&self) -> &Path {
        self.circuit_file.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn circuit_stem(&self) -> String {
        self.circuit_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "circuit".into())
    }
}

/// Narrows parsing to the part of the output about one function or template.
#[derive(Debug, Clone, Default)]
pub struct ParseScope {
    pub function: Option<String>,
}

impl ParseScope {
    pub fn function(name: impl Into<String>) -> Self {
        Self {
            function: Some(name.into()),
        }
    }
}

// -- Per-run result --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    pub raw: Option<PathBuf>,
    pub tool_output: Option<PathBuf>,
    pub parsed: Option<PathBuf>,
    pub results: Option<PathBuf>,
}

/// Outcome of one tool on one circuit; written as `results.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_status: Option<AnalysisStatus>,
    pub message: String,
    pub execution_time: f64,
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub artifacts: Artifacts,
}

impl ToolResult {
    pub fn failed(tool: &str, message: impl Into<String>, error: impl Into<String>, execution_time: f64) -> Self {
        Self {
            tool: tool.to_string(),
            status: ToolStatus::Failed,
            analysis_status: None,
            message: message.into(),
            execution_time,
            findings: Vec::new(),
            error: Some(error.into()),
            artifacts: Artifacts::default(),
        }
    }
}

// -- The contract --

/// What the runner needs from one analyzer.
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;

    fn policy(&self) -> MatchPolicy;

    fn exit_policy(&self) -> ExitPolicy {
        ExitPolicy::default()
    }

    fn plan(&self, input: &CircuitInput) -> ExecutionPlan;

    /// Pure function of the raw text.
    fn parse(&self, raw: &str, scope: &ParseScope) -> Result<ParsedOutput>;

    fn normalize(&self, parsed: &ParsedOutput) -> Result<Normalized>;

    fn evaluate(&self, ground_truth: &GroundTruth, result: &ToolResult) -> EvaluationResult {
        evaluation::evaluate(self.policy(), ground_truth, result)
    }
}

// -- Registry --

pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Analyzer>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Every built-in analyzer, with binary locations from `config`.
    pub fn with_defaults(config: &ToolsConfig) -> Self {
        let mut registry = Self::new();
        registry.register(circomspect::Circomspect::new(config.binary("circomspect")));
        registry.register(civer::CircomCiver::new(config.binary("civer_circom")));
        registry.register(picus::Picus::new(config.picus_dir.clone()));
        registry.register(ecneproject::EcneProject::new(
            config.binary("circom"),
            config.binary("julia"),
            config.ecneproject_dir.clone(),
        ));
        registry.register(zkfuzz::ZkFuzz::new(config.binary("zkfuzz")));
        registry.register(conscs::ConsCs::new(
            config.binary("circom"),
            config.binary("python3"),
            config.conscs_dir.clone(),
        ));
        registry
    }

    pub fn register<A: Analyzer + 'static>(&mut self, analyzer: A) {
        self.tools
            .insert(analyzer.name().to_string(), Arc::new(analyzer));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Analyzer>> {
        self.tools.get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn Analyzer>> {
        self.tools.values().cloned().collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Look up `names` in order, skipping (and logging) unknown ones.
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Vec<Arc<dyn Analyzer>> {
        let mut resolved: Vec<Arc<dyn Analyzer>> = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            match self.get(name) {
                Some(tool) if !resolved.iter().any(|t| t.name() == tool.name()) => {
                    resolved.push(tool)
                }
                Some(_) => {}
                None => warn!(tool = %name, "unknown tool, skipping"),
            }
        }
        resolved
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// -- Regex plumbing shared by the parsers --

pub(crate) type Pattern = LazyLock<std::result::Result<Regex, fancy_regex::Error>>;

pub(crate) fn compiled(pattern: &'static Pattern) -> Result<&'static Regex> {
    LazyLock::force(pattern)
        .as_ref()
        .map_err(|e| Error::parse(format!("pattern failed to compile: {e}")))
}

pub(crate) fn captures<'t>(pattern: &'static Pattern, text: &'t str) -> Result<Option<Captures<'t>>> {
    compiled(pattern)?
        .captures(text)
        .map_err(|e| Error::parse(format!("pattern match failed: {e}")))
}

pub(crate) fn group<'t>(caps: &Captures<'t>, i: usize) -> Option<&'t str> {
    caps.get(i).map(|m| m.as_str())
}
