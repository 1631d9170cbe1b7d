use std::path::PathBuf;
use zkhydra::exec::{OutputStatus, ToolOutput};
use zkhydra::ground_truth::GroundTruth;
use zkhydra::runner;
use zkhydra::tools::{Analyzer, Artifacts, ParseScope, ToolResult};

pub fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("{}: {e}", path.display()))
}

pub fn success(message: &str) -> ToolOutput {
    ToolOutput {
        status: OutputStatus::Success,
        stdout: String::new(),
        stderr: String::new(),
        return_code: 0,
        message: message.to_string(),
        execution_time: 1.5,
    }
}

/// Push `raw` through parse and normalize the way a live run does.
pub fn result_for(tool: &dyn Analyzer, raw: &str, scope: &ParseScope) -> ToolResult {
    let dir = tempfile::tempdir().unwrap();
    runner::process_output(tool, &success(raw), dir.path(), scope, Artifacts::default())
}

pub fn ground_truth(vulnerability: &str, function: &str, line: &str) -> GroundTruth {
    let config = serde_json::json!({
        "Test Bug": {
            "Vulnerability": vulnerability,
            "Impact": "Soundness",
            "Root Cause": "Missing constraint",
            "DSL": "Circom",
            "Location": {"Path": "circuits/circuit.circom", "Function": function, "Line": line}
        }
    });
    GroundTruth::from_bug_config_str(&config.to_string()).unwrap()
}
