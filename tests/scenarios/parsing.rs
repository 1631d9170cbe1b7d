use super::common::{fixture, result_for};
use zkhydra::exec::TIMEOUT_SENTINEL;
use zkhydra::tools::{ParseScope, ToolRegistry, ToolStatus};
use zkhydra::config::ToolsConfig;

const FIXTURES: &[(&str, &str)] = &[
    ("circomspect", "circomspect_foo.txt"),
    ("circom_civer", "civer_unsafe.txt"),
    ("picus", "picus_underconstrained.txt"),
    ("ecneproject", "ecneproject_unsound.txt"),
    ("zkfuzz", "zkfuzz_counterexample.txt"),
    ("conscs", "conscs_under.log"),
];

#[test]
fn parsing_is_idempotent() {
    let registry = ToolRegistry::with_defaults(&ToolsConfig::default());
    for (name, file) in FIXTURES {
        let tool = registry.get(name).unwrap();
        let raw = fixture(file);
        let first = serde_json::to_string(&tool.parse(&raw, &ParseScope::default()).unwrap()).unwrap();
        let second = serde_json::to_string(&tool.parse(&raw, &ParseScope::default()).unwrap()).unwrap();
        assert_eq!(first, second, "{name}");
    }
}

#[test]
fn timeout_sentinel_wins_for_every_tool() {
    let registry = ToolRegistry::with_defaults(&ToolsConfig::default());
    for (name, file) in FIXTURES {
        let tool = registry.get(name).unwrap();
        let raw = format!("{TIMEOUT_SENTINEL}\nPartial stdout:\n{}\nPartial stderr:\n", fixture(file));
        let result = result_for(tool.as_ref(), &raw, &ParseScope::default());
        assert_eq!(result.status, ToolStatus::Timeout, "{name}");
        assert!(result.findings.is_empty(), "{name}");
    }
}

#[test]
fn unrecognized_output_fails_instead_of_reporting_nothing() {
    let registry = ToolRegistry::with_defaults(&ToolsConfig::default());
    for tool in registry.all() {
        let result = result_for(tool.as_ref(), "stdout:\nSegmentation fault\nstderr:\n", &ParseScope::default());
        assert_eq!(result.status, ToolStatus::Failed, "{}", tool.name());
        assert!(result.error.as_deref().unwrap_or_default().contains("Parse error"), "{}", tool.name());
    }
}
