use super::common::{fixture, ground_truth, result_for};
use zkhydra::evaluation::Verdict;
use zkhydra::tools::ecneproject::EcneProject;
use zkhydra::tools::picus::Picus;
use zkhydra::tools::{Analyzer, BugCategory, ParseScope};

#[test]
fn unsound_verdict_is_never_auto_confirmed() {
    let tool = EcneProject::new("circom", "julia", "tools/ecneproject");
    let gt = ground_truth("Under-Constrained", "Foo", "40-45");
    let result = result_for(&tool, &fixture("ecneproject_unsound.txt"), &ParseScope::default());
    assert!(!result.findings.is_empty());
    assert!(result.findings.iter().all(|f| f.unified_bug_title == BugCategory::UnderConstrained));

    let evaluation = tool.evaluate(&gt, &result);
    assert_eq!(evaluation.status, Verdict::Undecided);
    assert!(evaluation.need_manual_analysis);
}

#[test]
fn sound_verdict_is_false_negative() {
    let tool = EcneProject::new("circom", "julia", "tools/ecneproject");
    let gt = ground_truth("Under-Constrained", "Foo", "40-45");
    let raw = "stdout:\nR1CS function circuit has sound constraints (No trusted functions needed!)\nstderr:\n";
    let evaluation = tool.evaluate(&gt, &result_for(&tool, raw, &ParseScope::default()));
    assert_eq!(evaluation.status, Verdict::FalseNegative);
}

#[test]
fn counterexample_differencing_yields_one_signal() {
    let tool = Picus::new("tools/picus");
    let result = result_for(&tool, &fixture("picus_underconstrained.txt"), &ParseScope::default());
    assert_eq!(result.findings.len(), 1);
    let finding = &result.findings[0];
    assert_eq!(finding.unified_bug_title, BugCategory::UnderConstrained);
    assert_eq!(finding.position.signal.as_deref(), Some("main.c"));

    let gt = ground_truth("Under-Constrained", "Foo", "40-45");
    assert_eq!(tool.evaluate(&gt, &result).status, Verdict::Undecided);
}

#[test]
fn labelled_internal_variables_end_the_counterexample() {
    let tool = Picus::new("tools/picus");
    let result = result_for(&tool, &fixture("picus_labelled_internals.txt"), &ParseScope::default());
    let signals: Vec<_> = result.findings.iter().filter_map(|f| f.position.signal.as_deref()).collect();
    assert_eq!(signals, ["main.out"]);
}
