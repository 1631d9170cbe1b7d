use super::common::{fixture, ground_truth, result_for};
use zkhydra::evaluation::{ManualAnalysis, Verdict};
use zkhydra::tools::circomspect::Circomspect;
use zkhydra::tools::civer::CircomCiver;
use zkhydra::tools::conscs::ConsCs;
use zkhydra::tools::{Analyzer, ParseScope, ToolStatus};

#[test]
fn warning_inside_known_template_and_lines_is_true_positive() {
    let tool = Circomspect::new("circomspect");
    let gt = ground_truth("Under-Constrained", "Foo", "40-45");
    let result = result_for(&tool, &fixture("circomspect_foo.txt"), &ParseScope::function("Foo"));
    assert_eq!(result.status, ToolStatus::Success);
    assert_eq!(result.findings.len(), 1, "only the Foo block is read");

    let evaluation = tool.evaluate(&gt, &result);
    assert_eq!(evaluation.status, Verdict::TruePositive);
    assert!(!evaluation.need_manual_analysis);
}

#[test]
fn warning_outside_known_lines_needs_review() {
    let tool = Circomspect::new("circomspect");
    let gt = ground_truth("Under-Constrained", "Foo", "60-65");
    let result = result_for(&tool, &fixture("circomspect_foo.txt"), &ParseScope::function("Foo"));

    let evaluation = tool.evaluate(&gt, &result);
    assert_eq!(evaluation.status, Verdict::Undecided);
    assert!(evaluation.need_manual_analysis);
    assert_eq!(evaluation.manual_analysis, ManualAnalysis::Pending);
}

#[test]
fn no_findings_is_a_confident_false_negative() {
    let tool = Circomspect::new("circomspect");
    let gt = ground_truth("Under-Constrained", "Missing", "40-45");
    let result = result_for(&tool, &fixture("circomspect_foo.txt"), &ParseScope::function("Missing"));
    assert!(result.findings.is_empty());

    let evaluation = tool.evaluate(&gt, &result);
    assert_eq!(evaluation.status, Verdict::FalseNegative);
    assert!(!evaluation.need_manual_analysis);
    assert_eq!(evaluation.manual_analysis, ManualAnalysis::NotApplicable);
}

#[test]
fn civer_component_matches_known_template() {
    let tool = CircomCiver::new("civer_circom");
    let gt = ground_truth("Under-Constrained", "Foo", "10");
    let result = result_for(&tool, &fixture("civer_unsafe.txt"), &ParseScope::default());
    assert_eq!(tool.evaluate(&gt, &result).status, Verdict::TruePositive);
}

#[test]
fn conscs_template_in_another_place_is_undecided() {
    let tool = ConsCs::new("circom", "python3", "tools/conscs");
    let gt = ground_truth("Under-Constrained", "Bar", "10");
    let result = result_for(&tool, &fixture("conscs_under.log"), &ParseScope::default());
    assert_eq!(result.findings.len(), 1);
    assert_eq!(tool.evaluate(&gt, &result).status, Verdict::Undecided);
}
