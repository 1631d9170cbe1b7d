use super::common::{fixture, ground_truth, result_for};
use zkhydra::evaluation::{Verdict, judge};
use zkhydra::tools::zkfuzz::ZkFuzz;
use zkhydra::tools::{Analyzer, BugCategory, Finding, MatchPolicy, ParseScope};

#[test]
fn normalized_names_match_by_containment() {
    let gt = ground_truth("Under-Constrained", "Foo", "40-45");
    let finding = Finding::new(
        "UnderConstrained: signal main.out differs",
        BugCategory::UnderConstrained,
        "",
    );
    let evaluation = judge(MatchPolicy::FuzzyDescription, &gt, &[finding]).unwrap();
    assert_eq!(evaluation.status, Verdict::TruePositive);
}

#[test]
fn zkfuzz_counterexample_matches_ground_truth() {
    let tool = ZkFuzz::new("zkfuzz");
    let gt = ground_truth("Under-Constrained", "Foo", "40-45");
    let result = result_for(&tool, &fixture("zkfuzz_counterexample.txt"), &ParseScope::default());
    assert_eq!(result.findings[0].position.signal.as_deref(), Some("main.out"));
    assert_eq!(tool.evaluate(&gt, &result).status, Verdict::TruePositive);
}

#[test]
fn different_violation_is_undecided() {
    let gt = ground_truth("Over-Constrained", "Foo", "40-45");
    let finding = Finding::new("UnderConstrained (Non-Deterministic)", BugCategory::UnderConstrained, "");
    let evaluation = judge(MatchPolicy::FuzzyDescription, &gt, &[finding]).unwrap();
    assert_eq!(evaluation.status, Verdict::Undecided);
    assert!(evaluation.need_manual_analysis);
}

#[test]
fn adding_findings_never_undoes_a_true_positive() {
    let gt = ground_truth("Under-Constrained", "Foo", "40-45");
    let hit = Finding::new("UnderConstrained", BugCategory::UnderConstrained, "");
    let noise = Finding::new("Assertion Failure", BugCategory::Warning, "");

    let empty = judge(MatchPolicy::FuzzyDescription, &gt, &[]).unwrap();
    assert_eq!(empty.status, Verdict::FalseNegative);
    let one = judge(MatchPolicy::FuzzyDescription, &gt, &[noise.clone()]).unwrap();
    assert_ne!(one.status, Verdict::FalseNegative);
    let both = judge(MatchPolicy::FuzzyDescription, &gt, &[noise, hit]).unwrap();
    assert_eq!(both.status, Verdict::TruePositive);
}

#[test]
fn description_text_is_not_matched() {
    let gt = ground_truth("Under-Constrained", "Foo", "40-45");
    let finding = Finding::new(
        "Assertion Failure",
        BugCategory::Warning,
        "template UnderConstrainedCheck, signal main.out",
    );
    let evaluation = judge(MatchPolicy::FuzzyDescription, &gt, &[finding]).unwrap();
    assert_eq!(evaluation.status, Verdict::Undecided);
}
