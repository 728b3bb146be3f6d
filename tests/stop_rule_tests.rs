use phyloforge::config::{BootstrapParams, StopParams};
use phyloforge::stop_rule::{SearchState, StopCondition, StopRule};
use rstest::rstest;
use std::time::Duration;

fn params(condition: StopCondition) -> (StopParams, BootstrapParams) {
    let stop = StopParams {
        condition,
        ..Default::default()
    };
    let bootstrap = BootstrapParams {
        replicates: 100,
        ..Default::default()
    };
    (stop, bootstrap)
}

#[rstest]
#[case(4, false)]
#[case(5, true)]
#[case(6, true)]
fn fixed_mode_honours_the_iteration_cap(#[case] it: usize, #[case] expected: bool) {
    let (mut stop, bootstrap) = params(StopCondition::FixedIterations);
    stop.max_iterations = 5;
    let mut rule = StopRule::new(&stop, &bootstrap);
    assert_eq!(rule.meet_stop_condition(it, 0.0), expected);
}

#[test]
fn fixed_mode_stops_at_required_iterations() {
    let (mut stop, bootstrap) = params(StopCondition::FixedIterations);
    stop.required_iterations = 30;
    let mut rule = StopRule::new(&stop, &bootstrap);
    assert!(!rule.meet_stop_condition(29, 0.0));
    assert!(rule.meet_stop_condition(30, 0.0));
    assert_eq!(rule.stop_reason(), SearchState::StoppedByLimit);
}

#[rstest]
#[case(15, false)]
#[case(16, true)]
fn unsuccessful_mode_counts_from_last_improvement(#[case] it: usize, #[case] expected: bool) {
    let (mut stop, bootstrap) = params(StopCondition::UnsuccessfulIterations);
    stop.unsuccessful_iterations = 6;
    let mut rule = StopRule::new(&stop, &bootstrap);
    rule.add_improved_iteration(3);
    rule.add_improved_iteration(10);
    assert_eq!(rule.meet_stop_condition(it, 0.0), expected);
    if expected {
        assert_eq!(rule.stop_reason(), SearchState::Converged);
    }
}

#[rstest]
#[case(0.995, true)]
#[case(0.5, false)]
fn correlation_mode_needs_high_correlation(#[case] corr: f64, #[case] expected: bool) {
    let (stop, bootstrap) = params(StopCondition::BootstrapCorrelation);
    let mut rule = StopRule::new(&stop, &bootstrap);
    assert!(!rule.meet_stop_condition(50, 0.999));
    assert_eq!(rule.meet_stop_condition(100, corr), expected);
}

#[test]
fn failed_correlation_test_postpones_the_next_one() {
    let (stop, bootstrap) = params(StopCondition::BootstrapCorrelation);
    let mut rule = StopRule::new(&stop, &bootstrap);
    rule.set_cur_it(100);
    assert!(!rule.meet_correlation(0.5));
    assert_eq!(rule.next_correlation_check(), 200);
    assert!(!rule.meet_stop_condition(150, 0.999));
    assert!(rule.meet_stop_condition(200, 0.999));
}

#[test]
fn stop_signal_wins_over_everything() {
    let (stop, bootstrap) = params(StopCondition::UnsuccessfulIterations);
    let mut rule = StopRule::new(&stop, &bootstrap);
    assert!(!rule.meet_limit(1));
    rule.signal_stop();
    assert!(rule.meet_limit(1));
    assert!(rule.meet_stop_condition(1, 0.0));
    assert_eq!(rule.stop_reason(), SearchState::StoppedBySignal);
}

#[test]
fn zero_time_budget_stops_immediately() {
    let (mut stop, bootstrap) = params(StopCondition::UnsuccessfulIterations);
    stop.max_time_secs = Some(0);
    let mut rule = StopRule::new(&stop, &bootstrap);
    assert!(rule.meet_limit(0));
    assert_eq!(rule.stop_reason(), SearchState::StoppedByLimit);
}

#[test]
fn restored_rule_continues_the_counters() {
    let (stop, bootstrap) = params(StopCondition::UnsuccessfulIterations);
    let mut rule = StopRule::new(&stop, &bootstrap);
    for _ in 0..7 {
        rule.increment();
    }
    rule.add_improved_iteration(5);
    let saved = rule.snapshot();

    let restored = StopRule::restore(&stop, &bootstrap, saved);
    assert_eq!(restored.cur_it(), 7);
    assert_eq!(restored.last_improved_iteration(), 5);
    assert_eq!(restored.predicted_iterations(), 5 + stop.unsuccessful_iterations);
}

#[test]
fn no_time_estimate_before_the_first_iteration() {
    let (stop, bootstrap) = params(StopCondition::FixedIterations);
    let rule = StopRule::new(&stop, &bootstrap);
    assert_eq!(rule.remaining_time(0), Duration::ZERO);
}
