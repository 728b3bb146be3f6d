use phyloforge::bootstrap::{
    correlation, BootstrapAccumulator, BootstrapSamples, ReplicateBest, ReplicateSlice,
    SplitSupportHistory, SplitSupportSnapshot,
};
use phyloforge::topology::Split;
use rstest::rstest;

mod common;
use common::tree;

fn single_replicate(epsilon: f64) -> BootstrapAccumulator {
    let samples = BootstrapSamples::generate(&[1], 1, 7);
    BootstrapAccumulator::new(samples, 4, 0..1, epsilon, 8)
}

fn topo_string(newick: &str) -> String {
    tree(newick, 4).topology_string()
}

#[test]
fn first_tree_fills_the_replicate() {
    let mut acc = single_replicate(0.5);
    let mut rng = fastrand::Rng::with_seed(1);
    let a = topo_string("(0,1,(2,3));");
    assert_eq!(acc.observe(&a, &[-10.0], -10.0, &mut rng), 1);
    let rep = &acc.replicates()[0];
    assert_eq!(rep.tree, a);
    assert_eq!(rep.count, 1);
    assert_eq!(rep.best_score, -10.0);
}

#[test]
fn clearly_better_tree_resets_the_tie_count() {
    let mut acc = single_replicate(0.5);
    let mut rng = fastrand::Rng::with_seed(1);
    acc.observe(&topo_string("(0,1,(2,3));"), &[-10.0], -10.0, &mut rng);
    let b = topo_string("(0,2,(1,3));");
    assert_eq!(acc.observe(&b, &[-4.0], -4.0, &mut rng), 1);
    assert_eq!(acc.replicates()[0].tree, b);
    assert_eq!(acc.replicates()[0].count, 1);

    assert_eq!(
        acc.observe(&topo_string("(0,3,(1,2));"), &[-20.0], -20.0, &mut rng),
        0
    );
    assert_eq!(acc.replicates()[0].tree, b);
}

#[test]
fn near_ties_are_taken_about_half_the_time() {
    let a = topo_string("(0,1,(2,3));");
    let b = topo_string("(0,2,(1,3));");
    let mut taken = 0;
    let trials = 2000;
    for seed in 0..trials {
        let mut acc = single_replicate(0.5);
        let mut rng = fastrand::Rng::with_seed(seed);
        acc.observe(&a, &[-10.0], -10.0, &mut rng);
        if acc.observe(&b, &[-10.2], -10.2, &mut rng) == 1 {
            taken += 1;
            assert_eq!(acc.replicates()[0].count, 2);
            assert_eq!(acc.replicates()[0].best_score, -10.0);
        }
    }
    let share = taken as f64 / trials as f64;
    assert!((0.4..0.6).contains(&share), "tie share {}", share);
}

#[test]
fn cutoff_skips_trees_far_below_it() {
    let mut acc = single_replicate(0.5);
    let mut rng = fastrand::Rng::with_seed(3);
    acc.observe(&topo_string("(0,1,(2,3));"), &[-10.0], -10.0, &mut rng);
    assert_eq!(acc.update_logl_cutoff(), Some(-10.0));
    assert_eq!(
        acc.observe(&topo_string("(0,2,(1,3));"), &[5.0], -11.5, &mut rng),
        0
    );
}

#[test]
fn slices_move_replicates_between_processes() {
    let samples = BootstrapSamples::generate(&[2, 3], 6, 11);
    let mut owner = BootstrapAccumulator::new(samples.clone(), 4, 3..6, 0.5, 8);
    let mut other = BootstrapAccumulator::new(samples, 4, 0..3, 0.5, 8);
    let mut rng = fastrand::Rng::with_seed(5);
    owner.observe(&topo_string("(0,1,(2,3));"), &[-1.0, -2.0], -8.0, &mut rng);

    other.absorb(&owner.owned_slice());
    assert!(other.replicates()[3..].iter().all(|r| r.is_filled()));
    assert!(other.replicates()[..3].iter().all(|r| !r.is_filled()));
}

#[test]
fn foreign_or_overflowing_slices_are_dropped() {
    let samples = BootstrapSamples::generate(&[2, 3], 6, 11);
    let mut acc = BootstrapAccumulator::new(samples, 4, 0..3, 0.5, 8);
    let filled = ReplicateBest {
        count: 1,
        best_score: -1.0,
        orig_score: -1.0,
        tree: topo_string("(0,1,(2,3));"),
    };

    acc.absorb(&ReplicateSlice {
        start: usize::MAX,
        entries: vec![filled.clone()],
    });
    acc.absorb(&ReplicateSlice {
        start: 5,
        entries: vec![filled.clone(), filled.clone()],
    });
    acc.absorb(&ReplicateSlice {
        start: 3,
        entries: vec![
            filled.clone(),
            ReplicateBest {
                tree: "(0,1,(2,7));".into(),
                ..filled.clone()
            },
        ],
    });
    assert!(acc.replicates().iter().all(|r| !r.is_filled()));

    acc.absorb(&ReplicateSlice {
        start: 4,
        entries: vec![filled.clone(), ReplicateBest::default()],
    });
    assert!(acc.replicates()[4].is_filled());
    assert!(!acc.replicates()[5].is_filled());
}

#[test]
fn support_counts_the_replicate_trees() {
    let samples = BootstrapSamples::generate(&[1], 2, 1);
    let mut acc = BootstrapAccumulator::new(samples, 4, 0..2, 0.5, 8);
    let t = tree("(0,1,(2,3));", 4);
    let mut rng = fastrand::Rng::with_seed(1);
    acc.observe(&t.topology_string(), &[-1.0], -1.0, &mut rng);
    let support = acc.support_for(&t);
    assert_eq!(support.len(), 1);
    assert!(support.values().all(|&s| s == 100.0));
}

#[rstest]
#[case(vec![1.0, 2.0, 3.0], vec![1.0, 2.0, 3.0], 1.0)]
#[case(vec![1.0, 2.0, 3.0], vec![3.0, 2.0, 1.0], -1.0)]
#[case(vec![4.0, 4.0, 4.0], vec![1.0, 5.0, 9.0], 1.0)]
#[case(vec![], vec![], 1.0)]
fn correlation_edge_cases(#[case] x: Vec<f64>, #[case] y: Vec<f64>, #[case] expected: f64) {
    assert!((correlation(&x, &y) - expected).abs() < 1e-9);
}

#[test]
fn history_needs_two_snapshots_and_drops_the_oldest() {
    let mut history = SplitSupportHistory::new(2);
    let split = Split::from_leaves(5, [0, 1]);
    assert_eq!(history.correlation(), 0.0);
    for iteration in [10, 20, 30] {
        history.push(SplitSupportSnapshot {
            iteration,
            supports: vec![(split.clone(), 4)],
        });
    }
    assert_eq!(history.len(), 2);
    assert_eq!(history.snapshots().next().map(|s| s.iteration), Some(20));
    assert_eq!(history.correlation(), 1.0);
}
