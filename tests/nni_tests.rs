use phyloforge::optimizer::iqp;
use phyloforge::optimizer::nni::{compatible_moves, NoObserver, TreeObserver};
use phyloforge::optimizer::{MoveEngine, NniSettings};
use phyloforge::oracle::{ParsimonyOracle, ScoringOracle};
use phyloforge::topology::{ConstraintTopology, NniMove, NniSwap, PartitionScheme, Topology};
use proptest::prelude::*;
use rstest::rstest;

mod common;
use common::{names, simulated_alignment, tree, FailingOracle, TargetOracle};

fn mv(node1: usize, node2: usize, score: f64) -> NniMove {
    NniMove {
        swap: NniSwap {
            node1,
            node2,
            swap1: 0,
            swap2: 1,
        },
        rearrangement: 0,
        score,
        new_lengths: Vec::new(),
    }
}

#[test]
fn moves_sharing_a_node_keep_only_the_first() {
    let a = mv(7, 8, -10.0);
    let b = mv(9, 7, -11.0);
    let c = mv(10, 11, -12.0);
    let kept = compatible_moves(&[a.clone(), b, c.clone()]);
    assert_eq!(kept, vec![a, c]);
}

prop_compose! {
    fn arb_moves()(
        raw in proptest::collection::vec((0usize..12, 0usize..12, -50i32..0), 0..30)
    ) -> Vec<NniMove> {
        raw.into_iter()
            .filter(|(x, y, _)| x != y)
            .map(|(x, y, s)| mv(x, y, s as f64))
            .collect()
    }
}

proptest! {
    #[test]
    fn compatible_batch_is_conflict_free_and_maximal(moves in arb_moves()) {
        let kept = compatible_moves(&moves);
        for (i, a) in kept.iter().enumerate() {
            for b in &kept[i + 1..] {
                prop_assert!(!a.conflicts_with(b));
            }
        }
        for m in &moves {
            prop_assert!(kept.iter().any(|k| k.conflicts_with(m) || k == m));
        }
    }
}

const TARGET: &str = "(0,1,(2,(3,(4,(5,(6,(7,(8,9))))))));";
// TARGET with two far-apart interchanges undone.
const SHAKEN: &str = "(0,1,(3,(2,(4,(5,(7,(6,(8,9))))))));";

#[rstest]
#[case(3)]
#[case(0)]
fn joint_regression_falls_back_to_the_single_best_move(#[case] max_rollbacks: usize) {
    let target = tree(TARGET, 10);
    let mut topo = tree(SHAKEN, 10);
    let base = TargetOracle::new(&target, 0).matches(&topo);
    assert_eq!(base, 5);

    let oracle = TargetOracle::new(&target, base + 1);
    let settings = NniSettings {
        max_rollbacks,
        ..Default::default()
    };
    let engine = MoveEngine::new(&oracle, settings);
    let start = oracle.full_evaluate(&topo).unwrap();
    let mut rng = fastrand::Rng::with_seed(9);
    let outcome = engine.optimize(&mut topo, start, None, &mut rng, &mut NoObserver);

    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.score, (base + 1) as f64);
    assert_eq!(oracle.matches(&topo), base + 1);
    assert_eq!(topo.internal_branches().len(), 7);
}

#[test]
fn unlimited_gains_apply_both_moves_together() {
    let target = tree(TARGET, 10);
    let mut topo = tree(SHAKEN, 10);
    let oracle = TargetOracle::new(&target, 100);
    let engine = MoveEngine::new(&oracle, NniSettings::default());
    let mut rng = fastrand::Rng::with_seed(9);
    let outcome = engine.optimize(&mut topo, 5.0, None, &mut rng, &mut NoObserver);
    assert_eq!(outcome.score, 7.0);
    assert_eq!(outcome.applied, 2);
    assert_eq!(topo.topology_string(), target.topology_string());
}

#[derive(Default)]
struct Recorder(Vec<(String, f64)>);

impl TreeObserver for Recorder {
    fn observe(&mut self, topo: &Topology, score: f64) {
        self.0.push((topo.topology_string(), score));
    }
}

#[test]
fn every_step_shows_its_starting_tree() {
    let target = tree(TARGET, 10);
    let oracle = TargetOracle::new(&target, 100);
    let engine = MoveEngine::new(&oracle, NniSettings::default());
    let mut rng = fastrand::Rng::with_seed(9);

    let mut optimal = target.clone();
    let mut seen = Recorder::default();
    let outcome = engine.optimize(&mut optimal, 7.0, None, &mut rng, &mut seen);
    assert_eq!((outcome.steps, outcome.applied), (1, 0));
    assert_eq!(seen.0, vec![(target.topology_string(), 7.0)]);

    let mut shaken = tree(SHAKEN, 10);
    let mut seen = Recorder::default();
    engine.optimize(&mut shaken, 5.0, None, &mut rng, &mut seen);
    assert_eq!(
        seen.0,
        vec![
            (tree(SHAKEN, 10).topology_string(), 5.0),
            (target.topology_string(), 7.0)
        ]
    );
}

#[test]
fn failing_oracle_leaves_the_tree_alone() {
    let mut topo = tree(SHAKEN, 10);
    let before = topo.topology_string();
    let oracle = FailingOracle::default();
    let engine = MoveEngine::new(&oracle, NniSettings::default());
    let mut rng = fastrand::Rng::with_seed(1);
    let outcome = engine.optimize(&mut topo, -3.0, None, &mut rng, &mut NoObserver);
    assert_eq!(outcome.applied, 0);
    assert_eq!(outcome.score, -3.0);
    assert_eq!(topo.topology_string(), before);
}

#[rstest]
#[case(8, 11)]
#[case(12, 23)]
#[case(16, 5)]
fn nni_and_iqp_keep_the_tree_binary(#[case] taxa: usize, #[case] seed: u64) {
    let aln = simulated_alignment(taxa, 60, seed);
    let oracle = ParsimonyOracle::new(&aln, PartitionScheme::Single);
    let mut rng = fastrand::Rng::with_seed(seed);
    let mut topo = phyloforge::topology::Topology::random(taxa, &mut rng).unwrap();

    let engine = MoveEngine::new(&oracle, NniSettings::default());
    let start = oracle.full_evaluate(&topo).unwrap();
    let outcome = engine.optimize(&mut topo, start, None, &mut rng, &mut NoObserver);
    assert!(outcome.score >= start);
    assert_eq!(outcome.score, oracle.full_evaluate(&topo).unwrap());
    assert_eq!(topo.internal_branches().len(), taxa - 3);

    let moved = iqp::perturb(&mut topo, &oracle, taxa / 3, 4, None, &mut rng).unwrap();
    assert!(!moved.is_empty());
    assert!(topo.is_complete());
    assert_eq!(topo.internal_branches().len(), taxa - 3);
}

#[test]
fn constrained_search_never_breaks_the_constraint() {
    let taxa = 10;
    let aln = simulated_alignment(taxa, 80, 4);
    let oracle = ParsimonyOracle::new(&aln, PartitionScheme::Single);
    let constraint = ConstraintTopology::from_newick(
        "((taxon0,taxon1),(taxon2,taxon3),(taxon4,taxon5,taxon6,taxon7,taxon8,taxon9));",
        &names(taxa),
    )
    .unwrap();
    let mut topo = tree("(0,1,((2,3),(4,(5,(6,(7,(8,9)))))));", taxa);
    assert!(constraint.is_compatible(&topo));

    let engine = MoveEngine::new(&oracle, NniSettings::default()).with_constraint(Some(&constraint));
    let mut rng = fastrand::Rng::with_seed(2);
    for _ in 0..5 {
        let start = oracle.full_evaluate(&topo).unwrap();
        engine.optimize(&mut topo, start, None, &mut rng, &mut NoObserver);
        assert!(constraint.is_compatible(&topo));
        iqp::perturb(&mut topo, &oracle, 3, 4, Some(&constraint), &mut rng).unwrap();
        assert!(constraint.is_compatible(&topo));
    }
}
