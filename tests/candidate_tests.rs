use phyloforge::candidates::{CandidateSet, UpdateOutcome};
use phyloforge::topology::Topology;
use proptest::prelude::*;

mod common;
use common::tree;

const FIVE_TAXON_TREES: [&str; 5] = [
    "(0,1,(2,(3,4)));",
    "(0,2,(1,(3,4)));",
    "(0,3,(1,(2,4)));",
    "(0,4,(1,(2,3)));",
    "(0,1,(3,(2,4)));",
];

fn canonical(newick: &str) -> String {
    tree(newick, 5).tree_string()
}

#[test]
fn keeps_the_highest_scores_when_full() {
    let mut set = CandidateSet::new(3, 5);
    for (newick, score) in FIVE_TAXON_TREES.iter().zip([10.0, 20.0, 15.0, 25.0, 5.0]) {
        set.update(&canonical(newick), score);
    }
    assert_eq!(set.len(), 3);
    assert_eq!(set.best_scores(3), vec![25.0, 20.0, 15.0]);
    assert_eq!(set.best_score(), 25.0);
    assert!(set.contains(&canonical(FIVE_TAXON_TREES[3])));
    assert!(!set.contains(&canonical(FIVE_TAXON_TREES[0])));
}

#[test]
fn reinserting_the_same_tree_changes_nothing() {
    let mut set = CandidateSet::new(3, 5);
    let t = canonical(FIVE_TAXON_TREES[0]);
    assert_eq!(set.update(&t, -12.0), UpdateOutcome::Inserted(0));
    assert_eq!(set.update(&t, -12.0), UpdateOutcome::DuplicateWorse);
    assert_eq!(set.update(&t, -15.0), UpdateOutcome::DuplicateWorse);
    assert_eq!(set.len(), 1);
    assert_eq!(set.score_of(&t), Some(-12.0));
}

#[test]
fn better_score_for_known_topology_replaces_it() {
    let mut set = CandidateSet::new(3, 5);
    let t = canonical(FIVE_TAXON_TREES[1]);
    set.update(&canonical(FIVE_TAXON_TREES[0]), -10.0);
    set.update(&t, -20.0);
    assert_eq!(set.update(&t, -5.0), UpdateOutcome::Inserted(0));
    assert_eq!(set.len(), 2);
    assert_eq!(set.best_scores(2), vec![-5.0, -10.0]);
}

#[test]
fn malformed_and_hopeless_trees_are_rejected() {
    let mut set = CandidateSet::new(1, 5);
    assert_eq!(set.update("(0,1,(2,3)", 1.0), UpdateOutcome::NotFound);
    set.update(&canonical(FIVE_TAXON_TREES[0]), 3.0);
    assert_eq!(
        set.update(&canonical(FIVE_TAXON_TREES[1]), 2.0),
        UpdateOutcome::NotFound
    );
}

#[test]
fn equal_topologies_share_a_key_regardless_of_layout() {
    let a = "(0:0.5,1:0.5,(2:0.1,(3:0.2,(4:0.3,5:0.3):0.1):0.1):0.2);";
    let b = "((5,4),3,(2,(1,0)));";

    let mut set = CandidateSet::new(4, 6);
    assert_eq!(set.update(a, -7.0), UpdateOutcome::Inserted(0));
    assert_eq!(set.update(b, -7.0), UpdateOutcome::DuplicateWorse);
    assert!(set.contains(b));
    assert_eq!(set.score_of(b), Some(-7.0));
    assert_eq!(set.len(), 1);
    assert_eq!(
        set.best_tree_strings(1),
        vec![Topology::from_newick(a, 6).unwrap().tree_string()]
    );
}

#[test]
fn trees_over_the_wrong_taxa_never_enter() {
    let mut set = CandidateSet::new(5, 5);
    for bad in [
        "();",
        "(zz);",
        "(0,0,0);",
        "(0,1,(2,3));",
        "(0,1,(2,(3,9)));",
        "(0,1,2,(3,4));",
        "(0,1,(2,3,4));",
    ] {
        assert_eq!(set.update_from(bad, 1e9, 1), UpdateOutcome::NotFound, "{}", bad);
    }
    assert!(set.is_empty());
    assert!(!set.contains("(zz);"));
    assert_eq!(set.score_of("();"), None);
}

#[test]
fn process_share_interleaves_the_top_trees() {
    let mut set = CandidateSet::new(5, 5);
    for (i, newick) in FIVE_TAXON_TREES.iter().enumerate() {
        set.update(&canonical(newick), -(i as f64));
    }
    let all = set.best_tree_strings(5);
    let rank1 = set.best_tree_strings_for_process(5, 1, 2);
    assert_eq!(rank1, vec![all[1].clone(), all[3].clone()]);
}

prop_compose! {
    fn arb_insertions()(
        picks in proptest::collection::vec((0usize..5, -100i32..0), 1..40)
    ) -> Vec<(usize, f64)> {
        picks.into_iter().map(|(t, s)| (t, s as f64)).collect()
    }
}

proptest! {
    #[test]
    fn set_stays_bounded_sorted_and_keeps_the_best(
        capacity in 1usize..5,
        inserts in arb_insertions()
    ) {
        let trees: Vec<String> = FIVE_TAXON_TREES.iter().map(|t| canonical(t)).collect();
        let mut set = CandidateSet::new(capacity, 5);
        let mut best = f64::MIN;
        for (t, score) in &inserts {
            set.update(&trees[*t], *score);
            best = best.max(*score);
            prop_assert!(set.len() <= capacity);
            prop_assert_eq!(set.best_score(), best);
        }
        let scores = set.best_scores(capacity);
        prop_assert!(scores.windows(2).all(|w| w[0] >= w[1]));
    }
}
