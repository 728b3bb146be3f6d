use phyloforge::candidates::CandidateRecord;
use phyloforge::checkpoint::{CheckpointState, CheckpointStore, SearchPhase};
use phyloforge::config::{BootstrapParams, StopParams};
use phyloforge::optimizer::iqp::IqpState;
use phyloforge::stop_rule::StopRule;
use phyloforge::error::ForgeError;
use std::fs;
use tempfile::tempdir;

mod common;
use common::tree;

fn sample_state(fingerprint: &str) -> CheckpointState {
    let mut rule = StopRule::new(&StopParams::default(), &BootstrapParams::default());
    for _ in 0..7 {
        rule.increment();
    }
    rule.add_improved_iteration(4);
    CheckpointState {
        fingerprint: fingerprint.to_string(),
        phase: SearchPhase::Optimization,
        stop_rule: rule.snapshot(),
        candidates: vec![
            CandidateRecord {
                tree: tree("(0,1,(2,(3,4)));", 5).tree_string(),
                score: -42.0,
                source: 0,
            },
            CandidateRecord {
                tree: tree("(0,2,(1,(3,4)));", 5).tree_string(),
                score: -45.5,
                source: 1,
            },
        ],
        bootstrap: None,
        iqp: IqpState::new(5, 0),
    }
}

#[test]
fn saved_state_reads_back_unchanged() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path().join("run"), 0, "abc");
    let state = sample_state("abc");
    store.save(&state).unwrap();

    assert_eq!(CheckpointStore::read(store.path()).unwrap(), state);
    assert_eq!(store.load(), Some(state));
}

#[test]
fn edited_checkpoint_fails_the_digest() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path().join("run"), 0, "abc");
    store.save(&sample_state("abc")).unwrap();

    let text = fs::read_to_string(store.path()).unwrap();
    assert!(text.contains("\"cur_it\": 7"));
    fs::write(store.path(), text.replace("\"cur_it\": 7", "\"cur_it\": 70")).unwrap();

    assert!(matches!(
        CheckpointStore::read(store.path()),
        Err(ForgeError::Validation(_))
    ));
    assert_eq!(store.load(), None);
}

#[test]
fn truncated_checkpoint_is_ignored() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path().join("run"), 0, "abc");
    store.save(&sample_state("abc")).unwrap();
    let text = fs::read_to_string(store.path()).unwrap();
    fs::write(store.path(), &text[..text.len() / 2]).unwrap();
    assert_eq!(store.load(), None);
}

#[test]
fn checkpoint_of_another_run_is_ignored() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("run");
    CheckpointStore::new(&prefix, 0, "abc")
        .save(&sample_state("abc"))
        .unwrap();
    assert_eq!(CheckpointStore::new(&prefix, 0, "def").load(), None);
}

#[test]
fn missing_checkpoint_starts_fresh() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(dir.path().join("nothing"), 2, "abc");
    assert_eq!(store.load(), None);
}

#[test]
fn each_rank_has_its_own_file() {
    let coordinator = CheckpointStore::path_for("out/run", 0);
    let worker = CheckpointStore::path_for("out/run", 3);
    assert_eq!(coordinator.to_str(), Some("out/run.ckp.json"));
    assert_eq!(worker.to_str(), Some("out/run.rank3.ckp.json"));
}
