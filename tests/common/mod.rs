#![allow(dead_code)]

use phyloforge::alignment::Alignment;
use phyloforge::config::Config;
use phyloforge::optimizer::SearchContext;
use phyloforge::oracle::{OracleError, OracleResult, ParsimonyOracle, ScoringOracle};
use phyloforge::topology::{LeafId, PartitionScheme, Split, Topology};
use std::collections::HashSet;
use std::sync::Arc;

pub fn names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("taxon{}", i)).collect()
}

/// DNA evolved down a random tree, so the data carries a real signal.
pub fn simulated_alignment(taxa: usize, sites: usize, seed: u64) -> Alignment {
    let mut rng = fastrand::Rng::with_seed(seed);
    let tree = Topology::random(taxa, &mut rng).unwrap();
    let order = tree.preorder();
    let bases = b"ACGT";
    let mut rows = vec![Vec::with_capacity(sites); taxa];
    let mut state = vec![0u8; tree.node_count()];
    for _ in 0..sites {
        for &(node, parent) in &order {
            state[node] = match parent {
                None => bases[rng.usize(..4)],
                Some(_) if rng.f64() < 0.2 => bases[rng.usize(..4)],
                Some(p) => state[p],
            };
        }
        for (leaf, row) in rows.iter_mut().enumerate() {
            row.push(state[leaf]);
        }
    }
    Alignment::new(names(taxa), rows).unwrap()
}

/// Small search settings so end-to-end runs finish quickly.
pub fn quick_config() -> Config {
    let mut config = Config::default();
    config.search.num_init_trees = 8;
    config.search.num_nni_trees = 4;
    config.search.num_support_trees = 4;
    config.search.pop_size = 3;
    config.stop.max_iterations = 12;
    config.stop.unsuccessful_iterations = 6;
    config.sync.sync_timeout_ms = 5_000;
    config
}

pub fn parsimony_context(alignment: &Alignment, config: Config) -> SearchContext {
    SearchContext::builder()
        .oracle(Arc::new(ParsimonyOracle::new(alignment, PartitionScheme::Single)))
        .names(alignment.names().to_vec())
        .config(config)
        .build()
}

pub fn context_with(oracle: Arc<dyn ScoringOracle>, taxa: usize, config: Config) -> SearchContext {
    SearchContext::builder()
        .oracle(oracle)
        .names(names(taxa))
        .config(config)
        .build()
}

pub fn tree(newick: &str, leaves: usize) -> Topology {
    Topology::from_newick(newick, leaves).unwrap()
}

/// Scores a tree by how many splits it shares with `target`. Above
/// `ceiling` the score collapses, so joint moves can undershoot their forecast.
pub struct TargetOracle {
    target: HashSet<Split>,
    ceiling: usize,
    weights: Vec<u32>,
}

impl TargetOracle {
    pub fn new(target: &Topology, ceiling: usize) -> Self {
        Self {
            target: target.splits().into_iter().collect(),
            ceiling,
            weights: vec![1],
        }
    }

    pub fn matches(&self, topo: &Topology) -> usize {
        topo.splits()
            .iter()
            .filter(|s| self.target.contains(*s))
            .count()
    }

    fn score(&self, topo: &Topology) -> f64 {
        let m = self.matches(topo);
        if m > self.ceiling {
            self.ceiling as f64 - 5.0
        } else {
            m as f64
        }
    }
}

impl ScoringOracle for TargetOracle {
    fn full_evaluate(&self, topo: &Topology) -> OracleResult<f64> {
        Ok(self.score(topo))
    }

    fn reoptimize(&self, topo: &mut Topology, _max_passes: usize) -> OracleResult<f64> {
        Ok(self.score(topo))
    }

    fn pattern_scores(&self, topo: &Topology) -> OracleResult<Vec<f64>> {
        Ok(vec![self.score(topo)])
    }

    fn pattern_weights(&self) -> &[u32] {
        &self.weights
    }

    fn assess_quartet(&self, _reps: [LeafId; 3], _inserted: LeafId, _rng: &mut fastrand::Rng) -> usize {
        0
    }
}

/// Every evaluation fails.
pub struct FailingOracle {
    weights: Vec<u32>,
}

impl Default for FailingOracle {
    fn default() -> Self {
        Self { weights: vec![1] }
    }
}

impl ScoringOracle for FailingOracle {
    fn full_evaluate(&self, _topo: &Topology) -> OracleResult<f64> {
        Err(OracleError::Failed("likelihood engine unavailable".into()))
    }

    fn reoptimize(&self, _topo: &mut Topology, _max_passes: usize) -> OracleResult<f64> {
        Err(OracleError::Failed("likelihood engine unavailable".into()))
    }

    fn pattern_scores(&self, _topo: &Topology) -> OracleResult<Vec<f64>> {
        Err(OracleError::Failed("likelihood engine unavailable".into()))
    }

    fn pattern_weights(&self) -> &[u32] {
        &self.weights
    }

    fn assess_quartet(&self, _reps: [LeafId; 3], _inserted: LeafId, _rng: &mut fastrand::Rng) -> usize {
        0
    }
}
