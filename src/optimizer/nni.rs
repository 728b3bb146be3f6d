use crate::candidates::SplitOccurrenceMap;
use crate::config::Config;
use crate::consts::SPEED_NNI_RADIUS;
use crate::oracle::{OracleError, ScoringOracle};
use crate::topology::{Branch, ConstraintTopology, NniMove, Split, Topology};
use fnv::{FnvHashMap, FnvHashSet};
use rayon::prelude::*;
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Splits that may not be re-evaluated during the first NNI step after a perturbation.
pub type TabuSet = FnvHashSet<Split>;

/// Sees the current tree at the start of every NNI step.
pub trait TreeObserver {
    fn observe(&mut self, topo: &Topology, score: f64);
}

pub struct NoObserver;

impl TreeObserver for NoObserver {
    fn observe(&mut self, _topo: &Topology, _score: f64) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NniOutcome {
    pub steps: usize,
    pub applied: usize,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NniSettings {
    pub speed_nni: bool,
    pub loglh_epsilon: f64,
    pub max_rollbacks: usize,
    pub fix_stable_splits: bool,
    pub stable_threshold: f64,
}

impl NniSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            speed_nni: config.search.speed_nni,
            loglh_epsilon: config.search.loglh_epsilon,
            max_rollbacks: config.search.max_rollbacks,
            fix_stable_splits: config.perturb.fix_stable_splits,
            stable_threshold: config.perturb.stable_threshold,
        }
    }
}

impl Default for NniSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Best score first; `sort_by` keeps ties in insertion order.
pub fn compare_moves(a: &NniMove, b: &NniMove) -> Ordering {
    b.score.total_cmp(&a.score)
}

/// Greedily keeps every move that shares no endpoint with a move kept before it.
pub fn compatible_moves(moves: &[NniMove]) -> Vec<NniMove> {
    let mut kept: Vec<NniMove> = Vec::new();
    for m in moves {
        if kept.iter().all(|k| !k.conflicts_with(m)) {
            kept.push(m.clone());
        }
    }
    kept
}

/// Tabu splits are never evaluated; with stable-split fixing, a split seen in
/// more than `stable_threshold` of the candidates survives only a random draw.
pub fn is_eligible(
    split: &Split,
    tabu: &TabuSet,
    occurrences: Option<&SplitOccurrenceMap>,
    settings: &NniSettings,
    rng: &mut fastrand::Rng,
) -> bool {
    if tabu.contains(split) {
        return false;
    }
    match occurrences {
        Some(occ) if settings.fix_stable_splits => {
            occ.weight(split) <= settings.stable_threshold || rng.f64() > settings.stable_threshold
        }
        _ => true,
    }
}

pub struct MoveEngine<'a> {
    oracle: &'a dyn ScoringOracle,
    constraint: Option<&'a ConstraintTopology>,
    occurrences: Option<&'a SplitOccurrenceMap>,
    settings: NniSettings,
}

impl<'a> MoveEngine<'a> {
    pub fn new(oracle: &'a dyn ScoringOracle, settings: NniSettings) -> Self {
        Self {
            oracle,
            constraint: None,
            occurrences: None,
            settings,
        }
    }

    pub fn with_constraint(mut self, constraint: Option<&'a ConstraintTopology>) -> Self {
        self.constraint = constraint;
        self
    }

    pub fn with_occurrences(mut self, occurrences: Option<&'a SplitOccurrenceMap>) -> Self {
        self.occurrences = occurrences;
        self
    }

    /// Hill-climbs `topo` with batches of non-conflicting improving NNIs.
    pub fn optimize(
        &self,
        topo: &mut Topology,
        current_score: f64,
        tabu: Option<TabuSet>,
        rng: &mut fastrand::Rng,
        observer: &mut dyn TreeObserver,
    ) -> NniOutcome {
        let eps = self.settings.loglh_epsilon;
        let max_steps = topo.leaf_count();
        let mut tabu = tabu.unwrap_or_default();
        let speed_from = if tabu.is_empty() { 2 } else { 3 };
        let mut score = current_score;
        let mut steps = 0;
        let mut applied_total = 0;
        let mut rollbacks = 0;
        let mut last_applied: Vec<Branch> = Vec::new();

        loop {
            if steps >= max_steps {
                warn!(
                    "⚠️  NNI search reached the step cap ({}) at score {:.4}",
                    max_steps, score
                );
                break;
            }
            steps += 1;
            observer.observe(topo, score);

            let branches = if self.settings.speed_nni && steps >= speed_from && !last_applied.is_empty()
            {
                self.neighbourhood(topo, &last_applied)
            } else {
                topo.internal_branches()
            };
            if branches.is_empty() {
                break;
            }

            let splits: FnvHashMap<Branch, Split> = topo.branch_splits().into_iter().collect();
            let (eligible, fallback): (Vec<Branch>, Vec<Branch>) =
                branches.into_iter().partition(|b| {
                    splits.get(b).map_or(true, |s| {
                        is_eligible(s, &tabu, self.occurrences, &self.settings, rng)
                    })
                });
            tabu.clear();

            let mut positive = self.evaluate(topo, &eligible, score);
            if positive.is_empty() && !fallback.is_empty() && applied_total == 0 {
                debug!("No eligible improvement, evaluating {} held-back branches", fallback.len());
                positive = self.evaluate(topo, &fallback, score);
            }
            if positive.is_empty() {
                break;
            }
            positive.sort_by(compare_moves);
            let batch = compatible_moves(&positive);
            let best_score = batch[0].score;
            let snapshot = topo.clone();

            let batch_size = if rollbacks >= self.settings.max_rollbacks {
                1
            } else {
                batch.len()
            };
            let (mut applied, mut new_score) = match self.apply_batch(topo, &batch[..batch_size]) {
                Some(result) => result,
                None => {
                    *topo = snapshot;
                    break;
                }
            };

            if new_score < best_score - eps && applied.len() > 1 {
                rollbacks += 1;
                debug!(
                    "Batch of {} moves realised {:.4} < {:.4}, keeping only the best (rollback {})",
                    applied.len(),
                    new_score,
                    best_score,
                    rollbacks
                );
                *topo = snapshot.clone();
                match self.apply_batch(topo, &batch[..1]) {
                    Some((a, s)) => {
                        applied = a;
                        new_score = s;
                    }
                    None => {
                        *topo = snapshot;
                        break;
                    }
                }
            }
            if new_score < best_score - eps {
                warn!(
                    "⚠️  Best single NNI realised {:.4}, expected {:.4}; undoing step",
                    new_score, best_score
                );
                *topo = snapshot;
                break;
            }

            applied_total += applied.len();
            last_applied = applied;
            let gain = new_score - score;
            score = new_score;
            if gain < eps {
                break;
            }
        }

        NniOutcome {
            steps,
            applied: applied_total,
            score,
        }
    }

    fn neighbourhood(&self, topo: &Topology, around: &[Branch]) -> Vec<Branch> {
        let mut out: Vec<Branch> = Vec::new();
        for &b in around {
            if topo.is_internal_branch(b) && !out.contains(&b) {
                out.push(b);
            }
            for n in topo.surrounding_internal_branches(b, SPEED_NNI_RADIUS) {
                if !out.contains(&n) {
                    out.push(n);
                }
            }
        }
        out
    }

    fn evaluate(&self, topo: &Topology, branches: &[Branch], score: f64) -> Vec<NniMove> {
        branches
            .par_iter()
            .filter_map(|&branch| {
                match self
                    .oracle
                    .evaluate_best_rearrangement(topo, branch, self.constraint)
                {
                    Ok(m) if m.score > score => Some(m),
                    Ok(_) => None,
                    Err(OracleError::NoCompatibleRearrangement(_)) => None,
                    Err(e) => {
                        warn!("⚠️  Skipping branch {}: {}", branch, e);
                        None
                    }
                }
            })
            .collect()
    }

    /// Applies moves in order with their refitted lengths, then re-optimises.
    /// Returns the branches actually changed and the realised score, or `None`
    /// when the oracle fails.
    fn apply_batch(&self, topo: &mut Topology, moves: &[NniMove]) -> Option<(Vec<Branch>, f64)> {
        let mut applied = Vec::with_capacity(moves.len());
        for m in moves {
            if let Err(e) = topo.apply_swap(&m.swap) {
                debug!("Dropping stale move at {}: {}", m.swap.branch(), e);
                continue;
            }
            applied.push(m.swap.branch());
            for &(b, len) in &m.new_lengths {
                if topo.are_adjacent(b.a, b.b) {
                    let _ = topo.set_length(b.a, b.b, len);
                }
            }
        }
        match self.oracle.reoptimize(topo, 1) {
            Ok(score) => Some((applied, score)),
            Err(e) => {
                warn!("⚠️  Re-optimisation after NNI failed: {}", e);
                None
            }
        }
    }
}
