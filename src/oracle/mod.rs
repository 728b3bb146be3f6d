pub mod parsimony;

pub use parsimony::ParsimonyOracle;

use crate::topology::constraint::allows;
use crate::topology::{
    Branch, ConstraintTopology, LeafId, NniMove, NniSwap, Topology, TopologyError,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    #[error("branch {0} is not an internal branch")]
    NotInternal(Branch),

    #[error("no rearrangement at branch {0} satisfies the constraint")]
    NoCompatibleRearrangement(Branch),

    #[error("topology covers {found} of {expected} taxa")]
    IncompleteTopology { found: usize, expected: usize },

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("scoring failed: {0}")]
    Failed(String),
}

pub type OracleResult<T> = Result<T, OracleError>;

/// Scores topologies. Higher is better.
pub trait ScoringOracle: Send + Sync {
    fn full_evaluate(&self, topo: &Topology) -> OracleResult<f64>;

    /// Re-fits branch lengths in place and returns the resulting score.
    fn reoptimize(&self, topo: &mut Topology, max_passes: usize) -> OracleResult<f64>;

    /// Per-pattern scores; `Σ weight × score` equals the full score.
    fn pattern_scores(&self, topo: &Topology) -> OracleResult<Vec<f64>>;

    fn pattern_weights(&self) -> &[u32];

    /// Which of the three subtrees (by representative leaf) `inserted` groups with.
    fn assess_quartet(
        &self,
        representatives: [LeafId; 3],
        inserted: LeafId,
        rng: &mut fastrand::Rng,
    ) -> usize;

    /// Score of `topo` after one interchange, with the refitted lengths of
    /// the branches around it.
    fn evaluate_rearrangement(
        &self,
        topo: &Topology,
        swap: &NniSwap,
    ) -> OracleResult<(f64, Vec<(Branch, f64)>)> {
        let mut trial = topo.clone();
        trial.apply_swap(swap)?;
        let score = self.reoptimize(&mut trial, 1)?;
        Ok((score, local_lengths(&trial, swap.branch())))
    }

    /// Tries both interchanges at `branch` and returns the better allowed one.
    fn evaluate_best_rearrangement(
        &self,
        topo: &Topology,
        branch: Branch,
        constraint: Option<&ConstraintTopology>,
    ) -> OracleResult<NniMove> {
        let swaps = topo.nni_swaps(branch).map_err(|e| match e {
            TopologyError::NotInternal(b) => OracleError::NotInternal(b),
            other => OracleError::Topology(other),
        })?;
        let mut best: Option<NniMove> = None;
        for (rearrangement, swap) in swaps.iter().enumerate() {
            if !allows(constraint, topo, swap) {
                continue;
            }
            let (score, new_lengths) = self.evaluate_rearrangement(topo, swap)?;
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(NniMove {
                    swap: *swap,
                    rearrangement,
                    score,
                    new_lengths,
                });
            }
        }
        best.ok_or(OracleError::NoCompatibleRearrangement(branch))
    }
}

/// Lengths of a branch and the four branches touching it.
pub fn local_lengths(topo: &Topology, branch: Branch) -> Vec<(Branch, f64)> {
    let mut out = Vec::with_capacity(5);
    if let Some(len) = topo.length(branch.a, branch.b) {
        out.push((branch, len));
    }
    for end in [branch.a, branch.b] {
        for n in topo.neighbors(end) {
            let b = Branch::new(end, n);
            if b != branch {
                if let Some(len) = topo.length(end, n) {
                    out.push((b, len));
                }
            }
        }
    }
    out
}
