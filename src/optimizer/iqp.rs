use crate::oracle::ScoringOracle;
use crate::topology::{Branch, ConstraintTopology, LeafId, NodeId, Topology, TopologyResult};
use fnv::FnvHashMap;
use itertools::iproduct;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Self-tuning number of leaves the IQP perturbation removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IqpState {
    pub k_delete: usize,
    pub k_delete_stay: usize,
    pub k_delete_min: usize,
    pub k_delete_max: usize,
    pub leaf_count: usize,
}

/// Default share of leaves removed per perturbation, by data set size.
pub fn default_delete_fraction(leaf_count: usize) -> f64 {
    match leaf_count {
        0..=3 => 0.0,
        4 => 0.25,
        5 => 0.4,
        6..=50 => 0.5,
        51..=99 => 0.3,
        100..=199 => 0.2,
        200..=399 => 0.1,
        _ => 0.05,
    }
}

impl IqpState {
    /// `k_delete_min == 0` derives the starting count from the data set size.
    pub fn new(leaf_count: usize, k_delete_min: usize) -> Self {
        let k_max = (leaf_count / 2).max(1);
        let k_min = if k_delete_min > 0 {
            k_delete_min
        } else {
            (default_delete_fraction(leaf_count) * leaf_count as f64).ceil() as usize
        }
        .clamp(1, k_max);
        Self {
            k_delete: k_min,
            k_delete_stay: leaf_count.div_ceil(k_min),
            k_delete_min: k_min,
            k_delete_max: k_max,
            leaf_count,
        }
    }

    pub fn reset_k_delete(&mut self) {
        self.k_delete = self.k_delete_min;
        self.k_delete_stay = self.leaf_count.div_ceil(self.k_delete);
    }

    /// Called when a perturbation failed to leave the known topologies.
    pub fn increase_k_delete(&mut self) {
        if self.k_delete >= self.k_delete_max {
            return;
        }
        self.k_delete_stay = self.k_delete_stay.saturating_sub(1);
        if self.k_delete_stay > 0 {
            return;
        }
        self.k_delete += 1;
        self.k_delete_stay = self.leaf_count.div_ceil(self.k_delete);
        debug!("Increase k_delete to {}", self.k_delete);
    }
}

/// Deletes up to `k_delete` random leaves and reinserts each one where quartet
/// evidence places it. Returns the leaves that moved, in deletion order.
pub fn perturb(
    topo: &mut Topology,
    oracle: &dyn ScoringOracle,
    k_delete: usize,
    k_represent: usize,
    constraint: Option<&ConstraintTopology>,
    rng: &mut fastrand::Rng,
) -> TopologyResult<Vec<LeafId>> {
    let deleted = delete_leaves(topo, k_delete, rng)?;
    for &(leaf, original) in &deleted {
        reinsert_leaf(topo, oracle, leaf, original, k_represent, constraint, rng)?;
    }
    Ok(deleted.into_iter().map(|(leaf, _)| leaf).collect())
}

/// Removes `min(k, attached − 4)` distinct random leaves; returns each with
/// the branch its removal joined.
pub fn delete_leaves(
    topo: &mut Topology,
    k: usize,
    rng: &mut fastrand::Rng,
) -> TopologyResult<Vec<(LeafId, Branch)>> {
    let mut leaves: Vec<LeafId> = (0..topo.leaf_count())
        .filter(|&l| topo.is_attached(l))
        .collect();
    let count = k.min(leaves.len().saturating_sub(4));
    rng.shuffle(&mut leaves);
    leaves
        .into_iter()
        .take(count)
        .map(|leaf| topo.detach_leaf(leaf).map(|joined| (leaf, joined)))
        .collect()
}

/// Every attached branch with its insertion bonus for `leaf`.
pub fn insertion_scores(
    topo: &Topology,
    oracle: &dyn ScoringOracle,
    leaf: LeafId,
    k_represent: usize,
    rng: &mut fastrand::Rng,
) -> Vec<(Branch, f64)> {
    let mut reps: FnvHashMap<(NodeId, NodeId), Vec<(LeafId, usize)>> = FnvHashMap::default();
    let mut bonus: FnvHashMap<(NodeId, NodeId), f64> = FnvHashMap::default();

    for w in topo.internal_nodes() {
        let nbrs: Vec<NodeId> = topo.neighbors(w).collect();
        if nbrs.len() != 3 {
            continue;
        }
        let sets: Vec<Vec<(LeafId, usize)>> = nbrs
            .iter()
            .map(|&n| represent(topo, w, n, k_represent, rng, &mut reps))
            .collect();
        let mut counts = [0.0f64; 3];
        for (a, b, c) in iproduct!(&sets[0], &sets[1], &sets[2]) {
            counts[oracle.assess_quartet([a.0, b.0, c.0], leaf, rng)] += 1.0;
        }
        for (i, &n) in nbrs.iter().enumerate() {
            if counts[i] > 0.0 {
                *bonus.entry((w, n)).or_insert(0.0) += counts[i];
            }
        }
    }

    let mut partial: FnvHashMap<(NodeId, NodeId), f64> = FnvHashMap::default();
    topo.branches()
        .into_iter()
        .map(|b| {
            let score = partial_bonus(topo, b.a, b.b, &bonus, &mut partial)
                + partial_bonus(topo, b.b, b.a, &bonus, &mut partial);
            (b, score)
        })
        .collect()
}

fn reinsert_leaf(
    topo: &mut Topology,
    oracle: &dyn ScoringOracle,
    leaf: LeafId,
    original: Branch,
    k_represent: usize,
    constraint: Option<&ConstraintTopology>,
    rng: &mut fastrand::Rng,
) -> TopologyResult<()> {
    let mut scored = insertion_scores(topo, oracle, leaf, k_represent, rng);
    rng.shuffle(&mut scored);
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));

    let target = match constraint {
        None => scored.first().map(|(b, _)| *b),
        Some(c) => scored
            .iter()
            .map(|(b, _)| *b)
            .find(|&b| {
                let mut trial = topo.clone();
                trial.attach_leaf(leaf, b).is_ok() && c.is_compatible(&trial)
            })
            .or_else(|| {
                if topo.are_adjacent(original.a, original.b) {
                    Some(original)
                } else {
                    warn!(
                        "⚠️  No constraint-compatible slot for leaf {}, using best bonus",
                        leaf
                    );
                    scored.first().map(|(b, _)| *b)
                }
            }),
    };
    let target = target.unwrap_or(original);
    topo.attach_leaf(leaf, target)
}

/// Up to `k` leaves of the subtree at `to` (seen from `from`) closest to `to`,
/// with their heights. Ties between the two child sets are broken at random.
fn represent(
    topo: &Topology,
    from: NodeId,
    to: NodeId,
    k: usize,
    rng: &mut fastrand::Rng,
    memo: &mut FnvHashMap<(NodeId, NodeId), Vec<(LeafId, usize)>>,
) -> Vec<(LeafId, usize)> {
    if let Some(hit) = memo.get(&(from, to)) {
        return hit.clone();
    }
    let result = if topo.is_leaf(to) {
        vec![(to, 0)]
    } else {
        let children: Vec<NodeId> = topo.neighbors(to).filter(|&n| n != from).collect();
        let lists: Vec<Vec<(LeafId, usize)>> = children
            .iter()
            .map(|&c| represent(topo, to, c, k, rng, memo))
            .collect();
        merge_closest(&lists, k, rng)
    };
    memo.insert((from, to), result.clone());
    result
}

fn merge_closest(
    lists: &[Vec<(LeafId, usize)>],
    k: usize,
    rng: &mut fastrand::Rng,
) -> Vec<(LeafId, usize)> {
    let mut cursors = vec![0usize; lists.len()];
    let mut out = Vec::with_capacity(k);
    while out.len() < k {
        let heads: Vec<(usize, usize)> = lists
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.get(cursors[i]).map(|&(_, h)| (i, h)))
            .collect();
        let Some(min) = heads.iter().map(|&(_, h)| h).min() else {
            break;
        };
        let tied: Vec<usize> = heads
            .iter()
            .filter(|&&(_, h)| h == min)
            .map(|&(i, _)| i)
            .collect();
        let pick = tied[rng.usize(..tied.len())];
        let (leaf, height) = lists[pick][cursors[pick]];
        out.push((leaf, height + 1));
        cursors[pick] += 1;
    }
    out
}

fn partial_bonus(
    topo: &Topology,
    node: NodeId,
    dad: NodeId,
    bonus: &FnvHashMap<(NodeId, NodeId), f64>,
    memo: &mut FnvHashMap<(NodeId, NodeId), f64>,
) -> f64 {
    if let Some(&v) = memo.get(&(node, dad)) {
        return v;
    }
    let mut total = bonus.get(&(node, dad)).copied().unwrap_or(0.0);
    let children: Vec<NodeId> = topo.neighbors(node).filter(|&n| n != dad).collect();
    for c in children {
        total += partial_bonus(topo, c, node, bonus, memo);
    }
    memo.insert((node, dad), total);
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn k_delete_grows_after_stay_runs_out() {
        let mut state = IqpState::new(20, 2);
        assert_eq!(state.k_delete_stay, 10);
        for _ in 0..9 {
            state.increase_k_delete();
        }
        assert_eq!(state.k_delete, 2);
        state.increase_k_delete();
        assert_eq!(state.k_delete, 3);
        assert_eq!(state.k_delete_stay, 7);
        state.reset_k_delete();
        assert_eq!((state.k_delete, state.k_delete_stay), (2, 10));
    }

    #[test]
    fn k_delete_is_capped_at_half_the_leaves() {
        let mut state = IqpState::new(8, 3);
        for _ in 0..100 {
            state.increase_k_delete();
        }
        assert_eq!(state.k_delete, 4);
    }

    #[test]
    fn oversized_start_count_is_held_to_half_the_leaves() {
        let state = IqpState::new(9, 7);
        assert_eq!((state.k_delete_min, state.k_delete_max), (4, 4));
        assert_eq!(state.k_delete, 4);
    }

    #[test]
    fn merge_takes_closest_first() {
        let mut rng = fastrand::Rng::with_seed(5);
        let merged = merge_closest(&[vec![(1, 0)], vec![(2, 1), (3, 1)]], 2, &mut rng);
        assert_eq!(merged[0], (1, 1));
        assert_eq!(merged[1].1, 2);
    }
}
