use super::nni::{compatible_moves, is_eligible, NniSettings, TabuSet};
use crate::candidates::SplitOccurrenceMap;
use crate::topology::constraint::allows;
use crate::topology::{ConstraintTopology, NniMove, Split, Topology};
use clap::ValueEnum;
use fnv::FnvHashSet;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tracing::debug;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ValueEnum,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PerturbationKind {
    RandomNni,
    StableSplits,
    Iqp,
}

/// Random NNIs on distinct branches. Returns the splits created, which the
/// next NNI search must leave alone for one step.
pub fn random_nni(
    topo: &mut Topology,
    strength: f64,
    tabu_enabled: bool,
    occurrences: Option<&SplitOccurrenceMap>,
    settings: &NniSettings,
    constraint: Option<&ConstraintTopology>,
    rng: &mut fastrand::Rng,
) -> TabuSet {
    let internal = topo.internal_branches();
    let rounds = if tabu_enabled {
        internal
            .iter()
            .filter(|&&b| {
                occurrences.map_or(true, |occ| {
                    occ.weight(&topo.split_of(b)) < settings.stable_threshold
                })
            })
            .count()
    } else {
        (internal.len() as f64 * strength).floor() as usize
    };

    let mut tabu = TabuSet::default();
    let mut applied = 0;
    for _ in 0..rounds {
        let candidates: Vec<_> = topo
            .branch_splits()
            .into_iter()
            .filter(|(_, split)| is_eligible(split, &tabu, occurrences, settings, rng))
            .map(|(b, _)| b)
            .collect();
        if candidates.is_empty() {
            break;
        }
        let branch = candidates[rng.usize(..candidates.len())];
        let Ok(swap) = topo.random_nni(branch, rng) else {
            continue;
        };
        if !allows(constraint, topo, &swap) {
            continue;
        }
        if topo.apply_swap(&swap).is_ok() {
            applied += 1;
            tabu.insert(topo.split_of(branch));
        }
    }
    debug!("Random NNI perturbation: {} of {} moves applied", applied, rounds);
    if tabu_enabled {
        tabu
    } else {
        TabuSet::default()
    }
}

/// Shakes every stable branch with one random, constraint-compatible NNI per
/// round until none is left or a round changes nothing.
pub fn perturb_stable_splits(
    topo: &mut Topology,
    occurrences: &SplitOccurrenceMap,
    stable_threshold: f64,
    constraint: Option<&ConstraintTopology>,
    rng: &mut fastrand::Rng,
) -> usize {
    let mut produced: FnvHashSet<Split> = FnvHashSet::default();
    let mut total = 0;
    for _ in 0..topo.leaf_count() {
        let stable: Vec<_> = topo
            .branch_splits()
            .into_iter()
            .filter(|(_, s)| occurrences.weight(s) >= stable_threshold && !produced.contains(s))
            .map(|(b, _)| b)
            .collect();
        if stable.is_empty() {
            break;
        }
        let mut moves = Vec::with_capacity(stable.len());
        for branch in stable {
            let Ok(swaps) = topo.nni_swaps(branch) else {
                continue;
            };
            let first = rng.usize(..2);
            let pick = [swaps[first], swaps[1 - first]]
                .into_iter()
                .enumerate()
                .find(|(_, s)| allows(constraint, topo, s));
            if let Some((rearrangement, swap)) = pick {
                moves.push(NniMove {
                    swap,
                    rearrangement,
                    score: 0.0,
                    new_lengths: Vec::new(),
                });
            }
        }
        let mut applied = 0;
        for m in compatible_moves(&moves) {
            if !allows(constraint, topo, &m.swap) {
                continue;
            }
            if topo.apply_swap(&m.swap).is_ok() {
                applied += 1;
                produced.insert(topo.split_of(m.swap.branch()));
            }
        }
        if applied == 0 {
            break;
        }
        total += applied;
    }
    debug!("Stable-split perturbation applied {} moves", total);
    total
}
