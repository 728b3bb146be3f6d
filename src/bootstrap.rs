//! Ultrafast-bootstrap bookkeeping: resampled pattern weights, the best tree
//! per replicate under RELL scoring, and split-support snapshots used by the
//! correlation stopping rule.

use crate::consts::WORST_SCORE;
use crate::candidates::parse_candidate;
use crate::optimizer::nni::TreeObserver;
use crate::oracle::ScoringOracle;
use crate::topology::{Branch, Split, Topology};
use fnv::FnvHashMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Range;
use tracing::{debug, warn};

/// Per-replicate pattern weights drawn by multinomial resampling.
#[derive(Debug, Clone)]
pub struct BootstrapSamples {
    weights: Vec<Vec<u32>>,
}

impl BootstrapSamples {
    pub fn generate(pattern_weights: &[u32], replicates: usize, seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let site_to_pattern: Vec<usize> = pattern_weights
            .iter()
            .enumerate()
            .flat_map(|(p, &w)| std::iter::repeat(p).take(w as usize))
            .collect();
        let weights = (0..replicates)
            .map(|_| {
                let mut sample = vec![0u32; pattern_weights.len()];
                if !site_to_pattern.is_empty() {
                    for _ in 0..site_to_pattern.len() {
                        sample[site_to_pattern[rng.usize(..site_to_pattern.len())]] += 1;
                    }
                }
                sample
            })
            .collect();
        Self { weights }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn weights(&self, replicate: usize) -> &[u32] {
        &self.weights[replicate]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateBest {
    pub count: u32,
    pub best_score: f64,
    pub orig_score: f64,
    pub tree: String,
}

impl Default for ReplicateBest {
    fn default() -> Self {
        Self {
            count: 0,
            best_score: WORST_SCORE,
            orig_score: WORST_SCORE,
            tree: String::new(),
        }
    }
}

impl ReplicateBest {
    pub fn is_filled(&self) -> bool {
        !self.tree.is_empty()
    }
}

/// A contiguous block of replicate results, shipped between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateSlice {
    pub start: usize,
    pub entries: Vec<ReplicateBest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSupportSnapshot {
    pub iteration: usize,
    pub supports: Vec<(Split, u32)>,
}

#[derive(Debug, Clone, Default)]
pub struct SplitSupportHistory {
    snapshots: VecDeque<SplitSupportSnapshot>,
    cap: usize,
}

impl SplitSupportHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            snapshots: VecDeque::new(),
            cap: cap.max(2),
        }
    }

    pub fn push(&mut self, snapshot: SplitSupportSnapshot) {
        if self.snapshots.len() == self.cap {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(snapshot);
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &SplitSupportSnapshot> {
        self.snapshots.iter()
    }

    /// Correlation between the latest snapshot and the one halfway back.
    pub fn correlation(&self) -> f64 {
        if self.snapshots.len() < 2 {
            return 0.0;
        }
        let half = &self.snapshots[(self.snapshots.len() - 1) / 2];
        let Some(latest) = self.snapshots.back() else {
            return 0.0;
        };
        let a: FnvHashMap<&Split, u32> = half.supports.iter().map(|(s, c)| (s, *c)).collect();
        let b: FnvHashMap<&Split, u32> = latest.supports.iter().map(|(s, c)| (s, *c)).collect();
        let mut keys: Vec<&Split> = a.keys().chain(b.keys()).copied().collect();
        keys.sort();
        keys.dedup();
        let x: Vec<f64> = keys.iter().map(|k| *a.get(k).unwrap_or(&0) as f64).collect();
        let y: Vec<f64> = keys.iter().map(|k| *b.get(k).unwrap_or(&0) as f64).collect();
        correlation(&x, &y)
    }
}

/// Cosine of the mean-normalised vectors; 1.0 when either has no variance.
pub fn correlation(x: &[f64], y: &[f64]) -> f64 {
    fn normalise(v: &[f64]) -> Vec<f64> {
        let mean = v.iter().sum::<f64>() / v.len().max(1) as f64;
        if mean == 0.0 {
            return vec![0.0; v.len()];
        }
        v.iter().map(|e| e / mean - 1.0).collect()
    }
    let nx = normalise(x);
    let ny = normalise(y);
    let norm_x = nx.iter().map(|e| e * e).sum::<f64>().sqrt();
    let norm_y = ny.iter().map(|e| e * e).sum::<f64>().sqrt();
    if norm_x == 0.0 || norm_y == 0.0 {
        return 1.0;
    }
    let dot: f64 = nx.iter().zip(&ny).map(|(a, b)| a * b).sum();
    dot / (norm_x * norm_y)
}

/// Checkpointed part of the bootstrap state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapState {
    pub logl_cutoff: Option<f64>,
    pub replicates: Vec<ReplicateBest>,
    pub snapshots: Vec<SplitSupportSnapshot>,
}

#[derive(Debug, Clone)]
pub struct BootstrapAccumulator {
    samples: BootstrapSamples,
    leaf_count: usize,
    replicates: Vec<ReplicateBest>,
    range: Range<usize>,
    epsilon: f64,
    logl_cutoff: Option<f64>,
    history: SplitSupportHistory,
}

impl BootstrapAccumulator {
    /// `range` is the block of replicates this process updates itself.
    pub fn new(
        samples: BootstrapSamples,
        leaf_count: usize,
        range: Range<usize>,
        epsilon: f64,
        max_snapshots: usize,
    ) -> Self {
        let total = samples.len();
        let range = range.start.min(total)..range.end.min(total);
        Self {
            samples,
            leaf_count,
            replicates: vec![ReplicateBest::default(); total],
            range,
            epsilon,
            logl_cutoff: None,
            history: SplitSupportHistory::new(max_snapshots),
        }
    }

    /// Even split of `total` replicates over `nprocs` ranks.
    pub fn owned_range(total: usize, rank: usize, nprocs: usize) -> Range<usize> {
        let nprocs = nprocs.max(1);
        let per = total.div_ceil(nprocs);
        let start = (rank * per).min(total);
        start..(start + per).min(total)
    }

    pub fn len(&self) -> usize {
        self.replicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicates.is_empty()
    }

    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    pub fn replicates(&self) -> &[ReplicateBest] {
        &self.replicates
    }

    pub fn logl_cutoff(&self) -> Option<f64> {
        self.logl_cutoff
    }

    pub fn set_logl_cutoff(&mut self, cutoff: Option<f64>) {
        self.logl_cutoff = cutoff;
    }

    pub fn history(&self) -> &SplitSupportHistory {
        &self.history
    }

    /// Offers one tree to every owned replicate. Returns how many replicates took it.
    pub fn observe(
        &mut self,
        tree: &str,
        pattern_scores: &[f64],
        orig_score: f64,
        rng: &mut fastrand::Rng,
    ) -> usize {
        if let Some(cutoff) = self.logl_cutoff {
            if orig_score < cutoff - 1.0 {
                return 0;
            }
        }
        let rand = rng.f64();
        let eps = self.epsilon;
        let range = self.range.clone();
        let samples = &self.samples;
        self.replicates[range.clone()]
            .par_iter_mut()
            .enumerate()
            .map(|(i, rep)| {
                let weights = samples.weights(range.start + i);
                let rell: f64 = weights
                    .iter()
                    .zip(pattern_scores)
                    .map(|(&w, &s)| w as f64 * s)
                    .sum();
                let mut better = rell > rep.best_score + eps;
                if !better && rell > rep.best_score - eps {
                    better = rand <= 1.0 / (rep.count as f64 + 1.0);
                }
                if !better {
                    return 0;
                }
                rep.count = if rell <= rep.best_score + eps {
                    rep.count + 1
                } else {
                    1
                };
                rep.best_score = rep.best_score.max(rell);
                rep.orig_score = orig_score;
                if rep.tree != tree {
                    rep.tree = tree.to_string();
                }
                1
            })
            .sum()
    }

    /// Lowest original-data score among the owned replicates, once all are filled.
    pub fn update_logl_cutoff(&mut self) -> Option<f64> {
        let owned = &self.replicates[self.range.clone()];
        if owned.is_empty() || owned.iter().any(|r| !r.is_filled()) {
            return self.logl_cutoff;
        }
        self.logl_cutoff = owned
            .iter()
            .map(|r| r.orig_score)
            .min_by(|a, b| a.total_cmp(b));
        self.logl_cutoff
    }

    pub fn slice(&self, range: Range<usize>) -> ReplicateSlice {
        let range = range.start.min(self.len())..range.end.min(self.len());
        ReplicateSlice {
            start: range.start,
            entries: self.replicates[range].to_vec(),
        }
    }

    pub fn owned_slice(&self) -> ReplicateSlice {
        self.slice(self.range.clone())
    }

    /// Copies a peer's replicate block in. Slices that fall outside the
    /// replicate range or carry a tree over other taxa are dropped whole.
    pub fn absorb(&mut self, slice: &ReplicateSlice) {
        let end = match slice.start.checked_add(slice.entries.len()) {
            Some(end) if end <= self.len() => end,
            _ => {
                warn!(
                    "⚠️  Ignoring replicate slice of {} at {} beyond {} replicates",
                    slice.entries.len(),
                    slice.start,
                    self.len()
                );
                return;
            }
        };
        if slice
            .entries
            .iter()
            .any(|e| e.is_filled() && parse_candidate(&e.tree, self.leaf_count).is_none())
        {
            warn!("⚠️  Ignoring replicate slice with a malformed tree");
            return;
        }
        self.replicates[slice.start..end].clone_from_slice(&slice.entries);
    }

    fn replicate_splits(&self) -> (usize, FnvHashMap<Split, u32>) {
        let mut parsed: FnvHashMap<&str, Vec<Split>> = FnvHashMap::default();
        let mut counts: FnvHashMap<Split, u32> = FnvHashMap::default();
        let mut filled = 0;
        for rep in self.replicates.iter().filter(|r| r.is_filled()) {
            let splits = parsed.entry(rep.tree.as_str()).or_insert_with(|| {
                parse_candidate(&rep.tree, self.leaf_count)
                    .map(|t| t.splits())
                    .unwrap_or_default()
            });
            filled += 1;
            for s in splits.iter() {
                *counts.entry(s.clone()).or_insert(0) += 1;
            }
        }
        (filled, counts)
    }

    /// Support counts of every non-trivial split over the replicate trees.
    pub fn summarize(&self, iteration: usize) -> SplitSupportSnapshot {
        let (_, counts) = self.replicate_splits();
        let mut supports: Vec<(Split, u32)> = counts.into_iter().collect();
        supports.sort();
        SplitSupportSnapshot {
            iteration,
            supports,
        }
    }

    pub fn take_snapshot(&mut self, iteration: usize) {
        let snapshot = self.summarize(iteration);
        debug!(
            "Split-support snapshot at iteration {}: {} splits",
            iteration,
            snapshot.supports.len()
        );
        self.history.push(snapshot);
    }

    pub fn correlation(&self) -> f64 {
        self.history.correlation()
    }

    /// Percentage support for each internal branch of `topo`.
    pub fn support_for(&self, topo: &Topology) -> FnvHashMap<Branch, f64> {
        let (filled, counts) = self.replicate_splits();
        topo.branch_splits()
            .into_iter()
            .map(|(branch, split)| {
                let split = split.canonical_within(&topo.attached_mask());
                let support = if filled == 0 {
                    0.0
                } else {
                    100.0 * *counts.get(&split).unwrap_or(&0) as f64 / filled as f64
                };
                (branch, support)
            })
            .collect()
    }

    pub fn state(&self) -> BootstrapState {
        BootstrapState {
            logl_cutoff: self.logl_cutoff,
            replicates: self.replicates.clone(),
            snapshots: self.history.snapshots().cloned().collect(),
        }
    }

    pub fn restore(&mut self, state: BootstrapState) {
        if state.replicates.len() == self.replicates.len() {
            self.replicates = state.replicates;
        } else {
            warn!(
                "⚠️  Checkpoint holds {} replicates, expected {}; starting bootstrap afresh",
                state.replicates.len(),
                self.replicates.len()
            );
        }
        self.logl_cutoff = state.logl_cutoff;
        for snapshot in state.snapshots {
            self.history.push(snapshot);
        }
    }
}

/// Feeds every tree the NNI search visits into the bootstrap replicates.
pub struct RellObserver<'a> {
    pub accumulator: &'a mut BootstrapAccumulator,
    pub oracle: &'a dyn ScoringOracle,
    pub rng: &'a mut fastrand::Rng,
}

impl TreeObserver for RellObserver<'_> {
    fn observe(&mut self, topo: &Topology, score: f64) {
        match self.oracle.pattern_scores(topo) {
            Ok(scores) => {
                self.accumulator
                    .observe(&topo.topology_string(), &scores, score, self.rng);
            }
            Err(e) => warn!("⚠️  Skipping bootstrap update: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resampling_preserves_site_count() {
        let samples = BootstrapSamples::generate(&[3, 1, 6], 10, 42);
        for r in 0..samples.len() {
            assert_eq!(samples.weights(r).iter().sum::<u32>(), 10);
        }
    }

    #[test]
    fn owned_ranges_cover_everything_once() {
        let ranges: Vec<_> = (0..3)
            .map(|r| BootstrapAccumulator::owned_range(10, r, 3))
            .collect();
        assert_eq!(ranges, vec![0..4, 4..8, 8..10]);
    }
}
