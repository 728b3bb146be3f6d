use super::{local_lengths, OracleError, OracleResult, ScoringOracle};
use crate::alignment::Alignment;
use crate::consts::MIN_BRANCH_LENGTH;
use crate::topology::{Branch, LeafId, NniSwap, PartitionScheme, Topology};
use fnv::FnvHashMap;
use std::ops::Range;
use tracing::debug;

/// Fitch parsimony over compressed site patterns; score is minus the tree length.
#[derive(Debug, Clone)]
pub struct ParsimonyOracle {
    leaf_states: Vec<Vec<u32>>,
    weights: Vec<u32>,
    block_patterns: Vec<Range<usize>>,
    scheme: PartitionScheme,
    site_count: usize,
}

struct Fitch {
    costs: Vec<u32>,
    sets: Vec<Vec<u32>>,
    order: Vec<(usize, Option<usize>)>,
}

impl ParsimonyOracle {
    pub fn new(alignment: &Alignment, scheme: PartitionScheme) -> Self {
        let blocks: Vec<Range<usize>> = match &scheme {
            PartitionScheme::Single => vec![0..alignment.site_count()],
            PartitionScheme::Multi(parts) => parts.iter().map(|p| p.sites.clone()).collect(),
        };
        let taxa = alignment.taxon_count();
        let mut leaf_states: Vec<Vec<u32>> = vec![Vec::new(); taxa];
        let mut weights = Vec::new();
        let mut block_patterns = Vec::with_capacity(blocks.len());
        for block in &blocks {
            let first = weights.len();
            let mut index: FnvHashMap<Vec<u32>, usize> = FnvHashMap::default();
            for site in block.clone() {
                let column: Vec<u32> = (0..taxa).map(|t| alignment.state(t, site)).collect();
                match index.get(&column) {
                    Some(&p) => weights[p] += 1,
                    None => {
                        index.insert(column.clone(), weights.len());
                        weights.push(1);
                        for (t, &s) in column.iter().enumerate() {
                            leaf_states[t].push(s);
                        }
                    }
                }
            }
            block_patterns.push(first..weights.len());
        }
        debug!(
            "Compressed {} sites into {} patterns over {} block(s)",
            alignment.site_count(),
            weights.len(),
            block_patterns.len()
        );
        Self {
            leaf_states,
            weights,
            block_patterns,
            scheme,
            site_count: alignment.site_count(),
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.weights.len()
    }

    pub fn scheme(&self) -> &PartitionScheme {
        &self.scheme
    }

    /// Parsimony length of the attached tree.
    pub fn length(&self, topo: &Topology) -> OracleResult<u64> {
        let fitch = self.fitch(topo, 0..self.weights.len())?;
        Ok(self.weighted(&fitch.costs, 0..self.weights.len()))
    }

    fn weighted(&self, costs: &[u32], patterns: Range<usize>) -> u64 {
        costs
            .iter()
            .zip(&self.weights[patterns])
            .map(|(&c, &w)| c as u64 * w as u64)
            .sum()
    }

    /// Fitch down-pass over `patterns`, rooted at the lowest attached leaf.
    fn fitch(&self, topo: &Topology, patterns: Range<usize>) -> OracleResult<Fitch> {
        if topo.attached_count() < 3 {
            return Err(OracleError::IncompleteTopology {
                found: topo.attached_count(),
                expected: topo.leaf_count(),
            });
        }
        let width = patterns.len();
        let order = topo.preorder();
        let mut sets: Vec<Vec<u32>> = vec![Vec::new(); topo.node_count()];
        let mut costs = vec![0u32; width];
        for &(node, parent) in order.iter().rev() {
            if topo.is_leaf(node) {
                let own = &self.leaf_states[node][patterns.clone()];
                if parent.is_none() {
                    // Root leaf: close the tree against its single neighbour.
                    if let Some(child) = topo.neighbors(node).next() {
                        for (p, (&s, &c)) in own.iter().zip(&sets[child]).enumerate() {
                            if s & c == 0 {
                                costs[p] += 1;
                            }
                        }
                    }
                }
                sets[node] = own.to_vec();
                continue;
            }
            let mut acc: Option<Vec<u32>> = None;
            for child in topo.neighbors(node).filter(|&n| Some(n) != parent) {
                let child_set = &sets[child];
                acc = Some(match acc {
                    None => child_set.clone(),
                    Some(mut cur) => {
                        for (p, (a, &b)) in cur.iter_mut().zip(child_set).enumerate() {
                            if *a & b == 0 {
                                *a |= b;
                                costs[p] += 1;
                            } else {
                                *a &= b;
                            }
                        }
                        cur
                    }
                });
            }
            sets[node] = acc.unwrap_or_else(|| vec![u32::MAX; width]);
        }
        Ok(Fitch { costs, sets, order })
    }

    /// Up-pass state assignment; returns weighted changes per branch.
    fn branch_changes(&self, topo: &Topology, fitch: &Fitch) -> Vec<(Branch, u64)> {
        let width = self.weights.len();
        let mut states: Vec<Vec<u32>> = vec![Vec::new(); topo.node_count()];
        let mut out = Vec::new();
        for &(node, parent) in &fitch.order {
            match parent {
                None => {
                    let child = topo.neighbors(node).next();
                    states[node] = (0..width)
                        .map(|p| {
                            let own = fitch.sets[node][p];
                            let joint = child.map_or(own, |c| own & fitch.sets[c][p]);
                            lowest_bit(if joint != 0 { joint } else { own })
                        })
                        .collect();
                }
                Some(par) => {
                    let mut changes = 0u64;
                    let assigned: Vec<u32> = (0..width)
                        .map(|p| {
                            let up = states[par][p];
                            let own = fitch.sets[node][p];
                            if own & up != 0 {
                                up
                            } else {
                                changes += self.weights[p] as u64;
                                lowest_bit(own)
                            }
                        })
                        .collect();
                    states[node] = assigned;
                    out.push((Branch::new(node, par), changes));
                }
            }
        }
        out
    }

    fn assign_lengths(&self, topo: &mut Topology, fitch: &Fitch) -> OracleResult<()> {
        let sites = self.site_count.max(1) as f64;
        for (branch, changes) in self.branch_changes(topo, fitch) {
            let len = (changes as f64 / sites).max(MIN_BRANCH_LENGTH);
            topo.set_length(branch.a, branch.b, len)?;
        }
        Ok(())
    }
}

fn lowest_bit(set: u32) -> u32 {
    set & set.wrapping_neg()
}

impl ScoringOracle for ParsimonyOracle {
    fn full_evaluate(&self, topo: &Topology) -> OracleResult<f64> {
        Ok(-(self.length(topo)? as f64))
    }

    fn reoptimize(&self, topo: &mut Topology, max_passes: usize) -> OracleResult<f64> {
        let fitch = self.fitch(topo, 0..self.weights.len())?;
        if max_passes > 0 {
            self.assign_lengths(topo, &fitch)?;
        }
        Ok(-(self.weighted(&fitch.costs, 0..self.weights.len()) as f64))
    }

    fn pattern_scores(&self, topo: &Topology) -> OracleResult<Vec<f64>> {
        if !topo.is_complete() {
            return Err(OracleError::IncompleteTopology {
                found: topo.attached_count(),
                expected: topo.leaf_count(),
            });
        }
        let fitch = self.fitch(topo, 0..self.weights.len())?;
        Ok(fitch.costs.iter().map(|&c| -(c as f64)).collect())
    }

    fn pattern_weights(&self) -> &[u32] {
        &self.weights
    }

    fn assess_quartet(
        &self,
        representatives: [LeafId; 3],
        inserted: LeafId,
        rng: &mut fastrand::Rng,
    ) -> usize {
        let [a, b, c] = representatives;
        let mut support = [0u64; 3];
        for (p, &w) in self.weights.iter().enumerate() {
            let x = self.leaf_states[inserted][p];
            let sa = self.leaf_states[a][p];
            let sb = self.leaf_states[b][p];
            let sc = self.leaf_states[c][p];
            if [x, sa, sb, sc].iter().any(|s| s.count_ones() != 1) {
                continue;
            }
            let w = w as u64;
            if x == sa && sb == sc {
                support[0] += w;
            }
            if x == sb && sa == sc {
                support[1] += w;
            }
            if x == sc && sa == sb {
                support[2] += w;
            }
        }
        if support[0] == support[1] && support[0] == support[2] {
            return rng.usize(..3);
        }
        if support[0] > support[1] && support[0] > support[2] {
            0
        } else if support[1] < support[2] {
            2
        } else {
            1
        }
    }

    /// Multi-partition data re-scores only the partitions the branch informs.
    fn evaluate_rearrangement(
        &self,
        topo: &Topology,
        swap: &NniSwap,
    ) -> OracleResult<(f64, Vec<(Branch, f64)>)> {
        let PartitionScheme::Multi(parts) = &self.scheme else {
            let mut trial = topo.clone();
            trial.apply_swap(swap)?;
            let score = self.reoptimize(&mut trial, 1)?;
            return Ok((score, local_lengths(&trial, swap.branch())));
        };
        let branch = swap.branch();
        let mut trial = topo.clone();
        trial.apply_swap(swap)?;
        let mut length = 0u64;
        for (part, patterns) in parts.iter().zip(&self.block_patterns) {
            let source = if part.spans_branch(topo, branch) {
                &trial
            } else {
                topo
            };
            let fitch = self.fitch(source, patterns.clone())?;
            length += self.weighted(&fitch.costs, patterns.clone());
        }
        let full = self.fitch(&trial, 0..self.weights.len())?;
        self.assign_lengths(&mut trial, &full)?;
        Ok((-(length as f64), local_lengths(&trial, branch)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle() -> (ParsimonyOracle, Alignment) {
        let aln = Alignment::parse(
            ">0\nAAAAC\n>1\nAAAAC\n>2\nCCCCA\n>3\nCCCCA\n>4\nCCCGA\n",
        )
        .unwrap();
        (ParsimonyOracle::new(&aln, PartitionScheme::Single), aln)
    }

    #[test]
    fn patterns_are_compressed() {
        let (o, _) = oracle();
        assert_eq!(o.pattern_count(), 3);
        assert_eq!(o.pattern_weights().iter().sum::<u32>(), 5);
    }

    #[test]
    fn grouping_matching_taxa_is_shorter() {
        let (o, _) = oracle();
        let good = Topology::from_newick("(0,1,(2,(3,4)));", 5).unwrap();
        let bad = Topology::from_newick("(0,2,(1,(3,4)));", 5).unwrap();
        assert_eq!(o.length(&good).unwrap(), 6);
        assert!(o.full_evaluate(&good).unwrap() > o.full_evaluate(&bad).unwrap());
    }

    #[test]
    fn pattern_scores_sum_to_full_score() {
        let (o, _) = oracle();
        let t = Topology::from_newick("(0,2,(1,(3,4)));", 5).unwrap();
        let per = o.pattern_scores(&t).unwrap();
        let sum: f64 = per
            .iter()
            .zip(o.pattern_weights())
            .map(|(s, &w)| s * w as f64)
            .sum();
        assert_eq!(sum, o.full_evaluate(&t).unwrap());
    }

    #[test]
    fn quartet_prefers_identical_sequence() {
        let (o, _) = oracle();
        let mut rng = fastrand::Rng::with_seed(1);
        assert_eq!(o.assess_quartet([1, 2, 4], 0, &mut rng), 0);
        assert_eq!(o.assess_quartet([0, 2, 1], 4, &mut rng), 1);
    }
}
