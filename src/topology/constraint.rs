use super::newick::{parse_newick, NewickNode};
use super::{LeafId, NniSwap, Split, Topology, TopologyError, TopologyResult};
use crate::error::{ForgeError, ForgeResult};
use fnv::{FnvHashMap, FnvHashSet};
use std::fs;
use std::path::Path;

/// A (possibly multifurcating, possibly partial) tree every search topology must display.
#[derive(Debug, Clone)]
pub struct ConstraintTopology {
    taxa: Split,
    splits: Vec<Split>,
}

impl ConstraintTopology {
    pub fn from_file<P: AsRef<Path>>(path: P, names: &[String]) -> ForgeResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            ForgeError::Config(format!(
                "Failed to read constraint tree '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_newick(&text, names)
            .map_err(|e| ForgeError::Config(format!("Malformed constraint tree: {}", e)))
    }

    pub fn from_newick(text: &str, names: &[String]) -> TopologyResult<Self> {
        let index: FnvHashMap<&str, LeafId> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        let root = parse_newick(text)?;
        let leaf_count = names.len();
        let mut taxa = Split::empty(leaf_count);
        for label in root.leaf_labels() {
            let id = index
                .get(label)
                .copied()
                .or_else(|| label.parse::<LeafId>().ok().filter(|&i| i < leaf_count))
                .ok_or_else(|| TopologyError::UnknownTaxon(label.to_string()))?;
            if taxa.contains(id) {
                return Err(TopologyError::DuplicateTaxon(label.to_string()));
            }
            taxa.insert(id);
        }

        let mut raw = Vec::new();
        collect_clusters(&root, &index, leaf_count, &mut raw, true);
        let mut seen = FnvHashSet::default();
        let splits = raw
            .into_iter()
            .filter(|s| !s.is_trivial_within(&taxa))
            .map(|s| s.canonical_within(&taxa))
            .filter(|s| seen.insert(s.clone()))
            .collect();
        Ok(Self { taxa, splits })
    }

    pub fn taxa(&self) -> &Split {
        &self.taxa
    }

    pub fn split_count(&self) -> usize {
        self.splits.len()
    }

    /// True iff every constraint split restricted to the attached leaves is
    /// displayed by `topo`.
    pub fn is_compatible(&self, topo: &Topology) -> bool {
        if self.splits.is_empty() {
            return true;
        }
        let mask = self.taxa.intersection(&topo.attached_mask());
        let displayed: FnvHashSet<Split> = topo
            .splits()
            .into_iter()
            .filter(|s| !s.is_trivial_within(&mask))
            .map(|s| s.canonical_within(&mask))
            .collect();
        self.splits
            .iter()
            .filter(|c| !c.is_trivial_within(&mask))
            .all(|c| displayed.contains(&c.canonical_within(&mask)))
    }

    pub fn allows_swap(&self, topo: &Topology, swap: &NniSwap) -> bool {
        if self.splits.is_empty() {
            return true;
        }
        let mut trial = topo.clone();
        trial.apply_swap(swap).is_ok() && self.is_compatible(&trial)
    }
}

/// Convenience for optional constraints: absent means everything is allowed.
pub fn satisfies(constraint: Option<&ConstraintTopology>, topo: &Topology) -> bool {
    constraint.map_or(true, |c| c.is_compatible(topo))
}

pub fn allows(constraint: Option<&ConstraintTopology>, topo: &Topology, swap: &NniSwap) -> bool {
    constraint.map_or(true, |c| c.allows_swap(topo, swap))
}

fn collect_clusters(
    node: &NewickNode,
    index: &FnvHashMap<&str, LeafId>,
    leaf_count: usize,
    out: &mut Vec<Split>,
    is_root: bool,
) -> Split {
    let mut cluster = Split::empty(leaf_count);
    if node.is_leaf() {
        if let Some(label) = &node.label {
            if let Some(id) = index
                .get(label.as_str())
                .copied()
                .or_else(|| label.parse::<LeafId>().ok().filter(|&i| i < leaf_count))
            {
                cluster.insert(id);
            }
        }
        return cluster;
    }
    for child in &node.children {
        let sub = collect_clusters(child, index, leaf_count, out, false);
        cluster.union_with(&sub);
    }
    if !is_root {
        out.push(cluster.clone());
    }
    cluster
}
