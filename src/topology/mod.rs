pub mod constraint;
pub mod newick;
pub mod partition;
pub mod split;

pub use constraint::ConstraintTopology;
pub use partition::{Capability, Partition, PartitionScheme};
pub use split::{LeafId, Split};

use crate::consts::DEFAULT_BRANCH_LENGTH;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type NodeId = usize;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TopologyError {
    #[error("nodes {0} and {1} are not adjacent")]
    NotAdjacent(NodeId, NodeId),

    #[error("branch {0} is not an internal branch")]
    NotInternal(Branch),

    #[error("leaf {0} is not attached to the tree")]
    LeafDetached(LeafId),

    #[error("leaf {0} is already attached to the tree")]
    LeafAttached(LeafId),

    #[error("a tree needs at least {min} leaves, got {got}")]
    TooFewLeaves { min: usize, got: usize },

    #[error("Newick syntax: {0}")]
    Newick(String),

    #[error("unknown taxon '{0}'")]
    UnknownTaxon(String),

    #[error("taxon '{0}' appears more than once")]
    DuplicateTaxon(String),

    #[error("tree covers {found} of {expected} taxa")]
    Incomplete { found: usize, expected: usize },

    #[error("tree is not bifurcating")]
    NotBifurcating,
}

pub type TopologyResult<T> = Result<T, TopologyError>;

/// An undirected branch, stored with `a < b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Branch {
    pub a: NodeId,
    pub b: NodeId,
}

impl Branch {
    pub fn new(x: NodeId, y: NodeId) -> Self {
        Self {
            a: x.min(y),
            b: x.max(y),
        }
    }

    pub fn touches(&self, node: NodeId) -> bool {
        self.a == node || self.b == node
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.a, self.b)
    }
}

/// One nearest-neighbour interchange across the branch `node1 - node2`:
/// the subtree `swap1` (hanging off `node1`) trades places with `swap2`
/// (hanging off `node2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NniSwap {
    pub node1: NodeId,
    pub node2: NodeId,
    pub swap1: NodeId,
    pub swap2: NodeId,
}

impl NniSwap {
    pub fn branch(&self) -> Branch {
        Branch::new(self.node1, self.node2)
    }

    pub fn inverse(&self) -> Self {
        Self {
            swap1: self.swap2,
            swap2: self.swap1,
            ..*self
        }
    }
}

/// A scored rearrangement proposal for one branch.
#[derive(Debug, Clone, PartialEq)]
pub struct NniMove {
    pub swap: NniSwap,
    /// Which of the two interchanges at the branch (0 or 1).
    pub rearrangement: usize,
    pub score: f64,
    pub new_lengths: Vec<(Branch, f64)>,
}

impl NniMove {
    pub fn node1(&self) -> NodeId {
        self.swap.node1
    }

    pub fn node2(&self) -> NodeId {
        self.swap.node2
    }

    /// Moves conflict when they share an endpoint of their central branch.
    pub fn conflicts_with(&self, other: &NniMove) -> bool {
        self.node1() == other.node1()
            || self.node1() == other.node2()
            || self.node2() == other.node1()
            || self.node2() == other.node2()
    }
}

#[derive(Debug, Clone, Default)]
struct Node {
    adj: Vec<(NodeId, f64)>,
}

/// Unrooted bifurcating tree stored as an arena.
///
/// Leaves occupy ids `0..leaf_count`, internal nodes follow. Every leaf owns one
/// internal node it is attached through, so a detached leaf keeps a stub
/// `leaf - stub` pair and node ids never change while leaves come and go.
#[derive(Debug, Clone)]
pub struct Topology {
    leaf_count: usize,
    nodes: Vec<Node>,
    attached: Vec<bool>,
}

impl Topology {
    /// Builds a three-leaf star; every other leaf starts detached.
    pub fn star(leaf_count: usize, first: [LeafId; 3]) -> TopologyResult<Self> {
        if leaf_count < 3 {
            return Err(TopologyError::TooFewLeaves {
                min: 3,
                got: leaf_count,
            });
        }
        let mut topo = Self::with_leaves(leaf_count);
        let center = leaf_count;
        let mut next_internal = center + 1;
        for leaf in 0..leaf_count {
            if first.contains(&leaf) {
                topo.connect(center, leaf, DEFAULT_BRANCH_LENGTH);
                topo.attached[leaf] = true;
            } else {
                topo.connect(next_internal, leaf, DEFAULT_BRANCH_LENGTH);
                next_internal += 1;
            }
        }
        Ok(topo)
    }

    /// Random topology by inserting leaves in random order on random branches.
    pub fn random(leaf_count: usize, rng: &mut fastrand::Rng) -> TopologyResult<Self> {
        let mut order: Vec<LeafId> = (0..leaf_count).collect();
        rng.shuffle(&mut order);
        if order.len() < 3 {
            return Err(TopologyError::TooFewLeaves {
                min: 3,
                got: leaf_count,
            });
        }
        let mut topo = Self::star(leaf_count, [order[0], order[1], order[2]])?;
        for &leaf in &order[3..] {
            let branches = topo.branches();
            let target = branches[rng.usize(..branches.len())];
            topo.attach_leaf(leaf, target)?;
        }
        Ok(topo)
    }

    pub(crate) fn with_leaves(leaf_count: usize) -> Self {
        let node_total = if leaf_count >= 3 {
            2 * leaf_count - 2
        } else {
            leaf_count
        };
        Self {
            leaf_count,
            nodes: vec![Node::default(); node_total],
            attached: vec![false; leaf_count],
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_leaf(&self, node: NodeId) -> bool {
        node < self.leaf_count
    }

    pub fn is_attached(&self, leaf: LeafId) -> bool {
        self.attached.get(leaf).copied().unwrap_or(false)
    }

    pub fn attached_count(&self) -> usize {
        self.attached.iter().filter(|&&a| a).count()
    }

    pub fn is_complete(&self) -> bool {
        self.attached.iter().all(|&a| a)
    }

    pub fn attached_mask(&self) -> Split {
        Split::from_leaves(
            self.leaf_count,
            (0..self.leaf_count).filter(|&l| self.attached[l]),
        )
    }

    /// Lowest attached leaf; all traversals and canonical strings start here.
    pub fn root(&self) -> Option<LeafId> {
        self.attached.iter().position(|&a| a)
    }

    pub fn neighbors(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[node].adj.iter().map(|&(n, _)| n)
    }

    pub fn degree(&self, node: NodeId) -> usize {
        self.nodes[node].adj.len()
    }

    pub fn are_adjacent(&self, x: NodeId, y: NodeId) -> bool {
        self.nodes
            .get(x)
            .is_some_and(|n| n.adj.iter().any(|&(m, _)| m == y))
    }

    pub fn length(&self, x: NodeId, y: NodeId) -> Option<f64> {
        self.nodes
            .get(x)?
            .adj
            .iter()
            .find(|&&(m, _)| m == y)
            .map(|&(_, len)| len)
    }

    pub fn set_length(&mut self, x: NodeId, y: NodeId, len: f64) -> TopologyResult<()> {
        if !self.are_adjacent(x, y) {
            return Err(TopologyError::NotAdjacent(x, y));
        }
        for (a, b) in [(x, y), (y, x)] {
            if let Some(slot) = self.nodes[a].adj.iter_mut().find(|(m, _)| *m == b) {
                slot.1 = len;
            }
        }
        Ok(())
    }

    pub fn is_internal_branch(&self, branch: Branch) -> bool {
        !self.is_leaf(branch.a)
            && !self.is_leaf(branch.b)
            && self.degree(branch.a) == 3
            && self.degree(branch.b) == 3
            && self.are_adjacent(branch.a, branch.b)
    }

    /// Nodes of the attached tree in pre-order from the root, with their parents.
    pub fn preorder(&self) -> Vec<(NodeId, Option<NodeId>)> {
        let Some(root) = self.root() else {
            return Vec::new();
        };
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(root, None)];
        while let Some((node, parent)) = stack.pop() {
            order.push((node, parent));
            for &(next, _) in self.nodes[node].adj.iter().rev() {
                if Some(next) != parent {
                    stack.push((next, Some(node)));
                }
            }
        }
        order
    }

    pub fn branches(&self) -> Vec<Branch> {
        self.preorder()
            .into_iter()
            .filter_map(|(node, parent)| parent.map(|p| Branch::new(node, p)))
            .collect()
    }

    /// Branches with an internal node at both ends.
    pub fn internal_branches(&self) -> Vec<Branch> {
        self.branches()
            .into_iter()
            .filter(|b| !self.is_leaf(b.a) && !self.is_leaf(b.b))
            .collect()
    }

    pub fn internal_nodes(&self) -> Vec<NodeId> {
        self.preorder()
            .into_iter()
            .map(|(node, _)| node)
            .filter(|&node| !self.is_leaf(node))
            .collect()
    }

    /// Leaves reachable from `to` without crossing back over `from`.
    pub fn subtree_leaves(&self, from: NodeId, to: NodeId) -> Split {
        let mut leaves = Split::empty(self.leaf_count);
        let mut stack = vec![(to, from)];
        while let Some((node, parent)) = stack.pop() {
            if self.is_leaf(node) {
                leaves.insert(node);
            }
            for &(next, _) in &self.nodes[node].adj {
                if next != parent {
                    stack.push((next, node));
                }
            }
        }
        leaves
    }

    pub fn split_of(&self, branch: Branch) -> Split {
        self.subtree_leaves(branch.a, branch.b)
            .canonical_within(&self.attached_mask())
    }

    /// Canonical split of every internal branch, computed in one post-order pass.
    pub fn branch_splits(&self) -> Vec<(Branch, Split)> {
        let order = self.preorder();
        let mut below: Vec<Option<Split>> = vec![None; self.nodes.len()];
        let mut out = Vec::new();
        for &(node, parent) in order.iter().rev() {
            let mut side = Split::empty(self.leaf_count);
            if self.is_leaf(node) {
                side.insert(node);
            } else {
                for &(child, _) in &self.nodes[node].adj {
                    if Some(child) != parent {
                        if let Some(s) = below[child].take() {
                            side.union_with(&s);
                        }
                    }
                }
            }
            if let Some(p) = parent {
                if !self.is_leaf(node) && !self.is_leaf(p) {
                    out.push((Branch::new(node, p), side.clone()));
                }
            }
            below[node] = Some(side);
        }
        out
    }

    pub fn splits(&self) -> Vec<Split> {
        self.branch_splits().into_iter().map(|(_, s)| s).collect()
    }

    /// The two interchanges available at an internal branch, in a fixed order.
    pub fn nni_swaps(&self, branch: Branch) -> TopologyResult<[NniSwap; 2]> {
        if !self.is_internal_branch(branch) {
            return Err(TopologyError::NotInternal(branch));
        }
        let (u, v) = (branch.a, branch.b);
        let others_u = self.sorted_others(u, v);
        let others_v = self.sorted_others(v, u);
        Ok([
            NniSwap {
                node1: u,
                node2: v,
                swap1: others_u[1],
                swap2: others_v[0],
            },
            NniSwap {
                node1: u,
                node2: v,
                swap1: others_u[1],
                swap2: others_v[1],
            },
        ])
    }

    pub fn random_nni(&self, branch: Branch, rng: &mut fastrand::Rng) -> TopologyResult<NniSwap> {
        let swaps = self.nni_swaps(branch)?;
        Ok(swaps[rng.usize(..2)])
    }

    pub fn apply_swap(&mut self, swap: &NniSwap) -> TopologyResult<()> {
        let NniSwap {
            node1: u,
            node2: v,
            swap1: p,
            swap2: q,
        } = *swap;
        if !self.are_adjacent(u, v) {
            return Err(TopologyError::NotAdjacent(u, v));
        }
        if p == v || !self.are_adjacent(u, p) {
            return Err(TopologyError::NotAdjacent(u, p));
        }
        if q == u || !self.are_adjacent(v, q) {
            return Err(TopologyError::NotAdjacent(v, q));
        }
        let lp = self.length(u, p).unwrap_or(DEFAULT_BRANCH_LENGTH);
        let lq = self.length(v, q).unwrap_or(DEFAULT_BRANCH_LENGTH);
        self.replace_neighbor(u, p, q, lq);
        self.replace_neighbor(q, v, u, lq);
        self.replace_neighbor(v, q, p, lp);
        self.replace_neighbor(p, u, v, lp);
        Ok(())
    }

    /// Prunes a leaf and joins the two branches it hung between.
    /// Returns the joined branch.
    pub fn detach_leaf(&mut self, leaf: LeafId) -> TopologyResult<Branch> {
        if !self.is_attached(leaf) {
            return Err(TopologyError::LeafDetached(leaf));
        }
        let remaining = self.attached_count();
        if remaining <= 3 {
            return Err(TopologyError::TooFewLeaves {
                min: 4,
                got: remaining,
            });
        }
        let stub = self.nodes[leaf].adj[0].0;
        let others: Vec<(NodeId, f64)> = self.nodes[stub]
            .adj
            .iter()
            .copied()
            .filter(|&(n, _)| n != leaf)
            .collect();
        if others.len() != 2 {
            return Err(TopologyError::NotBifurcating);
        }
        let (x, lx) = others[0];
        let (y, ly) = others[1];
        self.disconnect(stub, x);
        self.disconnect(stub, y);
        self.connect(x, y, lx + ly);
        self.attached[leaf] = false;
        Ok(Branch::new(x, y))
    }

    /// Re-attaches a detached leaf in the middle of `branch`.
    pub fn attach_leaf(&mut self, leaf: LeafId, branch: Branch) -> TopologyResult<()> {
        if leaf >= self.leaf_count {
            return Err(TopologyError::LeafDetached(leaf));
        }
        if self.attached[leaf] {
            return Err(TopologyError::LeafAttached(leaf));
        }
        if !self.are_adjacent(branch.a, branch.b) {
            return Err(TopologyError::NotAdjacent(branch.a, branch.b));
        }
        let stub = self.nodes[leaf].adj[0].0;
        let len = self
            .length(branch.a, branch.b)
            .unwrap_or(DEFAULT_BRANCH_LENGTH);
        self.disconnect(branch.a, branch.b);
        self.connect(branch.a, stub, len / 2.0);
        self.connect(stub, branch.b, len / 2.0);
        self.attached[leaf] = true;
        Ok(())
    }

    /// Internal branches within `depth` branches of either end of `branch`.
    pub fn surrounding_internal_branches(&self, branch: Branch, depth: usize) -> Vec<Branch> {
        let mut out = Vec::new();
        self.collect_surrounding(branch.a, branch.b, depth, &mut out);
        self.collect_surrounding(branch.b, branch.a, depth, &mut out);
        out
    }

    fn collect_surrounding(&self, node: NodeId, dad: NodeId, depth: usize, out: &mut Vec<Branch>) {
        if depth == 0 {
            return;
        }
        for next in self.neighbors(node) {
            if next == dad {
                continue;
            }
            let b = Branch::new(node, next);
            if self.is_internal_branch(b) && !out.contains(&b) {
                out.push(b);
            }
            self.collect_surrounding(next, node, depth - 1, out);
        }
    }

    fn sorted_others(&self, node: NodeId, exclude: NodeId) -> Vec<NodeId> {
        let mut others: Vec<NodeId> = self.neighbors(node).filter(|&n| n != exclude).collect();
        others.sort_unstable();
        others
    }

    pub(crate) fn connect(&mut self, x: NodeId, y: NodeId, len: f64) {
        self.nodes[x].adj.push((y, len));
        self.nodes[y].adj.push((x, len));
    }

    pub(crate) fn mark_attached(&mut self, leaf: LeafId) {
        self.attached[leaf] = true;
    }

    fn disconnect(&mut self, x: NodeId, y: NodeId) {
        self.nodes[x].adj.retain(|&(n, _)| n != y);
        self.nodes[y].adj.retain(|&(n, _)| n != x);
    }

    fn replace_neighbor(&mut self, node: NodeId, old: NodeId, new: NodeId, len: f64) {
        if let Some(slot) = self.nodes[node].adj.iter_mut().find(|(n, _)| *n == old) {
            *slot = (new, len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_tree_has_n_minus_three_internal_branches() {
        let mut rng = fastrand::Rng::with_seed(7);
        for n in 4..20 {
            let t = Topology::random(n, &mut rng).unwrap();
            assert!(t.is_complete());
            assert_eq!(t.internal_branches().len(), n - 3);
            assert_eq!(t.branches().len(), 2 * n - 3);
        }
    }

    #[test]
    fn swap_then_inverse_restores_splits() {
        let mut rng = fastrand::Rng::with_seed(3);
        let mut t = Topology::random(9, &mut rng).unwrap();
        let before = t.topology_string();
        let branch = t.internal_branches()[0];
        let swap = t.nni_swaps(branch).unwrap()[1];
        t.apply_swap(&swap).unwrap();
        assert_ne!(t.topology_string(), before);
        t.apply_swap(&swap.inverse()).unwrap();
        assert_eq!(t.topology_string(), before);
    }

    #[test]
    fn detach_and_reattach_keeps_node_ids() {
        let mut rng = fastrand::Rng::with_seed(11);
        let mut t = Topology::random(8, &mut rng).unwrap();
        let nodes = t.node_count();
        let joined = t.detach_leaf(5).unwrap();
        assert!(!t.is_attached(5));
        assert_eq!(t.internal_branches().len(), 4);
        t.attach_leaf(5, joined).unwrap();
        assert!(t.is_complete());
        assert_eq!(t.node_count(), nodes);
        assert_eq!(t.internal_branches().len(), 5);
    }
}
