use super::{Branch, LeafId, NodeId, Topology, TopologyError, TopologyResult};
use crate::consts::DEFAULT_BRANCH_LENGTH;
use fnv::FnvHashMap;

/// Plain Newick parse tree, before taxa are resolved to leaf ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewickNode {
    pub label: Option<String>,
    pub length: Option<f64>,
    pub children: Vec<NewickNode>,
}

impl NewickNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn leaf_labels(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_labels(&mut out);
        out
    }

    fn collect_labels<'a>(&'a self, out: &mut Vec<&'a str>) {
        if self.is_leaf() {
            if let Some(l) = &self.label {
                out.push(l);
            }
        }
        for c in &self.children {
            c.collect_labels(out);
        }
    }
}

pub fn parse_newick(text: &str) -> TopologyResult<NewickNode> {
    let bytes: Vec<char> = text.trim().chars().collect();
    let mut parser = Parser { chars: bytes, pos: 0 };
    let root = parser.subtree()?;
    parser.skip_ws();
    if parser.peek() != Some(';') {
        return Err(TopologyError::Newick(format!(
            "expected ';' at position {}",
            parser.pos
        )));
    }
    Ok(root)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn subtree(&mut self) -> TopologyResult<NewickNode> {
        self.skip_ws();
        let mut node = NewickNode::default();
        if self.peek() == Some('(') {
            self.pos += 1;
            loop {
                node.children.push(self.subtree()?);
                self.skip_ws();
                match self.peek() {
                    Some(',') => self.pos += 1,
                    Some(')') => {
                        self.pos += 1;
                        break;
                    }
                    other => {
                        return Err(TopologyError::Newick(format!(
                            "unexpected {:?} at position {}",
                            other, self.pos
                        )))
                    }
                }
            }
        }
        self.skip_ws();
        let label = self.label();
        if !label.is_empty() {
            node.label = Some(label);
        }
        self.skip_ws();
        if self.peek() == Some(':') {
            self.pos += 1;
            let raw = self.label();
            let len = raw
                .parse::<f64>()
                .map_err(|_| TopologyError::Newick(format!("bad branch length '{}'", raw)))?;
            node.length = Some(len);
        }
        if node.is_leaf() && node.label.is_none() {
            return Err(TopologyError::Newick(format!(
                "unlabelled leaf at position {}",
                self.pos
            )));
        }
        Ok(node)
    }

    fn label(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, ',' | '(' | ')' | ':' | ';') || c.is_whitespace() {
                break;
            }
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }
}

impl Topology {
    /// Parses a tree whose leaves are labelled by their numeric ids.
    pub fn from_newick(text: &str, leaf_count: usize) -> TopologyResult<Self> {
        let root = parse_newick(text)?;
        Self::from_parsed(&root, leaf_count, |label| {
            label
                .parse::<LeafId>()
                .ok()
                .filter(|&id| id < leaf_count)
                .ok_or_else(|| TopologyError::UnknownTaxon(label.to_string()))
        })
    }

    /// Parses a tree whose leaves are labelled by taxon name.
    pub fn from_newick_named(text: &str, names: &[String]) -> TopologyResult<Self> {
        let index: FnvHashMap<&str, LeafId> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        let root = parse_newick(text)?;
        Self::from_parsed(&root, names.len(), |label| {
            index
                .get(label)
                .copied()
                .ok_or_else(|| TopologyError::UnknownTaxon(label.to_string()))
        })
    }

    fn from_parsed<F>(root: &NewickNode, leaf_count: usize, resolve: F) -> TopologyResult<Self>
    where
        F: Fn(&str) -> TopologyResult<LeafId>,
    {
        if leaf_count < 3 {
            return Err(TopologyError::TooFewLeaves {
                min: 3,
                got: leaf_count,
            });
        }
        let mut builder = Builder {
            topo: Topology::with_leaves(leaf_count),
            next_internal: leaf_count,
            resolve: &resolve,
            seen: vec![false; leaf_count],
        };
        match root.children.len() {
            3 => {
                let center = builder.alloc()?;
                for child in &root.children {
                    let (id, len) = builder.build(child)?;
                    builder.topo.connect(center, id, len);
                }
            }
            2 => {
                let (x, lx) = builder.build(&root.children[0])?;
                let (y, ly) = builder.build(&root.children[1])?;
                builder.topo.connect(x, y, lx + ly);
            }
            _ => return Err(TopologyError::NotBifurcating),
        }
        let found = builder.seen.iter().filter(|&&s| s).count();
        if found != leaf_count {
            return Err(TopologyError::Incomplete {
                found,
                expected: leaf_count,
            });
        }
        Ok(builder.topo)
    }

    /// Canonical string without branch lengths; identical for identical topologies.
    pub fn topology_string(&self) -> String {
        self.render(&Render {
            lengths: false,
            names: None,
            supports: None,
        })
    }

    /// Canonical string with branch lengths.
    pub fn tree_string(&self) -> String {
        self.render(&Render {
            lengths: true,
            names: None,
            supports: None,
        })
    }

    /// Output form: taxon names, lengths and optional per-branch support labels.
    pub fn named_tree_string(
        &self,
        names: &[String],
        supports: Option<&FnvHashMap<Branch, f64>>,
    ) -> String {
        self.render(&Render {
            lengths: true,
            names: Some(names),
            supports,
        })
    }

    fn render(&self, opts: &Render<'_>) -> String {
        let Some(root) = self.root() else {
            return ";".to_string();
        };
        let Some(&(center, root_len)) = self.nodes[root].adj.first() else {
            return format!("{};", opts.leaf_label(root));
        };
        let mut parts = vec![(root, opts.leaf_with_length(root, root_len))];
        for &(child, len) in &self.nodes[center].adj {
            if child != root {
                parts.push(self.render_subtree(child, center, len, opts));
            }
        }
        parts.sort_by_key(|(min, _)| *min);
        let body: Vec<String> = parts.into_iter().map(|(_, s)| s).collect();
        format!("({});", body.join(","))
    }

    fn render_subtree(
        &self,
        node: NodeId,
        parent: NodeId,
        len: f64,
        opts: &Render<'_>,
    ) -> (LeafId, String) {
        if self.is_leaf(node) {
            return (node, opts.leaf_with_length(node, len));
        }
        let mut parts: Vec<(LeafId, String)> = self.nodes[node]
            .adj
            .iter()
            .filter(|&&(child, _)| child != parent)
            .map(|&(child, l)| self.render_subtree(child, node, l, opts))
            .collect();
        parts.sort_by_key(|(min, _)| *min);
        let min = parts.first().map(|(m, _)| *m).unwrap_or(usize::MAX);
        let body: Vec<String> = parts.into_iter().map(|(_, s)| s).collect();
        let mut out = format!("({})", body.join(","));
        if let Some(support) = opts
            .supports
            .and_then(|s| s.get(&Branch::new(node, parent)))
        {
            out.push_str(&format!("{:.0}", support));
        }
        if opts.lengths {
            out.push_str(&format!(":{:.6}", len));
        }
        (min, out)
    }
}

struct Render<'a> {
    lengths: bool,
    names: Option<&'a [String]>,
    supports: Option<&'a FnvHashMap<Branch, f64>>,
}

impl Render<'_> {
    fn leaf_label(&self, leaf: LeafId) -> String {
        match self.names.and_then(|n| n.get(leaf)) {
            Some(name) => name.clone(),
            None => leaf.to_string(),
        }
    }

    fn leaf_with_length(&self, leaf: LeafId, len: f64) -> String {
        if self.lengths {
            format!("{}:{:.6}", self.leaf_label(leaf), len)
        } else {
            self.leaf_label(leaf)
        }
    }
}

struct Builder<'a, F> {
    topo: Topology,
    next_internal: NodeId,
    resolve: &'a F,
    seen: Vec<bool>,
}

impl<F> Builder<'_, F>
where
    F: Fn(&str) -> TopologyResult<LeafId>,
{
    fn alloc(&mut self) -> TopologyResult<NodeId> {
        if self.next_internal >= self.topo.nodes.len() {
            return Err(TopologyError::NotBifurcating);
        }
        let id = self.next_internal;
        self.next_internal += 1;
        Ok(id)
    }

    /// Returns the node the subtree attaches through and the length above it.
    fn build(&mut self, node: &NewickNode) -> TopologyResult<(NodeId, f64)> {
        let len = node.length.unwrap_or(DEFAULT_BRANCH_LENGTH);
        match node.children.len() {
            0 => {
                let label = node.label.as_deref().unwrap_or_default();
                let leaf = (self.resolve)(label)?;
                if std::mem::replace(&mut self.seen[leaf], true) {
                    return Err(TopologyError::DuplicateTaxon(label.to_string()));
                }
                self.topo.mark_attached(leaf);
                Ok((leaf, len))
            }
            1 => {
                let (id, inner) = self.build(&node.children[0])?;
                Ok((id, inner + len))
            }
            2 => {
                let id = self.alloc()?;
                for child in &node.children {
                    let (c, l) = self.build(child)?;
                    self.topo.connect(id, c, l);
                }
                Ok((id, len))
            }
            _ => Err(TopologyError::NotBifurcating),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_of_one_tree_render_alike() {
        let a = Topology::from_newick("(0:0.1,(1:0.2,2:0.3)95:0.05,3:1e-3);", 4).unwrap();
        let b = Topology::from_newick("((2,1),3,0);", 4).unwrap();
        assert_eq!(a.topology_string(), "(0,(1,2),3);");
        assert_eq!(a.topology_string(), b.topology_string());
    }

    #[test]
    fn rooted_input_is_unrooted() {
        let t = Topology::from_newick("((0,1),(2,3));", 4).unwrap();
        assert_eq!(t.topology_string(), "(0,1,(2,3));");
    }

    #[test]
    fn malformed_trees_rejected() {
        assert!(matches!(
            Topology::from_newick("(0,1,(2,3)", 4),
            Err(TopologyError::Newick(_))
        ));
        assert!(matches!(
            Topology::from_newick("();", 4),
            Err(TopologyError::Newick(_))
        ));
        assert!(matches!(
            Topology::from_newick("(zz);", 4),
            Err(TopologyError::NotBifurcating)
        ));
        assert!(matches!(
            Topology::from_newick("(0,1,(2,3,4));", 5),
            Err(TopologyError::NotBifurcating)
        ));
        assert!(matches!(
            Topology::from_newick("(0,0,(1,2));", 4),
            Err(TopologyError::DuplicateTaxon(_))
        ));
        assert!(matches!(
            Topology::from_newick("(0,1,(2,9));", 4),
            Err(TopologyError::UnknownTaxon(_))
        ));
        assert!(matches!(
            Topology::from_newick("(0,1,(2,3));", 5),
            Err(TopologyError::Incomplete { found: 4, expected: 5 })
        ));
    }
}
