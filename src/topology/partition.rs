use super::{Branch, Split, Topology};
use crate::alignment::Alignment;
use crate::error::{ForgeError, ForgeResult};
use std::ops::Range;
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    SinglePartition,
    MultiPartition,
}

/// A block of sites together with the taxa that carry data for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub name: String,
    pub sites: Range<usize>,
    pub taxa: Split,
}

impl Partition {
    /// A branch informs this partition only when each of the four subtrees
    /// around it holds at least one of the partition's taxa.
    pub fn spans_branch(&self, topo: &Topology, branch: Branch) -> bool {
        if !topo.is_internal_branch(branch) {
            return false;
        }
        [(branch.a, branch.b), (branch.b, branch.a)]
            .iter()
            .all(|&(node, other)| {
                topo.neighbors(node)
                    .filter(|&n| n != other)
                    .all(|n| topo.subtree_leaves(node, n).intersects(&self.taxa))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum PartitionScheme {
    #[default]
    Single,
    Multi(Vec<Partition>),
}

impl PartitionScheme {
    pub fn capability(&self) -> Capability {
        match self {
            PartitionScheme::Single => Capability::SinglePartition,
            PartitionScheme::Multi(_) => Capability::MultiPartition,
        }
    }

    pub fn partitions(&self) -> &[Partition] {
        match self {
            PartitionScheme::Single => &[],
            PartitionScheme::Multi(parts) => parts,
        }
    }

    /// Parses `name = start-end` entries (1-based, inclusive), one per line or
    /// separated by `;`. A leading `TYPE,` prefix on an entry is ignored.
    pub fn parse(text: &str, alignment: &Alignment) -> ForgeResult<Self> {
        let sites = alignment.site_count();
        let mut parts = Vec::new();
        for entry in text
            .split(['\n', ';'])
            .map(str::trim)
            .filter(|e| !e.is_empty() && !e.starts_with('#'))
        {
            let (lhs, rhs) = entry
                .split_once('=')
                .or_else(|| entry.split_once(':'))
                .ok_or_else(|| ForgeError::Config(format!("Bad partition entry '{}'", entry)))?;
            let name = lhs.rsplit(',').next().unwrap_or(lhs).trim().to_string();
            let (start, end) = rhs
                .trim()
                .split_once('-')
                .and_then(|(a, b)| Some((a.trim().parse::<usize>().ok()?, b.trim().parse::<usize>().ok()?)))
                .ok_or_else(|| ForgeError::Config(format!("Bad site range in '{}'", entry)))?;
            if start == 0 || start > end || end > sites {
                return Err(ForgeError::Config(format!(
                    "Partition '{}' range {}-{} outside 1-{}",
                    name, start, end, sites
                )));
            }
            let range = (start - 1)..end;
            let taxa = Split::from_leaves(
                alignment.taxon_count(),
                (0..alignment.taxon_count()).filter(|&t| alignment.has_data(t, range.clone())),
            );
            parts.push(Partition {
                name,
                sites: range,
                taxa,
            });
        }
        match parts.len() {
            0 => Err(ForgeError::Config("Partition file defines no partitions".into())),
            1 => Ok(PartitionScheme::Single),
            _ => Ok(PartitionScheme::Multi(parts)),
        }
    }
}
