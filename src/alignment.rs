use crate::error::{ForgeError, ForgeResult};
use sha2::{Digest, Sha256};
use std::fs;
use std::ops::Range;
use std::path::Path;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

/// Checked in declaration order; the first alphabet that accepts every cell wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum DataType {
    Dna,
    Protein,
}

const AMINO_ACIDS: &[u8] = b"ARNDCQEGHILKMFPSTWYV";
const DNA_ALL: u32 = 0b1111;
const PROTEIN_ALL: u32 = (1 << 20) - 1;

impl DataType {
    pub fn wildcard(self) -> u32 {
        match self {
            DataType::Dna => DNA_ALL,
            DataType::Protein => PROTEIN_ALL,
        }
    }

    /// Fitch state set of one upper-case character, `None` outside the alphabet.
    pub fn encode(self, c: u8) -> Option<u32> {
        match self {
            DataType::Dna => Some(match c {
                b'A' => 1,
                b'C' => 2,
                b'G' => 4,
                b'T' | b'U' => 8,
                b'R' => 1 | 4,
                b'Y' => 2 | 8,
                b'S' => 2 | 4,
                b'W' => 1 | 8,
                b'K' => 4 | 8,
                b'M' => 1 | 2,
                b'B' => 2 | 4 | 8,
                b'D' => 1 | 4 | 8,
                b'H' => 1 | 2 | 8,
                b'V' => 1 | 2 | 4,
                b'N' | b'-' | b'?' | b'.' => DNA_ALL,
                _ => return None,
            }),
            DataType::Protein => {
                if let Some(i) = AMINO_ACIDS.iter().position(|&a| a == c) {
                    return Some(1 << i);
                }
                let bit = |a: u8| AMINO_ACIDS.iter().position(|&x| x == a).map(|i| 1u32 << i);
                match c {
                    b'B' => Some(bit(b'N')? | bit(b'D')?),
                    b'Z' => Some(bit(b'Q')? | bit(b'E')?),
                    b'J' => Some(bit(b'I')? | bit(b'L')?),
                    b'X' | b'-' | b'?' | b'.' | b'*' => Some(PROTEIN_ALL),
                    _ => None,
                }
            }
        }
    }
}

/// Aligned character data, one row per taxon.
#[derive(Debug, Clone)]
pub struct Alignment {
    names: Vec<String>,
    rows: Vec<Vec<u8>>,
    data_type: DataType,
}

impl Alignment {
    pub fn new(names: Vec<String>, rows: Vec<Vec<u8>>) -> ForgeResult<Self> {
        if names.len() != rows.len() {
            return Err(ForgeError::Validation(format!(
                "{} names but {} sequences",
                names.len(),
                rows.len()
            )));
        }
        if names.len() < 4 {
            return Err(ForgeError::Validation(format!(
                "At least 4 taxa are required, found {}",
                names.len()
            )));
        }
        let sites = rows[0].len();
        if sites == 0 {
            return Err(ForgeError::Validation("Alignment has no sites".into()));
        }
        for (name, row) in names.iter().zip(&rows) {
            if row.len() != sites {
                return Err(ForgeError::Validation(format!(
                    "Sequence '{}' has {} sites, expected {}",
                    name,
                    row.len(),
                    sites
                )));
            }
        }
        let mut sorted = names.clone();
        sorted.sort();
        if let Some(w) = sorted.windows(2).find(|w| w[0] == w[1]) {
            return Err(ForgeError::Validation(format!(
                "Duplicate taxon name '{}'",
                w[0]
            )));
        }
        let rows: Vec<Vec<u8>> = rows
            .into_iter()
            .map(|r| r.to_ascii_uppercase())
            .collect();
        let data_type = DataType::iter()
            .find(|dt| rows.iter().flatten().all(|&c| dt.encode(c).is_some()))
            .ok_or_else(|| {
                let (t, c) = rows
                    .iter()
                    .enumerate()
                    .find_map(|(t, row)| {
                        row.iter()
                            .find(|&&c| DataType::Protein.encode(c).is_none())
                            .map(|&c| (t, c))
                    })
                    .unwrap_or((0, b'?'));
                ForgeError::Validation(format!(
                    "Unrecognized character '{}' in sequence '{}'",
                    c as char, names[t]
                ))
            })?;
        Ok(Self {
            names,
            rows,
            data_type,
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> ForgeResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Reads FASTA (leading `>`) or relaxed sequential PHYLIP.
    pub fn parse(text: &str) -> ForgeResult<Self> {
        let trimmed = text.trim_start();
        if trimmed.starts_with('>') {
            Self::parse_fasta(trimmed)
        } else {
            Self::parse_phylip(trimmed)
        }
    }

    fn parse_fasta(text: &str) -> ForgeResult<Self> {
        let mut names = Vec::new();
        let mut rows: Vec<Vec<u8>> = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(header) = line.strip_prefix('>') {
                let name = header.split_whitespace().next().unwrap_or_default();
                names.push(name.to_string());
                rows.push(Vec::new());
            } else if let Some(row) = rows.last_mut() {
                row.extend(line.bytes().filter(|b| !b.is_ascii_whitespace()));
            }
        }
        Self::new(names, rows)
    }

    fn parse_phylip(text: &str) -> ForgeResult<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        let header = lines
            .next()
            .ok_or_else(|| ForgeError::Validation("Empty alignment".into()))?;
        let dims: Vec<usize> = header
            .split_whitespace()
            .take(2)
            .map(|t| t.parse::<usize>())
            .collect::<Result<_, _>>()
            .map_err(|_| ForgeError::Validation(format!("Bad PHYLIP header '{}'", header)))?;
        if dims.len() != 2 {
            return Err(ForgeError::Validation(format!(
                "Bad PHYLIP header '{}'",
                header
            )));
        }
        let (ntax, nsites) = (dims[0], dims[1]);
        let mut names = Vec::with_capacity(ntax);
        let mut rows: Vec<Vec<u8>> = Vec::with_capacity(ntax);
        for line in lines {
            let current_full = rows.last().map_or(true, |r| r.len() >= nsites);
            if current_full && names.len() < ntax {
                let mut parts = line.split_whitespace();
                let name = parts.next().unwrap_or_default();
                names.push(name.to_string());
                rows.push(parts.flat_map(|p| p.bytes()).collect());
            } else if let Some(row) = rows.last_mut() {
                row.extend(line.bytes().filter(|b| !b.is_ascii_whitespace()));
            }
        }
        if names.len() != ntax {
            return Err(ForgeError::Validation(format!(
                "PHYLIP header declares {} taxa, found {}",
                ntax,
                names.len()
            )));
        }
        Self::new(names, rows)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn taxon_count(&self) -> usize {
        self.names.len()
    }

    pub fn site_count(&self) -> usize {
        self.rows[0].len()
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Fitch state set of one cell; wildcards map to every state.
    pub fn state(&self, taxon: usize, site: usize) -> u32 {
        self.data_type
            .encode(self.rows[taxon][site])
            .unwrap_or(self.wildcard())
    }

    pub fn wildcard(&self) -> u32 {
        self.data_type.wildcard()
    }

    /// True when the taxon has at least one informative character in `sites`.
    pub fn has_data(&self, taxon: usize, sites: Range<usize>) -> bool {
        let all = self.wildcard();
        sites
            .filter(|&s| s < self.site_count())
            .any(|s| self.state(taxon, s) != all)
    }

    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, row) in self.names.iter().zip(&self.rows) {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(row);
            hasher.update([b'\n']);
        }
        hex::encode(hasher.finalize())
    }
}
