use crate::oracle::OracleError;
use crate::sync::SyncError;
use crate::topology::TopologyError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Tree Parsing Error: {0}")]
    Newick(String),

    #[error("Topology Error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Data Validation Error: {0}")]
    Validation(String),

    #[error("Scoring Oracle Error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Synchronization Error: {0}")]
    Sync(#[from] SyncError),

    #[error("Invariant Violation: {0}")]
    Invariant(String),
}

pub type ForgeResult<T> = Result<T, ForgeError>;
